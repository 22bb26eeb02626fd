// =============================================================================
// Trading loop — the per-worker cooperative scheduler
// =============================================================================
//
// One iteration: fetch -> validate -> indicators -> pattern match -> signal
// -> execute -> sleep one candle interval. Transient fetch problems retry
// after a short delay with no state change; anything unexpected moves the
// worker to ERROR and exits the loop (the supervisor must stop and restart).
//
// Every await point observes the worker's shutdown signal, so cancellation
// takes effect at the next suspension point and a cancelled iteration never
// publishes partial state.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ServiceConfig, TraderConfig};
use crate::error::ErrorKind;
use crate::exchange::Candle;
use crate::indicators::IndicatorSet;
use crate::pattern::{MarketConditions, PatternOutcome, PatternService};
use crate::position::{CloseReason, ClosedPosition, OpenPositionRequest, PositionManager};
use crate::repository::TradeStore;
use crate::risk::RiskEngine;
use crate::strategy::Signal;
use crate::telemetry::{TelemetryBus, TelemetryEvent};
use crate::types::{SignalAction, TradeSide, TraderState};
use crate::worker::TraderWorker;

/// Delay before retrying after a failed or empty fetch.
const FETCH_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Backoff before the loop exits after an unexpected failure.
const ERROR_BACKOFF: Duration = Duration::from_secs(10);
/// Poll cadence while paused.
const PAUSE_POLL: Duration = Duration::from_secs(1);
/// Consecutive-candle price jump treated as suspicious (warning only).
const PRICE_JUMP_WARN_FRACTION: f64 = 0.5;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Loop tunables lifted out of the service config.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub confidence_threshold: f64,
    pub pattern_weight: f64,
    pub pattern_min_relevance: f64,
    pub pattern_max_matches: usize,
    pub candle_limit: usize,
}

impl From<&ServiceConfig> for LoopSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            confidence_threshold: config.signal_confidence_threshold,
            pattern_weight: config.pattern_weight,
            pattern_min_relevance: config.pattern_min_relevance,
            pattern_max_matches: config.pattern_max_matches,
            candle_limit: config.candle_fetch_limit,
        }
    }
}

/// Everything one loop task needs, cloned in at launch.
pub struct TradingLoopContext {
    pub worker: Arc<TraderWorker>,
    pub positions: Arc<dyn PositionManager>,
    pub risk: Arc<RiskEngine>,
    pub patterns: Option<Arc<PatternService>>,
    pub trades: Arc<dyn TradeStore>,
    pub bus: Arc<TelemetryBus>,
    pub settings: LoopSettings,
}

enum Iteration {
    /// Completed; sleep one candle interval.
    Completed,
    /// Transient problem; retry after the short delay.
    Retry,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the trading loop until the worker leaves RUNNING/PAUSED or the
/// shutdown signal fires.
pub async fn run_trading_loop(ctx: TradingLoopContext) {
    let trader_id = ctx.worker.id().to_string();
    let mut shutdown = ctx.worker.shutdown_signal();
    info!(trader_id = %trader_id, "trading loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        match ctx.worker.state() {
            TraderState::Running => {}
            // Starting covers the launch race; Paused idles until resumed.
            TraderState::Starting | TraderState::Paused => {
                if sleep_or_cancel(PAUSE_POLL, &mut shutdown).await {
                    break;
                }
                continue;
            }
            _ => break,
        }

        let interval = ctx.worker.config().candlestick_interval.duration();
        match run_iteration(&ctx).await {
            Ok(Iteration::Completed) => {
                if sleep_or_cancel(interval, &mut shutdown).await {
                    break;
                }
            }
            Ok(Iteration::Retry) => {
                if sleep_or_cancel(FETCH_RETRY_DELAY, &mut shutdown).await {
                    break;
                }
            }
            Err(e) => {
                ctx.worker.fail(format!("trading loop failure: {e}"));
                tokio::time::sleep(ERROR_BACKOFF).await;
                break;
            }
        }
    }

    info!(trader_id = %trader_id, "trading loop exited");
}

// ---------------------------------------------------------------------------
// One iteration
// ---------------------------------------------------------------------------

async fn run_iteration(ctx: &TradingLoopContext) -> Result<Iteration, ErrorKind> {
    let config = ctx.worker.config();
    let adapter = ctx.worker.adapter();

    // ── 1. Fetch ─────────────────────────────────────────────────────────
    let candles = match adapter
        .get_candles(
            &config.symbol,
            config.candlestick_interval,
            None,
            None,
            ctx.settings.candle_limit,
        )
        .await
    {
        Ok(candles) => candles,
        Err(e @ ErrorKind::AuthenticationFailed(_)) => return Err(e),
        Err(e) => {
            warn!(trader_id = %config.id, error = %e, "candle fetch failed — retrying");
            return Ok(Iteration::Retry);
        }
    };
    if candles.is_empty() {
        warn!(trader_id = %config.id, "candle fetch returned no data — retrying");
        return Ok(Iteration::Retry);
    }

    let last_close = candles.last().map(|c| c.close).unwrap_or(0.0);

    // Mark open positions to market and publish the tick.
    ctx.positions.update_price(&config.symbol, last_close);
    ctx.bus.publish(TelemetryEvent::MarketData {
        exchange: config.exchange,
        symbol: config.symbol.clone(),
        price: last_close,
        timestamp: Utc::now().timestamp_millis(),
    });

    // Positions past their maximum holding duration are closed regardless
    // of what the strategy thinks.
    close_expired_positions(ctx, &config).await;

    // ── 2. Process ───────────────────────────────────────────────────────
    let (kinds, min_candles) =
        ctx.worker
            .with_strategy(|s| (s.required_indicators(), s.min_candles()));
    if let Err(reason) = validate_candles(&candles, min_candles) {
        warn!(trader_id = %config.id, reason = %reason, "candle series rejected");
        return Ok(Iteration::Completed);
    }

    let indicators = ctx.worker.indicators.lock().compute(&kinds, &candles);

    // ── 3 + 4. Pattern match and signal generation ───────────────────────
    let mut signal = ctx
        .worker
        .with_strategy(|s| s.generate(&candles, &indicators));
    blend_pattern_confidence(ctx, &config, &indicators, last_close, &mut signal);
    ctx.worker.metrics.record_signal(&signal);

    debug!(
        trader_id = %config.id,
        action = %signal.action,
        confidence = signal.confidence,
        reason = %signal.reason,
        "signal generated"
    );

    // ── 5. Execute ───────────────────────────────────────────────────────
    execute_signal(ctx, &config, &indicators, signal, last_close).await?;

    Ok(Iteration::Completed)
}

// ---------------------------------------------------------------------------
// Candle validation
// ---------------------------------------------------------------------------

/// Chronology and completeness checks. A >50 % close-to-close jump is only
/// a warning.
fn validate_candles(candles: &[Candle], min_points: usize) -> Result<(), String> {
    if candles.len() < min_points {
        return Err(format!(
            "insufficient data points: {} < {min_points}",
            candles.len()
        ));
    }

    for pair in candles.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.open_time <= prev.open_time {
            return Err(format!(
                "candles out of order: open {} follows open {}",
                next.open_time, prev.open_time
            ));
        }
        if next.open_time < prev.close_time {
            return Err(format!(
                "candle open {} precedes previous close {}",
                next.open_time, prev.close_time
            ));
        }
        if prev.close > 0.0 {
            let jump = (next.close - prev.close).abs() / prev.close;
            if jump > PRICE_JUMP_WARN_FRACTION {
                warn!(
                    from = prev.close,
                    to = next.close,
                    "suspicious price jump between consecutive candles"
                );
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Pattern blending
// ---------------------------------------------------------------------------

/// Indicator snapshot handed to pattern matching and stored on positions.
fn condition_values(indicators: &IndicatorSet, price: f64) -> HashMap<String, f64> {
    let mut values = indicators.latest.clone();
    values.insert("PRICE".to_string(), price);
    values
}

/// `effective = (1 - w) · strategy + w · patternConfidence · relevance`.
pub(crate) fn blended_confidence(strategy: f64, pattern: f64, weight: f64) -> f64 {
    ((1.0 - weight) * strategy + weight * pattern).clamp(0.0, 1.0)
}

fn blend_pattern_confidence(
    ctx: &TradingLoopContext,
    config: &TraderConfig,
    indicators: &IndicatorSet,
    price: f64,
    signal: &mut Signal,
) {
    let Some(patterns) = &ctx.patterns else {
        return;
    };
    if !signal.action.is_actionable() {
        return;
    }

    let conditions = MarketConditions {
        exchange: config.exchange,
        symbol: config.symbol.clone(),
        timeframe: config.candlestick_interval,
        indicators: condition_values(indicators, price),
    };
    let matches = patterns.match_conditions(
        &conditions,
        ctx.settings.pattern_min_relevance,
        ctx.settings.pattern_max_matches,
    );
    let Some(top) = matches.first() else {
        return;
    };
    // Only a pattern recommending the same action reinforces the signal.
    if top.pattern.action != signal.action {
        return;
    }

    let before = signal.confidence;
    signal.confidence =
        blended_confidence(signal.confidence, top.confidence, ctx.settings.pattern_weight);
    signal.matched_pattern_id = Some(top.pattern.id.clone());
    signal.reason = format!(
        "{} | pattern {} (relevance {:.2})",
        signal.reason, top.pattern.id, top.relevance
    );

    debug!(
        trader_id = %config.id,
        pattern_id = %top.pattern.id,
        relevance = top.relevance,
        before,
        after = signal.confidence,
        "pattern confidence blended"
    );
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

async fn execute_signal(
    ctx: &TradingLoopContext,
    config: &TraderConfig,
    indicators: &IndicatorSet,
    signal: Signal,
    price: f64,
) -> Result<(), ErrorKind> {
    match signal.action {
        SignalAction::Close => {
            let open = ctx.positions.positions_for_trader(&config.id);
            if open.is_empty() {
                debug!(trader_id = %config.id, "CLOSE signal with no open position");
                return Ok(());
            }
            for position in open {
                match ctx
                    .positions
                    .close_position(&position.position_id, CloseReason::Signal)
                    .await
                {
                    Ok(closed) => {
                        ctx.worker.metrics.record_close_execution();
                        handle_closed_position(ctx, config, &closed);
                    }
                    Err(e) => {
                        warn!(position_id = %position.position_id, error = %e, "signal close failed")
                    }
                }
            }
            Ok(())
        }

        SignalAction::Buy | SignalAction::Sell => {
            if !signal.is_admitted(ctx.settings.confidence_threshold) {
                debug!(
                    trader_id = %config.id,
                    confidence = signal.confidence,
                    threshold = ctx.settings.confidence_threshold,
                    "signal below confidence threshold"
                );
                return Ok(());
            }
            if !ctx.positions.positions_for_trader(&config.id).is_empty() {
                debug!(trader_id = %config.id, "position already open — signal skipped");
                return Ok(());
            }
            if price <= 0.0 {
                return Ok(());
            }

            // Stake scales with the configured risk appetite.
            let stake = config.max_stake_amount * (config.max_risk_level as f64 / 10.0);
            let quantity = stake / price;
            if quantity <= 0.0 {
                return Ok(());
            }

            if let Err(e) = ctx
                .risk
                .can_open_position(&config.id, stake, config.leverage as f64)
            {
                info!(trader_id = %config.id, reason = %e, "signal dropped by risk gate");
                return Ok(());
            }

            let side = TradeSide::from_action(signal.action)
                .unwrap_or(TradeSide::Long);
            let stop_pct = ctx.risk.config().stop_loss_percentage / 100.0;
            let stop_loss_price = Some(price * (1.0 - side.direction() * stop_pct));
            let take_profit_price = (config.min_return_percent > 0.0).then(|| {
                price * (1.0 + side.direction() * config.min_return_percent / 100.0)
            });

            let request = OpenPositionRequest {
                trader_id: config.id.clone(),
                exchange: config.exchange,
                symbol: config.symbol.clone(),
                side,
                quantity,
                price: Some(price),
                leverage: config.leverage,
                stop_loss_price,
                take_profit_price,
                entry_indicators: condition_values(indicators, price),
                matched_pattern_id: signal.matched_pattern_id.clone(),
            };

            match ctx.positions.open_position(request).await {
                Ok(position) => {
                    ctx.worker.metrics.record_execution();
                    info!(
                        trader_id = %config.id,
                        position_id = %position.position_id,
                        side = %position.side,
                        quantity = position.quantity,
                        "signal executed"
                    );
                    Ok(())
                }
                Err(e @ ErrorKind::AuthenticationFailed(_)) => Err(e),
                Err(e @ ErrorKind::Internal(_)) => Err(e),
                Err(e) => {
                    warn!(trader_id = %config.id, error = %e, "order placement failed — will retry on a future signal");
                    Ok(())
                }
            }
        }

        SignalAction::Hold => Ok(()),
    }
}

/// Close positions held longer than the configured maximum duration.
async fn close_expired_positions(ctx: &TradingLoopContext, config: &TraderConfig) {
    let max_ms = config.max_trading_duration().as_millis() as i64;
    let now = Utc::now().timestamp_millis();

    for position in ctx.positions.positions_for_trader(&config.id) {
        if now - position.opened_at > max_ms {
            info!(
                trader_id = %config.id,
                position_id = %position.position_id,
                held_ms = now - position.opened_at,
                "position exceeded max trading duration"
            );
            match ctx
                .positions
                .close_position(&position.position_id, CloseReason::MaxDuration)
                .await
            {
                Ok(closed) => handle_closed_position(ctx, config, &closed),
                Err(e) => {
                    warn!(position_id = %position.position_id, error = %e, "duration close failed")
                }
            }
        }
    }
}

/// Shared post-close bookkeeping: metrics, risk window, pattern feedback and
/// pattern learning.
pub(crate) fn handle_closed_position(
    ctx: &TradingLoopContext,
    config: &TraderConfig,
    closed: &ClosedPosition,
) {
    ctx.worker.metrics.record_trade(closed.pnl);
    ctx.risk.record_trade_result(&config.id, closed.pnl);

    let Some(patterns) = &ctx.patterns else {
        return;
    };

    // Feedback for the pattern that contributed to the entry.
    if let Some(pattern_id) = &closed.position.matched_pattern_id {
        let outcome = PatternOutcome {
            success: closed.pnl > 0.0,
            return_amount: closed.pnl,
        };
        if let Err(e) = patterns.update_performance(pattern_id, outcome) {
            warn!(pattern_id = %pattern_id, error = %e, "pattern feedback failed");
        }
    }

    // Winning closes seed new patterns.
    match ctx.trades.find_by_id(&closed.position.trade_id) {
        Ok(Some(record)) => {
            if let Err(e) =
                patterns.learn_from_trade(&record, config.exchange, config.candlestick_interval)
            {
                warn!(trade_id = %record.id, error = %e, "pattern learning failed");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(trade_id = %closed.position.trade_id, error = %e, "trade lookup failed"),
    }
}

// ---------------------------------------------------------------------------
// Cancellation-aware sleep
// ---------------------------------------------------------------------------

/// Sleep for `duration`, returning `true` when the shutdown signal fired.
async fn sleep_or_cancel(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
