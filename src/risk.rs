// =============================================================================
// Risk engine — mandatory pre-trade gate, independent monitor, emergency stop
// =============================================================================
//
// Every position open passes through `can_open_position`; there is no other
// path to the exchange. The monitor runs on its own cadence and can force a
// trader to stop through the registered stop handler — callers preserve the
// Supervisor -> Worker -> Risk -> PositionManager order, so the handler only
// schedules the stop instead of taking supervisor locks inline.
//
// The rolling daily P&L window is 24 h of wall clock anchored on now.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RiskConfig, TraderConfig};
use crate::error::{ErrorKind, Result, RiskViolation, RiskViolationType};
use crate::position::{CloseReason, PositionManager};
use crate::telemetry::{TelemetryBus, TelemetryEvent};
use crate::types::TradeSide;

/// Rolling P&L window width (24 h wall clock).
const PNL_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// Handler invoked when a trader must be force-stopped. Must not block; the
/// supervisor installs one that schedules the stop on the runtime.
pub type StopHandler = Arc<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// Risk score
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskRecommendation {
    Allow,
    Warn,
    Block,
    EmergencyStop,
}

/// Composite risk score in [0, 1] with its component breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct RiskScore {
    pub budget_score: f64,
    pub leverage_score: f64,
    pub exposure_score: f64,
    pub pnl_score: f64,
    pub overall: f64,
    pub recommendation: RiskRecommendation,
}

impl RiskScore {
    fn from_components(budget: f64, leverage: f64, exposure: f64, pnl: f64) -> Self {
        let overall =
            (0.35 * budget + 0.30 * leverage + 0.20 * exposure + 0.15 * pnl).min(1.0);
        let recommendation = if overall >= 0.9 || pnl >= 1.0 {
            RiskRecommendation::EmergencyStop
        } else if overall >= 0.75 {
            RiskRecommendation::Block
        } else if overall >= 0.5 {
            RiskRecommendation::Warn
        } else {
            RiskRecommendation::Allow
        };
        Self {
            budget_score: budget,
            leverage_score: leverage,
            exposure_score: exposure,
            pnl_score: pnl,
            overall,
            recommendation,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct PnlEvent {
    at_ms: i64,
    pnl: f64,
}

struct Inner {
    /// Trader ids registered with the engine, with their configured leverage.
    registered: HashMap<String, u32>,
    /// Traders barred from opening new positions.
    emergency: HashSet<String>,
    global_emergency: bool,
    /// Per-trader realised P&L events inside the rolling window.
    pnl_window: HashMap<String, VecDeque<PnlEvent>>,
}

/// Serialisable engine snapshot for the REST surface.
#[derive(Debug, Clone, Serialize)]
pub struct RiskStateSnapshot {
    pub total_exposure: f64,
    pub exposure_by_trader: HashMap<String, f64>,
    pub rolling_daily_pnl: f64,
    pub emergency_stopped: Vec<String>,
    pub global_emergency: bool,
    pub score: RiskScore,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct RiskEngine {
    config: RiskConfig,
    positions: Arc<dyn PositionManager>,
    bus: Arc<TelemetryBus>,
    inner: Mutex<Inner>,
    stop_handler: Mutex<Option<StopHandler>>,
}

impl RiskEngine {
    pub fn new(
        config: RiskConfig,
        positions: Arc<dyn PositionManager>,
        bus: Arc<TelemetryBus>,
    ) -> Self {
        info!(
            max_total_budget = config.max_total_budget,
            max_exposure_per_trader = config.max_exposure_per_trader,
            max_daily_loss = config.max_daily_loss,
            monitoring_interval_secs = config.monitoring_interval_secs,
            "risk engine initialised"
        );
        Self {
            config,
            positions,
            bus,
            inner: Mutex::new(Inner {
                registered: HashMap::new(),
                emergency: HashSet::new(),
                global_emergency: false,
                pnl_window: HashMap::new(),
            }),
            stop_handler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Install the force-stop callback (normally the supervisor's).
    pub fn set_stop_handler(&self, handler: StopHandler) {
        *self.stop_handler.lock() = Some(handler);
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    pub fn register_trader(&self, config: &TraderConfig) {
        let mut inner = self.inner.lock();
        inner.registered.insert(config.id.clone(), config.leverage);
        debug!(trader_id = %config.id, "trader registered with risk engine");
    }

    pub fn deregister_trader(&self, trader_id: &str) {
        let mut inner = self.inner.lock();
        inner.registered.remove(trader_id);
        inner.emergency.remove(trader_id);
        inner.pnl_window.remove(trader_id);
        debug!(trader_id, "trader deregistered from risk engine");
    }

    pub fn registered_ids(&self) -> Vec<String> {
        self.inner.lock().registered.keys().cloned().collect()
    }

    pub fn is_emergency_stopped(&self, trader_id: &str) -> bool {
        let inner = self.inner.lock();
        inner.global_emergency || inner.emergency.contains(trader_id)
    }

    // -------------------------------------------------------------------------
    // Exposure bookkeeping
    // -------------------------------------------------------------------------

    fn total_exposure(&self) -> f64 {
        self.positions
            .open_positions()
            .iter()
            .map(|p| p.notional_value())
            .sum()
    }

    fn trader_exposure(&self, trader_id: &str) -> f64 {
        self.positions
            .positions_for_trader(trader_id)
            .iter()
            .map(|p| p.notional_value())
            .sum()
    }

    fn exposure_by_trader(&self) -> HashMap<String, f64> {
        let mut map: HashMap<String, f64> = HashMap::new();
        for position in self.positions.open_positions() {
            *map.entry(position.trader_id.clone()).or_default() += position.notional_value();
        }
        map
    }

    /// Ratio against a cap; a zero cap means "no headroom at all".
    fn ratio(value: f64, cap: f64) -> f64 {
        if cap <= 0.0 {
            if value > 0.0 {
                1.0
            } else {
                0.0
            }
        } else {
            value / cap
        }
    }

    // -------------------------------------------------------------------------
    // Rolling P&L
    // -------------------------------------------------------------------------

    /// Record the realised P&L of a completed trade.
    pub fn record_trade_result(&self, trader_id: &str, pnl: f64) {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock();
        let window = inner.pnl_window.entry(trader_id.to_string()).or_default();
        window.push_back(PnlEvent { at_ms: now, pnl });
        while window
            .front()
            .map_or(false, |e| now - e.at_ms > PNL_WINDOW_MS)
        {
            window.pop_front();
        }
    }

    /// Rolling 24 h P&L for one trader, or the whole fleet when `None`.
    pub fn rolling_daily_pnl(&self, trader_id: Option<&str>) -> f64 {
        let now = Utc::now().timestamp_millis();
        let inner = self.inner.lock();
        let sum_window = |window: &VecDeque<PnlEvent>| -> f64 {
            window
                .iter()
                .filter(|e| now - e.at_ms <= PNL_WINDOW_MS)
                .map(|e| e.pnl)
                .sum()
        };
        match trader_id {
            Some(id) => inner.pnl_window.get(id).map_or(0.0, sum_window),
            None => inner.pnl_window.values().map(sum_window).sum(),
        }
    }

    // -------------------------------------------------------------------------
    // Pre-trade gates
    // -------------------------------------------------------------------------

    fn reject(&self, trader_id: Option<&str>, violation: RiskViolation) -> ErrorKind {
        self.bus.publish(TelemetryEvent::RiskAlert {
            alert_id: Uuid::new_v4().to_string(),
            trader_id: trader_id.map(str::to_string),
            violation: violation.clone(),
            timestamp: Utc::now().timestamp_millis(),
        });
        warn!(trader_id = ?trader_id, violation = %violation, "risk gate denied");
        ErrorKind::risk_rejected(violation)
    }

    /// Gate for `Supervisor::create`: would this trader's worst case fit?
    pub fn validate_creation(&self, config: &TraderConfig) -> Result<()> {
        if self.config.max_total_budget == 0.0 {
            return Err(self.reject(
                Some(&config.id),
                RiskViolation::new(RiskViolationType::Budget, "total budget is zero"),
            ));
        }

        let projected = config.max_stake_amount * config.leverage.max(1) as f64;

        if projected > self.config.max_exposure_per_trader {
            return Err(self.reject(
                Some(&config.id),
                RiskViolation::new(
                    RiskViolationType::Exposure,
                    format!(
                        "projected exposure {projected:.2} exceeds per-trader cap {:.2}",
                        self.config.max_exposure_per_trader
                    ),
                )
                .with_detail("projected", projected)
                .with_detail("cap", self.config.max_exposure_per_trader),
            ));
        }

        let total = self.total_exposure();
        if total + projected > self.config.max_total_budget {
            return Err(self.reject(
                Some(&config.id),
                RiskViolation::new(
                    RiskViolationType::Budget,
                    format!(
                        "projected global exposure {:.2} exceeds budget {:.2}",
                        total + projected,
                        self.config.max_total_budget
                    ),
                )
                .with_detail("current", total)
                .with_detail("projected", projected)
                .with_detail("cap", self.config.max_total_budget),
            ));
        }

        if config.leverage as f64 > self.config.max_leverage_per_trader {
            return Err(self.reject(
                Some(&config.id),
                RiskViolation::new(
                    RiskViolationType::Leverage,
                    format!(
                        "leverage {} exceeds per-trader cap {:.0}",
                        config.leverage, self.config.max_leverage_per_trader
                    ),
                ),
            ));
        }

        Ok(())
    }

    /// Budget gate: `effective = |amount| × max(1, leverage)` against the
    /// global budget and, when scoped to a trader, its exposure cap.
    pub fn validate_budget(
        &self,
        amount: f64,
        trader_id: Option<&str>,
        leverage: f64,
    ) -> Result<()> {
        let effective = amount.abs() * leverage.max(1.0);

        let total = self.total_exposure();
        if total + effective > self.config.max_total_budget {
            return Err(self.reject(
                trader_id,
                RiskViolation::new(
                    RiskViolationType::Budget,
                    format!(
                        "exposure {:.2} + requested {effective:.2} exceeds total budget {:.2}",
                        total, self.config.max_total_budget
                    ),
                )
                .with_detail("current", total)
                .with_detail("requested", effective)
                .with_detail("cap", self.config.max_total_budget),
            ));
        }

        if let Some(id) = trader_id {
            let current = self.trader_exposure(id);
            if current + effective > self.config.max_exposure_per_trader {
                return Err(self.reject(
                    trader_id,
                    RiskViolation::new(
                        RiskViolationType::Exposure,
                        format!(
                            "trader exposure {current:.2} + requested {effective:.2} exceeds cap {:.2}",
                            self.config.max_exposure_per_trader
                        ),
                    )
                    .with_detail("current", current)
                    .with_detail("requested", effective)
                    .with_detail("cap", self.config.max_exposure_per_trader),
                ));
            }
        }

        Ok(())
    }

    /// Leverage gate: the requested leverage and every existing leverage in
    /// scope must fit their caps.
    pub fn validate_leverage(&self, leverage: f64, trader_id: Option<&str>) -> Result<()> {
        if leverage > self.config.max_leverage_per_trader {
            return Err(self.reject(
                trader_id,
                RiskViolation::new(
                    RiskViolationType::Leverage,
                    format!(
                        "requested leverage {leverage:.1} exceeds per-trader cap {:.1}",
                        self.config.max_leverage_per_trader
                    ),
                ),
            ));
        }

        let scope_max = match trader_id {
            Some(id) => self
                .positions
                .positions_for_trader(id)
                .iter()
                .map(|p| p.leverage as f64)
                .fold(0.0, f64::max),
            None => self
                .positions
                .open_positions()
                .iter()
                .map(|p| p.leverage as f64)
                .fold(0.0, f64::max),
        };
        if scope_max > self.config.max_leverage_per_trader {
            return Err(self.reject(
                trader_id,
                RiskViolation::new(
                    RiskViolationType::Leverage,
                    format!(
                        "existing leverage {scope_max:.1} exceeds per-trader cap {:.1}",
                        self.config.max_leverage_per_trader
                    ),
                ),
            ));
        }

        let global_max = self
            .positions
            .open_positions()
            .iter()
            .map(|p| p.leverage as f64)
            .fold(leverage, f64::max);
        if global_max > self.config.max_total_leverage {
            return Err(self.reject(
                trader_id,
                RiskViolation::new(
                    RiskViolationType::Leverage,
                    format!(
                        "global leverage {global_max:.1} exceeds cap {:.1}",
                        self.config.max_total_leverage
                    ),
                ),
            ));
        }

        Ok(())
    }

    /// Full pre-trade gate: emergency flag, budget, exposure, leverage, and
    /// the composite risk score.
    pub fn can_open_position(&self, trader_id: &str, notional: f64, leverage: f64) -> Result<()> {
        if self.is_emergency_stopped(trader_id) {
            return Err(self.reject(
                Some(trader_id),
                RiskViolation::new(
                    RiskViolationType::Emergency,
                    "trader is emergency-stopped",
                ),
            ));
        }

        self.validate_budget(notional, Some(trader_id), leverage)?;
        self.validate_leverage(leverage, Some(trader_id))?;

        let effective = notional.abs() * leverage.max(1.0);
        let score = self.score_for(Some(trader_id), effective, leverage);
        if matches!(
            score.recommendation,
            RiskRecommendation::Block | RiskRecommendation::EmergencyStop
        ) {
            return Err(self.reject(
                Some(trader_id),
                RiskViolation::new(
                    RiskViolationType::Score,
                    format!(
                        "risk score {:.2} recommends {:?}",
                        score.overall, score.recommendation
                    ),
                )
                .with_detail("overall", score.overall),
            ));
        }

        debug!(
            trader_id,
            notional,
            leverage,
            overall = score.overall,
            "position allowed by risk gate"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Scoring
    // -------------------------------------------------------------------------

    /// Composite score for a trader (or the fleet), including a hypothetical
    /// extra exposure and leverage.
    pub fn score_for(
        &self,
        trader_id: Option<&str>,
        extra_effective: f64,
        extra_leverage: f64,
    ) -> RiskScore {
        let total_exposure = self.total_exposure() + extra_effective;

        let trader_exposure = match trader_id {
            Some(id) => self.trader_exposure(id) + extra_effective,
            None => {
                let by_trader = self.exposure_by_trader();
                by_trader.values().fold(0.0_f64, |acc, &v| acc.max(v))
            }
        };

        let budget_score = f64::max(
            Self::ratio(trader_exposure, self.config.max_exposure_per_trader),
            Self::ratio(total_exposure, self.config.max_total_budget),
        );

        let scope_positions = match trader_id {
            Some(id) => self.positions.positions_for_trader(id),
            None => self.positions.open_positions(),
        };
        let max_trader_leverage = scope_positions
            .iter()
            .map(|p| p.leverage as f64)
            .fold(extra_leverage, f64::max);
        let max_global_leverage = self
            .positions
            .open_positions()
            .iter()
            .map(|p| p.leverage as f64)
            .fold(extra_leverage, f64::max);
        let leverage_score = f64::max(
            Self::ratio(max_trader_leverage, self.config.max_leverage_per_trader),
            Self::ratio(max_global_leverage, self.config.max_total_leverage),
        );

        let exposure_score = f64::max(
            budget_score,
            Self::ratio(total_exposure, self.config.max_total_exposure),
        );

        let pnl = self.rolling_daily_pnl(trader_id);
        let pnl_score = if self.config.max_daily_loss <= 0.0 {
            0.0
        } else {
            (-pnl).max(0.0) / self.config.max_daily_loss
        };

        RiskScore::from_components(budget_score, leverage_score, exposure_score, pnl_score)
    }

    /// Snapshot for the REST surface.
    pub fn get_state(&self) -> RiskStateSnapshot {
        let (emergency_stopped, global_emergency) = {
            let inner = self.inner.lock();
            (
                inner.emergency.iter().cloned().collect::<Vec<_>>(),
                inner.global_emergency,
            )
        };
        RiskStateSnapshot {
            total_exposure: self.total_exposure(),
            exposure_by_trader: self.exposure_by_trader(),
            rolling_daily_pnl: self.rolling_daily_pnl(None),
            emergency_stopped,
            global_emergency,
            score: self.score_for(None, 0.0, 0.0),
        }
    }

    // -------------------------------------------------------------------------
    // Emergency stops
    // -------------------------------------------------------------------------

    /// Force-stop one trader: invoke the stop handler, mark the trader so
    /// `can_open_position` denies with EMERGENCY, then close its positions.
    pub async fn emergency_stop_trader(&self, trader_id: &str, reason: &str) {
        warn!(trader_id, reason, "emergency stop triggered");

        let handler = self.stop_handler.lock().clone();
        if let Some(handler) = handler {
            handler(trader_id);
        }

        self.inner.lock().emergency.insert(trader_id.to_string());

        self.bus.publish(TelemetryEvent::RiskAlert {
            alert_id: Uuid::new_v4().to_string(),
            trader_id: Some(trader_id.to_string()),
            violation: RiskViolation::new(RiskViolationType::Emergency, reason),
            timestamp: Utc::now().timestamp_millis(),
        });

        if let Err(e) = self
            .positions
            .close_all_for_trader(trader_id, CloseReason::EmergencyStop)
            .await
        {
            warn!(trader_id, error = %e, "emergency close sweep failed");
        }
    }

    /// Fleet-wide emergency stop: closes every position and stops every
    /// registered trader.
    pub async fn global_emergency_stop(&self, reason: &str) {
        warn!(reason, "GLOBAL emergency stop triggered");
        let ids: Vec<String> = {
            let mut inner = self.inner.lock();
            inner.global_emergency = true;
            inner.registered.keys().cloned().collect()
        };
        for id in ids {
            self.emergency_stop_trader(&id, reason).await;
        }
    }

    /// Lift a trader's emergency mark. Returns whether it was set.
    pub fn clear_emergency(&self, trader_id: &str) -> bool {
        let cleared = self.inner.lock().emergency.remove(trader_id);
        if cleared {
            info!(trader_id, "emergency stop cleared");
        }
        cleared
    }

    pub fn clear_global_emergency(&self) {
        self.inner.lock().global_emergency = false;
        info!("global emergency stop cleared");
    }

    // -------------------------------------------------------------------------
    // Monitor
    // -------------------------------------------------------------------------

    /// One monitor pass over every registered trader.
    pub async fn run_monitor_cycle(&self) {
        let ids = self.registered_ids();

        for trader_id in ids {
            // (a) rolling daily loss versus cap.
            if self.config.max_daily_loss > 0.0 {
                let pnl = self.rolling_daily_pnl(Some(&trader_id));
                if -pnl >= self.config.max_daily_loss && !self.is_emergency_stopped(&trader_id) {
                    self.emergency_stop_trader(
                        &trader_id,
                        &format!(
                            "daily loss {:.2} breached cap {:.2}",
                            -pnl, self.config.max_daily_loss
                        ),
                    )
                    .await;
                    continue;
                }
            }

            // (b) per-position stop-loss checks.
            for position in self.positions.positions_for_trader(&trader_id) {
                let threshold = position.stop_loss_price.unwrap_or_else(|| {
                    let pct = self.config.stop_loss_percentage / 100.0;
                    match position.side {
                        TradeSide::Long => position.entry_price * (1.0 - pct),
                        TradeSide::Short => position.entry_price * (1.0 + pct),
                    }
                });
                let breached = match position.side {
                    TradeSide::Long => position.current_price <= threshold,
                    TradeSide::Short => position.current_price >= threshold,
                };
                if breached {
                    info!(
                        trader_id = %trader_id,
                        position_id = %position.position_id,
                        current = position.current_price,
                        threshold,
                        "stop-loss triggered by monitor"
                    );
                    match self
                        .positions
                        .close_position(&position.position_id, CloseReason::StopLoss)
                        .await
                    {
                        Ok(closed) => self.record_trade_result(&trader_id, closed.pnl),
                        Err(e) => {
                            warn!(position_id = %position.position_id, error = %e, "stop-loss close failed")
                        }
                    }
                }
            }

            // (c) score re-evaluation.
            let score = self.score_for(Some(&trader_id), 0.0, 0.0);
            if score.recommendation == RiskRecommendation::EmergencyStop
                && !self.is_emergency_stopped(&trader_id)
            {
                self.emergency_stop_trader(
                    &trader_id,
                    &format!("risk score {:.2} recommends emergency stop", score.overall),
                )
                .await;
            }
        }
    }

    /// Spawn the monitor loop on the runtime.
    pub fn spawn_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = engine.config.monitoring_interval();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "risk monitor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.run_monitor_cycle().await;
            }
        })
    }
}
