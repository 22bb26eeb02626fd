// =============================================================================
// Trader worker — one autonomous trading agent bound to a single config
// =============================================================================
//
// The worker owns its state machine, metrics, strategy instance, indicator
// cache, and adapter handle. State reads go through an RwLock read; writes
// are serialised by a dedicated transition mutex so no two transitions ever
// interleave. Other components only see the worker through these accessors.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::TraderConfig;
use crate::error::{ErrorKind, Result};
use crate::exchange::ExchangeAdapter;
use crate::indicators::IndicatorEngine;
use crate::metrics::TraderMetrics;
use crate::strategy::{build_strategy, Strategy};
use crate::telemetry::{StatusReason, TelemetryBus, TelemetryEvent};
use crate::types::TraderState;

/// Missed-signal factor: a running worker is unhealthy when no signal has
/// been produced for more than this many candle intervals.
const STALE_SIGNAL_INTERVALS: u32 = 3;

/// Health report for one worker.
#[derive(Debug, Clone, Serialize)]
pub struct TraderHealth {
    pub trader_id: String,
    pub state: TraderState,
    pub adapter_connected: bool,
    pub last_signal_time: Option<i64>,
    pub error_count: u64,
    pub issues: Vec<String>,
    pub healthy: bool,
}

pub struct TraderWorker {
    id: String,
    config: RwLock<TraderConfig>,
    state: RwLock<TraderState>,
    /// Serialises state-machine writes; never held across await points.
    transitions: Mutex<()>,
    pub metrics: TraderMetrics,
    strategy: RwLock<Box<dyn Strategy>>,
    pub indicators: Mutex<IndicatorEngine>,
    adapter: RwLock<Arc<dyn ExchangeAdapter>>,
    bus: Arc<TelemetryBus>,
    shutdown_tx: Mutex<watch::Sender<bool>>,
    error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TraderWorker {
    pub fn new(
        config: TraderConfig,
        adapter: Arc<dyn ExchangeAdapter>,
        bus: Arc<TelemetryBus>,
    ) -> Result<Self> {
        let strategy = build_strategy(config.strategy);
        strategy.validate_config(&config)?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            id: config.id.clone(),
            config: RwLock::new(config),
            state: RwLock::new(TraderState::Idle),
            transitions: Mutex::new(()),
            metrics: TraderMetrics::new(),
            strategy: RwLock::new(strategy),
            indicators: Mutex::new(IndicatorEngine::new()),
            adapter: RwLock::new(adapter),
            bus,
            shutdown_tx: Mutex::new(shutdown_tx),
            error_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
            loop_handle: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> TraderConfig {
        self.config.read().clone()
    }

    pub fn state(&self) -> TraderState {
        *self.state.read()
    }

    pub fn adapter(&self) -> Arc<dyn ExchangeAdapter> {
        self.adapter.read().clone()
    }

    /// Run `f` with the current strategy instance.
    pub fn with_strategy<T>(&self, f: impl FnOnce(&dyn Strategy) -> T) -> T {
        f(self.strategy.read().as_ref())
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    // -------------------------------------------------------------------------
    // State machine
    // -------------------------------------------------------------------------

    /// Apply one transition. `BadState` when the jump is illegal; the state
    /// is left untouched in that case. Publishes the change.
    pub fn transition(&self, to: TraderState) -> Result<TraderState> {
        let _guard = self.transitions.lock();
        let current = *self.state.read();

        if current == to {
            return Ok(current);
        }
        if !current.can_transition_to(to) {
            return Err(ErrorKind::BadState(format!(
                "trader {} cannot transition {current} -> {to}",
                self.id
            )));
        }

        *self.state.write() = to;
        info!(trader_id = %self.id, from = %current, to = %to, "trader state transition");
        self.publish_status(StatusReason::StateChange);
        Ok(to)
    }

    /// Record a failure and move to ERROR (legal from every state).
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(reason.clone());
        warn!(trader_id = %self.id, reason = %reason, "worker entered ERROR state");
        let _ = self.transition(TraderState::Error);
    }

    pub fn publish_status(&self, reason: StatusReason) {
        let config = self.config.read();
        self.bus.publish(TelemetryEvent::TraderStatus {
            trader_id: self.id.clone(),
            name: config.name.clone(),
            state: *self.state.read(),
            reason,
            timestamp: Utc::now().timestamp_millis(),
        });
    }

    // -------------------------------------------------------------------------
    // Configuration swap
    // -------------------------------------------------------------------------

    /// Atomically replace the config. Rebuilds the strategy, clears the
    /// indicator cache and swaps the adapter handle; the caller guarantees
    /// the worker is not running.
    pub fn apply_config(
        &self,
        config: TraderConfig,
        adapter: Arc<dyn ExchangeAdapter>,
    ) -> Result<()> {
        let strategy = build_strategy(config.strategy);
        strategy.validate_config(&config)?;

        *self.strategy.write() = strategy;
        self.indicators.lock().reset();
        *self.adapter.write() = adapter;
        *self.config.write() = config;
        info!(trader_id = %self.id, "worker configuration replaced");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Cancellation plumbing
    // -------------------------------------------------------------------------

    /// Receiver observed by the trading loop at every suspension point.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.lock().subscribe()
    }

    /// Request cooperative cancellation of the trading loop.
    pub fn request_stop(&self) {
        let _ = self.shutdown_tx.lock().send(true);
    }

    /// Fresh cancellation channel for a new loop launch.
    pub fn reset_shutdown(&self) {
        let (tx, _) = watch::channel(false);
        *self.shutdown_tx.lock() = tx;
    }

    pub fn set_loop_handle(&self, handle: tokio::task::JoinHandle<()>) {
        *self.loop_handle.lock() = Some(handle);
    }

    pub fn take_loop_handle(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.loop_handle.lock().take()
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    /// Health verdict: unhealthy iff in ERROR, the adapter is disconnected,
    /// or a running worker has not signalled for 3 candle intervals.
    pub fn health(&self) -> TraderHealth {
        let state = self.state();
        let config = self.config.read();
        let adapter_connected = self.adapter.read().is_connected();
        let last_signal_time = self.metrics.last_signal_time();

        let mut issues = Vec::new();
        if state == TraderState::Error {
            let detail = self
                .last_error
                .lock()
                .clone()
                .unwrap_or_else(|| "unknown error".into());
            issues.push(format!("worker is in ERROR state: {detail}"));
        }
        if !adapter_connected {
            issues.push("exchange adapter disconnected".to_string());
        }
        if state == TraderState::Running {
            let stale_after_ms = config.candlestick_interval.duration().as_millis() as i64
                * STALE_SIGNAL_INTERVALS as i64;
            let now = Utc::now().timestamp_millis();
            match last_signal_time {
                Some(at) if now - at > stale_after_ms => {
                    issues.push(format!(
                        "no signal for {} s (interval {})",
                        (now - at) / 1000,
                        config.candlestick_interval
                    ));
                }
                _ => {}
            }
        }

        TraderHealth {
            trader_id: self.id.clone(),
            state,
            adapter_connected,
            last_signal_time,
            error_count: self.error_count(),
            healthy: issues.is_empty(),
            issues,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockAdapter;
    use crate::types::{CandleInterval, Exchange, StrategyKind};

    fn config(strategy: StrategyKind) -> TraderConfig {
        TraderConfig::validated(
            "w1",
            "W1",
            Exchange::Binance,
            "BTCUSDT",
            1000.0,
            5,
            3600,
            0.0,
            strategy,
            CandleInterval::OneMinute,
            1,
        )
        .unwrap()
    }

    fn worker() -> TraderWorker {
        TraderWorker::new(
            config(StrategyKind::TrendFollowing),
            Arc::new(MockAdapter::new(Exchange::Binance)),
            Arc::new(TelemetryBus::new()),
        )
        .unwrap()
    }

    #[test]
    fn starts_idle_with_matching_strategy() {
        let w = worker();
        assert_eq!(w.state(), TraderState::Idle);
        assert_eq!(
            w.with_strategy(|s| s.kind()),
            StrategyKind::TrendFollowing
        );
    }

    #[test]
    fn full_lifecycle_transitions() {
        let w = worker();
        w.transition(TraderState::Starting).unwrap();
        w.transition(TraderState::Running).unwrap();
        w.transition(TraderState::Paused).unwrap();
        w.transition(TraderState::Running).unwrap();
        w.transition(TraderState::Stopping).unwrap();
        w.transition(TraderState::Stopped).unwrap();
        // Restart is allowed from Stopped.
        w.transition(TraderState::Starting).unwrap();
    }

    #[test]
    fn illegal_transition_is_bad_state_and_keeps_state() {
        let w = worker();
        let err = w.transition(TraderState::Running).unwrap_err();
        assert_eq!(err.code(), "BAD_STATE");
        assert_eq!(w.state(), TraderState::Idle);
    }

    #[test]
    fn same_state_transition_is_noop() {
        let w = worker();
        assert_eq!(w.transition(TraderState::Idle).unwrap(), TraderState::Idle);
    }

    #[test]
    fn fail_enters_error_and_counts() {
        let w = worker();
        w.transition(TraderState::Starting).unwrap();
        w.transition(TraderState::Running).unwrap();
        w.fail("adapter auth rejected");
        assert_eq!(w.state(), TraderState::Error);
        assert_eq!(w.error_count(), 1);
        assert_eq!(w.last_error().unwrap(), "adapter auth rejected");

        // ERROR only leaves through the stop path.
        assert!(w.transition(TraderState::Running).is_err());
        w.transition(TraderState::Stopped).unwrap();
    }

    #[test]
    fn health_flags_error_and_disconnect() {
        let w = worker();
        let adapter = Arc::new(MockAdapter::new(Exchange::Binance));
        adapter.set_connected(false);
        w.apply_config(config(StrategyKind::TrendFollowing), adapter)
            .unwrap();

        let health = w.health();
        assert!(!health.healthy);
        assert!(health
            .issues
            .iter()
            .any(|i| i.contains("adapter disconnected")));

        w.fail("boom");
        let health = w.health();
        assert!(health.issues.iter().any(|i| i.contains("ERROR state")));
        assert_eq!(health.error_count, 1);
    }

    #[test]
    fn healthy_idle_worker() {
        let w = worker();
        let health = w.health();
        assert!(health.healthy);
        assert!(health.issues.is_empty());
        assert_eq!(health.state, TraderState::Idle);
    }

    #[test]
    fn apply_config_rebuilds_strategy() {
        let w = worker();
        let mut new_config = config(StrategyKind::Breakout);
        new_config.symbol = "ETHUSDT".into();
        w.apply_config(new_config, Arc::new(MockAdapter::new(Exchange::Binance)))
            .unwrap();
        assert_eq!(w.with_strategy(|s| s.kind()), StrategyKind::Breakout);
        assert_eq!(w.config().symbol, "ETHUSDT");
    }

    #[test]
    fn shutdown_signal_observes_request() {
        let w = worker();
        let rx = w.shutdown_signal();
        assert!(!*rx.borrow());
        w.request_stop();
        assert!(*w.shutdown_signal().borrow());

        w.reset_shutdown();
        assert!(!*w.shutdown_signal().borrow());
    }
}
