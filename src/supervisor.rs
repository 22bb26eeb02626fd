// =============================================================================
// Trader supervisor — fleet lifecycle, recovery and health
// =============================================================================
//
// The supervisor exclusively owns the worker set. Lifecycle operations
// (create / start / stop / update / delete) are serialised by one lifecycle
// mutex; the fleet map itself is only locked for map access and never across
// an adapter call, so a slow exchange can never wedge the whole fleet.
//
// The count cap is enforced against the repository count, not the in-memory
// map, so a cold start observes the true fleet size.
// =============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{ServiceConfig, TraderConfig};
use crate::error::{ErrorKind, Result};
use crate::exchange::AdapterProvider;
use crate::metrics::MetricsSnapshot;
use crate::pattern::PatternService;
use crate::position::{CloseReason, PositionManager};
use crate::repository::{TradeStore, TraderStore};
use crate::risk::RiskEngine;
use crate::telemetry::{StatusReason, TelemetryBus};
use crate::trading_loop::{run_trading_loop, LoopSettings, TradingLoopContext};
use crate::types::{CandleInterval, Exchange, PersistedStatus, StrategyKind, TraderState};
use crate::worker::{TraderHealth, TraderWorker};

/// How long a stop waits for the loop task before aborting it.
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Listing row for the REST surface.
#[derive(Debug, Clone, Serialize)]
pub struct TraderSummary {
    pub id: String,
    pub name: String,
    pub exchange: Exchange,
    pub symbol: String,
    pub strategy: StrategyKind,
    pub candlestick_interval: CandleInterval,
    pub state: TraderState,
    pub metrics: MetricsSnapshot,
}

pub struct TraderSupervisor {
    /// Worker set; locked briefly, never across adapter calls.
    fleet: RwLock<HashMap<String, Arc<TraderWorker>>>,
    /// Serialises lifecycle operations end to end.
    lifecycle: tokio::sync::Mutex<()>,
    max_traders: usize,
    loop_settings: LoopSettings,
    traders: Arc<dyn TraderStore>,
    trades: Arc<dyn TradeStore>,
    adapters: Arc<dyn AdapterProvider>,
    risk: Arc<RiskEngine>,
    positions: Arc<dyn PositionManager>,
    patterns: Option<Arc<PatternService>>,
    bus: Arc<TelemetryBus>,
}

impl TraderSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ServiceConfig,
        traders: Arc<dyn TraderStore>,
        trades: Arc<dyn TradeStore>,
        adapters: Arc<dyn AdapterProvider>,
        risk: Arc<RiskEngine>,
        positions: Arc<dyn PositionManager>,
        patterns: Option<Arc<PatternService>>,
        bus: Arc<TelemetryBus>,
    ) -> Self {
        Self {
            fleet: RwLock::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            max_traders: config.max_traders,
            loop_settings: LoopSettings::from(config),
            traders,
            trades,
            adapters,
            risk,
            positions,
            patterns,
            bus,
        }
    }

    /// Install the risk engine's force-stop handler. Uses a weak reference,
    /// and schedules the stop on the runtime so the monitor never re-enters
    /// supervisor locks inline.
    pub fn install_stop_handler(self: &Arc<Self>) {
        let weak: Weak<TraderSupervisor> = Arc::downgrade(self);
        self.risk.set_stop_handler(Arc::new(move |trader_id: &str| {
            let Some(supervisor) = weak.upgrade() else {
                return;
            };
            let trader_id = trader_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = supervisor.stop(&trader_id).await {
                    error!(trader_id = %trader_id, error = %e, "risk-forced stop failed");
                }
            });
        }));
    }

    fn worker(&self, id: &str) -> Result<Arc<TraderWorker>> {
        self.fleet
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ErrorKind::NotFound(format!("trader {id}")))
    }

    pub fn count(&self) -> usize {
        self.fleet.read().len()
    }

    // -------------------------------------------------------------------------
    // create
    // -------------------------------------------------------------------------

    /// Create a new worker in IDLE. The cap is checked against the
    /// repository (authoritative) and the in-memory set.
    pub async fn create(&self, config: TraderConfig) -> Result<String> {
        let _guard = self.lifecycle.lock().await;

        if self.fleet.read().len() >= self.max_traders
            || !self.traders.can_create_more(self.max_traders)?
        {
            return Err(ErrorKind::LimitExceeded(format!(
                "maximum number of traders ({}) reached",
                self.max_traders
            )));
        }

        self.risk.validate_creation(&config)?;

        let adapter = self.adapters.adapter(config.exchange)?;
        let id = self.traders.create(&config, config.max_stake_amount)?;

        let worker = Arc::new(TraderWorker::new(config.clone(), adapter, self.bus.clone())?);
        self.risk.register_trader(&config);
        self.fleet.write().insert(id.clone(), worker.clone());

        worker.publish_status(StatusReason::Created);
        info!(trader_id = %id, name = %config.name, "trader created");
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // start / stop
    // -------------------------------------------------------------------------

    pub async fn start(&self, id: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.start_inner(id)
    }

    fn start_inner(&self, id: &str) -> Result<()> {
        let worker = self.worker(id)?;

        let state = worker.state();
        if !matches!(state, TraderState::Idle | TraderState::Stopped) {
            return Err(ErrorKind::BadState(format!(
                "trader {id} cannot start from {state}"
            )));
        }

        worker.transition(TraderState::Starting)?;
        self.traders.update_status(id, PersistedStatus::Active)?;

        worker.reset_shutdown();
        worker.metrics.mark_started();

        let ctx = TradingLoopContext {
            worker: worker.clone(),
            positions: self.positions.clone(),
            risk: self.risk.clone(),
            patterns: self.patterns.clone(),
            trades: self.trades.clone(),
            bus: self.bus.clone(),
            settings: self.loop_settings.clone(),
        };
        let handle = tokio::spawn(run_trading_loop(ctx));
        worker.set_loop_handle(handle);

        worker.transition(TraderState::Running)?;
        info!(trader_id = %id, "trader started");
        Ok(())
    }

    /// Stop a worker: cooperative loop cancellation, position close, final
    /// STOPPED transition. Idempotent when already stopped.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.stop_inner(id).await
    }

    async fn stop_inner(&self, id: &str) -> Result<()> {
        let worker = self.worker(id)?;

        match worker.state() {
            TraderState::Stopped | TraderState::Idle | TraderState::Stopping => return Ok(()),
            _ => {}
        }

        worker.transition(TraderState::Stopping)?;
        worker.request_stop();

        if let Some(handle) = worker.take_loop_handle() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(LOOP_STOP_TIMEOUT, handle).await.is_err() {
                warn!(trader_id = %id, "trading loop ignored cancellation — aborting task");
                abort.abort();
            }
        }

        match self
            .positions
            .close_all_for_trader(id, CloseReason::TraderStopped)
            .await
        {
            Ok(closed) => {
                for position in &closed {
                    worker.metrics.record_trade(position.pnl);
                    self.risk.record_trade_result(id, position.pnl);
                }
            }
            Err(e) => warn!(trader_id = %id, error = %e, "position close during stop failed"),
        }

        worker.metrics.mark_stopped();
        worker.transition(TraderState::Stopped)?;
        self.traders.update_status(id, PersistedStatus::Stopped)?;
        info!(trader_id = %id, "trader stopped");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // pause / resume
    // -------------------------------------------------------------------------

    pub async fn pause(&self, id: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let worker = self.worker(id)?;
        worker.transition(TraderState::Paused)?;
        self.traders.update_status(id, PersistedStatus::Paused)?;
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let worker = self.worker(id)?;
        if worker.state() != TraderState::Paused {
            return Err(ErrorKind::BadState(format!(
                "trader {id} is not paused"
            )));
        }
        worker.transition(TraderState::Running)?;
        self.traders.update_status(id, PersistedStatus::Active)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // update
    // -------------------------------------------------------------------------

    /// Replace a worker's configuration. A running worker is stopped,
    /// updated and restarted; otherwise the swap is atomic in place.
    pub async fn update(&self, id: &str, new_config: TraderConfig) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        if new_config.id != id {
            return Err(ErrorKind::InvariantViolation(format!(
                "config id {} does not match trader {id}",
                new_config.id
            )));
        }
        let worker = self.worker(id)?;

        let was_active = worker.state().is_active();
        if was_active {
            self.stop_inner(id).await?;
        }

        let adapter = self.adapters.adapter(new_config.exchange)?;
        worker.apply_config(new_config.clone(), adapter)?;
        self.traders.update_configuration(id, &new_config)?;
        self.risk.register_trader(&new_config);
        worker.publish_status(StatusReason::ConfigUpdated);

        if was_active {
            self.start_inner(id)?;
        }
        info!(trader_id = %id, "trader configuration updated");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // delete
    // -------------------------------------------------------------------------

    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let worker = self.worker(id)?;
        if worker.state().is_active() || worker.state() == TraderState::Error {
            self.stop_inner(id).await?;
        }

        worker.publish_status(StatusReason::Deleted);
        self.fleet.write().remove(id);
        self.traders.delete(id)?;
        self.risk.deregister_trader(id);
        info!(trader_id = %id, "trader deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // recover
    // -------------------------------------------------------------------------

    /// Rebuild the fleet from persisted rows. Workers come back in IDLE and
    /// are never auto-started; per-row failures are logged and skipped.
    pub async fn recover(&self) -> Result<usize> {
        let _guard = self.lifecycle.lock().await;

        let rows = self.traders.find_all()?;
        let mut recovered = 0usize;

        for row in rows {
            if self.fleet.read().contains_key(&row.id) {
                continue;
            }

            let adapter = match self.adapters.adapter(row.config.exchange) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(trader_id = %row.id, error = %e, "recovery skipped: no adapter");
                    continue;
                }
            };
            let worker = match TraderWorker::new(row.config.clone(), adapter, self.bus.clone()) {
                Ok(worker) => Arc::new(worker),
                Err(e) => {
                    warn!(trader_id = %row.id, error = %e, "recovery skipped: invalid config");
                    continue;
                }
            };

            self.risk.register_trader(&row.config);
            self.fleet.write().insert(row.id.clone(), worker.clone());
            if let Err(e) = self.traders.update_status(&row.id, PersistedStatus::Stopped) {
                warn!(trader_id = %row.id, error = %e, "recovery status update failed");
            }
            worker.publish_status(StatusReason::Recovered);
            recovered += 1;
        }

        info!(recovered, "fleet recovery complete");
        Ok(recovered)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn list(&self) -> Vec<TraderSummary> {
        let mut summaries: Vec<TraderSummary> = self
            .fleet
            .read()
            .values()
            .map(|worker| {
                let config = worker.config();
                TraderSummary {
                    id: config.id.clone(),
                    name: config.name.clone(),
                    exchange: config.exchange,
                    symbol: config.symbol.clone(),
                    strategy: config.strategy,
                    candlestick_interval: config.candlestick_interval,
                    state: worker.state(),
                    metrics: worker.metrics.snapshot(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn state(&self, id: &str) -> Result<TraderState> {
        Ok(self.worker(id)?.state())
    }

    pub fn metrics(&self, id: &str) -> Result<MetricsSnapshot> {
        Ok(self.worker(id)?.metrics.snapshot())
    }

    pub fn health(&self, id: &str) -> Result<TraderHealth> {
        Ok(self.worker(id)?.health())
    }

    pub fn health_all(&self) -> Vec<TraderHealth> {
        let mut reports: Vec<TraderHealth> = self
            .fleet
            .read()
            .values()
            .map(|worker| worker.health())
            .collect();
        reports.sort_by(|a, b| a.trader_id.cmp(&b.trader_id));
        reports
    }

    pub fn get_config(&self, id: &str) -> Result<TraderConfig> {
        Ok(self.worker(id)?.config())
    }

    /// Stop every worker (graceful shutdown path).
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.fleet.read().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(trader_id = %id, error = %e, "stop during shutdown failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::exchange::mock::{MockAdapter, MockAdapterFactory};
    use crate::position::LivePositionManager;
    use crate::repository::InMemoryRepository;

    struct Harness {
        supervisor: Arc<TraderSupervisor>,
        repo: Arc<InMemoryRepository>,
        factory: Arc<MockAdapterFactory>,
        risk: Arc<RiskEngine>,
        positions: Arc<LivePositionManager>,
        bus: Arc<TelemetryBus>,
    }

    fn harness_with_repo(repo: Arc<InMemoryRepository>) -> Harness {
        let factory = Arc::new(MockAdapterFactory::new());
        factory
            .mock(Exchange::Binance)
            .set_candles(MockAdapter::series(60, 100.0, 0.1));

        let bus = Arc::new(TelemetryBus::new());
        let positions = Arc::new(LivePositionManager::new(
            factory.clone(),
            repo.clone(),
            bus.clone(),
        ));
        let risk = Arc::new(RiskEngine::new(
            RiskConfig {
                max_total_budget: 100_000.0,
                max_exposure_per_trader: 50_000.0,
                max_total_exposure: 200_000.0,
                ..RiskConfig::default()
            },
            positions.clone(),
            bus.clone(),
        ));
        let patterns = Arc::new(PatternService::new(repo.clone()).unwrap());

        let service_config = ServiceConfig::default();
        let supervisor = Arc::new(TraderSupervisor::new(
            &service_config,
            repo.clone(),
            repo.clone(),
            factory.clone(),
            risk.clone(),
            positions.clone(),
            Some(patterns),
            bus.clone(),
        ));
        supervisor.install_stop_handler();

        Harness {
            supervisor,
            repo,
            factory,
            risk,
            positions,
            bus,
        }
    }

    fn harness() -> Harness {
        harness_with_repo(Arc::new(InMemoryRepository::new()))
    }

    fn config(name: &str) -> TraderConfig {
        TraderConfig::builder(name)
            .exchange(Exchange::Binance)
            .symbol("BTCUSDT")
            .max_stake_amount(1000.0)
            .max_risk_level(5)
            .strategy(StrategyKind::TrendFollowing)
            .candlestick_interval(CandleInterval::OneHour)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn lifecycle_happy_path() {
        let h = harness();
        let id = h.supervisor.create(config("T1")).await.unwrap();

        h.supervisor.start(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(matches!(
            h.supervisor.state(&id).unwrap(),
            TraderState::Starting | TraderState::Running
        ));

        h.supervisor.stop(&id).await.unwrap();
        assert!(matches!(
            h.supervisor.state(&id).unwrap(),
            TraderState::Stopping | TraderState::Stopped
        ));

        h.supervisor.delete(&id).await.unwrap();
        assert!(TraderStore::find_by_id(h.repo.as_ref(), &id).unwrap().is_none());
        assert_eq!(h.supervisor.count(), 0);
    }

    #[tokio::test]
    async fn fourth_create_hits_the_cap() {
        let h = harness();
        for i in 0..3 {
            h.supervisor.create(config(&format!("T{i}"))).await.unwrap();
        }
        let err = h.supervisor.create(config("T3")).await.unwrap_err();
        assert_eq!(err.code(), "LIMIT_EXCEEDED");
        assert_eq!(h.supervisor.count(), 3);
    }

    #[tokio::test]
    async fn fleet_cap_holds_across_creates_and_deletes() {
        let h = harness();
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(h.supervisor.create(config(&format!("T{i}"))).await.unwrap());
        }
        assert!(h.supervisor.create(config("over")).await.is_err());

        h.supervisor.delete(&ids[0]).await.unwrap();
        assert!(h.supervisor.count() <= 3);

        // A slot opened up.
        let id = h.supervisor.create(config("fresh")).await.unwrap();
        assert!(h.supervisor.count() <= 3);
        assert!(TraderStore::find_by_id(h.repo.as_ref(), &id).unwrap().is_some());
    }

    #[tokio::test]
    async fn start_requires_idle_or_stopped() {
        let h = harness();
        let id = h.supervisor.create(config("T1")).await.unwrap();
        h.supervisor.start(&id).await.unwrap();

        let err = h.supervisor.start(&id).await.unwrap_err();
        assert_eq!(err.code(), "BAD_STATE");

        h.supervisor.stop(&id).await.unwrap();
        // Restart from Stopped is legal.
        h.supervisor.start(&id).await.unwrap();
        h.supervisor.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let h = harness();
        let id = h.supervisor.create(config("T1")).await.unwrap();
        // Stopping an IDLE worker is a no-op.
        h.supervisor.stop(&id).await.unwrap();

        h.supervisor.start(&id).await.unwrap();
        h.supervisor.stop(&id).await.unwrap();
        h.supervisor.stop(&id).await.unwrap();
        assert_eq!(h.supervisor.state(&id).unwrap(), TraderState::Stopped);
    }

    #[tokio::test]
    async fn unknown_trader_is_not_found() {
        let h = harness();
        assert_eq!(
            h.supervisor.start("ghost").await.unwrap_err().code(),
            "NOT_FOUND"
        );
        assert_eq!(
            h.supervisor.stop("ghost").await.unwrap_err().code(),
            "NOT_FOUND"
        );
        assert_eq!(
            h.supervisor.delete("ghost").await.unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn risk_rejection_blocks_create() {
        let h = harness();
        // Per-trader exposure cap is 50 000; 10 000 × 10 leverage exceeds it.
        let config = TraderConfig::builder("risky")
            .symbol("BTCUSDT")
            .max_stake_amount(10_000.0)
            .leverage(10)
            .build()
            .unwrap();
        let err = h.supervisor.create(config).await.unwrap_err();
        assert_eq!(err.code(), "RISK_REJECTED");
        assert_eq!(h.supervisor.count(), 0);
        assert_eq!(TraderStore::count(h.repo.as_ref()).unwrap(), 0);
    }

    #[tokio::test]
    async fn update_swaps_config_and_checks_identity() {
        let h = harness();
        let id = h.supervisor.create(config("T1")).await.unwrap();

        let err = h
            .supervisor
            .update(&id, config("other-id"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVARIANT_VIOLATION");

        let new_config = TraderConfig::builder("T1-updated")
            .id(&id)
            .symbol("ETHUSDT")
            .max_stake_amount(500.0)
            .strategy(StrategyKind::Breakout)
            .build()
            .unwrap();
        h.supervisor.update(&id, new_config).await.unwrap();

        let stored = TraderStore::find_by_id(h.repo.as_ref(), &id).unwrap().unwrap();
        assert_eq!(stored.config.symbol, "ETHUSDT");
        assert_eq!(h.supervisor.get_config(&id).unwrap().symbol, "ETHUSDT");
        assert_eq!(h.supervisor.state(&id).unwrap(), TraderState::Idle);
    }

    #[tokio::test]
    async fn update_restarts_running_worker() {
        let h = harness();
        let id = h.supervisor.create(config("T1")).await.unwrap();
        h.supervisor.start(&id).await.unwrap();

        let new_config = TraderConfig::builder("T1")
            .id(&id)
            .symbol("ETHUSDT")
            .max_stake_amount(1000.0)
            .build()
            .unwrap();
        h.supervisor.update(&id, new_config).await.unwrap();

        assert_eq!(h.supervisor.state(&id).unwrap(), TraderState::Running);
        assert_eq!(h.supervisor.get_config(&id).unwrap().symbol, "ETHUSDT");
        h.supervisor.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn recovery_restores_fleet_in_idle() {
        let repo = Arc::new(InMemoryRepository::new());
        let first = harness_with_repo(repo.clone());

        let a = first.supervisor.create(config("A")).await.unwrap();
        let b = first.supervisor.create(config("B")).await.unwrap();
        first.supervisor.start(&a).await.unwrap();
        first.supervisor.start(&b).await.unwrap();
        first.supervisor.stop_all().await;

        // Simulated restart: a fresh supervisor over the same repository.
        let second = harness_with_repo(repo.clone());
        assert_eq!(second.supervisor.count(), 0);
        let recovered = second.supervisor.recover().await.unwrap();
        assert_eq!(recovered, 2);

        // Recovery fidelity: in-memory count equals the row count; all IDLE.
        assert_eq!(
            second.supervisor.count(),
            TraderStore::count(repo.as_ref()).unwrap()
        );
        for id in [&a, &b] {
            assert_eq!(second.supervisor.state(id).unwrap(), TraderState::Idle);
        }
        assert_eq!(second.supervisor.get_config(&a).unwrap().name, "A");

        // recover() is safe to call again; nothing duplicates.
        assert_eq!(second.supervisor.recover().await.unwrap(), 0);
        assert_eq!(second.supervisor.count(), 2);
    }

    #[tokio::test]
    async fn recovered_fleet_enforces_the_cap() {
        let repo = Arc::new(InMemoryRepository::new());
        let first = harness_with_repo(repo.clone());
        for i in 0..3 {
            first.supervisor.create(config(&format!("T{i}"))).await.unwrap();
        }

        let second = harness_with_repo(repo);
        second.supervisor.recover().await.unwrap();
        let err = second.supervisor.create(config("extra")).await.unwrap_err();
        assert_eq!(err.code(), "LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let h = harness();
        let id = h.supervisor.create(config("T1")).await.unwrap();
        h.supervisor.start(&id).await.unwrap();

        h.supervisor.pause(&id).await.unwrap();
        assert_eq!(h.supervisor.state(&id).unwrap(), TraderState::Paused);

        h.supervisor.resume(&id).await.unwrap();
        assert_eq!(h.supervisor.state(&id).unwrap(), TraderState::Running);

        // Resume on a non-paused worker is a BadState.
        let err = h.supervisor.resume(&id).await.unwrap_err();
        assert_eq!(err.code(), "BAD_STATE");
        h.supervisor.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn risk_forced_stop_reaches_the_worker() {
        let h = harness();
        let id = h.supervisor.create(config("T1")).await.unwrap();
        h.supervisor.start(&id).await.unwrap();

        h.risk.emergency_stop_trader(&id, "test breach").await;

        // The stop handler spawns; give it a moment to run.
        let mut stopped = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if matches!(
                h.supervisor.state(&id).unwrap(),
                TraderState::Stopped | TraderState::Stopping
            ) {
                stopped = true;
                break;
            }
        }
        assert!(stopped, "risk-forced stop never landed");
        assert!(h.risk.is_emergency_stopped(&id));
    }

    #[tokio::test]
    async fn health_reports_cover_the_fleet() {
        let h = harness();
        let a = h.supervisor.create(config("A")).await.unwrap();
        let _b = h.supervisor.create(config("B")).await.unwrap();

        let reports = h.supervisor.health_all();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.healthy));

        let single = h.supervisor.health(&a).unwrap();
        assert_eq!(single.trader_id, a);
        assert_eq!(single.state, TraderState::Idle);

        let _ = (&h.factory, &h.positions, &h.bus);
    }

    #[tokio::test]
    async fn list_returns_summaries() {
        let h = harness();
        h.supervisor.create(config("A")).await.unwrap();
        h.supervisor.create(config("B")).await.unwrap();

        let listing = h.supervisor.list();
        assert_eq!(listing.len(), 2);
        assert!(listing.iter().all(|s| s.state == TraderState::Idle));
        assert!(listing.iter().all(|s| s.metrics.total_trades == 0));
    }
}
