// =============================================================================
// Application state — the wiring handed to the API layer
// =============================================================================
//
// Every subsystem is constructed once in `main` and injected here; handlers
// reach everything through `Arc<AppState>`. No hidden globals.
// =============================================================================

use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::pattern::PatternService;
use crate::position::PositionManager;
use crate::risk::RiskEngine;
use crate::supervisor::TraderSupervisor;
use crate::telemetry::TelemetryBus;

pub struct AppState {
    pub config: ServiceConfig,
    pub supervisor: Arc<TraderSupervisor>,
    pub risk: Arc<RiskEngine>,
    pub patterns: Arc<PatternService>,
    pub positions: Arc<dyn PositionManager>,
    pub bus: Arc<TelemetryBus>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: ServiceConfig,
        supervisor: Arc<TraderSupervisor>,
        risk: Arc<RiskEngine>,
        patterns: Arc<PatternService>,
        positions: Arc<dyn PositionManager>,
        bus: Arc<TelemetryBus>,
    ) -> Self {
        Self {
            config,
            supervisor,
            risk,
            patterns,
            positions,
            bus,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
