// =============================================================================
// Borealis Trading Service — Main Entry Point
// =============================================================================
//
// The service starts in demo mode for safety: market data is real, order
// fills are simulated. Set BOREALIS_LIVE=1 to trade with real funds.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod error;
mod exchange;
mod indicators;
mod metrics;
mod pattern;
mod position;
mod repository;
mod risk;
mod strategy;
mod supervisor;
mod telemetry;
mod trading_loop;
mod types;
mod worker;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::ServiceConfig;
use crate::exchange::{AdapterSettings, CachingAdapterFactory};
use crate::pattern::PatternService;
use crate::position::LivePositionManager;
use crate::repository::InMemoryRepository;
use crate::risk::RiskEngine;
use crate::supervisor::TraderSupervisor;
use crate::telemetry::TelemetryBus;

const CONFIG_PATH: &str = "borealis_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Borealis Trading Service — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let service_config = ServiceConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        ServiceConfig::default()
    });
    service_config
        .risk
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid risk configuration: {e}"))?;

    // SAFETY: demo unless explicitly switched to live.
    let live = std::env::var("BOREALIS_LIVE").map(|v| v == "1").unwrap_or(false);
    if live {
        warn!("LIVE trading enabled — orders will reach the exchange");
    } else {
        info!("Demo mode: real market data, simulated fills");
    }

    info!(
        max_traders = service_config.max_traders,
        confidence_threshold = service_config.signal_confidence_threshold,
        monitoring_interval_secs = service_config.risk.monitoring_interval_secs,
        "service configuration loaded"
    );

    // ── 2. Exchange adapter factory ──────────────────────────────────────
    let adapter_settings = AdapterSettings {
        api_key: std::env::var("BINANCE_API_KEY").unwrap_or_default(),
        api_secret: std::env::var("BINANCE_API_SECRET").unwrap_or_default(),
        demo: !live,
        timeout: Some(service_config.adapter_timeout()),
    };
    let adapters = Arc::new(CachingAdapterFactory::new(adapter_settings));

    // ── 3. Repository ────────────────────────────────────────────────────
    // The in-memory reference store; any relational store satisfying the
    // repository ports can be swapped in here.
    let repository = Arc::new(InMemoryRepository::new());

    // ── 4. Telemetry bus + heartbeats ────────────────────────────────────
    let bus = Arc::new(TelemetryBus::new());
    let _heartbeat = bus.spawn_heartbeat();

    // ── 5. Positions, risk, patterns ─────────────────────────────────────
    let positions = Arc::new(LivePositionManager::new(
        adapters.clone(),
        repository.clone(),
        bus.clone(),
    ));
    let risk = Arc::new(RiskEngine::new(
        service_config.risk.clone(),
        positions.clone(),
        bus.clone(),
    ));
    let _monitor = risk.spawn_monitor();

    let patterns = Arc::new(
        PatternService::new(repository.clone())
            .map_err(|e| anyhow::anyhow!("pattern service init failed: {e}"))?,
    );

    // ── 6. Supervisor + crash recovery ───────────────────────────────────
    let supervisor = Arc::new(TraderSupervisor::new(
        &service_config,
        repository.clone(),
        repository.clone(),
        adapters.clone(),
        risk.clone(),
        positions.clone(),
        Some(patterns.clone()),
        bus.clone(),
    ));
    supervisor.install_stop_handler();

    match supervisor.recover().await {
        Ok(recovered) => info!(recovered, "fleet recovered from repository"),
        Err(e) => warn!(error = %e, "fleet recovery failed"),
    }

    // ── 7. API server ────────────────────────────────────────────────────
    let state = Arc::new(AppState::new(
        service_config.clone(),
        supervisor.clone(),
        risk,
        patterns,
        positions,
        bus,
    ));

    let bind_addr =
        std::env::var("BOREALIS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let api_state = state.clone();
    let bind_addr_clone = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr_clone).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %bind_addr_clone, error = %e, "failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr_clone, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    supervisor.stop_all().await;

    if let Err(e) = state.config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save service config on shutdown");
    }

    info!("Borealis Trading Service shut down complete.");
    Ok(())
}
