// =============================================================================
// API layer — REST endpoints, WebSocket telemetry, shared-key auth
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;
