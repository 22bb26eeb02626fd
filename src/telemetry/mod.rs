// =============================================================================
// Telemetry — event definitions and the in-process pub/sub hub
// =============================================================================

pub mod bus;
pub mod events;

pub use bus::{BusMessage, ConnectionInfo, Subscriber, TelemetryBus, HEARTBEAT_INTERVAL_SECS};
pub use events::{StatusReason, TelemetryChannel, TelemetryEvent};
