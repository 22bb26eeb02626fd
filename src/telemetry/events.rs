// =============================================================================
// Telemetry events — the tagged payloads flowing through the bus
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::RiskViolation;
use crate::position::ManagedPosition;
use crate::types::{Exchange, TraderState};

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// The fixed channel set. Wire names are kebab-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TelemetryChannel {
    TraderStatus,
    Positions,
    RiskAlerts,
    MarketData,
}

impl TelemetryChannel {
    pub const ALL: [TelemetryChannel; 4] = [
        Self::TraderStatus,
        Self::Positions,
        Self::RiskAlerts,
        Self::MarketData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TraderStatus => "trader-status",
            Self::Positions => "positions",
            Self::RiskAlerts => "risk-alerts",
            Self::MarketData => "market-data",
        }
    }
}

impl std::fmt::Display for TelemetryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TelemetryChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trader-status" => Ok(Self::TraderStatus),
            "positions" => Ok(Self::Positions),
            "risk-alerts" => Ok(Self::RiskAlerts),
            "market-data" => Ok(Self::MarketData),
            other => Err(format!("unknown telemetry channel: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Why a trader-status event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusReason {
    Created,
    Recovered,
    StateChange,
    ConfigUpdated,
    Deleted,
}

/// A telemetry event. Each variant carries a stable snapshot id and a
/// monotonic millisecond timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    TraderStatus {
        trader_id: String,
        name: String,
        state: TraderState,
        reason: StatusReason,
        timestamp: i64,
    },
    PositionOpen {
        position: ManagedPosition,
        timestamp: i64,
    },
    PositionUpdate {
        position: ManagedPosition,
        timestamp: i64,
    },
    PositionClose {
        position_id: String,
        trader_id: String,
        symbol: String,
        pnl: f64,
        pnl_percent: f64,
        reason: String,
        timestamp: i64,
    },
    RiskAlert {
        alert_id: String,
        trader_id: Option<String>,
        violation: RiskViolation,
        timestamp: i64,
    },
    MarketData {
        exchange: Exchange,
        symbol: String,
        price: f64,
        timestamp: i64,
    },
}

impl TelemetryEvent {
    /// Channel this event belongs to.
    pub fn channel(&self) -> TelemetryChannel {
        match self {
            Self::TraderStatus { .. } => TelemetryChannel::TraderStatus,
            Self::PositionOpen { .. } | Self::PositionUpdate { .. } | Self::PositionClose { .. } => {
                TelemetryChannel::Positions
            }
            Self::RiskAlert { .. } => TelemetryChannel::RiskAlerts,
            Self::MarketData { .. } => TelemetryChannel::MarketData,
        }
    }

    /// Stable id used for per-(channel, id) snapshots.
    pub fn snapshot_id(&self) -> String {
        match self {
            Self::TraderStatus { trader_id, .. } => trader_id.clone(),
            Self::PositionOpen { position, .. } | Self::PositionUpdate { position, .. } => {
                position.position_id.clone()
            }
            Self::PositionClose { position_id, .. } => position_id.clone(),
            Self::RiskAlert { alert_id, .. } => alert_id.clone(),
            Self::MarketData { symbol, exchange, .. } => format!("{exchange}:{symbol}"),
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::TraderStatus { timestamp, .. }
            | Self::PositionOpen { timestamp, .. }
            | Self::PositionUpdate { timestamp, .. }
            | Self::PositionClose { timestamp, .. }
            | Self::RiskAlert { timestamp, .. }
            | Self::MarketData { timestamp, .. } => *timestamp,
        }
    }

    /// Whether this event removes its id from the channel snapshot instead
    /// of updating it.
    pub fn clears_snapshot(&self) -> bool {
        matches!(self, Self::PositionClose { .. })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_wire_names_roundtrip() {
        for channel in TelemetryChannel::ALL {
            let parsed: TelemetryChannel = channel.as_str().parse().unwrap();
            assert_eq!(parsed, channel);
        }
        assert!("orders".parse::<TelemetryChannel>().is_err());
    }

    #[test]
    fn status_event_channel_and_id() {
        let event = TelemetryEvent::TraderStatus {
            trader_id: "t1".into(),
            name: "T1".into(),
            state: TraderState::Running,
            reason: StatusReason::StateChange,
            timestamp: 42,
        };
        assert_eq!(event.channel(), TelemetryChannel::TraderStatus);
        assert_eq!(event.snapshot_id(), "t1");
        assert_eq!(event.timestamp(), 42);
        assert!(!event.clears_snapshot());
    }

    #[test]
    fn close_event_clears_snapshot() {
        let event = TelemetryEvent::PositionClose {
            position_id: "p1".into(),
            trader_id: "t1".into(),
            symbol: "BTCUSDT".into(),
            pnl: 1.0,
            pnl_percent: 0.5,
            reason: "STOP_LOSS".into(),
            timestamp: 1,
        };
        assert_eq!(event.channel(), TelemetryChannel::Positions);
        assert!(event.clears_snapshot());
    }

    #[test]
    fn market_data_id_includes_exchange() {
        let event = TelemetryEvent::MarketData {
            exchange: Exchange::Binance,
            symbol: "BTCUSDT".into(),
            price: 100.0,
            timestamp: 1,
        };
        assert_eq!(event.snapshot_id(), "BINANCE:BTCUSDT");
    }

    #[test]
    fn serialised_event_is_tagged() {
        let event = TelemetryEvent::MarketData {
            exchange: Exchange::Binance,
            symbol: "BTCUSDT".into(),
            price: 100.0,
            timestamp: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "market_data");
        assert_eq!(json["symbol"], "BTCUSDT");
    }
}
