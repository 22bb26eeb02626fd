// =============================================================================
// Shared types used across the Borealis trading service
// =============================================================================

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// Supported exchanges. The adapter factory matches exhaustively on this
/// enum — adding a variant forces a dispatch decision at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Exchange {
    Binance,
    Coinbase,
    Kraken,
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binance => write!(f, "BINANCE"),
            Self::Coinbase => write!(f, "COINBASE"),
            Self::Kraken => write!(f, "KRAKEN"),
        }
    }
}

impl std::str::FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BINANCE" => Ok(Self::Binance),
            "COINBASE" => Ok(Self::Coinbase),
            "KRAKEN" => Ok(Self::Kraken),
            other => Err(format!("unknown exchange: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Candlestick interval
// ---------------------------------------------------------------------------

/// Candle interval used for market-data polling and loop pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CandleInterval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    OneDay,
}

impl CandleInterval {
    /// Wall-clock duration of one candle; also the sleep between trading-loop
    /// iterations.
    pub fn duration(&self) -> Duration {
        match self {
            Self::OneMinute => Duration::from_secs(60),
            Self::FiveMinutes => Duration::from_secs(5 * 60),
            Self::FifteenMinutes => Duration::from_secs(15 * 60),
            Self::OneHour => Duration::from_secs(60 * 60),
            Self::OneDay => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Exchange wire representation ("1m", "5m", …).
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::OneDay => "1d",
        }
    }
}

impl std::fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

// ---------------------------------------------------------------------------
// Strategy selection
// ---------------------------------------------------------------------------

/// Which strategy a trader runs. The concrete instance is built from this
/// tag when the worker is created or reconfigured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    TrendFollowing,
    MeanReversion,
    Breakout,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrendFollowing => write!(f, "TREND_FOLLOWING"),
            Self::MeanReversion => write!(f, "MEAN_REVERSION"),
            Self::Breakout => write!(f, "BREAKOUT"),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal action
// ---------------------------------------------------------------------------

/// The action a strategy recommends for the current market conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
    Close,
}

impl SignalAction {
    /// A signal is actionable when it would open a new position.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::Buy | Self::Sell)
    }
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
            Self::Close => write!(f, "CLOSE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Trader lifecycle state
// ---------------------------------------------------------------------------

/// Worker lifecycle state machine:
///
/// ```text
/// Idle -> Starting -> Running <-> Paused -> Stopping -> Stopped
///   any state -> Error;  Error -> Stopped (explicit stop only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraderState {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl TraderState {
    /// Whether the transition `self -> to` is allowed by the state machine.
    pub fn can_transition_to(&self, to: TraderState) -> bool {
        use TraderState::*;
        if to == Error {
            // Any state may fail into Error.
            return true;
        }
        match (self, to) {
            (Idle, Starting) => true,
            (Stopped, Starting) => true,
            (Starting, Running) => true,
            (Running, Paused) => true,
            (Paused, Running) => true,
            (Running, Stopping) | (Paused, Stopping) | (Starting, Stopping) => true,
            (Stopping, Stopped) => true,
            // Error recovers only through the stop path.
            (Error, Stopping) | (Error, Stopped) => true,
            // Idempotent stop.
            (Stopped, Stopped) => true,
            _ => false,
        }
    }

    /// States in which the trading loop is (or is about to be) active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for TraderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted trader status
// ---------------------------------------------------------------------------

/// Coarse status stored in the trader row. The runtime state machine is
/// richer; this is what survives a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistedStatus {
    Active,
    Paused,
    Stopped,
    Error,
}

impl From<TraderState> for PersistedStatus {
    fn from(state: TraderState) -> Self {
        match state {
            TraderState::Starting | TraderState::Running => Self::Active,
            TraderState::Paused => Self::Paused,
            TraderState::Error => Self::Error,
            TraderState::Idle | TraderState::Stopping | TraderState::Stopped => Self::Stopped,
        }
    }
}

impl std::fmt::Display for PersistedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Trade side
// ---------------------------------------------------------------------------

/// Direction of a trade / position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    /// +1.0 for long, -1.0 for short; multiplies price deltas into PnL.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn from_action(action: SignalAction) -> Option<Self> {
        match action {
            SignalAction::Buy => Some(Self::Long),
            SignalAction::Sell => Some(Self::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_durations() {
        assert_eq!(CandleInterval::OneMinute.duration().as_secs(), 60);
        assert_eq!(CandleInterval::OneHour.duration().as_secs(), 3600);
        assert_eq!(CandleInterval::OneDay.duration().as_secs(), 86400);
        assert_eq!(CandleInterval::FiveMinutes.as_wire(), "5m");
    }

    #[test]
    fn legal_lifecycle_path() {
        use TraderState::*;
        let path = [Idle, Starting, Running, Paused, Running, Stopping, Stopped];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn illegal_jumps_rejected() {
        use TraderState::*;
        assert!(!Idle.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Idle));
        assert!(!Paused.can_transition_to(Idle));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn error_reachable_from_anywhere_and_recovers_via_stop() {
        use TraderState::*;
        for s in [Idle, Starting, Running, Paused, Stopping, Stopped] {
            assert!(s.can_transition_to(Error));
        }
        assert!(Error.can_transition_to(Stopped));
        assert!(!Error.can_transition_to(Running));
        assert!(!Error.can_transition_to(Starting));
    }

    #[test]
    fn restart_after_stop_allowed() {
        assert!(TraderState::Stopped.can_transition_to(TraderState::Starting));
    }

    #[test]
    fn actionable_signals() {
        assert!(SignalAction::Buy.is_actionable());
        assert!(SignalAction::Sell.is_actionable());
        assert!(!SignalAction::Hold.is_actionable());
        assert!(!SignalAction::Close.is_actionable());
    }

    #[test]
    fn persisted_status_mapping() {
        assert_eq!(
            PersistedStatus::from(TraderState::Running),
            PersistedStatus::Active
        );
        assert_eq!(
            PersistedStatus::from(TraderState::Idle),
            PersistedStatus::Stopped
        );
        assert_eq!(
            PersistedStatus::from(TraderState::Error),
            PersistedStatus::Error
        );
    }

    #[test]
    fn exchange_roundtrip() {
        for ex in [Exchange::Binance, Exchange::Coinbase, Exchange::Kraken] {
            let parsed: Exchange = ex.to_string().parse().unwrap();
            assert_eq!(parsed, ex);
        }
        assert!("HUOBI".parse::<Exchange>().is_err());
    }
}
