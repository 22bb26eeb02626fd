// =============================================================================
// Error taxonomy shared across the Borealis trading service
// =============================================================================
//
// Every fallible core operation returns `Result<T, ErrorKind>`. The kinds map
// one-to-one onto the machine-readable codes surfaced by the REST envelope,
// so higher layers never need to parse message strings.
// =============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Risk violations
// ---------------------------------------------------------------------------

/// Category of a risk-gate violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskViolationType {
    Budget,
    Leverage,
    Exposure,
    DailyLoss,
    Emergency,
    Score,
}

impl std::fmt::Display for RiskViolationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Budget => write!(f, "BUDGET"),
            Self::Leverage => write!(f, "LEVERAGE"),
            Self::Exposure => write!(f, "EXPOSURE"),
            Self::DailyLoss => write!(f, "DAILY_LOSS"),
            Self::Emergency => write!(f, "EMERGENCY"),
            Self::Score => write!(f, "SCORE"),
        }
    }
}

/// A single violation reported by the risk engine. Carried inside
/// [`ErrorKind::RiskRejected`] and on `risk-alerts` telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskViolation {
    #[serde(rename = "type")]
    pub violation_type: RiskViolationType,
    pub message: String,
    /// Free-form numeric context (requested amount, cap, current exposure…).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl RiskViolation {
    pub fn new(violation_type: RiskViolationType, message: impl Into<String>) -> Self {
        Self {
            violation_type,
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }

    /// Attach a numeric detail to the violation.
    pub fn with_detail(mut self, key: &str, value: f64) -> Self {
        self.details
            .insert(key.to_string(), serde_json::json!(value));
        self
    }
}

impl std::fmt::Display for RiskViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.violation_type, self.message)
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Typed error for every core operation.
#[derive(Debug, Clone, Error)]
pub enum ErrorKind {
    /// Entity lookup failed (trader, pattern, position, order…).
    #[error("not found: {0}")]
    NotFound(String),

    /// Validation failed at construction; the value was never persisted.
    #[error("{0}")]
    InvalidArgument(String),

    /// Fleet cap or repository cap reached; the request had no side effects.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Lifecycle precondition not met; state is unchanged.
    #[error("bad state: {0}")]
    BadState(String),

    /// The risk engine denied the operation. The signal is dropped and the
    /// worker keeps running.
    #[error("risk rejected: {}", format_violations(violations))]
    RiskRejected { violations: Vec<RiskViolation> },

    /// An adapter operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Transient adapter failure (connect, rate-limit); retried by the
    /// trading loop with backoff.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Exchange rejected the credentials; the worker transitions to Error.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The trader was emergency-stopped by the risk engine.
    #[error("emergency stop: {0}")]
    Emergency(String),

    /// An internal invariant was broken by the caller.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Repository or other infrastructure failure.
    #[error("internal: {0}")]
    Internal(String),
}

fn format_violations(violations: &[RiskViolation]) -> String {
    if violations.is_empty() {
        return "no violations attached".to_string();
    }
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ErrorKind {
    /// Machine-readable code for the REST envelope and telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::LimitExceeded(_) => "LIMIT_EXCEEDED",
            Self::BadState(_) => "BAD_STATE",
            Self::RiskRejected { .. } => "RISK_REJECTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Self::Emergency(_) => "EMERGENCY",
            Self::InvariantViolation(_) => "INVARIANT_VIOLATION",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Convenience constructor for a single-violation rejection.
    pub fn risk_rejected(violation: RiskViolation) -> Self {
        Self::RiskRejected {
            violations: vec![violation],
        }
    }

    /// The violations attached to a `RiskRejected`, empty otherwise.
    pub fn violations(&self) -> &[RiskViolation] {
        match self {
            Self::RiskRejected { violations } => violations,
            _ => &[],
        }
    }
}

/// Alias used throughout the core.
pub type Result<T, E = ErrorKind> = std::result::Result<T, E>;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorKind::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(
            ErrorKind::InvalidArgument("x".into()).code(),
            "INVALID_ARGUMENT"
        );
        assert_eq!(ErrorKind::LimitExceeded("x".into()).code(), "LIMIT_EXCEEDED");
        assert_eq!(ErrorKind::BadState("x".into()).code(), "BAD_STATE");
        assert_eq!(
            ErrorKind::risk_rejected(RiskViolation::new(
                RiskViolationType::Budget,
                "over budget"
            ))
            .code(),
            "RISK_REJECTED"
        );
    }

    #[test]
    fn risk_rejected_formats_violations() {
        let err = ErrorKind::RiskRejected {
            violations: vec![
                RiskViolation::new(RiskViolationType::Budget, "over budget"),
                RiskViolation::new(RiskViolationType::Leverage, "leverage too high"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("BUDGET: over budget"));
        assert!(text.contains("LEVERAGE: leverage too high"));
    }

    #[test]
    fn violation_details_serialise() {
        let v = RiskViolation::new(RiskViolationType::Budget, "over budget")
            .with_detail("requested", 200.0)
            .with_detail("cap", 1000.0);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["type"], "BUDGET");
        assert_eq!(json["details"]["requested"], 200.0);
    }

    #[test]
    fn violations_accessor() {
        let err = ErrorKind::risk_rejected(RiskViolation::new(
            RiskViolationType::Exposure,
            "exposed",
        ));
        assert_eq!(err.violations().len(), 1);
        assert!(ErrorKind::Timeout("t".into()).violations().is_empty());
    }
}
