// =============================================================================
// Strategy layer — signal generation over candles and indicators
// =============================================================================
//
// A strategy is a pure decision function: given validated candles and the
// computed indicator set, it emits a `Signal`. Strategies declare the
// indicators they need; the trading loop computes exactly those and enforces
// the history minimum before calling `generate`.
//
// Selection is by `StrategyKind` on the trader config; `build_strategy` is
// the single construction point, re-run on config change so no stale state
// survives a reconfigure.
// =============================================================================

pub mod breakout;
pub mod mean_reversion;
pub mod trend_following;

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::TraderConfig;
use crate::error::{ErrorKind, Result};
use crate::exchange::Candle;
use crate::indicators::{required_history, IndicatorKind, IndicatorSet};
use crate::types::{SignalAction, StrategyKind};

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A trading recommendation with its supporting evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    /// Confidence in [0, 1]; signals below the configured threshold are
    /// dropped by the trading loop.
    pub confidence: f64,
    pub reason: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    /// Indicator values the decision was based on.
    #[serde(default)]
    pub indicator_values: HashMap<String, f64>,
    /// Set when pattern confidence was blended into this signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_pattern_id: Option<String>,
}

impl Signal {
    pub fn new(action: SignalAction, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            action,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            timestamp: Utc::now().timestamp_millis(),
            indicator_values: HashMap::new(),
            matched_pattern_id: None,
        }
    }

    pub fn hold(reason: impl Into<String>) -> Self {
        Self::new(SignalAction::Hold, 0.0, reason)
    }

    pub fn with_indicators(mut self, indicators: &IndicatorSet) -> Self {
        self.indicator_values = indicators.latest.clone();
        self
    }

    /// Whether the signal clears the execution threshold.
    pub fn is_admitted(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

/// A pure signal generator. Implementations hold no mutable state; anything
/// per-worker lives in the worker and is rebuilt on config change.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> StrategyKind;

    /// Indicators the trading loop must compute before calling `generate`.
    fn required_indicators(&self) -> Vec<IndicatorKind>;

    /// Minimum closed candles needed; defaults to the indicator requirement.
    fn min_candles(&self) -> usize {
        required_history(&self.required_indicators())
    }

    /// Reject configs this strategy cannot run with.
    fn validate_config(&self, config: &TraderConfig) -> Result<()> {
        if config.strategy != self.kind() {
            return Err(ErrorKind::InvalidArgument(format!(
                "config selects {} but strategy is {}",
                config.strategy,
                self.kind()
            )));
        }
        Ok(())
    }

    /// Produce a signal from validated, chronological candles and the
    /// indicator set computed from them.
    fn generate(&self, candles: &[Candle], indicators: &IndicatorSet) -> Signal;
}

/// Build the strategy instance for a config's kind.
pub fn build_strategy(kind: StrategyKind) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::TrendFollowing => Box::new(trend_following::TrendFollowing::default()),
        StrategyKind::MeanReversion => Box::new(mean_reversion::MeanReversion::default()),
        StrategyKind::Breakout => Box::new(breakout::Breakout::default()),
    }
}
