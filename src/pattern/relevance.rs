// =============================================================================
// Relevance scoring — how well a stored pattern fits current conditions
// =============================================================================
//
// Per-condition scoring: a satisfied predicate contributes 1.0; a missed one
// contributes partial credit that decays with distance from the predicate's
// envelope (measured in envelope widths). The pattern's relevance is the mean
// over the conditions the current snapshot can actually evaluate, with a flat
// penalty when the timeframes differ.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{CandleInterval, Exchange};

use super::model::{IndicatorPredicate, TradingPattern};

/// Multiplier applied when the pattern's timeframe differs from the current
/// one.
const TIMEFRAME_MISMATCH_PENALTY: f64 = 0.8;

/// A snapshot of the market the trading loop hands to the pattern service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConditions {
    pub exchange: Exchange,
    pub symbol: String,
    pub timeframe: CandleInterval,
    /// Latest indicator values keyed by canonical name; includes "PRICE".
    pub indicators: HashMap<String, f64>,
}

impl MarketConditions {
    pub fn value(&self, key: &str) -> Option<f64> {
        self.indicators.get(key).copied()
    }
}

/// Stateless relevance calculator.
pub struct RelevanceCalculator;

impl RelevanceCalculator {
    /// Score `pattern` against `conditions`, in [0, 1].
    ///
    /// Returns 0 when the snapshot carries none of the pattern's condition
    /// indicators — a pattern that cannot be evaluated is not relevant.
    pub fn score(pattern: &TradingPattern, conditions: &MarketConditions) -> f64 {
        if pattern.conditions.is_empty() {
            return 0.0;
        }

        let mut total = 0.0;
        let mut evaluated = 0usize;

        for (key, predicate) in &pattern.conditions {
            let Some(value) = conditions.value(key) else {
                continue;
            };
            evaluated += 1;
            total += Self::component(predicate, value);
        }

        if evaluated == 0 {
            return 0.0;
        }

        let mut relevance = total / evaluated as f64;
        if pattern.timeframe != conditions.timeframe {
            relevance *= TIMEFRAME_MISMATCH_PENALTY;
        }
        relevance.clamp(0.0, 1.0)
    }

    /// Extract the indicator values that the pattern's satisfied conditions
    /// actually matched on.
    pub fn matched_indicators(
        pattern: &TradingPattern,
        conditions: &MarketConditions,
    ) -> HashMap<String, f64> {
        pattern
            .conditions
            .iter()
            .filter_map(|(key, predicate)| {
                let value = conditions.value(key)?;
                predicate.matches(value).then(|| (key.clone(), value))
            })
            .collect()
    }

    /// Score one predicate against a value: 1.0 when satisfied, otherwise
    /// linear fall-off over one envelope width outside the bounds.
    fn component(predicate: &IndicatorPredicate, value: f64) -> f64 {
        if predicate.matches(value) {
            return 1.0;
        }

        let (lo, hi) = predicate.envelope();
        // Open envelopes missed the value entirely; no distance credit.
        if lo.is_infinite() || hi.is_infinite() {
            return 0.0;
        }

        let width = (hi - lo).max(lo.abs().max(hi.abs()) * 1e-3).max(1e-9);
        let distance = if value < lo { lo - value } else { value - hi };
        (1.0 - distance / width).max(0.0)
    }
}
