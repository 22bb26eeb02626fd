// =============================================================================
// Trading patterns — typed conditions, effective confidence, merging
// =============================================================================
//
// A pattern is a reusable description of market conditions that preceded a
// winning trade. Conditions are typed predicates over named indicator values
// (no stringly-typed range pairs); matching and merging work through the
// predicate's numeric envelope.
// =============================================================================

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, Result};
use crate::types::{CandleInterval, Exchange, SignalAction};

/// Weight of observed performance in effective confidence.
const PERFORMANCE_WEIGHT: f64 = 0.3;
/// Logistic midpoint: at this usage count the usage factor reads 0.5.
const USAGE_MIDPOINT: f64 = 10.0;
/// Logistic steepness divisor.
const USAGE_SCALE: f64 = 4.0;

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// A typed predicate over a single indicator value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorPredicate {
    Range { min: f64, max: f64 },
    Point { value: f64 },
    Above { threshold: f64 },
    Below { threshold: f64 },
}

impl IndicatorPredicate {
    /// Whether `value` satisfies the predicate. Point values allow a small
    /// relative tolerance, since exact float equality never happens on live
    /// data.
    pub fn matches(&self, value: f64) -> bool {
        match self {
            Self::Range { min, max } => (*min..=*max).contains(&value),
            Self::Point { value: target } => {
                let tolerance = target.abs().max(1e-9) * 1e-3;
                (value - target).abs() <= tolerance
            }
            Self::Above { threshold } => value > *threshold,
            Self::Below { threshold } => value < *threshold,
        }
    }

    /// Numeric envelope `[lo, hi]` (infinite bounds for open predicates).
    pub fn envelope(&self) -> (f64, f64) {
        match self {
            Self::Range { min, max } => (*min, *max),
            Self::Point { value } => (*value, *value),
            Self::Above { threshold } => (*threshold, f64::INFINITY),
            Self::Below { threshold } => (f64::NEG_INFINITY, *threshold),
        }
    }

    /// Whether two predicates' envelopes intersect.
    pub fn overlaps(&self, other: &Self) -> bool {
        let (a_lo, a_hi) = self.envelope();
        let (b_lo, b_hi) = other.envelope();
        a_lo <= b_hi && b_lo <= a_hi
    }

    /// Smallest predicate covering both envelopes, canonicalised so that
    /// open bounds stay serialisable (no infinities in JSON).
    pub fn union(&self, other: &Self) -> Self {
        let (a_lo, a_hi) = self.envelope();
        let (b_lo, b_hi) = other.envelope();
        let lo = a_lo.min(b_lo);
        let hi = a_hi.max(b_hi);

        match (lo.is_infinite(), hi.is_infinite()) {
            (true, true) => Self::Range {
                min: f64::MIN,
                max: f64::MAX,
            },
            (true, false) => Self::Below { threshold: hi },
            (false, true) => Self::Above { threshold: lo },
            (false, false) if lo == hi => Self::Point { value: lo },
            (false, false) => Self::Range { min: lo, max: hi },
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern type
// ---------------------------------------------------------------------------

/// Classification assigned at extraction time, by fixed priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternType {
    OversoldReversal,
    OverboughtReversal,
    TrendFollowing,
    MomentumContinuation,
    Custom,
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OversoldReversal => write!(f, "OVERSOLD_REVERSAL"),
            Self::OverboughtReversal => write!(f, "OVERBOUGHT_REVERSAL"),
            Self::TrendFollowing => write!(f, "TREND_FOLLOWING"),
            Self::MomentumContinuation => write!(f, "MOMENTUM_CONTINUATION"),
            Self::Custom => write!(f, "CUSTOM"),
        }
    }
}

// ---------------------------------------------------------------------------
// TradingPattern
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPattern {
    pub id: String,
    pub exchange: Exchange,
    pub symbol: String,
    pub timeframe: CandleInterval,
    pub action: SignalAction,
    pub pattern_type: PatternType,
    pub conditions: HashMap<String, IndicatorPredicate>,
    /// Base confidence in [0, 1] assigned at extraction.
    pub confidence: f64,
    pub usage_count: u64,
    pub success_count: u64,
    pub average_return: f64,
    /// Milliseconds since epoch.
    pub created_at: i64,
    pub last_used_at: Option<i64>,
    pub tags: BTreeSet<String>,
    /// Deactivated patterns are kept for audit but never matched.
    pub active: bool,
}

impl TradingPattern {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Exchange,
        symbol: impl Into<String>,
        timeframe: CandleInterval,
        action: SignalAction,
        pattern_type: PatternType,
        conditions: HashMap<String, IndicatorPredicate>,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            exchange,
            symbol: symbol.into(),
            timeframe,
            action,
            pattern_type,
            conditions,
            confidence: confidence.clamp(0.0, 1.0),
            usage_count: 0,
            success_count: 0,
            average_return: 0.0,
            created_at: Utc::now().timestamp_millis(),
            last_used_at: None,
            tags: BTreeSet::new(),
            active: true,
        }
    }

    /// Observed success rate; 0 when the pattern is unused.
    pub fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.usage_count as f64
        }
    }

    /// Logistic factor of usage in (0, 1): near zero for fresh patterns,
    /// approaching 1 as evidence accumulates.
    pub fn usage_factor(&self) -> f64 {
        let x = (self.usage_count as f64 - USAGE_MIDPOINT) / USAGE_SCALE;
        1.0 / (1.0 + (-x).exp())
    }

    /// Confidence adjusted by observed performance, monotonic in base
    /// confidence, success rate and usage, capped at 1.
    pub fn effective_confidence(&self) -> f64 {
        (self.confidence + PERFORMANCE_WEIGHT * self.success_rate() * self.usage_factor()).min(1.0)
    }

    /// Ranking key for query results.
    pub fn ranking_score(&self) -> f64 {
        self.effective_confidence() * self.success_rate()
    }

    /// Record one outcome: bumps usage, success on wins, and folds the
    /// return into the running average.
    pub fn record_outcome(&mut self, success: bool, return_amount: f64) {
        self.usage_count += 1;
        if success {
            self.success_count += 1;
        }
        let n = self.usage_count as f64;
        self.average_return = (self.average_return * (n - 1.0) + return_amount) / n;
        self.last_used_at = Some(Utc::now().timestamp_millis());
    }

    /// Merge similarity: identical (exchange, symbol, action) and every
    /// indicator defined by both sides overlaps. Indicators defined by only
    /// one side are compatible.
    pub fn is_merge_similar(&self, other: &Self) -> bool {
        if self.exchange != other.exchange
            || self.symbol != other.symbol
            || self.action != other.action
        {
            return false;
        }
        self.conditions.iter().all(|(key, predicate)| {
            other
                .conditions
                .get(key)
                .map_or(true, |theirs| predicate.overlaps(theirs))
        })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge ≥ 2 pairwise-similar patterns into one. Ranges become the union per
/// indicator, confidence the arithmetic mean, tags the union plus "merged".
/// Usage statistics are summed so the merged pattern keeps its evidence.
pub fn merge_patterns(patterns: &[TradingPattern]) -> Result<TradingPattern> {
    if patterns.len() < 2 {
        return Err(ErrorKind::InvalidArgument(
            "merging requires at least 2 similar patterns".into(),
        ));
    }
    for (i, a) in patterns.iter().enumerate() {
        for b in &patterns[i + 1..] {
            if !a.is_merge_similar(b) {
                return Err(ErrorKind::InvalidArgument(format!(
                    "patterns {} and {} are not merge-similar",
                    a.id, b.id
                )));
            }
        }
    }

    let first = &patterns[0];

    let mut conditions: HashMap<String, IndicatorPredicate> = HashMap::new();
    for pattern in patterns {
        for (key, predicate) in &pattern.conditions {
            conditions
                .entry(key.clone())
                .and_modify(|existing| *existing = existing.union(predicate))
                .or_insert_with(|| predicate.clone());
        }
    }

    let confidence =
        patterns.iter().map(|p| p.confidence).sum::<f64>() / patterns.len() as f64;

    let mut tags: BTreeSet<String> = patterns.iter().flat_map(|p| p.tags.clone()).collect();
    tags.insert("merged".to_string());

    let usage_count: u64 = patterns.iter().map(|p| p.usage_count).sum();
    let success_count: u64 = patterns.iter().map(|p| p.success_count).sum();
    let average_return = if usage_count > 0 {
        patterns
            .iter()
            .map(|p| p.average_return * p.usage_count as f64)
            .sum::<f64>()
            / usage_count as f64
    } else {
        0.0
    };

    let mut merged = TradingPattern::new(
        first.exchange,
        first.symbol.clone(),
        first.timeframe,
        first.action,
        first.pattern_type,
        conditions,
        confidence,
    );
    merged.usage_count = usage_count;
    merged.success_count = success_count;
    merged.average_return = average_return;
    merged.tags = tags;
    Ok(merged)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: f64, max: f64) -> IndicatorPredicate {
        IndicatorPredicate::Range { min, max }
    }

    fn pattern(conditions: HashMap<String, IndicatorPredicate>) -> TradingPattern {
        TradingPattern::new(
            Exchange::Binance,
            "BTCUSDT",
            CandleInterval::OneHour,
            SignalAction::Buy,
            PatternType::OversoldReversal,
            conditions,
            0.7,
        )
    }

    #[test]
    fn predicate_matching() {
        assert!(range(25.0, 35.0).matches(30.0));
        assert!(!range(25.0, 35.0).matches(36.0));
        assert!(IndicatorPredicate::Above { threshold: 0.0 }.matches(0.1));
        assert!(!IndicatorPredicate::Above { threshold: 0.0 }.matches(0.0));
        assert!(IndicatorPredicate::Below { threshold: 30.0 }.matches(29.0));
        assert!(IndicatorPredicate::Point { value: 100.0 }.matches(100.05));
        assert!(!IndicatorPredicate::Point { value: 100.0 }.matches(101.0));
    }

    #[test]
    fn predicate_overlap() {
        assert!(range(0.0, 10.0).overlaps(&range(5.0, 15.0)));
        assert!(!range(0.0, 10.0).overlaps(&range(10.1, 15.0)));
        assert!(range(0.0, 10.0).overlaps(&IndicatorPredicate::Above { threshold: 9.0 }));
        assert!(IndicatorPredicate::Below { threshold: 5.0 }
            .overlaps(&IndicatorPredicate::Above { threshold: 4.0 }));
        assert!(!IndicatorPredicate::Below { threshold: 4.0 }
            .overlaps(&IndicatorPredicate::Above { threshold: 5.0 }));
    }

    #[test]
    fn predicate_union_canonical_forms() {
        assert_eq!(range(0.0, 5.0).union(&range(3.0, 10.0)), range(0.0, 10.0));
        assert_eq!(
            IndicatorPredicate::Above { threshold: 5.0 }
                .union(&IndicatorPredicate::Above { threshold: 3.0 }),
            IndicatorPredicate::Above { threshold: 3.0 }
        );
        assert_eq!(
            range(0.0, 5.0).union(&IndicatorPredicate::Below { threshold: -1.0 }),
            IndicatorPredicate::Below { threshold: 5.0 }
        );
        assert_eq!(
            IndicatorPredicate::Point { value: 2.0 }
                .union(&IndicatorPredicate::Point { value: 2.0 }),
            IndicatorPredicate::Point { value: 2.0 }
        );
    }

    #[test]
    fn success_rate_and_invariant() {
        let mut p = pattern(HashMap::new());
        assert_eq!(p.success_rate(), 0.0);
        p.record_outcome(true, 10.0);
        p.record_outcome(false, -5.0);
        assert_eq!(p.usage_count, 2);
        assert_eq!(p.success_count, 1);
        assert!(p.success_count <= p.usage_count);
        assert!((p.success_rate() - 0.5).abs() < f64::EPSILON);
        assert!((p.average_return - 2.5).abs() < f64::EPSILON);
        assert!(p.last_used_at.is_some());
    }

    #[test]
    fn effective_confidence_monotonic_in_usage() {
        let mut p = pattern(HashMap::new());
        p.confidence = 0.6;
        let mut last = p.effective_confidence();
        for _ in 0..30 {
            p.record_outcome(true, 5.0);
            let current = p.effective_confidence();
            assert!(current >= last, "confidence regressed with more wins");
            assert!(current <= 1.0);
            last = current;
        }
        assert!(last > 0.6);
    }

    #[test]
    fn effective_confidence_capped_at_one() {
        let mut p = pattern(HashMap::new());
        p.confidence = 0.95;
        for _ in 0..200 {
            p.record_outcome(true, 5.0);
        }
        assert!((p.effective_confidence() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn unused_pattern_keeps_base_confidence() {
        let p = pattern(HashMap::new());
        assert!((p.effective_confidence() - p.confidence).abs() < 1e-12);
    }

    #[test]
    fn merge_requires_two() {
        let p = pattern(HashMap::new());
        assert!(merge_patterns(std::slice::from_ref(&p)).is_err());
    }

    #[test]
    fn merge_rejects_dissimilar() {
        let a = pattern(HashMap::from([("RSI_14".to_string(), range(20.0, 30.0))]));
        let b = pattern(HashMap::from([("RSI_14".to_string(), range(60.0, 70.0))]));
        assert!(merge_patterns(&[a, b]).is_err());
    }

    #[test]
    fn merge_unions_ranges_and_means_confidence() {
        let mut a = pattern(HashMap::from([("RSI_14".to_string(), range(20.0, 32.0))]));
        a.confidence = 0.6;
        a.tags.insert("fast".to_string());
        let mut b = pattern(HashMap::from([
            ("RSI_14".to_string(), range(28.0, 40.0)),
            ("MACD".to_string(), range(-0.01, 0.01)),
        ]));
        b.confidence = 0.8;

        let merged = merge_patterns(&[a, b]).unwrap();
        assert_eq!(merged.conditions["RSI_14"], range(20.0, 40.0));
        // MACD defined on one side only: carried over unchanged.
        assert_eq!(merged.conditions["MACD"], range(-0.01, 0.01));
        assert!((merged.confidence - 0.7).abs() < 1e-12);
        assert!(merged.tags.contains("merged"));
        assert!(merged.tags.contains("fast"));
    }

    #[test]
    fn merge_is_idempotent_over_the_same_set() {
        let a = pattern(HashMap::from([("RSI_14".to_string(), range(20.0, 32.0))]));
        let b = pattern(HashMap::from([("RSI_14".to_string(), range(28.0, 40.0))]));

        let once = merge_patterns(&[a.clone(), b.clone()]).unwrap();
        let twice = merge_patterns(&[a, b]).unwrap();
        assert_eq!(once.conditions, twice.conditions);
        assert!((once.confidence - twice.confidence).abs() < 1e-12);
    }

    #[test]
    fn undefined_indicator_is_compatible() {
        let a = pattern(HashMap::from([("RSI_14".to_string(), range(20.0, 30.0))]));
        let b = pattern(HashMap::from([("MACD".to_string(), range(0.0, 1.0))]));
        assert!(a.is_merge_similar(&b));
        assert!(b.is_merge_similar(&a));
    }
}
