// =============================================================================
// Pattern service — thread-safe store of learned trading patterns
// =============================================================================
//
// One mutex guards the in-memory index; operations are short and in-memory
// except for repository round-trips. The service learns from closed winning
// trades, serves relevance-ranked matches to the trading loops, folds
// outcome feedback back into the patterns, and prunes the library.
// =============================================================================

pub mod extract;
pub mod model;
pub mod relevance;

pub use model::{merge_patterns, IndicatorPredicate, PatternType, TradingPattern};
pub use relevance::{MarketConditions, RelevanceCalculator};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, Result};
use crate::repository::{PatternStore, TradeRecord};
use crate::types::{CandleInterval, Exchange, SignalAction};

// ---------------------------------------------------------------------------
// Query / outcome / prune types
// ---------------------------------------------------------------------------

/// Filter for `query`. Every field is optional; empty criteria match all
/// active patterns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternQuery {
    pub exchange: Option<Exchange>,
    pub symbol: Option<String>,
    pub action: Option<SignalAction>,
    pub timeframe: Option<CandleInterval>,
    pub min_success_rate: Option<f64>,
    pub min_usage_count: Option<u64>,
    pub min_confidence: Option<f64>,
    /// Maximum age relative to now, milliseconds.
    pub max_age_ms: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Outcome of a trade that used a pattern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PatternOutcome {
    pub success: bool,
    pub return_amount: f64,
}

/// Deactivation criteria for `prune`. Empty criteria are a no-op.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneCriteria {
    pub max_age_ms: Option<i64>,
    pub min_success_rate: Option<f64>,
    pub min_usage_count: Option<u64>,
    /// After deactivation, keep only the top-N active patterns ranked by
    /// (success rate desc, usage desc).
    pub max_patterns: Option<usize>,
}

impl PruneCriteria {
    pub fn is_empty(&self) -> bool {
        self.max_age_ms.is_none()
            && self.min_success_rate.is_none()
            && self.min_usage_count.is_none()
            && self.max_patterns.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub deactivated: usize,
    pub retained: usize,
}

/// One relevance-ranked match result.
#[derive(Debug, Clone, Serialize)]
pub struct PatternMatch {
    pub pattern: TradingPattern,
    pub relevance: f64,
    /// `effective_confidence × relevance`.
    pub confidence: f64,
    pub matched_indicators: HashMap<String, f64>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct PatternService {
    index: Mutex<HashMap<String, TradingPattern>>,
    store: Arc<dyn PatternStore>,
}

impl PatternService {
    /// Hydrate the in-memory index from the repository.
    pub fn new(store: Arc<dyn PatternStore>) -> Result<Self> {
        let patterns = store.find_all()?;
        let count = patterns.len();
        let index = patterns.into_iter().map(|p| (p.id.clone(), p)).collect();
        info!(count, "pattern service hydrated");
        Ok(Self {
            index: Mutex::new(index),
            store,
        })
    }

    /// Persist and index a pattern; returns its stable id.
    pub fn store_pattern(&self, pattern: TradingPattern) -> Result<String> {
        let mut index = self.index.lock();
        let id = self.store.save(&pattern)?;
        index.insert(id.clone(), pattern);
        debug!(pattern_id = %id, "pattern stored");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<TradingPattern> {
        self.index.lock().get(id).cloned()
    }

    pub fn count(&self) -> usize {
        self.index.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.index.lock().values().filter(|p| p.active).count()
    }

    /// Active patterns matching the criteria, ranked by
    /// `effective_confidence × success_rate` descending.
    pub fn query(&self, criteria: &PatternQuery) -> Vec<TradingPattern> {
        let now = Utc::now().timestamp_millis();
        let index = self.index.lock();

        let mut results: Vec<TradingPattern> = index
            .values()
            .filter(|p| p.active)
            .filter(|p| criteria.exchange.map_or(true, |e| p.exchange == e))
            .filter(|p| criteria.symbol.as_deref().map_or(true, |s| p.symbol == s))
            .filter(|p| criteria.action.map_or(true, |a| p.action == a))
            .filter(|p| criteria.timeframe.map_or(true, |t| p.timeframe == t))
            .filter(|p| {
                criteria
                    .min_success_rate
                    .map_or(true, |min| p.success_rate() >= min)
            })
            .filter(|p| {
                criteria
                    .min_usage_count
                    .map_or(true, |min| p.usage_count >= min)
            })
            .filter(|p| {
                criteria
                    .min_confidence
                    .map_or(true, |min| p.effective_confidence() >= min)
            })
            .filter(|p| {
                criteria
                    .max_age_ms
                    .map_or(true, |max_age| now - p.created_at <= max_age)
            })
            .filter(|p| criteria.tags.iter().all(|tag| p.tags.contains(tag)))
            .cloned()
            .collect();

        results.sort_by(|a, b| {
            b.ranking_score()
                .partial_cmp(&a.ranking_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results
    }

    /// Relevance-ranked matches for the given market snapshot. Only active
    /// patterns for the same exchange and symbol are candidates.
    pub fn match_conditions(
        &self,
        conditions: &MarketConditions,
        min_relevance: f64,
        max_results: usize,
    ) -> Vec<PatternMatch> {
        let index = self.index.lock();

        let mut matches: Vec<PatternMatch> = index
            .values()
            .filter(|p| {
                p.active && p.exchange == conditions.exchange && p.symbol == conditions.symbol
            })
            .filter_map(|p| {
                let relevance = RelevanceCalculator::score(p, conditions);
                if relevance < min_relevance {
                    return None;
                }
                Some(PatternMatch {
                    relevance,
                    confidence: p.effective_confidence() * relevance,
                    matched_indicators: RelevanceCalculator::matched_indicators(p, conditions),
                    pattern: p.clone(),
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(max_results);
        matches
    }

    /// Fold a trade outcome into the pattern. `NotFound` leaves everything
    /// unchanged.
    pub fn update_performance(&self, pattern_id: &str, outcome: PatternOutcome) -> Result<()> {
        let mut index = self.index.lock();
        let pattern = index
            .get_mut(pattern_id)
            .ok_or_else(|| ErrorKind::NotFound(format!("pattern {pattern_id}")))?;

        pattern.record_outcome(outcome.success, outcome.return_amount);
        self.store.update(pattern)?;

        debug!(
            pattern_id,
            success = outcome.success,
            usage = pattern.usage_count,
            success_rate = pattern.success_rate(),
            "pattern performance updated"
        );
        Ok(())
    }

    /// Deactivate patterns meeting any criterion, then retain only the
    /// top-N when `max_patterns` is set. Empty criteria are a no-op.
    pub fn prune(&self, criteria: &PruneCriteria) -> Result<PruneReport> {
        if criteria.is_empty() {
            let retained = self.active_count();
            return Ok(PruneReport {
                deactivated: 0,
                retained,
            });
        }

        let now = Utc::now().timestamp_millis();
        let mut index = self.index.lock();
        let mut deactivated = 0usize;

        for pattern in index.values_mut().filter(|p| p.active) {
            let too_old = criteria
                .max_age_ms
                .map_or(false, |max_age| now - pattern.created_at > max_age);
            let underperforming = criteria.min_success_rate.map_or(false, |min| {
                pattern.usage_count > 0 && pattern.success_rate() < min
            });
            let underused = criteria
                .min_usage_count
                .map_or(false, |min| pattern.usage_count < min);

            if too_old || underperforming || underused {
                pattern.active = false;
                deactivated += 1;
                self.store.update(pattern)?;
            }
        }

        // Top-N retention among the survivors.
        if let Some(max_patterns) = criteria.max_patterns {
            let mut active_ids: Vec<(String, f64, u64)> = index
                .values()
                .filter(|p| p.active)
                .map(|p| (p.id.clone(), p.success_rate(), p.usage_count))
                .collect();
            active_ids.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.2.cmp(&a.2))
            });

            for (id, _, _) in active_ids.into_iter().skip(max_patterns) {
                if let Some(pattern) = index.get_mut(&id) {
                    pattern.active = false;
                    deactivated += 1;
                    self.store.update(pattern)?;
                }
            }
        }

        let retained = index.values().filter(|p| p.active).count();
        info!(deactivated, retained, "pattern prune complete");
        Ok(PruneReport {
            deactivated,
            retained,
        })
    }

    /// Extract and store a pattern from a closed winning trade. Returns the
    /// new pattern id, or `None` when the trade is not eligible.
    pub fn learn_from_trade(
        &self,
        trade: &TradeRecord,
        exchange: Exchange,
        timeframe: CandleInterval,
    ) -> Result<Option<String>> {
        let Some(pattern) = extract::extract_pattern(trade, exchange, timeframe) else {
            return Ok(None);
        };
        let id = self.store_pattern(pattern)?;
        info!(trade_id = %trade.id, pattern_id = %id, "pattern learned from winning trade");
        Ok(Some(id))
    }

    /// Merge clusters of ≥ 2 merge-similar active patterns. Sources are
    /// deactivated and replaced by the merged pattern. Returns the number of
    /// merges performed.
    pub fn merge_similar(&self) -> Result<usize> {
        let mut index = self.index.lock();

        // Group candidates by the identity triple first; similarity within a
        // group still requires range overlap.
        let mut groups: HashMap<(Exchange, String, SignalAction), Vec<String>> = HashMap::new();
        for pattern in index.values().filter(|p| p.active) {
            groups
                .entry((pattern.exchange, pattern.symbol.clone(), pattern.action))
                .or_default()
                .push(pattern.id.clone());
        }

        let mut merges = 0usize;
        for ids in groups.values() {
            if ids.len() < 2 {
                continue;
            }
            let members: Vec<TradingPattern> =
                ids.iter().filter_map(|id| index.get(id).cloned()).collect();

            // Greedy cluster around the first member.
            let cluster: Vec<TradingPattern> = members
                .iter()
                .filter(|p| members[0].is_merge_similar(p))
                .cloned()
                .collect();
            if cluster.len() < 2 {
                continue;
            }

            match merge_patterns(&cluster) {
                Ok(merged) => {
                    for source in &cluster {
                        if let Some(p) = index.get_mut(&source.id) {
                            p.active = false;
                            self.store.update(p)?;
                        }
                    }
                    let id = self.store.save(&merged)?;
                    index.insert(id, merged);
                    merges += 1;
                }
                Err(e) => {
                    warn!(error = %e, "pattern merge skipped");
                }
            }
        }

        if merges > 0 {
            info!(merges, "similar patterns merged");
        }
        Ok(merges)
    }
}
