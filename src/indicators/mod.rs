// =============================================================================
// Technical indicators — pure kernels plus a per-worker computation cache
// =============================================================================
//
// The kernels are side-effect-free functions over ordered close sequences;
// every public function forces callers to handle insufficient-data and
// numerical-edge-case scenarios.
//
// `IndicatorEngine` sits between the trading loop and the kernels: results
// are cached by `(indicator, last_close_time)` so a loop iteration that saw
// no new closed candle skips recomputation entirely.
// =============================================================================

pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;

use std::collections::HashMap;

use crate::exchange::Candle;

/// Bollinger standard-deviation multiplier used throughout the service.
const BOLLINGER_NUM_STD: f64 = 2.0;

// ---------------------------------------------------------------------------
// Indicator declaration
// ---------------------------------------------------------------------------

/// A single indicator request, parameterised by its look-back periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorKind {
    Sma(usize),
    Ema(usize),
    Rsi(usize),
    Macd {
        fast: usize,
        slow: usize,
        signal: usize,
    },
    Bollinger {
        period: usize,
    },
}

impl IndicatorKind {
    /// Minimum number of closes required before the kernel produces output.
    pub fn min_data_points(&self) -> usize {
        match self {
            Self::Sma(p) | Self::Ema(p) => *p,
            Self::Rsi(p) => p + 1,
            Self::Macd { slow, signal, .. } => slow + signal,
            Self::Bollinger { period } => *period,
        }
    }

    /// Canonical output keys this indicator writes into the value map.
    pub fn output_keys(&self) -> Vec<String> {
        match self {
            Self::Sma(p) => vec![format!("SMA_{p}")],
            Self::Ema(p) => vec![format!("EMA_{p}")],
            Self::Rsi(p) => vec![format!("RSI_{p}")],
            Self::Macd { .. } => vec![
                "MACD".to_string(),
                "MACD_SIGNAL".to_string(),
                "MACD_HIST".to_string(),
            ],
            Self::Bollinger { .. } => vec![
                "BB_UPPER".to_string(),
                "BB_MIDDLE".to_string(),
                "BB_LOWER".to_string(),
                "BB_WIDTH".to_string(),
                "BB_PERCENT_B".to_string(),
            ],
        }
    }
}

/// Largest minimum-history requirement across a set of indicators.
pub fn required_history(kinds: &[IndicatorKind]) -> usize {
    kinds
        .iter()
        .map(IndicatorKind::min_data_points)
        .max()
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Computed values
// ---------------------------------------------------------------------------

/// Latest and previous indicator values keyed by canonical name. `previous`
/// holds the value one closed candle earlier, used for cross detection.
#[derive(Debug, Clone, Default)]
pub struct IndicatorSet {
    pub latest: HashMap<String, f64>,
    pub previous: HashMap<String, f64>,
}

impl IndicatorSet {
    pub fn latest_value(&self, key: &str) -> Option<f64> {
        self.latest.get(key).copied()
    }

    pub fn previous_value(&self, key: &str) -> Option<f64> {
        self.previous.get(key).copied()
    }
}

// ---------------------------------------------------------------------------
// Engine (per-worker cache)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    last_close_time: i64,
    latest: Vec<(String, f64)>,
    previous: Vec<(String, f64)>,
}

/// Per-worker indicator computation cache. Not shared across workers; reset
/// whenever the worker's config changes.
#[derive(Debug, Default)]
pub struct IndicatorEngine {
    cache: HashMap<IndicatorKind, CacheEntry>,
}

impl IndicatorEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all cached series (config change or manual reset).
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    /// Compute (or reuse) every requested indicator over `candles`.
    ///
    /// Candles must already be validated and chronological; the engine only
    /// looks at closes and the final `close_time`.
    pub fn compute(&mut self, kinds: &[IndicatorKind], candles: &[Candle]) -> IndicatorSet {
        let mut set = IndicatorSet::default();
        let Some(last_close_time) = candles.last().map(|c| c.close_time) else {
            return set;
        };
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        for kind in kinds {
            let cached = self
                .cache
                .get(kind)
                .filter(|entry| entry.last_close_time == last_close_time)
                .cloned();
            let entry = match cached {
                Some(entry) => entry,
                None => {
                    let (latest, previous) = Self::compute_kind(kind, &closes);
                    let entry = CacheEntry {
                        last_close_time,
                        latest,
                        previous,
                    };
                    self.cache.insert(*kind, entry.clone());
                    entry
                }
            };

            for (key, value) in entry.latest {
                set.latest.insert(key, value);
            }
            for (key, value) in entry.previous {
                set.previous.insert(key, value);
            }
        }

        set
    }

    /// Run one kernel, returning (latest, previous) keyed value lists.
    fn compute_kind(kind: &IndicatorKind, closes: &[f64]) -> (Vec<(String, f64)>, Vec<(String, f64)>) {
        let mut latest = Vec::new();
        let mut previous = Vec::new();

        let mut push_pair = |key: String, series: &[f64]| {
            if let Some(&value) = series.last() {
                latest.push((key.clone(), value));
            }
            if series.len() >= 2 {
                previous.push((key, series[series.len() - 2]));
            }
        };

        match kind {
            IndicatorKind::Sma(p) => {
                push_pair(format!("SMA_{p}"), &sma::sma_series(closes, *p));
            }
            IndicatorKind::Ema(p) => {
                push_pair(format!("EMA_{p}"), &ema::ema_series(closes, *p));
            }
            IndicatorKind::Rsi(p) => {
                push_pair(format!("RSI_{p}"), &rsi::rsi_series(closes, *p));
            }
            IndicatorKind::Macd { fast, slow, signal } => {
                let series = macd::macd_series(closes, *fast, *slow, *signal);
                push_pair("MACD".to_string(), &series.macd);
                push_pair("MACD_SIGNAL".to_string(), &series.signal);
                push_pair("MACD_HIST".to_string(), &series.histogram);
            }
            IndicatorKind::Bollinger { period } => {
                if let Some(bands) =
                    bollinger::bollinger_bands(closes, *period, BOLLINGER_NUM_STD)
                {
                    latest.push(("BB_UPPER".to_string(), bands.upper));
                    latest.push(("BB_MIDDLE".to_string(), bands.middle));
                    latest.push(("BB_LOWER".to_string(), bands.lower));
                    latest.push(("BB_WIDTH".to_string(), bands.width));
                    latest.push(("BB_PERCENT_B".to_string(), bands.percent_b));
                }
                // Bands over the window ending one candle earlier.
                if closes.len() > *period {
                    if let Some(bands) = bollinger::bollinger_bands(
                        &closes[..closes.len() - 1],
                        *period,
                        BOLLINGER_NUM_STD,
                    ) {
                        previous.push(("BB_UPPER".to_string(), bands.upper));
                        previous.push(("BB_MIDDLE".to_string(), bands.middle));
                        previous.push(("BB_LOWER".to_string(), bands.lower));
                        previous.push(("BB_WIDTH".to_string(), bands.width));
                        previous.push(("BB_PERCENT_B".to_string(), bands.percent_b));
                    }
                }
            }
        }

        (latest, previous)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                open_time: i as i64 * 60_000,
                close_time: i as i64 * 60_000 + 59_999,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
                is_closed: true,
            })
            .collect()
    }

    #[test]
    fn min_data_points_per_kind() {
        assert_eq!(IndicatorKind::Sma(20).min_data_points(), 20);
        assert_eq!(IndicatorKind::Rsi(14).min_data_points(), 15);
        assert_eq!(
            IndicatorKind::Macd {
                fast: 12,
                slow: 26,
                signal: 9
            }
            .min_data_points(),
            35
        );
        assert_eq!(
            required_history(&[IndicatorKind::Sma(20), IndicatorKind::Rsi(14)]),
            20
        );
        assert_eq!(required_history(&[]), 0);
    }

    #[test]
    fn engine_computes_all_requested_keys() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        let mut engine = IndicatorEngine::new();
        let set = engine.compute(
            &[
                IndicatorKind::Sma(10),
                IndicatorKind::Ema(10),
                IndicatorKind::Rsi(14),
                IndicatorKind::Macd {
                    fast: 12,
                    slow: 26,
                    signal: 9,
                },
                IndicatorKind::Bollinger { period: 20 },
            ],
            &candles(&closes),
        );

        for key in [
            "SMA_10",
            "EMA_10",
            "RSI_14",
            "MACD",
            "MACD_SIGNAL",
            "MACD_HIST",
            "BB_UPPER",
            "BB_MIDDLE",
            "BB_LOWER",
            "BB_WIDTH",
            "BB_PERCENT_B",
        ] {
            assert!(set.latest_value(key).is_some(), "missing {key}");
        }
        assert!(set.previous_value("SMA_10").is_some());
    }

    #[test]
    fn cache_hit_on_unchanged_last_close() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let series = candles(&closes);
        let mut engine = IndicatorEngine::new();

        let first = engine.compute(&[IndicatorKind::Sma(10)], &series);
        let second = engine.compute(&[IndicatorKind::Sma(10)], &series);
        assert_eq!(
            first.latest_value("SMA_10"),
            second.latest_value("SMA_10")
        );
        assert_eq!(engine.cache.len(), 1);
    }

    #[test]
    fn cache_invalidated_by_new_candle() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let mut engine = IndicatorEngine::new();
        let before = engine.compute(&[IndicatorKind::Sma(10)], &candles(&closes));

        let mut extended = closes.clone();
        extended.push(99.0);
        let after = engine.compute(&[IndicatorKind::Sma(10)], &candles(&extended));

        assert_ne!(
            before.latest_value("SMA_10"),
            after.latest_value("SMA_10")
        );
        // The previous value of the extended series is the old latest.
        assert_eq!(
            after.previous_value("SMA_10"),
            before.latest_value("SMA_10")
        );
    }

    #[test]
    fn reset_clears_cache() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let mut engine = IndicatorEngine::new();
        engine.compute(&[IndicatorKind::Sma(10)], &candles(&closes));
        assert!(!engine.cache.is_empty());
        engine.reset();
        assert!(engine.cache.is_empty());
    }

    #[test]
    fn empty_candles_produce_empty_set() {
        let mut engine = IndicatorEngine::new();
        let set = engine.compute(&[IndicatorKind::Sma(10)], &[]);
        assert!(set.latest.is_empty());
    }
}
