// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
// The unweighted mean of the last `period` closes. Used as the slow leg of
// the trend-following crossover and as the Bollinger middle band.
// =============================================================================

/// Compute the SMA series over `closes` with the given look-back `period`.
///
/// The output has one value per window, so `closes.len() - period + 1`
/// entries; the last element corresponds to the latest close.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `closes.len() < period` => empty vec
/// - Non-finite sums terminate the series early.
pub fn sma_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);

    // Rolling sum: seed with the first window, then slide.
    let mut sum: f64 = closes[..period].iter().sum();
    let period_f = period as f64;

    let first = sum / period_f;
    if !first.is_finite() {
        return Vec::new();
    }
    result.push(first);

    for i in period..closes.len() {
        sum += closes[i] - closes[i - period];
        let value = sum / period_f;
        if !value.is_finite() {
            break;
        }
        result.push(value);
    }

    result
}

/// Most recent SMA value, if the series is computable.
pub fn latest_sma(closes: &[f64], period: usize) -> Option<f64> {
    sma_series(closes, period).last().copied()
}
