// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Weights recent closes more heavily than the SMA:
//
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first value is seeded with the SMA of the first `period` closes. Used
// as the fast leg of the trend-following crossover and inside MACD.
// =============================================================================

/// Compute the EMA series over `closes` with the given look-back `period`.
///
/// The first output element corresponds to the close at index `period - 1`.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `closes.len() < period` => empty vec
/// - A non-finite value terminates the series; a broken tail is never
///   returned.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);

    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(seed);

    let mut prev = seed;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }

    result
}

/// Most recent EMA value, if the series is computable.
pub fn latest_ema(closes: &[f64], period: usize) -> Option<f64> {
    ema_series(closes, period).last().copied()
}
