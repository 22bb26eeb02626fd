// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
// Measures the speed and magnitude of recent price changes on a 0..100 scale.
//
//   1. deltas from consecutive closes
//   2. seed avg gain / avg loss with the SMA of the first `period` deltas
//   3. Wilder smoothing:
//        avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//        avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//   4. RS = avg_gain / avg_loss; RSI = 100 - 100 / (1 + RS)
//
// Readings above 70 are overbought, below 30 oversold.
// =============================================================================

/// Compute the RSI series over `closes` with the given look-back `period`.
///
/// The first `period` closes are consumed seeding the averages, so the output
/// starts at close index `period`.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - fewer than `period + 1` closes => empty vec (need `period` deltas)
/// - all-gain windows clamp to 100, all-loss to 0, flat to 50
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let period_f = period as f64;

    let mut avg_gain = deltas[..period]
        .iter()
        .filter(|&&d| d > 0.0)
        .sum::<f64>()
        / period_f;
    let mut avg_loss = deltas[..period]
        .iter()
        .filter(|&&d| d < 0.0)
        .map(|d| d.abs())
        .sum::<f64>()
        / period_f;

    let mut result = Vec::with_capacity(deltas.len() - period + 1);

    match rsi_value(avg_gain, avg_loss) {
        Some(v) => result.push(v),
        None => return Vec::new(),
    }

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_value(avg_gain, avg_loss) {
            Some(v) => result.push(v),
            None => break,
        }
    }

    result
}

/// Most recent RSI value, if the series is computable.
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    rsi_series(closes, period).last().copied()
}

/// RSI from smoothed averages; `None` on a non-finite result.
fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };
    rsi.is_finite().then_some(rsi)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert!(rsi_series(&[], 14).is_empty());
    }

    #[test]
    fn period_zero() {
        assert!(rsi_series(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn needs_period_plus_one_closes() {
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(rsi_series(&closes, 14).is_empty());
        let closes: Vec<f64> = (1..=15).map(|x| x as f64).collect();
        assert_eq!(rsi_series(&closes, 14).len(), 1);
    }

    #[test]
    fn monotonic_gains_pin_to_100() {
        let closes: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        for v in rsi_series(&closes, 14) {
            assert!((v - 100.0).abs() < 1e-10);
        }
    }

    #[test]
    fn monotonic_losses_pin_to_0() {
        let closes: Vec<f64> = (1..=40).rev().map(|x| x as f64).collect();
        for v in rsi_series(&closes, 14) {
            assert!(v.abs() < 1e-10);
        }
    }

    #[test]
    fn flat_market_reads_50() {
        let closes = vec![250.0; 40];
        for v in rsi_series(&closes, 14) {
            assert!((v - 50.0).abs() < 1e-10);
        }
    }

    #[test]
    fn bounded_on_real_shaped_data() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13, 44.01, 44.90,
        ];
        let series = rsi_series(&closes, 14);
        assert!(!series.is_empty());
        for v in series {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }
}
