// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   MACD line   = EMA_fast(closes) - EMA_slow(closes)
//   Signal line = EMA_signal(MACD line)
//   Histogram   = MACD line - Signal line
//
// Standard parameters are (12, 26, 9). A positive histogram marks momentum
// continuation; a sign flip marks a momentum turn.
// =============================================================================

use super::ema::ema_series;

/// Aligned MACD output. All three vectors end at the latest close; `macd` is
/// longer than `signal`/`histogram` by `signal_period - 1` at the front.
#[derive(Debug, Clone, PartialEq)]
pub struct MacdSeries {
    pub macd: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

impl MacdSeries {
    /// Latest (macd, signal, histogram) triple, if all three exist.
    pub fn latest(&self) -> Option<(f64, f64, f64)> {
        Some((
            *self.macd.last()?,
            *self.signal.last()?,
            *self.histogram.last()?,
        ))
    }
}

/// Compute MACD over `closes`.
///
/// # Edge cases
/// - any period of zero => empty series
/// - `fast_period >= slow_period` => empty series (degenerate definition)
/// - not enough closes for the slow EMA plus the signal EMA => empty series
pub fn macd_series(
    closes: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> MacdSeries {
    let empty = MacdSeries {
        macd: Vec::new(),
        signal: Vec::new(),
        histogram: Vec::new(),
    };

    if fast_period == 0 || slow_period == 0 || signal_period == 0 {
        return empty;
    }
    if fast_period >= slow_period {
        return empty;
    }
    if closes.len() < slow_period + signal_period {
        return empty;
    }

    let fast = ema_series(closes, fast_period);
    let slow = ema_series(closes, slow_period);
    if fast.is_empty() || slow.is_empty() {
        return empty;
    }

    // Both series end at the latest close; align their tails.
    let len = fast.len().min(slow.len());
    let fast_tail = &fast[fast.len() - len..];
    let slow_tail = &slow[slow.len() - len..];

    let macd: Vec<f64> = fast_tail
        .iter()
        .zip(slow_tail.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal = ema_series(&macd, signal_period);
    if signal.is_empty() {
        return empty;
    }

    let histogram: Vec<f64> = macd[macd.len() - signal.len()..]
        .iter()
        .zip(signal.iter())
        .map(|(m, s)| m - s)
        .collect();

    MacdSeries {
        macd,
        signal,
        histogram,
    }
}
