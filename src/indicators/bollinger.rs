// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period); upper/lower = middle ± k·σ over the same window.
// Width = (upper - lower) / middle (a fraction, not percent); %B locates the
// latest close inside the band: 0 at the lower band, 1 at the upper.
//
// A "squeeze" (width below a threshold) marks compressed volatility; the
// mean-reversion strategy holds during squeezes.
// =============================================================================

/// Bands for a single window, anchored at the latest close of that window.
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle.
    pub width: f64,
    /// Position of the window's final close within the band.
    pub percent_b: f64,
}

/// Compute Bollinger Bands over the most recent `period` closes.
///
/// Returns `None` when:
/// - `period == 0` or fewer than `period` closes
/// - the middle band is zero (degenerate input)
/// - any derived value is non-finite
pub fn bollinger_bands(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 || !middle.is_finite() {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle;

    let last = *window.last()?;
    let percent_b = if upper > lower {
        (last - lower) / (upper - lower)
    } else {
        0.5 // zero-width band: price sits in the middle by definition
    };

    (width.is_finite() && percent_b.is_finite()).then_some(BollingerBands {
        upper,
        middle,
        lower,
        width,
        percent_b,
    })
}
