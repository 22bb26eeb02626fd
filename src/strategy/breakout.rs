// =============================================================================
// Breakout strategy — range escape with volume confirmation
// =============================================================================
//
// Resistance and support are the highest high / lowest low over the look-back
// window (excluding the candle being evaluated). BUY when the close escapes
// above resistance, SELL when it breaks below support — but only when volume
// runs hot relative to the window average, since a thin-volume escape is
// usually a fake-out.
// =============================================================================

use tracing::debug;

use crate::exchange::Candle;
use crate::indicators::{IndicatorKind, IndicatorSet};
use crate::types::{SignalAction, StrategyKind};

use super::{Signal, Strategy};

/// High/low look-back window.
const WINDOW: usize = 20;
/// Volume must exceed the window average by this factor.
const VOLUME_FACTOR: f64 = 1.5;
/// Breakout distance (fraction of the broken level) at which confidence
/// saturates.
const DISTANCE_SATURATION: f64 = 0.02;
/// Confidence floor for a volume-confirmed breakout.
const BASE_CONFIDENCE: f64 = 0.55;

#[derive(Debug, Default)]
pub struct Breakout;

impl Breakout {
    fn confidence(distance_fraction: f64, volume_ratio: f64) -> f64 {
        let distance = (distance_fraction / DISTANCE_SATURATION).clamp(0.0, 1.0);
        // Volume beyond the confirmation factor keeps adding up to +0.15.
        let volume = ((volume_ratio - VOLUME_FACTOR) / VOLUME_FACTOR).clamp(0.0, 1.0);
        (BASE_CONFIDENCE + 0.3 * distance + 0.15 * volume).min(1.0)
    }
}

impl Strategy for Breakout {
    fn name(&self) -> &'static str {
        "breakout"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Breakout
    }

    fn required_indicators(&self) -> Vec<IndicatorKind> {
        // Trend context for the signal's indicator map; the range itself is
        // computed from raw candles.
        vec![IndicatorKind::Sma(WINDOW)]
    }

    fn min_candles(&self) -> usize {
        WINDOW + 1
    }

    fn generate(&self, candles: &[Candle], indicators: &IndicatorSet) -> Signal {
        if candles.len() < self.min_candles() {
            return Signal::hold("not enough candles for the range window")
                .with_indicators(indicators);
        }

        let (window, current) = candles.split_at(candles.len() - 1);
        let window = &window[window.len() - WINDOW..];
        let current = &current[0];

        let resistance = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let support = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let avg_volume = window.iter().map(|c| c.volume).sum::<f64>() / WINDOW as f64;

        let volume_ratio = if avg_volume > 0.0 {
            current.volume / avg_volume
        } else {
            0.0
        };
        let volume_confirmed = volume_ratio >= VOLUME_FACTOR;

        debug!(
            close = current.close,
            resistance, support, volume_ratio, volume_confirmed, "breakout evaluation"
        );

        if current.close > resistance {
            if !volume_confirmed {
                return Signal::hold(format!(
                    "resistance broken without volume ({volume_ratio:.2}x < {VOLUME_FACTOR}x)"
                ))
                .with_indicators(indicators);
            }
            let distance = (current.close - resistance) / resistance;
            return Signal::new(
                SignalAction::Buy,
                Self::confidence(distance, volume_ratio),
                format!(
                    "close {:.2} above resistance {resistance:.2} on {volume_ratio:.2}x volume",
                    current.close
                ),
            )
            .with_indicators(indicators);
        }

        if current.close < support {
            if !volume_confirmed {
                return Signal::hold(format!(
                    "support broken without volume ({volume_ratio:.2}x < {VOLUME_FACTOR}x)"
                ))
                .with_indicators(indicators);
            }
            let distance = (support - current.close) / support;
            return Signal::new(
                SignalAction::Sell,
                Self::confidence(distance, volume_ratio),
                format!(
                    "close {:.2} below support {support:.2} on {volume_ratio:.2}x volume",
                    current.close
                ),
            )
            .with_indicators(indicators);
        }

        Signal::hold(format!(
            "inside range [{support:.2}, {resistance:.2}]"
        ))
        .with_indicators(indicators)
    }
}
