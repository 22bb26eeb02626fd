// =============================================================================
// Trend-following strategy — fast/slow moving-average crossover
// =============================================================================
//
// BUY when the fast EMA crosses above the slow SMA while the fast leg is
// rising; SELL on the opposite cross with a falling fast leg. Confidence
// grows with the slope magnitude of the fast leg, so a violent cross scores
// higher than a graze.
// =============================================================================

use tracing::debug;

use crate::exchange::Candle;
use crate::indicators::{IndicatorKind, IndicatorSet};
use crate::types::{SignalAction, StrategyKind};

use super::{Signal, Strategy};

/// Fast EMA period.
const FAST_PERIOD: usize = 12;
/// Slow SMA period.
const SLOW_PERIOD: usize = 26;
/// Slope (fractional per candle) at which confidence saturates.
const SLOPE_SATURATION: f64 = 0.01;
/// Confidence floor for a confirmed cross.
const BASE_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Default)]
pub struct TrendFollowing;

impl TrendFollowing {
    /// Confidence from the fast-leg slope: base plus up to 0.4 as the slope
    /// approaches saturation.
    fn confidence_from_slope(slope_fraction: f64) -> f64 {
        let normalised = (slope_fraction.abs() / SLOPE_SATURATION).min(1.0);
        BASE_CONFIDENCE + 0.4 * normalised
    }
}

impl Strategy for TrendFollowing {
    fn name(&self) -> &'static str {
        "trend-following"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::TrendFollowing
    }

    fn required_indicators(&self) -> Vec<IndicatorKind> {
        vec![
            IndicatorKind::Ema(FAST_PERIOD),
            IndicatorKind::Sma(SLOW_PERIOD),
        ]
    }

    fn min_candles(&self) -> usize {
        // One extra candle so a previous value exists for cross detection.
        SLOW_PERIOD + 1
    }

    fn generate(&self, _candles: &[Candle], indicators: &IndicatorSet) -> Signal {
        let fast_key = format!("EMA_{FAST_PERIOD}");
        let slow_key = format!("SMA_{SLOW_PERIOD}");

        let (Some(fast), Some(slow), Some(prev_fast), Some(prev_slow)) = (
            indicators.latest_value(&fast_key),
            indicators.latest_value(&slow_key),
            indicators.previous_value(&fast_key),
            indicators.previous_value(&slow_key),
        ) else {
            return Signal::hold("moving averages not ready").with_indicators(indicators);
        };

        // Fractional slope of the fast leg over the last candle.
        let slope = if prev_fast != 0.0 {
            (fast - prev_fast) / prev_fast.abs()
        } else {
            0.0
        };

        let crossed_up = prev_fast <= prev_slow && fast > slow;
        let crossed_down = prev_fast >= prev_slow && fast < slow;

        debug!(
            fast,
            slow, prev_fast, prev_slow, slope, crossed_up, crossed_down, "trend evaluation"
        );

        if crossed_up && slope > 0.0 {
            let confidence = Self::confidence_from_slope(slope);
            return Signal::new(
                SignalAction::Buy,
                confidence,
                format!(
                    "EMA{FAST_PERIOD} crossed above SMA{SLOW_PERIOD} with slope {:.4}%",
                    slope * 100.0
                ),
            )
            .with_indicators(indicators);
        }

        if crossed_down && slope < 0.0 {
            let confidence = Self::confidence_from_slope(slope);
            return Signal::new(
                SignalAction::Sell,
                confidence,
                format!(
                    "EMA{FAST_PERIOD} crossed below SMA{SLOW_PERIOD} with slope {:.4}%",
                    slope * 100.0
                ),
            )
            .with_indicators(indicators);
        }

        let stance = if fast > slow { "above" } else { "at or below" };
        Signal::hold(format!(
            "no crossover: EMA{FAST_PERIOD} {stance} SMA{SLOW_PERIOD}"
        ))
        .with_indicators(indicators)
    }
}
