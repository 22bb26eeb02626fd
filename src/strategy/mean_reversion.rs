// =============================================================================
// Mean-reversion strategy — Bollinger Band touches confirmed by RSI extremes
// =============================================================================
//
// BUY when price touches the lower band while RSI reads oversold (< 30);
// SELL when price touches the upper band while RSI reads overbought (> 70).
// Confidence blends how far outside the band the price sits (%B) with how
// extreme the RSI reading is.
//
// In a squeeze (band width below the threshold) the strategy always emits a
// low-confidence HOLD: compressed volatility resolves directionally and a
// reversion bet ahead of the break is a coin flip.
// =============================================================================

use tracing::debug;

use crate::exchange::Candle;
use crate::indicators::{IndicatorKind, IndicatorSet};
use crate::types::{SignalAction, StrategyKind};

use super::{Signal, Strategy};

/// Bollinger window.
const BB_PERIOD: usize = 20;
/// RSI look-back.
const RSI_PERIOD: usize = 14;
/// RSI oversold / overbought thresholds.
const RSI_OVERSOLD: f64 = 30.0;
const RSI_OVERBOUGHT: f64 = 70.0;
/// Band width (fraction of the middle band) below which the market is in a
/// squeeze.
const SQUEEZE_WIDTH: f64 = 0.015;

#[derive(Debug, Default)]
pub struct MeanReversion;

impl MeanReversion {
    /// Blend band distance and RSI extremity into [0, 1].
    ///
    /// `band_excess` is how far %B sits beyond the touched band (0 at the
    /// band, 1 a full band-width outside); `rsi_excess` is the normalised
    /// distance past the RSI threshold.
    fn blended_confidence(band_excess: f64, rsi_excess: f64) -> f64 {
        let band = band_excess.clamp(0.0, 1.0);
        let rsi = rsi_excess.clamp(0.0, 1.0);
        0.5 + 0.25 * band + 0.25 * rsi
    }
}

impl Strategy for MeanReversion {
    fn name(&self) -> &'static str {
        "mean-reversion"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::MeanReversion
    }

    fn required_indicators(&self) -> Vec<IndicatorKind> {
        vec![
            IndicatorKind::Bollinger { period: BB_PERIOD },
            IndicatorKind::Rsi(RSI_PERIOD),
        ]
    }

    fn generate(&self, candles: &[Candle], indicators: &IndicatorSet) -> Signal {
        let rsi_key = format!("RSI_{RSI_PERIOD}");

        let (Some(upper), Some(lower), Some(width), Some(percent_b), Some(rsi)) = (
            indicators.latest_value("BB_UPPER"),
            indicators.latest_value("BB_LOWER"),
            indicators.latest_value("BB_WIDTH"),
            indicators.latest_value("BB_PERCENT_B"),
            indicators.latest_value(&rsi_key),
        ) else {
            return Signal::hold("bands or RSI not ready").with_indicators(indicators);
        };

        let Some(price) = candles.last().map(|c| c.close) else {
            return Signal::hold("no candles").with_indicators(indicators);
        };

        debug!(price, upper, lower, width, percent_b, rsi, "reversion evaluation");

        // Squeeze overrides everything.
        if width < SQUEEZE_WIDTH {
            return Signal::new(
                SignalAction::Hold,
                0.1,
                format!(
                    "squeeze: band width {:.3}% below {:.3}%",
                    width * 100.0,
                    SQUEEZE_WIDTH * 100.0
                ),
            )
            .with_indicators(indicators);
        }

        let lower_touch = price <= lower;
        let upper_touch = price >= upper;

        if lower_touch && rsi < RSI_OVERSOLD {
            let band_excess = -percent_b; // %B < 0 when below the lower band
            let rsi_excess = (RSI_OVERSOLD - rsi) / RSI_OVERSOLD;
            let confidence = Self::blended_confidence(band_excess, rsi_excess);
            return Signal::new(
                SignalAction::Buy,
                confidence,
                format!("lower band touch at RSI {rsi:.1}"),
            )
            .with_indicators(indicators);
        }

        if upper_touch && rsi > RSI_OVERBOUGHT {
            let band_excess = percent_b - 1.0; // %B > 1 when above the upper band
            let rsi_excess = (rsi - RSI_OVERBOUGHT) / (100.0 - RSI_OVERBOUGHT);
            let confidence = Self::blended_confidence(band_excess, rsi_excess);
            return Signal::new(
                SignalAction::Sell,
                confidence,
                format!("upper band touch at RSI {rsi:.1}"),
            )
            .with_indicators(indicators);
        }

        Signal::hold(format!(
            "inside bands: %B {percent_b:.2}, RSI {rsi:.1}"
        ))
        .with_indicators(indicators)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorEngine;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                open_time: i as i64 * 60_000,
                close_time: i as i64 * 60_000 + 59_999,
                open: close,
                high: close * 1.001,
                low: close * 0.999,
                close,
                volume: 10.0,
                is_closed: true,
            })
            .collect()
    }

    fn generate(closes: &[f64]) -> Signal {
        let strategy = MeanReversion;
        let series = candles(closes);
        let mut engine = IndicatorEngine::new();
        let set = engine.compute(&strategy.required_indicators(), &series);
        strategy.generate(&series, &set)
    }

    #[test]
    fn not_ready_holds() {
        let signal = generate(&[100.0; 5]);
        assert_eq!(signal.action, SignalAction::Hold);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn capitulation_emits_buy() {
        // Oscillate mildly, then sell off hard: price pierces the lower band
        // while RSI collapses below 30.
        let mut closes: Vec<f64> = (0..30)
            .map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        closes.extend([97.0, 94.0, 91.0, 88.0, 84.0, 80.0]);
        let signal = generate(&closes);
        assert_eq!(signal.action, SignalAction::Buy, "reason: {}", signal.reason);
        assert!(signal.confidence >= 0.5);
    }

    #[test]
    fn blowoff_emits_sell() {
        let mut closes: Vec<f64> = (0..30)
            .map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        closes.extend([103.0, 106.0, 109.0, 112.0, 116.0, 120.0]);
        let signal = generate(&closes);
        assert_eq!(
            signal.action,
            SignalAction::Sell,
            "reason: {}",
            signal.reason
        );
        assert!(signal.confidence >= 0.5);
    }

    #[test]
    fn squeeze_always_holds() {
        // Nearly flat prices: band width collapses below the squeeze
        // threshold, so the strategy refuses to act.
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + if i % 2 == 0 { 0.01 } else { -0.01 })
            .collect();
        let signal = generate(&closes);
        assert_eq!(signal.action, SignalAction::Hold);
        assert!((signal.confidence - 0.1).abs() < f64::EPSILON);
        assert!(signal.reason.contains("squeeze"));
    }

    #[test]
    fn band_touch_without_rsi_extreme_holds() {
        // A single sharp drop pierces the band but RSI (over 14 candles of
        // mostly-balanced movement) does not reach oversold.
        let mut closes: Vec<f64> = (0..30)
            .map(|i| 100.0 + ((i % 5) as f64 - 2.0) * 2.0)
            .collect();
        closes.push(92.0);
        let signal = generate(&closes);
        // Either inside the bands or touched without confirmation; never a
        // high-conviction reversal.
        assert_ne!(signal.action, SignalAction::Sell);
    }

    #[test]
    fn confidence_blend_bounds() {
        assert!((MeanReversion::blended_confidence(0.0, 0.0) - 0.5).abs() < f64::EPSILON);
        assert!((MeanReversion::blended_confidence(1.0, 1.0) - 1.0).abs() < f64::EPSILON);
        assert!((MeanReversion::blended_confidence(5.0, 5.0) - 1.0).abs() < f64::EPSILON);
    }
}
