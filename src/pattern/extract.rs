// =============================================================================
// Pattern extraction — learning from closed winning trades
// =============================================================================
//
// A trade qualifies for extraction when it is closed, profitable, and its
// return is at least the minimum profit percent. The extracted pattern
// captures the entry indicator neighbourhood:
//
//   RSI   -> [rsi - 5, rsi + 5] clamped to [0, 100]
//   MACD  -> [macd - 0.001, macd + 0.001]
//   PRICE -> entry price ± 2 %
//
// The pattern type is assigned by fixed priority: oversold RSI, overbought
// RSI, SMA trend alignment, positive MACD, else custom.
// =============================================================================

use std::collections::HashMap;

use tracing::debug;

use crate::repository::{TradeRecord, TradeStatus};
use crate::types::{CandleInterval, Exchange, SignalAction, TradeSide};

use super::model::{IndicatorPredicate, PatternType, TradingPattern};

/// Minimum profit percent a closed trade needs to seed a pattern.
const MIN_PROFIT_PERCENT: f64 = 1.0;
/// Half-width of the extracted RSI range.
const RSI_HALF_WIDTH: f64 = 5.0;
/// Half-width of the extracted MACD range.
const MACD_HALF_WIDTH: f64 = 0.001;
/// Entry price range half-width as a fraction.
const PRICE_HALF_WIDTH: f64 = 0.02;
/// Confidence assigned to a freshly extracted pattern.
const INITIAL_CONFIDENCE: f64 = 0.7;

/// Whether a trade is eligible to seed a pattern.
pub fn is_extractable(trade: &TradeRecord) -> bool {
    trade.status == TradeStatus::Closed
        && trade.pnl > 0.0
        && trade.pnl_percent >= MIN_PROFIT_PERCENT
}

/// First RSI value in the entry indicators, regardless of period key.
fn entry_rsi(indicators: &HashMap<String, f64>) -> Option<(String, f64)> {
    indicators
        .iter()
        .find(|(key, _)| key.starts_with("RSI"))
        .map(|(key, value)| (key.clone(), *value))
}

/// Shortest- and longest-period SMA values present, if at least two exist.
fn entry_sma_pair(indicators: &HashMap<String, f64>) -> Option<(f64, f64)> {
    let mut smas: Vec<(usize, f64)> = indicators
        .iter()
        .filter_map(|(key, value)| {
            let period: usize = key.strip_prefix("SMA_")?.parse().ok()?;
            Some((period, *value))
        })
        .collect();
    if smas.len() < 2 {
        return None;
    }
    smas.sort_by_key(|(period, _)| *period);
    Some((smas.first()?.1, smas.last()?.1))
}

/// Classify by fixed priority over the entry indicators.
fn classify(indicators: &HashMap<String, f64>) -> PatternType {
    if let Some((_, rsi)) = entry_rsi(indicators) {
        if rsi < 35.0 {
            return PatternType::OversoldReversal;
        }
        if rsi > 65.0 {
            return PatternType::OverboughtReversal;
        }
    }
    if let Some((short, long)) = entry_sma_pair(indicators) {
        if short > long {
            return PatternType::TrendFollowing;
        }
    }
    if indicators.get("MACD").copied().unwrap_or(0.0) > 0.0 {
        return PatternType::MomentumContinuation;
    }
    PatternType::Custom
}

/// Extract a pattern from a closed winning trade, or `None` when the trade
/// is not eligible.
pub fn extract_pattern(
    trade: &TradeRecord,
    exchange: Exchange,
    timeframe: CandleInterval,
) -> Option<TradingPattern> {
    if !is_extractable(trade) {
        return None;
    }

    let mut conditions = HashMap::new();

    if let Some((key, rsi)) = entry_rsi(&trade.entry_indicators) {
        conditions.insert(
            key,
            IndicatorPredicate::Range {
                min: (rsi - RSI_HALF_WIDTH).max(0.0),
                max: (rsi + RSI_HALF_WIDTH).min(100.0),
            },
        );
    }

    if let Some(&macd) = trade.entry_indicators.get("MACD") {
        conditions.insert(
            "MACD".to_string(),
            IndicatorPredicate::Range {
                min: macd - MACD_HALF_WIDTH,
                max: macd + MACD_HALF_WIDTH,
            },
        );
    }

    if trade.entry_price > 0.0 {
        conditions.insert(
            "PRICE".to_string(),
            IndicatorPredicate::Range {
                min: trade.entry_price * (1.0 - PRICE_HALF_WIDTH),
                max: trade.entry_price * (1.0 + PRICE_HALF_WIDTH),
            },
        );
    }

    let action = match trade.side {
        TradeSide::Long => SignalAction::Buy,
        TradeSide::Short => SignalAction::Sell,
    };

    let pattern_type = classify(&trade.entry_indicators);

    let mut pattern = TradingPattern::new(
        exchange,
        trade.symbol.clone(),
        timeframe,
        action,
        pattern_type,
        conditions,
        INITIAL_CONFIDENCE,
    );
    pattern.tags.insert("extracted".to_string());

    debug!(
        trade_id = %trade.id,
        pattern_id = %pattern.id,
        pattern_type = %pattern_type,
        "pattern extracted from winning trade"
    );

    Some(pattern)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn winning_trade(indicators: &[(&str, f64)]) -> TradeRecord {
        TradeRecord {
            id: "trade-1".into(),
            trader_id: "t1".into(),
            symbol: "BTCUSDT".into(),
            side: TradeSide::Long,
            status: TradeStatus::Closed,
            quantity: 1.0,
            leverage: 1,
            entry_price: 100.0,
            exit_price: Some(103.0),
            pnl: 3.0,
            pnl_percent: 3.0,
            entry_indicators: indicators
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            matched_pattern_id: None,
            opened_at: Utc::now().timestamp_millis(),
            closed_at: Some(Utc::now().timestamp_millis()),
        }
    }

    #[test]
    fn losing_trade_is_not_extractable() {
        let mut trade = winning_trade(&[]);
        trade.pnl = -1.0;
        trade.pnl_percent = -1.0;
        assert!(!is_extractable(&trade));
        assert!(extract_pattern(&trade, Exchange::Binance, CandleInterval::OneHour).is_none());
    }

    #[test]
    fn small_win_is_not_extractable() {
        let mut trade = winning_trade(&[]);
        trade.pnl = 0.5;
        trade.pnl_percent = 0.5;
        assert!(!is_extractable(&trade));
    }

    #[test]
    fn open_trade_is_not_extractable() {
        let mut trade = winning_trade(&[]);
        trade.status = TradeStatus::Open;
        assert!(!is_extractable(&trade));
    }

    #[test]
    fn rsi_range_is_clamped() {
        let trade = winning_trade(&[("RSI_14", 3.0)]);
        let pattern =
            extract_pattern(&trade, Exchange::Binance, CandleInterval::OneHour).unwrap();
        assert_eq!(
            pattern.conditions["RSI_14"],
            IndicatorPredicate::Range { min: 0.0, max: 8.0 }
        );
    }

    #[test]
    fn macd_and_price_ranges() {
        let trade = winning_trade(&[("MACD", 0.005)]);
        let pattern =
            extract_pattern(&trade, Exchange::Binance, CandleInterval::OneHour).unwrap();
        assert_eq!(
            pattern.conditions["MACD"],
            IndicatorPredicate::Range {
                min: 0.004,
                max: 0.006
            }
        );
        assert_eq!(
            pattern.conditions["PRICE"],
            IndicatorPredicate::Range {
                min: 98.0,
                max: 102.0
            }
        );
        assert!((pattern.confidence - INITIAL_CONFIDENCE).abs() < 1e-12);
        assert!(pattern.tags.contains("extracted"));
    }

    #[test]
    fn classification_priority() {
        // Oversold RSI wins over everything.
        let t = winning_trade(&[("RSI_14", 20.0), ("MACD", 1.0), ("SMA_10", 5.0), ("SMA_30", 1.0)]);
        assert_eq!(
            extract_pattern(&t, Exchange::Binance, CandleInterval::OneHour)
                .unwrap()
                .pattern_type,
            PatternType::OversoldReversal
        );

        // Overbought next.
        let t = winning_trade(&[("RSI_14", 80.0), ("MACD", 1.0)]);
        assert_eq!(
            extract_pattern(&t, Exchange::Binance, CandleInterval::OneHour)
                .unwrap()
                .pattern_type,
            PatternType::OverboughtReversal
        );

        // SMA alignment beats MACD.
        let t = winning_trade(&[("RSI_14", 50.0), ("SMA_10", 110.0), ("SMA_30", 100.0), ("MACD", 0.5)]);
        assert_eq!(
            extract_pattern(&t, Exchange::Binance, CandleInterval::OneHour)
                .unwrap()
                .pattern_type,
            PatternType::TrendFollowing
        );

        // Positive MACD.
        let t = winning_trade(&[("RSI_14", 50.0), ("MACD", 0.5)]);
        assert_eq!(
            extract_pattern(&t, Exchange::Binance, CandleInterval::OneHour)
                .unwrap()
                .pattern_type,
            PatternType::MomentumContinuation
        );

        // Nothing matches.
        let t = winning_trade(&[("RSI_14", 50.0), ("MACD", -0.5)]);
        assert_eq!(
            extract_pattern(&t, Exchange::Binance, CandleInterval::OneHour)
                .unwrap()
                .pattern_type,
            PatternType::Custom
        );
    }

    #[test]
    fn short_trade_extracts_sell_pattern() {
        let mut trade = winning_trade(&[("RSI_14", 75.0)]);
        trade.side = TradeSide::Short;
        let pattern =
            extract_pattern(&trade, Exchange::Binance, CandleInterval::OneHour).unwrap();
        assert_eq!(pattern.action, SignalAction::Sell);
    }
}
