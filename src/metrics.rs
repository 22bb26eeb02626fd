// =============================================================================
// Trader metrics — per-worker performance counters
// =============================================================================
//
// Counters are mutated from the trading loop and the supervisor's stop path;
// everything sits behind one mutex and is read through a derived snapshot.
//
// Invariants: winning + losing <= total (zero-PnL trades count as neither);
// totalProfit and totalLoss are absolute magnitudes, so
// netProfit = totalProfit - totalLoss.
// =============================================================================

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use crate::strategy::Signal;
use crate::types::SignalAction;

#[derive(Debug, Default)]
struct Inner {
    total_trades: u64,
    winning_trades: u64,
    losing_trades: u64,
    total_profit: f64,
    total_loss: f64,
    signals_executed: u64,
    close_signals_executed: u64,
    last_signal_action: Option<SignalAction>,
    last_signal_confidence: f64,
    last_signal_time: Option<i64>,
    /// Milliseconds since epoch of the most recent start.
    start_time: Option<i64>,
}

/// Thread-safe metrics holder owned by one worker.
#[derive(Debug, Default)]
pub struct TraderMetrics {
    inner: Mutex<Inner>,
}

/// Read-only metrics view with all derived values materialised.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub total_profit: f64,
    pub total_loss: f64,
    pub net_profit: f64,
    /// In [0, 1]; 0 when no trades yet.
    pub win_rate: f64,
    /// `None` when no losses have been recorded (undefined ratio).
    pub profit_factor: Option<f64>,
    pub average_profit: f64,
    pub average_loss: f64,
    pub signals_executed: u64,
    pub close_signals_executed: u64,
    pub last_signal_action: Option<SignalAction>,
    pub last_signal_confidence: f64,
    pub last_signal_time: Option<i64>,
    pub start_time: Option<i64>,
    pub uptime_secs: Option<u64>,
}

impl TraderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp the start time (called on every start).
    pub fn mark_started(&self) {
        self.inner.lock().start_time = Some(Utc::now().timestamp_millis());
    }

    pub fn mark_stopped(&self) {
        self.inner.lock().start_time = None;
    }

    /// Record a realised trade result.
    pub fn record_trade(&self, pnl: f64) {
        let mut inner = self.inner.lock();
        inner.total_trades += 1;
        if pnl > 0.0 {
            inner.winning_trades += 1;
            inner.total_profit += pnl;
        } else if pnl < 0.0 {
            inner.losing_trades += 1;
            inner.total_loss += pnl.abs();
        }
    }

    /// Record an emitted signal (executed or not, it is the latest opinion).
    pub fn record_signal(&self, signal: &Signal) {
        let mut inner = self.inner.lock();
        inner.last_signal_action = Some(signal.action);
        inner.last_signal_confidence = signal.confidence;
        inner.last_signal_time = Some(signal.timestamp);
    }

    pub fn record_execution(&self) {
        self.inner.lock().signals_executed += 1;
    }

    pub fn record_close_execution(&self) {
        self.inner.lock().close_signals_executed += 1;
    }

    pub fn last_signal_time(&self) -> Option<i64> {
        self.inner.lock().last_signal_time
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();

        let win_rate = if inner.total_trades == 0 {
            0.0
        } else {
            inner.winning_trades as f64 / inner.total_trades as f64
        };
        let profit_factor = if inner.total_loss > 0.0 {
            Some(inner.total_profit / inner.total_loss)
        } else {
            None
        };
        let average_profit = if inner.winning_trades > 0 {
            inner.total_profit / inner.winning_trades as f64
        } else {
            0.0
        };
        let average_loss = if inner.losing_trades > 0 {
            inner.total_loss / inner.losing_trades as f64
        } else {
            0.0
        };
        let uptime_secs = inner
            .start_time
            .map(|start| ((Utc::now().timestamp_millis() - start).max(0) / 1000) as u64);

        MetricsSnapshot {
            total_trades: inner.total_trades,
            winning_trades: inner.winning_trades,
            losing_trades: inner.losing_trades,
            total_profit: inner.total_profit,
            total_loss: inner.total_loss,
            net_profit: inner.total_profit - inner.total_loss,
            win_rate,
            profit_factor,
            average_profit,
            average_loss,
            signals_executed: inner.signals_executed,
            close_signals_executed: inner.close_signals_executed,
            last_signal_action: inner.last_signal_action,
            last_signal_confidence: inner.last_signal_confidence,
            last_signal_time: inner.last_signal_time,
            start_time: inner.start_time,
            uptime_secs,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_metrics_are_zero() {
        let metrics = TraderMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.total_trades, 0);
        assert_eq!(snap.win_rate, 0.0);
        assert!(snap.profit_factor.is_none());
        assert!(snap.uptime_secs.is_none());
    }

    #[test]
    fn trade_counters_stay_consistent() {
        let metrics = TraderMetrics::new();
        metrics.record_trade(10.0);
        metrics.record_trade(-4.0);
        metrics.record_trade(6.0);
        metrics.record_trade(0.0); // counts as neither win nor loss

        let snap = metrics.snapshot();
        assert_eq!(snap.total_trades, 4);
        assert_eq!(snap.winning_trades, 2);
        assert_eq!(snap.losing_trades, 1);
        assert!(snap.winning_trades + snap.losing_trades <= snap.total_trades);

        assert!((snap.total_profit - 16.0).abs() < 1e-12);
        assert!((snap.total_loss - 4.0).abs() < 1e-12);
        assert!((snap.net_profit - 12.0).abs() < 1e-12);
        assert!((snap.win_rate - 0.5).abs() < 1e-12);
        assert!((snap.profit_factor.unwrap() - 4.0).abs() < 1e-12);
        assert!((snap.average_profit - 8.0).abs() < 1e-12);
        assert!((snap.average_loss - 4.0).abs() < 1e-12);
    }

    #[test]
    fn profit_factor_undefined_without_losses() {
        let metrics = TraderMetrics::new();
        metrics.record_trade(10.0);
        assert!(metrics.snapshot().profit_factor.is_none());
    }

    #[test]
    fn signals_update_last_seen() {
        let metrics = TraderMetrics::new();
        let signal = Signal::new(SignalAction::Buy, 0.8, "cross");
        metrics.record_signal(&signal);
        metrics.record_execution();
        metrics.record_close_execution();

        let snap = metrics.snapshot();
        assert_eq!(snap.last_signal_action, Some(SignalAction::Buy));
        assert!((snap.last_signal_confidence - 0.8).abs() < 1e-12);
        assert_eq!(snap.last_signal_time, Some(signal.timestamp));
        assert_eq!(snap.signals_executed, 1);
        assert_eq!(snap.close_signals_executed, 1);
    }

    #[test]
    fn uptime_derives_from_start_time() {
        let metrics = TraderMetrics::new();
        metrics.mark_started();
        let snap = metrics.snapshot();
        assert!(snap.uptime_secs.is_some());
        metrics.mark_stopped();
        assert!(metrics.snapshot().uptime_secs.is_none());
    }
}
