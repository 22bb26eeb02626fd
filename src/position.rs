// =============================================================================
// Positions — managed positions and the PositionManager port
// =============================================================================
//
// A `ManagedPosition` is created by a trading loop on signal execution,
// mutated only by price updates and the risk engine's stop logic, and
// destroyed on close. The `PositionManager` port routes opens and closes
// through the exchange adapter, persists trade rows, and publishes position
// telemetry.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, Result};
use crate::exchange::{AdapterProvider, OrderRequest};
use crate::repository::{TradeRecord, TradeStatus, TradeStore};
use crate::telemetry::{TelemetryBus, TelemetryEvent};
use crate::types::{Exchange, TradeSide};

/// Trailing stop distance as a fraction of the best seen price.
const TRAILING_STOP_PCT: f64 = 0.005;
/// Favourable move (fraction of entry) that arms the trailing stop.
const TRAILING_ARM_PCT: f64 = 0.01;

// ---------------------------------------------------------------------------
// Close reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Signal,
    StopLoss,
    TakeProfit,
    TrailingStop,
    EmergencyStop,
    TraderStopped,
    MaxDuration,
    Manual,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "SIGNAL"),
            Self::StopLoss => write!(f, "STOP_LOSS"),
            Self::TakeProfit => write!(f, "TAKE_PROFIT"),
            Self::TrailingStop => write!(f, "TRAILING_STOP"),
            Self::EmergencyStop => write!(f, "EMERGENCY_STOP"),
            Self::TraderStopped => write!(f, "TRADER_STOPPED"),
            Self::MaxDuration => write!(f, "MAX_DURATION"),
            Self::Manual => write!(f, "MANUAL"),
        }
    }
}

// ---------------------------------------------------------------------------
// ManagedPosition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedPosition {
    pub position_id: String,
    pub trader_id: String,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub leverage: u32,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    #[serde(default)]
    pub trailing_stop_activated: bool,
    /// Best price seen since open (highest for longs, lowest for shorts).
    #[serde(default)]
    pub best_price: f64,
    pub opened_at: i64,
    /// Repository row backing this position.
    pub trade_id: String,
    #[serde(default)]
    pub entry_indicators: HashMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_pattern_id: Option<String>,
}

impl ManagedPosition {
    /// Exposure: `|quantity × current_price| × max(1, leverage)`.
    pub fn notional_value(&self) -> f64 {
        (self.quantity * self.current_price).abs() * self.leverage.max(1) as f64
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.side.direction() * (self.current_price - self.entry_price) * self.quantity
    }

    pub fn unrealized_pnl_percent(&self) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        self.side.direction() * (self.current_price - self.entry_price) / self.entry_price * 100.0
    }
}

/// Result of closing a position.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedPosition {
    pub position: ManagedPosition,
    pub exit_price: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub reason: CloseReason,
}

/// Everything a trading loop supplies when opening a position.
#[derive(Debug, Clone)]
pub struct OpenPositionRequest {
    pub trader_id: String,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    /// Limit price; `None` places a market order.
    pub price: Option<f64>,
    pub leverage: u32,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub entry_indicators: HashMap<String, f64>,
    pub matched_pattern_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Position lifecycle port used by the trading loops and the risk engine.
#[async_trait]
pub trait PositionManager: Send + Sync {
    async fn open_position(&self, request: OpenPositionRequest) -> Result<ManagedPosition>;
    async fn close_position(&self, position_id: &str, reason: CloseReason)
        -> Result<ClosedPosition>;
    async fn close_all_for_trader(
        &self,
        trader_id: &str,
        reason: CloseReason,
    ) -> Result<Vec<ClosedPosition>>;

    fn open_positions(&self) -> Vec<ManagedPosition>;
    fn positions_for_trader(&self, trader_id: &str) -> Vec<ManagedPosition>;

    /// Refresh `current_price` for every open position on `symbol`,
    /// maintaining best-price tracking and the trailing stop.
    fn update_price(&self, symbol: &str, price: f64);
}

// ---------------------------------------------------------------------------
// Live implementation
// ---------------------------------------------------------------------------

/// Adapter-backed position manager. One instance serves the whole fleet.
pub struct LivePositionManager {
    adapters: Arc<dyn AdapterProvider>,
    trades: Arc<dyn TradeStore>,
    bus: Arc<TelemetryBus>,
    open: RwLock<Vec<ManagedPosition>>,
}

impl LivePositionManager {
    pub fn new(
        adapters: Arc<dyn AdapterProvider>,
        trades: Arc<dyn TradeStore>,
        bus: Arc<TelemetryBus>,
    ) -> Self {
        Self {
            adapters,
            trades,
            bus,
            open: RwLock::new(Vec::new()),
        }
    }

    fn take_position(&self, position_id: &str) -> Result<ManagedPosition> {
        let mut open = self.open.write();
        let idx = open
            .iter()
            .position(|p| p.position_id == position_id)
            .ok_or_else(|| ErrorKind::NotFound(format!("position {position_id}")))?;
        Ok(open.remove(idx))
    }
}

#[async_trait]
impl PositionManager for LivePositionManager {
    async fn open_position(&self, request: OpenPositionRequest) -> Result<ManagedPosition> {
        let adapter = self.adapters.adapter(request.exchange)?;

        let order = OrderRequest {
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            price: request.price,
            client_order_id: format!("bt-{}", Uuid::new_v4()),
        };
        let placed = adapter.place_order(order).await?;
        let entry_price = if placed.price > 0.0 {
            placed.price
        } else {
            request.price.unwrap_or(0.0)
        };

        let now = Utc::now().timestamp_millis();
        let trade = TradeRecord {
            id: String::new(),
            trader_id: request.trader_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            status: TradeStatus::Open,
            quantity: request.quantity,
            leverage: request.leverage,
            entry_price,
            exit_price: None,
            pnl: 0.0,
            pnl_percent: 0.0,
            entry_indicators: request.entry_indicators.clone(),
            matched_pattern_id: request.matched_pattern_id.clone(),
            opened_at: now,
            closed_at: None,
        };
        let trade_id = self.trades.create(trade)?;

        let position = ManagedPosition {
            position_id: Uuid::new_v4().to_string(),
            trader_id: request.trader_id,
            exchange: request.exchange,
            symbol: request.symbol,
            side: request.side,
            quantity: request.quantity,
            entry_price,
            current_price: entry_price,
            leverage: request.leverage,
            stop_loss_price: request.stop_loss_price,
            take_profit_price: request.take_profit_price,
            trailing_stop_activated: false,
            best_price: entry_price,
            opened_at: now,
            trade_id,
            entry_indicators: request.entry_indicators,
            matched_pattern_id: request.matched_pattern_id,
        };

        info!(
            position_id = %position.position_id,
            trader_id = %position.trader_id,
            symbol = %position.symbol,
            side = %position.side,
            entry_price,
            quantity = position.quantity,
            leverage = position.leverage,
            "position opened"
        );

        self.open.write().push(position.clone());
        self.bus.publish(TelemetryEvent::PositionOpen {
            position: position.clone(),
            timestamp: now,
        });
        Ok(position)
    }

    async fn close_position(
        &self,
        position_id: &str,
        reason: CloseReason,
    ) -> Result<ClosedPosition> {
        let position = self.take_position(position_id)?;
        let adapter = self.adapters.adapter(position.exchange)?;

        // Close with an opposite market order; the fill price is the exit.
        let opposite = match position.side {
            TradeSide::Long => TradeSide::Short,
            TradeSide::Short => TradeSide::Long,
        };
        let order = OrderRequest {
            symbol: position.symbol.clone(),
            side: opposite,
            quantity: position.quantity,
            price: None,
            client_order_id: format!("bt-close-{}", Uuid::new_v4()),
        };

        let exit_price = match adapter.place_order(order).await {
            Ok(placed) if placed.price > 0.0 => placed.price,
            Ok(_) => position.current_price,
            Err(e) => {
                // Put the position back: the close failed and the caller
                // must observe an untouched position.
                warn!(position_id, error = %e, "close order failed");
                self.open.write().push(position);
                return Err(e);
            }
        };

        let pnl = position.side.direction() * (exit_price - position.entry_price) * position.quantity;
        let pnl_percent = if position.entry_price > 0.0 {
            position.side.direction() * (exit_price - position.entry_price)
                / position.entry_price
                * 100.0
        } else {
            0.0
        };

        if let Err(e) = self.trades.close(&position.trade_id, exit_price, pnl, pnl_percent) {
            warn!(trade_id = %position.trade_id, error = %e, "trade row close failed");
        }

        info!(
            position_id,
            reason = %reason,
            exit_price,
            pnl,
            pnl_percent,
            "position closed"
        );

        self.bus.publish(TelemetryEvent::PositionClose {
            position_id: position.position_id.clone(),
            trader_id: position.trader_id.clone(),
            symbol: position.symbol.clone(),
            pnl,
            pnl_percent,
            reason: reason.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        });

        Ok(ClosedPosition {
            position,
            exit_price,
            pnl,
            pnl_percent,
            reason,
        })
    }

    async fn close_all_for_trader(
        &self,
        trader_id: &str,
        reason: CloseReason,
    ) -> Result<Vec<ClosedPosition>> {
        let ids: Vec<String> = self
            .positions_for_trader(trader_id)
            .into_iter()
            .map(|p| p.position_id)
            .collect();

        let mut closed = Vec::with_capacity(ids.len());
        for id in ids {
            match self.close_position(&id, reason).await {
                Ok(c) => closed.push(c),
                Err(e) => warn!(position_id = %id, error = %e, "close during sweep failed"),
            }
        }
        Ok(closed)
    }

    fn open_positions(&self) -> Vec<ManagedPosition> {
        self.open.read().clone()
    }

    fn positions_for_trader(&self, trader_id: &str) -> Vec<ManagedPosition> {
        self.open
            .read()
            .iter()
            .filter(|p| p.trader_id == trader_id)
            .cloned()
            .collect()
    }

    fn update_price(&self, symbol: &str, price: f64) {
        if price <= 0.0 {
            return;
        }
        let mut updated = Vec::new();
        {
            let mut open = self.open.write();
            for position in open.iter_mut().filter(|p| p.symbol == symbol) {
                position.current_price = price;

                let improved = match position.side {
                    TradeSide::Long => price > position.best_price,
                    TradeSide::Short => price < position.best_price,
                };
                if improved {
                    position.best_price = price;

                    let armed_move = position.entry_price * TRAILING_ARM_PCT;
                    let in_profit = position.side.direction()
                        * (position.best_price - position.entry_price)
                        >= armed_move;
                    if in_profit {
                        let trail = match position.side {
                            TradeSide::Long => position.best_price * (1.0 - TRAILING_STOP_PCT),
                            TradeSide::Short => position.best_price * (1.0 + TRAILING_STOP_PCT),
                        };
                        // Only ratchet in the protective direction.
                        let better = match (position.side, position.stop_loss_price) {
                            (_, None) => true,
                            (TradeSide::Long, Some(sl)) => trail > sl,
                            (TradeSide::Short, Some(sl)) => trail < sl,
                        };
                        if better {
                            position.stop_loss_price = Some(trail);
                            position.trailing_stop_activated = true;
                            debug!(
                                position_id = %position.position_id,
                                trail,
                                "trailing stop ratcheted"
                            );
                        }
                    }
                }
                updated.push(position.clone());
            }
        }

        let now = Utc::now().timestamp_millis();
        for position in updated {
            self.bus.publish(TelemetryEvent::PositionUpdate {
                position,
                timestamp: now,
            });
        }
    }
}
