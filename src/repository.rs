// =============================================================================
// Repository ports — durable storage behind narrow trait interfaces
// =============================================================================
//
// The core depends only on these signatures. Any relational store with
// ordered transactions satisfies them; the bundled `InMemoryRepository` is
// the reference implementation used in demo mode and tests. Runtime objects
// never pin repository rows — everything is copied in and out.
//
// The in-memory store enforces the same constraints the conceptual schema
// declares (status enum, leverage in [1, 125], confidence bounds), so a later
// swap to SQL keeps identical failure behaviour.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TraderConfig;
use crate::error::{ErrorKind, Result};
use crate::pattern::TradingPattern;
use crate::types::{PersistedStatus, TradeSide};

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Persisted trader row. Carries the full validated config so that recovery
/// can reconstruct a worker without guessing defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderRecord {
    pub id: String,
    pub name: String,
    pub status: PersistedStatus,
    pub config: TraderConfig,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_active_at: Option<i64>,
}

/// Lifecycle status of a persisted trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Open,
    Closed,
    Cancelled,
}

/// Persisted trade row. Entry indicator values ride along so that closed
/// winning trades can seed pattern extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub trader_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub status: TradeStatus,
    pub quantity: f64,
    pub leverage: u32,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub entry_indicators: HashMap<String, f64>,
    pub matched_pattern_id: Option<String>,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Durable storage of trader rows.
pub trait TraderStore: Send + Sync {
    /// Persist a new trader. Fails `LimitExceeded` when the store refuses
    /// more rows and `InvalidArgument` on constraint violations.
    fn create(&self, config: &TraderConfig, initial_balance: f64) -> Result<String>;
    fn find_by_id(&self, id: &str) -> Result<Option<TraderRecord>>;
    fn find_all(&self) -> Result<Vec<TraderRecord>>;
    fn find_active(&self) -> Result<Vec<TraderRecord>>;
    fn count(&self) -> Result<usize>;
    /// Authoritative cap check: `count() < limit`.
    fn can_create_more(&self, limit: usize) -> Result<bool>;
    fn update_status(&self, id: &str, status: PersistedStatus) -> Result<()>;
    fn update_balance(&self, id: &str, current_balance: f64) -> Result<()>;
    fn update_configuration(&self, id: &str, config: &TraderConfig) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
}

/// Durable storage of trades.
pub trait TradeStore: Send + Sync {
    fn create(&self, trade: TradeRecord) -> Result<String>;
    fn find_by_id(&self, id: &str) -> Result<Option<TradeRecord>>;
    fn find_by_trader(&self, trader_id: &str) -> Result<Vec<TradeRecord>>;
    fn find_open(&self) -> Result<Vec<TradeRecord>>;
    /// Mark a trade closed with its exit economics.
    fn close(&self, id: &str, exit_price: f64, pnl: f64, pnl_percent: f64) -> Result<()>;
    fn delete_by_trader(&self, trader_id: &str) -> Result<usize>;
}

/// Durable storage of learned patterns.
pub trait PatternStore: Send + Sync {
    fn save(&self, pattern: &TradingPattern) -> Result<String>;
    fn find_by_id(&self, id: &str) -> Result<Option<TradingPattern>>;
    fn find_all(&self) -> Result<Vec<TradingPattern>>;
    fn update(&self, pattern: &TradingPattern) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Reference repository backed by `parking_lot` maps. Constraint checks
/// mirror the conceptual schema so swapping in a SQL store changes nothing
/// observable.
pub struct InMemoryRepository {
    traders: RwLock<HashMap<String, TraderRecord>>,
    trades: RwLock<HashMap<String, TradeRecord>>,
    patterns: RwLock<HashMap<String, TradingPattern>>,
    /// Hard row cap, mirroring a `canCreateMore` storage policy. `None`
    /// disables the store-side cap (the supervisor still enforces its own).
    trader_row_cap: Option<usize>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            traders: RwLock::new(HashMap::new()),
            trades: RwLock::new(HashMap::new()),
            patterns: RwLock::new(HashMap::new()),
            trader_row_cap: None,
        }
    }

    /// Store-side row cap used to exercise the "repository refuses" path.
    pub fn with_trader_cap(cap: usize) -> Self {
        Self {
            trader_row_cap: Some(cap),
            ..Self::new()
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl TraderStore for InMemoryRepository {
    fn create(&self, config: &TraderConfig, initial_balance: f64) -> Result<String> {
        if !(1..=125).contains(&config.leverage) {
            return Err(ErrorKind::InvalidArgument(
                "Leverage must be between 1 and 125".into(),
            ));
        }
        if initial_balance < 0.0 {
            return Err(ErrorKind::InvalidArgument(
                "Initial balance cannot be negative".into(),
            ));
        }

        let mut traders = self.traders.write();

        if let Some(cap) = self.trader_row_cap {
            if traders.len() >= cap {
                return Err(ErrorKind::LimitExceeded(format!(
                    "trader store refuses more than {cap} rows"
                )));
            }
        }
        if traders.contains_key(&config.id) {
            return Err(ErrorKind::InvalidArgument(format!(
                "trader {} already exists",
                config.id
            )));
        }

        let now = Utc::now().timestamp_millis();
        let record = TraderRecord {
            id: config.id.clone(),
            name: config.name.clone(),
            status: PersistedStatus::Stopped,
            config: config.clone(),
            initial_balance,
            current_balance: initial_balance,
            created_at: now,
            updated_at: now,
            last_active_at: None,
        };
        traders.insert(config.id.clone(), record);

        debug!(trader_id = %config.id, "trader row created");
        Ok(config.id.clone())
    }

    fn find_by_id(&self, id: &str) -> Result<Option<TraderRecord>> {
        Ok(self.traders.read().get(id).cloned())
    }

    fn find_all(&self) -> Result<Vec<TraderRecord>> {
        let mut rows: Vec<TraderRecord> = self.traders.read().values().cloned().collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    fn find_active(&self) -> Result<Vec<TraderRecord>> {
        Ok(TraderStore::find_all(self)?
            .into_iter()
            .filter(|r| matches!(r.status, PersistedStatus::Active | PersistedStatus::Paused))
            .collect())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.traders.read().len())
    }

    fn can_create_more(&self, limit: usize) -> Result<bool> {
        Ok(self.count()? < limit)
    }

    fn update_status(&self, id: &str, status: PersistedStatus) -> Result<()> {
        let mut traders = self.traders.write();
        let record = traders
            .get_mut(id)
            .ok_or_else(|| ErrorKind::NotFound(format!("trader {id}")))?;
        record.status = status;
        let now = Utc::now().timestamp_millis();
        record.updated_at = now;
        if status == PersistedStatus::Active {
            record.last_active_at = Some(now);
        }
        Ok(())
    }

    fn update_balance(&self, id: &str, current_balance: f64) -> Result<()> {
        let mut traders = self.traders.write();
        let record = traders
            .get_mut(id)
            .ok_or_else(|| ErrorKind::NotFound(format!("trader {id}")))?;
        record.current_balance = current_balance;
        record.updated_at = Utc::now().timestamp_millis();
        Ok(())
    }

    fn update_configuration(&self, id: &str, config: &TraderConfig) -> Result<()> {
        if config.id != id {
            return Err(ErrorKind::InvariantViolation(
                "config id does not match the stored row".into(),
            ));
        }
        let mut traders = self.traders.write();
        let record = traders
            .get_mut(id)
            .ok_or_else(|| ErrorKind::NotFound(format!("trader {id}")))?;
        record.config = config.clone();
        record.name = config.name.clone();
        record.updated_at = Utc::now().timestamp_millis();
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.traders
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ErrorKind::NotFound(format!("trader {id}")))?;
        info!(trader_id = %id, "trader row deleted");
        Ok(())
    }
}

impl TradeStore for InMemoryRepository {
    fn create(&self, mut trade: TradeRecord) -> Result<String> {
        if trade.id.is_empty() {
            trade.id = Uuid::new_v4().to_string();
        }
        if !(1..=125).contains(&trade.leverage) {
            return Err(ErrorKind::InvalidArgument(
                "Leverage must be between 1 and 125".into(),
            ));
        }
        let id = trade.id.clone();
        self.trades.write().insert(id.clone(), trade);
        Ok(id)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<TradeRecord>> {
        Ok(self.trades.read().get(id).cloned())
    }

    fn find_by_trader(&self, trader_id: &str) -> Result<Vec<TradeRecord>> {
        let mut rows: Vec<TradeRecord> = self
            .trades
            .read()
            .values()
            .filter(|t| t.trader_id == trader_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.opened_at);
        Ok(rows)
    }

    fn find_open(&self) -> Result<Vec<TradeRecord>> {
        Ok(self
            .trades
            .read()
            .values()
            .filter(|t| t.status == TradeStatus::Open)
            .cloned()
            .collect())
    }

    fn close(&self, id: &str, exit_price: f64, pnl: f64, pnl_percent: f64) -> Result<()> {
        let mut trades = self.trades.write();
        let trade = trades
            .get_mut(id)
            .ok_or_else(|| ErrorKind::NotFound(format!("trade {id}")))?;
        if trade.status != TradeStatus::Open {
            return Err(ErrorKind::BadState(format!(
                "trade {id} is not open (status {:?})",
                trade.status
            )));
        }
        trade.status = TradeStatus::Closed;
        trade.exit_price = Some(exit_price);
        trade.pnl = pnl;
        trade.pnl_percent = pnl_percent;
        trade.closed_at = Some(Utc::now().timestamp_millis());
        Ok(())
    }

    fn delete_by_trader(&self, trader_id: &str) -> Result<usize> {
        let mut trades = self.trades.write();
        let ids: Vec<String> = trades
            .values()
            .filter(|t| t.trader_id == trader_id)
            .map(|t| t.id.clone())
            .collect();
        for id in &ids {
            trades.remove(id);
        }
        Ok(ids.len())
    }
}

impl PatternStore for InMemoryRepository {
    fn save(&self, pattern: &TradingPattern) -> Result<String> {
        if !(0.0..=1.0).contains(&pattern.confidence) {
            return Err(ErrorKind::InvalidArgument(
                "Pattern confidence must be within [0, 1]".into(),
            ));
        }
        if pattern.success_count > pattern.usage_count {
            return Err(ErrorKind::InvalidArgument(
                "Pattern success count cannot exceed usage count".into(),
            ));
        }
        self.patterns
            .write()
            .insert(pattern.id.clone(), pattern.clone());
        Ok(pattern.id.clone())
    }

    fn find_by_id(&self, id: &str) -> Result<Option<TradingPattern>> {
        Ok(self.patterns.read().get(id).cloned())
    }

    fn find_all(&self) -> Result<Vec<TradingPattern>> {
        let mut rows: Vec<TradingPattern> = self.patterns.read().values().cloned().collect();
        rows.sort_by_key(|p| p.created_at);
        Ok(rows)
    }

    fn update(&self, pattern: &TradingPattern) -> Result<()> {
        let mut patterns = self.patterns.write();
        if !patterns.contains_key(&pattern.id) {
            return Err(ErrorKind::NotFound(format!("pattern {}", pattern.id)));
        }
        patterns.insert(pattern.id.clone(), pattern.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.patterns
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ErrorKind::NotFound(format!("pattern {id}")))
    }
}
