// =============================================================================
// Configuration — validated trader/risk configs and hot-reloadable settings
// =============================================================================
//
// Three layers:
//   1. TraderConfig  — immutable per-worker configuration, validated at
//                      construction. Invalid values never reach the fleet.
//   2. RiskConfig    — limits enforced by the risk engine, validated once.
//   3. ServiceConfig — process-wide tunables loaded from a JSON file with an
//                      atomic tmp + rename save. Every field carries a serde
//                      default so older files keep loading.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ErrorKind, Result};
use crate::types::{CandleInterval, Exchange, StrategyKind};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_max_traders() -> usize {
    3
}

fn default_confidence_threshold() -> f64 {
    0.65
}

fn default_pattern_weight() -> f64 {
    0.3
}

fn default_pattern_min_relevance() -> f64 {
    0.6
}

fn default_pattern_max_matches() -> usize {
    5
}

fn default_adapter_timeout_secs() -> u64 {
    10
}

fn default_candle_fetch_limit() -> usize {
    100
}

fn default_leverage() -> u32 {
    1
}

// =============================================================================
// TraderConfig
// =============================================================================

/// Immutable configuration of a single trader worker.
///
/// Construct through [`TraderConfig::builder`] or [`TraderConfig::validated`];
/// both reject invalid values so a `TraderConfig` in hand is always valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderConfig {
    /// Stable identifier; survives restarts and config updates.
    pub id: String,
    pub name: String,
    pub exchange: Exchange,
    pub symbol: String,
    /// Maximum stake committed to a single position, in quote currency.
    pub max_stake_amount: f64,
    /// Risk appetite on a 1..=10 scale; feeds position sizing.
    pub max_risk_level: u8,
    /// Upper bound on how long a position may stay open.
    pub max_trading_duration_secs: u64,
    /// Minimum return (percent) a close signal must promise.
    pub min_return_percent: f64,
    pub strategy: StrategyKind,
    pub candlestick_interval: CandleInterval,
    /// Leverage applied to opened positions.
    #[serde(default = "default_leverage")]
    pub leverage: u32,
}

impl TraderConfig {
    /// Validate raw values into a `TraderConfig`.
    #[allow(clippy::too_many_arguments)]
    pub fn validated(
        id: impl Into<String>,
        name: impl Into<String>,
        exchange: Exchange,
        symbol: impl Into<String>,
        max_stake_amount: f64,
        max_risk_level: u8,
        max_trading_duration_secs: u64,
        min_return_percent: f64,
        strategy: StrategyKind,
        candlestick_interval: CandleInterval,
        leverage: u32,
    ) -> Result<Self> {
        let id = id.into();
        let name = name.into();
        let symbol = symbol.into();

        if id.trim().is_empty() {
            return Err(ErrorKind::InvalidArgument("Id cannot be blank".into()));
        }
        if name.trim().is_empty() {
            return Err(ErrorKind::InvalidArgument("Name cannot be blank".into()));
        }
        if symbol.trim().is_empty() {
            return Err(ErrorKind::InvalidArgument("Symbol cannot be blank".into()));
        }
        if max_stake_amount <= 0.0 || !max_stake_amount.is_finite() {
            return Err(ErrorKind::InvalidArgument(
                "Max stake amount must be positive".into(),
            ));
        }
        if !(1..=10).contains(&max_risk_level) {
            return Err(ErrorKind::InvalidArgument(
                "Max risk level must be between 1 and 10".into(),
            ));
        }
        if max_trading_duration_secs == 0 {
            return Err(ErrorKind::InvalidArgument(
                "Max trading duration must be positive".into(),
            ));
        }
        if min_return_percent < 0.0 || !min_return_percent.is_finite() {
            return Err(ErrorKind::InvalidArgument(
                "Min return percent cannot be negative".into(),
            ));
        }
        if !(1..=125).contains(&leverage) {
            return Err(ErrorKind::InvalidArgument(
                "Leverage must be between 1 and 125".into(),
            ));
        }

        Ok(Self {
            id,
            name,
            exchange,
            symbol,
            max_stake_amount,
            max_risk_level,
            max_trading_duration_secs,
            min_return_percent,
            strategy,
            candlestick_interval,
            leverage,
        })
    }

    /// Start a builder pre-filled with a fresh UUID id and safe defaults.
    pub fn builder(name: impl Into<String>) -> TraderConfigBuilder {
        TraderConfigBuilder::new(name)
    }

    pub fn max_trading_duration(&self) -> Duration {
        Duration::from_secs(self.max_trading_duration_secs)
    }
}

/// Builder used by the REST layer and tests; `build()` runs full validation.
#[derive(Debug, Clone)]
pub struct TraderConfigBuilder {
    id: Option<String>,
    name: String,
    exchange: Exchange,
    symbol: String,
    max_stake_amount: f64,
    max_risk_level: u8,
    max_trading_duration_secs: u64,
    min_return_percent: f64,
    strategy: StrategyKind,
    candlestick_interval: CandleInterval,
    leverage: u32,
}

impl TraderConfigBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            exchange: Exchange::Binance,
            symbol: String::new(),
            max_stake_amount: 0.0,
            max_risk_level: 5,
            max_trading_duration_secs: 24 * 3600,
            min_return_percent: 0.0,
            strategy: StrategyKind::TrendFollowing,
            candlestick_interval: CandleInterval::OneHour,
            leverage: 1,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn exchange(mut self, exchange: Exchange) -> Self {
        self.exchange = exchange;
        self
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = symbol.into();
        self
    }

    pub fn max_stake_amount(mut self, amount: f64) -> Self {
        self.max_stake_amount = amount;
        self
    }

    pub fn max_risk_level(mut self, level: u8) -> Self {
        self.max_risk_level = level;
        self
    }

    pub fn max_trading_duration_secs(mut self, secs: u64) -> Self {
        self.max_trading_duration_secs = secs;
        self
    }

    pub fn min_return_percent(mut self, pct: f64) -> Self {
        self.min_return_percent = pct;
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn candlestick_interval(mut self, interval: CandleInterval) -> Self {
        self.candlestick_interval = interval;
        self
    }

    pub fn leverage(mut self, leverage: u32) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn build(self) -> Result<TraderConfig> {
        let id = self
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        TraderConfig::validated(
            id,
            self.name,
            self.exchange,
            self.symbol,
            self.max_stake_amount,
            self.max_risk_level,
            self.max_trading_duration_secs,
            self.min_return_percent,
            self.strategy,
            self.candlestick_interval,
            self.leverage,
        )
    }
}

// =============================================================================
// RiskConfig
// =============================================================================

fn default_max_total_budget() -> f64 {
    10_000.0
}

fn default_max_leverage_per_trader() -> f64 {
    10.0
}

fn default_max_total_leverage() -> f64 {
    20.0
}

fn default_max_exposure_per_trader() -> f64 {
    5_000.0
}

fn default_max_total_exposure() -> f64 {
    20_000.0
}

fn default_max_daily_loss() -> f64 {
    500.0
}

fn default_stop_loss_percentage() -> f64 {
    5.0
}

fn default_monitoring_interval_secs() -> u64 {
    10
}

/// Limits enforced by the risk engine. All monetary limits are ≥ 0 and the
/// monitoring interval is strictly positive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_total_budget")]
    pub max_total_budget: f64,
    #[serde(default = "default_max_leverage_per_trader")]
    pub max_leverage_per_trader: f64,
    #[serde(default = "default_max_total_leverage")]
    pub max_total_leverage: f64,
    #[serde(default = "default_max_exposure_per_trader")]
    pub max_exposure_per_trader: f64,
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: f64,
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,
    /// Stop-loss distance enforced by the monitor, percent of entry price.
    #[serde(default = "default_stop_loss_percentage")]
    pub stop_loss_percentage: f64,
    #[serde(default = "default_monitoring_interval_secs")]
    pub monitoring_interval_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_total_budget: default_max_total_budget(),
            max_leverage_per_trader: default_max_leverage_per_trader(),
            max_total_leverage: default_max_total_leverage(),
            max_exposure_per_trader: default_max_exposure_per_trader(),
            max_total_exposure: default_max_total_exposure(),
            max_daily_loss: default_max_daily_loss(),
            stop_loss_percentage: default_stop_loss_percentage(),
            monitoring_interval_secs: default_monitoring_interval_secs(),
        }
    }
}

impl RiskConfig {
    /// Reject negative limits and a zero monitoring interval.
    pub fn validate(&self) -> Result<()> {
        let monetary = [
            ("max_total_budget", self.max_total_budget),
            ("max_leverage_per_trader", self.max_leverage_per_trader),
            ("max_total_leverage", self.max_total_leverage),
            ("max_exposure_per_trader", self.max_exposure_per_trader),
            ("max_total_exposure", self.max_total_exposure),
            ("max_daily_loss", self.max_daily_loss),
            ("stop_loss_percentage", self.stop_loss_percentage),
        ];
        for (field, value) in monetary {
            if value < 0.0 || !value.is_finite() {
                return Err(ErrorKind::InvalidArgument(format!(
                    "{field} cannot be negative"
                )));
            }
        }
        if self.monitoring_interval_secs == 0 {
            return Err(ErrorKind::InvalidArgument(
                "monitoring_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_secs)
    }
}

// =============================================================================
// ServiceConfig
// =============================================================================

/// Process-wide configuration loaded at startup and persisted on shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Maximum number of concurrent trader workers.
    #[serde(default = "default_max_traders")]
    pub max_traders: usize,

    /// Minimum confidence a signal needs to be executed.
    #[serde(default = "default_confidence_threshold")]
    pub signal_confidence_threshold: f64,

    /// Weight of the matched pattern when blending signal confidence.
    #[serde(default = "default_pattern_weight")]
    pub pattern_weight: f64,

    /// Minimum relevance a pattern match must reach to be considered.
    #[serde(default = "default_pattern_min_relevance")]
    pub pattern_min_relevance: f64,

    /// Maximum pattern matches requested per trading-loop iteration.
    #[serde(default = "default_pattern_max_matches")]
    pub pattern_max_matches: usize,

    /// Per-operation exchange adapter timeout.
    #[serde(default = "default_adapter_timeout_secs")]
    pub adapter_timeout_secs: u64,

    /// Candles requested per trading-loop iteration.
    #[serde(default = "default_candle_fetch_limit")]
    pub candle_fetch_limit: usize,

    /// Risk limits handed to the risk engine.
    #[serde(default)]
    pub risk: RiskConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_traders: default_max_traders(),
            signal_confidence_threshold: default_confidence_threshold(),
            pattern_weight: default_pattern_weight(),
            pattern_min_relevance: default_pattern_min_relevance(),
            pattern_max_matches: default_pattern_max_matches(),
            adapter_timeout_secs: default_adapter_timeout_secs(),
            candle_fetch_limit: default_candle_fetch_limit(),
            risk: RiskConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse service config from {}", path.display()))?;

        config
            .risk
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid risk config: {e}"))?;

        info!(
            path = %path.display(),
            max_traders = config.max_traders,
            "service config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise service config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "service config saved (atomic)");
        Ok(())
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn valid_builder() -> TraderConfigBuilder {
        TraderConfig::builder("T1")
            .symbol("BTCUSDT")
            .max_stake_amount(1000.0)
            .max_risk_level(5)
    }

    #[test]
    fn valid_config_builds() {
        let cfg = valid_builder().build().unwrap();
        assert_eq!(cfg.name, "T1");
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.exchange, Exchange::Binance);
        assert_eq!(cfg.strategy, StrategyKind::TrendFollowing);
        assert_eq!(cfg.leverage, 1);
        assert!(!cfg.id.is_empty());
    }

    #[test]
    fn negative_stake_rejected() {
        let err = valid_builder().max_stake_amount(-100.0).build().unwrap_err();
        assert_eq!(err.to_string(), "Max stake amount must be positive");
    }

    #[test]
    fn blank_symbol_rejected() {
        let err = valid_builder().symbol("").build().unwrap_err();
        assert_eq!(err.to_string(), "Symbol cannot be blank");
    }

    #[test]
    fn out_of_range_risk_rejected() {
        let err = valid_builder().max_risk_level(15).build().unwrap_err();
        assert_eq!(err.to_string(), "Max risk level must be between 1 and 10");
        let err = valid_builder().max_risk_level(0).build().unwrap_err();
        assert_eq!(err.to_string(), "Max risk level must be between 1 and 10");
    }

    #[test]
    fn blank_name_rejected() {
        let err = TraderConfig::builder("  ")
            .symbol("BTCUSDT")
            .max_stake_amount(100.0)
            .build()
            .unwrap_err();
        assert_eq!(err.to_string(), "Name cannot be blank");
    }

    #[test]
    fn zero_duration_rejected() {
        let err = valid_builder()
            .max_trading_duration_secs(0)
            .build()
            .unwrap_err();
        assert_eq!(err.to_string(), "Max trading duration must be positive");
    }

    #[test]
    fn excessive_leverage_rejected() {
        let err = valid_builder().leverage(200).build().unwrap_err();
        assert_eq!(err.to_string(), "Leverage must be between 1 and 125");
    }

    #[test]
    fn risk_config_defaults_validate() {
        RiskConfig::default().validate().unwrap();
    }

    #[test]
    fn risk_config_rejects_negative_budget() {
        let cfg = RiskConfig {
            max_total_budget: -1.0,
            ..RiskConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn risk_config_rejects_zero_interval() {
        let cfg = RiskConfig {
            monitoring_interval_secs: 0,
            ..RiskConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn service_config_deserialises_empty_json_with_defaults() {
        let cfg: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_traders, 3);
        assert!((cfg.signal_confidence_threshold - 0.65).abs() < f64::EPSILON);
        assert!((cfg.pattern_weight - 0.3).abs() < f64::EPSILON);
        assert_eq!(cfg.adapter_timeout_secs, 10);
        assert_eq!(cfg.candle_fetch_limit, 100);
    }

    #[test]
    fn service_config_roundtrip() {
        let cfg = ServiceConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: ServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.max_traders, cfg2.max_traders);
        assert_eq!(
            cfg.risk.monitoring_interval_secs,
            cfg2.risk.monitoring_interval_secs
        );
    }

    #[test]
    fn trader_config_serde_roundtrip() {
        let cfg = valid_builder().build().unwrap();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: TraderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, cfg2);
    }
}
