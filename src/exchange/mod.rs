// =============================================================================
// Exchange adapter port — market data, orders and balances behind one trait
// =============================================================================
//
// Adapters wrap exchange-specific wire protocols. The core only sees the
// `ExchangeAdapter` capability set; symbol normalisation is the adapter's
// responsibility. Adapters are shared per exchange through the
// `CachingAdapterFactory` and must be internally thread-safe.
//
// Credential hygiene: before an exchange is reconfigured, the factory
// disconnects and evicts the cached instance so stale flags (demo vs
// production) can never leak into the next connection.
// =============================================================================

pub mod binance;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{ErrorKind, Result};
use crate::types::{CandleInterval, Exchange, TradeSide};

// ---------------------------------------------------------------------------
// Market data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

/// Last-trade snapshot for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: i64,
}

/// Aggregated order book (price, quantity) levels, best first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub timestamp: i64,
}

/// Balance for a single asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

// ---------------------------------------------------------------------------
// Order types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// Order request handed to an adapter. `price == None` means market order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub price: Option<f64>,
    pub client_order_id: String,
}

/// Exchange acknowledgement of a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub executed_quantity: f64,
    pub price: f64,
    pub status: OrderStatus,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Adapter settings
// ---------------------------------------------------------------------------

/// Connection settings handed to `configure`. The secret never appears in
/// Debug output or logs.
#[derive(Clone, Default)]
pub struct AdapterSettings {
    pub api_key: String,
    pub api_secret: String,
    /// Demo adapters simulate fills instead of placing real orders.
    pub demo: bool,
    /// Per-operation timeout; `None` uses the adapter default of 10 s.
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for AdapterSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSettings")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("demo", &self.demo)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Adapter port
// ---------------------------------------------------------------------------

/// Capability set every exchange adapter provides. All methods are
/// cancellable at their await points and bounded by the configured
/// per-operation timeout.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;

    /// Apply new settings. Callers go through
    /// [`CachingAdapterFactory::reconfigure`] so the cached instance is
    /// released first.
    async fn configure(&self, settings: AdapterSettings) -> Result<()>;

    async fn get_candles(
        &self,
        symbol: &str,
        interval: CandleInterval,
        start: Option<i64>,
        end: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;
    async fn get_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBook>;
    async fn get_balance(&self) -> Result<Vec<Balance>>;

    async fn place_order(&self, order: OrderRequest) -> Result<PlacedOrder>;
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()>;
    async fn get_order(&self, order_id: &str, symbol: &str) -> Result<PlacedOrder>;

    /// Live candle feed. The receiver is closed when the adapter disconnects.
    async fn subscribe_candles(
        &self,
        symbol: &str,
        interval: CandleInterval,
    ) -> Result<mpsc::Receiver<Candle>>;

    /// Live ticker feed. Optional capability.
    async fn subscribe_ticker(&self, symbol: &str) -> Result<mpsc::Receiver<Ticker>> {
        Err(ErrorKind::Unavailable(format!(
            "{} adapter does not stream tickers for {symbol}",
            self.exchange()
        )))
    }

    /// Live order-update feed. Optional capability.
    async fn subscribe_orders(&self) -> Result<mpsc::Receiver<PlacedOrder>> {
        Err(ErrorKind::Unavailable(format!(
            "{} adapter does not stream order updates",
            self.exchange()
        )))
    }

    /// Uppercase, separator-free symbol form expected by the exchange.
    fn normalize_symbol(&self, symbol: &str) -> String {
        symbol
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase()
    }
}

// ---------------------------------------------------------------------------
// Adapter provider port
// ---------------------------------------------------------------------------

/// Source of shared adapter instances. The supervisor depends on this trait
/// so tests can substitute scripted adapters.
#[async_trait]
pub trait AdapterProvider: Send + Sync {
    /// Return the shared adapter for `exchange`, creating it on first use.
    fn adapter(&self, exchange: Exchange) -> Result<Arc<dyn ExchangeAdapter>>;

    /// Disconnect and evict the cached instance for `exchange`. Required
    /// before reconfiguring to avoid cross-credential leakage.
    async fn release_adapter(&self, exchange: Exchange) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Caching factory
// ---------------------------------------------------------------------------

/// Per-exchange adapter cache. One shared instance per exchange; the
/// dispatch over [`Exchange`] is exhaustive, so a new variant cannot be
/// forgotten here.
pub struct CachingAdapterFactory {
    settings: Mutex<AdapterSettings>,
    cache: Mutex<HashMap<Exchange, Arc<dyn ExchangeAdapter>>>,
}

impl CachingAdapterFactory {
    pub fn new(settings: AdapterSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn build_adapter(&self, exchange: Exchange) -> Result<Arc<dyn ExchangeAdapter>> {
        let settings = self.settings.lock().clone();
        match exchange {
            Exchange::Binance => Ok(Arc::new(binance::BinanceAdapter::new(settings))),
            Exchange::Coinbase => Err(ErrorKind::Unavailable(
                "Coinbase adapter is not available in this build".into(),
            )),
            Exchange::Kraken => Err(ErrorKind::Unavailable(
                "Kraken adapter is not available in this build".into(),
            )),
        }
    }

    /// Release any cached instance, then swap in new settings. The next
    /// `adapter()` call builds a fresh instance with the new credentials.
    pub async fn reconfigure(&self, exchange: Exchange, settings: AdapterSettings) -> Result<()> {
        self.release_adapter(exchange).await?;
        *self.settings.lock() = settings;
        info!(exchange = %exchange, "adapter settings replaced");
        Ok(())
    }
}

#[async_trait]
impl AdapterProvider for CachingAdapterFactory {
    fn adapter(&self, exchange: Exchange) -> Result<Arc<dyn ExchangeAdapter>> {
        let mut cache = self.cache.lock();
        if let Some(adapter) = cache.get(&exchange) {
            return Ok(adapter.clone());
        }
        let adapter = self.build_adapter(exchange)?;
        cache.insert(exchange, adapter.clone());
        info!(exchange = %exchange, "adapter instance created and cached");
        Ok(adapter)
    }

    async fn release_adapter(&self, exchange: Exchange) -> Result<()> {
        let evicted = self.cache.lock().remove(&exchange);
        if let Some(adapter) = evicted {
            if let Err(e) = adapter.disconnect().await {
                warn!(exchange = %exchange, error = %e, "adapter disconnect during release failed");
            }
            info!(exchange = %exchange, "adapter released from cache");
        }
        Ok(())
    }
}

// =============================================================================
// Scripted mock adapter (test support)
// =============================================================================
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Deterministic adapter fed from a scripted candle series. Orders fill
    /// instantly at the requested (or last-close) price.
    pub struct MockAdapter {
        exchange: Exchange,
        connected: AtomicBool,
        candles: RwLock<Vec<Candle>>,
        order_seq: AtomicU64,
        pub placed_orders: RwLock<Vec<OrderRequest>>,
        /// When set, `get_candles` fails with a transient error.
        pub fail_candles: AtomicBool,
    }

    impl MockAdapter {
        pub fn new(exchange: Exchange) -> Self {
            Self {
                exchange,
                connected: AtomicBool::new(true),
                candles: RwLock::new(Vec::new()),
                order_seq: AtomicU64::new(1),
                placed_orders: RwLock::new(Vec::new()),
                fail_candles: AtomicBool::new(false),
            }
        }

        pub fn set_candles(&self, candles: Vec<Candle>) {
            *self.candles.write() = candles;
        }

        pub fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        /// Build `count` chronological closed candles walking from `start`
        /// close by `step` per candle.
        pub fn series(count: usize, start: f64, step: f64) -> Vec<Candle> {
            (0..count)
                .map(|i| {
                    let close = start + step * i as f64;
                    let open = close - step;
                    Candle {
                        open_time: (i as i64) * 60_000,
                        close_time: (i as i64) * 60_000 + 59_999,
                        open,
                        high: open.max(close) + step.abs() * 0.1,
                        low: open.min(close) - step.abs() * 0.1,
                        close,
                        volume: 100.0 + i as f64,
                        is_closed: true,
                    }
                })
                .collect()
        }
    }

    #[async_trait]
    impl ExchangeAdapter for MockAdapter {
        fn exchange(&self) -> Exchange {
            self.exchange
        }

        async fn connect(&self) -> Result<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn configure(&self, _settings: AdapterSettings) -> Result<()> {
            Ok(())
        }

        async fn get_candles(
            &self,
            _symbol: &str,
            _interval: CandleInterval,
            _start: Option<i64>,
            _end: Option<i64>,
            limit: usize,
        ) -> Result<Vec<Candle>> {
            if self.fail_candles.load(Ordering::SeqCst) {
                return Err(ErrorKind::Unavailable("scripted candle failure".into()));
            }
            let candles = self.candles.read();
            let start = candles.len().saturating_sub(limit);
            Ok(candles[start..].to_vec())
        }

        async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
            let last = self
                .candles
                .read()
                .last()
                .map(|c| c.close)
                .unwrap_or(0.0);
            Ok(Ticker {
                symbol: symbol.to_string(),
                last_price: last,
                bid: last * 0.9995,
                ask: last * 1.0005,
                timestamp: chrono::Utc::now().timestamp_millis(),
            })
        }

        async fn get_order_book(&self, symbol: &str, _limit: usize) -> Result<OrderBook> {
            let ticker = self.get_ticker(symbol).await?;
            Ok(OrderBook {
                symbol: symbol.to_string(),
                bids: vec![(ticker.bid, 1.0)],
                asks: vec![(ticker.ask, 1.0)],
                timestamp: ticker.timestamp,
            })
        }

        async fn get_balance(&self) -> Result<Vec<Balance>> {
            Ok(vec![Balance {
                asset: "USDT".into(),
                free: 100_000.0,
                locked: 0.0,
            }])
        }

        async fn place_order(&self, order: OrderRequest) -> Result<PlacedOrder> {
            let fill_price = match order.price {
                Some(p) => p,
                None => self.get_ticker(&order.symbol).await?.last_price,
            };
            let id = self.order_seq.fetch_add(1, Ordering::SeqCst);
            self.placed_orders.write().push(order.clone());
            Ok(PlacedOrder {
                order_id: id.to_string(),
                client_order_id: order.client_order_id,
                symbol: order.symbol,
                side: order.side,
                quantity: order.quantity,
                executed_quantity: order.quantity,
                price: fill_price,
                status: OrderStatus::Filled,
                timestamp: chrono::Utc::now().timestamp_millis(),
            })
        }

        async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<()> {
            Ok(())
        }

        async fn get_order(&self, order_id: &str, symbol: &str) -> Result<PlacedOrder> {
            Ok(PlacedOrder {
                order_id: order_id.to_string(),
                client_order_id: String::new(),
                symbol: symbol.to_string(),
                side: TradeSide::Long,
                quantity: 0.0,
                executed_quantity: 0.0,
                price: 0.0,
                status: OrderStatus::Filled,
                timestamp: chrono::Utc::now().timestamp_millis(),
            })
        }

        async fn subscribe_candles(
            &self,
            _symbol: &str,
            _interval: CandleInterval,
        ) -> Result<mpsc::Receiver<Candle>> {
            let (tx, rx) = mpsc::channel(16);
            for candle in self.candles.read().iter().cloned() {
                let _ = tx.try_send(candle);
            }
            Ok(rx)
        }
    }

    /// Factory returning one shared [`MockAdapter`] per exchange.
    pub struct MockAdapterFactory {
        pub adapters: Mutex<HashMap<Exchange, Arc<MockAdapter>>>,
    }

    impl MockAdapterFactory {
        pub fn new() -> Self {
            Self {
                adapters: Mutex::new(HashMap::new()),
            }
        }

        pub fn mock(&self, exchange: Exchange) -> Arc<MockAdapter> {
            self.adapters
                .lock()
                .entry(exchange)
                .or_insert_with(|| Arc::new(MockAdapter::new(exchange)))
                .clone()
        }
    }

    #[async_trait]
    impl AdapterProvider for MockAdapterFactory {
        fn adapter(&self, exchange: Exchange) -> Result<Arc<dyn ExchangeAdapter>> {
            Ok(self.mock(exchange))
        }

        async fn release_adapter(&self, exchange: Exchange) -> Result<()> {
            self.adapters.lock().remove(&exchange);
            Ok(())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_caches_one_instance_per_exchange() {
        let factory = CachingAdapterFactory::new(AdapterSettings::default());
        let a = factory.adapter(Exchange::Binance).unwrap();
        let b = factory.adapter(Exchange::Binance).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn factory_rejects_unavailable_exchanges() {
        let factory = CachingAdapterFactory::new(AdapterSettings::default());
        assert!(matches!(
            factory.adapter(Exchange::Coinbase),
            Err(ErrorKind::Unavailable(_))
        ));
        assert!(matches!(
            factory.adapter(Exchange::Kraken),
            Err(ErrorKind::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn release_evicts_cached_instance() {
        let factory = CachingAdapterFactory::new(AdapterSettings::default());
        let a = factory.adapter(Exchange::Binance).unwrap();
        factory.release_adapter(Exchange::Binance).await.unwrap();
        let b = factory.adapter(Exchange::Binance).unwrap();
        assert!(!Arc::ptr_eq(&a, &b), "release must evict the old instance");
    }

    #[tokio::test]
    async fn reconfigure_releases_before_swapping_settings() {
        let factory = CachingAdapterFactory::new(AdapterSettings {
            demo: true,
            ..AdapterSettings::default()
        });
        let old = factory.adapter(Exchange::Binance).unwrap();
        factory
            .reconfigure(
                Exchange::Binance,
                AdapterSettings {
                    demo: false,
                    ..AdapterSettings::default()
                },
            )
            .await
            .unwrap();
        let fresh = factory.adapter(Exchange::Binance).unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
    }

    #[test]
    fn settings_debug_redacts_secrets() {
        let settings = AdapterSettings {
            api_key: "key".into(),
            api_secret: "secret".into(),
            demo: true,
            timeout: None,
        };
        let debug = format!("{settings:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn mock_adapter_series_is_chronological() {
        let adapter = mock::MockAdapter::new(Exchange::Binance);
        adapter.set_candles(mock::MockAdapter::series(50, 100.0, 1.0));
        let candles = adapter
            .get_candles("BTCUSDT", CandleInterval::OneMinute, None, None, 100)
            .await
            .unwrap();
        assert_eq!(candles.len(), 50);
        for pair in candles.windows(2) {
            assert!(pair[0].close_time < pair[1].open_time + 60_000);
            assert!(pair[0].open_time < pair[1].open_time);
        }
    }

    #[test]
    fn symbol_normalisation() {
        let adapter = mock::MockAdapter::new(Exchange::Binance);
        assert_eq!(adapter.normalize_symbol("btc/usdt"), "BTCUSDT");
        assert_eq!(adapter.normalize_symbol("BTC-USDT"), "BTCUSDT");
        assert_eq!(adapter.normalize_symbol("BTCUSDT"), "BTCUSDT");
    }
}
