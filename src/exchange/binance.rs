// =============================================================================
// Binance adapter — REST + kline WebSocket behind the ExchangeAdapter port
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the service and Binance servers.
//
// Demo mode short-circuits order placement with synthetic fills while market
// data still comes from the real public endpoints.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, Result};
use crate::types::{CandleInterval, Exchange, TradeSide};

use super::{
    AdapterSettings, Balance, Candle, ExchangeAdapter, OrderBook, OrderRequest, OrderStatus,
    PlacedOrder, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Default per-operation timeout when the settings carry none.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const REST_BASE: &str = "https://api.binance.com";
const STREAM_BASE: &str = "wss://stream.binance.com:9443";

struct Inner {
    settings: AdapterSettings,
    client: reqwest::Client,
}

/// Binance REST/WS adapter with HMAC-SHA256 request signing.
pub struct BinanceAdapter {
    inner: RwLock<Inner>,
    connected: AtomicBool,
    demo_order_seq: AtomicU64,
}

impl BinanceAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        let client = Self::build_client(&settings);
        Self {
            inner: RwLock::new(Inner { settings, client }),
            connected: AtomicBool::new(false),
            demo_order_seq: AtomicU64::new(1),
        }
    }

    fn build_client(settings: &AdapterSettings) -> reqwest::Client {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&settings.api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }
        reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(settings.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .unwrap_or_default()
    }

    fn client(&self) -> reqwest::Client {
        self.inner.read().client.clone()
    }

    fn is_demo(&self) -> bool {
        self.inner.read().settings.demo
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> Result<String> {
        let secret = self.inner.read().settings.api_secret.clone();
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| ErrorKind::Internal("HMAC key initialisation failed".into()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Full query string for a signed request (timestamp + recvWindow +
    /// signature appended).
    fn signed_query(&self, params: &str) -> Result<String> {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base)?;
        Ok(format!("{base}&signature={sig}"))
    }

    // -------------------------------------------------------------------------
    // Error mapping
    // -------------------------------------------------------------------------

    fn map_transport_err(e: reqwest::Error, op: &str) -> ErrorKind {
        if e.is_timeout() {
            ErrorKind::Timeout(format!("{op} timed out"))
        } else {
            ErrorKind::Unavailable(format!("{op} failed: {e}"))
        }
    }

    fn map_status(status: reqwest::StatusCode, op: &str, body: &serde_json::Value) -> ErrorKind {
        match status.as_u16() {
            401 | 403 => ErrorKind::AuthenticationFailed(format!("{op} rejected: {body}")),
            418 | 429 => ErrorKind::Unavailable(format!("{op} rate limited: {body}")),
            _ => ErrorKind::Unavailable(format!("{op} returned {status}: {body}")),
        }
    }

    async fn get_json(&self, url: &str, op: &str) -> Result<serde_json::Value> {
        let resp = self
            .client()
            .get(url)
            .send()
            .await
            .map_err(|e| Self::map_transport_err(e, op))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ErrorKind::Unavailable(format!("{op} returned unparsable body: {e}")))?;

        if !status.is_success() {
            return Err(Self::map_status(status, op, &body));
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Parsing helpers
    // -------------------------------------------------------------------------

    /// Binance sends numeric values as JSON strings in most payloads.
    fn as_f64(val: &serde_json::Value) -> f64 {
        match val {
            serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
            serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Parse one row of the `/api/v3/klines` array-of-arrays payload.
    fn parse_kline_row(row: &serde_json::Value) -> Option<Candle> {
        let arr = row.as_array()?;
        if arr.len() < 7 {
            return None;
        }
        Some(Candle {
            open_time: arr[0].as_i64()?,
            open: Self::as_f64(&arr[1]),
            high: Self::as_f64(&arr[2]),
            low: Self::as_f64(&arr[3]),
            close: Self::as_f64(&arr[4]),
            volume: Self::as_f64(&arr[5]),
            close_time: arr[6].as_i64()?,
            is_closed: true,
        })
    }

    /// Parse a kline event from the WebSocket stream envelope.
    fn parse_kline_event(text: &str) -> Option<Candle> {
        let root: serde_json::Value = serde_json::from_str(text).ok()?;
        let k = &root["k"];
        if k.is_null() {
            return None;
        }
        Some(Candle {
            open_time: k["t"].as_i64()?,
            close_time: k["T"].as_i64()?,
            open: Self::as_f64(&k["o"]),
            high: Self::as_f64(&k["h"]),
            low: Self::as_f64(&k["l"]),
            close: Self::as_f64(&k["c"]),
            volume: Self::as_f64(&k["v"]),
            is_closed: k["x"].as_bool().unwrap_or(false),
        })
    }

    fn demo_fill(&self, order: OrderRequest, fill_price: f64) -> PlacedOrder {
        let id = self.demo_order_seq.fetch_add(1, Ordering::SeqCst);
        PlacedOrder {
            order_id: format!("demo-{id}"),
            client_order_id: order.client_order_id,
            symbol: order.symbol,
            side: order.side,
            quantity: order.quantity,
            executed_quantity: order.quantity,
            price: fill_price,
            status: OrderStatus::Filled,
            timestamp: Self::timestamp_ms() as i64,
        }
    }

    fn parse_order(&self, body: &serde_json::Value, symbol: &str) -> PlacedOrder {
        let side = if body["side"].as_str() == Some("SELL") {
            TradeSide::Short
        } else {
            TradeSide::Long
        };
        let status = match body["status"].as_str().unwrap_or("NEW") {
            "FILLED" => OrderStatus::Filled,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "CANCELED" => OrderStatus::Cancelled,
            "REJECTED" | "EXPIRED" => OrderStatus::Rejected,
            _ => OrderStatus::New,
        };
        PlacedOrder {
            order_id: body["orderId"]
                .as_i64()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            client_order_id: body["clientOrderId"].as_str().unwrap_or("").to_string(),
            symbol: symbol.to_string(),
            side,
            quantity: Self::as_f64(&body["origQty"]),
            executed_quantity: Self::as_f64(&body["executedQty"]),
            price: Self::as_f64(&body["price"]),
            status,
            timestamp: body["transactTime"]
                .as_i64()
                .unwrap_or_else(|| Self::timestamp_ms() as i64),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn connect(&self) -> Result<()> {
        let url = format!("{REST_BASE}/api/v3/ping");
        self.get_json(&url, "GET /api/v3/ping").await?;
        self.connected.store(true, Ordering::SeqCst);
        info!("binance adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        info!("binance adapter disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn configure(&self, settings: AdapterSettings) -> Result<()> {
        let client = Self::build_client(&settings);
        let mut inner = self.inner.write();
        inner.settings = settings;
        inner.client = client;
        debug!("binance adapter reconfigured");
        Ok(())
    }

    async fn get_candles(
        &self,
        symbol: &str,
        interval: CandleInterval,
        start: Option<i64>,
        end: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let symbol = self.normalize_symbol(symbol);
        let mut url = format!(
            "{REST_BASE}/api/v3/klines?symbol={symbol}&interval={}&limit={limit}",
            interval.as_wire()
        );
        if let Some(start) = start {
            url.push_str(&format!("&startTime={start}"));
        }
        if let Some(end) = end {
            url.push_str(&format!("&endTime={end}"));
        }

        let body = self.get_json(&url, "GET /api/v3/klines").await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ErrorKind::Unavailable("klines payload is not an array".into()))?;

        Ok(rows.iter().filter_map(Self::parse_kline_row).collect())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let symbol = self.normalize_symbol(symbol);
        let url = format!("{REST_BASE}/api/v3/ticker/bookTicker?symbol={symbol}");
        let body = self.get_json(&url, "GET /api/v3/ticker/bookTicker").await?;

        let bid = Self::as_f64(&body["bidPrice"]);
        let ask = Self::as_f64(&body["askPrice"]);
        Ok(Ticker {
            symbol,
            last_price: (bid + ask) / 2.0,
            bid,
            ask,
            timestamp: Self::timestamp_ms() as i64,
        })
    }

    async fn get_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBook> {
        let symbol = self.normalize_symbol(symbol);
        let url = format!("{REST_BASE}/api/v3/depth?symbol={symbol}&limit={limit}");
        let body = self.get_json(&url, "GET /api/v3/depth").await?;

        let parse_levels = |value: &serde_json::Value| -> Vec<(f64, f64)> {
            value
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            let pair = row.as_array()?;
                            Some((Self::as_f64(&pair[0]), Self::as_f64(&pair[1])))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBook {
            symbol,
            bids: parse_levels(&body["bids"]),
            asks: parse_levels(&body["asks"]),
            timestamp: Self::timestamp_ms() as i64,
        })
    }

    async fn get_balance(&self) -> Result<Vec<Balance>> {
        if self.is_demo() {
            return Ok(vec![Balance {
                asset: "USDT".into(),
                free: 100_000.0,
                locked: 0.0,
            }]);
        }

        let qs = self.signed_query("")?;
        let url = format!("{REST_BASE}/api/v3/account?{qs}");
        let body = self.get_json(&url, "GET /api/v3/account").await?;

        let balances = body["balances"]
            .as_array()
            .ok_or_else(|| ErrorKind::Unavailable("account payload missing balances".into()))?;

        Ok(balances
            .iter()
            .filter_map(|b| {
                let free = Self::as_f64(&b["free"]);
                let locked = Self::as_f64(&b["locked"]);
                if free > 0.0 || locked > 0.0 {
                    Some(Balance {
                        asset: b["asset"].as_str()?.to_string(),
                        free,
                        locked,
                    })
                } else {
                    None
                }
            })
            .collect())
    }

    async fn place_order(&self, order: OrderRequest) -> Result<PlacedOrder> {
        let symbol = self.normalize_symbol(&order.symbol);

        if self.is_demo() {
            let fill_price = match order.price {
                Some(p) => p,
                None => self.get_ticker(&symbol).await?.last_price,
            };
            debug!(symbol = %symbol, side = %order.side, qty = order.quantity, "demo order filled");
            return Ok(self.demo_fill(order, fill_price));
        }

        let side = match order.side {
            TradeSide::Long => "BUY",
            TradeSide::Short => "SELL",
        };
        let params = match order.price {
            Some(price) => format!(
                "symbol={symbol}&side={side}&type=LIMIT&timeInForce=GTC&quantity={}&price={price}&newClientOrderId={}",
                order.quantity, order.client_order_id
            ),
            None => format!(
                "symbol={symbol}&side={side}&type=MARKET&quantity={}&newClientOrderId={}",
                order.quantity, order.client_order_id
            ),
        };
        let qs = self.signed_query(&params)?;
        let url = format!("{REST_BASE}/api/v3/order?{qs}");

        let resp = self
            .client()
            .post(&url)
            .send()
            .await
            .map_err(|e| Self::map_transport_err(e, "POST /api/v3/order"))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| {
            ErrorKind::Unavailable(format!("order response unparsable: {e}"))
        })?;
        if !status.is_success() {
            return Err(Self::map_status(status, "POST /api/v3/order", &body));
        }

        info!(symbol = %symbol, side = %order.side, qty = order.quantity, "order placed");
        Ok(self.parse_order(&body, &symbol))
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()> {
        if self.is_demo() {
            return Ok(());
        }
        let symbol = self.normalize_symbol(symbol);
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params)?;
        let url = format!("{REST_BASE}/api/v3/order?{qs}");

        let resp = self
            .client()
            .delete(&url)
            .send()
            .await
            .map_err(|e| Self::map_transport_err(e, "DELETE /api/v3/order"))?;
        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            return Err(Self::map_status(status, "DELETE /api/v3/order", &body));
        }
        Ok(())
    }

    async fn get_order(&self, order_id: &str, symbol: &str) -> Result<PlacedOrder> {
        let symbol = self.normalize_symbol(symbol);
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params)?;
        let url = format!("{REST_BASE}/api/v3/order?{qs}");
        let body = self.get_json(&url, "GET /api/v3/order").await?;
        Ok(self.parse_order(&body, &symbol))
    }

    async fn subscribe_candles(
        &self,
        symbol: &str,
        interval: CandleInterval,
    ) -> Result<mpsc::Receiver<Candle>> {
        let stream_symbol = self.normalize_symbol(symbol).to_lowercase();
        let url = format!(
            "{STREAM_BASE}/ws/{stream_symbol}@kline_{}",
            interval.as_wire()
        );
        let (tx, rx) = mpsc::channel(256);

        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| ErrorKind::Unavailable(format!("kline stream connect failed: {e}")))?;
        info!(symbol = %stream_symbol, interval = %interval, "kline stream connected");

        tokio::spawn(async move {
            let (_, mut read) = ws.split();
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                        if let Some(candle) = Self::parse_kline_event(&text) {
                            if tx.send(candle).await.is_err() {
                                break; // subscriber dropped
                            }
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            warn!(symbol = %stream_symbol, "kline stream ended");
        });

        Ok(rx)
    }

    async fn subscribe_ticker(&self, symbol: &str) -> Result<mpsc::Receiver<Ticker>> {
        let stream_symbol = self.normalize_symbol(symbol).to_lowercase();
        let url = format!("{STREAM_BASE}/ws/{stream_symbol}@bookTicker");
        let (tx, rx) = mpsc::channel(256);

        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| ErrorKind::Unavailable(format!("ticker stream connect failed: {e}")))?;
        info!(symbol = %stream_symbol, "ticker stream connected");

        let display_symbol = self.normalize_symbol(symbol);
        tokio::spawn(async move {
            let (_, mut read) = ws.split();
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                        let Ok(root) = serde_json::from_str::<serde_json::Value>(&text) else {
                            continue;
                        };
                        let bid = Self::as_f64(&root["b"]);
                        let ask = Self::as_f64(&root["a"]);
                        if bid <= 0.0 || ask <= 0.0 {
                            continue;
                        }
                        let ticker = Ticker {
                            symbol: display_symbol.clone(),
                            last_price: (bid + ask) / 2.0,
                            bid,
                            ask,
                            timestamp: Self::timestamp_ms() as i64,
                        };
                        if tx.send(ticker).await.is_err() {
                            break;
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            warn!(symbol = %stream_symbol, "ticker stream ended");
        });

        Ok(rx)
    }
}
