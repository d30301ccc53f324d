use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backtesting::data_fetcher::HistoricalPriceSource;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exchange::{
    format_to_step, round_to_tick, Broker, OrderRef, OrderSnapshot, PositionInfo, SymbolPrecision,
};
use crate::models::{Candle, CandleSeries, OrderSide, OrderStatus};

pub const LIVE_URL: &str = "https://fapi.binance.com";
pub const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Max klines per `/fapi/v1/klines` request.
pub const MAX_KLINES_PER_REQUEST: usize = 1500;

const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(100);
const RECV_WINDOW_MS: u64 = 5000;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of the query string, as Binance expects for signed endpoints.
pub fn sign_query(secret: &str, query: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("invalid API secret: {}", e)))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn to_query(params: &BTreeMap<&str, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn parse_num(raw: &str, field: &str) -> Result<f64> {
    raw.parse()
        .map_err(|_| Error::Broker(format!("bad {} '{}'", field, raw)))
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    status: String,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default)]
    avg_price: Option<String>,
    #[serde(default)]
    update_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
    un_realized_profit: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<serde_json::Value>,
}

// [open_time, open, high, low, close, volume, close_time, ...]
#[derive(Debug, Deserialize)]
struct RawKline(
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
);

impl RawKline {
    fn into_candle(self) -> Result<Candle> {
        Ok(Candle {
            timestamp: millis_to_utc(self.0),
            open: parse_num(&self.1, "open")?,
            high: parse_num(&self.2, "high")?,
            low: parse_num(&self.3, "low")?,
            close: parse_num(&self.4, "close")?,
            volume: parse_num(&self.5, "volume")?,
        })
    }
}

fn precision_from(info: &SymbolInfo) -> SymbolPrecision {
    let mut precision = SymbolPrecision {
        tick_size: 0.0,
        step_size: 0.0,
        min_qty: 0.0,
    };
    let field = |f: &serde_json::Value, key: &str| -> f64 {
        f.get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0)
    };
    for f in &info.filters {
        match f.get("filterType").and_then(|v| v.as_str()) {
            Some("PRICE_FILTER") => precision.tick_size = field(f, "tickSize"),
            Some("LOT_SIZE") => {
                precision.step_size = field(f, "stepSize");
                precision.min_qty = field(f, "minQty");
            }
            _ => {}
        }
    }
    precision
}

/// Binance USDⓈ-M futures REST client.
pub struct BinanceClient {
    client: Client,
    base_url: String,
    api_secret: String,
    last_request: Mutex<Option<Instant>>,
    precision_cache: Mutex<HashMap<String, SymbolPrecision>>,
}

impl BinanceClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        Self::with_base_url(cfg.base_url(), &cfg.binance_api_key, &cfg.binance_api_secret)
    }

    pub fn with_base_url(base_url: &str, api_key: &str, api_secret: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if !api_key.is_empty() {
            let value = HeaderValue::from_str(api_key)
                .map_err(|e| Error::Config(format!("invalid API key: {}", e)))?;
            headers.insert("X-MBX-APIKEY", value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_secret: api_secret.to_string(),
            last_request: Mutex::new(None),
            precision_cache: Mutex::new(HashMap::new()),
        })
    }

    async fn rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                tokio::time::sleep(MIN_REQUEST_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn send<T: DeserializeOwned>(&self, method: Method, url: String) -> Result<T> {
        self.rate_limit().await;
        let response = self.client.request(method, &url).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            Ok(serde_json::from_str(&text)?)
        } else {
            let body = match serde_json::from_str::<ApiErrorBody>(&text) {
                Ok(err) => format!("{} (code {})", err.msg, err.code),
                Err(_) => text,
            };
            Err(Error::BrokerStatus {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &BTreeMap<&str, String>,
    ) -> Result<T> {
        let url = if params.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, to_query(params))
        };
        self.send(Method::GET, url).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: BTreeMap<&str, String>,
    ) -> Result<T> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        params.insert("recvWindow", RECV_WINDOW_MS.to_string());
        params.insert("timestamp", timestamp.to_string());

        let query = to_query(&params);
        let signature = sign_query(&self.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        self.send(method, url).await
    }

    async fn place_order(&self, params: BTreeMap<&str, String>) -> Result<OrderRef> {
        let resp: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", params).await?;
        debug!("Order {} accepted ({})", resp.order_id, resp.status);
        Ok(OrderRef::from(resp.order_id))
    }

    async fn protective_order(
        &self,
        order_type: &str,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger: f64,
    ) -> Result<OrderRef> {
        let precision = self.symbol_precision(symbol).await?;
        let trigger = round_to_tick(trigger, precision.tick_size);

        let mut params = BTreeMap::new();
        params.insert("symbol", symbol.to_string());
        params.insert("side", side.to_string());
        params.insert("type", order_type.to_string());
        params.insert("stopPrice", format_to_step(trigger, precision.tick_size));
        params.insert("quantity", format_to_step(quantity, precision.step_size));
        params.insert("reduceOnly", "true".to_string());
        params.insert("workingType", "MARK_PRICE".to_string());
        self.place_order(params).await
    }
}

#[async_trait]
impl Broker for BinanceClient {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("symbol", symbol.to_string());
        params.insert("leverage", leverage.to_string());
        let _: serde_json::Value = self
            .signed(Method::POST, "/fapi/v1/leverage", params)
            .await?;
        info!("Leverage for {} set to {}x", symbol, leverage);
        Ok(())
    }

    async fn symbol_precision(&self, symbol: &str) -> Result<SymbolPrecision> {
        if let Some(p) = self.precision_cache.lock().await.get(symbol) {
            return Ok(*p);
        }

        let info: ExchangeInfo = self.public("/fapi/v1/exchangeInfo", &BTreeMap::new()).await?;
        let mut cache = self.precision_cache.lock().await;
        for s in &info.symbols {
            cache.insert(s.symbol.clone(), precision_from(s));
        }
        cache
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::UnknownSymbol(symbol.to_string()))
    }

    async fn place_entry_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        limit_price: Option<f64>,
    ) -> Result<OrderRef> {
        let precision = self.symbol_precision(symbol).await?;

        let mut params = BTreeMap::new();
        params.insert("symbol", symbol.to_string());
        params.insert("side", side.to_string());
        params.insert("quantity", format_to_step(quantity, precision.step_size));
        match limit_price {
            Some(price) => {
                let price = round_to_tick(price, precision.tick_size);
                params.insert("type", "LIMIT".to_string());
                params.insert("timeInForce", "GTC".to_string());
                params.insert("price", format_to_step(price, precision.tick_size));
            }
            None => {
                params.insert("type", "MARKET".to_string());
            }
        }
        self.place_order(params).await
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderRef> {
        self.protective_order("STOP_MARKET", symbol, side, quantity, stop_price)
            .await
    }

    async fn place_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
    ) -> Result<OrderRef> {
        self.protective_order("TAKE_PROFIT_MARKET", symbol, side, quantity, price)
            .await
    }

    async fn cancel_order(&self, symbol: &str, order: &OrderRef) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("symbol", symbol.to_string());
        params.insert("orderId", order.0.clone());
        let _: OrderResponse = self
            .signed(Method::DELETE, "/fapi/v1/order", params)
            .await?;
        Ok(())
    }

    async fn order_status(&self, symbol: &str, order: &OrderRef) -> Result<OrderSnapshot> {
        let mut params = BTreeMap::new();
        params.insert("symbol", symbol.to_string());
        params.insert("orderId", order.0.clone());
        let resp: OrderResponse = self.signed(Method::GET, "/fapi/v1/order", params).await?;

        let status: OrderStatus = resp.status.parse().map_err(Error::Broker)?;
        let executed_qty = resp
            .executed_qty
            .as_deref()
            .map(|q| parse_num(q, "executedQty"))
            .transpose()?
            .unwrap_or(0.0);
        let avg_fill_price = resp
            .avg_price
            .as_deref()
            .map(|p| parse_num(p, "avgPrice"))
            .transpose()?
            .filter(|p| *p > 0.0);

        Ok(OrderSnapshot {
            status,
            executed_qty,
            avg_fill_price,
            updated_at: resp.update_time.map(millis_to_utc).unwrap_or_else(Utc::now),
        })
    }

    async fn position(&self, symbol: &str) -> Result<Option<PositionInfo>> {
        let mut params = BTreeMap::new();
        params.insert("symbol", symbol.to_string());
        let risks: Vec<PositionRisk> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", params)
            .await?;

        for r in risks {
            let amount = parse_num(&r.position_amt, "positionAmt")?;
            if r.symbol == symbol && amount != 0.0 {
                return Ok(Some(PositionInfo {
                    symbol: r.symbol,
                    amount,
                    entry_price: parse_num(&r.entry_price, "entryPrice")?,
                    unrealized_pnl: parse_num(&r.un_realized_profit, "unRealizedProfit")?,
                }));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl HistoricalPriceSource for BinanceClient {
    async fn fetch_minute_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CandleSeries> {
        let mut candles = Vec::new();
        let mut cursor = start;

        while cursor < end {
            let mut params = BTreeMap::new();
            params.insert("symbol", symbol.to_string());
            params.insert("interval", "1m".to_string());
            params.insert("startTime", cursor.timestamp_millis().to_string());
            params.insert("endTime", end.timestamp_millis().to_string());
            params.insert("limit", MAX_KLINES_PER_REQUEST.to_string());

            let page: Vec<RawKline> = self.public("/fapi/v1/klines", &params).await?;
            let count = page.len();
            let Some(last_open) = page.last().map(|k| k.0) else {
                break;
            };
            for raw in page {
                candles.push(raw.into_candle()?);
            }

            debug!("Fetched {} bars for {} from {}", count, symbol, cursor);
            if count < MAX_KLINES_PER_REQUEST {
                break;
            }
            cursor = millis_to_utc(last_open) + ChronoDuration::minutes(1);
        }

        Ok(CandleSeries::new(candles))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_like_binance_docs() {
        // Example from the Binance signed-endpoint documentation.
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn query_is_sorted_by_key() {
        let mut params = BTreeMap::new();
        params.insert("symbol", "BTCUSDT".to_string());
        params.insert("leverage", "10".to_string());
        assert_eq!(to_query(&params), "leverage=10&symbol=BTCUSDT");
    }

    #[test]
    fn parses_lot_and_price_filters() {
        let json = r#"{"symbols":[{"symbol":"BTCUSDT","filters":[
            {"filterType":"PRICE_FILTER","tickSize":"0.10","minPrice":"556.80"},
            {"filterType":"LOT_SIZE","stepSize":"0.001","minQty":"0.001","maxQty":"1000"}
        ]}]}"#;
        let info: ExchangeInfo = serde_json::from_str(json).unwrap();
        let p = precision_from(&info.symbols[0]);
        assert_eq!(p.tick_size, 0.1);
        assert_eq!(p.step_size, 0.001);
        assert_eq!(p.min_qty, 0.001);
    }

    #[test]
    fn parses_raw_kline() {
        let json = r#"[[1705320000000,"100.0","101.5","99.5","101.0","1234.5",1705320059999,"0",10,"0","0","0"]]"#;
        let raw: Vec<RawKline> = serde_json::from_str(json).unwrap();
        let candle = raw.into_iter().next().unwrap().into_candle().unwrap();
        assert_eq!(candle.high, 101.5);
        assert_eq!(candle.timestamp.timestamp_millis(), 1705320000000);
    }
}
