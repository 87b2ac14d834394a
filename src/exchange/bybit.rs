// =============================================================================
// Bybit v5 REST client — HMAC-SHA256 signed requests (linear perpetuals)
// =============================================================================
//
// SECURITY: The secret is never logged or serialized.  Signed requests carry
// X-BAPI-API-KEY / X-BAPI-TIMESTAMP / X-BAPI-RECV-WINDOW / X-BAPI-SIGN where
// the signature covers `timestamp + api_key + recv_window + payload` and the
// payload is the query string (GET) or the JSON body (POST).
//
// Every response is an envelope `{ retCode, retMsg, result }`; a non-zero
// retCode becomes `ExchangeError::Rejected` except for the rate-limit and
// server-busy codes, which are reported as transient.
// =============================================================================

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use super::{ExchangeClient, ExchangeError};
use crate::quantize::InstrumentFilters;
use crate::types::{LivePosition, OrderFill, OrderSide, StopUpdate};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Product category for USDT perpetuals.
const CATEGORY: &str = "linear";

/// retCodes that mean "try again later".
const RET_CODE_RATE_LIMIT: i64 = 10006;
const RET_CODE_SERVER_BUSY: i64 = 10016;
/// orderLinkId already used.
const RET_CODE_DUPLICATE_LINK_ID: i64 = 110072;

// =============================================================================
// Environment
// =============================================================================

/// Which Bybit deployment to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BybitEnv {
    Demo,
    Testnet,
    Live,
}

impl BybitEnv {
    /// Parse `BYBIT_ENV`; anything unrecognised means demo.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LIVE" | "MAINNET" => Self::Live,
            "TESTNET" => Self::Testnet,
            _ => Self::Demo,
        }
    }

    pub fn base_url(self) -> &'static str {
        match self {
            Self::Demo => "https://api-demo.bybit.com",
            Self::Testnet => "https://api-testnet.bybit.com",
            Self::Live => "https://api.bybit.com",
        }
    }
}

impl std::fmt::Display for BybitEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "DEMO"),
            Self::Testnet => write!(f, "TESTNET"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Bybit REST client with v5 request signing and cached instrument filters.
pub struct BybitClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    filters: RwLock<HashMap<String, InstrumentFilters>>,
}

impl BybitClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BybitClient`.
    ///
    /// # Arguments
    /// * `api_key` — Bybit API key (sent as a header).
    /// * `secret`  — Bybit secret used exclusively for HMAC signing.
    /// * `env`     — deployment to connect to.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, env: BybitEnv) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = env.base_url(), "BybitClient initialised");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: env.base_url().to_string(),
            client,
            filters: RwLock::new(HashMap::new()),
        }
    }

    /// Client for public market data only (paper mode price feed).
    pub fn public(env: BybitEnv) -> Self {
        Self::new(String::new(), String::new(), env)
    }

    /// Build from `BYBIT_API_KEY`, `BYBIT_API_SECRET` and `BYBIT_ENV`.
    pub fn from_env() -> anyhow::Result<Self> {
        let key = std::env::var("BYBIT_API_KEY")
            .or_else(|_| std::env::var("BYBIT_KEY"))
            .map_err(|_| anyhow::anyhow!("BYBIT_API_KEY is not set"))?;
        let secret = std::env::var("BYBIT_API_SECRET")
            .or_else(|_| std::env::var("BYBIT_SECRET"))
            .map_err(|_| anyhow::anyhow!("BYBIT_API_SECRET is not set"))?;
        let env = BybitEnv::parse(&std::env::var("BYBIT_ENV").unwrap_or_default());
        info!(env = %env, "using Bybit credentials from environment");
        Ok(Self::new(key, secret, env))
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `timestamp + api_key + recv_window + payload`.
    pub fn sign(&self, timestamp: i64, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(self.api_key.as_bytes());
        mac.update(RECV_WINDOW.to_string().as_bytes());
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(&self, payload: &str) -> [(&'static str, String); 4] {
        let ts = chrono::Utc::now().timestamp_millis();
        [
            ("X-BAPI-API-KEY", self.api_key.clone()),
            ("X-BAPI-TIMESTAMP", ts.to_string()),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string()),
            ("X-BAPI-SIGN", self.sign(ts, payload)),
        ]
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn public_get(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        finish(self.client.get(&url).send().await?).await
    }

    async fn signed_get(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let mut req = self.client.get(&url);
        for (k, v) in self.signed_headers(query) {
            req = req.header(k, v);
        }
        finish(req.send().await?).await
    }

    async fn signed_post(&self, path: &str, body: &Value) -> Result<Value, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let payload = body.to_string();
        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        for (k, v) in self.signed_headers(&payload) {
            req = req.header(k, v);
        }
        finish(req.body(payload).send().await?).await
    }
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// ExchangeClient
// =============================================================================

impl ExchangeClient for BybitClient {
    /// GET /v5/position/list (signed).
    #[instrument(skip(self), name = "bybit::open_position")]
    async fn open_position(&self, symbol: &str) -> Result<Option<LivePosition>, ExchangeError> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result = self.signed_get("/v5/position/list", &query).await?;
        let pos = parse_position(&result)?;
        debug!(symbol, found = pos.is_some(), "position read");
        Ok(pos)
    }

    /// GET /v5/market/tickers (public).
    #[instrument(skip(self), name = "bybit::last_price")]
    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result = self.public_get("/v5/market/tickers", &query).await?;
        let price = result["list"]
            .get(0)
            .and_then(|t| parse_num(&t["lastPrice"]))
            .filter(|p| *p > 0.0)
            .ok_or_else(|| ExchangeError::Malformed(format!("no lastPrice for {symbol}")))?;
        Ok(price)
    }

    /// GET /v5/market/instruments-info (public), cached per symbol.
    #[instrument(skip(self), name = "bybit::instrument_filters")]
    async fn instrument_filters(&self, symbol: &str) -> Result<InstrumentFilters, ExchangeError> {
        if let Some(f) = self.filters.read().get(symbol) {
            return Ok(*f);
        }
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result = self
            .public_get("/v5/market/instruments-info", &query)
            .await?;
        let filters = parse_filters(&result)?;
        debug!(
            symbol,
            qty_step = filters.qty_step,
            min_qty = filters.min_qty,
            tick = filters.tick_size,
            "instrument filters cached"
        );
        self.filters.write().insert(symbol.to_string(), filters);
        Ok(filters)
    }

    /// POST /v5/order/create (signed) — market order tagged with the caller's orderLinkId.
    #[instrument(skip(self, link_id), name = "bybit::place_market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        reduce_only: bool,
        link_id: &str,
    ) -> Result<OrderFill, ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "side": side.to_string(),
            "orderType": "Market",
            "qty": qty.to_string(),
            "timeInForce": "GTC",
            "reduceOnly": reduce_only,
            "orderLinkId": link_id,
        });
        let result = match self.signed_post("/v5/order/create", &body).await {
            Ok(result) => result,
            Err(ExchangeError::Rejected { code, .. }) if code == RET_CODE_DUPLICATE_LINK_ID => {
                // An earlier attempt of this same order was accepted.
                warn!(symbol, link_id, "order already accepted on a previous attempt");
                return Ok(OrderFill {
                    order_id: link_id.to_string(),
                    filled_qty: None,
                });
            }
            Err(e) => return Err(e),
        };
        let order_id = result["orderId"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ExchangeError::Malformed("order response missing orderId".into()))?
            .to_string();
        info!(symbol, %side, qty, reduce_only, order_id = %order_id, "market order placed");
        Ok(OrderFill {
            order_id,
            filled_qty: None,
        })
    }

    /// POST /v5/position/trading-stop (signed).  "Not modified" is success.
    #[instrument(skip(self), name = "bybit::set_stop_and_take")]
    async fn set_stop_and_take(
        &self,
        symbol: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<StopUpdate, ExchangeError> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "tpslMode": "Full",
            "positionIdx": 0,
        });
        if let Some(sl) = stop_loss {
            body["stopLoss"] = Value::String(sl.to_string());
        }
        if let Some(tp) = take_profit {
            body["takeProfit"] = Value::String(tp.to_string());
        }
        match self.signed_post("/v5/position/trading-stop", &body).await {
            Ok(_) => {
                info!(symbol, ?stop_loss, ?take_profit, "trading stop set");
                Ok(StopUpdate::Applied)
            }
            Err(e) if e.is_not_modified() => {
                debug!(symbol, "trading stop not modified");
                Ok(StopUpdate::AlreadyAligned)
            }
            Err(e) => {
                warn!(symbol, error = %e, "trading stop rejected");
                Err(e)
            }
        }
    }
}

// =============================================================================
// Response parsing
// =============================================================================

/// Read a response body.  Gateway errors often carry HTML, so they are
/// classified before any JSON decoding.
async fn finish(resp: reqwest::Response) -> Result<Value, ExchangeError> {
    let status = resp.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        let text = resp.text().await.unwrap_or_default();
        return Err(ExchangeError::Unavailable {
            status: status.as_u16(),
            message: text,
        });
    }
    let body: Value = resp.json().await?;
    unwrap_envelope(status, body)
}

/// Split a v5 envelope into `result` or an `ExchangeError`.
fn unwrap_envelope(status: StatusCode, body: Value) -> Result<Value, ExchangeError> {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ExchangeError::Unavailable {
            status: status.as_u16(),
            message: body.to_string(),
        });
    }
    if !status.is_success() {
        return Err(ExchangeError::Rejected {
            code: i64::from(status.as_u16()),
            message: body.to_string(),
        });
    }

    let code = body["retCode"]
        .as_i64()
        .ok_or_else(|| ExchangeError::Malformed(format!("missing retCode: {body}")))?;
    let message = body["retMsg"].as_str().unwrap_or_default().to_string();

    match code {
        0 => Ok(body.get("result").cloned().unwrap_or(Value::Null)),
        RET_CODE_RATE_LIMIT | RET_CODE_SERVER_BUSY => Err(ExchangeError::Unavailable {
            status: status.as_u16(),
            message: format!("retCode {code}: {message}"),
        }),
        _ => Err(ExchangeError::Rejected { code, message }),
    }
}

/// Accept `"1.23"` or `1.23`; empty strings and `"0"` are treated as absent.
fn parse_num(v: &Value) -> Option<f64> {
    let n = match v {
        Value::String(s) if s.trim().is_empty() => return None,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    (n.is_finite() && n != 0.0).then_some(n)
}

fn parse_position(result: &Value) -> Result<Option<LivePosition>, ExchangeError> {
    let list = result["list"]
        .as_array()
        .ok_or_else(|| ExchangeError::Malformed("position list missing".into()))?;

    for item in list {
        let qty = parse_num(&item["size"]).unwrap_or(0.0);
        if qty <= 0.0 {
            continue;
        }
        let side = item["side"]
            .as_str()
            .and_then(OrderSide::parse)
            .ok_or_else(|| ExchangeError::Malformed(format!("bad position side: {item}")))?
            .position_side();
        let entry_price = parse_num(&item["avgPrice"])
            .or_else(|| parse_num(&item["avgEntryPrice"]))
            .ok_or_else(|| ExchangeError::Malformed(format!("position without avgPrice: {item}")))?;
        return Ok(Some(LivePosition {
            side,
            qty,
            entry_price,
            stop_loss: parse_num(&item["stopLoss"]),
            take_profit: parse_num(&item["takeProfit"]),
        }));
    }
    Ok(None)
}

fn parse_filters(result: &Value) -> Result<InstrumentFilters, ExchangeError> {
    let item = result["list"]
        .get(0)
        .ok_or_else(|| ExchangeError::Malformed("instrument not found".into()))?;
    let lot = &item["lotSizeFilter"];
    let price = &item["priceFilter"];
    let defaults = InstrumentFilters::default();
    Ok(InstrumentFilters {
        qty_step: parse_num(&lot["qtyStep"]).unwrap_or(defaults.qty_step),
        min_qty: parse_num(&lot["minOrderQty"]).unwrap_or(0.0),
        tick_size: parse_num(&price["tickSize"]).unwrap_or(defaults.tick_size),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let c = BybitClient::new("key", "secret", BybitEnv::Testnet);
        let a = c.sign(1_700_000_000_000, "category=linear&symbol=BTCUSDT");
        let b = c.sign(1_700_000_000_000, "category=linear&symbol=BTCUSDT");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_ne!(a, c.sign(1_700_000_000_001, "category=linear&symbol=BTCUSDT"));
    }

    #[test]
    fn env_parsing_defaults_to_demo() {
        assert_eq!(BybitEnv::parse("live"), BybitEnv::Live);
        assert_eq!(BybitEnv::parse("TESTNET"), BybitEnv::Testnet);
        assert_eq!(BybitEnv::parse(""), BybitEnv::Demo);
        assert_eq!(BybitEnv::Demo.base_url(), "https://api-demo.bybit.com");
    }

    #[test]
    fn debug_redacts_credentials() {
        let c = BybitClient::new("my-key", "my-secret", BybitEnv::Demo);
        let s = format!("{c:?}");
        assert!(!s.contains("my-key"));
        assert!(!s.contains("my-secret"));
    }

    #[test]
    fn envelope_classification() {
        let ok = unwrap_envelope(
            StatusCode::OK,
            json!({ "retCode": 0, "retMsg": "OK", "result": { "orderId": "1" } }),
        )
        .unwrap();
        assert_eq!(ok["orderId"], "1");

        let not_modified = unwrap_envelope(
            StatusCode::OK,
            json!({ "retCode": 34040, "retMsg": "not modified" }),
        )
        .unwrap_err();
        assert!(not_modified.is_not_modified());

        let limited =
            unwrap_envelope(StatusCode::OK, json!({ "retCode": 10006, "retMsg": "Too many visits" }))
                .unwrap_err();
        assert!(limited.is_transient());

        let busy = unwrap_envelope(StatusCode::BAD_GATEWAY, json!({})).unwrap_err();
        assert!(busy.is_transient());

        let malformed = unwrap_envelope(StatusCode::OK, json!({ "foo": 1 })).unwrap_err();
        assert!(matches!(malformed, ExchangeError::Malformed(_)));
    }

    #[test]
    fn parses_open_and_flat_positions() {
        let open = json!({ "list": [{
            "symbol": "BTCUSDT", "side": "Sell", "size": "0.010",
            "avgPrice": "65000.5", "stopLoss": "65650", "takeProfit": ""
        }]});
        let pos = parse_position(&open).unwrap().unwrap();
        assert_eq!(pos.side, crate::types::Side::Short);
        assert!((pos.qty - 0.01).abs() < 1e-12);
        assert_eq!(pos.stop_loss, Some(65650.0));
        assert_eq!(pos.take_profit, None);

        let flat = json!({ "list": [{ "symbol": "BTCUSDT", "side": "", "size": "0", "avgPrice": "0" }]});
        assert_eq!(parse_position(&flat).unwrap(), None);
    }

    #[test]
    fn parses_instrument_filters() {
        let info = json!({ "list": [{
            "lotSizeFilter": { "qtyStep": "0.001", "minOrderQty": "0.001" },
            "priceFilter": { "tickSize": "0.10" }
        }]});
        let f = parse_filters(&info).unwrap();
        assert_eq!(f.qty_step, 0.001);
        assert_eq!(f.min_qty, 0.001);
        assert_eq!(f.tick_size, 0.1);
        assert!(parse_filters(&json!({ "list": [] })).is_err());
    }
}
