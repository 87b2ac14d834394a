// =============================================================================
// Exchange abstraction
// =============================================================================
//
// The engine talks to the exchange exclusively through `ExchangeClient`.
// `BybitClient` is the live implementation, `PaperExchange` simulates fills in
// process.  The exchange is authoritative for position existence and quantity.
// =============================================================================

pub mod bybit;
pub mod paper;

use crate::quantize::InstrumentFilters;
use crate::types::{LivePosition, OrderFill, OrderSide, StopUpdate};

pub use bybit::BybitClient;
pub use paper::PaperExchange;

/// Bybit's "not modified" return code for trading-stop updates.
pub const RET_CODE_NOT_MODIFIED: i64 = 34040;

/// Client order id for one logical order.  Reused across retries so the
/// exchange can deduplicate a resubmission.
pub fn new_order_link_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Errors surfaced by exchange adapters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExchangeError {
    /// Network failure, timeout, connection reset.
    #[error("transport error: {0}")]
    Transport(String),

    /// Exchange temporarily unable to serve (5xx, rate limit).
    #[error("exchange unavailable (HTTP {status}): {message}")]
    Unavailable { status: u16, message: String },

    /// Request understood and refused.
    #[error("rejected by exchange (code {code}): {message}")]
    Rejected { code: i64, message: String },

    /// Response could not be interpreted.
    #[error("malformed exchange response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Unavailable { .. })
    }

    /// The exchange refused the reduce-only flag itself.  Rejections of the
    /// order's size against the position ("position is zero", "would increase
    /// position") are not flag rejections and must not trigger a flagless retry.
    pub fn is_reduce_only_rejection(&self) -> bool {
        match self {
            Self::Rejected { message, .. } => {
                let m = message.to_ascii_lowercase();
                m.contains("reduce") && m.contains("not supported")
            }
            _ => false,
        }
    }

    /// The exchange reports the requested state is already in place.
    pub fn is_not_modified(&self) -> bool {
        match self {
            Self::Rejected { code, message } => {
                *code == RET_CODE_NOT_MODIFIED
                    || message.to_ascii_lowercase().contains("not modified")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                Self::Unavailable {
                    status: status.as_u16(),
                    message: e.to_string(),
                }
            }
            _ if e.is_decode() => Self::Malformed(e.to_string()),
            _ => Self::Transport(e.to_string()),
        }
    }
}

/// Everything the engine needs from an exchange.
#[allow(async_fn_in_trait)]
pub trait ExchangeClient {
    /// The open position for `symbol`, or `None` when flat.
    async fn open_position(&self, symbol: &str) -> Result<Option<LivePosition>, ExchangeError>;

    /// Last traded price.
    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Lot and tick filters.
    async fn instrument_filters(&self, symbol: &str) -> Result<InstrumentFilters, ExchangeError>;

    /// Submit a market order.  `link_id` identifies the logical order; a
    /// resubmission with the same id must not create a second order.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        reduce_only: bool,
        link_id: &str,
    ) -> Result<OrderFill, ExchangeError>;

    /// Set position-level stop-loss and/or take-profit.  `None` leaves a leg untouched.
    async fn set_stop_and_take(
        &self,
        symbol: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<StopUpdate, ExchangeError>;
}
