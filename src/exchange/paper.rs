// =============================================================================
// Paper exchange — in-process simulation with the same interface as live
// =============================================================================
//
// Market orders fill immediately at the last known price.  Position-level
// SL/TP are held in memory and close the position as soon as an observed
// price crosses them.  Prices and instrument filters come from the public
// Bybit endpoints when a feed is attached, otherwise from `set_price`.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{BybitClient, ExchangeClient, ExchangeError};
use crate::quantize::InstrumentFilters;
use crate::types::{LivePosition, OrderFill, OrderSide, Side, StopUpdate};

#[derive(Default)]
struct Book {
    positions: HashMap<String, LivePosition>,
    prices: HashMap<String, f64>,
    next_order_id: u64,
}

impl Book {
    /// Close `symbol` if `price` crossed its stop or take.
    fn apply_triggers(&mut self, symbol: &str, price: f64) {
        let Some(pos) = self.positions.get(symbol) else {
            return;
        };
        let stop_hit = pos.stop_loss.is_some_and(|sl| match pos.side {
            Side::Long => price <= sl,
            Side::Short => price >= sl,
        });
        let take_hit = pos.take_profit.is_some_and(|tp| match pos.side {
            Side::Long => price >= tp,
            Side::Short => price <= tp,
        });
        if stop_hit || take_hit {
            info!(
                symbol,
                side = %pos.side,
                price,
                reason = if stop_hit { "stop" } else { "take" },
                "paper: position closed by trigger"
            );
            self.positions.remove(symbol);
        }
    }
}

/// Simulated exchange used in paper mode.
pub struct PaperExchange {
    book: Mutex<Book>,
    feed: Option<BybitClient>,
}

impl PaperExchange {
    /// Paper exchange pricing from the public Bybit ticker.
    pub fn with_feed(feed: BybitClient) -> Self {
        Self {
            book: Mutex::new(Book::default()),
            feed: Some(feed),
        }
    }

    /// Paper exchange priced only through `set_price`.
    pub fn offline() -> Self {
        Self {
            book: Mutex::new(Book::default()),
            feed: None,
        }
    }

    /// Record an observed price and fire any SL/TP it crosses.
    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut b = self.book.lock();
        b.prices.insert(symbol.to_string(), price);
        b.apply_triggers(symbol, price);
    }

    async fn fill_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        if let Some(p) = self.book.lock().prices.get(symbol).copied() {
            return Ok(p);
        }
        self.last_price(symbol).await
    }
}

impl ExchangeClient for PaperExchange {
    async fn open_position(&self, symbol: &str) -> Result<Option<LivePosition>, ExchangeError> {
        Ok(self.book.lock().positions.get(symbol).cloned())
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        if let Some(feed) = &self.feed {
            let price = feed.last_price(symbol).await?;
            self.set_price(symbol, price);
            return Ok(price);
        }
        self.book
            .lock()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Malformed(format!("no paper price for {symbol}")))
    }

    async fn instrument_filters(&self, symbol: &str) -> Result<InstrumentFilters, ExchangeError> {
        match &self.feed {
            Some(feed) => feed.instrument_filters(symbol).await,
            None => Ok(InstrumentFilters::default()),
        }
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        reduce_only: bool,
        _link_id: &str,
    ) -> Result<OrderFill, ExchangeError> {
        if !(qty > 0.0) {
            return Err(ExchangeError::Rejected {
                code: 10001,
                message: format!("Qty invalid: {qty}"),
            });
        }
        let price = self.fill_price(symbol).await?;

        let mut b = self.book.lock();
        let existing = b.positions.get(symbol).cloned();
        match existing {
            Some(mut pos) if pos.side.closing_order_side() == side => {
                let closed = qty.min(pos.qty);
                pos.qty -= closed;
                if pos.qty <= f64::EPSILON {
                    b.positions.remove(symbol);
                } else {
                    b.positions.insert(symbol.to_string(), pos);
                }
            }
            Some(_) if reduce_only => {
                return Err(ExchangeError::Rejected {
                    code: 110017,
                    message: "reduce-only order would increase position".into(),
                });
            }
            Some(mut pos) => {
                let total = pos.qty + qty;
                pos.entry_price = (pos.entry_price * pos.qty + price * qty) / total;
                pos.qty = total;
                b.positions.insert(symbol.to_string(), pos);
            }
            None if reduce_only => {
                return Err(ExchangeError::Rejected {
                    code: 110017,
                    message: "current position is zero, cannot fix reduce-only order qty".into(),
                });
            }
            None => {
                b.positions.insert(
                    symbol.to_string(),
                    LivePosition {
                        side: side.position_side(),
                        qty,
                        entry_price: price,
                        stop_loss: None,
                        take_profit: None,
                    },
                );
            }
        }

        b.next_order_id += 1;
        let order_id = format!("paper-{}", b.next_order_id);
        debug!(symbol, %side, qty, price, reduce_only, order_id = %order_id, "paper: order filled");
        Ok(OrderFill {
            order_id,
            filled_qty: Some(qty),
        })
    }

    async fn set_stop_and_take(
        &self,
        symbol: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<StopUpdate, ExchangeError> {
        let mut b = self.book.lock();
        let last = b.prices.get(symbol).copied();
        let Some(pos) = b.positions.get_mut(symbol) else {
            return Err(ExchangeError::Rejected {
                code: 10001,
                message: "can not set tp/sl/ts for zero position".into(),
            });
        };
        let unchanged = stop_loss.map_or(true, |s| pos.stop_loss == Some(s))
            && take_profit.map_or(true, |t| pos.take_profit == Some(t));
        if unchanged {
            return Ok(StopUpdate::AlreadyAligned);
        }
        if stop_loss.is_some() {
            pos.stop_loss = stop_loss;
        }
        if take_profit.is_some() {
            pos.take_profit = take_profit;
        }
        if let Some(price) = last {
            b.apply_triggers(symbol, price);
        }
        Ok(StopUpdate::Applied)
    }
}
