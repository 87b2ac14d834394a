// =============================================================================
// Test doubles: scripted exchange, in-memory store, recording notifier
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use crate::exchange::{ExchangeClient, ExchangeError};
use crate::notify::{Event, Notifier};
use crate::quantize::InstrumentFilters;
use crate::registry::{RegistrySnapshot, StateStore};
use crate::types::{LivePosition, OrderFill, OrderSide, StopUpdate};

// -----------------------------------------------------------------------------
// ScriptedExchange
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStop {
    pub symbol: String,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

type Read = Result<Option<LivePosition>, ExchangeError>;

#[derive(Default)]
struct Book {
    live: HashMap<String, LivePosition>,
    queued: HashMap<String, VecDeque<Read>>,
    prices: HashMap<String, f64>,
    filters: InstrumentFilters,
    orders: Vec<RecordedOrder>,
    stops: Vec<RecordedStop>,
    reject_reduce_only: bool,
    order_error: Option<ExchangeError>,
    stop_error: Option<ExchangeError>,
    price_error: Option<ExchangeError>,
    position_reads: usize,
}

/// In-memory exchange whose reads can be scripted.  Orders mutate the live
/// book so read-after-write behaves like a real venue.
#[derive(Default)]
pub struct ScriptedExchange {
    book: Mutex<Book>,
}

impl ScriptedExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persistent live position, returned whenever no scripted read is queued.
    pub fn set_live(&self, symbol: &str, pos: Option<LivePosition>) {
        let mut b = self.book.lock();
        match pos {
            Some(p) => {
                b.live.insert(symbol.to_string(), p);
            }
            None => {
                b.live.remove(symbol);
            }
        }
    }

    /// One-shot read result, consumed before falling back to the live book.
    pub fn queue_read(&self, symbol: &str, read: Read) {
        self.book
            .lock()
            .queued
            .entry(symbol.to_string())
            .or_default()
            .push_back(read);
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.book.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_filters(&self, filters: InstrumentFilters) {
        self.book.lock().filters = filters;
    }

    pub fn reject_reduce_only(&self, on: bool) {
        self.book.lock().reject_reduce_only = on;
    }

    pub fn fail_orders(&self, err: Option<ExchangeError>) {
        self.book.lock().order_error = err;
    }

    pub fn fail_stops(&self, err: Option<ExchangeError>) {
        self.book.lock().stop_error = err;
    }

    pub fn fail_prices(&self, err: Option<ExchangeError>) {
        self.book.lock().price_error = err;
    }

    pub fn orders(&self) -> Vec<RecordedOrder> {
        self.book.lock().orders.clone()
    }

    pub fn stops(&self) -> Vec<RecordedStop> {
        self.book.lock().stops.clone()
    }

    pub fn live(&self, symbol: &str) -> Option<LivePosition> {
        self.book.lock().live.get(symbol).cloned()
    }

    pub fn position_reads(&self) -> usize {
        self.book.lock().position_reads
    }
}

impl ExchangeClient for ScriptedExchange {
    async fn open_position(&self, symbol: &str) -> Result<Option<LivePosition>, ExchangeError> {
        let mut b = self.book.lock();
        b.position_reads += 1;
        if let Some(read) = b.queued.get_mut(symbol).and_then(|q| q.pop_front()) {
            return read;
        }
        Ok(b.live.get(symbol).cloned())
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let b = self.book.lock();
        if let Some(e) = &b.price_error {
            return Err(e.clone());
        }
        b.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Malformed(format!("no price for {symbol}")))
    }

    async fn instrument_filters(&self, _symbol: &str) -> Result<InstrumentFilters, ExchangeError> {
        Ok(self.book.lock().filters)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        reduce_only: bool,
        _link_id: &str,
    ) -> Result<OrderFill, ExchangeError> {
        let mut b = self.book.lock();
        if let Some(e) = &b.order_error {
            return Err(e.clone());
        }
        if reduce_only && b.reject_reduce_only {
            return Err(ExchangeError::Rejected {
                code: 10001,
                message: "reduceOnly flag not supported".into(),
            });
        }

        let price = b.prices.get(symbol).copied().unwrap_or(100.0);
        let existing = b.live.get(symbol).cloned();
        match existing {
            Some(mut pos) if pos.side.closing_order_side() == side => {
                pos.qty -= qty;
                if pos.qty <= 1e-12 {
                    b.live.remove(symbol);
                } else {
                    b.live.insert(symbol.to_string(), pos);
                }
            }
            Some(mut pos) => {
                let total = pos.qty + qty;
                pos.entry_price = (pos.entry_price * pos.qty + price * qty) / total;
                pos.qty = total;
                b.live.insert(symbol.to_string(), pos);
            }
            None if !reduce_only => {
                b.live.insert(
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
            None => {
                return Err(ExchangeError::Rejected {
                    code: 110017,
                    message: "current position is zero, cannot fix reduce-only order qty".into(),
                });
            }
        }

        b.orders.push(RecordedOrder {
            symbol: symbol.to_string(),
            side,
            qty,
            reduce_only,
        });
        Ok(OrderFill {
            order_id: format!("scripted-{}", b.orders.len()),
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
        if let Some(e) = &b.stop_error {
            return Err(e.clone());
        }
        b.stops.push(RecordedStop {
            symbol: symbol.to_string(),
            stop_loss,
            take_profit,
        });
        let Some(pos) = b.live.get_mut(symbol) else {
            return Ok(StopUpdate::AlreadyAligned);
        };
        let unchanged = stop_loss.map_or(true, |s| pos.stop_loss == Some(s))
            && take_profit.map_or(true, |t| pos.take_profit == Some(t));
        if stop_loss.is_some() {
            pos.stop_loss = stop_loss;
        }
        if take_profit.is_some() {
            pos.take_profit = take_profit;
        }
        Ok(if unchanged {
            StopUpdate::AlreadyAligned
        } else {
            StopUpdate::Applied
        })
    }
}

// -----------------------------------------------------------------------------
// MemoryStore
// -----------------------------------------------------------------------------

/// Clonable in-memory `StateStore`; clones share the same slot.
#[derive(Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<RegistrySnapshot>>>,
    saves: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn with_snapshot(snapshot: RegistrySnapshot) -> Self {
        let store = Self::default();
        *store.slot.lock() = Some(snapshot);
        store
    }

    pub fn saved(&self) -> Option<RegistrySnapshot> {
        self.slot.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn fail_saves(&self, on: bool) {
        self.fail.store(on, Ordering::SeqCst);
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Option<RegistrySnapshot>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.slot.lock() = Some(snapshot.clone());
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// RecordingNotifier
// -----------------------------------------------------------------------------

/// Clonable notifier that keeps every event.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(Event::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}
