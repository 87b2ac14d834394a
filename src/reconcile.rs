// =============================================================================
// Reconciliation — decide what a position read means for the local registry
// =============================================================================
//
// The exchange is authoritative for whether a position exists and for its
// size.  This module keeps the per-symbol bookkeeping that turns individual
// position reads into decisions:
//
//   * a local open record missing on the exchange is closed only after
//     `miss_confirm_count` consecutive successful reads without it;
//   * a live position with no local record is adopted as a manual entry,
//     unless a close was just confirmed (holdoff) or the same position was
//     adopted moments ago (debounce);
//   * a live position whose side or entry no longer matches the open record
//     ends that record and is adopted as a new position;
//   * exchange SL/TP that drifted from the record beyond a tolerance are
//     re-placed, never loosening a stop the exchange already tightened.
//
// Nothing here talks to the exchange.  A failed read is not an observation
// and must not reach `record_miss`.
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::quantize::InstrumentFilters;
use crate::registry::PositionRecord;
use crate::settings::ReconcileConfig;
use crate::types::{LivePosition, Side};

// ---------------------------------------------------------------------------
// Position signature
// ---------------------------------------------------------------------------

/// Identity of a live position for duplicate detection: side, entry rounded to
/// 4 decimals and quantity rounded to 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    side: Side,
    entry_e4: i64,
    qty_e6: i64,
}

impl Signature {
    pub fn of(pos: &LivePosition) -> Self {
        Self {
            side: pos.side,
            entry_e4: (pos.entry_price * 1e4).round() as i64,
            qty_e6: (pos.qty * 1e6).round() as i64,
        }
    }
}

/// `true` when `live` is still the position `record` was opened for: same
/// side and the same entry at signature precision.  A flip or a re-entry
/// between two polls shows up as a changed side or average entry.
pub fn same_lifetime(record: &PositionRecord, live: &LivePosition) -> bool {
    record.side == live.side
        && (record.entry_price * 1e4).round() as i64 == (live.entry_price * 1e4).round() as i64
}

/// The live stop, unless it sits on the wrong side of entry for the live
/// direction (left over from a previous position on the same symbol).
pub fn protective_stop(live: &LivePosition) -> Option<f64> {
    live.stop_loss
        .filter(|stop| *stop > 0.0 && live.side.stop_improves(live.entry_price, *stop))
}

// ---------------------------------------------------------------------------
// Per-symbol watch state
// ---------------------------------------------------------------------------

/// Result of counting one absent read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissOutcome {
    /// Not yet confirmed.
    Pending { misses: u32, needed: u32 },
    /// Enough consecutive misses; the close should be applied.
    Confirmed,
}

/// What to do with a live position that has no local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenDecision {
    Adopt,
    /// A close was confirmed less than the holdoff window ago.
    Holdoff,
    /// The same signature was adopted inside the debounce window.
    Duplicate,
}

/// Volatile reconciliation memory for one symbol.  Not persisted: after a
/// restart the startup pass rebuilds what matters.
#[derive(Debug, Clone, Default)]
pub struct SymbolWatch {
    pub miss_count: u32,
    pub last_adopted: Option<(Signature, DateTime<Utc>)>,
    pub last_closed_at: Option<DateTime<Utc>>,
    /// Stop the exchange was last seen holding or last accepted from us.
    pub exchange_stop: Option<f64>,
}

impl SymbolWatch {
    /// The position was seen on the exchange.  Returns the number of misses
    /// that were pending, if any.
    pub fn record_seen(&mut self) -> Option<u32> {
        let pending = std::mem::take(&mut self.miss_count);
        (pending > 0).then_some(pending)
    }

    /// A successful read came back without the position.
    pub fn record_miss(&mut self, needed: u32) -> MissOutcome {
        let needed = needed.max(1);
        self.miss_count += 1;
        if self.miss_count >= needed {
            MissOutcome::Confirmed
        } else {
            MissOutcome::Pending {
                misses: self.miss_count,
                needed,
            }
        }
    }

    /// A close was applied locally at `now`.
    pub fn record_close(&mut self, now: DateTime<Utc>) {
        self.miss_count = 0;
        self.last_closed_at = Some(now);
        self.exchange_stop = None;
    }

    pub fn evaluate_open(
        &self,
        live: &LivePosition,
        cfg: &ReconcileConfig,
        now: DateTime<Utc>,
    ) -> OpenDecision {
        if let Some(closed_at) = self.last_closed_at {
            if now - closed_at < cfg.holdoff_window() {
                return OpenDecision::Holdoff;
            }
        }
        if let Some((sig, at)) = self.last_adopted {
            if sig == Signature::of(live) && now - at < cfg.debounce_window() {
                return OpenDecision::Duplicate;
            }
        }
        OpenDecision::Adopt
    }

    pub fn record_adopted(&mut self, live: &LivePosition, now: DateTime<Utc>) {
        self.miss_count = 0;
        self.exchange_stop = live.stop_loss;
        self.last_adopted = Some((Signature::of(live), now));
    }
}

// ---------------------------------------------------------------------------
// SL/TP alignment
// ---------------------------------------------------------------------------

/// Legs that need re-placing.  `None` means the exchange already matches.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StopTakePlan {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl StopTakePlan {
    pub fn is_empty(&self) -> bool {
        self.stop_loss.is_none() && self.take_profit.is_none()
    }
}

/// `true` when `actual` is missing or differs from `desired` by more than
/// `tolerance_pct` percent.
pub fn needs_update(desired: f64, actual: Option<f64>, tolerance_pct: f64) -> bool {
    match actual {
        None => true,
        Some(a) if desired.abs() > 0.0 => (a - desired).abs() / desired.abs() * 100.0 > tolerance_pct,
        Some(a) => a != desired,
    }
}

/// Stop the exchange should hold: the tightest of the configured stop, the
/// last trailed stop it accepted and whatever it currently holds.
pub fn desired_stop(record: &PositionRecord, exchange_stop: Option<f64>) -> f64 {
    let side = record.side;
    let mut stop = record.stop_price();
    if let Some(trailed) = record.trailing.last_notified_stop {
        stop = side.tighter_stop(stop, trailed);
    }
    if let Some(held) = exchange_stop.filter(|s| *s > 0.0) {
        stop = side.tighter_stop(stop, held);
    }
    stop
}

/// Compare the record against the live position and return the legs to push.
pub fn plan_alignment(
    record: &PositionRecord,
    live: &LivePosition,
    filters: &InstrumentFilters,
    tolerance_pct: f64,
) -> StopTakePlan {
    let stop = filters.quantize_price(desired_stop(record, live.stop_loss));
    let take = filters.quantize_price(record.take_price());
    let plan = StopTakePlan {
        stop_loss: needs_update(stop, live.stop_loss, tolerance_pct).then_some(stop),
        take_profit: needs_update(take, live.take_profit, tolerance_pct).then_some(take),
    };
    debug!(
        desired_sl = stop,
        desired_tp = take,
        live_sl = ?live.stop_loss,
        live_tp = ?live.take_profit,
        push_sl = plan.stop_loss.is_some(),
        push_tp = plan.take_profit.is_some(),
        "sl/tp alignment planned"
    );
    plan
}
