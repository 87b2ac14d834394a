// =============================================================================
// Partial Exit — close a fraction of the position at an R-multiple
// =============================================================================
//
// Fires once per position lifetime when R_now >= trigger_R.  R is measured
// from entry and the stop percentage captured at entry, independently of the
// trailing stop's progress.
//
// `partial_done` is the idempotency guard.  It is set when the reduce order
// succeeds, or when the quantized target is zero (nothing will ever be
// closable).  Any other failure leaves it untouched so the next tick retries.
// A read that shows no position skips the attempt and leaves the record to
// close confirmation.
// The caller persists the record after every outcome that changed it.
// =============================================================================

use tracing::{debug, info, warn};

use crate::exchange::{new_order_link_id, ExchangeClient, ExchangeError};
use crate::registry::PositionRecord;
use crate::retry::RetryPolicy;
use crate::risk;
use crate::settings::PartialConfig;

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PartialOutcome {
    Applied {
        closed_qty: f64,
        remaining_qty: f64,
        r_now: f64,
        pnl: f64,
    },
    /// Quantized target was zero; `partial_done` has been set.
    SkippedZeroQty,
    /// The exchange reports no position.  Left to close confirmation;
    /// `partial_done` is unchanged.
    SkippedNoPosition,
    /// The order failed; `partial_done` is unchanged.
    Failed(ExchangeError),
}

impl PartialOutcome {
    /// Whether the record was mutated and must be persisted.
    pub fn changed_record(&self) -> bool {
        !matches!(self, Self::Failed(_) | Self::SkippedNoPosition)
    }
}

/// `(fire, R_now)` for `record` at `price`.
pub fn should_trigger(record: &PositionRecord, price: f64, cfg: &PartialConfig) -> (bool, f64) {
    let risk = record.risk_per_unit();
    if !(risk > 0.0) || !price.is_finite() {
        return (false, 0.0);
    }
    let r_now = record.side.sign() * (price - record.entry_price) / risk;
    let fire = cfg.enabled && record.open && !record.partial_done && r_now >= cfg.trigger_r;
    (fire, r_now)
}

/// Close `fraction` of the open quantity with a reduce-only market order.
pub async fn execute<E: ExchangeClient>(
    symbol: &str,
    record: &mut PositionRecord,
    price: f64,
    cfg: &PartialConfig,
    exchange: &E,
    retry: &RetryPolicy,
    fee_rate: f64,
) -> PartialOutcome {
    let (_, r_now) = should_trigger(record, price, cfg);

    let filters = match retry
        .run("instrument_filters", || exchange.instrument_filters(symbol))
        .await
    {
        Ok(f) => f,
        Err(e) => {
            warn!(symbol, error = %e, "partial: instrument filters unavailable");
            return PartialOutcome::Failed(e);
        }
    };

    let mut target = filters.quantize_qty(record.qty * cfg.fraction);

    // Clamp to what the exchange says is still open.
    match retry
        .run("open_position", || exchange.open_position(symbol))
        .await
    {
        Ok(Some(live)) if live.qty < target => {
            debug!(symbol, target, live_qty = live.qty, "partial: clamped to live quantity");
            target = filters.quantize_qty(live.qty);
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            info!(symbol, "partial: exchange reports no position, skipping");
            return PartialOutcome::SkippedNoPosition;
        }
        Err(e) => debug!(symbol, error = %e, "partial: live read failed, using local quantity"),
    }

    if target <= 0.0 {
        record.partial_done = true;
        info!(
            symbol,
            qty = record.qty,
            fraction = cfg.fraction,
            "partial: quantized size is zero, marking done"
        );
        return PartialOutcome::SkippedZeroQty;
    }

    let order_side = record.side.closing_order_side();
    let link_id = new_order_link_id();
    let placed = match retry
        .run("place_market_order", || {
            exchange.place_market_order(symbol, order_side, target, true, &link_id)
        })
        .await
    {
        Err(e) if e.is_reduce_only_rejection() => {
            warn!(symbol, error = %e, "partial: reduce-only rejected, retrying without flag");
            let fallback_id = new_order_link_id();
            retry
                .run("place_market_order", || {
                    exchange.place_market_order(symbol, order_side, target, false, &fallback_id)
                })
                .await
        }
        other => other,
    };

    let fill = match placed {
        Ok(fill) => fill,
        Err(e) => {
            warn!(symbol, qty = target, error = %e, "partial: order failed, will retry next tick");
            return PartialOutcome::Failed(e);
        }
    };

    let closed_qty = fill
        .filled_qty
        .filter(|q| *q > 0.0)
        .unwrap_or(target)
        .min(record.qty);
    let pnl = risk::pnl(record.side, record.entry_price, price, closed_qty, fee_rate);

    record.qty = (record.qty - closed_qty).max(0.0);
    record.partial_done = true;
    record.realized_pnl += pnl;

    info!(
        symbol,
        order_id = %fill.order_id,
        closed_qty,
        remaining_qty = record.qty,
        r_now,
        pnl,
        "partial exit executed"
    );

    PartialOutcome::Applied {
        closed_qty,
        remaining_qty: record.qty,
        r_now,
        pnl,
    }
}
