// =============================================================================
// Risk maths — entry sizing, fee-aware PnL and exit labelling
// =============================================================================
//
// Sizing:
//   qty = min(risk_usdt / (stop% * price), leverage * target_margin / price)
//   floored to the lot step, raised to the exchange minimum.
//
// PnL charges the taker fee on both legs (notional in + notional out).
//
// Exit labelling compares the observed exit price against the configured
// stop / take levels and the last trailing stop with a tolerance of
// max(2.5 ticks, 0.03 % of entry).  The exchange does not report why a
// position closed, so the label is best effort and never drives state.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::quantize::{floor_to_step, InstrumentFilters};
use crate::registry::PositionRecord;
use crate::settings::RiskParams;
use crate::types::Side;

/// Tolerance floor, as a fraction of entry, for exit labelling.
const EXIT_TOLERANCE_ENTRY_FRACTION: f64 = 0.0003;
/// Tolerance floor, in ticks, for exit labelling.
const EXIT_TOLERANCE_TICKS: f64 = 2.5;

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// Quantity for a new entry at `price` with a stop `stop_loss_pct` away.
pub fn position_size(
    risk: &RiskParams,
    stop_loss_pct: f64,
    price: f64,
    filters: &InstrumentFilters,
) -> f64 {
    if !(price > 0.0) || !(stop_loss_pct > 0.0) {
        return 0.0;
    }
    let by_risk = risk.risk_usdt / (stop_loss_pct / 100.0 * price);
    let by_margin = risk.leverage * risk.target_margin_usdt / price;
    let raw = by_risk.min(by_margin);
    if !(raw > 0.0) {
        return 0.0;
    }
    floor_to_step(raw, filters.qty_step).max(filters.min_qty)
}

// ---------------------------------------------------------------------------
// PnL
// ---------------------------------------------------------------------------

/// Net PnL of closing `qty` at `exit` after entering at `entry`.
pub fn pnl(side: Side, entry: f64, exit: f64, qty: f64, fee_rate: f64) -> f64 {
    let gross = side.sign() * (exit - entry) * qty;
    let fees = (entry * qty + exit * qty) * fee_rate;
    gross - fees
}

/// Price move in the position's favour, in percent of entry.
pub fn result_pct(side: Side, entry: f64, exit: f64) -> f64 {
    if entry <= 0.0 {
        return 0.0;
    }
    side.sign() * (exit - entry) / entry * 100.0
}

/// PnL as a percentage of account capital.
pub fn capital_impact_pct(pnl: f64, capital: f64) -> f64 {
    if capital <= 0.0 {
        return 0.0;
    }
    pnl / capital * 100.0
}

// ---------------------------------------------------------------------------
// Exit labelling
// ---------------------------------------------------------------------------

/// Best-effort reason a position closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "Stop Loss"),
            Self::TakeProfit => write!(f, "Take Profit"),
            Self::TrailingStop => write!(f, "Trailing Stop"),
            Self::Manual => write!(f, "Manual"),
        }
    }
}

pub fn exit_tolerance(entry: f64, tick: f64) -> f64 {
    (tick * EXIT_TOLERANCE_TICKS).max(entry * EXIT_TOLERANCE_ENTRY_FRACTION)
}

/// Label a close observed at `exit_price`.
pub fn classify_exit(record: &PositionRecord, exit_price: f64, tick: f64) -> ExitReason {
    let side = record.side;
    let tol = exit_tolerance(record.entry_price, tick);
    let near = |level: f64| (exit_price - level).abs() <= tol;

    // Only a stop the exchange accepted can have closed the position.
    let trailing_stop = record
        .trailing
        .last_notified_stop
        .filter(|_| record.trailing.armed);
    if let Some(stop) = trailing_stop {
        // at or through the trailed stop
        if near(stop) || !side.stop_improves(exit_price, stop) {
            return ExitReason::TrailingStop;
        }
    }

    let stop = record.stop_price();
    let take = record.take_price();
    if near(stop) || !side.stop_improves(exit_price, stop) {
        ExitReason::StopLoss
    } else if near(take) || side.stop_improves(exit_price, take) {
        ExitReason::TakeProfit
    } else {
        ExitReason::Manual
    }
}
