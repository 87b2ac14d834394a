// =============================================================================
// Trailing Stop — breakeven arming + monotonic ratchet
// =============================================================================
//
// States: INACTIVE → ARMED (one-shot) → trailing for the rest of the position's
// life.  Risk is measured from the immutable initial stop:
//
//   risk   = |entry - initial_stop|
//   R_now  = (price - entry) / risk          (mirrored for shorts)
//
// Once `R_now >= trigger_R` the stop moves to entry if that is an improvement.
// From then on the stop follows the best price at `distance_R * risk` and only
// ever tightens.  `candidate_stop` is what was computed, `last_notified_stop`
// is what the exchange actually accepted; `push_gate` decides when the former
// is worth sending.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::settings::TrailingConfig;
use crate::types::Side;

// =============================================================================
// TrailingState
// =============================================================================

/// Per-position trailing bookkeeping, persisted inside the position record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingState {
    pub enabled: bool,
    #[serde(rename = "trigger_R")]
    pub trigger_r: f64,
    #[serde(rename = "distance_R")]
    pub distance_r: f64,
    pub side: Side,
    pub entry_price: f64,
    /// Stop placed at entry.  Defines `risk` and never changes.
    pub initial_stop: f64,
    #[serde(default)]
    pub armed: bool,
    /// Peak (LONG) or trough (SHORT) since arming.
    #[serde(default)]
    pub best_price: Option<f64>,
    #[serde(default)]
    pub candidate_stop: Option<f64>,
    #[serde(default)]
    pub last_notified_stop: Option<f64>,
    #[serde(default)]
    pub last_notified_at: Option<DateTime<Utc>>,
}

/// Result of feeding one price into the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingUpdate {
    pub stop_candidate: Option<f64>,
    /// The candidate tightened on this update.
    pub moved: bool,
    /// Breakeven armed on this update.
    pub armed_now: bool,
}

impl TrailingState {
    /// Fresh state for a position opened at `entry` with a stop `stop_loss_pct` away.
    pub fn new(cfg: &TrailingConfig, side: Side, entry: f64, stop_loss_pct: f64) -> Self {
        Self {
            enabled: cfg.enabled,
            trigger_r: cfg.trigger_r,
            distance_r: cfg.distance_r,
            side,
            entry_price: entry,
            initial_stop: entry - side.sign() * entry * stop_loss_pct / 100.0,
            armed: false,
            best_price: None,
            candidate_stop: None,
            last_notified_stop: None,
            last_notified_at: None,
        }
    }

    pub fn risk(&self) -> f64 {
        (self.entry_price - self.initial_stop).abs()
    }

    /// Signed distance from entry in units of risk. `None` when risk is zero.
    pub fn r_multiple(&self, price: f64) -> Option<f64> {
        let risk = self.risk();
        if !(risk > 0.0) || !price.is_finite() {
            return None;
        }
        Some(self.side.sign() * (price - self.entry_price) / risk)
    }

    /// The stop currently protecting the position, as far as we computed it.
    pub fn effective_stop(&self) -> f64 {
        self.candidate_stop.unwrap_or(self.initial_stop)
    }

    /// Feed one price observation.
    pub fn update(&mut self, price: f64) -> TrailingUpdate {
        let mut out = TrailingUpdate {
            stop_candidate: self.candidate_stop,
            moved: false,
            armed_now: false,
        };
        if !self.enabled {
            return out;
        }
        let Some(r_now) = self.r_multiple(price) else {
            return out;
        };
        let risk = self.risk();

        if !self.armed && r_now >= self.trigger_r {
            self.armed = true;
            self.best_price = Some(price);
            out.armed_now = true;
            if self.side.stop_improves(self.entry_price, self.effective_stop()) {
                self.candidate_stop = Some(self.entry_price);
                out.moved = true;
            }
            info!(
                side = %self.side,
                entry = self.entry_price,
                price,
                r_now,
                "breakeven armed"
            );
        }

        if self.armed {
            let best = match (self.side, self.best_price) {
                (Side::Long, Some(b)) => b.max(price),
                (Side::Short, Some(b)) => b.min(price),
                (_, None) => price,
            };
            self.best_price = Some(best);

            let new_stop = best - self.side.sign() * self.distance_r * risk;
            if self.side.stop_improves(new_stop, self.effective_stop()) {
                self.candidate_stop = Some(new_stop);
                out.moved = true;
            } else {
                debug!(new_stop, current = self.effective_stop(), "trailing candidate discarded");
            }
        }

        out.stop_candidate = self.candidate_stop;
        out
    }

    /// A computed stop exists that is tighter than what the exchange last accepted.
    pub fn pending_push(&self) -> Option<f64> {
        let candidate = self.candidate_stop?;
        match self.last_notified_stop {
            Some(last) if !self.side.stop_improves(candidate, last) => None,
            _ => Some(candidate),
        }
    }

    /// Remember that `stop` was accepted by the exchange at `now`.
    pub fn record_push(&mut self, stop: f64, now: DateTime<Utc>) {
        self.last_notified_stop = Some(stop);
        self.last_notified_at = Some(now);
    }
}

// =============================================================================
// Push gate
// =============================================================================

/// Why a candidate stop was not sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushSkip {
    /// Improvement over the last pushed stop is below `min_move_pct`.
    BelowMinMove,
    /// Inside the cooldown since the last push.
    CoolingDown,
    /// Not tighter than the stop the exchange currently holds.
    NotMonotonic,
    /// The stop would sit on the wrong side of the current price.
    CrossesPrice,
}

impl std::fmt::Display for PushSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BelowMinMove => write!(f, "below min move"),
            Self::CoolingDown => write!(f, "cooling down"),
            Self::NotMonotonic => write!(f, "not monotonic vs exchange stop"),
            Self::CrossesPrice => write!(f, "crosses current price"),
        }
    }
}

/// Gates applied to an already tick-quantized candidate before pushing it.
pub fn push_gate(
    state: &TrailingState,
    quantized: f64,
    price: f64,
    exchange_stop: Option<f64>,
    cfg: &TrailingConfig,
    now: DateTime<Utc>,
) -> Result<(), PushSkip> {
    let side = state.side;

    if let Some(last) = state.last_notified_stop {
        if last > 0.0 {
            let improvement_pct = side.sign() * (quantized - last) / last * 100.0;
            if improvement_pct < cfg.min_move_pct {
                return Err(PushSkip::BelowMinMove);
            }
        }
    }

    if let Some(at) = state.last_notified_at {
        if now - at < cfg.cooldown() {
            return Err(PushSkip::CoolingDown);
        }
    }

    let reference = match (exchange_stop, state.last_notified_stop) {
        (Some(x), Some(l)) => Some(side.tighter_stop(x, l)),
        (x, l) => x.or(l),
    };
    if let Some(reference) = reference {
        if !side.stop_improves(quantized, reference) {
            return Err(PushSkip::NotMonotonic);
        }
    }

    if !side.stop_improves(price, quantized) {
        return Err(PushSkip::CrossesPrice);
    }

    Ok(())
}
