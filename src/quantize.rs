// =============================================================================
// Quantization — snap quantities and prices to exchange filters
// =============================================================================
//
// Steps are applied in decimal space so that `floor(x / step) * step` does not
// drift by one ulp and so that quantizing an already-quantized value is a
// no-op.  Values that cannot be represented fall back to plain f64 maths.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lot / tick constraints for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentFilters {
    pub qty_step: f64,
    pub min_qty: f64,
    pub tick_size: f64,
}

impl Default for InstrumentFilters {
    fn default() -> Self {
        Self {
            qty_step: 0.001,
            min_qty: 0.001,
            tick_size: 0.01,
        }
    }
}

impl InstrumentFilters {
    /// Floor `qty` to the lot step; returns 0 when the result is under `min_qty`.
    pub fn quantize_qty(&self, qty: f64) -> f64 {
        quantize_qty(qty, self.qty_step, self.min_qty)
    }

    /// Round `price` to the nearest tick.
    pub fn quantize_price(&self, price: f64) -> f64 {
        round_to_tick(price, self.tick_size)
    }
}

fn to_decimal(x: f64) -> Option<Decimal> {
    x.to_string().parse::<Decimal>().ok()
}

fn from_decimal(d: Decimal) -> Option<f64> {
    d.normalize().to_string().parse::<f64>().ok()
}

/// `floor(x / step) * step`. Non-finite or negative input yields 0.
pub fn floor_to_step(x: f64, step: f64) -> f64 {
    if !x.is_finite() || x <= 0.0 {
        return 0.0;
    }
    if !step.is_finite() || step <= 0.0 {
        return x;
    }
    match (to_decimal(x), to_decimal(step)) {
        (Some(dx), Some(ds)) if !ds.is_zero() => dx
            .checked_div(ds)
            .map(|q| q.floor())
            .and_then(|q| q.checked_mul(ds))
            .and_then(from_decimal)
            .unwrap_or_else(|| (x / step).floor() * step),
        _ => (x / step).floor() * step,
    }
}

/// Round `price` to the nearest multiple of `tick`.
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if !price.is_finite() {
        return 0.0;
    }
    if !tick.is_finite() || tick <= 0.0 {
        return price;
    }
    match (to_decimal(price), to_decimal(tick)) {
        (Some(dp), Some(dt)) if !dt.is_zero() => dp
            .checked_div(dt)
            .map(|q| q.round())
            .and_then(|q| q.checked_mul(dt))
            .and_then(from_decimal)
            .unwrap_or_else(|| (price / tick).round() * tick),
        _ => (price / tick).round() * tick,
    }
}

/// Floor to `step`, then zero out anything below `min_qty`.
pub fn quantize_qty(qty: f64, step: f64, min_qty: f64) -> f64 {
    let q = floor_to_step(qty, step);
    if q < min_qty || q <= 0.0 {
        0.0
    } else {
        q
    }
}
