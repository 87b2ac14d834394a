// =============================================================================
// Shared types used across the position warden
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for longs, -1.0 for shorts. Multiply a price delta by this to get
    /// the move in the position's favour.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Order side that opens a position in this direction.
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction.
    pub fn closing_order_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }

    /// `true` when `candidate` is a strictly tighter stop than `current` for
    /// this direction (higher for longs, lower for shorts).
    pub fn stop_improves(self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Long => candidate > current,
            Self::Short => candidate < current,
        }
    }

    /// The more protective of two stop prices.
    pub fn tighter_stop(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Long => a.max(b),
            Self::Short => a.min(b),
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Exchange order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Parse the exchange's side field ("Buy" / "Sell", any case).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }

    /// Direction of the position this side opens.
    pub fn position_side(self) -> Side {
        match self {
            Self::Buy => Side::Long,
            Self::Sell => Side::Short,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// Whether orders reach the real exchange or an in-process simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Paper,
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// A position as reported by the exchange. Authoritative for existence and
/// quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePosition {
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

/// Acknowledgement of a market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    /// Filled quantity when the exchange reports it synchronously.
    #[serde(default)]
    pub filled_qty: Option<f64>,
}

/// Outcome of a stop-loss / take-profit update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopUpdate {
    Applied,
    /// The exchange already held the requested values ("not modified").
    AlreadyAligned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_side_is_opposite_of_entry() {
        assert_eq!(Side::Long.entry_order_side(), OrderSide::Buy);
        assert_eq!(Side::Long.closing_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.closing_order_side(), OrderSide::Buy);
    }

    #[test]
    fn stop_improvement_respects_direction() {
        assert!(Side::Long.stop_improves(99.5, 99.0));
        assert!(!Side::Long.stop_improves(98.5, 99.0));
        assert!(Side::Short.stop_improves(100.5, 101.0));
        assert!(!Side::Short.stop_improves(101.0, 101.0));
        assert_eq!(Side::Short.tighter_stop(101.0, 100.5), 100.5);
    }

    #[test]
    fn order_side_parses_exchange_casing() {
        assert_eq!(OrderSide::parse("Buy"), Some(OrderSide::Buy));
        assert_eq!(OrderSide::parse(" SELL "), Some(OrderSide::Sell));
        assert_eq!(OrderSide::parse(""), None);
        assert_eq!(OrderSide::Sell.position_side(), Side::Short);
    }

    #[test]
    fn side_serialises_uppercase() {
        let json = serde_json::to_string(&Side::Short).unwrap();
        assert_eq!(json, "\"SHORT\"");
        let mode: ExecutionMode = serde_json::from_str("\"live\"").unwrap();
        assert_eq!(mode, ExecutionMode::Live);
    }
}
