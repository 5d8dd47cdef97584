use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

const FLOOR_NOISE_DECIMALS: u32 = 12;

/// Venue tick and lot rounding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precision {
    pub price_decimals: u32,
    pub qty_decimals: u32,
}

impl Default for Precision {
    fn default() -> Self {
        Self {
            price_decimals: 2,
            qty_decimals: 3,
        }
    }
}

impl Precision {
    pub fn new(price_decimals: u32, qty_decimals: u32) -> Self {
        Self {
            price_decimals,
            qty_decimals,
        }
    }

    pub fn price(&self, value: f64) -> f64 {
        round_to(value, self.price_decimals)
    }

    pub fn qty(&self, value: f64) -> f64 {
        round_to(value, self.qty_decimals)
    }

    /// Quantity truncated toward zero to whole lots
    ///
    /// Binary noise (0.3 / 3 = 0.0999...) is rounded off before truncating.
    pub fn qty_floor(&self, value: f64) -> f64 {
        Decimal::from_f64(value)
            .map(|d| {
                d.round_dp(FLOOR_NOISE_DECIMALS)
                    .round_dp_with_strategy(self.qty_decimals, RoundingStrategy::ToZero)
            })
            .and_then(|d| d.to_f64())
            .unwrap_or(value)
    }
}

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: u32) -> f64 {
    Decimal::from_f64(value)
        .map(|d| d.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|d| d.to_f64())
        .unwrap_or(value)
}
