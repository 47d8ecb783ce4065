use serde::{Deserialize, Serialize};

use super::venue::VenueId;

/// Per-venue mapping for a venue-agnostic base symbol ("BTC").
///
/// Rounding/min-notional fields come from venue market metadata; the
/// funding-interval override, when present, wins over the venue default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueSymbol {
    pub venue: VenueId,
    pub symbol: String,
    /// The symbol string the venue itself understands (e.g. "BTC-PERP").
    pub native_symbol: String,
    pub tick_size: f64,
    pub step_size: f64,
    pub min_notional_usd: f64,
    /// Symbol-specific funding interval, only stored when it deviates from
    /// the venue default.
    pub funding_interval_hours: Option<f64>,
}

impl VenueSymbol {
    /// Round a base-asset quantity down to this venue's step size.
    pub fn round_qty_down(&self, qty: f64) -> f64 {
        if self.step_size <= 0.0 {
            return qty;
        }
        (qty / self.step_size).floor() * self.step_size
    }

    /// Round a price to this venue's tick size (nearest).
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }
}
