use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Venue identifier (e.g. "hyperion", "driftline"). Lowercase, stable,
/// used as a foreign key everywhere.
pub type VenueId = String;

/// Taker/maker fee schedule, expressed as fractions (0.0005 = 5 bps).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FeeSchedule {
    pub maker: f64,
    pub taker: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        FeeSchedule {
            maker: 0.0002,
            taker: 0.0005,
        }
    }
}

/// Static venue metadata as persisted in the `venues` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueMeta {
    pub id: VenueId,
    /// Default hours between funding payments for this venue.
    /// Symbols may override it (see `VenueSymbol::funding_interval_hours`).
    pub funding_interval_hours: f64,
    pub fees: FeeSchedule,
    /// Whether the venue's closing orders can rest as maker when non-urgent.
    pub supports_post_only: bool,
}

/// Rolling health counters for one venue, updated by the collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VenueHealth {
    pub last_success_at: Option<i64>,
    pub consecutive_errors: u32,
}
