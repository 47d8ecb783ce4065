use serde::{Deserialize, Serialize};

use super::venue::VenueId;

/// A ranked funding-arbitrage candidate. Computed on demand, never persisted.
///
/// Fee and profit figures are estimates from resting rates and fee
/// schedules; they do not include real-time bid/ask crossing cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    /// Venue with the lower normalized rate (we pay less / receive more long).
    pub long_venue: VenueId,
    /// Venue with the higher normalized rate (shorts collect it).
    pub short_venue: VenueId,
    pub long_rate_8h: f64,
    pub short_rate_8h: f64,
    /// `|short_rate_8h − long_rate_8h|`, the harvestable spread per period.
    pub divergence: f64,
    /// Entry + exit taker fees across both legs.
    pub est_fees: f64,
    pub net_profit_pct: f64,
    pub annualized_apy: f64,
    /// Smaller of the two venues' open interest.
    pub min_oi_usd: f64,
    pub min_volume_24h: f64,
    pub avg_spread_bps: Option<f64>,
}

/// Sort key for finder output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    NetProfit,
    Divergence,
    Apy,
    OpenInterest,
}

/// Caller-supplied filters applied by the finder before ranking.
#[derive(Debug, Clone, Default)]
pub struct OpportunityFilter {
    pub symbols: Option<Vec<String>>,
    pub venue_whitelist: Option<Vec<VenueId>>,
    pub venue_blacklist: Vec<VenueId>,
    pub long_venue_whitelist: Option<Vec<VenueId>>,
    pub short_venue_whitelist: Option<Vec<VenueId>>,
    pub min_divergence: Option<f64>,
    pub max_divergence: Option<f64>,
    pub min_oi_usd: Option<f64>,
    pub max_oi_usd: Option<f64>,
    /// Allowed ratio between the two venues' OI, `smaller / larger`.
    pub min_oi_ratio: Option<f64>,
    pub max_spread_bps: Option<f64>,
    pub min_volume_24h: Option<f64>,
    pub min_net_profit_pct: Option<f64>,
    pub sort: SortKey,
}
