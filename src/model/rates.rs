use serde::{Deserialize, Serialize};

use super::venue::VenueId;

/// Hours of the canonical funding basis. Every rate at rest and every
/// cross-venue comparison uses this basis.
pub const CANONICAL_INTERVAL_HOURS: f64 = 8.0;

/// One observed funding rate on one venue, in both native and normalized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRateSample {
    pub venue: VenueId,
    pub symbol: String,
    /// The rate as the venue quotes it, per its own payment interval.
    pub rate_native: f64,
    /// Hours between payments for this sample.
    pub interval_hours: f64,
    /// `rate_native × 8 / interval_hours`.
    pub rate_8h: f64,
    pub observed_at: i64,
    pub next_payment_at: Option<i64>,
}

impl FundingRateSample {
    pub fn new(
        venue: impl Into<VenueId>,
        symbol: impl Into<String>,
        rate_native: f64,
        interval_hours: f64,
        observed_at: i64,
    ) -> Self {
        let interval = if interval_hours > 0.0 {
            interval_hours
        } else {
            CANONICAL_INTERVAL_HOURS
        };
        FundingRateSample {
            venue: venue.into(),
            symbol: symbol.into(),
            rate_native,
            interval_hours: interval,
            rate_8h: normalize_rate_8h(rate_native, interval),
            observed_at,
            next_payment_at: None,
        }
    }
}

/// Normalize a native funding rate to the canonical 8-hour basis.
///
/// Normalizing an already-8h rate is the identity. A non-positive interval
/// is treated as the canonical one rather than poisoning the comparison.
pub fn normalize_rate_8h(rate_native: f64, interval_hours: f64) -> f64 {
    if interval_hours <= 0.0 {
        return rate_native;
    }
    rate_native * CANONICAL_INTERVAL_HOURS / interval_hours
}

/// Resolve the funding interval for one `(venue, symbol)`:
/// symbol override, else venue default, else 8 hours.
pub fn effective_interval_hours(
    symbol_override: Option<f64>,
    venue_default: Option<f64>,
) -> f64 {
    symbol_override
        .filter(|h| *h > 0.0)
        .or(venue_default.filter(|h| *h > 0.0))
        .unwrap_or(CANONICAL_INTERVAL_HOURS)
}

/// Liquidity metrics for one `(venue, symbol)`, refreshed by the collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketMetrics {
    pub volume_24h_usd: f64,
    pub open_interest_usd: f64,
    pub spread_bps: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hourly_rate_normalizes_to_8h() {
        assert!((normalize_rate_8h(0.0001, 1.0) - 0.0008).abs() < 1e-12);
    }

    #[test]
    fn normalizing_8h_rate_is_identity() {
        assert_eq!(normalize_rate_8h(0.0002, 8.0), 0.0002);
    }

    #[test]
    fn interval_resolution_precedence() {
        assert_eq!(effective_interval_hours(Some(1.0), Some(4.0)), 1.0);
        assert_eq!(effective_interval_hours(None, Some(4.0)), 4.0);
        assert_eq!(effective_interval_hours(None, None), 8.0);
        // Garbage overrides fall back rather than divide by zero.
        assert_eq!(effective_interval_hours(Some(0.0), None), 8.0);
    }
}
