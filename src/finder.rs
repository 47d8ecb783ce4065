//! On-demand funding-arbitrage candidate ranking.
//!
//! Joins the latest normalized rates with per-venue liquidity metrics and
//! fee schedules. Everything here is an estimate from resting data; the
//! executor re-checks against live books before committing capital.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::context::Context;
use crate::model::{FundingRateSample, Opportunity, OpportunityFilter, SortKey};

pub struct OpportunityFinder {
    ctx: Arc<Context>,
}

impl OpportunityFinder {
    pub fn new(ctx: Arc<Context>) -> Self {
        OpportunityFinder { ctx }
    }

    /// Rank all venue pairs passing the filter, best first.
    pub async fn find(&self, filter: &OpportunityFilter) -> Result<Vec<Opportunity>> {
        let by_symbol = self.ctx.rates.latest_rates().await?;
        let mut candidates = Vec::new();

        for (symbol, samples) in &by_symbol {
            if let Some(symbols) = &filter.symbols {
                if !symbols.iter().any(|s| s == symbol) {
                    continue;
                }
            }
            if samples.len() < 2 {
                continue;
            }

            for i in 0..samples.len() {
                for j in (i + 1)..samples.len() {
                    if let Some(opp) = self
                        .build_candidate(symbol, &samples[i], &samples[j], filter)
                        .await?
                    {
                        candidates.push(opp);
                    }
                }
            }
        }

        sort_candidates(&mut candidates, filter.sort);
        debug!(count = candidates.len(), "opportunity scan complete");
        Ok(candidates)
    }

    async fn build_candidate(
        &self,
        symbol: &str,
        a: &FundingRateSample,
        b: &FundingRateSample,
        filter: &OpportunityFilter,
    ) -> Result<Option<Opportunity>> {
        // Shorts collect the higher rate: long the lower-rate venue, short
        // the higher-rate one.
        let (long, short) = if a.rate_8h <= b.rate_8h { (a, b) } else { (b, a) };

        if !venue_allowed(filter, &long.venue, &short.venue) {
            return Ok(None);
        }

        let divergence = (short.rate_8h - long.rate_8h).abs();
        if let Some(min) = filter.min_divergence {
            if divergence < min {
                return Ok(None);
            }
        }
        if let Some(max) = filter.max_divergence {
            if divergence > max {
                return Ok(None);
            }
        }

        // Cold-start rule: a venue appears in candidates only once a market
        // data sample exists alongside its funding sample.
        let Some(long_market) = self.ctx.rates.market_metrics(&long.venue, symbol).await? else {
            return Ok(None);
        };
        let Some(short_market) = self.ctx.rates.market_metrics(&short.venue, symbol).await? else {
            return Ok(None);
        };

        let fee = |venue: &str| {
            self.ctx
                .venue(venue)
                .map(|c| c.meta().fees.taker)
                .unwrap_or(0.0005)
        };
        // Entry + exit, both legs.
        let est_fees = (fee(&long.venue) + fee(&short.venue)) * 2.0;
        let net_profit_pct = divergence - est_fees;
        let annualized_apy = divergence * 3.0 * 365.0;

        let min_oi_usd = long_market
            .open_interest_usd
            .min(short_market.open_interest_usd);
        let max_oi_usd = long_market
            .open_interest_usd
            .max(short_market.open_interest_usd);
        let min_volume_24h = long_market.volume_24h_usd.min(short_market.volume_24h_usd);
        let avg_spread_bps = match (long_market.spread_bps, short_market.spread_bps) {
            (Some(l), Some(s)) => Some((l + s) / 2.0),
            (one, other) => one.or(other),
        };

        if let Some(min) = filter.min_oi_usd {
            if min_oi_usd < min {
                return Ok(None);
            }
        }
        if let Some(max) = filter.max_oi_usd {
            if max_oi_usd > max {
                return Ok(None);
            }
        }
        if let Some(min_ratio) = filter.min_oi_ratio {
            let ratio = if max_oi_usd > 0.0 { min_oi_usd / max_oi_usd } else { 0.0 };
            if ratio < min_ratio {
                return Ok(None);
            }
        }
        if let Some(max_spread) = filter.max_spread_bps {
            if avg_spread_bps.is_some_and(|s| s > max_spread) {
                return Ok(None);
            }
        }
        if let Some(min_vol) = filter.min_volume_24h {
            if min_volume_24h < min_vol {
                return Ok(None);
            }
        }
        if let Some(min_profit) = filter.min_net_profit_pct {
            if net_profit_pct < min_profit {
                return Ok(None);
            }
        }

        Ok(Some(Opportunity {
            symbol: symbol.to_string(),
            long_venue: long.venue.clone(),
            short_venue: short.venue.clone(),
            long_rate_8h: long.rate_8h,
            short_rate_8h: short.rate_8h,
            divergence,
            est_fees,
            net_profit_pct,
            annualized_apy,
            min_oi_usd,
            min_volume_24h,
            avg_spread_bps,
        }))
    }
}

fn venue_allowed(filter: &OpportunityFilter, long_venue: &str, short_venue: &str) -> bool {
    for venue in [long_venue, short_venue] {
        if filter.venue_blacklist.iter().any(|v| v == venue) {
            return false;
        }
        if let Some(whitelist) = &filter.venue_whitelist {
            if !whitelist.iter().any(|v| v == venue) {
                return false;
            }
        }
    }
    if let Some(longs) = &filter.long_venue_whitelist {
        if !longs.iter().any(|v| v == long_venue) {
            return false;
        }
    }
    if let Some(shorts) = &filter.short_venue_whitelist {
        if !shorts.iter().any(|v| v == short_venue) {
            return false;
        }
    }
    true
}

fn sort_candidates(candidates: &mut [Opportunity], key: SortKey) {
    let metric = |o: &Opportunity| match key {
        SortKey::NetProfit => o.net_profit_pct,
        SortKey::Divergence => o.divergence,
        SortKey::Apy => o.annualized_apy,
        SortKey::OpenInterest => o.min_oi_usd,
    };
    candidates.sort_by(|a, b| {
        metric(b)
            .partial_cmp(&metric(a))
            .unwrap_or(Ordering::Equal)
    });
}
