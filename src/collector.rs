//! Funding-rate and market-data collection.
//!
//! One scan cycle per interval per venue: rates first, then liquidity
//! metrics. Every rate is stored 8h-normalized using
//! `symbol_override ?? venue_default ?? 8h`; observed per-symbol interval
//! deviations are persisted so later normalizations stay stable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::model::effective_interval_hours;

pub struct FundingCollector {
    ctx: Arc<Context>,
    interval: Duration,
}

impl FundingCollector {
    pub fn new(ctx: Arc<Context>) -> Self {
        let interval = Duration::from_secs_f64(ctx.config.scan_interval_sec);
        FundingCollector { ctx, interval }
    }

    /// Persist venue metadata and symbol mappings once, before the first
    /// scan. Interval overrides observed here already land in the DB.
    pub async fn sync_metadata(&self) -> Result<()> {
        for (venue_id, client) in &self.ctx.venues {
            self.ctx.rates.upsert_venue(client.meta()).await?;
            match client.fetch_symbols().await {
                Ok(symbols) => {
                    for sym in &symbols {
                        self.ctx.rates.upsert_venue_symbol(sym).await?;
                    }
                    debug!(venue = %venue_id, count = symbols.len(), "symbol metadata synced");
                }
                Err(err) => {
                    warn!(venue = %venue_id, %err, "symbol metadata fetch failed");
                }
            }
        }
        Ok(())
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.collect_once().await {
                        warn!(%err, "collector cycle failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("collector stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One full pass over every venue. Per-venue failures are counted and
    /// logged, never fatal to the cycle.
    pub async fn collect_once(&self) -> Result<()> {
        for (venue_id, client) in &self.ctx.venues {
            let rates = match client.fetch_funding_rates().await {
                Ok(rates) => rates,
                Err(err) => {
                    warn!(venue = %venue_id, %err, "funding rate fetch failed");
                    self.ctx.rates.record_venue_health(venue_id, false).await?;
                    continue;
                }
            };

            let market = match client.fetch_market_data().await {
                Ok(market) => market,
                Err(err) => {
                    warn!(venue = %venue_id, %err, "market data fetch failed");
                    self.ctx.rates.record_venue_health(venue_id, false).await?;
                    continue;
                }
            };

            let venue_default = client.meta().funding_interval_hours;
            let mut stored = 0usize;
            for sample in rates.values() {
                // Adapters normalize before returning; re-derive the
                // effective interval defensively so a sample that lost its
                // interval still lands on the canonical basis.
                let mut sample = sample.clone();
                if sample.interval_hours <= 0.0 {
                    let override_hours = self
                        .ctx
                        .rates
                        .venue_symbol(venue_id, &sample.symbol)
                        .await?
                        .and_then(|s| s.funding_interval_hours);
                    sample.interval_hours =
                        effective_interval_hours(override_hours, Some(venue_default));
                    sample.rate_8h = crate::model::normalize_rate_8h(
                        sample.rate_native,
                        sample.interval_hours,
                    );
                }
                if (sample.interval_hours - venue_default).abs() > f64::EPSILON {
                    warn!(
                        venue = %venue_id,
                        symbol = %sample.symbol,
                        interval = sample.interval_hours,
                        venue_default,
                        "symbol-specific funding interval in effect"
                    );
                }
                self.ctx.rates.record_sample(&sample).await?;
                stored += 1;
            }

            for (symbol, metrics) in &market {
                self.ctx
                    .rates
                    .update_market_metrics(venue_id, symbol, metrics)
                    .await?;
            }

            self.ctx.rates.record_venue_health(venue_id, true).await?;
            debug!(venue = %venue_id, rates = stored, markets = market.len(), "collector cycle ok");
        }
        Ok(())
    }
}
