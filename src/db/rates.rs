//! Funding-rate and market-metadata persistence.
//!
//! `latest_funding_rates` holds exactly one row per `(venue, symbol)` with
//! the 8h-normalized rate; `funding_rates` is the append-only history.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::Db;
use crate::model::{FundingRateSample, MarketMetrics, VenueMeta, VenueSymbol};

#[derive(Clone)]
pub struct RateStore {
    db: Db,
}

impl RateStore {
    pub fn new(db: Db) -> Self {
        RateStore { db }
    }

    pub async fn upsert_venue(&self, meta: &VenueMeta) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO venues (id, funding_interval_hours, maker_fee, taker_fee, supports_post_only)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 funding_interval_hours = excluded.funding_interval_hours,
                 maker_fee = excluded.maker_fee,
                 taker_fee = excluded.taker_fee,
                 supports_post_only = excluded.supports_post_only",
            params![
                meta.id,
                meta.funding_interval_hours,
                meta.fees.maker,
                meta.fees.taker,
                meta.supports_post_only
            ],
        )?;
        Ok(())
    }

    /// Upsert the latest rate and append to history, in one transaction.
    /// Samples arrive already normalized; this only persists.
    pub async fn record_sample(&self, sample: &FundingRateSample) -> Result<()> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO symbols (symbol) VALUES (?1)",
            [&sample.symbol],
        )?;
        tx.execute(
            "INSERT INTO latest_funding_rates
                 (venue, symbol, rate_8h, rate_native, interval_hours, observed_at, next_payment_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(venue, symbol) DO UPDATE SET
                 rate_8h = excluded.rate_8h,
                 rate_native = excluded.rate_native,
                 interval_hours = excluded.interval_hours,
                 observed_at = excluded.observed_at,
                 next_payment_at = excluded.next_payment_at",
            params![
                sample.venue,
                sample.symbol,
                sample.rate_8h,
                sample.rate_native,
                sample.interval_hours,
                sample.observed_at,
                sample.next_payment_at
            ],
        )?;
        tx.execute(
            "INSERT INTO funding_rates
                 (venue, symbol, rate_8h, rate_native, interval_hours, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sample.venue,
                sample.symbol,
                sample.rate_8h,
                sample.rate_native,
                sample.interval_hours,
                sample.observed_at
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All latest rates, keyed by symbol then venue.
    pub async fn latest_rates(&self) -> Result<HashMap<String, Vec<FundingRateSample>>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT venue, symbol, rate_8h, rate_native, interval_hours, observed_at, next_payment_at
             FROM latest_funding_rates",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FundingRateSample {
                venue: row.get(0)?,
                symbol: row.get(1)?,
                rate_8h: row.get(2)?,
                rate_native: row.get(3)?,
                interval_hours: row.get(4)?,
                observed_at: row.get(5)?,
                next_payment_at: row.get(6)?,
            })
        })?;

        let mut out: HashMap<String, Vec<FundingRateSample>> = HashMap::new();
        for row in rows {
            let sample = row?;
            out.entry(sample.symbol.clone()).or_default().push(sample);
        }
        Ok(out)
    }

    pub async fn latest_rate(
        &self,
        venue: &str,
        symbol: &str,
    ) -> Result<Option<FundingRateSample>> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT venue, symbol, rate_8h, rate_native, interval_hours, observed_at, next_payment_at
             FROM latest_funding_rates WHERE venue = ?1 AND symbol = ?2",
            params![venue, symbol],
            |row| {
                Ok(FundingRateSample {
                    venue: row.get(0)?,
                    symbol: row.get(1)?,
                    rate_8h: row.get(2)?,
                    rate_native: row.get(3)?,
                    interval_hours: row.get(4)?,
                    observed_at: row.get(5)?,
                    next_payment_at: row.get(6)?,
                })
            },
        )
        .optional()
        .context("loading latest rate")
    }

    /// Persist symbol metadata; the funding-interval override sticks so
    /// later normalizations stay stable even if the venue stops reporting it.
    pub async fn upsert_venue_symbol(&self, sym: &VenueSymbol) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO symbols (symbol) VALUES (?1)",
            [&sym.symbol],
        )?;
        conn.execute(
            "INSERT INTO venue_symbols
                 (venue, symbol, native_symbol, tick_size, step_size, min_notional_usd,
                  funding_interval_hours, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, unixepoch())
             ON CONFLICT(venue, symbol) DO UPDATE SET
                 native_symbol = excluded.native_symbol,
                 tick_size = excluded.tick_size,
                 step_size = excluded.step_size,
                 min_notional_usd = excluded.min_notional_usd,
                 funding_interval_hours =
                     COALESCE(excluded.funding_interval_hours, venue_symbols.funding_interval_hours),
                 updated_at = excluded.updated_at",
            params![
                sym.venue,
                sym.symbol,
                sym.native_symbol,
                sym.tick_size,
                sym.step_size,
                sym.min_notional_usd,
                sym.funding_interval_hours
            ],
        )?;
        Ok(())
    }

    pub async fn update_market_metrics(
        &self,
        venue: &str,
        symbol: &str,
        metrics: &MarketMetrics,
    ) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE venue_symbols SET
                 volume_24h_usd = ?3, open_interest_usd = ?4, spread_bps = ?5,
                 updated_at = unixepoch()
             WHERE venue = ?1 AND symbol = ?2",
            params![
                venue,
                symbol,
                metrics.volume_24h_usd,
                metrics.open_interest_usd,
                metrics.spread_bps
            ],
        )?;
        Ok(())
    }

    pub async fn market_metrics(&self, venue: &str, symbol: &str) -> Result<Option<MarketMetrics>> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT volume_24h_usd, open_interest_usd, spread_bps
             FROM venue_symbols WHERE venue = ?1 AND symbol = ?2 AND updated_at IS NOT NULL",
            params![venue, symbol],
            |row| {
                Ok(MarketMetrics {
                    volume_24h_usd: row.get(0)?,
                    open_interest_usd: row.get(1)?,
                    spread_bps: row.get(2)?,
                })
            },
        )
        .optional()
        .context("loading market metrics")
    }

    pub async fn venue_symbol(&self, venue: &str, symbol: &str) -> Result<Option<VenueSymbol>> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT venue, symbol, native_symbol, tick_size, step_size, min_notional_usd,
                    funding_interval_hours
             FROM venue_symbols WHERE venue = ?1 AND symbol = ?2",
            params![venue, symbol],
            |row| {
                Ok(VenueSymbol {
                    venue: row.get(0)?,
                    symbol: row.get(1)?,
                    native_symbol: row.get(2)?,
                    tick_size: row.get(3)?,
                    step_size: row.get(4)?,
                    min_notional_usd: row.get(5)?,
                    funding_interval_hours: row.get(6)?,
                })
            },
        )
        .optional()
        .context("loading venue symbol")
    }

    pub async fn venue_meta(&self, venue: &str) -> Result<Option<VenueMeta>> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT id, funding_interval_hours, maker_fee, taker_fee, supports_post_only
             FROM venues WHERE id = ?1",
            [venue],
            |row| {
                Ok(VenueMeta {
                    id: row.get(0)?,
                    funding_interval_hours: row.get(1)?,
                    fees: crate::model::FeeSchedule {
                        maker: row.get(2)?,
                        taker: row.get(3)?,
                    },
                    supports_post_only: row.get(4)?,
                })
            },
        )
        .optional()
        .context("loading venue meta")
    }

    pub async fn venue_health(&self, venue: &str) -> Result<crate::model::VenueHealth> {
        let conn = self.db.lock().await;
        let found = conn
            .query_row(
                "SELECT last_success_at, consecutive_errors FROM venues WHERE id = ?1",
                [venue],
                |row| {
                    Ok(crate::model::VenueHealth {
                        last_success_at: row.get(0)?,
                        consecutive_errors: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(found.unwrap_or_default())
    }

    /// Success resets the error streak; failure bumps it.
    pub async fn record_venue_health(&self, venue: &str, success: bool) -> Result<()> {
        let conn = self.db.lock().await;
        if success {
            conn.execute(
                "UPDATE venues SET last_success_at = unixepoch(), consecutive_errors = 0
                 WHERE id = ?1",
                [venue],
            )?;
        } else {
            conn.execute(
                "UPDATE venues SET consecutive_errors = consecutive_errors + 1 WHERE id = ?1",
                [venue],
            )?;
        }
        Ok(())
    }
}
