//! Durable record of paired positions and their funding payments.

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Db;
use crate::model::{ExitReason, FundingPayment, PairedPosition, PositionStatus};

/// Everything the executor knows at fill confirmation time.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub account: String,
    pub strategy_name: String,
    pub symbol: String,
    pub long_venue: String,
    pub short_venue: String,
    pub size_usd: f64,
    pub base_qty: f64,
    pub entry_long_price: f64,
    pub entry_short_price: f64,
    pub entry_fees_usd: f64,
    pub entry_long_rate: f64,
    pub entry_short_rate: f64,
    pub entry_divergence: f64,
    pub opened_at: i64,
}

/// Result of the idempotent create: either a fresh row or the already-active
/// pair for the same `(account, symbol, long_venue, short_venue)` tuple.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(PairedPosition),
    Duplicate(PairedPosition),
}

#[derive(Clone)]
pub struct PositionStore {
    db: Db,
}

impl PositionStore {
    pub fn new(db: Db) -> Self {
        PositionStore { db }
    }

    /// Check-then-insert under the connection lock; the partial unique index
    /// on active tuples backstops it across processes, so a concurrent retry
    /// can never double-add.
    pub async fn create_open(&self, new: &NewPosition) -> Result<CreateOutcome> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let existing = Self::query_active_pair(
            &tx,
            &new.account,
            &new.symbol,
            &new.long_venue,
            &new.short_venue,
        )?;
        if let Some(pos) = existing {
            tx.commit()?;
            return Ok(CreateOutcome::Duplicate(pos));
        }

        tx.execute(
            "INSERT INTO strategy_positions
                 (account, strategy_name, symbol, long_venue, short_venue,
                  size_usd, base_qty, entry_long_price, entry_short_price, entry_fees_usd,
                  entry_long_rate, entry_short_rate, entry_divergence, opened_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 'open')",
            params![
                new.account,
                new.strategy_name,
                new.symbol,
                new.long_venue,
                new.short_venue,
                new.size_usd,
                new.base_qty,
                new.entry_long_price,
                new.entry_short_price,
                new.entry_fees_usd,
                new.entry_long_rate,
                new.entry_short_rate,
                new.entry_divergence,
                new.opened_at
            ],
        )?;
        let id = tx.last_insert_rowid();
        let position = Self::query_by_id(&tx, id)?
            .context("freshly inserted position must exist")?;
        tx.commit()?;
        Ok(CreateOutcome::Created(position))
    }

    pub async fn get(&self, id: i64) -> Result<Option<PairedPosition>> {
        let conn = self.db.lock().await;
        Self::query_by_id(&conn, id)
    }

    /// The active pair for a dedup tuple, if any (executor pre-flight).
    pub async fn active_pair(
        &self,
        account: &str,
        symbol: &str,
        long_venue: &str,
        short_venue: &str,
    ) -> Result<Option<PairedPosition>> {
        let conn = self.db.lock().await;
        Self::query_active_pair(&conn, account, symbol, long_venue, short_venue)
    }

    /// Active (open or pending-close) positions, optionally one account's.
    pub async fn list_active(&self, account: Option<&str>) -> Result<Vec<PairedPosition>> {
        let conn = self.db.lock().await;
        let sql = "SELECT * FROM strategy_positions
                   WHERE status IN ('open', 'pending_close')
                     AND (?1 IS NULL OR account = ?1)
                   ORDER BY id";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![account], Self::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing active positions")
    }

    pub async fn list_open(&self, account: &str) -> Result<Vec<PairedPosition>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM strategy_positions WHERE status = 'open' AND account = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([account], Self::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing open positions")
    }

    /// `open → pending_close`. Returns false when the position was not open
    /// (already being closed, or closed) — callers treat that as "someone
    /// else got here first".
    pub async fn mark_pending_close(&self, id: i64) -> Result<bool> {
        let conn = self.db.lock().await;
        let changed = conn.execute(
            "UPDATE strategy_positions SET status = 'pending_close'
             WHERE id = ?1 AND status = 'open'",
            [id],
        )?;
        Ok(changed == 1)
    }

    /// Finalize a close. Idempotent: closing an already-closed position
    /// returns the stored row untouched.
    pub async fn close(
        &self,
        id: i64,
        exit_reason: ExitReason,
        realized_pnl_usd: f64,
        closed_at: i64,
    ) -> Result<PairedPosition> {
        let conn = self.db.lock().await;
        let current = Self::query_by_id(&conn, id)?
            .with_context(|| format!("position {id} not found"))?;
        if current.status == PositionStatus::Closed {
            return Ok(current);
        }
        let changed = conn.execute(
            "UPDATE strategy_positions
             SET status = 'closed', closed_at = ?2, exit_reason = ?3, realized_pnl_usd = ?4
             WHERE id = ?1 AND status IN ('open', 'pending_close')",
            params![id, closed_at, exit_reason.as_str(), realized_pnl_usd],
        )?;
        if changed != 1 {
            bail!(
                "position {id} in status {} cannot close",
                current.status.as_str()
            );
        }
        Self::query_by_id(&conn, id)?.context("closed position must exist")
    }

    /// A close that left a residual leg: operator attention required. The
    /// failure detail goes to the audit log / notification, not this row.
    pub async fn mark_error(&self, id: i64) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE strategy_positions SET status = 'error'
             WHERE id = ?1 AND status != 'closed'",
            [id],
        )?;
        Ok(())
    }

    /// Append one funding payment and fold it into the position's cumulative
    /// total in the same transaction. Re-observing the same
    /// `(position, payment_time)` is a no-op, so repeated polls never
    /// double-count the cumulative figure.
    pub async fn append_funding_payment(&self, payment: &FundingPayment) -> Result<bool> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO funding_payments
                 (position_id, payment_time, long_payment, short_payment, net_payment,
                  long_rate, short_rate, divergence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                payment.position_id,
                payment.payment_time,
                payment.long_payment,
                payment.short_payment,
                payment.net_payment,
                payment.long_rate,
                payment.short_rate,
                payment.divergence
            ],
        )?;
        if inserted == 1 {
            tx.execute(
                "UPDATE strategy_positions
                 SET cumulative_funding_usd = cumulative_funding_usd + ?2,
                     funding_payments_count = funding_payments_count + 1
                 WHERE id = ?1",
                params![payment.position_id, payment.net_payment],
            )?;
        }
        tx.commit()?;
        Ok(inserted == 1)
    }

    pub async fn funding_payments(&self, position_id: i64) -> Result<Vec<FundingPayment>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT position_id, payment_time, long_payment, short_payment, net_payment,
                    long_rate, short_rate, divergence
             FROM funding_payments WHERE position_id = ?1 ORDER BY payment_time",
        )?;
        let rows = stmt.query_map([position_id], |row| {
            Ok(FundingPayment {
                position_id: row.get(0)?,
                payment_time: row.get(1)?,
                long_payment: row.get(2)?,
                short_payment: row.get(3)?,
                net_payment: row.get(4)?,
                long_rate: row.get(5)?,
                short_rate: row.get(6)?,
                divergence: row.get(7)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing funding payments")
    }

    // ── Row mapping ─────────────────────────────────────────────────

    fn query_by_id(conn: &Connection, id: i64) -> Result<Option<PairedPosition>> {
        conn.query_row(
            "SELECT * FROM strategy_positions WHERE id = ?1",
            [id],
            Self::from_row,
        )
        .optional()
        .context("loading position")
    }

    fn query_active_pair(
        conn: &Connection,
        account: &str,
        symbol: &str,
        long_venue: &str,
        short_venue: &str,
    ) -> Result<Option<PairedPosition>> {
        conn.query_row(
            "SELECT * FROM strategy_positions
             WHERE account = ?1 AND symbol = ?2 AND long_venue = ?3 AND short_venue = ?4
               AND status IN ('open', 'pending_close')",
            params![account, symbol, long_venue, short_venue],
            Self::from_row,
        )
        .optional()
        .context("loading active pair")
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<PairedPosition> {
        let status: String = row.get("status")?;
        let exit_reason: Option<String> = row.get("exit_reason")?;
        Ok(PairedPosition {
            id: row.get("id")?,
            account: row.get("account")?,
            strategy_name: row.get("strategy_name")?,
            symbol: row.get("symbol")?,
            long_venue: row.get("long_venue")?,
            short_venue: row.get("short_venue")?,
            size_usd: row.get("size_usd")?,
            base_qty: row.get("base_qty")?,
            entry_long_price: row.get("entry_long_price")?,
            entry_short_price: row.get("entry_short_price")?,
            entry_fees_usd: row.get("entry_fees_usd")?,
            entry_long_rate: row.get("entry_long_rate")?,
            entry_short_rate: row.get("entry_short_rate")?,
            entry_divergence: row.get("entry_divergence")?,
            opened_at: row.get("opened_at")?,
            status: PositionStatus::parse(&status).unwrap_or(PositionStatus::Error),
            cumulative_funding_usd: row.get("cumulative_funding_usd")?,
            funding_payments_count: row.get("funding_payments_count")?,
            closed_at: row.get("closed_at")?,
            exit_reason: exit_reason.as_deref().and_then(ExitReason::parse),
            realized_pnl_usd: row.get("realized_pnl_usd")?,
        })
    }
}
