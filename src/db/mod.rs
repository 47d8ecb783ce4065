pub mod accounts;
pub mod crypto;
pub mod notify;
pub mod positions;
pub mod rates;
pub mod runs;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;

/// The database is the source of truth for all position and strategy state;
/// one connection per process, shared behind a mutex.
pub type Db = Arc<Mutex<Connection>>;

pub fn open(path: &Path) -> Result<Db> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("creating db directory")?;
    }

    let conn = Connection::open(path)
        .with_context(|| format!("opening sqlite at {}", path.display()))?;

    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database with the full schema; used by tests and `--paper`.
pub fn open_in_memory() -> Result<Db> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS accounts (
            id        TEXT PRIMARY KEY,
            name      TEXT NOT NULL,
            user      TEXT,
            active    INTEGER NOT NULL DEFAULT 1,
            is_admin  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS exchange_credentials (
            account     TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            venue       TEXT NOT NULL,
            ciphertext  TEXT NOT NULL,
            PRIMARY KEY (account, venue)
        );

        CREATE TABLE IF NOT EXISTS proxies (
            url         TEXT PRIMARY KEY,
            created_at  INTEGER DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS proxy_assignments (
            account    TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            proxy_url  TEXT NOT NULL REFERENCES proxies(url),
            priority   INTEGER NOT NULL DEFAULT 0,
            status     TEXT NOT NULL DEFAULT 'active'
                       CHECK (status IN ('active', 'standby', 'burned')),
            PRIMARY KEY (account, proxy_url)
        );

        CREATE TABLE IF NOT EXISTS venues (
            id                      TEXT PRIMARY KEY,
            funding_interval_hours  REAL NOT NULL DEFAULT 8.0,
            maker_fee               REAL NOT NULL DEFAULT 0.0002,
            taker_fee               REAL NOT NULL DEFAULT 0.0005,
            supports_post_only      INTEGER NOT NULL DEFAULT 1,
            last_success_at         INTEGER,
            consecutive_errors      INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS symbols (
            symbol  TEXT PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS venue_symbols (
            venue                   TEXT NOT NULL REFERENCES venues(id),
            symbol                  TEXT NOT NULL,
            native_symbol           TEXT NOT NULL,
            tick_size               REAL NOT NULL DEFAULT 0,
            step_size               REAL NOT NULL DEFAULT 0,
            min_notional_usd        REAL NOT NULL DEFAULT 0,
            funding_interval_hours  REAL,
            volume_24h_usd          REAL NOT NULL DEFAULT 0,
            open_interest_usd       REAL NOT NULL DEFAULT 0,
            spread_bps              REAL,
            updated_at              INTEGER,
            PRIMARY KEY (venue, symbol)
        );

        -- Rates at rest are 8h-normalized; the native form rides along for
        -- auditability.
        CREATE TABLE IF NOT EXISTS latest_funding_rates (
            venue            TEXT NOT NULL,
            symbol           TEXT NOT NULL,
            rate_8h          REAL NOT NULL,
            rate_native      REAL NOT NULL,
            interval_hours   REAL NOT NULL,
            observed_at      INTEGER NOT NULL,
            next_payment_at  INTEGER,
            PRIMARY KEY (venue, symbol)
        );

        CREATE TABLE IF NOT EXISTS funding_rates (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            venue           TEXT NOT NULL,
            symbol          TEXT NOT NULL,
            rate_8h         REAL NOT NULL,
            rate_native     REAL NOT NULL,
            interval_hours  REAL NOT NULL,
            observed_at     INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS strategy_positions (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            account                 TEXT NOT NULL,
            strategy_name           TEXT NOT NULL,
            symbol                  TEXT NOT NULL,
            long_venue              TEXT NOT NULL,
            short_venue             TEXT NOT NULL,
            size_usd                REAL NOT NULL,
            base_qty                REAL NOT NULL,
            entry_long_price        REAL NOT NULL,
            entry_short_price       REAL NOT NULL,
            entry_fees_usd          REAL NOT NULL DEFAULT 0,
            entry_long_rate         REAL NOT NULL,
            entry_short_rate        REAL NOT NULL,
            entry_divergence        REAL NOT NULL,
            opened_at               INTEGER NOT NULL,
            status                  TEXT NOT NULL DEFAULT 'open'
                                    CHECK (status IN ('open', 'pending_close', 'closed', 'error')),
            cumulative_funding_usd  REAL NOT NULL DEFAULT 0,
            funding_payments_count  INTEGER NOT NULL DEFAULT 0,
            closed_at               INTEGER,
            exit_reason             TEXT,
            realized_pnl_usd        REAL
        );

        -- At most one active pair per (account, symbol, venue pair) tuple.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_active_pair
            ON strategy_positions (account, symbol, long_venue, short_venue)
            WHERE status IN ('open', 'pending_close');

        -- One payment row per (position, settlement time).
        CREATE TABLE IF NOT EXISTS funding_payments (
            position_id    INTEGER NOT NULL REFERENCES strategy_positions(id),
            payment_time   INTEGER NOT NULL,
            long_payment   REAL NOT NULL,
            short_payment  REAL NOT NULL,
            net_payment    REAL NOT NULL,
            long_rate      REAL NOT NULL,
            short_rate     REAL NOT NULL,
            divergence     REAL NOT NULL,
            UNIQUE (position_id, payment_time)
        );

        CREATE TABLE IF NOT EXISTS strategy_runs (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            user            TEXT NOT NULL,
            account         TEXT NOT NULL,
            config_id       TEXT NOT NULL,
            program_name    TEXT NOT NULL UNIQUE,
            control_port    INTEGER NOT NULL,
            status          TEXT NOT NULL DEFAULT 'starting'
                            CHECK (status IN ('starting', 'running', 'stopped', 'error', 'paused')),
            health          TEXT NOT NULL DEFAULT 'unknown'
                            CHECK (health IN ('unknown', 'healthy', 'degraded', 'unhealthy')),
            last_heartbeat  INTEGER,
            error_count     INTEGER NOT NULL DEFAULT 0,
            error_message   TEXT,
            started_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS safety_limits (
            user               TEXT PRIMARY KEY,
            daily_start_limit  INTEGER NOT NULL DEFAULT 10,
            cooldown_secs      INTEGER NOT NULL DEFAULT 300,
            max_error_rate     REAL NOT NULL DEFAULT 0.5,
            error_rate_window  INTEGER NOT NULL DEFAULT 20
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            at      INTEGER NOT NULL,
            actor   TEXT NOT NULL,
            action  TEXT NOT NULL,
            detail  TEXT
        );

        CREATE TABLE IF NOT EXISTS strategy_notifications (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            at                 INTEGER NOT NULL,
            account            TEXT NOT NULL,
            run_id             INTEGER,
            notification_type  TEXT NOT NULL
                               CHECK (notification_type IN (
                                   'position_opened', 'position_closed',
                                   'insufficient_margin', 'liquidation_risk')),
            message            TEXT NOT NULL,
            delivered          INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            user      TEXT PRIMARY KEY,
            key_hash  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS config (
            key    TEXT PRIMARY KEY,
            value  TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }
}
