//! Strategy-run registry, per-user safety limits, audit trail.

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Db;
use crate::model::{RunHealth, RunStatus, StrategyRun};

/// Per-user gates applied before every spawn.
#[derive(Debug, Clone)]
pub struct SafetyLimits {
    pub daily_start_limit: i64,
    pub cooldown_secs: i64,
    pub max_error_rate: f64,
    pub error_rate_window: i64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        SafetyLimits {
            daily_start_limit: 10,
            cooldown_secs: 300,
            max_error_rate: 0.5,
            error_rate_window: 20,
        }
    }
}

#[derive(Clone)]
pub struct RunStore {
    db: Db,
}

impl RunStore {
    pub fn new(db: Db) -> Self {
        RunStore { db }
    }

    /// Insert a run in `starting` and stamp its deterministic program name.
    pub async fn create(
        &self,
        user: &str,
        account: &str,
        config_id: &str,
        control_port: u16,
        started_at: i64,
    ) -> Result<StrategyRun> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO strategy_runs
                 (user, account, config_id, program_name, control_port, status, started_at)
             VALUES (?1, ?2, ?3, '', ?4, 'starting', ?5)",
            params![user, account, config_id, control_port, started_at],
        )?;
        let id = tx.last_insert_rowid();
        let program_name = StrategyRun::program_name_for(id);
        tx.execute(
            "UPDATE strategy_runs SET program_name = ?2 WHERE id = ?1",
            params![id, program_name],
        )?;
        let run = Self::query_by_id(&tx, id)?.context("freshly inserted run must exist")?;
        tx.commit()?;
        Ok(run)
    }

    pub async fn get(&self, id: i64) -> Result<Option<StrategyRun>> {
        let conn = self.db.lock().await;
        Self::query_by_id(&conn, id)
    }

    pub async fn get_by_program(&self, program_name: &str) -> Result<Option<StrategyRun>> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT * FROM strategy_runs WHERE program_name = ?1",
            [program_name],
            Self::from_row,
        )
        .optional()
        .context("loading run by program name")
    }

    pub async fn list(&self) -> Result<Vec<StrategyRun>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM strategy_runs ORDER BY id")?;
        let rows = stmt.query_map([], Self::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing runs")
    }

    pub async fn list_live(&self) -> Result<Vec<StrategyRun>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM strategy_runs WHERE status IN ('starting', 'running') ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing live runs")
    }

    /// Enforce the run state machine; terminal states are sticky.
    pub async fn transition(
        &self,
        id: i64,
        next: RunStatus,
        error_message: Option<&str>,
    ) -> Result<StrategyRun> {
        let conn = self.db.lock().await;
        let current = Self::query_by_id(&conn, id)?
            .with_context(|| format!("run {id} not found"))?;
        if current.status == next {
            return Ok(current);
        }
        if !current.status.can_transition_to(next) {
            bail!(
                "run {id}: illegal transition {} -> {}",
                current.status.as_str(),
                next.as_str()
            );
        }
        conn.execute(
            "UPDATE strategy_runs SET status = ?2,
                 error_message = COALESCE(?3, error_message),
                 error_count = error_count + (CASE WHEN ?2 = 'error' THEN 1 ELSE 0 END)
             WHERE id = ?1",
            params![id, next.as_str(), error_message],
        )?;
        Self::query_by_id(&conn, id)?.context("run must exist after transition")
    }

    /// Heartbeat from the instance; first one flips `starting → running`.
    pub async fn heartbeat(&self, id: i64, at: i64) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE strategy_runs SET last_heartbeat = ?2, health = 'healthy',
                 status = (CASE WHEN status = 'starting' THEN 'running' ELSE status END)
             WHERE id = ?1",
            params![id, at],
        )?;
        Ok(())
    }

    pub async fn set_health(&self, id: i64, health: RunHealth) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE strategy_runs SET health = ?2 WHERE id = ?1",
            params![id, health.as_str()],
        )?;
        Ok(())
    }

    /// Ports currently held by non-terminal runs.
    pub async fn ports_in_use(&self) -> Result<Vec<u16>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT control_port FROM strategy_runs
             WHERE status IN ('starting', 'running', 'paused')",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, u16>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing ports in use")
    }

    // ── Safety limits ───────────────────────────────────────────────

    pub async fn safety_limits(&self, user: &str) -> Result<SafetyLimits> {
        let conn = self.db.lock().await;
        let found = conn
            .query_row(
                "SELECT daily_start_limit, cooldown_secs, max_error_rate, error_rate_window
                 FROM safety_limits WHERE user = ?1",
                [user],
                |row| {
                    Ok(SafetyLimits {
                        daily_start_limit: row.get(0)?,
                        cooldown_secs: row.get(1)?,
                        max_error_rate: row.get(2)?,
                        error_rate_window: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(found.unwrap_or_default())
    }

    pub async fn set_safety_limits(&self, user: &str, limits: &SafetyLimits) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO safety_limits
                 (user, daily_start_limit, cooldown_secs, max_error_rate, error_rate_window)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user) DO UPDATE SET
                 daily_start_limit = excluded.daily_start_limit,
                 cooldown_secs = excluded.cooldown_secs,
                 max_error_rate = excluded.max_error_rate,
                 error_rate_window = excluded.error_rate_window",
            params![
                user,
                limits.daily_start_limit,
                limits.cooldown_secs,
                limits.max_error_rate,
                limits.error_rate_window
            ],
        )?;
        Ok(())
    }

    pub async fn starts_since(&self, user: &str, since: i64) -> Result<i64> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM strategy_runs WHERE user = ?1 AND started_at >= ?2",
            params![user, since],
            |row| row.get(0),
        )
        .context("counting recent starts")
    }

    pub async fn last_start_at(&self, user: &str) -> Result<Option<i64>> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT MAX(started_at) FROM strategy_runs WHERE user = ?1",
            [user],
            |row| row.get(0),
        )
        .context("loading last start time")
    }

    /// Error fraction over the user's last `window` finished runs.
    pub async fn recent_error_rate(&self, user: &str, window: i64) -> Result<f64> {
        let conn = self.db.lock().await;
        let (errors, total): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(status = 'error'), 0), COUNT(*)
             FROM (SELECT status FROM strategy_runs
                   WHERE user = ?1 AND status IN ('stopped', 'error')
                   ORDER BY id DESC LIMIT ?2)",
            params![user, window],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if total == 0 {
            return Ok(0.0);
        }
        Ok(errors as f64 / total as f64)
    }

    // ── Audit ───────────────────────────────────────────────────────

    pub async fn audit(&self, actor: &str, action: &str, detail: &str) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO audit_log (at, actor, action, detail)
             VALUES (unixepoch(), ?1, ?2, ?3)",
            params![actor, action, detail],
        )?;
        Ok(())
    }

    // ── Row mapping ─────────────────────────────────────────────────

    fn query_by_id(conn: &Connection, id: i64) -> Result<Option<StrategyRun>> {
        conn.query_row(
            "SELECT * FROM strategy_runs WHERE id = ?1",
            [id],
            Self::from_row,
        )
        .optional()
        .context("loading run")
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<StrategyRun> {
        let status: String = row.get("status")?;
        let health: String = row.get("health")?;
        Ok(StrategyRun {
            id: row.get("id")?,
            user: row.get("user")?,
            account: row.get("account")?,
            config_id: row.get("config_id")?,
            program_name: row.get("program_name")?,
            control_port: row.get("control_port")?,
            status: RunStatus::parse(&status).unwrap_or(RunStatus::Error),
            health: RunHealth::parse(&health).unwrap_or(RunHealth::Unknown),
            last_heartbeat: row.get("last_heartbeat")?,
            error_count: row.get("error_count")?,
            error_message: row.get("error_message")?,
            started_at: row.get("started_at")?,
        })
    }
}
