//! User-facing notification rows, consumed by the chat-delivery service.

use anyhow::{Context, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PositionOpened,
    PositionClosed,
    InsufficientMargin,
    LiquidationRisk,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PositionOpened => "position_opened",
            NotificationKind::PositionClosed => "position_closed",
            NotificationKind::InsufficientMargin => "insufficient_margin",
            NotificationKind::LiquidationRisk => "liquidation_risk",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: i64,
    pub at: i64,
    pub account: String,
    pub run_id: Option<i64>,
    pub kind: String,
    pub message: String,
}

/// Writes one row per lifecycle event. Delivery is someone else's job.
#[derive(Clone)]
pub struct Notifier {
    db: Db,
    run_id: Option<i64>,
}

impl Notifier {
    pub fn new(db: Db, run_id: Option<i64>) -> Self {
        Notifier { db, run_id }
    }

    pub async fn emit(&self, account: &str, kind: NotificationKind, message: String) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO strategy_notifications (at, account, run_id, notification_type, message)
             VALUES (unixepoch(), ?1, ?2, ?3, ?4)",
            params![account, self.run_id, kind.as_str(), message],
        )?;
        Ok(())
    }

    pub async fn undelivered(&self, limit: i64) -> Result<Vec<Notification>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, at, account, run_id, notification_type, message
             FROM strategy_notifications WHERE delivered = 0 ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok(Notification {
                id: row.get(0)?,
                at: row.get(1)?,
                account: row.get(2)?,
                run_id: row.get(3)?,
                kind: row.get(4)?,
                message: row.get(5)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing notifications")
    }
}
