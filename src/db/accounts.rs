//! Accounts, encrypted exchange credentials, proxy assignments, API keys.

use anyhow::{Context, Result, bail};
use rusqlite::{OptionalExtension, params};

use super::{Db, crypto};
use crate::model::{Account, ProxyAssignment, ProxyStatus};
use crate::venues::rest::ApiCredentials;

#[derive(Clone)]
pub struct AccountStore {
    db: Db,
}

impl AccountStore {
    pub fn new(db: Db) -> Self {
        AccountStore { db }
    }

    pub async fn upsert(&self, account: &Account) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO accounts (id, name, user, active, is_admin)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name, user = excluded.user,
                 active = excluded.active, is_admin = excluded.is_admin",
            params![
                account.id,
                account.name,
                account.user,
                account.active,
                account.is_admin
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Account>> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT id, name, user, active, is_admin FROM accounts WHERE id = ?1",
            [id],
            |row| {
                Ok(Account {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    user: row.get(2)?,
                    active: row.get(3)?,
                    is_admin: row.get(4)?,
                })
            },
        )
        .optional()
        .context("loading account")
    }

    // ── Credentials ─────────────────────────────────────────────────

    /// Encrypt and store one venue's API credentials for an account.
    pub async fn store_credentials(
        &self,
        account: &str,
        venue: &str,
        creds: &ApiCredentials,
        master_key: &str,
    ) -> Result<()> {
        let conn = self.db.lock().await;
        let salt = crypto::ensure_salt(&conn)?;
        let key = crypto::derive_key(master_key, &salt)?;
        let plaintext = serde_json::to_string(creds)?;
        let ciphertext = crypto::encrypt(&plaintext, &key)?;
        conn.execute(
            "INSERT INTO exchange_credentials (account, venue, ciphertext)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(account, venue) DO UPDATE SET ciphertext = excluded.ciphertext",
            params![account, venue, ciphertext],
        )?;
        Ok(())
    }

    /// Decrypt one venue's credentials. The blob is opaque until this point.
    pub async fn load_credentials(
        &self,
        account: &str,
        venue: &str,
        master_key: &str,
    ) -> Result<ApiCredentials> {
        let conn = self.db.lock().await;
        let ciphertext: Option<String> = conn
            .query_row(
                "SELECT ciphertext FROM exchange_credentials
                 WHERE account = ?1 AND venue = ?2",
                params![account, venue],
                |row| row.get(0),
            )
            .optional()?;
        let Some(ciphertext) = ciphertext else {
            bail!("no credentials stored for account '{account}' on venue '{venue}'");
        };
        let salt = crypto::ensure_salt(&conn)?;
        let key = crypto::derive_key(master_key, &salt)?;
        let plaintext = crypto::decrypt(&ciphertext, &key)?;
        serde_json::from_str(&plaintext).context("parsing decrypted credentials")
    }

    // ── Proxies ─────────────────────────────────────────────────────

    pub async fn assign_proxy(&self, assignment: &ProxyAssignment) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO proxies (url) VALUES (?1)",
            [&assignment.proxy_url],
        )?;
        conn.execute(
            "INSERT INTO proxy_assignments (account, proxy_url, priority, status)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(account, proxy_url) DO UPDATE SET
                 priority = excluded.priority, status = excluded.status",
            params![
                assignment.account,
                assignment.proxy_url,
                assignment.priority,
                assignment.status.as_str()
            ],
        )?;
        Ok(())
    }

    /// Highest-priority `active` proxy for the account, if any.
    pub async fn active_proxy(&self, account: &str) -> Result<Option<ProxyAssignment>> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT account, proxy_url, priority, status FROM proxy_assignments
             WHERE account = ?1 AND status = 'active'
             ORDER BY priority DESC LIMIT 1",
            [account],
            |row| {
                let status: String = row.get(3)?;
                Ok(ProxyAssignment {
                    account: row.get(0)?,
                    proxy_url: row.get(1)?,
                    priority: row.get(2)?,
                    status: ProxyStatus::parse(&status).unwrap_or(ProxyStatus::Burned),
                })
            },
        )
        .optional()
        .context("loading proxy assignment")
    }

    // ── API keys ────────────────────────────────────────────────────

    pub async fn set_api_key(&self, user: &str, key: &str) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO api_keys (user, key_hash) VALUES (?1, ?2)
             ON CONFLICT(user) DO UPDATE SET key_hash = excluded.key_hash",
            params![user, crypto::hash_api_key(key)],
        )?;
        Ok(())
    }

    /// Resolve a presented API key to its user, `None` when it matches no
    /// record.
    pub async fn verify_api_key(&self, presented: &str) -> Result<Option<String>> {
        let hash = crypto::hash_api_key(presented);
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT user FROM api_keys WHERE key_hash = ?1",
            [hash],
            |row| row.get(0),
        )
        .optional()
        .context("verifying api key")
    }
}
