//! Control plane: spawn, safety limits, health, reconciliation.

pub mod registry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{CONTROL_PORT_MAX, CONTROL_PORT_MIN, InstanceSpec, StrategyConfig};
use crate::db::Db;
use crate::db::accounts::AccountStore;
use crate::db::runs::RunStore;
use crate::model::{RunHealth, RunStatus, StrategyRun};
use registry::{ProcessSupervisor, ProgramSpec, ProgramState};

/// Instances heartbeat on this cadence; staleness multiples drive health.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_DEGRADED: i64 = 60;
const HEARTBEAT_UNHEALTHY: i64 = 180;
const ORPHAN_STOP_GRACE: Duration = Duration::from_secs(5);

/// Spawn rejections, mapped to the operator CLI's exit codes.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("authorization: {0}")]
    Authorization(String),

    #[error("safety limit: {0}")]
    SafetyLimit(String),

    #[error("resource exhaustion: {0}")]
    ResourceExhausted(String),
}

impl StartError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartError::Validation(_) => 2,
            StartError::Authorization(_) => 3,
            StartError::SafetyLimit(_) => 4,
            StartError::ResourceExhausted(_) => 5,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// DB said running, no live process: marked stopped.
    pub orphaned_in_db: Vec<String>,
    /// Live process with no DB row: stopped.
    pub orphan_processes: Vec<String>,
    /// Registered but crashed while DB said running: marked error.
    pub marked_error: Vec<String>,
}

pub struct ControlPlane {
    runs: RunStore,
    accounts: AccountStore,
    supervisor: Arc<dyn ProcessSupervisor>,
    data_dir: PathBuf,
    db_path: PathBuf,
}

impl ControlPlane {
    pub fn new(
        db: Db,
        supervisor: Arc<dyn ProcessSupervisor>,
        data_dir: PathBuf,
        db_path: PathBuf,
    ) -> Self {
        ControlPlane {
            runs: RunStore::new(db.clone()),
            accounts: AccountStore::new(db),
            supervisor,
            data_dir,
            db_path,
        }
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    /// Gate, register, materialize config, spawn. The `strategy_runs` row
    /// exists in `starting` before the process is asked to start.
    pub async fn start_strategy(
        &self,
        user: &str,
        account_id: &str,
        mut config: StrategyConfig,
        paper: bool,
    ) -> Result<StrategyRun> {
        config
            .validate()
            .map_err(|e| StartError::Validation(e.to_string()))?;

        let account = self
            .accounts
            .get(account_id)
            .await?
            .ok_or_else(|| StartError::Validation(format!("unknown account '{account_id}'")))?;
        if !account.active {
            return Err(StartError::Validation(format!("account '{account_id}' is inactive")).into());
        }
        if let Some(owner) = &account.user {
            if owner != user {
                return Err(StartError::Authorization(format!(
                    "account '{account_id}' belongs to '{owner}'"
                ))
                .into());
            }
        }
        // Non-admin accounts trade only through an egress proxy.
        if !paper
            && !account.is_admin
            && self.accounts.active_proxy(account_id).await?.is_none()
        {
            return Err(StartError::Validation(format!(
                "account '{account_id}' has no active proxy assignment; assign one before starting"
            ))
            .into());
        }

        self.check_safety_limits(user).await?;

        config.control_api_port = self.assign_control_port(config.control_api_port).await?;

        let now = Utc::now().timestamp();
        let run = self
            .runs
            .create(user, account_id, &config_id(&config), config.control_api_port, now)
            .await?;

        let spec = InstanceSpec {
            run_id: run.id,
            user: user.to_string(),
            account: account_id.to_string(),
            strategy_name: run.program_name.clone(),
            db_path: self.db_path.to_string_lossy().into_owned(),
            paper,
            config,
        };
        let instances_dir = self.data_dir.join("instances");
        std::fs::create_dir_all(&instances_dir)
            .with_context(|| format!("creating {}", instances_dir.display()))?;
        let spec_path = instances_dir.join(format!("{}.json", run.program_name));
        std::fs::write(&spec_path, serde_json::to_string_pretty(&spec)?)
            .with_context(|| format!("writing instance spec {}", spec_path.display()))?;

        let program = ProgramSpec {
            name: run.program_name.clone(),
            spec_path,
            log_path: self.data_dir.join("logs").join(format!("{}.log", run.program_name)),
        };

        match self.supervisor.start(&program).await {
            Ok(pid) => {
                self.runs
                    .audit(
                        user,
                        "strategy_start",
                        &format!("{} account={} pid={}", run.program_name, account_id, pid),
                    )
                    .await?;
                Ok(run)
            }
            Err(err) => {
                warn!(program = %run.program_name, %err, "spawn failed");
                self.runs
                    .transition(run.id, RunStatus::Error, Some(&format!("spawn failed: {err:#}")))
                    .await?;
                Err(err)
            }
        }
    }

    pub async fn stop_strategy(&self, run_id: i64, grace: Duration) -> Result<StrategyRun> {
        let run = self
            .runs
            .get(run_id)
            .await?
            .with_context(|| format!("run {run_id} not found"))?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        if let Err(err) = self.supervisor.stop(&run.program_name, grace).await {
            warn!(program = %run.program_name, %err, "stop request failed");
        }
        let run = self
            .runs
            .transition(run_id, RunStatus::Stopped, Some("requested stop"))
            .await?;
        self.runs
            .audit(&run.user, "strategy_stop", &run.program_name)
            .await?;
        Ok(run)
    }

    /// Boot-time convergence between the DB registry and the live process
    /// set. The DB is the truth being converged toward observations.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let programs: HashMap<String, ProgramState> = self
            .supervisor
            .list()?
            .into_iter()
            .map(|p| (p.name, p.state))
            .collect();

        for run in self.runs.list_live().await? {
            match programs.get(&run.program_name) {
                None => {
                    self.runs
                        .transition(run.id, RunStatus::Stopped, Some("orphaned in DB"))
                        .await?;
                    report.orphaned_in_db.push(run.program_name);
                }
                Some(ProgramState::Crashed) => {
                    self.runs
                        .transition(run.id, RunStatus::Error, Some("process exited fatally"))
                        .await?;
                    report.marked_error.push(run.program_name);
                }
                Some(ProgramState::Running) => {}
            }
        }

        for (name, state) in &programs {
            if self.runs.get_by_program(name).await?.is_none() {
                if *state == ProgramState::Running {
                    warn!(program = %name, "live process unknown to DB, stopping orphan");
                    if let Err(err) = self.supervisor.stop(name, ORPHAN_STOP_GRACE).await {
                        warn!(program = %name, %err, "orphan stop failed");
                    }
                }
                report.orphan_processes.push(name.clone());
            }
        }

        if !report.orphaned_in_db.is_empty()
            || !report.orphan_processes.is_empty()
            || !report.marked_error.is_empty()
        {
            info!(
                orphaned_in_db = report.orphaned_in_db.len(),
                orphan_processes = report.orphan_processes.len(),
                marked_error = report.marked_error.len(),
                "reconciliation applied"
            );
        }
        Ok(report)
    }

    /// Heartbeat-staleness health pass over live runs.
    pub async fn check_health(&self, now: i64) -> Result<()> {
        for run in self.runs.list_live().await? {
            let Some(last) = run.last_heartbeat else {
                continue;
            };
            let age = now - last;
            let health = if age > HEARTBEAT_UNHEALTHY {
                RunHealth::Unhealthy
            } else if age > HEARTBEAT_DEGRADED {
                RunHealth::Degraded
            } else {
                RunHealth::Healthy
            };
            if health != run.health {
                self.runs.set_health(run.id, health).await?;
            }
        }
        Ok(())
    }

    async fn check_safety_limits(&self, user: &str) -> Result<()> {
        let limits = self.runs.safety_limits(user).await?;
        let now = Utc::now().timestamp();

        let midnight = now - now.rem_euclid(86_400);
        let today = self.runs.starts_since(user, midnight).await?;
        if today >= limits.daily_start_limit {
            return Err(StartError::SafetyLimit(format!(
                "daily_start_limit ({}) reached for '{user}'",
                limits.daily_start_limit
            ))
            .into());
        }

        if let Some(last) = self.runs.last_start_at(user).await? {
            let since = now - last;
            if since < limits.cooldown_secs {
                return Err(StartError::SafetyLimit(format!(
                    "cooldown_between_starts ({}s) active, {}s remaining",
                    limits.cooldown_secs,
                    limits.cooldown_secs - since
                ))
                .into());
            }
        }

        let error_rate = self
            .runs
            .recent_error_rate(user, limits.error_rate_window)
            .await?;
        if error_rate > limits.max_error_rate {
            return Err(StartError::SafetyLimit(format!(
                "maximum_error_rate ({:.0}%) exceeded: {:.0}% over last {} runs",
                limits.max_error_rate * 100.0,
                error_rate * 100.0,
                limits.error_rate_window
            ))
            .into());
        }
        Ok(())
    }

    /// Prefer the requested port when free, else first free in the pool.
    async fn assign_control_port(&self, requested: u16) -> Result<u16> {
        let in_use = self.runs.ports_in_use().await?;
        if !in_use.contains(&requested) {
            return Ok(requested);
        }
        for port in CONTROL_PORT_MIN..=CONTROL_PORT_MAX {
            if !in_use.contains(&port) {
                return Ok(port);
            }
        }
        Err(StartError::ResourceExhausted(format!(
            "no free control port in pool {CONTROL_PORT_MIN}-{CONTROL_PORT_MAX}"
        ))
        .into())
    }
}

fn config_id(config: &StrategyConfig) -> String {
    // Stable identity for "which config was this run started with".
    let serialized = serde_json::to_vec(config).unwrap_or_default();
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(&serialized);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
