//! Process supervision behind a trait.
//!
//! The local implementation spawns one OS process per strategy instance
//! (this same binary, `instance` subcommand), tracks it in a JSON registry
//! with atomic writes, and checks liveness with `kill(pid, 0)`. An external
//! process manager could stand in behind the same trait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Everything needed to start one supervised program.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    /// `fundarb-<run_id>`; unique across the fleet.
    pub name: String,
    pub spec_path: PathBuf,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    Running,
    /// Registered but the pid is dead.
    Crashed,
}

#[derive(Debug, Clone)]
pub struct ProgramInfo {
    pub name: String,
    pub pid: u32,
    pub state: ProgramState,
    pub started_at: String,
    pub log_path: PathBuf,
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn start(&self, program: &ProgramSpec) -> Result<u32>;

    /// Cooperative stop: SIGTERM, wait up to `grace`, then SIGKILL.
    async fn stop(&self, name: &str, grace: Duration) -> Result<()>;

    fn list(&self) -> Result<Vec<ProgramInfo>>;
}

// ── JSON registry ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryEntry {
    pid: u32,
    spec_path: PathBuf,
    log_path: PathBuf,
    started_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Registry {
    programs: HashMap<String, RegistryEntry>,
}

impl Registry {
    fn path(dir: &Path) -> PathBuf {
        dir.join("registry.json")
    }

    fn load(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(Registry::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("reading registry at {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing registry at {}", path.display()))
    }

    /// Write to a tmp file, then rename.
    fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating registry dir {}", dir.display()))?;
        let path = Self::path(dir);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing registry tmp {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("renaming registry into {}", path.display()))?;
        Ok(())
    }
}

pub fn is_pid_alive(pid: u32) -> bool {
    // kill(pid, 0) checks existence without sending a signal
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

// ── Local implementation ────────────────────────────────────────────

pub struct LocalSupervisor {
    registry_dir: PathBuf,
}

impl LocalSupervisor {
    pub fn new(registry_dir: impl Into<PathBuf>) -> Self {
        LocalSupervisor {
            registry_dir: registry_dir.into(),
        }
    }

    fn deregister(&self, name: &str) -> Result<()> {
        let mut registry = Registry::load(&self.registry_dir)?;
        registry.programs.remove(name);
        registry.save(&self.registry_dir)
    }
}

#[async_trait]
impl ProcessSupervisor for LocalSupervisor {
    async fn start(&self, program: &ProgramSpec) -> Result<u32> {
        let mut registry = Registry::load(&self.registry_dir)?;
        if let Some(entry) = registry.programs.get(&program.name) {
            if is_pid_alive(entry.pid) {
                bail!("program '{}' already running (pid {})", program.name, entry.pid);
            }
        }

        if let Some(parent) = program.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = std::fs::File::create(&program.log_path)
            .with_context(|| format!("creating log file {}", program.log_path.display()))?;
        let log_err = log.try_clone()?;

        let binary = std::env::current_exe().context("resolving own binary path")?;
        let child = tokio::process::Command::new(&binary)
            .arg("instance")
            .arg("--spec")
            .arg(&program.spec_path)
            .stdout(log)
            .stderr(log_err)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .with_context(|| format!("spawning instance '{}'", program.name))?;

        let pid = child
            .id()
            .context("spawned instance has no pid (already reaped)")?;

        registry.programs.insert(
            program.name.clone(),
            RegistryEntry {
                pid,
                spec_path: program.spec_path.clone(),
                log_path: program.log_path.clone(),
                started_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        registry.save(&self.registry_dir)?;
        info!(program = %program.name, pid, "instance started");
        Ok(pid)
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let registry = Registry::load(&self.registry_dir)?;
        let Some(entry) = registry.programs.get(name) else {
            bail!("program '{name}' not registered");
        };
        let pid = entry.pid;

        if !is_pid_alive(pid) {
            info!(program = %name, pid, "already dead, cleaning registry");
            self.deregister(name)?;
            return Ok(());
        }

        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        let waited_until = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < waited_until {
            tokio::time::sleep(Duration::from_millis(250)).await;
            if !is_pid_alive(pid) {
                self.deregister(name)?;
                info!(program = %name, "stopped cleanly");
                return Ok(());
            }
        }

        warn!(program = %name, pid, "no clean exit within grace, sending SIGKILL");
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        self.deregister(name)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<ProgramInfo>> {
        let registry = Registry::load(&self.registry_dir)?;
        let mut infos: Vec<ProgramInfo> = registry
            .programs
            .into_iter()
            .map(|(name, entry)| ProgramInfo {
                name,
                pid: entry.pid,
                state: if is_pid_alive(entry.pid) {
                    ProgramState::Running
                } else {
                    ProgramState::Crashed
                },
                started_at: entry.started_at,
                log_path: entry.log_path,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}
