use serde::{Deserialize, Serialize};

/// Lifecycle state of one strategy instance (one OS process).
/// `Stopped` and `Error` are terminal; `Paused → Running` is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Starting,
    Running,
    Stopped,
    Error,
    Paused,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
            RunStatus::Error => "error",
            RunStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(RunStatus::Starting),
            "running" => Some(RunStatus::Running),
            "stopped" => Some(RunStatus::Stopped),
            "error" => Some(RunStatus::Error),
            "paused" => Some(RunStatus::Paused),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Stopped | RunStatus::Error)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (RunStatus::Starting, RunStatus::Running) => true,
            (RunStatus::Starting, RunStatus::Stopped | RunStatus::Error) => true,
            (RunStatus::Running, RunStatus::Stopped | RunStatus::Error | RunStatus::Paused) => true,
            (RunStatus::Paused, RunStatus::Running) => true,
            (RunStatus::Paused, RunStatus::Stopped | RunStatus::Error) => true,
            _ => false,
        }
    }
}

/// Heartbeat-derived health, orthogonal to `RunStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunHealth {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl RunHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunHealth::Unknown => "unknown",
            RunHealth::Healthy => "healthy",
            RunHealth::Degraded => "degraded",
            RunHealth::Unhealthy => "unhealthy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(RunHealth::Unknown),
            "healthy" => Some(RunHealth::Healthy),
            "degraded" => Some(RunHealth::Degraded),
            "unhealthy" => Some(RunHealth::Unhealthy),
            _ => None,
        }
    }
}

/// One row in `strategy_runs`: the durable record of a strategy instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRun {
    pub id: i64,
    pub user: String,
    pub account: String,
    pub config_id: String,
    /// Unique across the fleet, derived from `id` (`fundarb-<id>`).
    pub program_name: String,
    pub control_port: u16,
    pub status: RunStatus,
    pub health: RunHealth,
    pub last_heartbeat: Option<i64>,
    pub error_count: i64,
    pub error_message: Option<String>,
    pub started_at: i64,
}

impl StrategyRun {
    /// Deterministic supervisor program name for a run id.
    pub fn program_name_for(id: i64) -> String {
        format!("fundarb-{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_sticky() {
        assert!(!RunStatus::Stopped.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Error.can_transition_to(RunStatus::Starting));
    }

    #[test]
    fn pause_resume_round_trip() {
        assert!(RunStatus::Running.can_transition_to(RunStatus::Paused));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Running));
    }
}
