//! `funding-flow ps`: fleet listing.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::db::Db;
use crate::db::runs::RunStore;
use crate::model::RunStatus;
use crate::supervisor::registry::{ProcessSupervisor, ProgramState};

pub async fn run(db: Db, supervisor: &dyn ProcessSupervisor) -> Result<()> {
    let runs = RunStore::new(db).list().await?;
    let programs: HashMap<String, (u32, ProgramState)> = supervisor
        .list()?
        .into_iter()
        .map(|p| (p.name.clone(), (p.pid, p.state)))
        .collect();

    if runs.is_empty() {
        println!("No strategy runs recorded.");
        return Ok(());
    }

    println!(
        "{:<12} {:<12} {:<12} {:<10} {:<10} {:<8} {:<6} {}",
        "NAME", "USER", "ACCOUNT", "STATUS", "HEALTH", "PID", "PORT", "UPTIME"
    );
    println!("{}", "-".repeat(86));

    let now = Utc::now();
    let mut live = 0usize;
    for run in &runs {
        let (pid_str, process_note) = match programs.get(&run.program_name) {
            Some((pid, ProgramState::Running)) => (pid.to_string(), ""),
            Some((_, ProgramState::Crashed)) => ("—".to_string(), " (crashed)"),
            None => ("—".to_string(), ""),
        };
        if run.status == RunStatus::Running {
            live += 1;
        }

        let uptime = if run.status.is_terminal() {
            "—".to_string()
        } else {
            let started = DateTime::<Utc>::from_timestamp(run.started_at, 0)
                .unwrap_or_else(|| now.into());
            format_duration(now.signed_duration_since(started))
        };

        println!(
            "{:<12} {:<12} {:<12} {:<10} {:<10} {:<8} {:<6} {}{}",
            truncate(&run.program_name, 11),
            truncate(&run.user, 11),
            truncate(&run.account, 11),
            run.status.as_str(),
            run.health.as_str(),
            pid_str,
            run.control_port,
            uptime,
            process_note,
        );
    }

    println!("\n{} of {} runs live", live, runs.len());
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        format!("{}…", &s[..max - 1])
    } else {
        s.to_string()
    }
}

fn format_duration(dur: chrono::TimeDelta) -> String {
    let secs = dur.num_seconds();
    if secs < 0 {
        return "—".to_string();
    }
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let mins = (secs % 3600) / 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m")
    }
}
