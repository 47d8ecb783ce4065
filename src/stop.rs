//! `funding-flow stop`: cooperative instance shutdown.

use std::time::Duration;

use anyhow::{Result, bail};

use crate::supervisor::ControlPlane;

/// `target` is a run id or a program name (`fundarb-<id>`).
pub async fn run(plane: &ControlPlane, target: &str, grace: Duration) -> Result<()> {
    let run = if let Ok(id) = target.parse::<i64>() {
        plane.runs().get(id).await?
    } else {
        plane.runs().get_by_program(target).await?
    };
    let Some(run) = run else {
        bail!("no strategy run matching '{target}'. Run `funding-flow ps` to list runs.");
    };

    if run.status.is_terminal() {
        println!(
            "Run {} ({}) already {}.",
            run.id,
            run.program_name,
            run.status.as_str()
        );
        return Ok(());
    }

    println!("Stopping {} (run {})...", run.program_name, run.id);
    let stopped = plane.stop_strategy(run.id, grace).await?;
    println!("Run {} now {}.", stopped.id, stopped.status.as_str());
    Ok(())
}
