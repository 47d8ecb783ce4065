use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use funding_flow::cli::{Cli, Command};
use funding_flow::supervisor::registry::LocalSupervisor;
use funding_flow::supervisor::{ControlPlane, StartError};
use funding_flow::{config, db, logs, ps, runtime, stop};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match dispatch() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = match err.downcast_ref::<StartError>() {
                Some(start) => start.exit_code(),
                None if is_validation(&err) => 2,
                None => 1,
            };
            ExitCode::from(code as u8)
        }
    }
}

fn is_validation(err: &anyhow::Error) -> bool {
    err.to_string().starts_with("config:") || err.to_string().contains("parsing config")
}

fn dispatch() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Schema => {
            let schema = schemars::schema_for!(config::StrategyConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Command::Validate { file } => {
            config::load_strategy_config(&file)?;
            println!("{}: valid", file.display());
            Ok(())
        }
        Command::Instance { spec } => runtime::run_instance(&spec),
        Command::Logs {
            name,
            lines,
            follow,
        } => logs::run(&data_dir()?, &name, lines, follow),
        command => {
            // Control-plane commands share the db + supervisor setup.
            let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
            rt.block_on(dispatch_control_plane(command))
        }
    }
}

async fn dispatch_control_plane(command: Command) -> Result<()> {
    let data_dir = data_dir()?;
    let db_path = data_dir.join("funding-flow.db");
    let db = db::open(&db_path)?;
    let supervisor = Arc::new(LocalSupervisor::new(data_dir.clone()));
    let plane = ControlPlane::new(db.clone(), supervisor.clone(), data_dir, db_path);

    match command {
        Command::Run {
            config,
            user,
            account,
            paper,
        } => {
            // Converge before gating so stale rows don't eat the port pool.
            plane.reconcile().await?;
            let strategy_config = config::load_strategy_config(&config)?;
            let run = plane
                .start_strategy(&user, &account, strategy_config, paper)
                .await?;
            println!(
                "Started {} (run {}) on control port {}.",
                run.program_name, run.id, run.control_port
            );
            Ok(())
        }
        Command::Ps => {
            plane.reconcile().await?;
            plane.check_health(chrono::Utc::now().timestamp()).await?;
            ps::run(db, supervisor.as_ref()).await
        }
        Command::Stop { target, grace_secs } => {
            stop::run(&plane, &target, Duration::from_secs(grace_secs)).await
        }
        Command::Reconcile => {
            let report = plane.reconcile().await?;
            plane.check_health(chrono::Utc::now().timestamp()).await?;
            println!(
                "Reconciled: {} orphaned in DB, {} orphan processes, {} marked error.",
                report.orphaned_in_db.len(),
                report.orphan_processes.len(),
                report.marked_error.len()
            );
            Ok(())
        }
        Command::Schema | Command::Validate { .. } | Command::Instance { .. } | Command::Logs { .. } => {
            unreachable!("handled in dispatch")
        }
    }
}

fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("FUNDING_FLOW_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    Ok(dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".funding-flow"))
}
