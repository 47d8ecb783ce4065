use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Multi-account funding-arbitrage runtime for perp DEXes — control plane,
/// supervised strategy instances, and the tooling around them.
#[derive(Parser)]
#[command(name = "funding-flow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Output the JSON schema for strategy config files
    Schema,

    /// Validate a strategy config file
    Validate {
        /// Path to the config JSON file
        file: PathBuf,
    },

    /// Start a supervised strategy instance
    Run {
        /// Path to the strategy config JSON file
        config: PathBuf,

        /// User starting the run (safety limits are per user)
        #[arg(long)]
        user: String,

        /// Trading account id
        #[arg(long)]
        account: String,

        /// Wire paper venues instead of live adapters
        #[arg(long)]
        paper: bool,
    },

    /// Strategy instance entrypoint (spawned by the control plane)
    #[command(hide = true)]
    Instance {
        /// Path to the materialized instance spec
        #[arg(long)]
        spec: PathBuf,
    },

    /// List strategy runs with liveness and health
    Ps,

    /// Stop a running strategy instance
    Stop {
        /// Run id or program name (e.g. 3 or fundarb-3)
        target: String,

        /// Seconds to wait for a clean exit before SIGKILL
        #[arg(long, default_value = "10")]
        grace_secs: u64,
    },

    /// Tail a strategy instance's log file
    Logs {
        /// Program name (e.g. fundarb-3)
        name: String,

        /// Number of trailing lines to print
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Keep following the file
        #[arg(short, long)]
        follow: bool,
    },

    /// Converge the run registry with the live process set
    Reconcile,
}
