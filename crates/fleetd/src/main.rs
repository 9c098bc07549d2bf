//! fleetd — the fleet capacity daemon.
//!
//! Hosts the capacity core for one process:
//! - feedback controllers built from the controllers file
//! - a calibrator with periodic autosave
//! - the load balancer, with its workload file hot-reloaded
//! - a line feed on stdin carrying worker reports and placement requests
//!
//! # Usage
//!
//! ```text
//! fleetd init --dir /etc/fleet
//! worker-reports | fleetd run --config /etc/fleet/fleetd.toml
//! fleetd check-workload /etc/fleet/workload.toml
//! fleetd predict --calibration /var/lib/fleet/calibration.json --metric peers --value 40 --value 120
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod daemon;
mod feed;
mod tools;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet capacity daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon until interrupted, applying feed commands from stdin.
    Run {
        /// Path to fleetd.toml.
        #[arg(long, default_value = "fleetd.toml")]
        config: PathBuf,
    },
    /// Write a starter fleetd.toml, workload.toml and controllers.toml.
    Init {
        /// Directory to write into.
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Overwrite existing files.
        #[arg(long)]
        force: bool,
    },
    /// Validate a workload file and print the settings it yields.
    CheckWorkload {
        path: PathBuf,
    },
    /// Replay correlated-metric samples through a saved calibration.
    Predict {
        /// Calibration state file written by the daemon.
        #[arg(long)]
        calibration: PathBuf,
        /// Metric to predict from (for example `peers`).
        #[arg(long, default_value = "peers")]
        metric: String,
        /// Samples, in order.
        #[arg(long = "value", required = true)]
        values: Vec<i64>,
    },
    /// Drive a synthetic fleet through the balancer and report the picks.
    Simulate {
        /// Workload file; built-in defaults when omitted.
        #[arg(long)]
        workload: Option<PathBuf>,
        #[arg(long, default_value = "12")]
        servers: usize,
        #[arg(long, default_value = "2")]
        tiers: u8,
        #[arg(long, default_value = "10000")]
        draws: u32,
        #[arg(long, default_value = "7")]
        seed: u64,
        /// Print server states as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleet=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => daemon::run(&config).await,
        Command::Init { dir, force } => tools::init(&dir, force),
        Command::CheckWorkload { path } => tools::check_workload(&path),
        Command::Predict {
            calibration,
            metric,
            values,
        } => tools::predict(&calibration, &metric, &values),
        Command::Simulate {
            workload,
            servers,
            tiers,
            draws,
            seed,
            json,
        } => tools::simulate(workload.as_deref(), servers, tiers, draws, seed, json),
    }
}
