//! Command-line driver for the fabric simulator and offline scheduler.
//!
//! Two subcommands: `simulate` runs the network/protocol simulator to
//! completion and writes profiles/history to disk; `schedule` runs the
//! offline timing+routing scheduler over a JSON document read from stdin
//! or a file.

mod config;
mod protocol_text;
mod schedule;
mod simulate;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "psim-cli", about = "Discrete-time distributed-training fabric simulator and offline scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs the network/protocol simulator.
    Simulate(simulate::SimulateArgs),
    /// Runs the offline timing and routing scheduler.
    Schedule(schedule::ScheduleArgs),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Simulate(args) => simulate::run(args),
        Command::Schedule(args) => schedule::run(args),
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "psim-cli failed");
        std::process::exit(1);
    }
}
