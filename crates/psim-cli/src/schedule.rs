//! The `schedule` subcommand: reads a [`SchedulerInput`] document from a
//! file or stdin, runs the offline scheduler, writes the
//! [`SchedulerOutput`] document to stdout, and optionally persists
//! `job_timings.json`/`lb_decisions.json` at the paths the input names.

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use psim_scheduler::io::SchedulerInput;

#[derive(Debug, Args)]
pub struct ScheduleArgs {
    /// Reads the scheduler input document from this file instead of stdin.
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Overrides the input document's `timing_file_path`.
    #[arg(long)]
    pub timing_file: Option<PathBuf>,

    /// Overrides the input document's `routing_file_path`.
    #[arg(long)]
    pub routing_file: Option<PathBuf>,
}

pub fn run(args: ScheduleArgs) -> anyhow::Result<()> {
    let raw = match &args.input {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("reading scheduler input {}", path.display()))?
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading scheduler input from stdin")?;
            buf
        }
    };

    let mut input: SchedulerInput =
        serde_json::from_str(&raw).context("parsing scheduler input as JSON")?;
    if let Some(path) = &args.timing_file {
        input.timing_file_path = Some(path.display().to_string());
    }
    if let Some(path) = &args.routing_file {
        input.routing_file_path = Some(path.display().to_string());
    }
    let timing_path = input.timing_file_path.clone();
    let routing_path = input.routing_file_path.clone();

    let output = psim_scheduler::run_scheduler(input)?;

    let stdout_doc = serde_json::to_string_pretty(&output)?;
    println!("{stdout_doc}");

    if let Some(path) = timing_path {
        let doc = serde_json::to_string_pretty(&output.job_timings)?;
        std::fs::write(&path, doc).with_context(|| format!("writing job timings to {path}"))?;
    }
    if let Some(path) = routing_path {
        let doc = serde_json::to_string_pretty(&output.lb_decisions)?;
        std::fs::write(&path, doc).with_context(|| format!("writing load-balancing decisions to {path}"))?;
    }

    Ok(())
}
