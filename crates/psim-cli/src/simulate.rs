//! The `simulate` subcommand: loads configuration and protocol files, runs
//! `cfg.rep_count` repetitions of the simulator threading the same
//! [`RunContext`] across them (the multi-run replay mechanism), then dumps
//! profile JSON, bottleneck/machine history CSV, and a scheduler-ready
//! routing decision summary to `cfg.output_dir`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use rand::rngs::StdRng;
use rand::SeedableRng;

use psim_config::{LbScheme, SimConfig};
use psim_context::RunContext;
use psim_loadbalancer::{FutureLoadLb, LeastLoadedLb, LoadBalancer, PowerOfKLb, RandomLb, RobinHoodLb, RoundRobinLb};
use psim_sim::Simulator;

use crate::protocol_text;

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Path to a TOML configuration file. Falls back to defaults when absent.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

fn build_selector(cfg: &SimConfig, rep: u32, context: &RunContext) -> LoadBalancer {
    let rng = StdRng::seed_from_u64(cfg.rng_seed.wrapping_add(rep as u64));
    match cfg.lb_scheme {
        LbScheme::Random => LoadBalancer::Random(RandomLb::new(rng)),
        LbScheme::RoundRobin => LoadBalancer::RoundRobin(RoundRobinLb::new()),
        LbScheme::PowerOfK => LoadBalancer::PowerOfK(PowerOfKLb::new(rng, cfg.lb_samples)),
        LbScheme::LeastLoaded => LoadBalancer::LeastLoaded(LeastLoadedLb::new()),
        LbScheme::RobinHood => LoadBalancer::RobinHood(RobinHoodLb::new(rng)),
        LbScheme::FutureLoad => LoadBalancer::FutureLoad(FutureLoadLb::new(context.last_run())),
    }
}

fn protocol_paths(cfg: &SimConfig) -> Vec<PathBuf> {
    let all: Vec<PathBuf> = cfg
        .protocol_file_name
        .split(',')
        .map(|name| Path::new(&cfg.protocol_file_dir).join(name.trim()))
        .collect();

    match cfg.isolate_job_id {
        Some(idx) if idx >= 0 && (idx as usize) < all.len() => vec![all[idx as usize].clone()],
        Some(idx) => {
            tracing::warn!(idx, file_count = all.len(), "isolate_job_id out of range of protocol files, running all");
            all
        }
        None => all,
    }
}

pub fn run(args: SimulateArgs) -> anyhow::Result<()> {
    let cfg = crate::config::load(args.config.as_deref())?;

    let shuffle_map = if cfg.shuffle_device_map {
        let path = cfg
            .shuffle_map_file
            .as_deref()
            .context("shuffle_device_map is enabled but shuffle_map_file is not set")?;
        Some(protocol_text::load_shuffle_map(Path::new(path))?)
    } else {
        None
    };

    let paths = protocol_paths(&cfg);
    if paths.is_empty() {
        anyhow::bail!("no protocol files configured (protocol_file_name is empty)");
    }

    let mut context = RunContext::new(cfg.keep_better_run);
    let mut last_sim: Option<Simulator> = None;
    let rep_count = cfg.rep_count.max(1);

    for rep in 0..rep_count {
        let selector = build_selector(&cfg, rep, &context);
        let mut sim = Simulator::new(cfg.clone(), context, selector)?;
        for path in &paths {
            let protocol = protocol_text::load_protocol(path, shuffle_map.as_ref())?;
            sim.add_protocol(protocol)?;
        }
        sim.run()?;
        tracing::info!(rep, rep_count, timer = sim.timer, "simulation run finished");
        context = sim.context.clone();
        last_sim = Some(sim);
    }

    let sim = last_sim.expect("rep_count.max(1) guarantees at least one run");
    write_outputs(&cfg, &sim)
}

fn write_outputs(cfg: &SimConfig, sim: &Simulator) -> anyhow::Result<()> {
    let output_dir = Path::new(&cfg.output_dir);
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;

    write_profiles(cfg, sim, &output_dir.join("profiles"))?;

    if cfg.record_bottleneck_history {
        write_bottleneck_history(sim, &output_dir.join("bottlenecks"))?;
    }
    if cfg.record_machine_history {
        write_machine_history(sim, &output_dir.join("machines"))?;
    }
    if cfg.plot_graphs || cfg.export_dot {
        tracing::warn!(
            plot_graphs = cfg.plot_graphs,
            export_dot = cfg.export_dot,
            "graph plotting and dot export are not implemented; history was still written as CSV"
        );
    }

    Ok(())
}

/// Builds one profile document per job, named the way the offline
/// scheduler expects to read them back:
/// `{job_id}_{throttle}.json` (`original_source/src/scheduler/scheduler.cc`'s
/// `profiles-dir` convention).
fn write_profiles(cfg: &SimConfig, sim: &Simulator, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating profiles directory {}", dir.display()))?;
    let Some(run) = sim.context.this_run() else {
        return Ok(());
    };

    let mut steps = run.profiled.clone();
    steps.sort_by(|a, b| a.timer.partial_cmp(&b.timer).unwrap());

    for (job_id, protocol) in &sim.protocols {
        let mut flows = Vec::new();
        for task in protocol.get_flows() {
            let psim_protocol::TaskKind::Flow { src, dst, size, .. } = &task.kind else {
                continue;
            };
            let start_time = task.start_time.unwrap_or(0.0);
            let end_time = task.end_time.unwrap_or(start_time);
            // Flows are recorded in the run context under their global id
            // (job id folded into the high bits, see `psim_sim::runtime::
            // pack_queue_key`) since per-protocol task ids collide across
            // jobs; the emitted profile's `flow_id` stays per-job since it
            // is always paired with `job_id` downstream.
            let global_id = psim_sim::runtime::pack_queue_key(*job_id, task.id);
            let progress_history: Vec<f64> = steps
                .iter()
                .filter(|s| s.timer >= start_time && s.timer <= end_time)
                .map(|s| s.flow_load.get(&global_id).copied().unwrap_or(0.0))
                .collect();
            let stats = run.flow_stats.get(&global_id);

            flows.push(psim_scheduler::io::FlowProfile {
                flow_id: task.id as i64,
                job_id: *job_id as i64,
                iteration: 0,
                subflow: 0,
                start_time: start_time as i64,
                end_time: end_time as i64,
                srcrack: sim.topology.get_source_for_flow(psim_topology::MachineId(*src as u32)) as i64,
                dstrack: sim.topology.get_source_for_flow(psim_topology::MachineId(*dst as u32)) as i64,
                fct: stats.map(|s| s.fct).unwrap_or(0.0),
                core: 0,
                label: String::new(),
                flow_size: *size,
                progress_history,
            });
        }

        let doc = psim_scheduler::io::ProfileFile {
            period: cfg.core_status_profiling_interval as i64,
            flows,
        };
        let file_name = format!("{job_id}_{:.2}.json", cfg.throttle_factor);
        let path = dir.join(file_name);
        let json = serde_json::to_string_pretty(&doc)?;
        std::fs::write(&path, json).with_context(|| format!("writing profile file {}", path.display()))?;
    }
    Ok(())
}

fn write_bottleneck_history(sim: &Simulator, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating bottleneck history directory {}", dir.display()))?;
    for b in sim.topology.bottlenecks() {
        let Some(registered) = &b.registered_history else { continue };
        let allocated = b.allocated_history.as_ref().expect("history fields are all-or-nothing");
        let utilized = b.utilized_history.as_ref().expect("history fields are all-or-nothing");
        let mut csv = String::from("step,registered,allocated,utilized\n");
        for i in 0..registered.len() {
            csv.push_str(&format!("{i},{},{},{}\n", registered[i], allocated[i], utilized[i]));
        }
        let path = dir.join(format!("{}.csv", b.id.0));
        std::fs::write(&path, csv).with_context(|| format!("writing bottleneck history {}", path.display()))?;
    }
    Ok(())
}

fn write_machine_history(sim: &Simulator, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating machine history directory {}", dir.display()))?;
    for m in sim.topology.machines() {
        let Some(queue_len) = &m.queue_len_history else { continue };
        let mut csv = String::from("step,queue_len\n");
        for (i, q) in queue_len.iter().enumerate() {
            csv.push_str(&format!("{i},{q}\n"));
        }
        let path = dir.join(format!("{}.csv", m.id.0));
        std::fs::write(&path, csv).with_context(|| format!("writing machine history {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use psim_config::SimConfigInput;

    fn cfg_with(protocol_file_name: &str, isolate_job_id: Option<i64>) -> SimConfig {
        SimConfig::resolve(SimConfigInput {
            protocol_file_dir: Some("input".to_string()),
            protocol_file_name: Some(protocol_file_name.to_string()),
            isolate_job_id,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn splits_comma_separated_protocol_files() {
        let cfg = cfg_with("a.txt, b.txt,c.txt", None);
        let paths = protocol_paths(&cfg);
        assert_eq!(paths, vec![Path::new("input/a.txt"), Path::new("input/b.txt"), Path::new("input/c.txt")]);
    }

    #[test]
    fn isolate_job_id_selects_a_single_file() {
        let cfg = cfg_with("a.txt,b.txt,c.txt", Some(1));
        let paths = protocol_paths(&cfg);
        assert_eq!(paths, vec![Path::new("input/b.txt")]);
    }

    #[test]
    fn out_of_range_isolate_job_id_falls_back_to_all_files() {
        let cfg = cfg_with("a.txt,b.txt", Some(5));
        let paths = protocol_paths(&cfg);
        assert_eq!(paths.len(), 2);
    }
}
