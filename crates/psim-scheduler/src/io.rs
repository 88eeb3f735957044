//! JSON wire types for the offline scheduler: input (jobs, options,
//! run context, profile files) and output (job timings, load-balancing
//! decisions, context updates to fold into the next call).
//!
//! Field names mirror `original_source/src/scheduler/scheduler.cc`'s
//! `json` keys (kebab-case for options/run-context, matching `ParseInput`)
//! so a caller that already emits the original's documents can feed them in
//! unchanged.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type JobId = i64;
pub type FlowId = i64;

/// One job as described in the offline scheduler's input document.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub job_id: JobId,
    #[serde(default)]
    pub machines: Vec<u64>,
    #[serde(default)]
    pub layer_count: u32,
    pub iter_count: u32,
    #[serde(default)]
    pub comm_size: f64,
    #[serde(default)]
    pub comp_size: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    #[serde(rename = "machine-count")]
    pub machine_count: u32,
    #[serde(rename = "ft-server-per-rack")]
    pub ft_server_per_rack: u32,
    #[serde(rename = "link-bandwidth")]
    pub link_bandwidth: f64,
    #[serde(rename = "ft-core-count")]
    pub ft_core_count: u32,
    #[serde(rename = "ft-agg-core-link-capacity-mult")]
    pub ft_agg_core_link_capacity_mult: f64,
    pub subflows: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            machine_count: 128,
            ft_server_per_rack: 8,
            link_bandwidth: 100.0,
            ft_core_count: 4,
            ft_agg_core_link_capacity_mult: 8.0,
            subflows: 1,
        }
    }
}

impl SchedulerOptions {
    pub fn rack_count(&self) -> u32 {
        if self.ft_server_per_rack == 0 {
            1
        } else {
            (self.machine_count / self.ft_server_per_rack).max(1)
        }
    }

    pub fn link_capacity(&self) -> f64 {
        self.ft_core_count as f64 * self.ft_agg_core_link_capacity_mult
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunContextInput {
    #[serde(rename = "profiled-throttle-factors")]
    pub profiled_throttle_factors: Option<Vec<f64>>,
    #[serde(rename = "throttle-search")]
    pub throttle_search: bool,
    pub inflate: Option<f64>,
    #[serde(rename = "timing-scheme")]
    pub timing_scheme: String,
    #[serde(rename = "farid-rounds")]
    pub farid_rounds: u32,
    pub use_inflation: bool,
    #[serde(rename = "fallback-threshold")]
    pub fallback_threshold: f64,
    #[serde(rename = "sim-length")]
    pub sim_length: i64,
}

impl Default for RunContextInput {
    fn default() -> Self {
        RunContextInput {
            profiled_throttle_factors: None,
            throttle_search: false,
            inflate: None,
            timing_scheme: "faridv6".to_string(),
            farid_rounds: 4,
            use_inflation: false,
            fallback_threshold: 1.0,
            sim_length: 1,
        }
    }
}

/// A prior simulation run's per-flow link-load time series, one per
/// `(job_id, throttle_rate)` pair.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProfileFile {
    pub period: i64,
    pub flows: Vec<FlowProfile>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowProfile {
    pub flow_id: FlowId,
    pub job_id: JobId,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub subflow: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub srcrack: i64,
    pub dstrack: i64,
    #[serde(default)]
    pub fct: f64,
    #[serde(default)]
    pub core: i64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub flow_size: f64,
    pub progress_history: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerInput {
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub options: SchedulerOptions,
    #[serde(default)]
    pub run_context: RunContextInput,
    #[serde(default)]
    pub timing_file_path: Option<String>,
    #[serde(default)]
    pub routing_file_path: Option<String>,
    #[serde(default)]
    pub placement_seed: u64,
    /// Profile documents keyed by `job_id` then by the throttle rate
    /// formatted as a string (matching the original's JSON object keys,
    /// since JSON objects may only be keyed by strings). Not part of the
    /// original's single input document (there, profile files are read
    /// from disk by path); kept as an explicit field here so a caller who
    /// already holds profiles in memory (the CLI, right after a simulate
    /// run) can pass them straight through without a file round-trip.
    #[serde(default)]
    pub profiles: HashMap<JobId, HashMap<String, ProfileFile>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobTiming {
    pub job_id: JobId,
    pub deltas: Vec<i64>,
    pub throttle_rates: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LbDecision {
    pub job_id: JobId,
    pub flow_id: FlowId,
    pub iteration: u32,
    pub spine_count: usize,
    pub spine_rates: Vec<(u32, f64)>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct AddToContext {
    pub fixing_rounds: u32,
    pub fixed_bad_range_ratio: f64,
    pub fixed_bad_range_ratios: Vec<f64>,
    pub remaining_bad_range_ratio: f64,
    pub remaining_bad_range_ratios: Vec<f64>,
    pub job_costs: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SchedulerOutput {
    pub job_timings: Vec<JobTiming>,
    pub lb_decisions: Vec<LbDecision>,
    pub add_to_context: AddToContext,
}
