//! Process-wide configuration for the fabric simulator and offline scheduler.
//!
//! An all-`Option` input struct deserialized from TOML with
//! `#[serde(default)]`, resolved into a fully populated, `Default`-backed
//! config struct. Every option has a default, so a caller can resolve from
//! an empty input and get a runnable configuration.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown network type '{0}', expected one of fattree|leafspine|bigswitch")]
    UnknownNetworkType(String),
    #[error("unknown load balancer scheme '{0}'")]
    UnknownLbScheme(String),
    #[error("unknown priority allocator '{0}'")]
    UnknownPriorityAllocator(String),
    #[error("unknown load metric '{0}'")]
    UnknownLoadMetric(String),
    #[error("unknown regret mode '{0}'")]
    UnknownRegretMode(String),
    #[error("fat-tree dimensions invalid: machine_count ({machine_count}) must equal servers_per_rack * racks_per_pod * pod_count ({product})")]
    FatTreeMachineCountMismatch { machine_count: u32, product: u32 },
    #[error("fat-tree dimensions invalid: core_count ({core_count}) must be divisible by aggs_per_pod ({aggs_per_pod})")]
    FatTreeCoreNotDivisible { core_count: u32, aggs_per_pod: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    FatTree,
    LeafSpine,
    BigSwitch,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkType::FatTree => "fattree",
            NetworkType::LeafSpine => "leafspine",
            NetworkType::BigSwitch => "bigswitch",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for NetworkType {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fattree" => Ok(NetworkType::FatTree),
            "leafspine" => Ok(NetworkType::LeafSpine),
            "bigswitch" => Ok(NetworkType::BigSwitch),
            other => Err(ConfigError::UnknownNetworkType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbScheme {
    Random,
    RoundRobin,
    PowerOfK,
    LeastLoaded,
    RobinHood,
    FutureLoad,
}

impl std::str::FromStr for LbScheme {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(LbScheme::Random),
            "roundrobin" => Ok(LbScheme::RoundRobin),
            "powerofk" => Ok(LbScheme::PowerOfK),
            "leastloaded" => Ok(LbScheme::LeastLoaded),
            "robinhood" => Ok(LbScheme::RobinHood),
            "futureload" => Ok(LbScheme::FutureLoad),
            other => Err(ConfigError::UnknownLbScheme(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityAllocatorKind {
    FairShare,
    MaxMinFairShare,
    FixedLevels,
    PriorityQueue,
}

impl std::str::FromStr for PriorityAllocatorKind {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fairshare" => Ok(PriorityAllocatorKind::FairShare),
            "maxminfairshare" => Ok(PriorityAllocatorKind::MaxMinFairShare),
            "fixedlevels" => Ok(PriorityAllocatorKind::FixedLevels),
            "priorityqueue" => Ok(PriorityAllocatorKind::PriorityQueue),
            other => Err(ConfigError::UnknownPriorityAllocator(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMetric {
    Registered,
    Allocated,
    Utilization,
    FlowSize,
    FlowCount,
}

impl std::str::FromStr for LoadMetric {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(LoadMetric::Registered),
            "allocated" => Ok(LoadMetric::Allocated),
            "utilization" => Ok(LoadMetric::Utilization),
            "flowsize" => Ok(LoadMetric::FlowSize),
            "flowcount" => Ok(LoadMetric::FlowCount),
            other => Err(ConfigError::UnknownLoadMetric(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegretMode {
    Critical,
    All,
    None,
}

impl std::str::FromStr for RegretMode {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(RegretMode::Critical),
            "all" => Ok(RegretMode::All),
            "none" => Ok(RegretMode::None),
            other => Err(ConfigError::UnknownRegretMode(other.to_string())),
        }
    }
}

/// Raw, all-optional configuration as read from TOML. Every field defaults
/// to `None`/empty so a caller can supply only the options they care about.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimConfigInput {
    pub step_size: Option<f64>,
    pub adaptive_step_size: Option<bool>,
    pub adaptive_step_size_min: Option<f64>,
    pub adaptive_step_size_max: Option<f64>,
    pub rate_increase: Option<f64>,
    pub initial_rate: Option<f64>,
    pub min_rate: Option<f64>,
    pub rate_decrease_factor: Option<f64>,
    pub link_bandwidth: Option<f64>,

    pub machine_count: Option<u32>,
    pub network_type: Option<String>,
    pub ft_servers_per_rack: Option<u32>,
    pub ft_racks_per_pod: Option<u32>,
    pub ft_aggs_per_pod: Option<u32>,
    pub ft_pod_count: Option<u32>,
    pub ft_core_count: Option<u32>,
    pub ft_server_tor_link_capacity_mult: Option<f64>,
    pub ft_tor_agg_link_capacity_mult: Option<f64>,
    pub ft_agg_core_link_capacity_mult: Option<f64>,

    pub lb_scheme: Option<String>,
    pub lb_samples: Option<u32>,
    pub priority_allocator: Option<String>,
    pub bn_priority_levels: Option<u32>,
    pub load_metric: Option<String>,
    pub core_status_profiling_interval: Option<u32>,
    pub punish_oversubscribed: Option<bool>,
    pub punish_oversubscribed_min: Option<f64>,
    pub keep_better_run: Option<bool>,

    pub protocol_file_dir: Option<String>,
    pub protocol_file_name: Option<String>,
    pub output_dir: Option<String>,
    pub log_file_name: Option<String>,
    pub console_log_level: Option<String>,
    pub file_log_level: Option<String>,
    pub rep_count: Option<u32>,
    pub plot_graphs: Option<bool>,
    pub export_dot: Option<bool>,
    pub record_bottleneck_history: Option<bool>,
    pub record_machine_history: Option<bool>,
    pub regret_mode: Option<String>,
    pub subflows: Option<u32>,
    pub throttle_factor: Option<f64>,
    pub isolate_job_id: Option<i64>,
    pub placement_file: Option<String>,
    pub timing_file: Option<String>,
    pub routing_file: Option<String>,
    pub shuffle_device_map: Option<bool>,
    pub shuffle_map_file: Option<String>,

    pub max_fixing_rounds: Option<u32>,
    pub rng_seed: Option<u64>,
}

/// Fully resolved configuration, every field populated.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub step_size: f64,
    pub adaptive_step_size: bool,
    pub adaptive_step_size_min: f64,
    pub adaptive_step_size_max: f64,
    pub rate_increase: f64,
    pub initial_rate: f64,
    pub min_rate: f64,
    pub rate_decrease_factor: f64,
    pub link_bandwidth: f64,

    pub machine_count: u32,
    pub network_type: NetworkType,
    pub ft_servers_per_rack: u32,
    pub ft_racks_per_pod: u32,
    pub ft_aggs_per_pod: u32,
    pub ft_pod_count: u32,
    pub ft_core_count: u32,
    pub ft_server_tor_link_capacity_mult: f64,
    pub ft_tor_agg_link_capacity_mult: f64,
    pub ft_agg_core_link_capacity_mult: f64,

    pub lb_scheme: LbScheme,
    pub lb_samples: u32,
    pub priority_allocator: PriorityAllocatorKind,
    pub bn_priority_levels: u32,
    pub load_metric: LoadMetric,
    pub core_status_profiling_interval: u32,
    pub punish_oversubscribed: bool,
    pub punish_oversubscribed_min: f64,
    pub keep_better_run: bool,

    pub protocol_file_dir: String,
    pub protocol_file_name: String,
    pub output_dir: String,
    pub log_file_name: String,
    pub console_log_level: String,
    pub file_log_level: String,
    pub rep_count: u32,
    pub plot_graphs: bool,
    pub export_dot: bool,
    pub record_bottleneck_history: bool,
    pub record_machine_history: bool,
    pub regret_mode: RegretMode,
    pub subflows: u32,
    pub throttle_factor: f64,
    pub isolate_job_id: Option<i64>,
    pub placement_file: Option<String>,
    pub timing_file: Option<String>,
    pub routing_file: Option<String>,
    pub shuffle_device_map: bool,
    pub shuffle_map_file: Option<String>,

    pub max_fixing_rounds: u32,
    pub rng_seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        // Defaults mirror original_source/include/gconfig.h.
        SimConfig {
            step_size: 0.01,
            adaptive_step_size: false,
            adaptive_step_size_min: 0.1,
            adaptive_step_size_max: 1.0,
            rate_increase: 1.1,
            initial_rate: 10.0,
            min_rate: 1.0,
            rate_decrease_factor: 0.5,
            link_bandwidth: 100.0,

            machine_count: 128,
            network_type: NetworkType::FatTree,
            ft_servers_per_rack: 8,
            ft_racks_per_pod: 4,
            ft_aggs_per_pod: 4,
            ft_pod_count: 4,
            ft_core_count: 4,
            ft_server_tor_link_capacity_mult: 1.0,
            ft_tor_agg_link_capacity_mult: 2.0,
            ft_agg_core_link_capacity_mult: 8.0,

            lb_scheme: LbScheme::RoundRobin,
            lb_samples: 2,
            priority_allocator: PriorityAllocatorKind::FairShare,
            bn_priority_levels: 1,
            load_metric: LoadMetric::Utilization,
            core_status_profiling_interval: 10,
            punish_oversubscribed: false,
            punish_oversubscribed_min: 0.0,
            keep_better_run: true,

            protocol_file_dir: "input".to_string(),
            protocol_file_name: "protocol.txt".to_string(),
            output_dir: "output".to_string(),
            log_file_name: "log.txt".to_string(),
            console_log_level: "info".to_string(),
            file_log_level: "info".to_string(),
            rep_count: 2,
            plot_graphs: false,
            export_dot: false,
            record_bottleneck_history: false,
            record_machine_history: false,
            regret_mode: RegretMode::None,
            subflows: 1,
            throttle_factor: 1.0,
            isolate_job_id: None,
            placement_file: None,
            timing_file: None,
            routing_file: None,
            shuffle_device_map: false,
            shuffle_map_file: None,

            max_fixing_rounds: 4,
            rng_seed: 42,
        }
    }
}

impl SimConfig {
    /// Resolves an input document against the defaults, validating every
    /// enum-valued option and the fat-tree dimension invariants.
    pub fn resolve(input: SimConfigInput) -> Result<Self, ConfigError> {
        let base = SimConfig::default();

        let mut cfg = SimConfig {
            step_size: input.step_size.unwrap_or(base.step_size),
            adaptive_step_size: input.adaptive_step_size.unwrap_or(base.adaptive_step_size),
            adaptive_step_size_min: input
                .adaptive_step_size_min
                .unwrap_or(base.adaptive_step_size_min),
            adaptive_step_size_max: input
                .adaptive_step_size_max
                .unwrap_or(base.adaptive_step_size_max),
            rate_increase: input.rate_increase.unwrap_or(base.rate_increase),
            initial_rate: input.initial_rate.unwrap_or(base.initial_rate),
            min_rate: input.min_rate.unwrap_or(base.min_rate),
            rate_decrease_factor: input
                .rate_decrease_factor
                .unwrap_or(base.rate_decrease_factor),
            link_bandwidth: input.link_bandwidth.unwrap_or(base.link_bandwidth),

            machine_count: input.machine_count.unwrap_or(base.machine_count),
            network_type: match input.network_type {
                Some(s) => s.parse()?,
                None => base.network_type,
            },
            ft_servers_per_rack: input
                .ft_servers_per_rack
                .unwrap_or(base.ft_servers_per_rack),
            ft_racks_per_pod: input.ft_racks_per_pod.unwrap_or(base.ft_racks_per_pod),
            ft_aggs_per_pod: input.ft_aggs_per_pod.unwrap_or(base.ft_aggs_per_pod),
            ft_pod_count: input.ft_pod_count.unwrap_or(base.ft_pod_count),
            ft_core_count: input.ft_core_count.unwrap_or(base.ft_core_count),
            ft_server_tor_link_capacity_mult: input
                .ft_server_tor_link_capacity_mult
                .unwrap_or(base.ft_server_tor_link_capacity_mult),
            ft_tor_agg_link_capacity_mult: input
                .ft_tor_agg_link_capacity_mult
                .unwrap_or(base.ft_tor_agg_link_capacity_mult),
            ft_agg_core_link_capacity_mult: input
                .ft_agg_core_link_capacity_mult
                .unwrap_or(base.ft_agg_core_link_capacity_mult),

            lb_scheme: match input.lb_scheme {
                Some(s) => s.parse()?,
                None => base.lb_scheme,
            },
            lb_samples: input.lb_samples.unwrap_or(base.lb_samples),
            priority_allocator: match input.priority_allocator {
                Some(s) => s.parse()?,
                None => base.priority_allocator,
            },
            bn_priority_levels: input.bn_priority_levels.unwrap_or(base.bn_priority_levels),
            load_metric: match input.load_metric {
                Some(s) => s.parse()?,
                None => base.load_metric,
            },
            core_status_profiling_interval: input
                .core_status_profiling_interval
                .unwrap_or(base.core_status_profiling_interval),
            punish_oversubscribed: input
                .punish_oversubscribed
                .unwrap_or(base.punish_oversubscribed),
            punish_oversubscribed_min: input
                .punish_oversubscribed_min
                .unwrap_or(base.punish_oversubscribed_min),
            keep_better_run: input.keep_better_run.unwrap_or(base.keep_better_run),

            protocol_file_dir: input.protocol_file_dir.unwrap_or(base.protocol_file_dir),
            protocol_file_name: input.protocol_file_name.unwrap_or(base.protocol_file_name),
            output_dir: input.output_dir.unwrap_or(base.output_dir),
            log_file_name: input.log_file_name.unwrap_or(base.log_file_name),
            console_log_level: input.console_log_level.unwrap_or(base.console_log_level),
            file_log_level: input.file_log_level.unwrap_or(base.file_log_level),
            rep_count: input.rep_count.unwrap_or(base.rep_count),
            plot_graphs: input.plot_graphs.unwrap_or(base.plot_graphs),
            export_dot: input.export_dot.unwrap_or(base.export_dot),
            record_bottleneck_history: input
                .record_bottleneck_history
                .unwrap_or(base.record_bottleneck_history),
            record_machine_history: input
                .record_machine_history
                .unwrap_or(base.record_machine_history),
            regret_mode: match input.regret_mode {
                Some(s) => s.parse()?,
                None => base.regret_mode,
            },
            subflows: input.subflows.unwrap_or(base.subflows),
            throttle_factor: input.throttle_factor.unwrap_or(base.throttle_factor),
            isolate_job_id: input.isolate_job_id.or(base.isolate_job_id),
            placement_file: input.placement_file.or(base.placement_file),
            timing_file: input.timing_file.or(base.timing_file),
            routing_file: input.routing_file.or(base.routing_file),
            shuffle_device_map: input.shuffle_device_map.unwrap_or(base.shuffle_device_map),
            shuffle_map_file: input.shuffle_map_file.or(base.shuffle_map_file),

            max_fixing_rounds: input.max_fixing_rounds.unwrap_or(base.max_fixing_rounds),
            rng_seed: input.rng_seed.unwrap_or(base.rng_seed),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let input: SimConfigInput = toml::from_str(s)?;
        Self::resolve(input)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.network_type == NetworkType::FatTree || self.network_type == NetworkType::LeafSpine
        {
            let racks_per_pod = if self.network_type == NetworkType::LeafSpine {
                1
            } else {
                self.ft_racks_per_pod
            };
            let product = self.ft_servers_per_rack * racks_per_pod * self.ft_pod_count;
            if self.machine_count != product {
                return Err(ConfigError::FatTreeMachineCountMismatch {
                    machine_count: self.machine_count,
                    product,
                });
            }
            if self.ft_core_count % self.ft_aggs_per_pod != 0 {
                return Err(ConfigError::FatTreeCoreNotDivisible {
                    core_count: self.ft_core_count,
                    aggs_per_pod: self.ft_aggs_per_pod,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_cleanly() {
        let cfg = SimConfig::resolve(SimConfigInput::default()).unwrap();
        assert_eq!(cfg.machine_count, 128);
        assert_eq!(cfg.network_type, NetworkType::FatTree);
    }

    #[test]
    fn rejects_inconsistent_fat_tree_dims() {
        let input = SimConfigInput {
            machine_count: Some(17),
            ..Default::default()
        };
        let err = SimConfig::resolve(input).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::FatTreeMachineCountMismatch { .. }
        ));
    }

    #[test]
    fn rejects_core_count_not_divisible() {
        let input = SimConfigInput {
            ft_core_count: Some(3),
            ft_aggs_per_pod: Some(4),
            ..Default::default()
        };
        let err = SimConfig::resolve(input).unwrap_err();
        assert!(matches!(err, ConfigError::FatTreeCoreNotDivisible { .. }));
    }

    #[test]
    fn parses_toml_overrides() {
        let toml_str = r#"
            step_size = 0.05
            lb_scheme = "leastloaded"
            load_metric = "flowcount"
        "#;
        let cfg = SimConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(cfg.step_size, 0.05);
        assert_eq!(cfg.lb_scheme, LbScheme::LeastLoaded);
        assert_eq!(cfg.load_metric, LoadMetric::FlowCount);
    }

    #[test]
    fn rejects_unknown_scheme() {
        let input = SimConfigInput {
            lb_scheme: Some("quantum".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            SimConfig::resolve(input),
            Err(ConfigError::UnknownLbScheme(_))
        ));
    }
}
