//! Per-step history entries recorded by the simulator loop, used to
//! reconstruct per-job completion traces after a run.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timer: f64,
    pub total_link_bandwidth: f64,
    /// Fraction of tasks finished per registered protocol, indexed by
    /// ascending job id (see `Simulator::record_history`).
    pub job_progress: Vec<f64>,
}
