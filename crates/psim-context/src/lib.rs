//! The run context: a process-wide value holding at most two `RunInfo`s
//! (the in-progress run and the better/prior of earlier runs), threaded
//! explicitly through the simulator and scheduler rather than hidden behind
//! a singleton accessor.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

pub type LinkId = u64;
pub type FlowId = u64;
pub type UpperItemId = u64;

/// A single profiled instant: the link-load and flow-load readings taken
/// when `timer` fell on a profiling boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfiledStep {
    pub timer: f64,
    pub link_load: HashMap<LinkId, f64>,
    pub flow_load: HashMap<FlowId, f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FlowStats {
    pub start_time: f64,
    pub end_time: f64,
    pub fct: f64,
    pub average_rate: f64,
}

/// Everything profiled during one simulation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInfo {
    pub profiled: Vec<ProfiledStep>,
    pub flow_stats: HashMap<FlowId, FlowStats>,
    pub routing_decisions: HashMap<FlowId, UpperItemId>,
    pub critical: HashSet<FlowId>,
    pub total_time: Option<f64>,
}

impl RunInfo {
    pub fn record_step(&mut self, timer: f64, link_load: HashMap<LinkId, f64>, flow_load: HashMap<FlowId, f64>) {
        self.profiled.push(ProfiledStep {
            timer,
            link_load,
            flow_load,
        });
    }

    pub fn record_flow_finish(&mut self, flow_id: FlowId, start_time: f64, end_time: f64, average_rate: f64) {
        self.flow_stats.insert(
            flow_id,
            FlowStats {
                start_time,
                end_time,
                fct: end_time - start_time,
                average_rate,
            },
        );
    }

    pub fn mark_critical(&mut self, flow_id: FlowId) {
        self.critical.insert(flow_id);
    }

    pub fn is_critical(&self, flow_id: FlowId) -> bool {
        self.critical.contains(&flow_id)
    }

    pub fn save_decision(&mut self, flow_id: FlowId, upper_item_id: UpperItemId) {
        self.routing_decisions.insert(flow_id, upper_item_id);
    }

    pub fn decision(&self, flow_id: FlowId) -> Option<UpperItemId> {
        self.routing_decisions.get(&flow_id).copied()
    }

    /// Adjusts a profiled step's link load by `delta`, used by the
    /// future-load balancer's counterfactual update of a prior run after it
    /// reroutes a flow away from the load it originally predicted.
    pub fn adjust_link_load(&mut self, step_index: usize, link_id: LinkId, delta: f64) {
        if let Some(step) = self.profiled.get_mut(step_index) {
            *step.link_load.entry(link_id).or_insert(0.0) += delta;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Always drop the older of the two retained runs.
    DropOldest,
    /// Drop the worse (longer `total_time`) of the two retained runs.
    KeepBetter,
}

#[derive(Debug, Clone)]
pub struct RunContext {
    runs: VecDeque<RunInfo>,
    retention: RetentionPolicy,
}

impl RunContext {
    pub fn new(keep_better: bool) -> Self {
        let retention = if keep_better {
            RetentionPolicy::KeepBetter
        } else {
            RetentionPolicy::DropOldest
        };
        RunContext {
            runs: VecDeque::new(),
            retention,
        }
    }

    /// Pushes a fresh `RunInfo` as the new current run, evicting down to at
    /// most two retained runs per `retention`.
    pub fn start_new_run(&mut self) -> &mut RunInfo {
        self.runs.push_back(RunInfo::default());
        while self.runs.len() > 2 {
            match self.retention {
                RetentionPolicy::DropOldest => {
                    self.runs.pop_front();
                }
                RetentionPolicy::KeepBetter => {
                    let a = self.runs[0].total_time.unwrap_or(f64::INFINITY);
                    let b = self.runs[1].total_time.unwrap_or(f64::INFINITY);
                    let drop_index = if a <= b { 1 } else { 0 };
                    self.runs.remove(drop_index);
                }
            }
        }
        self.runs.back_mut().expect("just pushed")
    }

    pub fn finalize_current_run(&mut self, total_time: f64) {
        if let Some(run) = self.runs.back_mut() {
            run.total_time = Some(total_time);
        }
    }

    pub fn this_run(&self) -> Option<&RunInfo> {
        self.runs.back()
    }

    pub fn this_run_mut(&mut self) -> Option<&mut RunInfo> {
        self.runs.back_mut()
    }

    pub fn last_run(&self) -> Option<&RunInfo> {
        if self.runs.len() >= 2 {
            self.runs.get(self.runs.len() - 2)
        } else {
            None
        }
    }

    pub fn last_run_mut(&mut self) -> Option<&mut RunInfo> {
        if self.runs.len() >= 2 {
            let idx = self.runs.len() - 2;
            self.runs.get_mut(idx)
        } else {
            None
        }
    }

    pub fn is_first_run(&self) -> bool {
        self.runs.len() <= 1
    }

    pub fn save_decision(&mut self, flow_id: FlowId, upper_item_id: UpperItemId) {
        if let Some(run) = self.this_run_mut() {
            run.save_decision(flow_id, upper_item_id);
        }
    }

    pub fn last_decision(&self, flow_id: FlowId) -> Option<UpperItemId> {
        self.last_run().and_then(|r| r.decision(flow_id))
    }

    pub fn record_link_status(
        &mut self,
        timer: f64,
        link_load: HashMap<LinkId, f64>,
        flow_load: HashMap<FlowId, f64>,
    ) {
        if let Some(run) = self.this_run_mut() {
            run.record_step(timer, link_load, flow_load);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_has_no_prior() {
        let mut ctx = RunContext::new(false);
        ctx.start_new_run();
        assert!(ctx.is_first_run());
        assert!(ctx.last_run().is_none());
    }

    #[test]
    fn retains_at_most_two_runs_drop_oldest() {
        let mut ctx = RunContext::new(false);
        ctx.start_new_run();
        ctx.finalize_current_run(10.0);
        ctx.start_new_run();
        ctx.finalize_current_run(20.0);
        ctx.start_new_run();
        ctx.finalize_current_run(5.0);
        assert_eq!(ctx.last_run().unwrap().total_time, Some(20.0));
        assert_eq!(ctx.this_run().unwrap().total_time, Some(5.0));
    }

    #[test]
    fn retains_better_of_two_runs_when_configured() {
        let mut ctx = RunContext::new(true);
        ctx.start_new_run();
        ctx.finalize_current_run(10.0); // best so far
        ctx.start_new_run();
        ctx.finalize_current_run(20.0); // worse, but most recent prior
        ctx.start_new_run();
        ctx.finalize_current_run(5.0); // newest current

        // The third push makes three runs {10, 20, 5}; keep-better drops the
        // worse of the two OLD runs (20.0), retaining {10.0 as prior, 5.0 as current}.
        assert_eq!(ctx.last_run().unwrap().total_time, Some(10.0));
        assert_eq!(ctx.this_run().unwrap().total_time, Some(5.0));
    }

    #[test]
    fn decision_round_trips_across_runs() {
        let mut ctx = RunContext::new(false);
        ctx.start_new_run();
        ctx.save_decision(1, 7);
        ctx.finalize_current_run(1.0);
        ctx.start_new_run();
        assert_eq!(ctx.last_decision(1), Some(7));
    }

    #[test]
    fn critical_flag_is_queryable() {
        let mut ctx = RunContext::new(false);
        let run = ctx.start_new_run();
        run.mark_critical(3);
        assert!(ctx.this_run().unwrap().is_critical(3));
        assert!(!ctx.this_run().unwrap().is_critical(4));
    }
}
