//! Component F: the global simulator loop -- task admission, per-step
//! orchestration of the flow/compute runtime, history tracking, and
//! critical-path marking once every protocol completes.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use psim_config::SimConfig;
use psim_context::RunContext;
use psim_loadbalancer::LoadBalancer;
use psim_protocol::{JobId, Protocol, ProtocolError, TaskId, TaskKind};
use psim_topology::{MachineId, Topology, TopologyError};

use crate::history::HistoryEntry;
use crate::runtime;

#[derive(Debug, Error)]
pub enum SimRunError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Owns the topology, every registered protocol, the load balancer, the run
/// context, and the step clock. Constructed once per simulation run.
pub struct Simulator {
    pub topology: Topology,
    pub protocols: HashMap<JobId, Protocol>,
    pub selector: LoadBalancer,
    pub context: RunContext,
    pub cfg: SimConfig,
    next_job_id: JobId,
    pub history: Vec<HistoryEntry>,
    pub timer: f64,
}

impl Simulator {
    pub fn new(cfg: SimConfig, context: RunContext, selector: LoadBalancer) -> Result<Self, TopologyError> {
        let topology = Topology::build(&cfg)?;
        Ok(Simulator {
            topology,
            protocols: HashMap::new(),
            selector,
            context,
            cfg,
            next_job_id: 0,
            history: Vec::new(),
            timer: 0.0,
        })
    }

    /// Registers a protocol, assigning it the next job id and building its
    /// dependency graph. Returns the assigned job id.
    pub fn add_protocol(&mut self, mut protocol: Protocol) -> Result<JobId, ProtocolError> {
        let job_id = self.next_job_id;
        self.next_job_id += 1;
        protocol.job_id = job_id;
        protocol.build_dependency_graph()?;
        self.protocols.insert(job_id, protocol);
        Ok(job_id)
    }

    fn setup_started_task(&mut self, job_id: JobId, task_id: TaskId, timer: f64) {
        let protocol = self.protocols.get_mut(&job_id).expect("job id registered");
        let task = protocol.task_mut(task_id).expect("task id valid");
        if task.kind.is_flow() {
            let path = runtime::initiate_flow(
                &mut self.topology,
                &mut self.selector,
                job_id,
                task_id,
                timer,
                &self.cfg,
                task,
            );
            let upper_item_id = path.last().map(|b| u64::from(*b)).unwrap_or(0);
            self.context.save_decision(runtime::pack_queue_key(job_id, task_id), upper_item_id);
        } else if task.kind.is_compute() {
            let dev_id = match &task.kind {
                TaskKind::Compute { dev_id, .. } => *dev_id,
                _ => unreachable!(),
            };
            let key = runtime::pack_queue_key(job_id, task_id);
            if let Some(m) = self.topology.machine_mut(MachineId(dev_id as u32)) {
                m.enqueue(key);
            }
        }
    }

    /// Starts `id` (and any empty-task cascade it triggers) at `timer`,
    /// performing the flow-path/compute-queue setup for any non-empty task
    /// this call itself starts (not its cascaded successors, which are
    /// queued for the caller to start at the next timestep).
    fn start_with_setup(&mut self, job_id: JobId, id: TaskId, timer: f64) -> Result<Vec<TaskId>, ProtocolError> {
        let protocol = self.protocols.get_mut(&job_id).expect("job id registered");
        let ready = protocol.start_task(id, timer)?;
        self.setup_started_task(job_id, id, timer);
        Ok(ready)
    }

    fn record_profiled_step(&mut self, timer: f64) {
        let mut link_load = HashMap::new();
        for b in self.topology.bottlenecks() {
            link_load.insert(u64::from(b.id), b.load(self.cfg.load_metric));
        }
        let mut flow_load = HashMap::new();
        for (job_id, protocol) in &self.protocols {
            for task in protocol.get_flows() {
                if let TaskKind::Flow { current_rate, .. } = &task.kind {
                    flow_load.insert(runtime::pack_queue_key(*job_id, task.id), *current_rate);
                }
            }
        }
        self.context.record_link_status(timer, link_load, flow_load);
    }

    fn record_history(&mut self, timer: f64) {
        let total_link_bandwidth: f64 = self.topology.bottlenecks().iter().map(|b| b.capacity).sum();
        let mut job_ids: Vec<JobId> = self.protocols.keys().copied().collect();
        job_ids.sort_unstable();
        let job_progress = job_ids
            .iter()
            .map(|id| {
                let p = &self.protocols[id];
                if p.total_count() == 0 {
                    1.0
                } else {
                    p.finished_count() as f64 / p.total_count() as f64
                }
            })
            .collect();
        self.history.push(HistoryEntry {
            timer,
            total_link_bandwidth,
            job_progress,
        });
        if self.history.len() % 1000 == 0 {
            tracing::info!(
                step = self.history.len(),
                timer,
                total_link_bandwidth,
                "simulator progress"
            );
        }
    }

    fn crude_remaining_time_estimate(task: &psim_protocol::Task) -> f64 {
        match &task.kind {
            TaskKind::Flow {
                size,
                progress,
                min_bottleneck_rate,
                ..
            } => {
                if *min_bottleneck_rate > 0.0 {
                    (*size - *progress) / *min_bottleneck_rate
                } else {
                    f64::INFINITY
                }
            }
            TaskKind::Compute { size, progress, .. } => *size - *progress,
            TaskKind::Empty => 0.0,
        }
    }

    fn next_step_size(&self) -> f64 {
        if !self.cfg.adaptive_step_size {
            return self.cfg.step_size;
        }
        let mut min_estimate = self.cfg.adaptive_step_size_max;
        for protocol in self.protocols.values() {
            for task in protocol.get_flows().chain(protocol.get_compute_tasks()) {
                if task.status != psim_protocol::TaskStatus::Running {
                    continue;
                }
                let estimate = Self::crude_remaining_time_estimate(task);
                if estimate < min_estimate {
                    min_estimate = estimate;
                }
            }
        }
        min_estimate.clamp(self.cfg.adaptive_step_size_min, self.cfg.adaptive_step_size_max)
    }

    /// Runs the simulation to completion: starts every protocol's
    /// initiators, then steps the clock until every protocol's task count
    /// is finished, then marks each protocol's critical path.
    pub fn run(&mut self) -> Result<(), SimRunError> {
        self.context.start_new_run();

        let mut pending: VecDeque<(JobId, TaskId, f64)> = VecDeque::new();
        let mut job_ids: Vec<JobId> = self.protocols.keys().copied().collect();
        job_ids.sort_unstable();
        for job_id in job_ids {
            let initiators = self.protocols[&job_id].initiators().to_vec();
            for id in initiators {
                pending.push_back((job_id, id, 0.0));
            }
        }
        while let Some((job_id, id, t)) = pending.pop_front() {
            let ready = self.start_with_setup(job_id, id, t)?;
            for succ in ready {
                pending.push_back((job_id, succ, t));
            }
        }

        let mut timer = 0.0;
        let mut step_size = self.next_step_size();
        let mut step_count: u64 = 0;

        loop {
            runtime::reset_links(&mut self.topology)?;
            runtime::register_rates(&mut self.topology, &self.protocols);
            runtime::compute_links(&mut self.topology)?;
            runtime::finalize_links(&mut self.topology)?;

            if self.cfg.record_machine_history {
                runtime::record_machine_history(&mut self.topology);
            }

            let mut finished = runtime::advance_flows(&mut self.topology, &mut self.protocols, step_size, &self.cfg);
            finished.extend(runtime::advance_compute(&mut self.topology, &mut self.protocols, step_size));

            if self.cfg.core_status_profiling_interval > 0
                && step_count % self.cfg.core_status_profiling_interval as u64 == 0
            {
                self.record_profiled_step(timer);
            }

            let mut to_start: VecDeque<(JobId, TaskId, f64)> = VecDeque::new();
            for (job_id, task_id) in &finished {
                let protocol = self.protocols.get_mut(job_id).expect("job id registered");
                let ready = protocol.finish_task(*task_id, timer)?;

                let task = protocol.task(*task_id).expect("task id valid");
                if let TaskKind::Flow {
                    current_rate,
                    path,
                    ..
                } = &task.kind
                {
                    let start = task.start_time.unwrap_or(timer);
                    let duration = (timer - start).max(step_size);
                    let avg_rate = if !path.is_empty() { task.kind.size() / duration } else { 0.0 };
                    let _ = current_rate;
                    if let Some(run) = self.context.this_run_mut() {
                        run.record_flow_finish(runtime::pack_queue_key(*job_id, *task_id), start, timer, avg_rate);
                    }
                }

                for succ in ready {
                    to_start.push_back((*job_id, succ, timer + step_size));
                }
            }
            while let Some((job_id, id, t)) = to_start.pop_front() {
                let ready = self.start_with_setup(job_id, id, t)?;
                for succ in ready {
                    to_start.push_back((job_id, succ, t));
                }
            }

            self.record_history(timer);

            timer += step_size;
            step_count += 1;
            step_size = self.next_step_size();

            if self.protocols.values().all(|p| p.is_complete()) {
                break;
            }
        }

        self.timer = timer;
        self.context.finalize_current_run(timer);

        for protocol in self.protocols.values() {
            let critical = protocol.mark_critical_path()?;
            if let Some(run) = self.context.this_run_mut() {
                for id in critical {
                    run.mark_critical(id);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psim_config::SimConfigInput;
    use rand::SeedableRng;

    fn two_server_cfg() -> SimConfig {
        SimConfig::resolve(SimConfigInput {
            machine_count: Some(2),
            ft_servers_per_rack: Some(2),
            ft_racks_per_pod: Some(1),
            ft_pod_count: Some(1),
            ft_aggs_per_pod: Some(1),
            ft_core_count: Some(1),
            link_bandwidth: Some(100.0),
            step_size: Some(0.1),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn single_flow_between_two_servers_completes() {
        let cfg = two_server_cfg();
        let context = RunContext::new(cfg.keep_better_run);
        let rng = rand::rngs::StdRng::seed_from_u64(cfg.rng_seed);
        let selector = LoadBalancer::RoundRobin(psim_loadbalancer::RoundRobinLb::new());
        let _ = rng;
        let mut sim = Simulator::new(cfg, context, selector).unwrap();

        let mut protocol = Protocol::new(0);
        protocol
            .add_task_with_id(
                0,
                TaskKind::Flow {
                    src: 0,
                    dst: 1,
                    size: 1000.0,
                    progress: 0.0,
                    current_rate: 0.0,
                    registered_rate: 0.0,
                    min_bottleneck_rate: 0.0,
                    selected_priority: 0,
                    path: Vec::new(),
                    protocol_defined_max_rate: -1.0,
                    bottlenecked_by_srcdst_count: 0,
                    bottlenecked_by_intermediate_count: 0,
                },
                vec![],
            )
            .unwrap();
        sim.add_protocol(protocol).unwrap();

        sim.run().unwrap();
        assert!(sim.protocols[&0].is_complete());
        assert!(sim.timer > 0.0);
    }

    #[test]
    fn allreduce_ring_produces_expected_flow_count() {
        // Four machines, two steps of a ring all-reduce over a big switch:
        // 2*(N-1)*N flows in total.
        let cfg = SimConfig::resolve(SimConfigInput {
            machine_count: Some(4),
            network_type: Some("bigswitch".to_string()),
            link_bandwidth: Some(100.0),
            ..Default::default()
        })
        .unwrap();
        let context = RunContext::new(cfg.keep_better_run);
        let selector = LoadBalancer::RoundRobin(psim_loadbalancer::RoundRobinLb::new());
        let mut sim = Simulator::new(cfg, context, selector).unwrap();

        let n = 4u64;
        let mut protocol = Protocol::new(0);
        let mut next_id = 0u64;
        let mut prev_layer: Vec<u64> = Vec::new();
        for chain in 0..n {
            let id = next_id;
            next_id += 1;
            protocol.add_task_with_id(id, TaskKind::Empty, vec![]).unwrap();
            prev_layer.push(id);
        }
        let mut flow_count = 0;
        for _stage in 0..(2 * (n - 1)) {
            let mut this_layer = Vec::new();
            for chain in 0..n {
                let src = chain;
                let dst = (chain + 1) % n;
                let id = next_id;
                next_id += 1;
                protocol
                    .add_task_with_id(
                        id,
                        TaskKind::Flow {
                            src,
                            dst,
                            size: 100.0,
                            progress: 0.0,
                            current_rate: 0.0,
                            registered_rate: 0.0,
                            min_bottleneck_rate: 0.0,
                            selected_priority: 0,
                            path: Vec::new(),
                            protocol_defined_max_rate: -1.0,
                            bottlenecked_by_srcdst_count: 0,
                            bottlenecked_by_intermediate_count: 0,
                        },
                        vec![],
                    )
                    .unwrap();
                flow_count += 1;
                protocol.task_mut(prev_layer[chain as usize]).unwrap().pending_next.push(id);
                this_layer.push(id);
            }
            prev_layer = this_layer;
        }
        assert_eq!(flow_count, 2 * (n - 1) * n);

        sim.add_protocol(protocol).unwrap();
        sim.run().unwrap();
        assert!(sim.protocols[&0].is_complete());
    }
}
