//! Component E: per-step rate registration, allocation read-back, and
//! progress accounting for flows and compute tasks.
//!
//! Kept as a set of free functions operating on a `Protocol`'s tasks rather
//! than a `Flow`/`ComputeTask` type of its own -- the runtime state already
//! lives on `psim_protocol::TaskKind`, so this module is the part of the
//! original `flow.cc`/`Machine::make_progress` that isn't already owned by
//! `psim-protocol` or `psim-topology`.

use psim_config::SimConfig;
use psim_protocol::{JobId, Protocol, TaskId, TaskKind};
use psim_topology::{BottleneckId, MachineId, Topology};

fn to_machine(dev: u64) -> MachineId {
    MachineId(dev as u32)
}

/// Resets every link's allocator for the step ahead.
pub fn reset_links(topology: &mut Topology) -> Result<(), psim_topology::TopologyError> {
    for b in topology.bottlenecks_mut() {
        b.reset_step()?;
    }
    Ok(())
}

/// Registers every in-flight flow's current rate on each link of its path.
///
/// Flows are registered under their *global* id (`pack_queue_key(job_id,
/// task_id)`), not the bare per-protocol task id: task ids are only unique
/// within their own protocol (two jobs loaded from two protocol files both
/// typically number tasks from zero), and every allocator keys its
/// registrations by a flat `u64` id, so two jobs sharing a link would
/// otherwise silently clobber each other's registration.
pub fn register_rates(topology: &mut Topology, protocols: &std::collections::HashMap<JobId, Protocol>) {
    for (job_id, protocol) in protocols {
        for task in protocol.get_flows() {
            if task.status != psim_protocol::TaskStatus::Running {
                continue;
            }
            if let TaskKind::Flow {
                current_rate,
                selected_priority,
                path,
                size,
                ..
            } = &task.kind
            {
                let gid = pack_queue_key(*job_id, task.id);
                for link in path {
                    if let Some(b) = topology.bottleneck_mut(BottleneckId(*link as u32)) {
                        b.register(gid, *current_rate, *selected_priority as i32, *size);
                    }
                }
            }
        }
    }
}

/// Computes every link's allocation for the step just registered.
pub fn compute_links(topology: &mut Topology) -> Result<(), psim_topology::TopologyError> {
    for b in topology.bottlenecks_mut() {
        b.compute()?;
    }
    Ok(())
}

/// Sums this step's registered/allocated/utilized totals, appends to each
/// link's history when enabled, and checks the allocator invariants.
pub fn finalize_links(topology: &mut Topology) -> Result<(), psim_topology::TopologyError> {
    for b in topology.bottlenecks_mut() {
        b.finalize_step()?;
    }
    Ok(())
}

/// Reads back each flow's allocation, advances its progress, updates its
/// rate for the next step, and returns the ids of flows that just finished.
///
/// A link on the path is considered "dropping" this step when its allocator
/// reports congestion (`is_congested`); the drop never desyncs rate state,
/// it only feeds the decrease factor into the next registered rate.
pub fn advance_flows(
    topology: &mut Topology,
    protocols: &mut std::collections::HashMap<JobId, Protocol>,
    step_size: f64,
    cfg: &SimConfig,
) -> Vec<(JobId, TaskId)> {
    let mut finished = Vec::new();
    for (job_id, protocol) in protocols.iter_mut() {
        let running_flow_ids: Vec<TaskId> = protocol
            .get_flows()
            .filter(|t| t.status == psim_protocol::TaskStatus::Running)
            .map(|t| t.id)
            .collect();
        for task_id in running_flow_ids {
            let task = protocol.task_mut(task_id).expect("flow task id is valid");
            let TaskKind::Flow {
                size,
                progress,
                current_rate,
                registered_rate,
                min_bottleneck_rate,
                selected_priority,
                path,
                protocol_defined_max_rate,
                bottlenecked_by_srcdst_count,
                bottlenecked_by_intermediate_count,
                ..
            } = &mut task.kind
            else {
                unreachable!("get_flows only yields Flow tasks");
            };

            *registered_rate = *current_rate;
            let gid = pack_queue_key(*job_id, task_id);

            let mut allocated = f64::INFINITY;
            let mut any_congested = false;
            let mut min_idx = 0usize;
            for (idx, link) in path.iter().enumerate() {
                let Some(b) = topology.bottleneck(BottleneckId(*link as u32)) else {
                    continue;
                };
                let a = b.get_allocated(gid, *registered_rate, *selected_priority as i32);
                if a < allocated {
                    allocated = a;
                    min_idx = idx;
                }
                any_congested = any_congested || b.is_congested();
            }
            if path.is_empty() {
                allocated = *current_rate;
            }

            if !path.is_empty() {
                if min_idx == 0 || min_idx == path.len() - 1 {
                    *bottlenecked_by_srcdst_count += 1;
                } else {
                    *bottlenecked_by_intermediate_count += 1;
                }
            }

            *progress += allocated * step_size;

            if *progress + 1e-9 >= *size {
                finished.push((*job_id, task_id));
            }

            // Snap to the rate actually achieved this step before applying
            // the increase/decrease factor, so congestion always acts on
            // real throughput rather than last step's registration
            // (original_source/src/flow.cc:make_progress/update_rate).
            *current_rate = allocated;
            if any_congested {
                *current_rate *= cfg.rate_decrease_factor;
            } else {
                *current_rate *= cfg.rate_increase.powf(step_size);
            }
            *current_rate = current_rate.clamp(cfg.min_rate, *min_bottleneck_rate);
            if *protocol_defined_max_rate > 0.0 {
                *current_rate = current_rate.min(*protocol_defined_max_rate);
            }
        }
    }
    finished
}

/// Appends this step's queue depth to every machine's history. A no-op per
/// machine when history recording wasn't enabled at topology construction.
pub fn record_machine_history(topology: &mut Topology) {
    for machine in topology.machines_mut() {
        machine.record_queue_len();
    }
}

/// Advances every compute task that is currently the head of its machine's
/// queue, returning the ids of tasks that just finished.
pub fn advance_compute(
    topology: &mut Topology,
    protocols: &mut std::collections::HashMap<JobId, Protocol>,
    step_size: f64,
) -> Vec<(JobId, TaskId)> {
    let mut finished = Vec::new();
    for machine in topology.machines_mut() {
        let Some(head) = machine.head() else { continue };
        // head is a (job_id << 32 | task_id) packed key; see `enqueue_key`.
        let (job_id, task_id) = unpack_queue_key(head);
        let Some(protocol) = protocols.get_mut(&job_id) else { continue };
        let Some(task) = protocol.task_mut(task_id) else { continue };
        if task.status != psim_protocol::TaskStatus::Running {
            continue;
        }
        let TaskKind::Compute { size, progress, .. } = &mut task.kind else {
            continue;
        };
        *progress += (*size - *progress).min(step_size);
        if *progress + 1e-9 >= *size {
            machine.pop_head();
            finished.push((job_id, task_id));
        }
    }
    finished
}

/// Packs a `(job_id, task_id)` pair into the single `u64` a machine's queue
/// stores, since `Machine`'s queue (in `psim-topology`) is type-agnostic.
pub fn pack_queue_key(job_id: JobId, task_id: TaskId) -> u64 {
    (job_id << 32) | (task_id & 0xffff_ffff)
}

fn unpack_queue_key(key: u64) -> (JobId, TaskId) {
    (key >> 32, key & 0xffff_ffff)
}

/// Resolves a flow's path and initial rate/priority state when it starts
/// running. Returns the chosen links so the caller can record a routing
/// decision.
pub fn initiate_flow(
    topology: &mut Topology,
    selector: &mut dyn psim_topology::UpperItemSelector,
    job_id: JobId,
    task_id: TaskId,
    timer: f64,
    cfg: &SimConfig,
    task: &mut psim_protocol::Task,
) -> Vec<BottleneckId> {
    let TaskKind::Flow {
        src,
        dst,
        current_rate,
        registered_rate,
        min_bottleneck_rate,
        selected_priority,
        path,
        ..
    } = &mut task.kind
    else {
        return Vec::new();
    };

    let path_ids = topology.set_path(
        to_machine(*src),
        to_machine(*dst),
        pack_queue_key(job_id, task_id),
        timer,
        cfg.load_metric,
        selector,
    );
    *min_bottleneck_rate = path_ids
        .iter()
        .filter_map(|id| topology.bottleneck(*id))
        .map(|b| b.capacity)
        .fold(f64::INFINITY, f64::min);
    if !path_ids.is_empty() && min_bottleneck_rate.is_infinite() {
        *min_bottleneck_rate = cfg.link_bandwidth;
    }
    *selected_priority = job_id;
    *registered_rate = 0.0;
    *current_rate = cfg.initial_rate.min(*min_bottleneck_rate).max(cfg.min_rate);
    *path = path_ids.iter().map(|id| (*id).into()).collect();
    path_ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_key_round_trips() {
        let key = pack_queue_key(7, 42);
        assert_eq!(unpack_queue_key(key), (7, 42));
    }
}
