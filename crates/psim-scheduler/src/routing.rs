//! Bipartite-coloring flow routing (graph-coloring-v7): groups flow
//! instances into traffic patterns, merges overlapping patterns that
//! share a rack, edge-colors each merged region's bipartite multigraph,
//! and assigns spines and per-spine ratios from the resulting coloring.
//!
//! Ported from `original_source/src/scheduler/scheduler.cc`'s
//! `BuildAllFlows`, `RouteFlowsGraphColoringV7`, and
//! `MergeOverlappingRangesV7`. The original's `RouteFlowsGraphColoringV3`
//! is not ported -- every caller in the original already prefers V7 -- and
//! neither is V7's edge-count fast-path bad-range pre-check: it is a pure
//! optimization, and the per-merged-region check below still finds every
//! bad range, just without the early exit.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

use crate::coloring::{color_bipartite_multigraph, index_racks, DisjointSet, Edge};
use crate::io::{FlowId, JobId, LbDecision};
use crate::job::Job;
use crate::signal::ThrottleKey;
use crate::timing::Solution;

#[derive(Debug, Clone)]
pub struct FlowInstance {
    pub job_id: JobId,
    pub flow_id: FlowId,
    pub iteration: u32,
    pub src_rack: i64,
    pub dst_rack: i64,
    pub eff_start_time: i64,
    pub eff_end_time: i64,
    pub throttle_rate: f64,
    pub max_load: f64,
    pub needed_subflows: usize,
    traffic_pattern_hash: String,
    traffic_member_id: String,
}

/// Instantiates one `FlowInstance` per (flow, iteration), with effective
/// start/end times shifted by the timing solution's committed deltas
/// (`BuildAllFlows`).
pub fn build_all_flows(jobs: &[Job], solution: &Solution) -> Vec<FlowInstance> {
    let mut all_flows = Vec::new();
    for job in jobs {
        let deltas = solution.deltas(job.job_id);
        let throttles = solution.throttle_rates(job.job_id);
        let mut shift = 0i64;
        for iter in 0..job.iter_count as usize {
            shift += deltas.get(iter).copied().unwrap_or(0);
            let throttle = throttles.get(iter).copied().unwrap_or(1.0);
            let throttle_key = ThrottleKey::from_rate(throttle);
            let Some(profile) = job.profile(throttle_key) else {
                shift += job.period_for(throttle_key);
                continue;
            };

            for flow in &profile.flows {
                let max_load = flow.progress_history.iter().cloned().fold(0.0, f64::max);
                all_flows.push(FlowInstance {
                    job_id: job.job_id,
                    flow_id: flow.flow_id,
                    iteration: iter as u32,
                    src_rack: flow.srcrack,
                    dst_rack: flow.dstrack,
                    eff_start_time: flow.start_time + shift,
                    eff_end_time: flow.end_time + shift,
                    throttle_rate: throttle,
                    max_load,
                    needed_subflows: 1,
                    traffic_pattern_hash: String::new(),
                    traffic_member_id: String::new(),
                });
            }
            shift += profile.period;
        }
    }
    all_flows
}

fn pattern_hash16(pattern: &str) -> String {
    let digest = Sha256::digest(pattern.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect::<String>()[..16].to_string()
}

pub struct RoutingOutcome {
    pub decisions: Vec<LbDecision>,
    pub bad_ranges: Vec<(i64, i64)>,
}

/// The graph-coloring-v7 routing pass: colors each merged traffic region's
/// bipartite multigraph and turns the coloring into spine assignments.
pub fn route_flows(
    mut flows: Vec<FlowInstance>,
    link_bandwidth: f64,
    max_subflow_count: u32,
    num_spines: u32,
    seed: u64,
) -> RoutingOutcome {
    if flows.is_empty() {
        return RoutingOutcome { decisions: Vec::new(), bad_ranges: Vec::new() };
    }

    flows.sort_by_key(|f| f.eff_start_time);

    let subflow_capacity = if max_subflow_count > 0 { link_bandwidth / max_subflow_count as f64 } else { 0.0 };
    for flow in &mut flows {
        let needed = if subflow_capacity > 0.0 { (flow.max_load / subflow_capacity).ceil() as i64 } else { 1 };
        flow.needed_subflows = needed.max(1) as usize;
    }

    let mut by_traffic_id: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, flow) in flows.iter().enumerate() {
        let traffic_id = format!("{}_{}_{}", flow.eff_start_time, flow.job_id, flow.throttle_rate);
        by_traffic_id.entry(traffic_id).or_default().push(idx);
    }

    let mut hash_to_traffic_id: HashMap<String, String> = HashMap::new();
    let mut hash_to_time_range: HashMap<String, (i64, i64)> = HashMap::new();
    let mut pattern_to_src: HashMap<String, HashSet<i64>> = HashMap::new();
    let mut pattern_to_dst: HashMap<String, HashSet<i64>> = HashMap::new();
    let mut pattern_hash_of: HashMap<usize, String> = HashMap::new();

    for (traffic_id, idxs) in &by_traffic_id {
        let mut members = idxs.clone();
        members.sort_by_key(|&i| member_id(&flows[i]));
        let pattern = members.iter().map(|&i| member_id(&flows[i])).collect::<Vec<_>>().join("#");
        let hash = pattern_hash16(&pattern);

        let mut min_start = i64::MAX;
        let mut max_end = i64::MIN;
        for &i in &members {
            pattern_hash_of.insert(i, hash.clone());
            min_start = min_start.min(flows[i].eff_start_time);
            max_end = max_end.max(flows[i].eff_end_time);
            pattern_to_src.entry(hash.clone()).or_default().insert(flows[i].src_rack);
            pattern_to_dst.entry(hash.clone()).or_default().insert(flows[i].dst_rack);
        }
        hash_to_traffic_id.insert(hash.clone(), traffic_id.clone());
        hash_to_time_range.insert(hash, (min_start, max_end));
    }
    for (i, flow) in flows.iter_mut().enumerate() {
        if let Some(hash) = pattern_hash_of.get(&i) {
            flow.traffic_pattern_hash = hash.clone();
            flow.traffic_member_id = member_id(flow);
        }
    }

    let merged = merge_overlapping_ranges(&hash_to_time_range, &pattern_to_src, &pattern_to_dst);

    let mut bad_ranges = Vec::new();
    let mut group_colorings: Vec<(HashSet<String>, HashMap<String, Vec<usize>>, Vec<(i64, i64)>)> = Vec::new();

    for (keys, ranges) in merged {
        let mut current: Vec<usize> = Vec::new();
        for hash in &keys {
            if let Some(traffic_id) = hash_to_traffic_id.get(hash) {
                if let Some(idxs) = by_traffic_id.get(traffic_id) {
                    current.extend(idxs.iter().copied());
                }
            }
        }

        let racks: HashSet<i64> = current.iter().flat_map(|&i| [flows[i].src_rack, flows[i].dst_rack]).collect();
        let (rack_index, _) = index_racks(racks.into_iter());

        let mut edges = Vec::new();
        for &i in &current {
            let left = rack_index[&flows[i].src_rack];
            let right = rack_index[&flows[i].dst_rack];
            for _ in 0..flows[i].needed_subflows {
                edges.push(Edge { left, right });
            }
        }

        let max_colors = (num_spines.max(1) as usize) * (max_subflow_count.max(1) as usize);
        let colors = match color_bipartite_multigraph(&edges, rack_index.len(), rack_index.len(), max_colors, seed) {
            Ok(c) => c,
            Err(reason) => {
                tracing::warn!(reason = %reason, "routing region could not be colored within the available spines");
                bad_ranges.extend(ranges.iter().copied());
                continue;
            }
        };

        let mut color_id_to_colors: HashMap<String, Vec<usize>> = HashMap::new();
        let mut edge_cursor = 0usize;
        for &i in &current {
            let color_id = format!("{}_{}", flows[i].traffic_pattern_hash, flows[i].traffic_member_id);
            for _ in 0..flows[i].needed_subflows {
                color_id_to_colors.entry(color_id.clone()).or_default().push(colors[edge_cursor]);
                edge_cursor += 1;
            }
        }

        let colors_used: HashSet<usize> = color_id_to_colors.values().flatten().copied().collect();
        let used_spines = colors_used.len() as f64 / max_subflow_count.max(1) as f64;
        if used_spines > num_spines as f64 {
            bad_ranges.extend(ranges.iter().copied());
        }

        group_colorings.push((keys.into_iter().collect(), color_id_to_colors, ranges));
    }
    bad_ranges.sort();

    let mut decisions = Vec::new();
    for flow in &flows {
        let Some((_, coloring, _)) = group_colorings.iter().find(|(keys, _, ranges)| {
            keys.contains(&flow.traffic_pattern_hash)
                && ranges.iter().any(|(s, e)| flow.eff_start_time >= *s && flow.eff_start_time <= *e)
        }) else {
            continue;
        };
        let color_id = format!("{}_{}", flow.traffic_pattern_hash, flow.traffic_member_id);
        let Some(colors) = coloring.get(&color_id) else { continue };
        if colors.is_empty() {
            continue;
        }

        let mut spine_counts: HashMap<u32, u32> = HashMap::new();
        for subflow in 0..flow.needed_subflows {
            let color = colors[subflow % colors.len()];
            let mut spine = color;
            if max_subflow_count > 0 {
                spine /= max_subflow_count as usize;
            }
            if num_spines > 0 {
                spine %= num_spines as usize;
            }
            *spine_counts.entry(spine as u32).or_insert(0) += 1;
        }

        let spine_rates: Vec<(u32, f64)> = spine_counts
            .into_iter()
            .map(|(spine, count)| (spine, count as f64 / flow.needed_subflows.max(1) as f64))
            .collect();

        decisions.push(LbDecision {
            job_id: flow.job_id,
            flow_id: flow.flow_id,
            iteration: flow.iteration,
            spine_count: spine_rates.len(),
            spine_rates,
        });
    }

    RoutingOutcome { decisions, bad_ranges }
}

fn member_id(flow: &FlowInstance) -> String {
    format!("{}_{}_{}_{}", flow.job_id, flow.src_rack, flow.dst_rack, flow.needed_subflows)
}

fn racks_overlap(src_a: &HashSet<i64>, dst_a: &HashSet<i64>, src_b: &HashSet<i64>, dst_b: &HashSet<i64>) -> bool {
    src_a.iter().any(|r| src_b.contains(r)) || dst_a.iter().any(|r| dst_b.contains(r))
}

fn merge_ranges(mut ranges: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
    ranges.sort();
    let mut merged: Vec<(i64, i64)> = Vec::new();
    for r in ranges {
        if let Some(last) = merged.last_mut() {
            if r.0 <= last.1 + 1 {
                last.1 = last.1.max(r.1);
                continue;
            }
        }
        merged.push(r);
    }
    merged
}

/// Union-finds patterns whose time ranges overlap and which share a rack,
/// producing one merged time-range list per resulting component, keyed by
/// its sorted set of pattern hashes (`MergeOverlappingRangesV7`).
fn merge_overlapping_ranges(
    ranges_dict: &HashMap<String, (i64, i64)>,
    pattern_to_src: &HashMap<String, HashSet<i64>>,
    pattern_to_dst: &HashMap<String, HashSet<i64>>,
) -> Vec<(Vec<String>, Vec<(i64, i64)>)> {
    struct Interval {
        start: i64,
        end: i64,
        key: String,
        src: HashSet<i64>,
        dst: HashSet<i64>,
    }

    let mut intervals: Vec<Interval> = ranges_dict
        .iter()
        .map(|(key, (start, end))| Interval {
            start: *start,
            end: *end,
            key: key.clone(),
            src: pattern_to_src.get(key).cloned().unwrap_or_default(),
            dst: pattern_to_dst.get(key).cloned().unwrap_or_default(),
        })
        .collect();
    intervals.sort_by_key(|iv| (iv.start, iv.end));

    let n = intervals.len();
    let mut dsu = DisjointSet::new(n);
    let mut active: Vec<usize> = Vec::new();
    for idx in 0..n {
        let mut new_active = Vec::new();
        for &a in &active {
            if intervals[a].end >= intervals[idx].start {
                if racks_overlap(&intervals[a].src, &intervals[a].dst, &intervals[idx].src, &intervals[idx].dst) {
                    dsu.union(idx, a);
                }
                new_active.push(a);
            }
        }
        new_active.push(idx);
        active = new_active;
    }

    let mut component_ranges: HashMap<usize, Vec<(i64, i64)>> = HashMap::new();
    let mut component_keys: HashMap<usize, HashSet<String>> = HashMap::new();
    for (idx, interval) in intervals.iter().enumerate() {
        let root = dsu.find(idx);
        component_ranges.entry(root).or_default().push((interval.start, interval.end));
        component_keys.entry(root).or_default().insert(interval.key.clone());
    }

    let mut merged: HashMap<Vec<String>, Vec<(i64, i64)>> = HashMap::new();
    for (root, ranges) in component_ranges {
        let summarized = merge_ranges(ranges);
        let mut keys: Vec<String> = component_keys[&root].iter().cloned().collect();
        keys.sort();
        merged.entry(keys).or_default().extend(summarized);
    }

    merged.into_iter().map(|(keys, ranges)| (keys, merge_ranges(ranges))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FlowProfile, JobSpec, ProfileFile};
    use crate::job::build_link_loads;
    use crate::timing::TimingSolver;
    use std::collections::HashMap as Map;

    fn job_with_flow(job_id: JobId, src: i64, dst: i64, flow_id: FlowId, history: Vec<f64>) -> Job {
        let spec = JobSpec { job_id, machines: vec![], layer_count: 1, iter_count: 1, comm_size: 10.0, comp_size: 0.0 };
        let mut by_throttle = Map::new();
        by_throttle.insert(
            "1".to_string(),
            ProfileFile {
                period: 20,
                flows: vec![FlowProfile {
                    flow_id,
                    job_id,
                    iteration: 0,
                    subflow: 0,
                    start_time: 0,
                    end_time: history.len() as i64,
                    srcrack: src,
                    dstrack: dst,
                    fct: 0.0,
                    core: 0,
                    label: String::new(),
                    flow_size: 0.0,
                    progress_history: history,
                }],
            },
        );
        Job::from_spec(&spec, by_throttle)
    }

    #[test]
    fn two_flows_between_same_racks_get_distinct_spines() {
        let job_a = job_with_flow(1, 0, 1, 1, vec![40.0; 5]);
        let job_b = job_with_flow(2, 0, 1, 2, vec![40.0; 5]);
        let jobs = vec![job_a, job_b];
        let link_loads = build_link_loads(&jobs, 100.0);
        let solver = TimingSolver::new(&jobs, &link_loads, 100.0, vec![1.0], 1.0);
        let solution = solver.zero_solution();

        let flows = build_all_flows(&jobs, &solution);
        assert_eq!(flows.len(), 2);

        let outcome = route_flows(flows, 100.0, 1, 2, 7);
        assert_eq!(outcome.decisions.len(), 2);
        assert!(outcome.bad_ranges.is_empty());
        let spines: HashSet<u32> = outcome
            .decisions
            .iter()
            .flat_map(|d| d.spine_rates.iter().map(|(s, _)| *s))
            .collect();
        // Two colliding same-rack-pair flows need two distinct spines.
        assert_eq!(spines.len(), 2);
    }

    #[test]
    fn more_flows_than_spines_produces_a_bad_range() {
        let jobs: Vec<Job> = (1..=3).map(|id| job_with_flow(id, 0, 1, id, vec![40.0; 5])).collect();
        let link_loads = build_link_loads(&jobs, 100.0);
        let solver = TimingSolver::new(&jobs, &link_loads, 100.0, vec![1.0], 1.0);
        let solution = solver.zero_solution();
        let flows = build_all_flows(&jobs, &solution);
        let outcome = route_flows(flows, 100.0, 1, 2, 7);
        assert!(!outcome.bad_ranges.is_empty());
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let outcome = route_flows(Vec::new(), 100.0, 1, 2, 1);
        assert!(outcome.decisions.is_empty());
        assert!(outcome.bad_ranges.is_empty());
    }
}
