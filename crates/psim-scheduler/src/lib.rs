//! The offline scheduler (Component H): given per-job profiled link-load
//! time series from a prior simulation run, picks per-iteration start-time
//! offsets and throttle levels (timing), then assigns each flow to spine
//! switches via bipartite edge coloring (routing), iterating the two
//! passes until no bad ranges remain or a fixing-round budget is spent.
//!
//! Ported from `original_source/src/scheduler/scheduler.cc`'s top-level
//! `FaridV6Scheduling` / `ParseInput` / `BuildOutput` / `RunScheduler`.

pub mod coloring;
pub mod io;
pub mod job;
pub mod routing;
pub mod signal;
pub mod timing;

use std::collections::HashSet;

use thiserror::Error;

use io::{AddToContext, JobId, SchedulerInput, SchedulerOptions, SchedulerOutput};
use job::{build_link_loads, Job, LinkLoads};
use routing::build_all_flows;
use timing::{Solution, TimingSolver};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job {0} appears more than once in the scheduler input")]
    DuplicateJob(JobId),
}

fn bad_range_sum(ranges: &[(i64, i64)]) -> f64 {
    ranges.iter().map(|(s, e)| (e - s + 1) as f64).sum()
}

fn summarize_bad_ranges(mut ranges: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
    if ranges.is_empty() {
        return ranges;
    }
    ranges.sort();
    let mut summarized = Vec::new();
    let mut current = ranges[0];
    for &(start, end) in &ranges[1..] {
        if start <= current.1 + 1 {
            current.1 = current.1.max(end);
        } else {
            summarized.push(current);
            current = (start, end);
        }
    }
    summarized.push(current);
    summarized
}

/// Folds the single earliest-starting new bad range into the accumulated
/// set, dropping any previously accumulated range it now supersedes
/// (`AppendToBadRanges`).
fn append_to_bad_ranges(accumulated: &mut Vec<(i64, i64)>, mut new_ranges: Vec<(i64, i64)>) {
    if new_ranges.is_empty() {
        return;
    }
    new_ranges.sort();
    let to_add = new_ranges[0];
    accumulated.retain(|(start, _)| *start < to_add.1);
    accumulated.push(to_add);
}

/// One timing + routing pass (`RouteFlows` after `LegoV2Solver::Solve`).
fn solve_and_route(
    jobs: &[Job],
    link_loads: &LinkLoads,
    options: &SchedulerOptions,
    candidate_throttles: &[f64],
    context_inflate: f64,
    bad_ranges: &[(i64, i64)],
    base_inflate: f64,
    seed: u64,
) -> (Solution, routing::RoutingOutcome) {
    let solver = TimingSolver::new(jobs, link_loads, options.link_capacity(), candidate_throttles.to_vec(), context_inflate);
    let solution = solver.solve(bad_ranges, base_inflate);

    let flows = build_all_flows(jobs, &solution);
    let routing = routing::route_flows(flows, options.link_bandwidth, options.subflows, options.ft_core_count, seed);
    (solution, routing)
}

fn record_ratios(add_to_context: &mut AddToContext, remaining: &[(i64, i64)], fixed: &[(i64, i64)], sim_length: i64) {
    let remaining_ratio = bad_range_sum(remaining) / sim_length as f64;
    let fixed_ratio = bad_range_sum(fixed) / sim_length as f64;
    add_to_context.fixed_bad_range_ratio = fixed_ratio;
    add_to_context.fixed_bad_range_ratios.push(fixed_ratio);
    add_to_context.remaining_bad_range_ratio = remaining_ratio;
    add_to_context.remaining_bad_range_ratios.push(remaining_ratio);
}

fn build_output(solution: &Solution, jobs: &[Job], routing: routing::RoutingOutcome, add_to_context: AddToContext) -> SchedulerOutput {
    let mut add_to_context = add_to_context;
    add_to_context.job_costs = jobs.iter().map(|j| solution.job_cost(j)).collect();
    SchedulerOutput {
        job_timings: solution.to_job_timings(jobs),
        lb_decisions: routing.decisions,
        add_to_context,
    }
}

/// Top-level entry point: runs the LegoV2 timing solver and graph-coloring
/// routing pass, repeating fixing rounds as configured
/// (`FaridV6Scheduling`).
pub fn run_scheduler(input: SchedulerInput) -> Result<SchedulerOutput, SchedulerError> {
    let mut seen = HashSet::new();
    for job in &input.jobs {
        if !seen.insert(job.job_id) {
            return Err(SchedulerError::DuplicateJob(job.job_id));
        }
    }

    let jobs: Vec<Job> = input
        .jobs
        .iter()
        .map(|spec| {
            let profiles = input.profiles.get(&spec.job_id).cloned().unwrap_or_default();
            Job::from_spec(spec, profiles)
        })
        .collect();

    if jobs.is_empty() {
        return Ok(SchedulerOutput::default());
    }

    let link_loads = build_link_loads(&jobs, input.options.link_bandwidth);

    let candidate_throttles: Vec<f64> = if input.run_context.throttle_search {
        input.run_context.profiled_throttle_factors.clone().unwrap_or_else(|| vec![1.0])
    } else {
        vec![1.0]
    };

    let context_inflate = input.run_context.inflate.unwrap_or(1.0);
    let max_attempts = input.run_context.farid_rounds;
    let sim_length = input.run_context.sim_length.max(1);
    let is_inflation_enabled = input.run_context.use_inflation;
    let seed = input.placement_seed;

    let mut add_to_context = AddToContext::default();

    let (mut solution, mut routing) =
        solve_and_route(&jobs, &link_loads, &input.options, &candidate_throttles, context_inflate, &[], 1.0, seed);
    let mut remaining_bad_ranges = summarize_bad_ranges(routing.bad_ranges.clone());
    record_ratios(&mut add_to_context, &remaining_bad_ranges, &[], sim_length);

    if remaining_bad_ranges.is_empty() || max_attempts == 0 {
        return Ok(build_output(&solution, &jobs, routing, add_to_context));
    }

    let mut current_round = 1u32;
    let mut fixed_bad_ranges: Vec<(i64, i64)> = Vec::new();
    let mut inflate_factor = 1.0f64;

    while !remaining_bad_ranges.is_empty() && current_round <= max_attempts {
        if is_inflation_enabled && add_to_context.remaining_bad_range_ratio > input.run_context.fallback_threshold {
            inflate_factor += 0.05;
            fixed_bad_ranges.clear();
        } else {
            append_to_bad_ranges(&mut fixed_bad_ranges, remaining_bad_ranges.clone());
        }

        let (next_solution, next_routing) = solve_and_route(
            &jobs,
            &link_loads,
            &input.options,
            &candidate_throttles,
            context_inflate,
            &fixed_bad_ranges,
            inflate_factor,
            seed,
        );
        solution = next_solution;
        remaining_bad_ranges = summarize_bad_ranges(next_routing.bad_ranges.clone());
        routing = next_routing;

        record_ratios(&mut add_to_context, &remaining_bad_ranges, &fixed_bad_ranges, sim_length);
        current_round += 1;
        add_to_context.fixing_rounds += 1;
    }

    if remaining_bad_ranges.is_empty() || !is_inflation_enabled {
        return Ok(build_output(&solution, &jobs, routing, add_to_context));
    }

    // Every round still reports bad ranges and inflation is enabled: fall
    // back to the zero-timing solution rather than commit to a schedule
    // that never converged.
    let solver = TimingSolver::new(&jobs, &link_loads, input.options.link_capacity(), candidate_throttles.clone(), context_inflate);
    let zero_solution = solver.zero_solution();
    let flows = build_all_flows(&jobs, &zero_solution);
    let zero_routing = routing::route_flows(flows, input.options.link_bandwidth, input.options.subflows, input.options.ft_core_count, seed);

    add_to_context.fixing_rounds = max_attempts + 1;
    record_ratios(&mut add_to_context, &zero_routing.bad_ranges, &[], sim_length);

    Ok(build_output(&zero_solution, &jobs, zero_routing, add_to_context))
}
