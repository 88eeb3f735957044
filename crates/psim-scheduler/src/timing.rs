//! Per-iteration start-time offsets (deltas) and throttle levels, chosen to
//! keep every link's remaining-capacity signal non-negative over each
//! job's active window.
//!
//! Ported from `original_source/src/scheduler/scheduler.cc`'s `Solution`,
//! `FindEarliestAvailableTimeAllLinks`, and `LegoV2Solver::MakeSolutionImpl`
//! -- the "LegoV2" timing scheme. The other named scheme (`faridv6`) in the
//! original selects scoring mode, not a different greedy structure; this
//! crate always runs the LegoV2 greedy loop and treats
//! `run_context.timing-scheme` as informational.

use std::collections::{HashMap, HashSet};

use crate::io::{JobId, JobTiming};
use crate::job::{active_range, job_base_signal, job_max_loads, Job, LinkLoads};
use crate::signal::{RackLink, ThrottleKey};

#[derive(Debug, Clone)]
pub struct Solution {
    deltas: HashMap<JobId, Vec<i64>>,
    throttle_rates: HashMap<JobId, Vec<f64>>,
}

impl Solution {
    pub fn new(jobs: &[Job]) -> Self {
        let mut deltas = HashMap::new();
        let mut throttle_rates = HashMap::new();
        for job in jobs {
            deltas.insert(job.job_id, vec![0i64; job.iter_count as usize]);
            throttle_rates.insert(job.job_id, vec![1.0f64; job.iter_count as usize]);
        }
        Solution { deltas, throttle_rates }
    }

    pub fn deltas(&self, job_id: JobId) -> &[i64] {
        &self.deltas[&job_id]
    }

    pub fn throttle_rates(&self, job_id: JobId) -> &[f64] {
        &self.throttle_rates[&job_id]
    }

    pub fn job_iter_start_time(&self, job: &Job, iter: usize) -> i64 {
        let deltas = &self.deltas[&job.job_id];
        let throttles = &self.throttle_rates[&job.job_id];
        let mut start = 0i64;
        for i in 0..iter {
            let period = job.period_for(ThrottleKey::from_rate(throttles[i]));
            start += deltas[i] + period;
        }
        start + deltas[iter]
    }

    pub fn job_iter_active_time(
        &self,
        job: &Job,
        iter: usize,
        link_loads: &LinkLoads,
        throttle_rate: f64,
        inflate: f64,
    ) -> (i64, i64) {
        let iter_start = self.job_iter_start_time(job, iter);
        let base = job_base_signal(link_loads, job.job_id, ThrottleKey::from_rate(throttle_rate));
        let (a_start, a_end) = active_range(&base, inflate);
        (iter_start + a_start, iter_start + a_end)
    }

    pub fn job_cost(&self, job: &Job) -> f64 {
        let deltas = &self.deltas[&job.job_id];
        let throttles = &self.throttle_rates[&job.job_id];
        let mut cost = 0.0;
        for i in 0..deltas.len() {
            let period = job.period_for(ThrottleKey::from_rate(throttles[i]));
            let throttle_cost = (period - job.base_period) as f64;
            cost += deltas[i] as f64 + throttle_cost;
        }
        cost
    }

    pub fn average_job_cost(&self, jobs: &[Job]) -> f64 {
        if jobs.is_empty() {
            return 0.0;
        }
        jobs.iter().map(|j| self.job_cost(j)).sum::<f64>() / jobs.len() as f64
    }

    pub fn to_job_timings(&self, jobs: &[Job]) -> Vec<JobTiming> {
        jobs.iter()
            .map(|j| JobTiming {
                job_id: j.job_id,
                deltas: self.deltas[&j.job_id].clone(),
                throttle_rates: self.throttle_rates[&j.job_id].clone(),
            })
            .collect()
    }
}

/// Scans `rem[link]` over `[start, end)` (shifted by a growing `delay`)
/// until every link the job touches has remaining capacity at or above
/// `max_loads[link] * multiplier` throughout, returning that delay.
pub fn find_earliest_available_time_all_links(
    start: i64,
    end: i64,
    rem: &HashMap<RackLink, Vec<f64>>,
    max_loads: &HashMap<RackLink, f64>,
    multiplier: f64,
) -> i64 {
    let window = |delay: i64, rem: &HashMap<RackLink, Vec<f64>>| -> i64 {
        let mut count = 0i64;
        for (link, limit) in max_loads {
            let Some(signal) = rem.get(link) else { continue };
            let limit = limit * multiplier;
            for t in (start + delay)..(end + delay) {
                if t >= 0 && (t as usize) < signal.len() && signal[t as usize] < limit {
                    count += 1;
                }
            }
        }
        count
    };

    let mut delay = 0i64;
    // Bound the search by the longest rem signal so a pathological input
    // (e.g. a job whose load never fits) terminates instead of looping.
    let horizon = rem.values().map(|v| v.len() as i64).max().unwrap_or(0).max(end) + 1;
    while window(delay, rem) > 0 && delay < horizon {
        delay += 1;
    }
    delay
}

pub struct TimingSolver<'a> {
    pub jobs: &'a [Job],
    pub link_loads: &'a LinkLoads,
    pub capacity: f64,
    pub candidate_throttles: Vec<f64>,
    pub context_inflate: f64,
    pub max_length: i64,
}

impl<'a> TimingSolver<'a> {
    pub fn new(jobs: &'a [Job], link_loads: &'a LinkLoads, capacity: f64, candidate_throttles: Vec<f64>, context_inflate: f64) -> Self {
        let total: i64 = jobs.iter().map(|j| j.base_period * j.iter_count as i64).sum();
        let max_length = (total * 2).max(16);
        TimingSolver {
            jobs,
            link_loads,
            capacity,
            candidate_throttles,
            context_inflate,
            max_length,
        }
    }

    pub fn zero_solution(&self) -> Solution {
        Solution::new(self.jobs)
    }

    fn all_links(&self) -> HashSet<RackLink> {
        let mut links = HashSet::new();
        for job in self.jobs {
            for throttle in &self.candidate_throttles {
                for link in job_max_loads(self.link_loads, job.job_id, ThrottleKey::from_rate(*throttle)).keys() {
                    links.insert(*link);
                }
            }
        }
        links
    }

    /// The LegoV2 greedy pass: repeatedly pick the job with least service
    /// attained, find the cheapest throttle/delay combination that keeps
    /// every link it touches under capacity over its active window, and
    /// commit by deducting its load from the remaining-capacity signals.
    pub fn solve(&self, bad_ranges: &[(i64, i64)], base_inflate: f64) -> Solution {
        let mut sol = Solution::new(self.jobs);
        if self.jobs.is_empty() {
            return sol;
        }

        let max_length = self.max_length;
        let mut rem_map: HashMap<RackLink, Vec<f64>> = self
            .all_links()
            .into_iter()
            .map(|link| (link, vec![self.capacity; max_length as usize]))
            .collect();

        // Artificially scarcer wherever more than one bad range overlaps,
        // so the greedy placement steers iterations away from them.
        let mut presence = vec![0i64; max_length as usize];
        for (start, end) in bad_ranges {
            let s = (*start).clamp(0, max_length - 1) as usize;
            let e = (*end).clamp(0, max_length - 1) as usize;
            for slot in presence.iter_mut().take(e).skip(s) {
                *slot += 1;
            }
        }
        for (t, count) in presence.iter().enumerate() {
            if *count > 1 {
                for signal in rem_map.values_mut() {
                    signal[t] = (signal[t] - (*count as f64 - 1.0)).max(1.0);
                }
            }
        }

        let mut service_attained: HashMap<JobId, i64> = self.jobs.iter().map(|j| (j.job_id, 0)).collect();
        let mut current_iter: HashMap<JobId, u32> = self.jobs.iter().map(|j| (j.job_id, 0)).collect();
        let mut not_done: HashSet<JobId> = self.jobs.iter().map(|j| j.job_id).collect();
        let by_id: HashMap<JobId, &Job> = self.jobs.iter().map(|j| (j.job_id, j)).collect();

        while !not_done.is_empty() {
            let job_id = *not_done
                .iter()
                .min_by_key(|id| service_attained[id])
                .expect("not_done is non-empty");
            let job = by_id[&job_id];
            let iter = current_iter[&job_id] as usize;

            let mut best_finish = f64::INFINITY;
            let mut best_throttle = 1.0f64;
            let mut best_delay = 0i64;
            let mut best_start = 0i64;
            let mut best_end = 0i64;
            let mut best_overload = true;
            let mut best_load_mult = 1.0;

            for &throttle in &self.candidate_throttles {
                let max_loads = job_max_loads(self.link_loads, job_id, ThrottleKey::from_rate(throttle));
                let max_max_load = max_loads.values().cloned().fold(0.0, f64::max);

                let mut load_mult = 1.0;
                let mut inflate = base_inflate * self.context_inflate;
                let mut is_overload = false;
                if max_max_load > self.capacity {
                    is_overload = true;
                    if self.capacity > 0.0 {
                        inflate *= (max_max_load / self.capacity).ceil();
                        load_mult = self.capacity / max_max_load;
                    }
                }

                let (mut active_start, mut active_end) = sol.job_iter_active_time(job, iter, self.link_loads, throttle, inflate);
                let overlaps = overlap_count(active_start, active_end, bad_ranges);
                if overlaps > 0 {
                    let factor = 1.0 + overlaps as f64 * 0.01 * (5.0 + job_id as f64);
                    inflate *= factor;
                    let t = sol.job_iter_active_time(job, iter, self.link_loads, throttle, inflate);
                    active_start = t.0;
                    active_end = t.1;
                }

                let delay = find_earliest_available_time_all_links(active_start, active_end, &rem_map, &max_loads, load_mult);
                let finish_time = (active_end + delay) as f64;

                if finish_time < best_finish || (best_overload && !is_overload) {
                    best_finish = finish_time;
                    best_throttle = throttle;
                    best_delay = delay;
                    best_start = active_start;
                    best_end = active_end;
                    best_overload = is_overload;
                    best_load_mult = load_mult;
                }
            }

            let max_loads = job_max_loads(self.link_loads, job_id, ThrottleKey::from_rate(best_throttle));
            for (link, signal) in rem_map.iter_mut() {
                let load = max_loads.get(link).copied().unwrap_or(0.0);
                let from = (best_start + best_delay).max(0) as usize;
                let to = ((best_end + best_delay).max(0) as usize).min(signal.len());
                for slot in signal.iter_mut().take(to).skip(from) {
                    *slot -= load * best_load_mult;
                }
            }

            sol.deltas.get_mut(&job_id).unwrap()[iter] = best_delay;
            sol.throttle_rates.get_mut(&job_id).unwrap()[iter] = best_throttle;

            *current_iter.get_mut(&job_id).unwrap() += 1;
            *service_attained.get_mut(&job_id).unwrap() += job.base_period;
            if current_iter[&job_id] >= job.iter_count {
                not_done.remove(&job_id);
            }
        }

        sol
    }
}

fn overlap_count(start: i64, end: i64, ranges: &[(i64, i64)]) -> i64 {
    ranges.iter().filter(|(s, e)| start <= *e && *s <= end).count() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FlowProfile, JobSpec, ProfileFile};
    use crate::job::build_link_loads;

    fn job_with_flow(job_id: JobId, period: i64, rack: i64, history: Vec<f64>) -> Job {
        let spec = JobSpec {
            job_id,
            machines: vec![],
            layer_count: 1,
            iter_count: 2,
            comm_size: 10.0,
            comp_size: 0.0,
        };
        let mut by_throttle = HashMap::new();
        by_throttle.insert(
            "1".to_string(),
            ProfileFile {
                period,
                flows: vec![FlowProfile {
                    flow_id: job_id,
                    job_id,
                    iteration: 0,
                    subflow: 0,
                    start_time: 0,
                    end_time: history.len() as i64,
                    srcrack: rack,
                    dstrack: rack + 1,
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
    fn two_colliding_jobs_get_separated_by_a_delta() {
        let job_a = job_with_flow(1, 10, 0, vec![80.0; 5]);
        let job_b = job_with_flow(2, 10, 0, vec![80.0; 5]);
        let jobs = vec![job_a, job_b];
        let link_loads = build_link_loads(&jobs, 100.0);
        let solver = TimingSolver::new(&jobs, &link_loads, 100.0, vec![1.0], 1.0);
        let sol = solver.solve(&[], 1.0);
        let deltas_a = sol.deltas(1);
        let deltas_b = sol.deltas(2);
        // At least one of the two jobs must shift its first iteration so
        // the two don't fully overlap on the shared rack-0 uplink.
        assert!(deltas_a[0] != 0 || deltas_b[0] != 0);
    }

    #[test]
    fn zero_solution_has_no_deltas() {
        let job_a = job_with_flow(1, 10, 0, vec![10.0; 5]);
        let jobs = vec![job_a];
        let link_loads = build_link_loads(&jobs, 100.0);
        let solver = TimingSolver::new(&jobs, &link_loads, 100.0, vec![1.0], 1.0);
        let sol = solver.zero_solution();
        assert_eq!(sol.deltas(1), &[0, 0]);
        assert_eq!(sol.throttle_rates(1), &[1.0, 1.0]);
    }
}
