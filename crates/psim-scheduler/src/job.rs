//! A scheduled job's profile data: the per-(link, throttle) load signal
//! built from its profile flows, and the job-level base signal/active range
//! derived from summing across every link the job touches.
//!
//! Grounded in `original_source/src/scheduler/scheduler.cc`'s `Job`,
//! `LinkJobLoad`, and the free functions `GetLinkLoads` /
//! `Job::GetActiveRange`. The original's per-throttle `period` map (read
//! from the job's input JSON) is derived here from the profile file's own
//! `period` field instead of a separate map, since a `JobSpec` carries no
//! `period` field of its own -- a profile's `period` is the authoritative
//! per-throttle iteration length.

use std::collections::HashMap;

use crate::io::{JobId, JobSpec, ProfileFile};
use crate::signal::{add_into, first_nonzero_index, last_nonzero_index, Direction, RackLink, ThrottleKey};

#[derive(Debug, Clone, Default)]
pub struct LinkProfile {
    pub signal: Vec<f64>,
    pub period: i64,
    pub max_load: f64,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: JobId,
    pub iter_count: u32,
    pub base_period: i64,
    pub has_profiles: bool,
    profiles: HashMap<ThrottleKey, ProfileFile>,
}

impl Job {
    pub fn from_spec(spec: &JobSpec, profiles_by_throttle: HashMap<String, ProfileFile>) -> Self {
        let mut profiles = HashMap::new();
        for (raw_key, profile) in profiles_by_throttle {
            if let Ok(rate) = raw_key.parse::<f64>() {
                profiles.insert(ThrottleKey::from_rate(rate), profile);
            }
        }
        let has_profiles = !profiles.is_empty();
        let base_period = profiles
            .get(&ThrottleKey::from_rate(1.0))
            .or_else(|| profiles.values().next())
            .map(|p| p.period)
            .unwrap_or_else(|| {
                ((spec.layer_count.max(1) as f64) * (spec.comm_size + spec.comp_size)).round() as i64
            })
            .max(1);
        Job {
            job_id: spec.job_id,
            iter_count: spec.iter_count.max(1),
            base_period,
            has_profiles,
            profiles,
        }
    }

    pub fn profile(&self, throttle: ThrottleKey) -> Option<&ProfileFile> {
        self.profiles.get(&throttle)
    }

    pub fn throttles(&self) -> impl Iterator<Item = ThrottleKey> + '_ {
        self.profiles.keys().copied()
    }

    pub fn period_for(&self, throttle: ThrottleKey) -> i64 {
        self.profile(throttle).map(|p| p.period).unwrap_or(self.base_period)
    }
}

/// Per-link, per-job, per-throttle load signal, built by summing every
/// matching flow's normalized progress history (`GetLinkLoads`).
pub type LinkLoads = HashMap<RackLink, HashMap<JobId, HashMap<ThrottleKey, LinkProfile>>>;

pub fn build_link_loads(jobs: &[Job], link_bandwidth: f64) -> LinkLoads {
    let mut result: LinkLoads = HashMap::new();
    for job in jobs {
        if !job.has_profiles {
            continue;
        }
        for throttle in job.throttles() {
            let profile = job.profile(throttle).expect("throttle came from this job's profiles");
            if profile.flows.is_empty() {
                continue;
            }
            let mut per_link: HashMap<RackLink, Vec<f64>> = HashMap::new();
            for flow in &profile.flows {
                let normalized: Vec<f64> = flow
                    .progress_history
                    .iter()
                    .map(|v| v / link_bandwidth)
                    .collect();
                // Every flow loads the uplink of its source rack and the
                // downlink of its destination rack (both, when the two
                // racks coincide, per `GetLinkLoads`'s independent
                // per-direction match).
                add_into(
                    &normalized,
                    per_link.entry(RackLink { rack: flow.srcrack, dir: Direction::Up }).or_default(),
                );
                add_into(
                    &normalized,
                    per_link.entry(RackLink { rack: flow.dstrack, dir: Direction::Down }).or_default(),
                );
            }
            for (link, signal) in per_link {
                let max_load = signal.iter().cloned().fold(0.0, f64::max);
                result
                    .entry(link)
                    .or_default()
                    .entry(job.job_id)
                    .or_default()
                    .insert(
                        throttle,
                        LinkProfile {
                            signal,
                            period: profile.period,
                            max_load,
                        },
                    );
            }
        }
    }
    result
}

/// A job's base signal at a throttle: the sum of its load across every
/// link it touches (`Job::GetBaseSignal`).
pub fn job_base_signal(link_loads: &LinkLoads, job_id: JobId, throttle: ThrottleKey) -> Vec<f64> {
    let mut sum = Vec::new();
    for per_job in link_loads.values() {
        if let Some(per_throttle) = per_job.get(&job_id) {
            if let Some(p) = per_throttle.get(&throttle) {
                add_into(&p.signal, &mut sum);
            }
        }
    }
    sum
}

/// First/last nonzero index of the base signal, optionally inflated
/// symmetrically around its midpoint (`Job::GetActiveRange`).
pub fn active_range(base_signal: &[f64], inflate: f64) -> (i64, i64) {
    if base_signal.is_empty() {
        return (0, 0);
    }
    let mut start = first_nonzero_index(base_signal).unwrap_or(base_signal.len()) as i64;
    let mut end = last_nonzero_index(base_signal).map(|i| i as i64).unwrap_or(-1);

    if start as usize >= base_signal.len() {
        start = 0;
        end = 0;
    }

    if inflate > 1.0 {
        let span = (end - start).max(0);
        let inflate_amount = (span as f64 * (inflate - 1.0)) as i64;
        start = (start - inflate_amount / 2).max(0);
        end += inflate_amount / 2;
    }
    (start, end)
}

/// The max load per link a job exerts at a throttle (used by the timing
/// solver to size the remaining-capacity deduction and overload check).
pub fn job_max_loads(link_loads: &LinkLoads, job_id: JobId, throttle: ThrottleKey) -> HashMap<RackLink, f64> {
    let mut out = HashMap::new();
    for (link, per_job) in link_loads {
        if let Some(per_throttle) = per_job.get(&job_id) {
            if let Some(p) = per_throttle.get(&throttle) {
                out.insert(*link, p.max_load);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FlowProfile;

    fn profile_with_flow(period: i64, srcrack: i64, dstrack: i64, history: Vec<f64>) -> ProfileFile {
        ProfileFile {
            period,
            flows: vec![FlowProfile {
                flow_id: 0,
                job_id: 0,
                iteration: 0,
                subflow: 0,
                start_time: 0,
                end_time: history.len() as i64,
                srcrack,
                dstrack,
                fct: 0.0,
                core: 0,
                label: String::new(),
                flow_size: 0.0,
                progress_history: history,
            }],
        }
    }

    #[test]
    fn base_signal_sums_across_links() {
        let spec = JobSpec {
            job_id: 1,
            machines: vec![],
            layer_count: 1,
            iter_count: 2,
            comm_size: 10.0,
            comp_size: 0.0,
        };
        let mut by_throttle = HashMap::new();
        by_throttle.insert(
            "1".to_string(),
            profile_with_flow(10, 0, 1, vec![10.0, 20.0, 0.0]),
        );
        let job = Job::from_spec(&spec, by_throttle);
        let jobs = vec![job];
        let loads = build_link_loads(&jobs, 100.0);
        let base = job_base_signal(&loads, 1, ThrottleKey::from_rate(1.0));
        // The flow loads both its source rack's uplink and its
        // destination rack's downlink, so the job-wide base signal is
        // double the raw normalized history.
        assert_eq!(base, vec![0.2, 0.4, 0.0]);
        let (start, end) = active_range(&base, 1.0);
        assert_eq!((start, end), (0, 1));
    }
}
