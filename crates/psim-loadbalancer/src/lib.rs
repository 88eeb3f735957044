//! Upper-tier item selection (core switch for cross-pod/cross-rack flows,
//! agg switch is handled inside `psim-topology`'s own round-robin and never
//! reaches this crate). Every variant implements
//! [`psim_topology::UpperItemSelector`] so `psim-topology` never needs to
//! know which policy is in play.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::Rng;

use psim_context::RunInfo;
use psim_topology::{BottleneckId, UpperCandidate, UpperItemSelector};

pub type FlowId = u64;
pub type LinkId = u64;

#[derive(Debug)]
pub struct RandomLb {
    rng: StdRng,
}

impl RandomLb {
    pub fn new(rng: StdRng) -> Self {
        RandomLb { rng }
    }
}

impl UpperItemSelector for RandomLb {
    fn select(
        &mut self,
        _flow_id: FlowId,
        _timer: f64,
        _lower: u32,
        candidates: &[UpperCandidate],
        _load_of: &dyn Fn(BottleneckId) -> f64,
    ) -> usize {
        self.rng.random_range(0..candidates.len())
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinLb {
    counters: HashMap<u32, usize>,
}

impl RoundRobinLb {
    pub fn new() -> Self {
        RoundRobinLb::default()
    }
}

impl UpperItemSelector for RoundRobinLb {
    fn select(
        &mut self,
        _flow_id: FlowId,
        _timer: f64,
        lower: u32,
        candidates: &[UpperCandidate],
        _load_of: &dyn Fn(BottleneckId) -> f64,
    ) -> usize {
        let counter = self.counters.entry(lower).or_insert(0);
        let chosen = *counter % candidates.len();
        *counter = (*counter + 1) % candidates.len();
        chosen
    }
}

#[derive(Debug)]
pub struct PowerOfKLb {
    rng: StdRng,
    k: u32,
    prev_best: HashMap<u32, u32>,
}

impl PowerOfKLb {
    pub fn new(rng: StdRng, k: u32) -> Self {
        PowerOfKLb {
            rng,
            k: k.max(1),
            prev_best: HashMap::new(),
        }
    }
}

impl UpperItemSelector for PowerOfKLb {
    fn select(
        &mut self,
        _flow_id: FlowId,
        _timer: f64,
        lower: u32,
        candidates: &[UpperCandidate],
        load_of: &dyn Fn(BottleneckId) -> f64,
    ) -> usize {
        let n = candidates.len();
        let mut sample_indices: Vec<usize> = (0..self.k as usize).map(|_| self.rng.random_range(0..n)).collect();
        if let Some(&prev_upper) = self.prev_best.get(&lower) {
            if let Some(idx) = candidates.iter().position(|c| c.upper == prev_upper) {
                sample_indices.push(idx);
            }
        }

        let mut best_idx = sample_indices[0];
        let mut best_load = f64::INFINITY;
        for idx in sample_indices {
            let c = &candidates[idx];
            let load = load_of(c.uplink) + load_of(c.downlink);
            if load < best_load {
                best_load = load;
                best_idx = idx;
            }
        }
        self.prev_best.insert(lower, candidates[best_idx].upper);
        best_idx
    }
}

#[derive(Debug, Default)]
pub struct LeastLoadedLb;

impl LeastLoadedLb {
    pub fn new() -> Self {
        LeastLoadedLb
    }
}

impl UpperItemSelector for LeastLoadedLb {
    fn select(
        &mut self,
        _flow_id: FlowId,
        _timer: f64,
        _lower: u32,
        candidates: &[UpperCandidate],
        load_of: &dyn Fn(BottleneckId) -> f64,
    ) -> usize {
        let mut best_idx = 0;
        let mut best_load = f64::INFINITY;
        for (idx, c) in candidates.iter().enumerate() {
            let load = load_of(c.uplink) + load_of(c.downlink);
            if load < best_load {
                best_load = load;
                best_idx = idx;
            }
        }
        best_idx
    }
}

#[derive(Debug)]
pub struct RobinHoodLb {
    rng: StdRng,
    lower_bound: HashMap<u32, f64>,
    hard_working_streak: HashMap<(u32, u32), u64>,
}

impl RobinHoodLb {
    pub fn new(rng: StdRng) -> Self {
        RobinHoodLb {
            rng,
            lower_bound: HashMap::new(),
            hard_working_streak: HashMap::new(),
        }
    }
}

impl UpperItemSelector for RobinHoodLb {
    fn select(
        &mut self,
        _flow_id: FlowId,
        _timer: f64,
        lower: u32,
        candidates: &[UpperCandidate],
        load_of: &dyn Fn(BottleneckId) -> f64,
    ) -> usize {
        let n = candidates.len().max(1);
        let loads: Vec<f64> = candidates.iter().map(|c| load_of(c.uplink) + load_of(c.downlink)).collect();
        let mean_load = loads.iter().sum::<f64>() / n as f64;

        let prev_l = self.lower_bound.get(&lower).copied().unwrap_or(0.0);
        let l = prev_l.max(mean_load);
        self.lower_bound.insert(lower, l);

        let threshold = (n as f64).sqrt() * l;
        let mut non_hard_working = Vec::new();
        for (idx, (c, &load)) in candidates.iter().zip(loads.iter()).enumerate() {
            let key = (lower, c.upper);
            let streak = self.hard_working_streak.entry(key).or_insert(0);
            if load > threshold {
                *streak += 1;
            } else {
                *streak = 0;
                non_hard_working.push(idx);
            }
        }

        if !non_hard_working.is_empty() {
            let pick = self.rng.random_range(0..non_hard_working.len());
            non_hard_working[pick]
        } else {
            // everyone is hard-working: pick whichever most recently became so
            // (smallest streak).
            candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| self.hard_working_streak.get(&(lower, c.upper)).copied().unwrap_or(0))
                .map(|(idx, _)| idx)
                .unwrap_or(0)
        }
    }
}

/// Replays the previous run's link-load time series to anticipate
/// congestion. Falls back to round-robin on the first run, or when the
/// flow's predicted residency window falls entirely past the profiled
/// data.
#[derive(Debug)]
pub struct FutureLoadLb {
    fallback: RoundRobinLb,
    steps: Option<Vec<(f64, HashMap<LinkId, f64>)>>,
    prior_fct: HashMap<FlowId, f64>,
    prior_avg_rate: HashMap<FlowId, f64>,
    prior_decision: HashMap<FlowId, u64>,
}

impl FutureLoadLb {
    pub fn new(prior_run: Option<&RunInfo>) -> Self {
        match prior_run {
            None => FutureLoadLb {
                fallback: RoundRobinLb::new(),
                steps: None,
                prior_fct: HashMap::new(),
                prior_avg_rate: HashMap::new(),
                prior_decision: HashMap::new(),
            },
            Some(run) => {
                let mut steps: Vec<(f64, HashMap<LinkId, f64>)> =
                    run.profiled.iter().map(|s| (s.timer, s.link_load.clone())).collect();
                steps.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
                let prior_fct = run.flow_stats.iter().map(|(id, s)| (*id, s.fct)).collect();
                let prior_avg_rate = run.flow_stats.iter().map(|(id, s)| (*id, s.average_rate)).collect();
                FutureLoadLb {
                    fallback: RoundRobinLb::new(),
                    steps: Some(steps),
                    prior_fct,
                    prior_avg_rate,
                    prior_decision: run.routing_decisions.clone(),
                }
            }
        }
    }

    fn predicted_load(steps: &[(f64, HashMap<LinkId, f64>)], link: LinkId, start: f64, end: f64) -> f64 {
        let samples: Vec<f64> = steps
            .iter()
            .filter(|(t, _)| *t >= start && *t <= end)
            .filter_map(|(_, m)| m.get(&link).copied())
            .collect();
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        }
    }
}

impl UpperItemSelector for FutureLoadLb {
    fn select(
        &mut self,
        flow_id: FlowId,
        timer: f64,
        lower: u32,
        candidates: &[UpperCandidate],
        load_of: &dyn Fn(BottleneckId) -> f64,
    ) -> usize {
        let Some(steps) = &mut self.steps else {
            return self.fallback.select(flow_id, timer, lower, candidates, load_of);
        };
        let max_t = steps.last().map(|(t, _)| *t).unwrap_or(0.0);
        if timer > max_t {
            return self.fallback.select(flow_id, timer, lower, candidates, load_of);
        }

        let prev_fct = self.prior_fct.get(&flow_id).copied().unwrap_or(0.0);
        let window_end = timer + prev_fct;
        let own_rate = self.prior_avg_rate.get(&flow_id).copied().unwrap_or(0.0);
        let prev_upper = self.prior_decision.get(&flow_id).copied();

        let mut best_idx = 0;
        let mut best_load = f64::INFINITY;
        for (idx, c) in candidates.iter().enumerate() {
            let up = Self::predicted_load(steps, c.uplink.into(), timer, window_end);
            let down = Self::predicted_load(steps, c.downlink.into(), timer, window_end);
            let mut total = up + down;
            if prev_upper == Some(c.upper as u64) {
                total -= own_rate;
            }
            if total < best_load {
                best_load = total;
                best_idx = idx;
            }
        }

        let chosen = candidates[best_idx];
        for (t, m) in steps.iter_mut() {
            if *t >= timer && *t <= window_end {
                *m.entry(chosen.uplink.into()).or_insert(0.0) += own_rate;
                *m.entry(chosen.downlink.into()).or_insert(0.0) += own_rate;
            }
        }
        if let Some(prev) = prev_upper {
            if prev != chosen.upper as u64 {
                if let Some(prev_candidate) = candidates.iter().find(|c| c.upper as u64 == prev) {
                    for (t, m) in steps.iter_mut() {
                        if *t >= timer && *t <= window_end {
                            if let Some(v) = m.get_mut(&prev_candidate.uplink.into()) {
                                *v -= own_rate;
                            }
                            if let Some(v) = m.get_mut(&prev_candidate.downlink.into()) {
                                *v -= own_rate;
                            }
                        }
                    }
                }
            }
        }
        best_idx
    }
}

#[derive(Debug)]
pub enum LoadBalancer {
    Random(RandomLb),
    RoundRobin(RoundRobinLb),
    PowerOfK(PowerOfKLb),
    LeastLoaded(LeastLoadedLb),
    RobinHood(RobinHoodLb),
    FutureLoad(FutureLoadLb),
}

impl UpperItemSelector for LoadBalancer {
    fn select(
        &mut self,
        flow_id: FlowId,
        timer: f64,
        lower: u32,
        candidates: &[UpperCandidate],
        load_of: &dyn Fn(BottleneckId) -> f64,
    ) -> usize {
        match self {
            LoadBalancer::Random(lb) => lb.select(flow_id, timer, lower, candidates, load_of),
            LoadBalancer::RoundRobin(lb) => lb.select(flow_id, timer, lower, candidates, load_of),
            LoadBalancer::PowerOfK(lb) => lb.select(flow_id, timer, lower, candidates, load_of),
            LoadBalancer::LeastLoaded(lb) => lb.select(flow_id, timer, lower, candidates, load_of),
            LoadBalancer::RobinHood(lb) => lb.select(flow_id, timer, lower, candidates, load_of),
            LoadBalancer::FutureLoad(lb) => lb.select(flow_id, timer, lower, candidates, load_of),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psim_topology::BottleneckId;
    use rand::SeedableRng;

    fn candidates(n: u32) -> Vec<UpperCandidate> {
        (0..n)
            .map(|i| UpperCandidate {
                upper: i,
                uplink: BottleneckId(i * 2),
                downlink: BottleneckId(i * 2 + 1),
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let mut lb = RoundRobinLb::new();
        let cands = candidates(3);
        let load_of = |_: BottleneckId| 0.0;
        let picks: Vec<usize> = (0..6).map(|_| lb.select(0, 0.0, 0, &cands, &load_of)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn least_loaded_picks_minimum_load() {
        let mut lb = LeastLoadedLb::new();
        let cands = candidates(3);
        let loads = [5.0, 1.0, 9.0, 2.0, 0.0, 0.0];
        let load_of = |id: BottleneckId| loads[id.0 as usize];
        let picked = lb.select(0, 0.0, 0, &cands, &load_of);
        assert_eq!(picked, 1);
    }

    #[test]
    fn future_load_first_run_matches_round_robin() {
        let mut fl = FutureLoadLb::new(None);
        let mut rr = RoundRobinLb::new();
        let cands = candidates(3);
        let load_of = |_: BottleneckId| 0.0;
        for i in 0..5 {
            let a = fl.select(i, i as f64, 0, &cands, &load_of);
            let b = rr.select(i, i as f64, 0, &cands, &load_of);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn power_of_k_converges_to_global_minimum_via_previous_best() {
        // Once the global-minimum candidate (index 1) is sampled even once,
        // it becomes `prev_best` and is always re-compared on every later
        // call, so it can never be displaced by a worse candidate. With
        // k == candidates.len() and enough repeated calls, the minimum is
        // certain to be found and then stays selected.
        let rng = StdRng::seed_from_u64(7);
        let mut lb = PowerOfKLb::new(rng, 4);
        let cands = candidates(4);
        let loads = [100.0, 100.0, 0.0, 0.0, 100.0, 100.0, 100.0, 100.0];
        let load_of = |id: BottleneckId| loads[id.0 as usize];
        let mut last = 0;
        for i in 0..20 {
            last = lb.select(i, i as f64, 0, &cands, &load_of);
        }
        assert_eq!(last, 1);
    }
}
