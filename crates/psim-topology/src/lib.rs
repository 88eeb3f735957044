//! Fabric topologies: builds machines, links (bottlenecks), and the
//! look-up structures used to resolve a flow's path.
//!
//! The load balancer is kept out of this crate on purpose: path resolution
//! for the upper tier (agg within a pod, or core across pods/racks) is
//! delegated to an [`UpperItemSelector`] implementation the caller passes
//! in. `psim-loadbalancer` implements that trait for its `LoadBalancer`
//! enum and depends on this crate, never the reverse.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use psim_alloc::{
    AllocError, BandwidthAllocator, FairShareAllocator, FixedLevelsAllocator, LinkAllocator,
    MaxMinFairShareAllocator, PriorityQueueAllocator,
};
use psim_config::{LoadMetric, PriorityAllocatorKind, SimConfig};

pub type FlowId = u64;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("fat-tree/leaf-spine dimensions invalid: {0}")]
    InvalidDimensions(String),
    #[error("unknown machine id {0:?}")]
    UnknownMachine(MachineId),
    #[error("unknown bottleneck id {0:?}")]
    UnknownBottleneck(BottleneckId),
    #[error("allocator error on link {link:?}: {source}")]
    Allocator {
        link: BottleneckId,
        #[source]
        source: AllocError,
    },
    #[error("link {link:?} allocated {allocated} exceeds capacity {capacity}")]
    AllocationExceedsCapacity {
        link: BottleneckId,
        allocated: f64,
        capacity: f64,
    },
    #[error("link {link:?} utilized {utilized} exceeds allocated {allocated}")]
    UtilizationExceedsAllocated {
        link: BottleneckId,
        utilized: f64,
        allocated: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BottleneckId(pub u32);

impl From<BottleneckId> for u64 {
    fn from(b: BottleneckId) -> u64 {
        b.0 as u64
    }
}

#[derive(Debug, Clone)]
pub struct Machine {
    pub id: MachineId,
    pub queue: VecDeque<u64>,
    pub queue_len_history: Option<Vec<usize>>,
}

impl Machine {
    fn new(id: MachineId, record_history: bool) -> Self {
        Machine {
            id,
            queue: VecDeque::new(),
            queue_len_history: record_history.then(Vec::new),
        }
    }

    pub fn head(&self) -> Option<u64> {
        self.queue.front().copied()
    }

    pub fn enqueue(&mut self, task_id: u64) {
        self.queue.push_back(task_id);
    }

    pub fn pop_head(&mut self) -> Option<u64> {
        self.queue.pop_front()
    }

    /// Appends the machine's current queue depth to its history, a no-op
    /// when history recording was not enabled at construction.
    pub fn record_queue_len(&mut self) {
        if let Some(h) = &mut self.queue_len_history {
            h.push(self.queue.len());
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bottleneck {
    pub id: BottleneckId,
    pub capacity: f64,
    allocator: LinkAllocator,
    registrations: Vec<(FlowId, f64, i32, f64)>, // flow_id, rate, priority, size
    pub registered_history: Option<Vec<f64>>,
    pub allocated_history: Option<Vec<f64>>,
    pub utilized_history: Option<Vec<f64>>,
    last_registered: f64,
    last_allocated: f64,
    last_utilized: f64,
}

impl Bottleneck {
    fn new(id: BottleneckId, capacity: f64, allocator: LinkAllocator, record_history: bool) -> Self {
        Bottleneck {
            id,
            capacity,
            allocator,
            registrations: Vec::new(),
            registered_history: record_history.then(Vec::new),
            allocated_history: record_history.then(Vec::new),
            utilized_history: record_history.then(Vec::new),
            last_registered: 0.0,
            last_allocated: 0.0,
            last_utilized: 0.0,
        }
    }

    pub fn reset_step(&mut self) -> Result<(), TopologyError> {
        self.allocator
            .reset()
            .map_err(|source| TopologyError::Allocator { link: self.id, source })?;
        self.registrations.clear();
        Ok(())
    }

    pub fn register(&mut self, flow_id: FlowId, rate: f64, priority: i32, size: f64) {
        self.allocator.register(flow_id, rate, priority);
        self.registrations.push((flow_id, rate, priority, size));
    }

    pub fn compute(&mut self) -> Result<(), TopologyError> {
        self.allocator
            .compute()
            .map_err(|source| TopologyError::Allocator { link: self.id, source })
    }

    pub fn get_allocated(&self, flow_id: FlowId, registered_rate: f64, priority: i32) -> f64 {
        self.allocator.get_allocated(flow_id, registered_rate, priority)
    }

    pub fn is_congested(&self) -> bool {
        self.allocator.is_congested()
    }

    /// Sums registered/allocated/utilized this step, records history when
    /// enabled, and checks the `allocated <= capacity`, `utilized <=
    /// allocated` invariants.
    pub fn finalize_step(&mut self) -> Result<(), TopologyError> {
        self.last_registered = self.registrations.iter().map(|r| r.1).sum();
        self.last_allocated = self
            .registrations
            .iter()
            .map(|(id, rate, priority, _)| self.allocator.get_allocated(*id, *rate, *priority))
            .sum();
        self.last_utilized = self.last_allocated;
        for (id, rate, priority, _) in self.registrations.clone() {
            let allocated = self.allocator.get_allocated(id, rate, priority);
            self.allocator.register_utilization(allocated);
        }

        if self.last_allocated > self.capacity + 1e-6 {
            return Err(TopologyError::AllocationExceedsCapacity {
                link: self.id,
                allocated: self.last_allocated,
                capacity: self.capacity,
            });
        }
        if self.last_utilized > self.last_allocated + 1e-6 {
            return Err(TopologyError::UtilizationExceedsAllocated {
                link: self.id,
                utilized: self.last_utilized,
                allocated: self.last_allocated,
            });
        }

        if let Some(h) = &mut self.registered_history {
            h.push(self.last_registered);
        }
        if let Some(h) = &mut self.allocated_history {
            h.push(self.last_allocated);
        }
        if let Some(h) = &mut self.utilized_history {
            h.push(self.last_utilized);
        }
        Ok(())
    }

    pub fn load(&self, metric: LoadMetric) -> f64 {
        match metric {
            LoadMetric::Registered => self.last_registered,
            LoadMetric::Allocated => self.last_allocated,
            LoadMetric::Utilization => self.last_utilized,
            LoadMetric::FlowSize => self.registrations.iter().map(|r| r.3).sum(),
            LoadMetric::FlowCount => self.registrations.len() as f64,
        }
    }
}

/// A candidate upper-tier item (core switch, or agg within a pod) a load
/// balancer can pick between, together with the links it would use.
#[derive(Debug, Clone, Copy)]
pub struct UpperCandidate {
    pub upper: u32,
    pub uplink: BottleneckId,
    pub downlink: BottleneckId,
}

/// Implemented by the load balancer so path resolution can ask "which of
/// these upper-tier items should this flow use" without this crate knowing
/// anything about load balancing policy.
pub trait UpperItemSelector {
    fn select(
        &mut self,
        flow_id: FlowId,
        timer: f64,
        lower: u32,
        candidates: &[UpperCandidate],
        load_of: &dyn Fn(BottleneckId) -> f64,
    ) -> usize;
}

fn make_allocator(cfg: &SimConfig, capacity: f64) -> LinkAllocator {
    match cfg.priority_allocator {
        PriorityAllocatorKind::FairShare => LinkAllocator::FairShare(FairShareAllocator::new(capacity)),
        PriorityAllocatorKind::MaxMinFairShare => LinkAllocator::MaxMin(MaxMinFairShareAllocator::new(
            capacity,
            cfg.punish_oversubscribed,
            cfg.punish_oversubscribed_min,
        )),
        PriorityAllocatorKind::FixedLevels => {
            LinkAllocator::FixedLevels(FixedLevelsAllocator::new(capacity, cfg.bn_priority_levels))
        }
        PriorityAllocatorKind::PriorityQueue => LinkAllocator::PriorityQueue(PriorityQueueAllocator::new(capacity)),
    }
}

#[derive(Debug, Clone)]
pub struct BigSwitch {
    pub machine_count: u32,
    uplinks: Vec<BottleneckId>,
    downlinks: Vec<BottleneckId>,
    machines: Vec<Machine>,
    bottlenecks: Vec<Bottleneck>,
}

impl BigSwitch {
    fn new(cfg: &SimConfig) -> Self {
        let n = cfg.machine_count;
        let mut machines = Vec::with_capacity(n as usize);
        let mut bottlenecks = Vec::with_capacity(2 * n as usize);
        let mut uplinks = Vec::with_capacity(n as usize);
        let mut downlinks = Vec::with_capacity(n as usize);
        for m in 0..n {
            machines.push(Machine::new(MachineId(m), cfg.record_machine_history));
            let up_id = BottleneckId(bottlenecks.len() as u32);
            bottlenecks.push(Bottleneck::new(
                up_id,
                cfg.link_bandwidth,
                make_allocator(cfg, cfg.link_bandwidth),
                cfg.record_bottleneck_history,
            ));
            uplinks.push(up_id);
            let down_id = BottleneckId(bottlenecks.len() as u32);
            bottlenecks.push(Bottleneck::new(
                down_id,
                cfg.link_bandwidth,
                make_allocator(cfg, cfg.link_bandwidth),
                cfg.record_bottleneck_history,
            ));
            downlinks.push(down_id);
        }
        BigSwitch {
            machine_count: n,
            uplinks,
            downlinks,
            machines,
            bottlenecks,
        }
    }

    fn path(&self, src: MachineId, dst: MachineId) -> Vec<BottleneckId> {
        if src == dst {
            Vec::new()
        } else {
            vec![self.uplinks[src.0 as usize], self.downlinks[dst.0 as usize]]
        }
    }
}

#[derive(Debug, Clone)]
pub struct FatTree {
    pub servers_per_rack: u32,
    pub racks_per_pod: u32,
    pub aggs_per_pod: u32,
    pub pod_count: u32,
    pub core_count: u32,
    server_tor_up: Vec<BottleneckId>,
    server_tor_down: Vec<BottleneckId>,
    tor_agg_up: HashMap<(u32, u32), BottleneckId>,
    tor_agg_down: HashMap<(u32, u32), BottleneckId>,
    agg_core_up: HashMap<(u32, u32), BottleneckId>,
    agg_core_down: HashMap<(u32, u32), BottleneckId>,
    last_agg_in_pod: Vec<u32>,
    machines: Vec<Machine>,
    bottlenecks: Vec<Bottleneck>,
}

impl FatTree {
    fn new(cfg: &SimConfig) -> Result<Self, TopologyError> {
        let s = cfg.ft_servers_per_rack;
        let r = cfg.ft_racks_per_pod;
        let a = cfg.ft_aggs_per_pod;
        let p = cfg.ft_pod_count;
        let c = cfg.ft_core_count;
        if cfg.machine_count != s * r * p {
            return Err(TopologyError::InvalidDimensions(format!(
                "machine_count {} != servers_per_rack*racks_per_pod*pod_count {}",
                cfg.machine_count,
                s * r * p
            )));
        }
        if a == 0 || c % a != 0 {
            return Err(TopologyError::InvalidDimensions(format!(
                "core_count {c} not divisible by aggs_per_pod {a}"
            )));
        }

        let mut machines = Vec::with_capacity(cfg.machine_count as usize);
        let mut bottlenecks = Vec::new();
        let mut server_tor_up = Vec::with_capacity(cfg.machine_count as usize);
        let mut server_tor_down = Vec::with_capacity(cfg.machine_count as usize);
        let mut tor_agg_up = HashMap::new();
        let mut tor_agg_down = HashMap::new();
        let mut agg_core_up = HashMap::new();
        let mut agg_core_down = HashMap::new();

        let server_tor_cap = cfg.link_bandwidth * cfg.ft_server_tor_link_capacity_mult;
        let tor_agg_cap = cfg.link_bandwidth * cfg.ft_tor_agg_link_capacity_mult;
        let agg_core_cap = cfg.link_bandwidth * cfg.ft_agg_core_link_capacity_mult;

        for pod in 0..p {
            for rack_local in 0..r {
                let rack_global = pod * r + rack_local;
                for _server_local in 0..s {
                    let m = MachineId(machines.len() as u32);
                    machines.push(Machine::new(m, cfg.record_machine_history));

                    let up = BottleneckId(bottlenecks.len() as u32);
                    bottlenecks.push(Bottleneck::new(
                        up,
                        server_tor_cap,
                        make_allocator(cfg, server_tor_cap),
                        cfg.record_bottleneck_history,
                    ));
                    server_tor_up.push(up);

                    let down = BottleneckId(bottlenecks.len() as u32);
                    bottlenecks.push(Bottleneck::new(
                        down,
                        server_tor_cap,
                        make_allocator(cfg, server_tor_cap),
                        cfg.record_bottleneck_history,
                    ));
                    server_tor_down.push(down);
                }
                for agg_local in 0..a {
                    let up = BottleneckId(bottlenecks.len() as u32);
                    bottlenecks.push(Bottleneck::new(
                        up,
                        tor_agg_cap,
                        make_allocator(cfg, tor_agg_cap),
                        cfg.record_bottleneck_history,
                    ));
                    tor_agg_up.insert((rack_global, agg_local), up);

                    let down = BottleneckId(bottlenecks.len() as u32);
                    bottlenecks.push(Bottleneck::new(
                        down,
                        tor_agg_cap,
                        make_allocator(cfg, tor_agg_cap),
                        cfg.record_bottleneck_history,
                    ));
                    tor_agg_down.insert((rack_global, agg_local), down);
                }
            }
            for agg_local in 0..a {
                let agg_global = pod * a + agg_local;
                for core in 0..c {
                    let up = BottleneckId(bottlenecks.len() as u32);
                    bottlenecks.push(Bottleneck::new(
                        up,
                        agg_core_cap,
                        make_allocator(cfg, agg_core_cap),
                        cfg.record_bottleneck_history,
                    ));
                    agg_core_up.insert((agg_global, core), up);

                    let down = BottleneckId(bottlenecks.len() as u32);
                    bottlenecks.push(Bottleneck::new(
                        down,
                        agg_core_cap,
                        make_allocator(cfg, agg_core_cap),
                        cfg.record_bottleneck_history,
                    ));
                    agg_core_down.insert((agg_global, core), down);
                }
            }
        }

        Ok(FatTree {
            servers_per_rack: s,
            racks_per_pod: r,
            aggs_per_pod: a,
            pod_count: p,
            core_count: c,
            server_tor_up,
            server_tor_down,
            tor_agg_up,
            tor_agg_down,
            agg_core_up,
            agg_core_down,
            last_agg_in_pod: vec![0; p as usize],
            machines,
            bottlenecks,
        })
    }

    fn rack_of(&self, m: MachineId) -> u32 {
        m.0 / self.servers_per_rack
    }

    fn pod_of_rack(&self, rack_global: u32) -> u32 {
        rack_global / self.racks_per_pod
    }

    fn pod_of(&self, m: MachineId) -> u32 {
        self.pod_of_rack(self.rack_of(m))
    }

    fn next_agg_in_pod(&mut self, pod: u32) -> u32 {
        let slot = &mut self.last_agg_in_pod[pod as usize];
        let chosen = *slot;
        *slot = (*slot + 1) % self.aggs_per_pod;
        chosen
    }

    fn build_path(
        &mut self,
        src: MachineId,
        dst: MachineId,
        core_selector: &mut dyn UpperItemSelector,
        flow_id: FlowId,
        timer: f64,
        load_metric: LoadMetric,
    ) -> Vec<BottleneckId> {
        if src == dst {
            return Vec::new();
        }
        let src_rack = self.rack_of(src);
        let dst_rack = self.rack_of(dst);
        if src_rack == dst_rack {
            return vec![
                self.server_tor_up[src.0 as usize],
                self.server_tor_down[dst.0 as usize],
            ];
        }
        let src_pod = self.pod_of_rack(src_rack);
        let dst_pod = self.pod_of_rack(dst_rack);
        if src_pod == dst_pod {
            let agg_local = self.next_agg_in_pod(src_pod);
            return vec![
                self.server_tor_up[src.0 as usize],
                self.tor_agg_up[&(src_rack, agg_local)],
                self.tor_agg_down[&(dst_rack, agg_local)],
                self.server_tor_down[dst.0 as usize],
            ];
        }

        let src_agg_local = self.next_agg_in_pod(src_pod);
        let dst_agg_local = self.next_agg_in_pod(dst_pod);
        let src_agg_global = src_pod * self.aggs_per_pod + src_agg_local;
        let dst_agg_global = dst_pod * self.aggs_per_pod + dst_agg_local;

        let candidates: Vec<UpperCandidate> = (0..self.core_count)
            .map(|core| UpperCandidate {
                upper: core,
                uplink: self.agg_core_up[&(src_agg_global, core)],
                downlink: self.agg_core_down[&(dst_agg_global, core)],
            })
            .collect();
        let bottlenecks = &self.bottlenecks;
        let load_of = |id: BottleneckId| bottlenecks[id.0 as usize].load(load_metric);
        let chosen_idx = core_selector.select(flow_id, timer, src_pod, &candidates, &load_of);
        let chosen = candidates[chosen_idx];

        vec![
            self.server_tor_up[src.0 as usize],
            self.tor_agg_up[&(src_rack, src_agg_local)],
            chosen.uplink,
            chosen.downlink,
            self.tor_agg_down[&(dst_rack, dst_agg_local)],
            self.server_tor_down[dst.0 as usize],
        ]
    }
}

#[derive(Debug, Clone)]
pub struct LeafSpine {
    pub servers_per_rack: u32,
    pub rack_count: u32,
    pub core_count: u32,
    server_leaf_up: Vec<BottleneckId>,
    server_leaf_down: Vec<BottleneckId>,
    leaf_core_up: HashMap<(u32, u32), BottleneckId>,
    leaf_core_down: HashMap<(u32, u32), BottleneckId>,
    machines: Vec<Machine>,
    bottlenecks: Vec<Bottleneck>,
}

impl LeafSpine {
    fn new(cfg: &SimConfig) -> Result<Self, TopologyError> {
        let s = cfg.ft_servers_per_rack;
        let rack_count = cfg.ft_pod_count; // leaf-spine: one rack == one pod, a degenerate fat-tree
        let c = cfg.ft_core_count;
        if cfg.machine_count != s * rack_count {
            return Err(TopologyError::InvalidDimensions(format!(
                "machine_count {} != servers_per_rack*rack_count {}",
                cfg.machine_count,
                s * rack_count
            )));
        }

        let mut machines = Vec::with_capacity(cfg.machine_count as usize);
        let mut bottlenecks = Vec::new();
        let mut server_leaf_up = Vec::with_capacity(cfg.machine_count as usize);
        let mut server_leaf_down = Vec::with_capacity(cfg.machine_count as usize);
        let mut leaf_core_up = HashMap::new();
        let mut leaf_core_down = HashMap::new();

        let server_leaf_cap = cfg.link_bandwidth * cfg.ft_server_tor_link_capacity_mult;
        let leaf_core_cap = cfg.link_bandwidth * cfg.ft_agg_core_link_capacity_mult;

        for rack in 0..rack_count {
            for _server_local in 0..s {
                let m = MachineId(machines.len() as u32);
                machines.push(Machine::new(m, cfg.record_machine_history));

                let up = BottleneckId(bottlenecks.len() as u32);
                bottlenecks.push(Bottleneck::new(
                    up,
                    server_leaf_cap,
                    make_allocator(cfg, server_leaf_cap),
                    cfg.record_bottleneck_history,
                ));
                server_leaf_up.push(up);

                let down = BottleneckId(bottlenecks.len() as u32);
                bottlenecks.push(Bottleneck::new(
                    down,
                    server_leaf_cap,
                    make_allocator(cfg, server_leaf_cap),
                    cfg.record_bottleneck_history,
                ));
                server_leaf_down.push(down);
            }
            for core in 0..c {
                let up = BottleneckId(bottlenecks.len() as u32);
                bottlenecks.push(Bottleneck::new(
                    up,
                    leaf_core_cap,
                    make_allocator(cfg, leaf_core_cap),
                    cfg.record_bottleneck_history,
                ));
                leaf_core_up.insert((rack, core), up);

                let down = BottleneckId(bottlenecks.len() as u32);
                bottlenecks.push(Bottleneck::new(
                    down,
                    leaf_core_cap,
                    make_allocator(cfg, leaf_core_cap),
                    cfg.record_bottleneck_history,
                ));
                leaf_core_down.insert((rack, core), down);
            }
        }

        Ok(LeafSpine {
            servers_per_rack: s,
            rack_count,
            core_count: c,
            server_leaf_up,
            server_leaf_down,
            leaf_core_up,
            leaf_core_down,
            machines,
            bottlenecks,
        })
    }

    fn rack_of(&self, m: MachineId) -> u32 {
        m.0 / self.servers_per_rack
    }

    fn build_path(
        &mut self,
        src: MachineId,
        dst: MachineId,
        core_selector: &mut dyn UpperItemSelector,
        flow_id: FlowId,
        timer: f64,
        load_metric: LoadMetric,
    ) -> Vec<BottleneckId> {
        if src == dst {
            return Vec::new();
        }
        let src_rack = self.rack_of(src);
        let dst_rack = self.rack_of(dst);
        if src_rack == dst_rack {
            return vec![
                self.server_leaf_up[src.0 as usize],
                self.server_leaf_down[dst.0 as usize],
            ];
        }
        let candidates: Vec<UpperCandidate> = (0..self.core_count)
            .map(|core| UpperCandidate {
                upper: core,
                uplink: self.leaf_core_up[&(src_rack, core)],
                downlink: self.leaf_core_down[&(dst_rack, core)],
            })
            .collect();
        let bottlenecks = &self.bottlenecks;
        let load_of = |id: BottleneckId| bottlenecks[id.0 as usize].load(load_metric);
        let chosen_idx = core_selector.select(flow_id, timer, src_rack, &candidates, &load_of);
        let chosen = candidates[chosen_idx];
        vec![
            self.server_leaf_up[src.0 as usize],
            chosen.uplink,
            chosen.downlink,
            self.server_leaf_down[dst.0 as usize],
        ]
    }
}

#[derive(Debug, Clone)]
pub enum Topology {
    BigSwitch(BigSwitch),
    FatTree(FatTree),
    LeafSpine(LeafSpine),
}

impl Topology {
    pub fn build(cfg: &SimConfig) -> Result<Self, TopologyError> {
        match cfg.network_type {
            psim_config::NetworkType::BigSwitch => Ok(Topology::BigSwitch(BigSwitch::new(cfg))),
            psim_config::NetworkType::FatTree => Ok(Topology::FatTree(FatTree::new(cfg)?)),
            psim_config::NetworkType::LeafSpine => Ok(Topology::LeafSpine(LeafSpine::new(cfg)?)),
        }
    }

    pub fn machines(&self) -> &[Machine] {
        match self {
            Topology::BigSwitch(t) => &t.machines,
            Topology::FatTree(t) => &t.machines,
            Topology::LeafSpine(t) => &t.machines,
        }
    }

    pub fn machines_mut(&mut self) -> &mut [Machine] {
        match self {
            Topology::BigSwitch(t) => &mut t.machines,
            Topology::FatTree(t) => &mut t.machines,
            Topology::LeafSpine(t) => &mut t.machines,
        }
    }

    pub fn machine(&self, id: MachineId) -> Option<&Machine> {
        self.machines().get(id.0 as usize)
    }

    pub fn machine_mut(&mut self, id: MachineId) -> Option<&mut Machine> {
        self.machines_mut().get_mut(id.0 as usize)
    }

    pub fn bottlenecks(&self) -> &[Bottleneck] {
        match self {
            Topology::BigSwitch(t) => &t.bottlenecks,
            Topology::FatTree(t) => &t.bottlenecks,
            Topology::LeafSpine(t) => &t.bottlenecks,
        }
    }

    pub fn bottlenecks_mut(&mut self) -> &mut [Bottleneck] {
        match self {
            Topology::BigSwitch(t) => &mut t.bottlenecks,
            Topology::FatTree(t) => &mut t.bottlenecks,
            Topology::LeafSpine(t) => &mut t.bottlenecks,
        }
    }

    pub fn bottleneck(&self, id: BottleneckId) -> Option<&Bottleneck> {
        self.bottlenecks().get(id.0 as usize)
    }

    pub fn bottleneck_mut(&mut self, id: BottleneckId) -> Option<&mut Bottleneck> {
        self.bottlenecks_mut().get_mut(id.0 as usize)
    }

    pub fn link_load(&self, id: BottleneckId, metric: LoadMetric) -> f64 {
        self.bottleneck(id).map(|b| b.load(metric)).unwrap_or(0.0)
    }

    /// Returns the flow's source aggregation unit: pod for fat-tree/leaf-
    /// spine, a single flat unit (0) for big switch.
    pub fn get_source_for_flow(&self, src: MachineId) -> u32 {
        match self {
            Topology::BigSwitch(_) => 0,
            Topology::FatTree(t) => t.pod_of(src),
            Topology::LeafSpine(t) => t.rack_of(src),
        }
    }

    /// Resolves the path for a flow between `src` and `dst`, consulting
    /// `core_selector` whenever an upper-tier choice (agg or core) is
    /// required.
    pub fn set_path(
        &mut self,
        src: MachineId,
        dst: MachineId,
        flow_id: FlowId,
        timer: f64,
        load_metric: LoadMetric,
        core_selector: &mut dyn UpperItemSelector,
    ) -> Vec<BottleneckId> {
        match self {
            Topology::BigSwitch(t) => t.path(src, dst),
            Topology::FatTree(t) => t.build_path(src, dst, core_selector, flow_id, timer, load_metric),
            Topology::LeafSpine(t) => t.build_path(src, dst, core_selector, flow_id, timer, load_metric),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psim_config::SimConfigInput;

    fn two_server_fat_tree() -> SimConfig {
        SimConfig::resolve(SimConfigInput {
            machine_count: Some(2),
            ft_servers_per_rack: Some(2),
            ft_racks_per_pod: Some(1),
            ft_pod_count: Some(1),
            ft_aggs_per_pod: Some(1),
            ft_core_count: Some(1),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn same_machine_flow_has_empty_path() {
        let cfg = two_server_fat_tree();
        let mut topo = Topology::build(&cfg).unwrap();
        struct NeverCalled;
        impl UpperItemSelector for NeverCalled {
            fn select(&mut self, _: FlowId, _: f64, _: u32, _: &[UpperCandidate], _: &dyn Fn(BottleneckId) -> f64) -> usize {
                panic!("should not be called for a same-machine flow");
            }
        }
        let mut sel = NeverCalled;
        let path = topo.set_path(MachineId(0), MachineId(0), 1, 0.0, LoadMetric::Utilization, &mut sel);
        assert!(path.is_empty());
    }

    #[test]
    fn same_rack_flow_has_two_links() {
        let cfg = two_server_fat_tree();
        let mut topo = Topology::build(&cfg).unwrap();
        struct NeverCalled;
        impl UpperItemSelector for NeverCalled {
            fn select(&mut self, _: FlowId, _: f64, _: u32, _: &[UpperCandidate], _: &dyn Fn(BottleneckId) -> f64) -> usize {
                panic!("same-rack path should never need an upper-tier choice");
            }
        }
        let mut sel = NeverCalled;
        let path = topo.set_path(MachineId(0), MachineId(1), 1, 0.0, LoadMetric::Utilization, &mut sel);
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn cross_pod_flow_consults_selector_and_uses_six_links() {
        let cfg = SimConfig::resolve(SimConfigInput {
            machine_count: Some(4),
            ft_servers_per_rack: Some(1),
            ft_racks_per_pod: Some(1),
            ft_pod_count: Some(4),
            ft_aggs_per_pod: Some(1),
            ft_core_count: Some(1),
            ..Default::default()
        })
        .unwrap();
        let mut topo = Topology::build(&cfg).unwrap();
        struct FirstCandidate;
        impl UpperItemSelector for FirstCandidate {
            fn select(&mut self, _: FlowId, _: f64, _: u32, candidates: &[UpperCandidate], _: &dyn Fn(BottleneckId) -> f64) -> usize {
                assert!(!candidates.is_empty());
                0
            }
        }
        let mut sel = FirstCandidate;
        let path = topo.set_path(MachineId(0), MachineId(3), 1, 0.0, LoadMetric::Utilization, &mut sel);
        assert_eq!(path.len(), 6);
    }

    #[test]
    fn bottleneck_rejects_allocation_exceeding_capacity() {
        let mut b = Bottleneck::new(
            BottleneckId(0),
            10.0,
            LinkAllocator::FairShare(FairShareAllocator::new(10.0)),
            false,
        );
        b.reset_step().unwrap();
        b.register(1, 5.0, 0, 5.0);
        b.compute().unwrap();
        assert!(b.finalize_step().is_ok());
    }

    #[test]
    fn same_pod_agg_selection_round_robins() {
        let cfg = SimConfig::resolve(SimConfigInput {
            machine_count: Some(4),
            ft_servers_per_rack: Some(1),
            ft_racks_per_pod: Some(4),
            ft_pod_count: Some(1),
            ft_aggs_per_pod: Some(2),
            ft_core_count: Some(2),
            ..Default::default()
        })
        .unwrap();
        let mut topo = Topology::build(&cfg).unwrap();
        struct NeverCalled;
        impl UpperItemSelector for NeverCalled {
            fn select(&mut self, _: FlowId, _: f64, _: u32, _: &[UpperCandidate], _: &dyn Fn(BottleneckId) -> f64) -> usize {
                panic!("same-pod agg selection is round-robin, not delegated");
            }
        }
        let mut sel = NeverCalled;
        let path_a = topo.set_path(MachineId(0), MachineId(1), 1, 0.0, LoadMetric::Utilization, &mut sel);
        let path_b = topo.set_path(MachineId(0), MachineId(2), 2, 0.0, LoadMetric::Utilization, &mut sel);
        assert_eq!(path_a.len(), 4);
        assert_eq!(path_b.len(), 4);
        // different agg chosen on each round-robin turn => different middle links
        assert_ne!(path_a[1].0, path_b[1].0);
    }
}
