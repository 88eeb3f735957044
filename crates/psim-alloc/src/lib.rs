//! Per-link bandwidth allocation policies.
//!
//! Each variant is a tagged enum member rather than a trait object
//! hierarchy, per the "polymorphic allocator" design note: every variant
//! owns its own scratch state and implements the same
//! [`BandwidthAllocator`] operation set.

use std::collections::HashMap;

use thiserror::Error;

pub type AllocId = u64;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("priority-queue allocator's scratch cohorts were not fully drained before reset")]
    QueueNotDrained,
    #[error("fixed-levels allocator configured with zero priority levels")]
    ZeroPriorityLevels,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    id: AllocId,
    rate: f64,
    priority: i32,
}

/// Common operation set every allocator variant exposes.
pub trait BandwidthAllocator {
    fn reset(&mut self) -> Result<(), AllocError>;
    fn register(&mut self, id: AllocId, rate: f64, priority: i32);
    fn compute(&mut self) -> Result<(), AllocError>;
    fn get_allocated(&self, id: AllocId, registered_rate: f64, priority: i32) -> f64;
    fn register_utilization(&mut self, x: f64);
    fn is_congested(&self) -> bool;
    fn capacity(&self) -> f64;
}

fn warn_unregistered(id: AllocId) {
    tracing::warn!(id, "bandwidth allocator read-out for an id not registered this step");
}

#[derive(Debug, Clone)]
pub struct FairShareAllocator {
    capacity: f64,
    registrations: Vec<Registration>,
    total_registered: f64,
    scale: f64,
    utilized: f64,
}

impl FairShareAllocator {
    pub fn new(capacity: f64) -> Self {
        FairShareAllocator {
            capacity,
            registrations: Vec::new(),
            total_registered: 0.0,
            scale: 1.0,
            utilized: 0.0,
        }
    }
}

impl BandwidthAllocator for FairShareAllocator {
    fn reset(&mut self) -> Result<(), AllocError> {
        self.registrations.clear();
        self.total_registered = 0.0;
        self.scale = 1.0;
        self.utilized = 0.0;
        Ok(())
    }

    fn register(&mut self, id: AllocId, rate: f64, priority: i32) {
        self.total_registered += rate;
        self.registrations.push(Registration { id, rate, priority });
    }

    fn compute(&mut self) -> Result<(), AllocError> {
        self.scale = if self.total_registered > self.capacity {
            self.capacity / self.total_registered
        } else {
            1.0
        };
        Ok(())
    }

    fn get_allocated(&self, id: AllocId, registered_rate: f64, _priority: i32) -> f64 {
        if !self.registrations.iter().any(|r| r.id == id) {
            warn_unregistered(id);
            return 0.0;
        }
        registered_rate * self.scale
    }

    fn register_utilization(&mut self, x: f64) {
        self.utilized += x;
    }

    fn is_congested(&self) -> bool {
        self.total_registered > self.capacity
    }

    fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[derive(Debug, Clone)]
pub struct MaxMinFairShareAllocator {
    capacity: f64,
    registrations: Vec<Registration>,
    total_registered: f64,
    allocations: HashMap<AllocId, f64>,
    utilized: f64,
    pub punish_oversubscribed: bool,
    pub punish_oversubscribed_min: f64,
}

impl MaxMinFairShareAllocator {
    pub fn new(capacity: f64, punish_oversubscribed: bool, punish_oversubscribed_min: f64) -> Self {
        MaxMinFairShareAllocator {
            capacity,
            registrations: Vec::new(),
            total_registered: 0.0,
            allocations: HashMap::new(),
            utilized: 0.0,
            punish_oversubscribed,
            punish_oversubscribed_min,
        }
    }
}

impl BandwidthAllocator for MaxMinFairShareAllocator {
    fn reset(&mut self) -> Result<(), AllocError> {
        self.registrations.clear();
        self.total_registered = 0.0;
        self.allocations.clear();
        self.utilized = 0.0;
        Ok(())
    }

    fn register(&mut self, id: AllocId, rate: f64, priority: i32) {
        self.total_registered += rate;
        self.registrations.push(Registration { id, rate, priority });
    }

    fn compute(&mut self) -> Result<(), AllocError> {
        let mut regs = self.registrations.clone();
        regs.sort_by(|a, b| a.rate.partial_cmp(&b.rate).unwrap());

        let available = if self.punish_oversubscribed && self.total_registered > self.capacity {
            self.capacity * self.punish_oversubscribed_min.clamp(0.0, 1.0)
        } else {
            self.capacity
        };

        self.allocations.clear();
        let mut remaining = available;
        let mut remaining_count = regs.len();
        for r in &regs {
            let share = if remaining_count > 0 {
                remaining / remaining_count as f64
            } else {
                0.0
            };
            let alloc = r.rate.min(share).max(0.0);
            self.allocations.insert(r.id, alloc);
            remaining -= alloc;
            remaining_count -= 1;
        }
        Ok(())
    }

    fn get_allocated(&self, id: AllocId, _registered_rate: f64, _priority: i32) -> f64 {
        match self.allocations.get(&id) {
            Some(a) => *a,
            None => {
                warn_unregistered(id);
                0.0
            }
        }
    }

    fn register_utilization(&mut self, x: f64) {
        self.utilized += x;
    }

    fn is_congested(&self) -> bool {
        self.total_registered > self.capacity
    }

    fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[derive(Debug, Clone)]
pub struct FixedLevelsAllocator {
    capacity: f64,
    levels: u32,
    registrations: Vec<Registration>,
    total_registered: f64,
    assigned_level: HashMap<u32, f64>,
    registered_level: HashMap<u32, f64>,
    utilized: f64,
}

impl FixedLevelsAllocator {
    pub fn new(capacity: f64, levels: u32) -> Self {
        FixedLevelsAllocator {
            capacity,
            levels: levels.max(1),
            registrations: Vec::new(),
            total_registered: 0.0,
            assigned_level: HashMap::new(),
            registered_level: HashMap::new(),
            utilized: 0.0,
        }
    }

    fn clamp_level(&self, priority: i32) -> u32 {
        priority.clamp(0, self.levels as i32 - 1) as u32
    }
}

impl BandwidthAllocator for FixedLevelsAllocator {
    fn reset(&mut self) -> Result<(), AllocError> {
        if self.levels == 0 {
            return Err(AllocError::ZeroPriorityLevels);
        }
        self.registrations.clear();
        self.total_registered = 0.0;
        self.assigned_level.clear();
        self.registered_level.clear();
        self.utilized = 0.0;
        Ok(())
    }

    fn register(&mut self, id: AllocId, rate: f64, priority: i32) {
        self.total_registered += rate;
        self.registrations.push(Registration { id, rate, priority });
    }

    fn compute(&mut self) -> Result<(), AllocError> {
        self.assigned_level.clear();
        self.registered_level.clear();
        let mut remaining = self.capacity;
        for level in 0..self.levels {
            let registered_i: f64 = self
                .registrations
                .iter()
                .filter(|r| self.clamp_level(r.priority) == level)
                .map(|r| r.rate)
                .sum();
            self.registered_level.insert(level, registered_i);
            let take = registered_i.min(remaining.max(0.0));
            self.assigned_level.insert(level, take);
            remaining -= take;
        }
        Ok(())
    }

    fn get_allocated(&self, id: AllocId, registered_rate: f64, priority: i32) -> f64 {
        if !self.registrations.iter().any(|r| r.id == id) {
            warn_unregistered(id);
            return 0.0;
        }
        let level = self.clamp_level(priority);
        let assigned = self.assigned_level.get(&level).copied().unwrap_or(0.0);
        let registered = self.registered_level.get(&level).copied().unwrap_or(0.0);
        if registered <= 0.0 {
            return 0.0;
        }
        if assigned < registered {
            registered_rate * (assigned / registered)
        } else {
            registered_rate
        }
    }

    fn register_utilization(&mut self, x: f64) {
        self.utilized += x;
    }

    fn is_congested(&self) -> bool {
        self.total_registered > self.capacity
    }

    fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[derive(Debug, Clone)]
pub struct PriorityQueueAllocator {
    capacity: f64,
    registrations: Vec<Registration>,
    total_registered: f64,
    allocations: HashMap<AllocId, f64>,
    drained: bool,
    utilized: f64,
}

impl PriorityQueueAllocator {
    pub fn new(capacity: f64) -> Self {
        PriorityQueueAllocator {
            capacity,
            registrations: Vec::new(),
            total_registered: 0.0,
            allocations: HashMap::new(),
            drained: true,
            utilized: 0.0,
        }
    }
}

impl BandwidthAllocator for PriorityQueueAllocator {
    fn reset(&mut self) -> Result<(), AllocError> {
        if !self.drained {
            return Err(AllocError::QueueNotDrained);
        }
        self.registrations.clear();
        self.total_registered = 0.0;
        self.allocations.clear();
        self.utilized = 0.0;
        Ok(())
    }

    fn register(&mut self, id: AllocId, rate: f64, priority: i32) {
        self.total_registered += rate;
        self.registrations.push(Registration { id, rate, priority });
        self.drained = false;
    }

    fn compute(&mut self) -> Result<(), AllocError> {
        // Cohorts grouped by exact priority value, highest (numerically
        // smallest, 0 = top priority, matching the fixed-levels convention)
        // served first.
        let mut priorities: Vec<i32> = self.registrations.iter().map(|r| r.priority).collect();
        priorities.sort_unstable();
        priorities.dedup();

        self.allocations.clear();
        let mut remaining = self.capacity;
        for p in priorities {
            let cohort: Vec<&Registration> = self.registrations.iter().filter(|r| r.priority == p).collect();
            let total: f64 = cohort.iter().map(|r| r.rate).sum();
            if total <= remaining {
                for r in &cohort {
                    self.allocations.insert(r.id, r.rate);
                }
                remaining -= total;
            } else if remaining > 0.0 {
                for r in &cohort {
                    self.allocations.insert(r.id, r.rate * remaining / total);
                }
                remaining = 0.0;
            } else {
                for r in &cohort {
                    self.allocations.insert(r.id, 0.0);
                }
            }
        }
        self.drained = true;
        Ok(())
    }

    fn get_allocated(&self, id: AllocId, _registered_rate: f64, _priority: i32) -> f64 {
        match self.allocations.get(&id) {
            Some(a) => *a,
            None => {
                warn_unregistered(id);
                0.0
            }
        }
    }

    fn register_utilization(&mut self, x: f64) {
        self.utilized += x;
    }

    fn is_congested(&self) -> bool {
        self.total_registered > self.capacity
    }

    fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// A tagged union over every allocator variant, selected once per link at
/// topology construction time.
#[derive(Debug, Clone)]
pub enum LinkAllocator {
    FairShare(FairShareAllocator),
    MaxMin(MaxMinFairShareAllocator),
    FixedLevels(FixedLevelsAllocator),
    PriorityQueue(PriorityQueueAllocator),
}

impl BandwidthAllocator for LinkAllocator {
    fn reset(&mut self) -> Result<(), AllocError> {
        match self {
            LinkAllocator::FairShare(a) => a.reset(),
            LinkAllocator::MaxMin(a) => a.reset(),
            LinkAllocator::FixedLevels(a) => a.reset(),
            LinkAllocator::PriorityQueue(a) => a.reset(),
        }
    }

    fn register(&mut self, id: AllocId, rate: f64, priority: i32) {
        match self {
            LinkAllocator::FairShare(a) => a.register(id, rate, priority),
            LinkAllocator::MaxMin(a) => a.register(id, rate, priority),
            LinkAllocator::FixedLevels(a) => a.register(id, rate, priority),
            LinkAllocator::PriorityQueue(a) => a.register(id, rate, priority),
        }
    }

    fn compute(&mut self) -> Result<(), AllocError> {
        match self {
            LinkAllocator::FairShare(a) => a.compute(),
            LinkAllocator::MaxMin(a) => a.compute(),
            LinkAllocator::FixedLevels(a) => a.compute(),
            LinkAllocator::PriorityQueue(a) => a.compute(),
        }
    }

    fn get_allocated(&self, id: AllocId, registered_rate: f64, priority: i32) -> f64 {
        match self {
            LinkAllocator::FairShare(a) => a.get_allocated(id, registered_rate, priority),
            LinkAllocator::MaxMin(a) => a.get_allocated(id, registered_rate, priority),
            LinkAllocator::FixedLevels(a) => a.get_allocated(id, registered_rate, priority),
            LinkAllocator::PriorityQueue(a) => a.get_allocated(id, registered_rate, priority),
        }
    }

    fn register_utilization(&mut self, x: f64) {
        match self {
            LinkAllocator::FairShare(a) => a.register_utilization(x),
            LinkAllocator::MaxMin(a) => a.register_utilization(x),
            LinkAllocator::FixedLevels(a) => a.register_utilization(x),
            LinkAllocator::PriorityQueue(a) => a.register_utilization(x),
        }
    }

    fn is_congested(&self) -> bool {
        match self {
            LinkAllocator::FairShare(a) => a.is_congested(),
            LinkAllocator::MaxMin(a) => a.is_congested(),
            LinkAllocator::FixedLevels(a) => a.is_congested(),
            LinkAllocator::PriorityQueue(a) => a.is_congested(),
        }
    }

    fn capacity(&self) -> f64 {
        match self {
            LinkAllocator::FairShare(a) => a.capacity(),
            LinkAllocator::MaxMin(a) => a.capacity(),
            LinkAllocator::FixedLevels(a) => a.capacity(),
            LinkAllocator::PriorityQueue(a) => a.capacity(),
        }
    }
}
