//! The protocol DAG: tasks, their dependency edges, ranks, and the lifecycle
//! transitions that don't require network or machine state
//! (`Blocked -> Running -> Finished`).
//!
//! A `Protocol` owns its tasks by integer id. Flows and compute tasks carry
//! their own progress/rate fields directly (mirroring the original single
//! `Task` hierarchy); the simulator loop in `psim-sim` is what advances
//! those fields step by step and calls back into `finish_task` /
//! `start_task` as tasks complete or unblock.

use std::collections::HashMap;

use thiserror::Error;

pub type TaskId = u64;
pub type JobId = u64;
pub type DevId = u64;
/// Kept numerically compatible with `psim_context::LinkId` (both `u64`) so a
/// flow's path can be handed to the run context without conversion.
pub type LinkId = u64;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("duplicate task id {0} inserted into protocol")]
    DuplicateTaskId(TaskId),
    #[error("task {0} references unknown successor task {1}")]
    UnknownSuccessor(TaskId, TaskId),
    #[error("unknown task id {0}")]
    UnknownTaskId(TaskId),
    #[error("cannot mark critical path before the protocol has finished")]
    NotFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Blocked,
    Running,
    Finished,
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    Compute {
        dev_id: DevId,
        size: f64,
        progress: f64,
    },
    Flow {
        src: DevId,
        dst: DevId,
        size: f64,
        progress: f64,
        current_rate: f64,
        registered_rate: f64,
        min_bottleneck_rate: f64,
        /// Assigned from the owning protocol's `job_id` at flow start,
        /// per `original_source/src/flow.cc: compute_priority`.
        selected_priority: JobId,
        path: Vec<LinkId>,
        /// Per-flow rate cap; `-1.0` means unset.
        protocol_defined_max_rate: f64,
        bottlenecked_by_srcdst_count: u64,
        bottlenecked_by_intermediate_count: u64,
    },
    Empty,
}

impl TaskKind {
    pub fn is_flow(&self) -> bool {
        matches!(self, TaskKind::Flow { .. })
    }

    pub fn is_compute(&self) -> bool {
        matches!(self, TaskKind::Compute { .. })
    }

    pub fn size(&self) -> f64 {
        match self {
            TaskKind::Compute { size, .. } => *size,
            TaskKind::Flow { size, .. } => *size,
            TaskKind::Empty => 0.0,
        }
    }

    pub fn progress(&self) -> f64 {
        match self {
            TaskKind::Compute { progress, .. } => *progress,
            TaskKind::Flow { progress, .. } => *progress,
            TaskKind::Empty => 0.0,
        }
    }

    /// `size - progress <= 0` with the same completion guard the original
    /// uses (`about_to_finish`): reaching or exceeding `size` finishes the
    /// task, never strictly after.
    pub fn about_to_finish(&self) -> bool {
        self.progress() + 1e-9 >= self.size()
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Stable, per-protocol sequential numbering independent of the global
    /// task id, used for reporting.
    pub per_job_task_id: u64,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub rank: u32,
    pub dep_left: u32,
    pub prev_tasks: Vec<TaskId>,
    /// Successor ids not yet folded into the dependency graph by
    /// `build_dependency_graph`. Drained (not cleared wholesale) as each is
    /// processed, which is what makes a second call a no-op.
    pub pending_next: Vec<TaskId>,
    /// Successor ids already folded in; stable across repeated
    /// `build_dependency_graph` calls.
    pub successors: Vec<TaskId>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
}

impl Task {
    fn new(id: TaskId, per_job_task_id: u64, kind: TaskKind, next_task_ids: Vec<TaskId>) -> Self {
        Task {
            id,
            per_job_task_id,
            kind,
            status: TaskStatus::Blocked,
            rank: 0,
            dep_left: 0,
            prev_tasks: Vec::new(),
            pending_next: next_task_ids,
            successors: Vec::new(),
            start_time: None,
            end_time: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Protocol {
    pub job_id: JobId,
    tasks: HashMap<TaskId, Task>,
    insertion_order: Vec<TaskId>,
    initiators: Vec<TaskId>,
    finishers: Vec<TaskId>,
    finished_count: u64,
    next_per_job_id: u64,
}

impl Protocol {
    pub fn new(job_id: JobId) -> Self {
        Protocol {
            job_id,
            tasks: HashMap::new(),
            insertion_order: Vec::new(),
            initiators: Vec::new(),
            finishers: Vec::new(),
            finished_count: 0,
            next_per_job_id: 0,
        }
    }

    pub fn add_task_with_id(
        &mut self,
        id: TaskId,
        kind: TaskKind,
        next_task_ids: Vec<TaskId>,
    ) -> Result<(), ProtocolError> {
        if self.tasks.contains_key(&id) {
            return Err(ProtocolError::DuplicateTaskId(id));
        }
        let per_job_task_id = self.next_per_job_id;
        self.next_per_job_id += 1;
        self.tasks
            .insert(id, Task::new(id, per_job_task_id, kind, next_task_ids));
        self.insertion_order.push(id);
        Ok(())
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn total_count(&self) -> u64 {
        self.tasks.len() as u64
    }

    pub fn finished_count(&self) -> u64 {
        self.finished_count
    }

    pub fn is_complete(&self) -> bool {
        self.finished_count == self.total_count()
    }

    pub fn initiators(&self) -> &[TaskId] {
        &self.initiators
    }

    pub fn finishers(&self) -> &[TaskId] {
        &self.finishers
    }

    pub fn get_flows(&self) -> impl Iterator<Item = &Task> {
        self.insertion_order
            .iter()
            .filter_map(move |id| self.tasks.get(id))
            .filter(|t| t.kind.is_flow())
    }

    pub fn get_compute_tasks(&self) -> impl Iterator<Item = &Task> {
        self.insertion_order
            .iter()
            .filter_map(move |id| self.tasks.get(id))
            .filter(|t| t.kind.is_compute())
    }

    /// Three passes, idempotent: resolving pending successor edges,
    /// identifying initiators/finishers, then a BFS rank assignment.
    pub fn build_dependency_graph(&mut self) -> Result<(), ProtocolError> {
        // Pass 1: resolve pending_next into prev_tasks/dep_left, draining
        // each task's pending buffer as it's consumed.
        for id in self.insertion_order.clone() {
            let pending = std::mem::take(&mut self.tasks.get_mut(&id).unwrap().pending_next);
            for succ_id in pending {
                if !self.tasks.contains_key(&succ_id) {
                    return Err(ProtocolError::UnknownSuccessor(id, succ_id));
                }
                self.tasks.get_mut(&succ_id).unwrap().prev_tasks.push(id);
                self.tasks.get_mut(&succ_id).unwrap().dep_left += 1;
                self.tasks.get_mut(&id).unwrap().successors.push(succ_id);
            }
        }

        // Pass 2: initiators/finishers.
        self.initiators = self
            .insertion_order
            .iter()
            .copied()
            .filter(|id| self.tasks[id].prev_tasks.is_empty())
            .collect();
        self.finishers = self
            .insertion_order
            .iter()
            .copied()
            .filter(|id| self.tasks[id].successors.is_empty())
            .collect();

        // Pass 3: BFS rank assignment, longest path from any initiator.
        for id in &self.insertion_order {
            self.tasks.get_mut(id).unwrap().rank = 0;
        }
        let mut queue: std::collections::VecDeque<TaskId> = self.initiators.iter().copied().collect();
        let mut in_queue: std::collections::HashSet<TaskId> = queue.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            in_queue.remove(&id);
            let successors = self.tasks[&id].successors.clone();
            let rank = self.tasks[&id].rank;
            for succ in successors {
                let succ_task = self.tasks.get_mut(&succ).unwrap();
                if succ_task.rank < rank + 1 {
                    succ_task.rank = rank + 1;
                    if in_queue.insert(succ) {
                        queue.push_back(succ);
                    }
                }
            }
        }
        Ok(())
    }

    /// Marks `id` Running. `Empty` tasks finish immediately; any successor
    /// this unblocks that is itself `Empty` cascades through the same call,
    /// so only non-empty newly-ready successors are returned to the caller
    /// (to be started at the next timestep).
    pub fn start_task(&mut self, id: TaskId, timer: f64) -> Result<Vec<TaskId>, ProtocolError> {
        let mut ready_non_empty = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let task = self
                .tasks
                .get_mut(&current)
                .ok_or(ProtocolError::UnknownTaskId(current))?;
            task.status = TaskStatus::Running;
            task.start_time.get_or_insert(timer);
            let is_empty = matches!(task.kind, TaskKind::Empty);
            if is_empty {
                let ready = self.finish_task(current, timer)?;
                for next in ready {
                    if matches!(self.tasks[&next].kind, TaskKind::Empty) {
                        stack.push(next);
                    } else {
                        ready_non_empty.push(next);
                    }
                }
            }
        }
        Ok(ready_non_empty)
    }

    /// Marks `id` Finished and decrements `dep_left` on every successor,
    /// returning the ones that just reached zero (ready to start).
    pub fn finish_task(&mut self, id: TaskId, timer: f64) -> Result<Vec<TaskId>, ProtocolError> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(ProtocolError::UnknownTaskId(id))?;
        task.status = TaskStatus::Finished;
        task.end_time = Some(timer);
        self.finished_count += 1;

        let successors = task.successors.clone();
        let mut ready = Vec::new();
        for succ in successors {
            let succ_task = self.tasks.get_mut(&succ).unwrap();
            debug_assert!(succ_task.dep_left > 0);
            succ_task.dep_left -= 1;
            if succ_task.dep_left == 0 {
                ready.push(succ);
            }
        }
        Ok(ready)
    }

    /// From every finisher with the maximum end time, walks backward
    /// through predecessors whose end time equals the max end time among
    /// that task's predecessors, marking everything visited. Iterative
    /// (explicit stack) to tolerate deep DAGs.
    pub fn mark_critical_path(&self) -> Result<std::collections::HashSet<TaskId>, ProtocolError> {
        if !self.is_complete() {
            return Err(ProtocolError::NotFinished);
        }
        let max_end = self
            .finishers
            .iter()
            .filter_map(|id| self.tasks[id].end_time)
            .fold(f64::NEG_INFINITY, f64::max);

        let mut visited = std::collections::HashSet::new();
        let mut stack: Vec<TaskId> = self
            .finishers
            .iter()
            .copied()
            .filter(|id| self.tasks[id].end_time == Some(max_end))
            .collect();

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let task = &self.tasks[&id];
            if task.prev_tasks.is_empty() {
                continue;
            }
            let prev_max = task
                .prev_tasks
                .iter()
                .filter_map(|p| self.tasks[p].end_time)
                .fold(f64::NEG_INFINITY, f64::max);
            for prev in &task.prev_tasks {
                if self.tasks[prev].end_time == Some(prev_max) {
                    stack.push(*prev);
                }
            }
        }
        Ok(visited)
    }

    /// A structurally identical protocol, same task ids, with all runtime
    /// state reset (status Blocked, progress zeroed, dep_left restored from
    /// the dependency graph).
    pub fn make_copy(&self) -> Protocol {
        let mut copy = self.clone();
        for id in &copy.insertion_order {
            let task = copy.tasks.get_mut(id).unwrap();
            task.status = TaskStatus::Blocked;
            task.start_time = None;
            task.end_time = None;
            task.dep_left = task.prev_tasks.len() as u32;
            match &mut task.kind {
                TaskKind::Compute { progress, .. } => *progress = 0.0,
                TaskKind::Flow {
                    progress,
                    current_rate,
                    registered_rate,
                    min_bottleneck_rate,
                    path,
                    ..
                } => {
                    *progress = 0.0;
                    *current_rate = 0.0;
                    *registered_rate = 0.0;
                    *min_bottleneck_rate = 0.0;
                    path.clear();
                }
                TaskKind::Empty => {}
            }
        }
        copy.finished_count = 0;
        copy
    }
}
