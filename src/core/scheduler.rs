//! Multi-level priority queues gated by a dependency graph.
//!
//! One FIFO per priority level; `next` always drains the most urgent
//! non-empty level first. There is no aging, so sustained high-priority load
//! can starve the lower levels.
//!
//! Only the most recent completions are remembered (see
//! [`DEFAULT_COMPLETED_RETENTION`]). Callers that accept dependencies on older
//! ids resolve them elsewhere and report them through `complete`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;

use crate::core::task::Task;
use crate::util::serde::{Priority, TaskId};

/// Completed ids remembered for resolving later dependencies.
pub const DEFAULT_COMPLETED_RETENTION: usize = 4096;

/// Outcome of adding a task to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// All dependencies were complete; the task is queued.
    Queued,
    /// Some dependencies are outstanding; the task waits.
    Pending,
}

/// Forward and reverse dependency edges.
///
/// `blocked_on` maps a task to the ids it still waits for; `dependents` maps
/// an id to the tasks waiting for it. Both maps are kept in sync.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    blocked_on: HashMap<TaskId, HashSet<TaskId>>,
    dependents: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    /// Record that `task` waits for `depends_on`.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.blocked_on.entry(task).or_default().insert(depends_on);
        self.dependents.entry(depends_on).or_default().insert(task);
    }

    /// Resolve `completed` and return the tasks that no longer wait for anything.
    pub fn resolve(&mut self, completed: TaskId) -> Vec<TaskId> {
        let Some(waiting) = self.dependents.remove(&completed) else {
            return Vec::new();
        };
        let mut unblocked = Vec::new();
        for task in waiting {
            if let Some(deps) = self.blocked_on.get_mut(&task) {
                deps.remove(&completed);
                if deps.is_empty() {
                    self.blocked_on.remove(&task);
                    unblocked.push(task);
                }
            }
        }
        unblocked
    }

    /// Drop every edge touching `task`.
    pub fn remove(&mut self, task: TaskId) {
        if let Some(deps) = self.blocked_on.remove(&task) {
            for dep in deps {
                if let Some(waiting) = self.dependents.get_mut(&dep) {
                    waiting.remove(&task);
                    if waiting.is_empty() {
                        self.dependents.remove(&dep);
                    }
                }
            }
        }
    }

    /// Whether `task` still waits for anything.
    #[must_use]
    pub fn is_blocked(&self, task: TaskId) -> bool {
        self.blocked_on.get(&task).is_some_and(|deps| !deps.is_empty())
    }

    /// Outstanding dependencies of `task`.
    #[must_use]
    pub fn blockers_of(&self, task: TaskId) -> Vec<TaskId> {
        self.blocked_on
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Per-priority ready queues plus dependency gating.
#[derive(Debug)]
pub struct PriorityScheduler {
    levels: [VecDeque<TaskId>; Priority::LEVELS],
    pending: HashMap<TaskId, Priority>,
    graph: DependencyGraph,
    completed: HashSet<TaskId>,
    /// Completion order, oldest first; bounds `completed`.
    completed_order: VecDeque<TaskId>,
    retention: NonZeroUsize,
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityScheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            levels: std::array::from_fn(|_| VecDeque::new()),
            pending: HashMap::new(),
            graph: DependencyGraph::default(),
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
            retention: NonZeroUsize::new(DEFAULT_COMPLETED_RETENTION).unwrap_or(NonZeroUsize::MIN),
        }
    }

    /// Remember at most `retention` completed ids.
    #[must_use]
    pub const fn with_completed_retention(mut self, retention: NonZeroUsize) -> Self {
        self.retention = retention;
        self
    }

    /// Queue `task` if its dependencies are complete, otherwise park it.
    pub fn add(&mut self, task: &Task) -> Admission {
        let unmet: Vec<TaskId> = task
            .dependencies
            .iter()
            .filter(|dep| !self.completed.contains(dep))
            .copied()
            .collect();

        if unmet.is_empty() {
            self.levels[task.priority.level()].push_back(task.id);
            return Admission::Queued;
        }

        for dep in unmet {
            self.graph.add_dependency(task.id, dep);
        }
        self.pending.insert(task.id, task.priority);
        Admission::Pending
    }

    /// Pop the oldest id from the most urgent non-empty level.
    pub fn next(&mut self) -> Option<TaskId> {
        self.levels.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Put an id back at the head of its level after a failed admission.
    pub fn requeue_front(&mut self, id: TaskId, priority: Priority) {
        self.levels[priority.level()].push_front(id);
    }

    /// Put an id at the tail of its level (retry path).
    pub fn requeue(&mut self, id: TaskId, priority: Priority) {
        self.levels[priority.level()].push_back(id);
    }

    /// Mark `id` complete and queue every dependent it unblocks.
    ///
    /// Returns the ids that moved from pending to queued.
    pub fn complete(&mut self, id: TaskId) -> Vec<TaskId> {
        if self.completed.insert(id) {
            self.completed_order.push_back(id);
            while self.completed_order.len() > self.retention.get() {
                if let Some(oldest) = self.completed_order.pop_front() {
                    self.completed.remove(&oldest);
                }
            }
        }
        let unblocked = self.graph.resolve(id);
        for task in &unblocked {
            if let Some(priority) = self.pending.remove(task) {
                self.levels[priority.level()].push_back(*task);
            }
        }
        unblocked
    }

    /// Remove every pending task that transitively waits for `id`.
    ///
    /// Used when `id` ends without completing, so its dependents can never run.
    pub fn abandon(&mut self, id: TaskId) -> Vec<TaskId> {
        let mut abandoned = Vec::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            let dependents = self.graph.dependents.remove(&current).unwrap_or_default();
            for dependent in dependents {
                if self.pending.remove(&dependent).is_some() {
                    self.graph.remove(dependent);
                    abandoned.push(dependent);
                    frontier.push(dependent);
                }
            }
        }
        abandoned
    }

    /// Forget `id` wherever it waits. Returns true if it was found.
    pub fn remove(&mut self, id: TaskId) -> bool {
        if self.pending.remove(&id).is_some() {
            self.graph.remove(id);
            return true;
        }
        for level in &mut self.levels {
            if let Some(pos) = level.iter().position(|queued| *queued == id) {
                level.remove(pos);
                return true;
            }
        }
        false
    }

    /// Whether `id` completed recently enough to still be remembered.
    #[must_use]
    pub fn is_complete(&self, id: TaskId) -> bool {
        self.completed.contains(&id)
    }

    /// Whether `id` waits for dependencies.
    #[must_use]
    pub fn is_pending(&self, id: TaskId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Ready ids across all levels.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    /// Ready ids at one level.
    #[must_use]
    pub fn queued_at(&self, priority: Priority) -> usize {
        self.levels[priority.level()].len()
    }

    /// Ids waiting for dependencies.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Dependency graph, for inspection.
    #[must_use]
    pub const fn graph(&self) -> &DependencyGraph {
        &self.graph
    }
}
