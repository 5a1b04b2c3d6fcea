// src/tasks/task.rs
use std::sync::Arc;

use super::buffered::BufferedTaskScheduler;
use super::priority::TaskPriority;
use super::tracker::DependencyTracker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Finished, goes to the completed list.
    Complete,
    /// Could not run now (lock contention, neighbors still being serviced).
    /// Goes back to the runner and is retried later.
    Postponed,
    /// Handed to a `DependencyTracker`, which re-submits it once its
    /// dependencies resolve.
    TakenOut,
}

/// A unit of work owned by the runner while pending or running.
///
/// `priority` and `is_cancelled` are polled from worker threads on a refresh
/// cadence, `apply_result` runs on whichever thread drains completed tasks.
pub trait ThreadedTask: Send {
    fn run(&mut self, ctx: &mut TaskContext<'_>);

    fn priority(&self) -> TaskPriority {
        TaskPriority::MIN
    }

    fn is_cancelled(&self) -> bool {
        false
    }

    fn apply_result(&mut self) {}

    fn debug_name(&self) -> &'static str {
        "<unnamed>"
    }
}

pub type BoxedTask = Box<dyn ThreadedTask>;

pub struct TaskContext<'a> {
    pub thread_index: usize,
    /// Cached priority the task was picked with.
    pub priority: TaskPriority,
    status: TaskStatus,
    parked_on: Option<Arc<DependencyTracker>>,
    scheduler: &'a mut BufferedTaskScheduler,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        thread_index: usize,
        priority: TaskPriority,
        scheduler: &'a mut BufferedTaskScheduler,
    ) -> Self {
        Self {
            thread_index,
            priority,
            status: TaskStatus::Complete,
            parked_on: None,
            scheduler,
        }
    }

    #[inline]
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn postpone(&mut self) {
        self.status = TaskStatus::Postponed;
        self.parked_on = None;
    }

    /// The running task gives itself to `tracker`. The caller must hold the
    /// tracker's parking reference (see `DependencyTracker::new`), which is
    /// released once the task is parked.
    pub fn take_out(&mut self, tracker: Arc<DependencyTracker>) {
        self.status = TaskStatus::TakenOut;
        self.parked_on = Some(tracker);
    }

    /// Tasks spawned from here are submitted after the current task returns.
    #[inline]
    pub fn scheduler(&mut self) -> &mut BufferedTaskScheduler {
        self.scheduler
    }

    pub(crate) fn finish(self) -> (TaskStatus, Option<Arc<DependencyTracker>>) {
        (self.status, self.parked_on)
    }
}
