// src/tasks/buffered.rs
use super::runner::TaskSpawner;
use super::task::BoxedTask;

/// Collects tasks spawned while a spatial region is locked and submits them
/// in bulk afterwards, one staging round-trip instead of one per task.
#[derive(Default)]
pub struct BufferedTaskScheduler {
    main_tasks: Vec<BoxedTask>,
}

impl BufferedTaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push_main_task(&mut self, task: BoxedTask) {
        self.main_tasks.push(task);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.main_tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.main_tasks.is_empty()
    }

    /// Submits everything buffered. Capacity is kept for the next round.
    pub fn flush(&mut self, spawner: &TaskSpawner) {
        if !self.main_tasks.is_empty() {
            spawner.enqueue_batch(self.main_tasks.drain(..), false);
        }
    }
}

impl Drop for BufferedTaskScheduler {
    fn drop(&mut self) {
        if !self.is_empty() {
            log::error!("BufferedTaskScheduler dropped with {} unsubmitted tasks", self.len());
        }
    }
}
