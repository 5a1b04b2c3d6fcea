// src/tasks/tracker.rs
//
// N-of-N completion barrier. Owns the tasks waiting on it until the count
// reaches zero, then hands them back exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::buffered::BufferedTaskScheduler;
use super::task::BoxedTask;

pub struct DependencyTracker {
    count: AtomicU32,
    aborted: AtomicBool,
    continuations: Mutex<Vec<BoxedTask>>,
}

impl DependencyTracker {
    /// Starts with a count of 1: the reference held by whoever will park the
    /// waiting task. Every dependency adds one with `add_dependency`.
    pub fn new() -> Arc<Self> {
        Self::with_count(1)
    }

    pub fn with_count(count: u32) -> Arc<Self> {
        assert!(count > 0, "tracker created already resolved");
        Arc::new(Self {
            count: AtomicU32::new(count),
            aborted: AtomicBool::new(false),
            continuations: Mutex::new(Vec::new()),
        })
    }

    pub fn add_dependency(&self) {
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        assert!(prev > 0, "dependency added to a tracker that already fired");
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.count() == 0
    }

    /// Marks the chain as failed. Waiting tasks still resume and must check
    /// `is_aborted` before doing anything else.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn push_continuation(&self, task: BoxedTask) {
        assert!(self.count() > 0, "continuation added to a tracker that already fired");
        self.continuations.lock().push(task);
    }

    /// Releases one reference. Returns the continuations when this was the
    /// last one, an empty list otherwise.
    #[must_use = "continuations returned here must be scheduled"]
    pub fn complete(&self) -> Vec<BoxedTask> {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "dependency tracker count went negative");
        if prev == 1 {
            std::mem::take(&mut *self.continuations.lock())
        } else {
            Vec::new()
        }
    }

    /// Same as `complete`, continuations go to `scheduler`.
    pub fn complete_into(&self, scheduler: &mut BufferedTaskScheduler) {
        for task in self.complete() {
            scheduler.push_main_task(task);
        }
    }

    /// Stores `task` and releases the parking reference.
    #[must_use = "continuations returned here must be scheduled"]
    pub fn park(&self, task: BoxedTask) -> Vec<BoxedTask> {
        self.push_continuation(task);
        self.complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::task::{TaskContext, ThreadedTask};
    use rand::Rng;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Marker(Arc<AtomicUsize>);

    impl ThreadedTask for Marker {
        fn run(&mut self, _ctx: &mut TaskContext<'_>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fires_exactly_once_across_threads() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let tracker = DependencyTracker::with_count(3);
            let fired = Arc::new(AtomicUsize::new(0));
            tracker.push_continuation(Box::new(Marker(fired.clone())));

            let released = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..3)
                .map(|_| {
                    let tracker = tracker.clone();
                    let released = released.clone();
                    let delay = Duration::from_micros(rng.gen_range(0..200));
                    std::thread::spawn(move || {
                        std::thread::sleep(delay);
                        let out = tracker.complete();
                        released.fetch_add(out.len(), Ordering::SeqCst);
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(released.load(Ordering::SeqCst), 1);
            assert!(tracker.is_complete());
        }
    }

    #[test]
    fn park_after_dependencies_resolve_fires_immediately() {
        let tracker = DependencyTracker::new();
        tracker.add_dependency();
        assert!(tracker.complete().is_empty());

        let fired = Arc::new(AtomicUsize::new(0));
        let out = tracker.park(Box::new(Marker(fired)));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn abort_is_sticky() {
        let tracker = DependencyTracker::new();
        tracker.add_dependency();
        tracker.abort();
        let _ = tracker.complete();
        assert!(tracker.is_aborted());
    }

    #[test]
    #[should_panic]
    fn underflow_panics() {
        let tracker = DependencyTracker::new();
        let _ = tracker.complete();
        let _ = tracker.complete();
    }
}
