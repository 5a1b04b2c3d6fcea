// src/tasks/runner.rs
//
// Fixed pool of worker threads pulling from one prioritized list.
//
// Producers push into `staged`, which workers move into the main list when
// they can grab it without waiting. Priorities are cached and refreshed on a
// period, the main list is kept sorted with the best task at the back.
// Postponed tasks go to a FIFO `spinning` list, one of which is retried per
// worker iteration next to the prioritized picks.
//
// Finished and cancelled tasks land in a channel drained by the owner with
// `dequeue_completed`, which is where `apply_result` runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::config::{self, RunnerConfig};
use crate::error::RunnerError;

use super::buffered::BufferedTaskScheduler;
use super::priority::TaskPriority;
use super::task::{BoxedTask, TaskContext, TaskStatus};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Running = 0,
    Picking = 1,
    Waiting = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Running,
            1 => WorkerState::Picking,
            2 => WorkerState::Waiting,
            _ => WorkerState::Stopped,
        }
    }
}

struct TaskItem {
    task: BoxedTask,
    exclusive: bool,
    priority: TaskPriority,
    cancelled: bool,
}

impl TaskItem {
    fn new(task: BoxedTask, exclusive: bool) -> Self {
        // Priority first, it may decide cancellation.
        let priority = task.priority();
        let cancelled = task.is_cancelled();
        Self { task, exclusive, priority, cancelled }
    }
}

struct Queues {
    // Sorted by cached priority, best at the back.
    tasks: Vec<TaskItem>,
    spinning: VecDeque<TaskItem>,
    // Swapped with `staged` so staged tasks are evaluated outside its lock.
    incoming: Vec<(BoxedTask, bool)>,
    last_refresh: Instant,
    needs_sort: bool,
}

struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self { permits: Mutex::new(0), cv: Condvar::new() }
    }

    fn post(&self, n: usize) {
        if n == 0 {
            return;
        }
        *self.permits.lock() += n;
        if n == 1 {
            self.cv.notify_one();
        } else {
            self.cv.notify_all();
        }
    }

    fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cv.wait(&mut permits);
        }
        *permits -= 1;
    }
}

struct WorkerDebug {
    state: AtomicU8,
    task_name: Mutex<&'static str>,
}

impl WorkerDebug {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Picking as u8),
            task_name: Mutex::new(""),
        }
    }

    #[inline]
    fn set_state(&self, s: WorkerState) {
        self.state.store(s as u8, Ordering::Release);
    }
}

struct Shared {
    config: RunnerConfig,

    staged: Mutex<Vec<(BoxedTask, bool)>>,
    queues: Mutex<Queues>,
    semaphore: Semaphore,
    completed_tx: Sender<BoxedTask>,

    exclusive_running: AtomicBool,
    stop: AtomicBool,

    // Tasks enqueued but not yet completed or taken out. Zero means drained.
    outstanding: AtomicUsize,

    // Debug counters.
    received: AtomicU64,
    completed: AtomicU64,
    taken_out: AtomicU64,

    workers: Vec<WorkerDebug>,
}

impl Shared {
    fn push_completed(&self, task: BoxedTask) {
        // Receiver lives as long as the runner, which outlives the workers.
        let _ = self.completed_tx.send(task);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Fills `picked`. Returns true if tasks exist that could not be picked
    /// right now.
    fn pick(&self, picked: &mut Vec<TaskItem>) -> bool {
        let mut queues = self.queues.lock();
        let q = &mut *queues;

        let staged_busy = match self.staged.try_lock() {
            Some(mut staged) => {
                std::mem::swap(&mut *staged, &mut q.incoming);
                false
            }
            None => true,
        };
        if !q.incoming.is_empty() {
            for (task, exclusive) in q.incoming.drain(..) {
                q.tasks.push(TaskItem::new(task, exclusive));
            }
            q.needs_sort = true;
        }

        let now = Instant::now();
        if now.duration_since(q.last_refresh) >= self.config.priority_update_period {
            q.last_refresh = now;
            for item in q.tasks.iter_mut() {
                item.priority = item.task.priority();
                item.cancelled = item.task.is_cancelled();
            }
            q.needs_sort = true;
        }

        if q.needs_sort {
            let mut i = 0;
            while i < q.tasks.len() {
                if q.tasks[i].cancelled {
                    let item = q.tasks.swap_remove(i);
                    self.push_completed(item.task);
                } else {
                    i += 1;
                }
            }
            q.tasks.sort_by_key(|t| t.priority);
            q.needs_sort = false;
        }

        let mut exclusive_taken = self.exclusive_running.load(Ordering::Acquire);

        for _ in 0..self.config.batch_count {
            let Some(i) = q.tasks.iter().rposition(|t| !(t.exclusive && exclusive_taken)) else {
                break;
            };
            let item = q.tasks.remove(i);
            if item.exclusive {
                exclusive_taken = true;
                self.exclusive_running.store(true, Ordering::Release);
            }
            picked.push(item);
        }

        // Plus one postponed task, so they neither starve nor hog the workers.
        if let Some(i) = q.spinning.iter().position(|t| !(t.exclusive && exclusive_taken)) {
            if let Some(item) = q.spinning.remove(i) {
                if item.task.is_cancelled() {
                    self.push_completed(item.task);
                } else {
                    if item.exclusive {
                        self.exclusive_running.store(true, Ordering::Release);
                    }
                    picked.push(item);
                }
            }
        }

        staged_busy || !q.tasks.is_empty() || !q.spinning.is_empty()
    }

    fn run_item(
        &self,
        mut item: TaskItem,
        thread_index: usize,
        spawner: &TaskSpawner,
        scheduler: &mut BufferedTaskScheduler,
    ) {
        if item.task.is_cancelled() {
            // Cancelled since it was picked.
            if item.exclusive {
                self.exclusive_running.store(false, Ordering::Release);
            }
            self.push_completed(item.task);
            return;
        }

        let debug = &self.workers[thread_index];
        *debug.task_name.lock() = item.task.debug_name();

        let (status, tracker) = {
            let mut ctx = TaskContext::new(thread_index, item.priority, scheduler);
            item.task.run(&mut ctx);
            ctx.finish()
        };

        if item.exclusive {
            self.exclusive_running.store(false, Ordering::Release);
        }

        // Spawned work becomes outstanding before this task stops being so.
        scheduler.flush(spawner);

        match status {
            TaskStatus::Complete => self.push_completed(item.task),
            TaskStatus::Postponed => {
                self.queues.lock().spinning.push_back(item);
            }
            TaskStatus::TakenOut => {
                let Some(tracker) = tracker else {
                    panic!("task {} taken out without a tracker", item.task.debug_name());
                };
                let ready = tracker.park(item.task);
                if !ready.is_empty() {
                    spawner.enqueue_batch(ready, false);
                }
                self.taken_out.fetch_add(1, Ordering::Relaxed);
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
            }
        }

        *debug.task_name.lock() = "";
    }
}

fn worker_main(shared: Arc<Shared>, index: usize) {
    let spawner = TaskSpawner { shared: shared.clone() };
    let mut scheduler = BufferedTaskScheduler::new();
    let mut picked = Vec::with_capacity(shared.config.batch_count + 1);
    let debug = &shared.workers[index];

    while !shared.stop.load(Ordering::Acquire) {
        debug.set_state(WorkerState::Picking);
        let blocked = shared.pick(&mut picked);

        if picked.is_empty() {
            if blocked {
                // Remaining tasks are all waiting on the exclusive slot.
                std::thread::sleep(config::BLOCKED_PICK_SLEEP);
            } else {
                debug.set_state(WorkerState::Waiting);
                shared.semaphore.wait();
            }
            continue;
        }

        debug.set_state(WorkerState::Running);
        for item in picked.drain(..) {
            shared.run_item(item, index, &spawner, &mut scheduler);
        }
    }

    debug.set_state(WorkerState::Stopped);
}

/// Cheap handle for submitting tasks from any thread.
#[derive(Clone)]
pub struct TaskSpawner {
    shared: Arc<Shared>,
}

impl TaskSpawner {
    pub fn enqueue(&self, task: BoxedTask, exclusive: bool) {
        let s = &self.shared;
        s.outstanding.fetch_add(1, Ordering::AcqRel);
        s.received.fetch_add(1, Ordering::Relaxed);
        s.staged.lock().push((task, exclusive));
        s.semaphore.post(1);
    }

    pub fn enqueue_batch(&self, tasks: impl IntoIterator<Item = BoxedTask>, exclusive: bool) {
        let s = &self.shared;
        let mut staged = s.staged.lock();
        let before = staged.len();
        staged.extend(tasks.into_iter().map(|t| (t, exclusive)));
        let n = staged.len() - before;
        // Counted before the lock is released, workers can't see them yet.
        s.outstanding.fetch_add(n, Ordering::AcqRel);
        s.received.fetch_add(n as u64, Ordering::Relaxed);
        drop(staged);
        s.semaphore.post(n);
    }
}

pub struct ThreadedTaskRunner {
    shared: Arc<Shared>,
    completed_rx: Receiver<BoxedTask>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadedTaskRunner {
    pub fn new(config: RunnerConfig) -> Result<Self, RunnerError> {
        config.validate()?;

        let (completed_tx, completed_rx) = unbounded();
        let thread_count = config.thread_count;

        let shared = Arc::new(Shared {
            staged: Mutex::new(Vec::new()),
            queues: Mutex::new(Queues {
                tasks: Vec::new(),
                spinning: VecDeque::new(),
                incoming: Vec::new(),
                last_refresh: Instant::now(),
                needs_sort: false,
            }),
            semaphore: Semaphore::new(),
            completed_tx,
            exclusive_running: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            received: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            taken_out: AtomicU64::new(0),
            workers: (0..thread_count).map(|_| WorkerDebug::new()).collect(),
            config,
        });

        let mut runner = Self {
            shared,
            completed_rx,
            threads: Vec::with_capacity(thread_count),
        };

        for index in 0..thread_count {
            let shared = runner.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{} {}", shared.config.name, index))
                .spawn(move || worker_main(shared, index))
                // Dropping `runner` stops the threads already started.
                .map_err(|source| RunnerError::SpawnThread { index, source })?;
            runner.threads.push(handle);
        }

        log::debug!(
            "task runner '{}' started with {} threads",
            runner.shared.config.name,
            thread_count
        );
        Ok(runner)
    }

    pub fn spawner(&self) -> TaskSpawner {
        TaskSpawner { shared: self.shared.clone() }
    }

    #[inline]
    pub fn enqueue(&self, task: BoxedTask, exclusive: bool) {
        self.spawner().enqueue(task, exclusive);
    }

    pub fn enqueue_batch(&self, tasks: impl IntoIterator<Item = BoxedTask>, exclusive: bool) {
        self.spawner().enqueue_batch(tasks, exclusive);
    }

    /// Runs `apply_result` on every completed task, then hands it to `visit`.
    /// Returns how many tasks were drained.
    pub fn dequeue_completed(&self, mut visit: impl FnMut(BoxedTask)) -> usize {
        let mut n = 0;
        for mut task in self.completed_rx.try_iter() {
            task.apply_result();
            visit(task);
            n += 1;
        }
        n
    }

    /// Blocks until every enqueued task completed or was taken out and no
    /// worker is still running. Tasks resumed by a tracker while waiting are
    /// waited for too.
    pub fn wait_for_all(&self) {
        let start = Instant::now();
        let mut warned = false;
        while self.shared.outstanding.load(Ordering::Acquire) > 0 || self.any_worker_running() {
            if !warned && start.elapsed() > config::SUSPICIOUS_WAIT {
                log::warn!(
                    "'{}' still has {} outstanding tasks after {:?}",
                    self.shared.config.name,
                    self.shared.outstanding.load(Ordering::Relaxed),
                    config::SUSPICIOUS_WAIT
                );
                warned = true;
            }
            std::thread::sleep(config::WAIT_POLL_INTERVAL);
        }
    }

    fn any_worker_running(&self) -> bool {
        self.shared
            .workers
            .iter()
            .any(|w| WorkerState::from_u8(w.state.load(Ordering::Acquire)) == WorkerState::Running)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn debug_worker_state(&self, index: usize) -> WorkerState {
        WorkerState::from_u8(self.shared.workers[index].state.load(Ordering::Relaxed))
    }

    /// Empty when the worker is not running anything.
    pub fn debug_worker_task_name(&self, index: usize) -> &'static str {
        *self.shared.workers[index].task_name.lock()
    }

    pub fn debug_received_tasks(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    pub fn debug_completed_tasks(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn debug_taken_out_tasks(&self) -> u64 {
        self.shared.taken_out.load(Ordering::Relaxed)
    }

    /// Best effort, counters are read independently.
    pub fn debug_remaining_tasks(&self) -> u64 {
        self.debug_received_tasks()
            .saturating_sub(self.debug_completed_tasks())
            .saturating_sub(self.debug_taken_out_tasks())
    }
}

impl Drop for ThreadedTaskRunner {
    fn drop(&mut self) {
        let s = &self.shared;
        s.stop.store(true, Ordering::Release);
        s.semaphore.post(self.threads.len());

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("a worker of '{}' panicked", s.config.name);
            }
        }

        let staged = std::mem::take(&mut *s.staged.lock());
        if !staged.is_empty() {
            log::error!("'{}' dropped with {} staged tasks", s.config.name, staged.len());
        }
        let mut queues = s.queues.lock();
        if !queues.tasks.is_empty() {
            log::error!("'{}' dropped with {} pending tasks", s.config.name, queues.tasks.len());
        }
        if !queues.spinning.is_empty() {
            log::error!(
                "'{}' dropped with {} postponed tasks",
                s.config.name,
                queues.spinning.len()
            );
        }
        queues.tasks.clear();
        queues.spinning.clear();
        drop(queues);

        let completed = self.completed_rx.try_iter().count();
        if completed > 0 {
            log::error!("'{}' dropped with {} undrained completed tasks", s.config.name, completed);
        }
    }
}
