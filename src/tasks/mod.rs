// src/tasks/mod.rs
pub mod buffered;
pub mod priority;
pub mod runner;
pub mod task;
pub mod tracker;

pub use buffered::BufferedTaskScheduler;
pub use priority::TaskPriority;
pub use runner::{TaskSpawner, ThreadedTaskRunner, WorkerState};
pub use task::{BoxedTask, TaskContext, TaskStatus, ThreadedTask};
pub use tracker::DependencyTracker;
