// src/lib.rs
//
// Prioritized task runner and the multipass generation scheduler built on it.

pub mod config;
pub mod error;
pub mod math;
pub mod multipass;
pub mod tasks;
pub mod thread;

pub use error::{ConfigError, RunnerError};
pub use math::{Box2i, Box3i};
pub use multipass::{BlockOutcome, BlockOutput, BlockTaskParams, MultipassGenerator, MultipassParams, PassGenerator, PassInput};
pub use tasks::{
    BoxedTask, BufferedTaskScheduler, DependencyTracker, TaskContext, TaskPriority, TaskSpawner, TaskStatus,
    ThreadedTask, ThreadedTaskRunner,
};
pub use thread::{LockMode, SpatialLock, SpatialLockGuard};
