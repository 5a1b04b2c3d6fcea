// src/config.rs
// -------------
// Global knobs for the task runner + multipass generation.

use std::time::Duration;

use crate::error::ConfigError;

// Hard cap on worker threads per runner.
pub const MAX_THREADS: usize = 16;

pub const DEFAULT_THREAD_COUNT: usize = 4;

// Priorities are cached and only re-evaluated this often, because polling them on
// every pick gets expensive with thousands of queued tasks.
pub const DEFAULT_PRIORITY_UPDATE_PERIOD: Duration = Duration::from_millis(32);

// How many tasks a worker takes from the prioritized list per iteration.
pub const DEFAULT_BATCH_COUNT: usize = 1;

// Sleep used when tasks exist but none can be picked (all exclusive, one running).
pub const BLOCKED_PICK_SLEEP: Duration = Duration::from_micros(1000);

// Polling interval of `wait_for_all`.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_micros(2000);

// Draining longer than this prints a warning once.
pub const SUSPICIOUS_WAIT: Duration = Duration::from_secs(10);

// -----------------------------------------------------------------------------
// Multipass
// -----------------------------------------------------------------------------
//
// Pass limit is low on purpose: every extra pass grows the loaded area around
// viewers quadratically.

pub const MAX_PASSES: usize = 4;
pub const MAX_PASS_EXTENT: i32 = 2;

// 1 subpass for pass 0, 2 for every other pass.
pub const MAX_SUBPASSES: usize = MAX_PASSES * 2 - 1;

// Sane safety maximum for column height, in blocks.
pub const MAX_COLUMN_HEIGHT_BLOCKS: i32 = 32;

pub const DEFAULT_COLUMN_BASE_Y_BLOCKS: i32 = -4;
pub const DEFAULT_COLUMN_HEIGHT_BLOCKS: i32 = 8;
pub const DEFAULT_BLOCK_SIZE: u32 = 16;

// Priority bands
pub const TASK_PRIORITY_BAND3_DEFAULT: u8 = 10;
pub const TASK_PRIORITY_GENERATE_BAND2: u8 = 10;
pub const TASK_PRIORITY_COLUMN_BAND2: u8 = 11;

/// Runtime settings of a `ThreadedTaskRunner`.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Prefix of worker thread names, shows up in debuggers and profilers.
    pub name: String,
    pub thread_count: usize,
    pub priority_update_period: Duration,
    pub batch_count: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: String::from("tasks"),
            thread_count: DEFAULT_THREAD_COUNT,
            priority_update_period: DEFAULT_PRIORITY_UPDATE_PERIOD,
            batch_count: DEFAULT_BATCH_COUNT,
        }
    }
}

impl RunnerConfig {
    pub fn with_threads(name: &str, thread_count: usize) -> Self {
        Self {
            name: name.to_owned(),
            thread_count,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == 0 || self.thread_count > MAX_THREADS {
            return Err(ConfigError::ThreadCount {
                count: self.thread_count,
                max: MAX_THREADS,
            });
        }
        if self.batch_count == 0 {
            return Err(ConfigError::BatchCount);
        }
        Ok(())
    }
}
