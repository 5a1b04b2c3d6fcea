// src/error.rs
use thiserror::Error;

/// Rejected runner or generator parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("thread count {count} is out of range 1..={max}")]
    ThreadCount { count: usize, max: usize },

    #[error("batch count must be at least 1")]
    BatchCount,

    #[error("pass count {count} is out of range 1..={max}")]
    PassCount { count: usize, max: usize },

    #[error("pass index {index} does not exist (pass count is {count})")]
    PassIndex { index: usize, count: usize },

    #[error("the first pass cannot have dependency extents (got {extent})")]
    FirstPassExtent { extent: i32 },

    #[error("pass {index} extent {extent} is out of range 1..={max}")]
    PassExtent { index: usize, extent: i32, max: i32 },

    #[error("column height {height} is out of range 0..={max}")]
    ColumnHeight { height: i32, max: i32 },

    #[error("block size must be at least 1")]
    BlockSize,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn worker thread {index}")]
    SpawnThread {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}
