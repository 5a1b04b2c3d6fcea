// src/thread/mod.rs
pub mod spatial_lock;

pub use spatial_lock::{
    LockMode, LockRegion, SpatialLock, SpatialLock2D, SpatialLock3D, SpatialLockGuard,
};
