// src/thread/spatial_lock.rs
//
// Locking a large sparse grid one region at a time, instead of putting a
// RwLock on every cell. Regions are boxes in the grid's own coordinate space.
//
// `try_*` variants are for worker threads: they postpone their task instead
// of blocking. Blocking variants are for producer threads and tests.
//
// A thread must not hold more than one region at once. Two threads each
// holding one region and blocking on the other's would deadlock.
//
// Blocking requests take precedence: while one waits, `try_*` requests
// intersecting it fail, so a producer is not starved by workers retrying.

use std::fmt;
#[cfg(debug_assertions)]
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::math::{Box2i, Box3i};

pub trait LockRegion: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    fn intersects(&self, other: &Self) -> bool;
}

impl LockRegion for Box2i {
    #[inline]
    fn intersects(&self, other: &Self) -> bool {
        Box2i::intersects(self, other)
    }
}

impl LockRegion for Box3i {
    #[inline]
    fn intersects(&self, other: &Self) -> bool {
        Box3i::intersects(self, other)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug)]
struct LockedBox<R> {
    region: R,
    mode: LockMode,
    #[cfg(debug_assertions)]
    thread: ThreadId,
}

struct State<R> {
    held: Vec<LockedBox<R>>,
    // Blocking requests not granted yet.
    waiting: Vec<(R, LockMode)>,
}

#[inline]
fn conflicts(a: LockMode, b: LockMode) -> bool {
    a == LockMode::Write || b == LockMode::Write
}

pub struct SpatialLock<R: LockRegion> {
    // Held only to look up, add or remove boxes. The long-lived locks are the boxes.
    state: Mutex<State<R>>,
    // Notified every time a box is released so blocked callers can retry.
    released: Condvar,
}

pub type SpatialLock2D = SpatialLock<Box2i>;
pub type SpatialLock3D = SpatialLock<Box3i>;

impl<R: LockRegion> Default for SpatialLock<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: LockRegion> SpatialLock<R> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                held: Vec::new(),
                waiting: Vec::new(),
            }),
            released: Condvar::new(),
        }
    }

    fn can_lock(held: &[LockedBox<R>], region: &R, mode: LockMode) -> bool {
        #[cfg(debug_assertions)]
        let current = thread::current().id();

        for existing in held {
            #[cfg(debug_assertions)]
            assert!(
                existing.thread != current,
                "locking two areas from the same thread is not allowed ({:?} then {:?})",
                existing.region,
                region
            );

            // Readers only conflict with writers.
            if conflicts(mode, existing.mode) && existing.region.intersects(region) {
                return false;
            }
        }
        true
    }

    fn push(held: &mut Vec<LockedBox<R>>, region: R, mode: LockMode) {
        held.push(LockedBox {
            region,
            mode,
            #[cfg(debug_assertions)]
            thread: thread::current().id(),
        });
    }

    pub fn try_lock(&self, region: R, mode: LockMode) -> bool {
        let mut state = self.state.lock();
        let behind_waiter = state
            .waiting
            .iter()
            .any(|(r, m)| conflicts(mode, *m) && r.intersects(&region));
        if !behind_waiter && Self::can_lock(&state.held, &region, mode) {
            Self::push(&mut state.held, region, mode);
            true
        } else {
            false
        }
    }

    pub fn lock(&self, region: R, mode: LockMode) {
        let mut state = self.state.lock();
        if !Self::can_lock(&state.held, &region, mode) {
            state.waiting.push((region, mode));
            while !Self::can_lock(&state.held, &region, mode) {
                self.released.wait(&mut state);
            }
            if let Some(i) = state.waiting.iter().position(|w| *w == (region, mode)) {
                state.waiting.swap_remove(i);
            }
        }
        Self::push(&mut state.held, region, mode);
    }

    /// Releases a region previously acquired with the same mode.
    ///
    /// Panics if no such region is held.
    pub fn unlock(&self, region: R, mode: LockMode) {
        {
            let mut state = self.state.lock();
            let i = state
                .held
                .iter()
                .position(|b| b.region == region && b.mode == mode);
            match i {
                Some(i) => {
                    state.held.swap_remove(i);
                }
                None => panic!("unlocking {:?} ({:?}) which is not locked", region, mode),
            }
        }
        self.released.notify_all();
    }

    pub fn try_read(&self, region: R) -> Option<SpatialLockGuard<'_, R>> {
        self.try_lock(region, LockMode::Read)
            .then(|| SpatialLockGuard::adopt(self, region, LockMode::Read))
    }

    pub fn try_write(&self, region: R) -> Option<SpatialLockGuard<'_, R>> {
        self.try_lock(region, LockMode::Write)
            .then(|| SpatialLockGuard::adopt(self, region, LockMode::Write))
    }

    pub fn read(&self, region: R) -> SpatialLockGuard<'_, R> {
        self.lock(region, LockMode::Read);
        SpatialLockGuard::adopt(self, region, LockMode::Read)
    }

    pub fn write(&self, region: R) -> SpatialLockGuard<'_, R> {
        self.lock(region, LockMode::Write);
        SpatialLockGuard::adopt(self, region, LockMode::Write)
    }

    pub fn locked_boxes_count(&self) -> usize {
        self.state.lock().held.len()
    }
}

/// Releases its region when dropped.
#[must_use = "the region is released as soon as the guard is dropped"]
pub struct SpatialLockGuard<'a, R: LockRegion> {
    lock: &'a SpatialLock<R>,
    region: R,
    mode: LockMode,
}

impl<'a, R: LockRegion> SpatialLockGuard<'a, R> {
    /// Takes responsibility for a region already acquired through `try_lock` or `lock`.
    pub fn adopt(lock: &'a SpatialLock<R>, region: R, mode: LockMode) -> Self {
        Self { lock, region, mode }
    }

    #[inline]
    pub fn region(&self) -> R {
        self.region
    }

    #[inline]
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl<R: LockRegion> Drop for SpatialLockGuard<'_, R> {
    fn drop(&mut self) {
        self.lock.unlock(self.region, self.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec2;
    use std::sync::Arc;

    fn b(x: i32, y: i32, w: i32, h: i32) -> Box2i {
        Box2i::new(IVec2::new(x, y), IVec2::new(w, h))
    }

    #[test]
    fn readers_share_writers_exclude() {
        let lock = Arc::new(SpatialLock2D::new());
        let _r = lock.read(b(0, 0, 4, 4));

        // Other threads, since one thread may only hold one region.
        let l = lock.clone();
        std::thread::spawn(move || {
            assert!(l.try_read(b(2, 2, 4, 4)).is_some());
            assert!(l.try_write(b(2, 2, 4, 4)).is_none());
            assert!(l.try_write(b(4, 4, 4, 4)).is_some());
        })
        .join()
        .unwrap();

        assert_eq!(lock.locked_boxes_count(), 1);
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = SpatialLock2D::new();
        {
            let g = lock.try_write(b(0, 0, 1, 1)).expect("free");
            assert_eq!(g.mode(), LockMode::Write);
            assert_eq!(lock.locked_boxes_count(), 1);
        }
        assert_eq!(lock.locked_boxes_count(), 0);
        assert!(lock.try_lock(b(0, 0, 1, 1), LockMode::Write));
        lock.unlock(b(0, 0, 1, 1), LockMode::Write);
    }

    #[test]
    #[should_panic]
    fn unlocking_unheld_region_panics() {
        let lock = SpatialLock2D::new();
        lock.unlock(b(0, 0, 1, 1), LockMode::Write);
    }

    #[test]
    fn blocking_write_waits_for_release() {
        let lock = Arc::new(SpatialLock2D::new());
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);

        let l = lock.clone();
        let holder = std::thread::spawn(move || {
            let _g = l.write(b(0, 0, 3, 3));
            tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        });

        rx.recv().unwrap();
        let g = lock.write(b(1, 1, 1, 1));
        assert_eq!(g.region(), b(1, 1, 1, 1));
        drop(g);
        holder.join().unwrap();
        assert_eq!(lock.locked_boxes_count(), 0);
    }
}
