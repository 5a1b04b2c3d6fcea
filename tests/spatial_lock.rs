// tests/spatial_lock.rs
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};

use glam::{IVec2, IVec3};
use rand::Rng;

use multipass_scheduler::thread::{SpatialLock2D, SpatialLock3D};
use multipass_scheduler::{Box2i, Box3i};

fn random_box(rng: &mut impl Rng) -> Box2i {
    Box2i::new(
        IVec2::new(rng.gen_range(-8..8), rng.gen_range(-8..8)),
        IVec2::new(rng.gen_range(1..5), rng.gen_range(1..5)),
    )
}

#[test]
fn concurrent_try_write_is_mutually_exclusive() {
    let lock = Arc::new(SpatialLock2D::new());
    let mut rng = rand::thread_rng();

    for _ in 0..300 {
        let boxes = [random_box(&mut rng), random_box(&mut rng)];
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = boxes
            .iter()
            .map(|&b| {
                let lock = lock.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let guard = lock.try_write(b);
                    let ok = guard.is_some();
                    // Both attempts are made before either releases.
                    barrier.wait();
                    drop(guard);
                    ok
                })
            })
            .collect();

        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        if boxes[0].intersects(&boxes[1]) {
            assert!(!(results[0] && results[1]), "{:?} and {:?} both locked", boxes[0], boxes[1]);
        } else {
            assert!(results[0] && results[1], "{:?} and {:?} are disjoint", boxes[0], boxes[1]);
        }
        assert_eq!(lock.locked_boxes_count(), 0);
    }
}

#[test]
fn readers_coexist_across_threads() {
    let lock = Arc::new(SpatialLock3D::new());
    let area = Box3i::new(IVec3::ZERO, IVec3::splat(4));
    let barrier = Arc::new(Barrier::new(3));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let lock = lock.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let guard = lock.try_read(area);
                barrier.wait();
                guard.is_some()
            })
        })
        .collect();

    for h in handles {
        assert!(h.join().unwrap());
    }
}

// Unsynchronized read-modify-write on cells. Any overlap between two
// holders would lose increments.
#[test]
fn blocking_write_protects_cell_updates() {
    const SIZE: i32 = 8;
    const THREADS: usize = 4;
    const ITERATIONS: usize = 400;

    let lock = Arc::new(SpatialLock2D::new());
    let cells: Arc<Vec<AtomicU32>> = Arc::new((0..SIZE * SIZE).map(|_| AtomicU32::new(0)).collect());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let lock = lock.clone();
            let cells = cells.clone();
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..ITERATIONS {
                    let center = IVec2::new(rng.gen_range(1..SIZE - 1), rng.gen_range(1..SIZE - 1));
                    let area = Box2i::from_position(center).padded(1);
                    let _guard = lock.write(area);
                    area.for_each_cell_yx(|p| {
                        let cell = &cells[(p.x + p.y * SIZE) as usize];
                        let v = cell.load(Ordering::Relaxed);
                        std::thread::yield_now();
                        cell.store(v + 1, Ordering::Relaxed);
                    });
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let total: u32 = cells.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    assert_eq!(total as usize, THREADS * ITERATIONS * 9);
    assert_eq!(lock.locked_boxes_count(), 0);
}
