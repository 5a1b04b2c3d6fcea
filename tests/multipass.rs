// tests/multipass.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use glam::{IVec2, IVec3, Vec3};
use parking_lot::Mutex;

use multipass_scheduler::config::RunnerConfig;
use multipass_scheduler::multipass::{DebugColumnState, PriorityDependency, SharedViewers};
use multipass_scheduler::{
    BlockOutcome, BlockOutput, BlockTaskParams, Box3i, ConfigError, MultipassGenerator, MultipassParams,
    PassGenerator, PassInput, ThreadedTaskRunner,
};

#[derive(Clone, Debug, PartialEq)]
struct TestBlock {
    position: IVec3,
    seed: i64,
    // How many pass 1 runs wrote into this block, from any column.
    touched: u32,
}

fn seed_of(p: IVec3) -> i64 {
    // Odd, so never mistaken for an untouched block.
    ((p.x as i64 * 73_856_093) ^ (p.y as i64 * 19_349_663) ^ (p.z as i64 * 83_492_791)) | 1
}

// Blocks the first pass 0 run on a column with the given X.
struct Hook {
    column_x: i32,
    armed: AtomicBool,
    entered: Sender<IVec2>,
    release: Receiver<()>,
}

#[derive(Default)]
struct TestGenerator {
    calls: Mutex<HashMap<(IVec2, usize), u32>>,
    hook: Option<Hook>,
}

impl TestGenerator {
    fn calls(&self) -> HashMap<(IVec2, usize), u32> {
        self.calls.lock().clone()
    }
}

impl PassGenerator for TestGenerator {
    type Block = TestBlock;

    fn create_block(&self, position: IVec3, _block_size: u32) -> TestBlock {
        TestBlock { position, seed: 0, touched: 0 }
    }

    fn generate_pass(&self, mut input: PassInput<'_, TestBlock>) {
        let main = IVec2::new(input.main_block_position.x, input.main_block_position.z);
        *self.calls.lock().entry((main, input.pass_index)).or_insert(0) += 1;

        if let Some(hook) = &self.hook {
            if input.pass_index == 0 && main.x == hook.column_x && hook.armed.swap(false, Ordering::SeqCst) {
                let _ = hook.entered.send(main);
                let _ = hook.release.recv_timeout(Duration::from_secs(10));
            }
        }

        match input.pass_index {
            0 => {
                for y in 0..input.grid_size.y {
                    let p = input.main_block_position + IVec3::new(0, y, 0);
                    if let Some(block) = input.get_mut(p) {
                        assert_eq!(block.position, p);
                        block.seed = seed_of(p);
                    }
                }
            }
            _ => {
                // Side effects on every neighbor.
                for block in input.grid.iter_mut() {
                    assert_ne!(block.seed, 0, "neighbor {:?} missed pass 0", block.position);
                    block.touched += 1;
                }
            }
        }
    }

    fn generate_block_fallback(&self, position: IVec3, _block_size: u32) -> TestBlock {
        TestBlock { position, seed: -1, touched: 0 }
    }
}

fn params() -> MultipassParams {
    let mut params = MultipassParams::with_extents(&[0, 1]);
    params.column_base_y_blocks = 0;
    params.column_height_blocks = 2;
    params.block_size = 4;
    params
}

fn setup(generator: TestGenerator) -> (ThreadedTaskRunner, MultipassGenerator<TestGenerator>) {
    let runner = ThreadedTaskRunner::new(RunnerConfig::with_threads("multipass", 4)).unwrap();
    let generator = MultipassGenerator::new(generator, params(), runner.spawner()).unwrap();
    (runner, generator)
}

fn drain(runner: &ThreadedTaskRunner, rx: &Receiver<BlockOutput<TestBlock>>) -> Vec<BlockOutput<TestBlock>> {
    runner.wait_for_all();
    runner.dequeue_completed(drop);
    rx.try_iter().collect()
}

fn states(generator: &MultipassGenerator<TestGenerator>) -> HashMap<IVec2, DebugColumnState> {
    generator
        .debug_try_get_column_states()
        .expect("no task should hold the cache once drained")
        .into_iter()
        .map(|s| (s.position, s))
        .collect()
}

fn one_block_box(p: IVec3) -> Box3i {
    Box3i::from_position(p)
}

fn empty_box() -> Box3i {
    Box3i::default()
}

#[test]
fn single_request_generates_dependencies_once() {
    let (runner, generator) = setup(TestGenerator::default());
    generator.process_viewer_diff(1, one_block_box(IVec3::ZERO), empty_box());
    assert_eq!(generator.debug_column_count(), 25);

    let (tx, rx) = unbounded();
    generator.request_block(BlockTaskParams::new(IVec3::new(0, 1, 0), tx));
    let outputs = drain(&runner, &rx);

    assert_eq!(outputs.len(), 1);
    match &outputs[0].outcome {
        BlockOutcome::Generated(block) => {
            assert_eq!(block.position, IVec3::new(0, 1, 0));
            assert_eq!(block.seed, seed_of(block.position));
            // Pass 1 ran on the 3x3 columns around it.
            assert_eq!(block.touched, 9);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let states = states(&generator);
    assert_eq!(states.len(), 25);
    assert_eq!(states[&IVec2::ZERO].subpass_index, 2);
    for s in states.values() {
        assert!(s.subpass_index >= 0, "column {:?} untouched", s.position);
        assert!(i32::max(s.position.x.abs(), s.position.y.abs()) <= 2);
        assert_eq!(s.pending_mask, 0);
        assert_eq!(s.waiting_blocks, 0);
        assert_eq!(s.viewers, 1);
    }

    let calls = generator.generator().calls();
    assert!(calls.values().all(|&n| n == 1), "{:?}", calls);
    assert_eq!(calls.keys().filter(|(_, pass)| *pass == 0).count(), 25);
    assert_eq!(calls.keys().filter(|(_, pass)| *pass == 1).count(), 9);
}

#[test]
fn many_requests_match_single_threaded_generation() {
    let (runner, generator) = setup(TestGenerator::default());
    let area = Box3i::new(IVec3::new(-1, 0, -1), IVec3::new(3, 2, 3));
    generator.process_viewer_diff(7, area, empty_box());

    let (tx, rx) = unbounded();
    for z in -1..=1 {
        for x in -1..=1 {
            for y in 0..2 {
                generator.request_block(BlockTaskParams::new(IVec3::new(x, y, z), tx.clone()));
            }
        }
    }
    let outputs = drain(&runner, &rx);
    assert_eq!(outputs.len(), 18);
    assert!(outputs.iter().all(BlockOutput::is_generated));

    let calls = generator.generator().calls();
    assert!(calls.values().all(|&n| n == 1), "{:?}", calls);

    let mut center: Vec<TestBlock> = outputs
        .into_iter()
        .filter(|o| o.position.x == 0 && o.position.z == 0)
        .filter_map(|o| match o.outcome {
            BlockOutcome::Generated(b) => Some(b),
            _ => None,
        })
        .collect();
    center.sort_by_key(|b| b.position.y);

    assert_eq!(center, generator.debug_generate_test_column(IVec2::ZERO));
}

#[test]
fn unloading_during_generation_aborts_the_request() {
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let test_generator = TestGenerator {
        hook: Some(Hook {
            column_x: 2,
            armed: AtomicBool::new(true),
            entered: entered_tx,
            release: release_rx,
        }),
        ..TestGenerator::default()
    };
    let (runner, generator) = setup(test_generator);

    let viewer_box = one_block_box(IVec3::ZERO);
    generator.process_viewer_diff(1, viewer_box, empty_box());

    let (tx, rx) = unbounded();
    generator.request_block(BlockTaskParams::new(IVec3::ZERO, tx));

    // The request can't finish while a column at x = 2 is stuck in pass 0.
    let stuck = entered_rx.recv_timeout(Duration::from_secs(10)).expect("hooked column never ran");
    assert_eq!(stuck.x, 2);

    // Move the viewer so columns x in [-2, 0] get unloaded, including the requested one.
    let moved = one_block_box(IVec3::new(3, 0, 0));
    generator.process_viewer_diff(1, moved, viewer_box);
    release_tx.send(()).unwrap();

    let outputs = drain(&runner, &rx);
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].outcome, BlockOutcome::Aborted);

    let states = states(&generator);
    assert_eq!(states.len(), 25);
    assert!(!states.contains_key(&IVec2::ZERO));
    for s in states.values() {
        assert!(s.position.x >= 1 && s.position.x <= 5);
        assert_eq!(s.pending_mask, 0, "column {:?} still has pending subpasses", s.position);
        assert_eq!(s.waiting_blocks, 0);
    }
}

#[test]
fn waiting_block_requests_are_released() {
    let (runner, generator) = setup(TestGenerator::default());
    generator.process_viewer_diff(1, one_block_box(IVec3::ZERO), empty_box());

    // Both blocks of one column: the second request waits on the first one's column work.
    let (tx, rx) = unbounded();
    generator.request_block(BlockTaskParams::new(IVec3::new(0, 0, 0), tx.clone()));
    generator.request_block(BlockTaskParams::new(IVec3::new(0, 1, 0), tx));

    let outputs = drain(&runner, &rx);
    assert_eq!(outputs.len(), 2);
    assert!(outputs.iter().all(BlockOutput::is_generated));
    assert!(states(&generator).values().all(|s| s.waiting_blocks == 0));
}

#[test]
fn cancelled_and_fallback_requests() {
    let (runner, generator) = setup(TestGenerator::default());
    generator.process_viewer_diff(1, one_block_box(IVec3::ZERO), empty_box());

    let (tx, rx) = unbounded();
    let mut cancelled = BlockTaskParams::new(IVec3::ZERO, tx.clone());
    cancelled.cancellation_token = Some(Arc::new(AtomicBool::new(true)));
    generator.request_block(cancelled);
    // Above the column range.
    generator.request_block(BlockTaskParams::new(IVec3::new(0, 5, 0), tx));

    let mut outputs = drain(&runner, &rx);
    outputs.sort_by_key(|o| o.position.y);
    assert_eq!(outputs[0].outcome, BlockOutcome::Cancelled);
    assert_eq!(
        outputs[1].outcome,
        BlockOutcome::Generated(TestBlock { position: IVec3::new(0, 5, 0), seed: -1, touched: 0 })
    );
    assert!(generator.generator().calls().is_empty());
}

#[test]
fn requests_beyond_drop_distance_never_generate() {
    let (runner, generator) = setup(TestGenerator::default());
    generator.process_viewer_diff(1, one_block_box(IVec3::ZERO), empty_box());

    let viewers: SharedViewers = Arc::new(parking_lot::RwLock::new(vec![Vec3::new(100_000.0, 0.0, 0.0)]));
    let (tx, rx) = unbounded();
    let mut far = BlockTaskParams::new(IVec3::ZERO, tx.clone());
    far.priority_dependency = Some(PriorityDependency::for_block(viewers.clone(), IVec3::ZERO, 4, 0, 32.0));
    generator.request_block(far);

    let outputs = drain(&runner, &rx);
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].outcome, BlockOutcome::Cancelled);
    assert!(generator.generator().calls().is_empty());

    // Same request with the viewer next to it goes through.
    viewers.write()[0] = Vec3::ZERO;
    let mut near = BlockTaskParams::new(IVec3::ZERO, tx);
    near.priority_dependency = Some(PriorityDependency::for_block(viewers, IVec3::ZERO, 4, 0, 32.0));
    generator.request_block(near);
    assert!(drain(&runner, &rx)[0].is_generated());
}

#[test]
fn viewers_drive_the_cache() {
    let (runner, generator) = setup(TestGenerator::default());
    generator.process_viewer_diff(1, one_block_box(IVec3::ZERO), empty_box());
    generator.process_viewer_diff(2, one_block_box(IVec3::new(1, 0, 0)), empty_box());
    // 5x5 and 5x5 shifted by one.
    assert_eq!(generator.debug_column_count(), 30);
    assert_eq!(states(&generator)[&IVec2::ZERO].viewers, 2);

    let (tx, rx) = unbounded();
    generator.request_block(BlockTaskParams::new(IVec3::ZERO, tx));
    assert!(drain(&runner, &rx)[0].is_generated());

    // A reset keeps viewers but drops generated state.
    generator.clear_cache();
    let states = states(&generator);
    assert_eq!(states.len(), 30);
    assert!(states.values().all(|s| s.subpass_index == -1));

    generator.unpair_viewer(2);
    assert_eq!(generator.debug_column_count(), 25);
    generator.unpair_viewer(1);
    assert_eq!(generator.debug_column_count(), 0);

    // Boxes outside the column range load nothing.
    generator.process_viewer_diff(3, one_block_box(IVec3::new(0, 10, 0)), empty_box());
    assert_eq!(generator.debug_column_count(), 0);
}

#[test]
fn parameter_changes_are_validated() {
    let (_runner, generator) = setup(TestGenerator::default());
    assert_eq!(generator.set_pass_extent_blocks(0, 1), Err(ConfigError::FirstPassExtent { extent: 1 }));
    assert!(matches!(generator.set_pass_count(5), Err(ConfigError::PassCount { count: 5, .. })));
    assert!(matches!(generator.pass_extent_blocks(3), Err(ConfigError::PassIndex { index: 3, count: 2 })));
    assert!(matches!(generator.set_column_height_blocks(100), Err(ConfigError::ColumnHeight { .. })));

    generator.process_viewer_diff(1, one_block_box(IVec3::ZERO), empty_box());
    generator.set_pass_count(3).unwrap();
    assert_eq!(generator.pass_extent_blocks(2), Ok(1));
    // Total extent is now 4, the viewer got re-applied with it.
    assert_eq!(generator.debug_column_count(), 81);
}
