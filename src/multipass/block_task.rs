// src/multipass/block_task.rs
//
// Top-level request for one block. Brings its column to the final subpass
// (or waits for whoever is already doing it), then copies the block out.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use glam::{IVec2, IVec3};

use crate::config;
use crate::math::Box2i;
use crate::tasks::{DependencyTracker, TaskContext, TaskPriority, ThreadedTask};

use super::column_task::GenerateColumnTask;
use super::generator::PassGenerator;
use super::priority::PriorityDependency;
use super::structs::{subpass_bit, Internal};

#[derive(Clone, Debug, PartialEq)]
pub enum BlockOutcome<B> {
    Generated(B),
    /// Dropped before running: too far, token cancelled, stale generator
    /// state, or another request for the same block was already waiting.
    Cancelled,
    /// Part of the neighborhood got unloaded while the block was generating.
    Aborted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BlockOutput<B> {
    pub position: IVec3,
    pub lod_index: u8,
    pub outcome: BlockOutcome<B>,
}

impl<B> BlockOutput<B> {
    #[inline]
    pub fn is_generated(&self) -> bool {
        matches!(self.outcome, BlockOutcome::Generated(_))
    }
}

pub struct BlockTaskParams<B> {
    pub block_position: IVec3,
    pub lod_index: u8,
    pub priority_dependency: Option<PriorityDependency>,
    pub drop_beyond_max_distance: bool,
    pub cancellation_token: Option<Arc<AtomicBool>>,
    /// Receives the result when the task is drained from the runner.
    pub output: Sender<BlockOutput<B>>,
}

impl<B> BlockTaskParams<B> {
    pub fn new(block_position: IVec3, output: Sender<BlockOutput<B>>) -> Self {
        Self {
            block_position,
            lod_index: 0,
            priority_dependency: None,
            drop_beyond_max_distance: true,
            cancellation_token: None,
            output,
        }
    }
}

pub struct GenerateBlockTask<G: PassGenerator> {
    position: IVec3,
    lod_index: u8,
    internal: Arc<Internal<G::Block>>,
    generator: Arc<G>,
    priority_dependency: Option<PriorityDependency>,
    drop_beyond_max_distance: bool,
    cancellation_token: Option<Arc<AtomicBool>>,
    output: Sender<BlockOutput<G::Block>>,

    // Updated by `priority`, read by `is_cancelled`.
    too_far: Cell<bool>,
    // Set while taken out, waiting for the column.
    waiting_on: Option<Arc<DependencyTracker>>,
    outcome: Option<BlockOutcome<G::Block>>,
}

impl<G: PassGenerator> GenerateBlockTask<G> {
    pub(crate) fn new(params: BlockTaskParams<G::Block>, internal: Arc<Internal<G::Block>>, generator: Arc<G>) -> Self {
        Self {
            position: params.block_position,
            lod_index: params.lod_index,
            internal,
            generator,
            priority_dependency: params.priority_dependency,
            drop_beyond_max_distance: params.drop_beyond_max_distance,
            cancellation_token: params.cancellation_token,
            output: params.output,
            too_far: Cell::new(false),
            waiting_on: None,
            outcome: None,
        }
    }

    #[inline]
    pub fn position(&self) -> IVec3 {
        self.position
    }
}

impl<G: PassGenerator> ThreadedTask for GenerateBlockTask<G> {
    fn run(&mut self, ctx: &mut TaskContext<'_>) {
        let internal = self.internal.clone();
        let params = &internal.params;
        let map = &internal.map;

        if internal.is_expired() {
            self.outcome = Some(BlockOutcome::Cancelled);
            return;
        }

        if !params.contains_block_y(self.position.y) {
            // Outside columns, single pass.
            let voxels = self.generator.generate_block_fallback(self.position, params.block_size);
            self.outcome = Some(BlockOutcome::Generated(voxels));
            return;
        }

        let column_position = IVec2::new(self.position.x, self.position.z);
        let Some(_region) = map.spatial_lock.try_write(Box2i::from_position(column_position)) else {
            ctx.postpone();
            return;
        };
        let resumed = self.waiting_on.take().is_some();

        let Some(column) = map.get(column_position) else {
            log::trace!("block {:?}: column not loaded", self.position);
            self.outcome = Some(BlockOutcome::Aborted);
            return;
        };
        let mut column = column.lock();

        let final_subpass = params.final_subpass_index();
        let block_index = (self.position.y - params.column_base_y_blocks) as usize;

        if i32::from(column.subpass_index) == final_subpass as i32 {
            let voxels = match &column.blocks[block_index].voxels {
                Some(voxels) => voxels.clone(),
                None => panic!("final column {:?} has no block {}", column_position, block_index),
            };
            self.outcome = Some(BlockOutcome::Generated(voxels));
            return;
        }

        if resumed {
            // Came back without the column being finished: the chain aborted.
            self.outcome = Some(BlockOutcome::Aborted);
            return;
        }

        if column.blocks[block_index].final_pending.is_some() {
            // Another request for this block is already waiting, it gets the result.
            log::debug!("block {:?} requested while already pending", self.position);
            self.outcome = Some(BlockOutcome::Cancelled);
            return;
        }

        let tracker = DependencyTracker::new();
        // Released by the column once final.
        tracker.add_dependency();

        if column.pending_mask & subpass_bit(final_subpass) == 0 {
            column.pending_mask |= subpass_bit(final_subpass);
            let priority = ctx.priority;
            ctx.scheduler().push_main_task(Box::new(GenerateColumnTask::new(
                column_position,
                final_subpass,
                internal.clone(),
                self.generator.clone(),
                priority,
                tracker.clone(),
            )));
        } else {
            // A column task is underway, wait for its result.
            column.blocks[block_index].final_pending = Some(tracker.clone());
        }

        self.waiting_on = Some(tracker.clone());
        ctx.take_out(tracker);
    }

    fn priority(&self) -> TaskPriority {
        match &self.priority_dependency {
            Some(dep) => {
                let (priority, closest_sq) = dep.evaluate(self.lod_index, config::TASK_PRIORITY_GENERATE_BAND2);
                self.too_far
                    .set(self.drop_beyond_max_distance && closest_sq > dep.drop_distance_squared);
                priority
            }
            None => TaskPriority {
                band3: config::TASK_PRIORITY_BAND3_DEFAULT,
                band2: config::TASK_PRIORITY_GENERATE_BAND2,
                band1: self.lod_index,
                band0: 0,
            },
        }
    }

    fn is_cancelled(&self) -> bool {
        if self.internal.is_expired() {
            return true;
        }
        if let Some(token) = &self.cancellation_token {
            return token.load(Ordering::Relaxed);
        }
        self.too_far.get()
    }

    fn apply_result(&mut self) {
        let outcome = self.outcome.take().unwrap_or(BlockOutcome::Cancelled);
        // The requester may have stopped listening.
        let _ = self.output.send(BlockOutput {
            position: self.position,
            lod_index: self.lod_index,
            outcome,
        });
    }

    fn debug_name(&self) -> &'static str {
        "generate block"
    }
}
