// src/multipass/column_task.rs
//
// Brings one column to a given subpass. Neighbors lagging behind get their
// own column task at the previous subpass and this one waits on them; the
// task runs the pass itself once the whole neighborhood is ready.

use std::sync::Arc;

use glam::{IVec2, IVec3};
use parking_lot::MutexGuard;

use crate::config;
use crate::math::{yx_index, Box2i};
use crate::tasks::{BufferedTaskScheduler, DependencyTracker, TaskContext, TaskPriority, ThreadedTask};

use super::generator::PassGenerator;
use super::structs::{pass_index_from_subpass, subpass_bit, Column, Internal, PassInput};

const TASK_NAMES: [&str; config::MAX_SUBPASSES] = [
    "column subpass 0",
    "column subpass 1",
    "column subpass 2",
    "column subpass 3",
    "column subpass 4",
    "column subpass 5",
    "column subpass 6",
];

pub(crate) struct GenerateColumnTask<G: PassGenerator> {
    column_position: IVec2,
    subpass_index: usize,
    internal: Arc<Internal<G::Block>>,
    generator: Arc<G>,
    priority: TaskPriority,
    // Whoever asked for this column. Released exactly once, on success or abort.
    caller: Option<Arc<DependencyTracker>>,
    // Our own subtasks while we are taken out.
    waiting_on: Option<Arc<DependencyTracker>>,
    aborted: bool,
}

impl<G: PassGenerator> GenerateColumnTask<G> {
    /// `caller` must already count this task as a dependency.
    pub(crate) fn new(
        column_position: IVec2,
        subpass_index: usize,
        internal: Arc<Internal<G::Block>>,
        generator: Arc<G>,
        priority: TaskPriority,
        caller: Arc<DependencyTracker>,
    ) -> Self {
        Self {
            column_position,
            subpass_index,
            internal,
            generator,
            priority: TaskPriority { band2: config::TASK_PRIORITY_COLUMN_BAND2, ..priority },
            caller: Some(caller),
            waiting_on: None,
            aborted: false,
        }
    }

    fn return_to_caller(&mut self, success: bool, scheduler: &mut BufferedTaskScheduler) {
        let Some(caller) = self.caller.take() else {
            panic!("column task {:?} returned to its caller twice", self.column_position);
        };
        if !success {
            caller.abort();
        }
        caller.complete_into(scheduler);
    }

    // A dependency could not be generated. Unregister and propagate.
    fn run_aborted(&mut self, ctx: &mut TaskContext<'_>) {
        let internal = self.internal.clone();
        let map = &internal.map;
        let final_subpass = internal.params.final_subpass_index();

        let Some(_region) = map.spatial_lock.try_write(Box2i::from_position(self.column_position)) else {
            ctx.postpone();
            return;
        };

        if let Some(column) = map.get(self.column_position) {
            let mut column = column.lock();
            column.pending_mask &= !subpass_bit(self.subpass_index);
            if self.subpass_index == final_subpass {
                column.release_block_waiters(true, ctx.scheduler());
            }
        }

        self.return_to_caller(false, ctx.scheduler());
    }
}

impl<G: PassGenerator> ThreadedTask for GenerateColumnTask<G> {
    fn run(&mut self, ctx: &mut TaskContext<'_>) {
        if let Some(tracker) = self.waiting_on.take() {
            // Resumed after our subtasks finished.
            self.aborted |= tracker.is_aborted();
        }
        if self.internal.is_expired() {
            self.aborted = true;
        }
        if self.aborted {
            self.run_aborted(ctx);
            return;
        }

        let internal = self.internal.clone();
        let map = &internal.map;
        let params = &internal.params;
        let final_subpass = params.final_subpass_index();

        let subpass = self.subpass_index;
        let prev_subpass = subpass as i32 - 1;
        let pass_index = pass_index_from_subpass(subpass as i32);
        let extent = params.passes[pass_index].dependency_extent;
        // Only the first subpass has no dependencies.
        assert_eq!(subpass == 0, extent == 0, "bad extent {} for subpass {}", extent, subpass);

        let neighbors_box = Box2i::from_position(self.column_position).padded(extent);
        let central_index = yx_index(IVec2::splat(extent), neighbors_box.size);

        // Workers never block on regions.
        let Some(_region) = map.spatial_lock.try_write(neighbors_box) else {
            ctx.postpone();
            return;
        };

        let fetched = map.fetch(neighbors_box);

        if fetched.iter().any(Option::is_none) {
            // Part of the neighborhood got unloaded since we were requested.
            log::trace!("column {:?} subpass {} lost its neighborhood", self.column_position, subpass);
            if let Some(main) = &fetched[central_index] {
                let mut main = main.lock();
                main.pending_mask &= !subpass_bit(subpass);
                if subpass == final_subpass {
                    main.release_block_waiters(true, ctx.scheduler());
                }
            }
            self.return_to_caller(false, ctx.scheduler());
            return;
        }

        let columns: Vec<_> = fetched.into_iter().flatten().collect();
        let mut guards: Vec<MutexGuard<'_, Column<G::Block>>> = columns.iter().map(|c| c.lock()).collect();

        let mut subtasks: Option<Arc<DependencyTracker>> = None;
        let mut postpone = false;

        if prev_subpass >= 0 {
            for (i, column) in guards.iter_mut().enumerate() {
                if i32::from(column.subpass_index) >= prev_subpass {
                    continue;
                }
                if column.pending_mask & subpass_bit(prev_subpass as usize) != 0 {
                    // Someone is already on it.
                    postpone = true;
                    continue;
                }

                let tracker = subtasks.get_or_insert_with(DependencyTracker::new);
                tracker.add_dependency();

                let i = i as i32;
                let size_x = neighbors_box.size.x;
                let cpos = neighbors_box.position + IVec2::new(i % size_x, i / size_x);

                ctx.scheduler().push_main_task(Box::new(GenerateColumnTask::new(
                    cpos,
                    prev_subpass as usize,
                    internal.clone(),
                    self.generator.clone(),
                    self.priority,
                    tracker.clone(),
                )));
                column.pending_mask |= subpass_bit(prev_subpass as usize);
            }
        }

        if let Some(tracker) = subtasks {
            log::trace!(
                "column {:?} subpass {} waits on {} subtasks",
                self.column_position,
                subpass,
                tracker.count() - 1
            );
            self.waiting_on = Some(tracker.clone());
            ctx.take_out(tracker);
            return;
        }
        if postpone {
            ctx.postpone();
            return;
        }

        if i32::from(guards[central_index].subpass_index) == prev_subpass {
            let column_base_y = params.column_base_y_blocks;
            let block_size = params.block_size;

            if subpass == 0 {
                let main = &mut guards[central_index];
                for (y, block) in main.blocks.iter_mut().enumerate() {
                    let position = params.block_position(self.column_position, y);
                    block.voxels = Some(self.generator.create_block(position, block_size));
                }
            }

            // The second subpass of a pass only waits for neighbors to be done
            // with it. The generator runs on the first one.
            let prev_pass_index = pass_index_from_subpass(prev_subpass);
            if pass_index == 0 || prev_pass_index != pass_index {
                let grid: Vec<&mut G::Block> = guards
                    .iter_mut()
                    .flat_map(|column| column.blocks.iter_mut())
                    .map(|block| match block.voxels.as_mut() {
                        Some(voxels) => voxels,
                        None => panic!("pass {} ran before blocks were created", pass_index),
                    })
                    .collect();

                self.generator.generate_pass(PassInput {
                    grid,
                    grid_size: IVec3::new(neighbors_box.size.x, params.column_height_blocks, neighbors_box.size.y),
                    grid_origin: IVec3::new(neighbors_box.position.x, column_base_y, neighbors_box.position.y),
                    main_block_position: IVec3::new(self.column_position.x, column_base_y, self.column_position.y),
                    block_size,
                    pass_index,
                });
            }

            guards[central_index].subpass_index = subpass as i8;
        }

        let main = &mut guards[central_index];
        main.pending_mask &= !subpass_bit(subpass);
        if i32::from(main.subpass_index) == final_subpass as i32 {
            main.release_block_waiters(false, ctx.scheduler());
        }

        self.return_to_caller(true, ctx.scheduler());
    }

    fn priority(&self) -> TaskPriority {
        self.priority
    }

    fn debug_name(&self) -> &'static str {
        TASK_NAMES[self.subpass_index]
    }
}
