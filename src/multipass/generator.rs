// src/multipass/generator.rs
use std::sync::Arc;

use glam::{IVec2, IVec3};
use parking_lot::Mutex;

use crate::error::ConfigError;
use crate::math::{yx_index, Box2i, Box3i};
use crate::tasks::{BoxedTask, BufferedTaskScheduler, TaskSpawner};

use super::block_task::{BlockTaskParams, GenerateBlockTask};
use super::structs::{
    pass_index_from_subpass, Column, DebugColumnState, Internal, MultipassParams, Pass, PassInput,
};

/// The procedural part. Called from worker threads, never concurrently on
/// intersecting neighborhoods.
pub trait PassGenerator: Send + Sync + 'static {
    type Block: Clone + Send + 'static;

    /// Fresh block before pass 0 runs on its column.
    fn create_block(&self, position: IVec3, block_size: u32) -> Self::Block;

    /// Runs `input.pass_index` on the main column. May write into any block of
    /// the grid.
    fn generate_pass(&self, input: PassInput<'_, Self::Block>);

    /// Blocks above or below the column range skip the multipass machinery.
    fn generate_block_fallback(&self, position: IVec3, block_size: u32) -> Self::Block {
        self.create_block(position, block_size)
    }
}

pub type ViewerId = u32;

#[derive(Clone, Copy, Debug)]
struct PairedViewer {
    id: ViewerId,
    request_box: Box3i,
}

/// Generates blocks with passes that may read and write neighbor columns.
///
/// Keeps a cache of columns around viewers. Block requests bring their
/// column to the final subpass through dependency tasks submitted to the
/// runner behind `spawner`.
pub struct MultipassGenerator<G: PassGenerator> {
    generator: Arc<G>,
    spawner: TaskSpawner,
    internal: Mutex<Arc<Internal<G::Block>>>,
    // Lock order: viewers, then internal.
    paired_viewers: Mutex<Vec<PairedViewer>>,
}

impl<G: PassGenerator> MultipassGenerator<G> {
    pub fn new(generator: G, params: MultipassParams, spawner: TaskSpawner) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self {
            generator: Arc::new(generator),
            spawner,
            internal: Mutex::new(Arc::new(Internal::new(params))),
            paired_viewers: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    fn internal(&self) -> Arc<Internal<G::Block>> {
        self.internal.lock().clone()
    }

    pub fn generator(&self) -> &Arc<G> {
        &self.generator
    }

    pub fn params(&self) -> MultipassParams {
        self.internal().params.clone()
    }

    pub fn pass_count(&self) -> usize {
        self.internal().params.pass_count()
    }

    pub fn set_pass_count(&self, count: usize) -> Result<(), ConfigError> {
        if count == self.pass_count() {
            return Ok(());
        }
        self.reset_internal(|p| p.passes.resize(count, Pass { dependency_extent: 1 }))
    }

    pub fn pass_extent_blocks(&self, pass_index: usize) -> Result<i32, ConfigError> {
        let internal = self.internal();
        let count = internal.params.pass_count();
        internal
            .params
            .passes
            .get(pass_index)
            .map(|p| p.dependency_extent)
            .ok_or(ConfigError::PassIndex { index: pass_index, count })
    }

    pub fn set_pass_extent_blocks(&self, pass_index: usize, extent: i32) -> Result<(), ConfigError> {
        if self.pass_extent_blocks(pass_index)? == extent {
            return Ok(());
        }
        self.reset_internal(|p| {
            if let Some(pass) = p.passes.get_mut(pass_index) {
                pass.dependency_extent = extent;
            }
        })
    }

    pub fn set_column_base_y_blocks(&self, y: i32) -> Result<(), ConfigError> {
        if self.internal().params.column_base_y_blocks == y {
            return Ok(());
        }
        self.reset_internal(|p| p.column_base_y_blocks = y)
    }

    pub fn set_column_height_blocks(&self, height: i32) -> Result<(), ConfigError> {
        if self.internal().params.column_height_blocks == height {
            return Ok(());
        }
        self.reset_internal(|p| p.column_height_blocks = height)
    }

    pub fn set_block_size(&self, block_size: u32) -> Result<(), ConfigError> {
        if self.internal().params.block_size == block_size {
            return Ok(());
        }
        self.reset_internal(|p| p.block_size = block_size)
    }

    /// Task generating one block, to be enqueued by the caller.
    pub fn create_block_task(&self, params: BlockTaskParams<G::Block>) -> BoxedTask {
        Box::new(GenerateBlockTask::new(params, self.internal(), self.generator.clone()))
    }

    /// Same as `create_block_task`, submitted right away.
    pub fn request_block(&self, params: BlockTaskParams<G::Block>) {
        self.spawner.enqueue(self.create_block_task(params), false);
    }

    /// Updates the area a viewer keeps loaded. `prev_requested_box` must be
    /// what this viewer requested last time (empty the first time).
    ///
    /// Blocks while tasks hold regions being loaded or unloaded. Meant to
    /// run on the thread driving block requests.
    pub fn process_viewer_diff(&self, id: ViewerId, requested_box: Box3i, prev_requested_box: Box3i) {
        let mut viewers = self.paired_viewers.lock();
        match viewers.iter_mut().find(|v| v.id == id) {
            Some(v) => v.request_box = requested_box,
            // New viewer, or the generator was reset since we last saw it.
            None => viewers.push(PairedViewer { id, request_box: requested_box }),
        }
        let internal = self.internal();
        self.process_viewer_diff_internal(&internal, requested_box, prev_requested_box);
    }

    /// Drops everything the viewer kept loaded.
    pub fn unpair_viewer(&self, id: ViewerId) {
        let mut viewers = self.paired_viewers.lock();
        let Some(i) = viewers.iter().position(|v| v.id == id) else {
            return;
        };
        let prev = viewers.swap_remove(i);
        let internal = self.internal();
        let empty = Box3i::new(prev.request_box.position, IVec3::ZERO);
        self.process_viewer_diff_internal(&internal, empty, prev.request_box);
    }

    fn process_viewer_diff_internal(&self, internal: &Internal<G::Block>, requested_box: Box3i, prev_requested_box: Box3i) {
        let params = &internal.params;
        let map = &internal.map;
        let total_extent = params.total_dependency_extent();

        let to_load_box = |b: Box3i| {
            let b2 = b.to_xz_in_height_range(params.column_base_y_blocks, params.column_height_blocks);
            // Empty means nothing requested, padding must not change that.
            if b2.is_empty() {
                b2
            } else {
                b2.padded(total_extent)
            }
        };
        let load_box = to_load_box(requested_box);
        let prev_load_box = to_load_box(prev_requested_box);

        let height = params.column_height_blocks;
        let mut scheduler = BufferedTaskScheduler::new();

        load_box.difference(&prev_load_box, |new_box| {
            let _region = map.spatial_lock.write(new_box);
            let mut columns = map.columns.lock();
            new_box.for_each_cell_yx(|p| {
                let column = columns
                    .entry(p)
                    .or_insert_with(|| Arc::new(Mutex::new(Column::new(height))));
                column.lock().viewers += 1;
            });
        });

        prev_load_box.difference(&load_box, |old_box| {
            let _region = map.spatial_lock.write(old_box);
            let mut columns = map.columns.lock();
            old_box.for_each_cell_yx(|p| {
                let Some(column) = columns.get(&p).cloned() else {
                    panic!("column {:?} unviewed but was never loaded", p);
                };
                let mut column = column.lock();
                assert!(column.viewers > 0, "column {:?} viewer count underflow", p);
                column.viewers -= 1;
                if column.viewers == 0 {
                    // Waiting requests resume and observe the column is gone.
                    column.release_block_waiters(true, &mut scheduler);
                    drop(column);
                    columns.remove(&p);
                }
            });
        });

        scheduler.flush(&self.spawner);
    }

    /// Throws away all cached columns. Viewers are re-applied on the fresh
    /// cache, pending requests on the old one end as aborted or cancelled.
    pub fn clear_cache(&self) {
        // Unchanged parameters are always valid.
        let _ = self.reset_internal(|_| {});
    }

    fn reset_internal(&self, f: impl FnOnce(&mut MultipassParams)) -> Result<(), ConfigError> {
        let viewers = self.paired_viewers.lock();

        let old = {
            let mut guard = self.internal.lock();
            let mut params = guard.params.clone();
            f(&mut params);
            params.validate()?;
            std::mem::replace(&mut *guard, Arc::new(Internal::new(params)))
        };
        old.mark_expired();
        log::debug!("multipass cache reset, {} columns dropped", old.map.column_count());

        // Kick waiting requests out of the old cache. In-flight column tasks
        // see the expired flag and unwind on their own.
        {
            let mut scheduler = BufferedTaskScheduler::new();
            let _region = old.map.spatial_lock.write(Box2i::everywhere());
            let mut columns = old.map.columns.lock();
            for column in columns.values() {
                column.lock().release_block_waiters(true, &mut scheduler);
            }
            columns.clear();
            drop(columns);
            scheduler.flush(&self.spawner);
        }

        let internal = self.internal();
        for v in viewers.iter() {
            let empty = Box3i::new(v.request_box.position, IVec3::ZERO);
            self.process_viewer_diff_internal(&internal, v.request_box, empty);
        }
        Ok(())
    }

    /// Snapshot of every cached column, or `None` if some task holds part of
    /// the cache right now. Never blocks.
    pub fn debug_try_get_column_states(&self) -> Option<Vec<DebugColumnState>> {
        let internal = self.internal();
        let map = &internal.map;
        let _region = map.spatial_lock.try_read(Box2i::everywhere())?;

        let columns = map.columns.lock();
        let states = columns
            .iter()
            .map(|(&position, column)| {
                let c = column.lock();
                DebugColumnState {
                    position,
                    subpass_index: c.subpass_index,
                    viewers: c.viewers,
                    pending_mask: c.pending_mask,
                    waiting_blocks: c.waiting_block_count(),
                }
            })
            .collect();
        Some(states)
    }

    pub fn debug_column_count(&self) -> usize {
        self.internal().map.column_count()
    }

    /// Runs every pass for one column on a private grid, single-threaded and
    /// without touching the cache. Returns the column's blocks bottom-up.
    pub fn debug_generate_test_column(&self, column_position: IVec2) -> Vec<G::Block> {
        let internal = self.internal();
        let params = &internal.params;
        let total_extent = params.total_dependency_extent();

        let grid_size = IVec2::splat(total_extent * 2 + 1);
        let grid_origin = column_position - IVec2::splat(total_extent);
        let height = params.column_height_blocks;
        let block_size = params.block_size;

        let mut columns: Vec<Vec<G::Block>> = Vec::with_capacity(grid_size.x as usize * grid_size.y as usize);
        Box2i::new(grid_origin, grid_size).for_each_cell_yx(|p| {
            let blocks = (0..height as usize)
                .map(|y| self.generator.create_block(params.block_position(p, y), block_size))
                .collect();
            columns.push(blocks);
        });

        let subpass_count = params.subpass_count();
        let mut local_box = Box2i::new(IVec2::ZERO, grid_size);

        for subpass in 0..subpass_count as i32 {
            let pass_index = pass_index_from_subpass(subpass);
            let prev_pass_index = pass_index_from_subpass(subpass - 1);
            let extent = params.passes[pass_index].dependency_extent;

            if pass_index == 0 || pass_index != prev_pass_index {
                local_box.for_each_cell_yx(|local| {
                    let nbox = Box2i::from_position(local).padded(extent);
                    let grid: Vec<&mut G::Block> = columns
                        .iter_mut()
                        .enumerate()
                        .filter(|(i, _)| {
                            let i = *i as i32;
                            nbox.contains(IVec2::new(i % grid_size.x, i / grid_size.x))
                        })
                        .flat_map(|(_, blocks)| blocks.iter_mut())
                        .collect();

                    let origin = grid_origin + nbox.position;
                    let main = grid_origin + local;
                    self.generator.generate_pass(PassInput {
                        grid,
                        grid_size: IVec3::new(nbox.size.x, height, nbox.size.y),
                        grid_origin: IVec3::new(origin.x, params.column_base_y_blocks, origin.y),
                        main_block_position: IVec3::new(main.x, params.column_base_y_blocks, main.y),
                        block_size,
                        pass_index,
                    });
                });
            }

            // Cells the next subpass can process without leaving the grid.
            if ((subpass + 1) as usize) < subpass_count {
                let next_pass = &params.passes[pass_index_from_subpass(subpass + 1)];
                local_box = local_box.padded(-next_pass.dependency_extent);
            }
        }

        let center = yx_index(IVec2::splat(total_extent), grid_size);
        columns.swap_remove(center)
    }
}
