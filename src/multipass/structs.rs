// src/multipass/structs.rs
//
// Data shared by multipass tasks: the column cache and its parameters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use glam::{IVec2, IVec3};
use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;

use crate::config;
use crate::error::ConfigError;
use crate::math::Box2i;
use crate::tasks::{BufferedTaskScheduler, DependencyTracker};
use crate::thread::SpatialLock2D;

/// Subpass 0 for pass 0, then two subpasses per pass.
#[inline]
pub const fn subpass_count_from_pass_count(pass_count: usize) -> usize {
    pass_count * 2 - 1
}

/// Valid for `subpass = -1` too (maps to pass 0).
#[inline]
pub const fn pass_index_from_subpass(subpass: i32) -> usize {
    ((subpass + 1) / 2) as usize
}

#[inline]
pub(crate) const fn subpass_bit(subpass: usize) -> u8 {
    1 << subpass
}

pub struct Block<B> {
    /// Created by subpass 0 of the owning column.
    pub voxels: Option<B>,
    // Released when the column reaches its final subpass or gets unloaded.
    // Only ever holds a request that did not spawn column work itself.
    pub(crate) final_pending: Option<Arc<DependencyTracker>>,
}

impl<B> Block<B> {
    fn new() -> Self {
        Self { voxels: None, final_pending: None }
    }
}

pub struct Column<B> {
    pub viewers: u32,
    /// Last subpass applied to this column, -1 if none.
    pub subpass_index: i8,
    /// One bit per subpass a task is currently working towards.
    pub pending_mask: u8,
    /// Vertical stack, bottom first. Never resized while loaded.
    pub blocks: Vec<Block<B>>,
}

impl<B> Column<B> {
    pub(crate) fn new(height_blocks: i32) -> Self {
        Self {
            viewers: 0,
            subpass_index: -1,
            pending_mask: 0,
            blocks: (0..height_blocks).map(|_| Block::new()).collect(),
        }
    }

    pub(crate) fn waiting_block_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.final_pending.is_some()).count()
    }

    /// Hands every registered block request back to `scheduler`.
    pub(crate) fn release_block_waiters(&mut self, abort: bool, scheduler: &mut BufferedTaskScheduler) {
        for block in self.blocks.iter_mut() {
            if let Some(tracker) = block.final_pending.take() {
                if abort {
                    tracker.abort();
                }
                tracker.complete_into(scheduler);
            }
        }
    }
}

pub(crate) type ColumnRef<B> = Arc<Mutex<Column<B>>>;

pub struct Map<B> {
    // Guards insertion and removal only. Leaf lock: never held while
    // acquiring a region of `spatial_lock`.
    pub(crate) columns: Mutex<HashMap<IVec2, ColumnRef<B>>>,
    // Guards column contents. A column's own mutex is only taken while a
    // region covering it is held, so it is never contended.
    pub(crate) spatial_lock: SpatialLock2D,
}

impl<B> Map<B> {
    fn new() -> Self {
        Self {
            columns: Mutex::new(HashMap::default()),
            spatial_lock: SpatialLock2D::new(),
        }
    }

    /// Looks up every cell of `area` in YX order.
    pub(crate) fn fetch(&self, area: Box2i) -> Vec<Option<ColumnRef<B>>> {
        let columns = self.columns.lock();
        let mut out = Vec::with_capacity(area.area());
        area.for_each_cell_yx(|p| out.push(columns.get(&p).cloned()));
        out
    }

    pub(crate) fn get(&self, position: IVec2) -> Option<ColumnRef<B>> {
        self.columns.lock().get(&position).cloned()
    }

    pub fn column_count(&self) -> usize {
        self.columns.lock().len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Pass {
    /// Columns around the processed one that must have completed the
    /// previous pass. Zero for the first pass, at least 1 for the others.
    pub dependency_extent: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipassParams {
    pub passes: Vec<Pass>,
    pub column_base_y_blocks: i32,
    pub column_height_blocks: i32,
    pub block_size: u32,
}

impl Default for MultipassParams {
    fn default() -> Self {
        Self {
            passes: vec![Pass::default()],
            column_base_y_blocks: config::DEFAULT_COLUMN_BASE_Y_BLOCKS,
            column_height_blocks: config::DEFAULT_COLUMN_HEIGHT_BLOCKS,
            block_size: config::DEFAULT_BLOCK_SIZE,
        }
    }
}

impl MultipassParams {
    /// `extents[0]` must be 0.
    pub fn with_extents(extents: &[i32]) -> Self {
        Self {
            passes: extents.iter().map(|&e| Pass { dependency_extent: e }).collect(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let count = self.passes.len();
        if count == 0 || count > config::MAX_PASSES {
            return Err(ConfigError::PassCount { count, max: config::MAX_PASSES });
        }
        let first = self.passes[0].dependency_extent;
        if first != 0 {
            return Err(ConfigError::FirstPassExtent { extent: first });
        }
        for (index, pass) in self.passes.iter().enumerate().skip(1) {
            let extent = pass.dependency_extent;
            if extent < 1 || extent > config::MAX_PASS_EXTENT {
                return Err(ConfigError::PassExtent { index, extent, max: config::MAX_PASS_EXTENT });
            }
        }
        if self.column_height_blocks < 0 || self.column_height_blocks > config::MAX_COLUMN_HEIGHT_BLOCKS {
            return Err(ConfigError::ColumnHeight {
                height: self.column_height_blocks,
                max: config::MAX_COLUMN_HEIGHT_BLOCKS,
            });
        }
        if self.block_size == 0 {
            return Err(ConfigError::BlockSize);
        }
        Ok(())
    }

    #[inline]
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    #[inline]
    pub fn subpass_count(&self) -> usize {
        subpass_count_from_pass_count(self.passes.len())
    }

    #[inline]
    pub fn final_subpass_index(&self) -> usize {
        self.subpass_count() - 1
    }

    /// How far around a requested column other columns get generated.
    pub fn total_dependency_extent(&self) -> i32 {
        self.passes.iter().skip(1).map(|p| p.dependency_extent * 2).sum()
    }

    #[inline]
    pub fn contains_block_y(&self, y: i32) -> bool {
        y >= self.column_base_y_blocks && y < self.column_base_y_blocks + self.column_height_blocks
    }

    #[inline]
    pub(crate) fn block_position(&self, column: IVec2, index_in_column: usize) -> IVec3 {
        IVec3::new(column.x, self.column_base_y_blocks + index_in_column as i32, column.y)
    }
}

/// Cache and parameters. Replaced as a whole when parameters change.
pub(crate) struct Internal<B> {
    pub map: Map<B>,
    pub params: MultipassParams,
    // Set once a newer instance replaced this one. Tasks still holding it
    // finish early and their results are dropped.
    expired: AtomicBool,
}

impl<B> Internal<B> {
    pub fn new(params: MultipassParams) -> Self {
        Self {
            map: Map::new(),
            params,
            expired: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    pub fn mark_expired(&self) {
        self.expired.store(true, Ordering::Release);
    }
}

/// Neighborhood handed to `PassGenerator::generate_pass`.
///
/// `grid` holds every block of every column in the neighborhood, columns in
/// YX order (2D Y is world Z) and blocks bottom-up inside each column. In
/// other words ZXY order, index + 1 goes up along Y.
pub struct PassInput<'a, B> {
    pub grid: Vec<&'a mut B>,
    pub grid_size: IVec3,
    /// World block position of the grid's lower corner.
    pub grid_origin: IVec3,
    /// World block position of the lowest block of the processed column.
    pub main_block_position: IVec3,
    pub block_size: u32,
    pub pass_index: usize,
}

impl<'a, B> PassInput<'a, B> {
    pub fn index_of(&self, world_block_position: IVec3) -> Option<usize> {
        let p = world_block_position - self.grid_origin;
        let s = self.grid_size;
        if p.x < 0 || p.y < 0 || p.z < 0 || p.x >= s.x || p.y >= s.y || p.z >= s.z {
            return None;
        }
        Some(((p.x + p.z * s.x) * s.y + p.y) as usize)
    }

    pub fn get_mut(&mut self, world_block_position: IVec3) -> Option<&mut B> {
        let i = self.index_of(world_block_position)?;
        Some(&mut *self.grid[i])
    }

    /// World position of `grid[index]`.
    pub fn position_of(&self, index: usize) -> IVec3 {
        let s = self.grid_size;
        let i = index as i32;
        let y = i % s.y;
        let column = i / s.y;
        self.grid_origin + IVec3::new(column % s.x, y, column / s.x)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugColumnState {
    pub position: IVec2,
    pub subpass_index: i8,
    pub viewers: u32,
    pub pending_mask: u8,
    pub waiting_blocks: usize,
}
