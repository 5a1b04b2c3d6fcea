// src/math/mod.rs
// Integer boxes over grid coordinates.

mod box2;
mod box3;

pub use box2::Box2i;
pub use box3::Box3i;

use glam::IVec2;

/// Index of `p` in a row-major grid of `size`, iterating X first then Y.
#[inline(always)]
pub fn yx_index(p: IVec2, size: IVec2) -> usize {
    (p.x + p.y * size.x) as usize
}

#[inline(always)]
pub fn area(size: IVec2) -> usize {
    (size.x.max(0) as usize) * (size.y.max(0) as usize)
}
