// src/math/box3.rs
use glam::{IVec2, IVec3};

use super::Box2i;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Box3i {
    pub position: IVec3,
    pub size: IVec3,
}

impl Box3i {
    #[inline]
    pub const fn new(position: IVec3, size: IVec3) -> Self {
        Self { position, size }
    }

    #[inline]
    pub fn from_position(p: IVec3) -> Self {
        Self::new(p, IVec3::ONE)
    }

    #[inline]
    pub fn max(&self) -> IVec3 {
        self.position + self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.x <= 0 || self.size.y <= 0 || self.size.z <= 0
    }

    pub fn intersects(&self, other: &Box3i) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let a_max = self.max();
        let b_max = other.max();
        !(self.position.x >= b_max.x
            || self.position.y >= b_max.y
            || self.position.z >= b_max.z
            || other.position.x >= a_max.x
            || other.position.y >= a_max.y
            || other.position.z >= a_max.z)
    }

    #[inline]
    pub fn padded(&self, m: i32) -> Self {
        Self::new(self.position - IVec3::splat(m), self.size + IVec3::splat(2 * m))
    }

    /// Projects onto the XZ plane, or an empty box if this box misses the
    /// vertical range `[min_y, min_y + height)`.
    pub fn to_xz_in_height_range(&self, min_y: i32, height: i32) -> Box2i {
        let xz = IVec2::new(self.position.x, self.position.z);
        if self.is_empty() || self.max().y <= min_y || self.position.y >= min_y + height {
            return Box2i::new(xz, IVec2::ZERO);
        }
        Box2i::new(xz, IVec2::new(self.size.x, self.size.z))
    }
}
