// src/math/box2.rs
use glam::IVec2;

/// Axis-aligned box of integer cells. `size` is exclusive, a box with any
/// non-positive size component is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Box2i {
    pub position: IVec2,
    pub size: IVec2,
}

impl Box2i {
    #[inline]
    pub const fn new(position: IVec2, size: IVec2) -> Self {
        Self { position, size }
    }

    #[inline]
    pub fn from_position(p: IVec2) -> Self {
        Self::new(p, IVec2::ONE)
    }

    /// `max` is exclusive.
    #[inline]
    pub fn from_min_max(min: IVec2, max: IVec2) -> Self {
        Self::new(min, max - min)
    }

    /// Box covering every coordinate a task can realistically address.
    #[inline]
    pub fn everywhere() -> Self {
        Self::new(IVec2::splat(i32::MIN / 2), IVec2::splat(i32::MAX))
    }

    #[inline]
    pub fn max(&self) -> IVec2 {
        self.position + self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.x <= 0 || self.size.y <= 0
    }

    #[inline]
    pub fn area(&self) -> usize {
        super::area(self.size)
    }

    #[inline]
    pub fn contains(&self, p: IVec2) -> bool {
        let max = self.max();
        p.x >= self.position.x && p.y >= self.position.y && p.x < max.x && p.y < max.y
    }

    pub fn intersects(&self, other: &Box2i) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let a_max = self.max();
        let b_max = other.max();
        !(self.position.x >= b_max.x
            || self.position.y >= b_max.y
            || other.position.x >= a_max.x
            || other.position.y >= a_max.y)
    }

    #[inline]
    pub fn padded(&self, m: i32) -> Self {
        Self::new(self.position - IVec2::splat(m), self.size + IVec2::splat(2 * m))
    }

    /// Visits cells row by row (X varies fastest).
    #[inline]
    pub fn for_each_cell_yx(&self, mut f: impl FnMut(IVec2)) {
        let max = self.max();
        for y in self.position.y..max.y {
            for x in self.position.x..max.x {
                f(IVec2::new(x, y));
            }
        }
    }

    /// Subtracts `b` from this box, emitting up to 4 non-overlapping boxes
    /// covering what remains.
    pub fn difference(&self, b: &Box2i, mut f: impl FnMut(Box2i)) {
        if self.is_empty() {
            return;
        }
        if !self.intersects(b) {
            f(*self);
            return;
        }

        let mut a_min = self.position;
        let mut a_max = self.max();
        let b_min = b.position;
        let b_max = b.max();

        if a_min.x < b_min.x {
            f(Box2i::from_min_max(a_min, IVec2::new(b_min.x, a_max.y)));
            a_min.x = b_min.x;
        }
        if a_min.y < b_min.y {
            f(Box2i::from_min_max(a_min, IVec2::new(a_max.x, b_min.y)));
            a_min.y = b_min.y;
        }
        if a_max.x > b_max.x {
            f(Box2i::from_min_max(IVec2::new(b_max.x, a_min.y), a_max));
            a_max.x = b_max.x;
        }
        if a_max.y > b_max.y {
            f(Box2i::from_min_max(IVec2::new(a_min.x, b_max.y), a_max));
        }
    }

    pub fn difference_to_vec(&self, b: &Box2i) -> Vec<Box2i> {
        let mut out = Vec::new();
        self.difference(b, |r| out.push(r));
        out
    }
}
