// src/tasks/priority.rs
use std::fmt;

/// Multi-band priority, higher runs first.
///
/// Bands compare from most significant (`band3`) to least (`band0`), so a
/// coarse category in `band3`/`band2` always beats any distance in `band0`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TaskPriority {
    // Field order is the comparison order.
    pub band3: u8,
    pub band2: u8,
    pub band1: u8,
    pub band0: u8,
}

impl TaskPriority {
    pub const MIN: TaskPriority = TaskPriority::new(0, 0, 0, 0);
    pub const MAX: TaskPriority = TaskPriority::new(u8::MAX, u8::MAX, u8::MAX, u8::MAX);

    #[inline]
    pub const fn new(band3: u8, band2: u8, band1: u8, band0: u8) -> Self {
        Self { band3, band2, band1, band0 }
    }

    #[inline]
    pub const fn from_band0(band0: u8) -> Self {
        Self::new(0, 0, 0, band0)
    }
}

impl fmt::Debug for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P({} {} {} {})", self.band3, self.band2, self.band1, self.band0)
    }
}
