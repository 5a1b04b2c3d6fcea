// src/multipass/priority.rs
use std::sync::Arc;

use glam::{IVec3, Vec3};
use parking_lot::RwLock;

use crate::config;
use crate::tasks::TaskPriority;

/// World positions of all viewers, updated by the host once per tick.
pub type SharedViewers = Arc<RwLock<Vec<Vec3>>>;

/// Distance-based priority of a block request.
#[derive(Clone)]
pub struct PriorityDependency {
    pub viewers: SharedViewers,
    /// Center of the requested block in world units.
    pub world_position: Vec3,
    /// Beyond this, the request is not worth running anymore.
    pub drop_distance_squared: f32,
}

impl PriorityDependency {
    pub fn for_block(viewers: SharedViewers, block_position: IVec3, block_size: u32, lod_index: u8, view_distance: f32) -> Self {
        let size = (block_size << lod_index) as f32;
        let world_position = block_position.as_vec3() * size + Vec3::splat(size * 0.5);
        // One extra block of margin, neighbors are needed around the visible ones.
        let drop_distance = view_distance + size;
        Self {
            viewers,
            world_position,
            drop_distance_squared: drop_distance * drop_distance,
        }
    }

    /// Returns the priority and the squared distance to the closest viewer.
    pub fn evaluate(&self, lod_index: u8, band2: u8) -> (TaskPriority, f32) {
        let viewers = self.viewers.read();

        // No viewer: behave as if one stood at the origin.
        let closest_sq = if viewers.is_empty() {
            self.world_position.length_squared()
        } else {
            viewers
                .iter()
                .map(|v| v.distance_squared(self.world_position))
                .fold(f32::MAX, f32::min)
        };

        let max_distance = self.drop_distance_squared.sqrt().max(1.0);
        let t = (closest_sq.sqrt() / max_distance).clamp(0.0, 1.0);

        let priority = TaskPriority {
            band3: config::TASK_PRIORITY_BAND3_DEFAULT,
            band2,
            // Coarser LODs first, they cover more of the view.
            band1: lod_index,
            band0: ((1.0 - t) * 255.0) as u8,
        };
        (priority, closest_sq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closer_blocks_rank_higher() {
        let viewers: SharedViewers = Arc::new(RwLock::new(vec![Vec3::ZERO]));
        let near = PriorityDependency::for_block(viewers.clone(), IVec3::new(1, 0, 0), 16, 0, 256.0);
        let far = PriorityDependency::for_block(viewers.clone(), IVec3::new(10, 0, 0), 16, 0, 256.0);

        let (p_near, d_near) = near.evaluate(0, config::TASK_PRIORITY_GENERATE_BAND2);
        let (p_far, d_far) = far.evaluate(0, config::TASK_PRIORITY_GENERATE_BAND2);
        assert!(d_near < d_far);
        assert!(p_near > p_far);

        // Moving the viewer flips the order.
        viewers.write()[0] = Vec3::new(168.0, 8.0, 8.0);
        assert!(far.evaluate(0, 0).0 > near.evaluate(0, 0).0);
    }
}
