//! Level-of-detail selection for the voxel sampling stride

use glam::{UVec3, Vec3};

/// Number of selectable levels above full resolution for a grid
pub fn num_levels(dims: UVec3) -> u32 {
    let min_dim = dims.min_element();
    if min_dim == 0 {
        return 0;
    }
    min_dim.ilog2().saturating_sub(4)
}

/// Sampling stride of a level
pub fn iso_scalar(level: u32) -> u32 {
    1u32 << level.min(16)
}

/// Level picked from the viewer distance to the volume
pub fn automatic_level(distance: f32, far_clip: f32, lod_distance: f32, levels: u32) -> u32 {
    if levels == 0 || !distance.is_finite() || far_clip <= 0.0 || lod_distance <= 0.0 {
        return 0;
    }
    let span = far_clip / lod_distance;
    let level = (levels as f32 * distance.max(0.0) / span).floor();
    (level as u32).min(levels)
}

/// Manual or automatic LOD settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelOfDetail {
    pub automatic: bool,
    /// Distance scalar; larger values switch to coarse levels sooner
    pub distance: f32,
    /// Manually requested level
    pub level: i32,
}

impl Default for LevelOfDetail {
    fn default() -> Self {
        Self {
            automatic: false,
            distance: 1.0,
            level: 0,
        }
    }
}

impl LevelOfDetail {
    pub fn set_level(&mut self, level: i32) {
        self.level = level.max(0);
    }

    /// Level for this pass, clamped into `[0, levels]`
    pub fn resolve(&self, viewer: Vec3, bounds_center: Vec3, far_clip: f32, levels: u32) -> u32 {
        if self.automatic {
            automatic_level(viewer.distance(bounds_center), far_clip, self.distance, levels)
        } else {
            (self.level.max(0) as u32).min(levels)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_levels() {
        assert_eq!(num_levels(UVec3::splat(50)), 1);
        assert_eq!(num_levels(UVec3::splat(16)), 0);
        assert_eq!(num_levels(UVec3::new(300, 128, 300)), 3);
        assert_eq!(num_levels(UVec3::ZERO), 0);
    }

    #[test]
    fn test_automatic_level_monotonic_and_clamped() {
        let levels = 3;
        let mut previous = 0;
        for step in 0..200 {
            let level = automatic_level(step as f32 * 0.25, 10.0, 2.0, levels);
            assert!(level >= previous);
            assert!(level <= levels);
            previous = level;
        }
        assert_eq!(automatic_level(1.0e9, 10.0, 2.0, levels), levels);
        assert_eq!(automatic_level(0.0, 10.0, 2.0, levels), 0);
    }

    #[test]
    fn test_manual_level_clamps() {
        let mut lod = LevelOfDetail::default();
        lod.set_level(-3);
        assert_eq!(lod.level, 0);
        lod.set_level(9);
        assert_eq!(lod.resolve(Vec3::ZERO, Vec3::ZERO, 10.0, 2), 2);
        assert_eq!(iso_scalar(2), 4);
    }
}
