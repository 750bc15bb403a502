//! Volume bounds and the voxel grid derived from them

use glam::{Mat4, UVec3, Vec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned box in clip-local space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeBounds {
    pub center: Vec3,
    pub size: Vec3,
}

impl VolumeBounds {
    pub fn new(center: Vec3, size: Vec3) -> Self {
        Self { center, size }
    }

    pub fn min(&self) -> Vec3 {
        self.center - self.size * 0.5
    }

    pub fn max(&self) -> Vec3 {
        self.center + self.size * 0.5
    }

    /// Zero, negative or non-finite extent on any axis
    pub fn is_degenerate(&self) -> bool {
        !self.size.is_finite() || !self.center.is_finite() || self.size.min_element() <= 0.0
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (lo, hi) = (self.min(), self.max());
        [
            Vec3::new(lo.x, lo.y, lo.z),
            Vec3::new(hi.x, lo.y, lo.z),
            Vec3::new(hi.x, lo.y, hi.z),
            Vec3::new(lo.x, lo.y, hi.z),
            Vec3::new(lo.x, hi.y, lo.z),
            Vec3::new(hi.x, hi.y, lo.z),
            Vec3::new(hi.x, hi.y, hi.z),
            Vec3::new(lo.x, hi.y, hi.z),
        ]
    }

    /// World-space AABB of the box under `local_to_world`
    pub fn transformed_aabb(&self, local_to_world: &Mat4) -> (Vec3, Vec3) {
        self.corners().iter().fold(
            (Vec3::splat(f32::INFINITY), Vec3::splat(f32::NEG_INFINITY)),
            |(lo, hi), corner| {
                let p = local_to_world.transform_point3(*corner);
                (lo.min(p), hi.max(p))
            },
        )
    }
}

/// Dense voxel grid over a bounds box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelGrid {
    pub bounds: VolumeBounds,
    /// Voxels per meter
    pub density: f32,
    pub dims: UVec3,
}

impl VoxelGrid {
    /// `dims = floor(size * density)` per axis
    pub fn new(bounds: VolumeBounds, density: f32) -> Self {
        let scaled = (bounds.size * density).floor().max(Vec3::ZERO);
        let dims = if scaled.is_finite() { scaled.as_uvec3() } else { UVec3::ZERO };
        Self {
            bounds,
            density,
            dims,
        }
    }

    pub fn total_voxels(&self) -> usize {
        self.dims.x as usize * self.dims.y as usize * self.dims.z as usize
    }

    /// No cell can be formed along some axis
    pub fn is_empty(&self) -> bool {
        self.dims.min_element() < 2
    }

    pub fn voxel_size(&self) -> Vec3 {
        self.bounds.size / self.dims.max(UVec3::ONE).as_vec3()
    }

    pub fn voxel_center(&self, coord: UVec3) -> Vec3 {
        self.bounds.min() + (coord.as_vec3() + 0.5) * self.voxel_size()
    }

    pub fn index(&self, coord: UVec3) -> usize {
        ((coord.z as usize * self.dims.y as usize) + coord.y as usize) * self.dims.x as usize
            + coord.x as usize
    }

    pub fn coord(&self, index: usize) -> UVec3 {
        let dx = self.dims.x.max(1) as usize;
        let dy = self.dims.y.max(1) as usize;
        UVec3::new((index % dx) as u32, ((index / dx) % dy) as u32, (index / (dx * dy)) as u32)
    }

    /// Sample counts per axis when every `stride`-th voxel is used
    pub fn lod_dims(&self, stride: u32) -> UVec3 {
        let stride = stride.max(1);
        let axis = |d: u32| if d == 0 { 0 } else { (d - 1) / stride + 1 };
        UVec3::new(axis(self.dims.x), axis(self.dims.y), axis(self.dims.z))
    }

    /// Grid coordinate of an LOD sample, clamped into the grid
    pub fn lod_sample(&self, lod_coord: UVec3, stride: u32) -> UVec3 {
        (lod_coord * stride.max(1)).min(self.dims.saturating_sub(UVec3::ONE))
    }

    /// Whether a grid voxel is one of the LOD sample points
    pub fn is_lod_sample(coord: UVec3, stride: u32) -> bool {
        let stride = stride.max(1);
        coord.x % stride == 0 && coord.y % stride == 0 && coord.z % stride == 0
    }
}
