//! Perspective table: calibrated depth cameras of one capture
//!
//! The table is parsed once per metadata load and never mutated afterwards.
//! Every downstream stage refers to perspectives by index.

pub mod frame;
pub mod records;
pub mod synthetic;

pub use frame::{FrameAtlas, FrameSource, SharedFrame};
pub use records::{
    PerspectiveColorBlending, PerspectiveColorBlendingData, PerspectiveGeometry,
    PerspectiveGeometryData, SyncedRecords,
};

use crate::error::{EngineError, EngineResult};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec2, Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};

/// Hard limit on perspectives per capture
pub const MAX_PERSPECTIVES: usize = 10;

/// Perspective resolutions are padded up to this multiple
pub const RESOLUTION_PADDING: u32 = 8;

/// One calibrated depth+color camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Perspective {
    pub depth_image_size: Vec2,
    pub depth_principal_point: Vec2,
    pub depth_focal_length: Vec2,
    pub near_clip: f32,
    pub far_clip: f32,
    /// Camera space to clip-local space
    pub extrinsics: Mat4,
    /// Normalised crop rectangle `(x, y, width, height)`
    #[serde(default = "full_crop")]
    pub crop: Vec4,
    #[serde(default = "default_clip_epsilon")]
    pub clip_epsilon: f32,
    #[serde(skip)]
    extrinsics_inverse: Mat4,
    #[serde(skip)]
    camera_center: Vec3,
    #[serde(skip)]
    camera_normal: Vec3,
}

fn full_crop() -> Vec4 {
    Vec4::new(0.0, 0.0, 1.0, 1.0)
}

fn default_clip_epsilon() -> f32 {
    1.0e-4
}

impl Perspective {
    pub fn new(
        depth_image_size: Vec2,
        depth_principal_point: Vec2,
        depth_focal_length: Vec2,
        near_clip: f32,
        far_clip: f32,
        extrinsics: Mat4,
    ) -> Self {
        let mut perspective = Self {
            depth_image_size,
            depth_principal_point,
            depth_focal_length,
            near_clip,
            far_clip,
            extrinsics,
            crop: full_crop(),
            clip_epsilon: default_clip_epsilon(),
            extrinsics_inverse: Mat4::IDENTITY,
            camera_center: Vec3::ZERO,
            camera_normal: Vec3::Z,
        };
        perspective.derive();
        perspective
    }

    /// Recompute the inverse extrinsics and camera center/normal
    pub fn derive(&mut self) {
        self.extrinsics_inverse = self.extrinsics.inverse();
        self.camera_center = self.extrinsics.transform_point3(Vec3::ZERO);
        self.camera_normal = self.extrinsics.transform_vector3(Vec3::Z).normalize_or_zero();
    }

    pub fn extrinsics_inverse(&self) -> Mat4 {
        self.extrinsics_inverse
    }

    pub fn camera_center(&self) -> Vec3 {
        self.camera_center
    }

    pub fn camera_normal(&self) -> Vec3 {
        self.camera_normal
    }

    /// Clip-local point in this camera's space
    pub fn to_camera(&self, local: Vec3) -> Vec3 {
        self.extrinsics_inverse.transform_point3(local)
    }

    /// Normalised depth-image coordinate of a camera-space point, or `None`
    /// when the point is behind the near plane or outside the crop.
    pub fn project(&self, camera: Vec3) -> Option<Vec2> {
        if camera.z <= self.near_clip {
            return None;
        }
        let pixel = self.depth_focal_length * Vec2::new(camera.x, camera.y) / camera.z
            + self.depth_principal_point;
        let uv = pixel / self.depth_image_size;
        let crop_min = Vec2::new(self.crop.x, self.crop.y);
        let crop_max = crop_min + Vec2::new(self.crop.z, self.crop.w);
        if uv.cmplt(crop_min).any() || uv.cmpge(crop_max).any() {
            return None;
        }
        Some(uv)
    }

    /// GPU layout of this perspective with the radial bias baked in
    pub fn to_gpu(&self, radial_bias_m: f32) -> PerspectiveGpu {
        PerspectiveGpu {
            extrinsics_inverse: self.extrinsics_inverse.to_cols_array_2d(),
            crop: self.crop.to_array(),
            depth_image_size: self.depth_image_size.to_array(),
            principal_point: self.depth_principal_point.to_array(),
            focal_length: self.depth_focal_length.to_array(),
            near_clip: self.near_clip,
            far_clip: self.far_clip,
            camera_center: self.camera_center.extend(1.0).to_array(),
            camera_normal: self.camera_normal.extend(0.0).to_array(),
            clip_epsilon: self.clip_epsilon,
            radial_bias: radial_bias_m,
            _padding: [0.0; 2],
        }
    }
}

/// Perspective data as seen by the compute kernels
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PerspectiveGpu {
    pub extrinsics_inverse: [[f32; 4]; 4],
    pub crop: [f32; 4],
    pub depth_image_size: [f32; 2],
    pub principal_point: [f32; 2],
    pub focal_length: [f32; 2],
    pub near_clip: f32,
    pub far_clip: f32,
    pub camera_center: [f32; 4],
    pub camera_normal: [f32; 4],
    pub clip_epsilon: f32,
    /// Meters subtracted along the viewing ray
    pub radial_bias: f32,
    pub _padding: [f32; 2],
}

/// All perspectives of a capture plus the atlas layout they are packed in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerspectiveTable {
    pub perspectives: Vec<Perspective>,
    pub texture_width: u32,
    pub texture_height: u32,
    pub num_columns: u32,
    pub num_rows: u32,
    pub bounds_center: Vec3,
    pub bounds_size: Vec3,
}

impl PerspectiveTable {
    /// Build a table and derive per-perspective camera data
    pub fn new(
        perspectives: Vec<Perspective>,
        texture_size: UVec2,
        columns: u32,
        rows: u32,
        bounds_center: Vec3,
        bounds_size: Vec3,
    ) -> EngineResult<Self> {
        let mut table = Self {
            perspectives,
            texture_width: texture_size.x,
            texture_height: texture_size.y,
            num_columns: columns,
            num_rows: rows,
            bounds_center,
            bounds_size,
        };
        table.finish()?;
        Ok(table)
    }

    /// Parse an already-versioned metadata document
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let mut table: Self =
            serde_json::from_str(json).map_err(|e| EngineError::DeserializationError {
                context: "perspective table".to_string(),
                error: e.to_string(),
            })?;
        table.finish()?;
        Ok(table)
    }

    fn finish(&mut self) -> EngineResult<()> {
        if self.perspectives.len() > MAX_PERSPECTIVES {
            return Err(EngineError::InvalidConfig {
                field: "perspectives".to_string(),
                value: self.perspectives.len().to_string(),
                reason: format!("at most {} perspectives are supported", MAX_PERSPECTIVES),
            });
        }
        if (self.num_columns as usize) * (self.num_rows as usize) < self.perspectives.len() {
            return Err(EngineError::InvalidConfig {
                field: "numColumns x numRows".to_string(),
                value: format!("{}x{}", self.num_columns, self.num_rows),
                reason: "atlas grid has fewer cells than perspectives".to_string(),
            });
        }
        for perspective in &mut self.perspectives {
            perspective.derive();
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.perspectives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perspectives.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Perspective> {
        self.perspectives.get(index)
    }

    /// Size of one perspective's color (or depth) half inside the atlas
    pub fn perspective_resolution(&self) -> UVec2 {
        if self.num_columns == 0 || self.num_rows == 0 {
            return UVec2::ZERO;
        }
        UVec2::new(
            self.texture_width / self.num_columns,
            self.texture_height / self.num_rows / 2,
        )
    }

    /// Perspective resolution rounded up to the padding multiple
    pub fn padded_resolution(&self) -> UVec2 {
        let res = self.perspective_resolution();
        UVec2::new(
            res.x.div_ceil(RESOLUTION_PADDING) * RESOLUTION_PADDING,
            res.y.div_ceil(RESOLUTION_PADDING) * RESOLUTION_PADDING,
        )
    }

    /// Top-left texel of a perspective's atlas cell
    pub fn cell_origin(&self, index: usize) -> UVec2 {
        let res = self.perspective_resolution();
        let columns = self.num_columns.max(1) as usize;
        UVec2::new(
            (index % columns) as u32 * res.x,
            (index / columns) as u32 * res.y * 2,
        )
    }

    /// Kernel view of every perspective; `radial_bias_m[i]` is applied to `i`
    pub fn gpu_records(&self, radial_bias_m: &[f32]) -> Vec<PerspectiveGpu> {
        self.perspectives
            .iter()
            .enumerate()
            .map(|(i, p)| p.to_gpu(radial_bias_m.get(i).copied().unwrap_or(0.0)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward_camera() -> Perspective {
        Perspective::new(
            Vec2::splat(64.0),
            Vec2::splat(32.0),
            Vec2::splat(32.0),
            0.1,
            4.0,
            Mat4::IDENTITY,
        )
    }

    #[test]
    fn test_perspective_gpu_layout() {
        assert_eq!(std::mem::size_of::<PerspectiveGpu>(), 160);
    }

    #[test]
    fn test_projection_behind_near_plane_is_unobserved() {
        let camera = forward_camera();
        assert!(camera.project(Vec3::new(0.0, 0.0, 0.05)).is_none());
        let uv = camera.project(Vec3::new(0.0, 0.0, 1.0)).unwrap();
        assert!((uv - Vec2::splat(0.5)).length() < 1e-6);
    }

    #[test]
    fn test_crop_rejects_points_outside() {
        let mut camera = forward_camera();
        camera.crop = Vec4::new(0.0, 0.0, 0.5, 1.0);
        assert!(camera.project(Vec3::new(0.5, 0.0, 1.0)).is_none());
        assert!(camera.project(Vec3::new(-0.5, 0.0, 1.0)).is_some());
    }

    #[test]
    fn test_padded_resolution_rounds_to_eight() {
        let table = PerspectiveTable::new(
            vec![forward_camera()],
            UVec2::new(2 * 61, 2 * 61),
            2,
            1,
            Vec3::ZERO,
            Vec3::ONE,
        )
        .unwrap();
        assert_eq!(table.perspective_resolution(), UVec2::new(61, 61));
        assert_eq!(table.padded_resolution(), UVec2::new(64, 64));
        assert_eq!(table.cell_origin(1), UVec2::new(61, 0));
    }

    #[test]
    fn test_from_json_derives_camera_frame() {
        let json = r#"{
            "perspectives": [{
                "depthImageSize": [64.0, 64.0],
                "depthPrincipalPoint": [32.0, 32.0],
                "depthFocalLength": [30.0, 30.0],
                "nearClip": 0.1,
                "farClip": 3.0,
                "extrinsics": [1.0,0.0,0.0,0.0, 0.0,1.0,0.0,0.0, 0.0,0.0,1.0,0.0, 0.0,0.0,-2.0,1.0]
            }],
            "textureWidth": 64,
            "textureHeight": 128,
            "numColumns": 1,
            "numRows": 1,
            "boundsCenter": [0.0, 0.0, 0.0],
            "boundsSize": [1.0, 1.0, 1.0]
        }"#;
        let table = PerspectiveTable::from_json_str(json).unwrap();
        let camera = &table.perspectives[0];
        assert_eq!(camera.camera_center(), Vec3::new(0.0, 0.0, -2.0));
        assert_eq!(camera.camera_normal(), Vec3::Z);
        assert_eq!(camera.crop, Vec4::new(0.0, 0.0, 1.0, 1.0));
    }

    #[test]
    fn test_too_many_perspectives_rejected() {
        let result = PerspectiveTable::new(
            vec![forward_camera(); MAX_PERSPECTIVES + 1],
            UVec2::new(64, 128),
            MAX_PERSPECTIVES as u32 + 1,
            1,
            Vec3::ZERO,
            Vec3::ONE,
        );
        assert!(matches!(result, Err(EngineError::InvalidConfig { .. })));
    }
}
