//! Volume generation
//!
//! Blends every active perspective's depth into a dense occupancy field.
//! Each perspective contributes a weight `w` and an occupancy `o` per voxel;
//! the field resolves to `Σw·o / Σw`. Single-pass and multi-pass generation
//! add the same terms in the same order, so both produce identical fields.

use super::field::PingPong;
use super::gaussian;
use super::grid::VoxelGrid;
use super::mask::MaskView;
use super::normal_weight::NormalWeightView;
use super::weighting::WeightingParams;
use crate::perspective::{FrameAtlas, PerspectiveGeometry, PerspectiveGpu, PerspectiveTable};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec3, Vec2, Vec3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Below this accumulated weight a voxel resolves to the unknown weight
pub const WEIGHT_EPSILON: f32 = 1.0e-6;

/// Pass flag: start a fresh accumulation
pub const PASS_INIT: u32 = 1;
/// Pass flag: normalise the accumulation into the field
pub const PASS_RESOLVE: u32 = 2;

/// How the volume is accumulated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStrategy {
    /// One dispatch loops over every perspective per voxel
    #[default]
    SinglePass,
    /// One dispatch per active perspective
    MultiPass,
}

/// One dispatch of the multi-pass strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiPassStep {
    pub perspective: Option<u32>,
    pub init: bool,
    pub resolve: bool,
}

impl MultiPassStep {
    pub fn flags(&self) -> u32 {
        (if self.init { PASS_INIT } else { 0 }) | (if self.resolve { PASS_RESOLVE } else { 0 })
    }
}

/// Dispatch plan for the active perspectives, in order.
///
/// With no active perspective a single init+resolve step still runs so the
/// field resolves to the unknown weight.
pub fn multi_pass_plan(active: &[u32]) -> Vec<MultiPassStep> {
    if active.is_empty() {
        return vec![MultiPassStep {
            perspective: None,
            init: true,
            resolve: true,
        }];
    }
    let last = active.len() - 1;
    active
        .iter()
        .enumerate()
        .map(|(step, &perspective)| MultiPassStep {
            perspective: Some(perspective),
            init: step == 0,
            resolve: step == last,
        })
        .collect()
}

/// Volume pass parameters, shared by the CPU and WGSL kernels
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct VolumeUniforms {
    pub dims: [u32; 3],
    pub lod_stride: u32,
    pub lod_dims: [u32; 3],
    pub perspective_count: u32,
    pub bounds_min: [f32; 3],
    pub truncation: f32,
    pub voxel_size: [f32; 3],
    pub weight_unknown: f32,
    pub weight_unseen_max: f32,
    pub weight_unseen_min: f32,
    pub weight_unseen_falloff_power: f32,
    pub weight_in_front_max: f32,
    pub weight_in_front_min: f32,
    pub mask_enabled: u32,
    /// Perspective of a multi-pass step
    pub pass_perspective: u32,
    pub pass_flags: u32,
    pub atlas_width: u32,
    pub atlas_columns: u32,
    pub resolution: [u32; 2],
    pub mask_width: u32,
    pub mask_height: u32,
    pub mask_scale: u32,
    pub mask_channels: u32,
    pub atlas_height: u32,
    pub normal_enabled: u32,
    pub normal_width: u32,
    pub normal_height: u32,
    pub normal_reduction: u32,
    pub _padding: [u32; 3],
}

impl VolumeUniforms {
    pub fn new(
        grid: &VoxelGrid,
        lod_stride: u32,
        table: &PerspectiveTable,
        weights: &WeightingParams,
    ) -> Self {
        let voxel = grid.voxel_size();
        let stride = lod_stride.max(1);
        Self {
            dims: grid.dims.to_array(),
            lod_stride: stride,
            lod_dims: grid.lod_dims(stride).to_array(),
            perspective_count: table.len() as u32,
            bounds_min: grid.bounds.min().to_array(),
            truncation: 4.0 * voxel.max_element() * stride as f32,
            voxel_size: voxel.to_array(),
            weight_unknown: weights.weight_unknown,
            weight_unseen_max: weights.weight_unseen_max,
            weight_unseen_min: weights.weight_unseen_min,
            weight_unseen_falloff_power: weights.weight_unseen_falloff_power,
            weight_in_front_max: weights.weight_in_front_max,
            weight_in_front_min: weights.weight_in_front_min,
            mask_enabled: 0,
            pass_perspective: 0,
            pass_flags: PASS_INIT | PASS_RESOLVE,
            atlas_width: table.texture_width,
            atlas_columns: table.num_columns.max(1),
            resolution: table.perspective_resolution().to_array(),
            mask_width: 0,
            mask_height: 0,
            mask_scale: 1,
            mask_channels: 1,
            atlas_height: table.texture_height,
            normal_enabled: 0,
            normal_width: 0,
            normal_height: 0,
            normal_reduction: 1,
            _padding: [0; 3],
        }
    }

    /// Sample `mask` for every known contribution
    pub fn with_mask(self, mask: &MaskView<'_>) -> Self {
        self.with_mask_dims(mask.width(), mask.height(), mask.scale(), mask.channels())
    }

    /// Same as [`with_mask`](Self::with_mask) for a mask living in a GPU buffer
    pub fn with_mask_dims(mut self, width: u32, height: u32, scale: u32, channels: u32) -> Self {
        self.mask_enabled = 1;
        self.mask_width = width;
        self.mask_height = height;
        self.mask_scale = scale;
        self.mask_channels = channels;
        self
    }

    /// Scale every known contribution by the per-pixel normal weights
    pub fn with_normal_weights(mut self, width: u32, height: u32, reduction: u32) -> Self {
        self.normal_enabled = 1;
        self.normal_width = width;
        self.normal_height = height;
        self.normal_reduction = reduction.max(1);
        self
    }

    /// Index the atlas by the uploaded frame's own size
    pub fn with_atlas_size(mut self, width: u32, height: u32) -> Self {
        self.atlas_width = width;
        self.atlas_height = height;
        self
    }

    pub fn for_step(mut self, step: &MultiPassStep) -> Self {
        self.pass_perspective = step.perspective.unwrap_or(u32::MAX);
        self.pass_flags = step.flags();
        self
    }

    fn weights(&self) -> WeightingParams {
        WeightingParams {
            weight_unknown: self.weight_unknown,
            weight_unseen_max: self.weight_unseen_max,
            weight_unseen_min: self.weight_unseen_min,
            weight_unseen_falloff_power: self.weight_unseen_falloff_power,
            weight_in_front_max: self.weight_in_front_max,
            weight_in_front_min: self.weight_in_front_min,
        }
    }
}

/// Everything a volume pass reads besides its uniforms
#[derive(Clone, Copy)]
pub struct VolumeInputs<'a> {
    pub frame: &'a FrameAtlas,
    pub perspectives: &'a [PerspectiveGpu],
    pub geometry: &'a [PerspectiveGeometry],
    pub mask: Option<MaskView<'a>>,
    pub normals: Option<NormalWeightView<'a>>,
}

/// Metric depth of a perspective pixel straight from the atlas
fn atlas_depth(
    frame: &FrameAtlas,
    uniforms: &VolumeUniforms,
    perspective: &PerspectiveGpu,
    index: u32,
    px: u32,
    py: u32,
) -> Option<f32> {
    let res = uniforms.resolution;
    let columns = uniforms.atlas_columns.max(1);
    let x = (index % columns) * res[0] + px;
    let y = (index / columns) * res[1] * 2 + res[1] + py;
    let normalized = frame.texel(x, y)?[0];
    if normalized <= perspective.clip_epsilon {
        return None;
    }
    Some(perspective.near_clip + normalized * (perspective.far_clip - perspective.near_clip))
}

/// Weight and occupancy one perspective gives a voxel centre
pub fn contribution(
    uniforms: &VolumeUniforms,
    inputs: &VolumeInputs<'_>,
    index: u32,
    local: Vec3,
) -> (f32, f32) {
    let Some(perspective) = inputs.perspectives.get(index as usize) else {
        return (0.0, 0.0);
    };
    let geometry = inputs.geometry.get(index as usize).copied().unwrap_or_default();
    let unknown_weight = if geometry.override_weight_unknown != 0 {
        geometry.weight_unknown
    } else {
        uniforms.weight_unknown
    };
    let unknown = (unknown_weight, 0.0);

    let camera = Mat4::from_cols_array_2d(&perspective.extrinsics_inverse).transform_point3(local);
    if camera.z <= perspective.near_clip {
        return unknown;
    }
    let pixel = Vec2::from_array(perspective.focal_length) * Vec2::new(camera.x, camera.y) / camera.z
        + Vec2::from_array(perspective.principal_point);
    let uv = pixel / Vec2::from_array(perspective.depth_image_size);
    let crop = perspective.crop;
    if uv.x < crop[0] || uv.y < crop[1] || uv.x >= crop[0] + crop[2] || uv.y >= crop[1] + crop[3] {
        return unknown;
    }

    let res = uniforms.resolution;
    let px = ((uv.x * res[0] as f32) as u32).min(res[0].saturating_sub(1));
    let py = ((uv.y * res[1] as f32) as u32).min(res[1].saturating_sub(1));
    let Some(depth) = atlas_depth(inputs.frame, uniforms, perspective, index, px, py) else {
        return unknown;
    };

    let corrected = depth - perspective.radial_bias * camera.z / camera.length();
    let signed = corrected - camera.z;
    let truncation = uniforms.truncation.max(1.0e-6);
    let occupancy = (0.5 - 0.5 * signed / truncation).clamp(0.0, 1.0);

    let weights = uniforms.weights();
    let view_weight = geometry.view_dependent_weight;
    let mut weight = if signed >= 0.0 {
        weights.in_front_weight(signed / truncation, view_weight, geometry.view_dependent_in_front_amount)
    } else {
        weights.unseen_weight(-signed / truncation, view_weight, geometry.view_dependent_unseen_amount)
    };
    if uniforms.mask_enabled != 0 {
        if let Some(mask) = inputs.mask.as_ref() {
            weight *= mask.confidence(index, px, py);
        }
    }
    if uniforms.normal_enabled != 0 {
        if let Some(normals) = inputs.normals.as_ref() {
            weight *= normals.weight(index, px, py);
        }
    }
    (weight, occupancy)
}

fn resolve(uniforms: &VolumeUniforms, weighted: f32, weight: f32) -> f32 {
    if weight > WEIGHT_EPSILON {
        weighted / weight
    } else {
        uniforms.weight_unknown
    }
}

fn voxel_center(uniforms: &VolumeUniforms, coord: UVec3) -> Vec3 {
    Vec3::from_array(uniforms.bounds_min) + (coord.as_vec3() + 0.5) * Vec3::from_array(uniforms.voxel_size)
}

/// Grid coordinate of `index` when it is an LOD sample point
fn sample_coord(uniforms: &VolumeUniforms, index: usize) -> Option<UVec3> {
    let dims = uniforms.dims;
    let (dx, dy) = (dims[0] as usize, dims[1] as usize);
    let coord = UVec3::new((index % dx) as u32, ((index / dx) % dy) as u32, (index / (dx * dy)) as u32);
    VoxelGrid::is_lod_sample(coord, uniforms.lod_stride).then_some(coord)
}

/// Single-pass kernel: every enabled perspective, then resolve
pub fn generate_single_pass(uniforms: &VolumeUniforms, inputs: &VolumeInputs<'_>, field: &mut [f32]) {
    field.par_iter_mut().enumerate().for_each(|(index, out)| {
        let Some(coord) = sample_coord(uniforms, index) else {
            return;
        };
        let local = voxel_center(uniforms, coord);
        let mut weighted = 0.0f32;
        let mut weight = 0.0f32;
        for perspective in 0..uniforms.perspective_count {
            let enabled = inputs
                .geometry
                .get(perspective as usize)
                .map(|g| g.enabled != 0)
                .unwrap_or(false);
            if !enabled {
                continue;
            }
            let (w, o) = contribution(uniforms, inputs, perspective, local);
            weighted += w * o;
            weight += w;
        }
        *out = resolve(uniforms, weighted, weight);
    });
}

/// One multi-pass step; `field` holds `Σw·o` and `weights` holds `Σw`
pub fn generate_multi_pass_step(
    uniforms: &VolumeUniforms,
    inputs: &VolumeInputs<'_>,
    field: &mut [f32],
    weights: &mut [f32],
) {
    let init = uniforms.pass_flags & PASS_INIT != 0;
    let finish = uniforms.pass_flags & PASS_RESOLVE != 0;
    let perspective = uniforms.pass_perspective;
    let has_perspective = perspective < uniforms.perspective_count;

    field
        .par_iter_mut()
        .zip(weights.par_iter_mut())
        .enumerate()
        .for_each(|(index, (weighted, weight))| {
            let Some(coord) = sample_coord(uniforms, index) else {
                return;
            };
            if init {
                *weighted = 0.0;
                *weight = 0.0;
            }
            if has_perspective {
                let (w, o) = contribution(uniforms, inputs, perspective, voxel_center(uniforms, coord));
                *weighted += w * o;
                *weight += w;
            }
            if finish {
                *weighted = resolve(uniforms, *weighted, *weight);
            }
        });
}

/// CPU volume generator owning the double-buffered field
#[derive(Debug)]
pub struct VolumeGenerator {
    grid: Option<VoxelGrid>,
    field: PingPong<Vec<f32>>,
}

impl Default for VolumeGenerator {
    fn default() -> Self {
        Self {
            grid: None,
            field: PingPong::new(Vec::new(), Vec::new()),
        }
    }
}

impl VolumeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt `grid`. Returns true when the field buffers were reallocated.
    pub fn resize(&mut self, grid: VoxelGrid) -> bool {
        let total = grid.total_voxels();
        let reallocate = self.field.current().len() != total;
        if reallocate {
            self.field = PingPong::new(vec![0.0; total], vec![0.0; total]);
        }
        self.grid = Some(grid);
        reallocate
    }

    pub fn grid(&self) -> Option<&VoxelGrid> {
        self.grid.as_ref()
    }

    pub fn field(&self) -> &PingPong<Vec<f32>> {
        &self.field
    }

    /// Resolved field values (the current side)
    pub fn values(&self) -> &[f32] {
        self.field.current()
    }

    pub fn generate(
        &mut self,
        strategy: GenerationStrategy,
        uniforms: &VolumeUniforms,
        inputs: &VolumeInputs<'_>,
        active: &[u32],
    ) {
        match strategy {
            GenerationStrategy::SinglePass => {
                generate_single_pass(uniforms, inputs, self.field.current_mut());
            }
            GenerationStrategy::MultiPass => {
                for step in multi_pass_plan(active) {
                    let pass = uniforms.for_step(&step);
                    let (field, weights) = self.field.split_mut();
                    generate_multi_pass_step(&pass, inputs, field, weights);
                }
            }
        }
    }

    /// Three-axis smoothing at the current LOD stride
    pub fn smooth(&mut self, sigma: f32, lod_stride: u32) {
        let Some(grid) = self.grid else {
            return;
        };
        gaussian::smooth_field(&mut self.field, sigma, grid.dims, grid.lod_dims(lod_stride), lod_stride);
    }

    pub fn release(&mut self) {
        self.grid = None;
        self.field = PingPong::new(Vec::new(), Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::grid::VolumeBounds;
    use crate::perspective::synthetic::SyntheticCapture;

    #[test]
    fn test_volume_uniforms_layout() {
        assert_eq!(std::mem::size_of::<VolumeUniforms>(), 160);
    }

    #[test]
    fn test_multi_pass_plan_shapes() {
        assert_eq!(
            multi_pass_plan(&[]),
            vec![MultiPassStep { perspective: None, init: true, resolve: true }]
        );
        assert_eq!(
            multi_pass_plan(&[3]),
            vec![MultiPassStep { perspective: Some(3), init: true, resolve: true }]
        );
        let plan = multi_pass_plan(&[0, 2, 5]);
        assert_eq!(plan.len(), 3);
        assert!(plan[0].init && !plan[0].resolve);
        assert!(!plan[1].init && !plan[1].resolve);
        assert!(!plan[2].init && plan[2].resolve);
    }

    #[test]
    fn test_plane_contribution_sign() {
        let capture = SyntheticCapture::facing_plane(32, 1.0, Vec3::new(0.0, 0.0, 1.0), Vec3::ONE).unwrap();
        let grid = VoxelGrid::new(VolumeBounds::new(Vec3::new(0.0, 0.0, 1.0), Vec3::ONE), 50.0);
        let uniforms = VolumeUniforms::new(&grid, 1, &capture.table, &WeightingParams::default());
        let perspectives = capture.table.gpu_records(&[0.0]);
        let geometry = [PerspectiveGeometry::default()];
        let inputs = VolumeInputs {
            frame: &capture.frame,
            perspectives: &perspectives,
            geometry: &geometry,
            mask: None,
            normals: None,
        };

        let (w_front, o_front) = contribution(&uniforms, &inputs, 0, Vec3::new(0.0, 0.0, 0.9));
        assert_eq!(o_front, 0.0);
        assert!((w_front - 0.1).abs() < 1e-5);
        let (_, o_behind) = contribution(&uniforms, &inputs, 0, Vec3::new(0.0, 0.0, 1.1));
        assert_eq!(o_behind, 1.0);
        let (w_unknown, o_unknown) = contribution(&uniforms, &inputs, 0, Vec3::new(0.0, 0.0, 0.05));
        assert_eq!((w_unknown, o_unknown), (0.005, 0.0));
    }

    #[test]
    fn test_radial_bias_pulls_surface_toward_sensor() {
        let capture = SyntheticCapture::facing_plane(32, 1.0, Vec3::new(0.0, 0.0, 1.0), Vec3::ONE).unwrap();
        let grid = VoxelGrid::new(VolumeBounds::new(Vec3::new(0.0, 0.0, 1.0), Vec3::ONE), 50.0);
        let uniforms = VolumeUniforms::new(&grid, 1, &capture.table, &WeightingParams::default());
        let geometry = [PerspectiveGeometry::default()];
        let unbiased = capture.table.gpu_records(&[0.0]);
        let biased = capture.table.gpu_records(&[0.02]);
        let at = Vec3::new(0.0, 0.0, 0.99);
        let sample = |perspectives: &[PerspectiveGpu]| {
            let inputs = VolumeInputs {
                frame: &capture.frame,
                perspectives,
                geometry: &geometry,
                mask: None,
                normals: None,
            };
            contribution(&uniforms, &inputs, 0, at).1
        };
        assert!(sample(&biased) > sample(&unbiased));
    }

    #[test]
    fn test_weight_unknown_override() {
        let capture = SyntheticCapture::facing_plane(32, 1.0, Vec3::new(0.0, 0.0, 1.0), Vec3::ONE).unwrap();
        let grid = VoxelGrid::new(VolumeBounds::new(Vec3::new(0.0, 0.0, 1.0), Vec3::ONE), 50.0);
        let uniforms = VolumeUniforms::new(&grid, 1, &capture.table, &WeightingParams::default());
        let perspectives = capture.table.gpu_records(&[0.0]);
        let geometry = [PerspectiveGeometry {
            override_weight_unknown: 1,
            weight_unknown: 0.03,
            ..Default::default()
        }];
        let inputs = VolumeInputs {
            frame: &capture.frame,
            perspectives: &perspectives,
            geometry: &geometry,
            mask: None,
            normals: None,
        };
        let (w, _) = contribution(&uniforms, &inputs, 0, Vec3::new(0.0, 0.0, 0.05));
        assert_eq!(w, 0.03);
    }

    #[test]
    fn test_normal_weights_scale_known_contributions() {
        use crate::fusion::normal_weight::NormalWeightLayout;
        use glam::UVec2;

        let capture = SyntheticCapture::facing_plane(32, 1.0, Vec3::new(0.0, 0.0, 1.0), Vec3::ONE).unwrap();
        let grid = VoxelGrid::new(VolumeBounds::new(Vec3::new(0.0, 0.0, 1.0), Vec3::ONE), 50.0);
        let uniforms = VolumeUniforms::new(&grid, 1, &capture.table, &WeightingParams::default())
            .with_normal_weights(32, 32, 1);
        let perspectives = capture.table.gpu_records(&[0.0]);
        let geometry = [PerspectiveGeometry::default()];
        let layout = NormalWeightLayout {
            resolution: UVec2::splat(32),
            slices: 1,
            reduction: 1,
        };
        let values = vec![0.5; layout.texel_count()];
        let inputs = VolumeInputs {
            frame: &capture.frame,
            perspectives: &perspectives,
            geometry: &geometry,
            mask: None,
            normals: Some(NormalWeightView {
                layout: &layout,
                values: &values,
            }),
        };

        let (w_front, _) = contribution(&uniforms, &inputs, 0, Vec3::new(0.0, 0.0, 0.9));
        assert!((w_front - 0.05).abs() < 1e-5);
        // Unknown samples keep their weight
        let (w_unknown, _) = contribution(&uniforms, &inputs, 0, Vec3::new(0.0, 0.0, 0.05));
        assert_eq!(w_unknown, 0.005);
    }
}
