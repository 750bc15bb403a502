//! Per-pixel normal weights
//!
//! Every perspective pixel gets a weight from how squarely its surface faces
//! the sensor. Surface normals come from differences of the unprojected depth
//! around the pixel; grazing samples carry less weight in the volume blend.
//! The weights are stored per perspective at `resolution / resolution_reduction`.

use crate::perspective::{FrameAtlas, PerspectiveGpu, PerspectiveTable};
use bytemuck::{Pod, Zeroable};
use glam::{IVec2, UVec2, Vec2, Vec3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Largest supported resolution reduction
pub const MAX_NORMAL_REDUCTION: u32 = 4;

/// Normal weight configuration (`[normal_weights]` section)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalWeightSettings {
    pub enabled: bool,
    /// Weight texture divisor in `1..=4`
    pub resolution_reduction: u32,
    /// Exponent applied to the facing cosine
    pub falloff_power: f32,
    /// Floor for grazing and back-facing samples
    pub min_weight: f32,
}

impl Default for NormalWeightSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            resolution_reduction: 1,
            falloff_power: 1.0,
            min_weight: 0.05,
        }
    }
}

impl NormalWeightSettings {
    pub fn clamped(self) -> Self {
        Self {
            resolution_reduction: self.resolution_reduction.clamp(1, MAX_NORMAL_REDUCTION),
            falloff_power: self.falloff_power.clamp(0.0, 8.0),
            min_weight: self.min_weight.clamp(0.0, 1.0),
            ..self
        }
    }
}

/// Size of the weight array for one perspective table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalWeightLayout {
    pub resolution: UVec2,
    pub slices: u32,
    pub reduction: u32,
}

impl NormalWeightLayout {
    pub fn new(table: &PerspectiveTable, reduction: u32) -> Self {
        Self {
            resolution: table.perspective_resolution(),
            slices: table.len() as u32,
            reduction: reduction.max(1),
        }
    }

    pub fn width(&self) -> u32 {
        (self.resolution.x / self.reduction).max(1)
    }

    pub fn height(&self) -> u32 {
        (self.resolution.y / self.reduction).max(1)
    }

    pub fn texel_count(&self) -> usize {
        self.width() as usize * self.height() as usize * self.slices as usize
    }

    pub fn is_empty(&self) -> bool {
        self.slices == 0 || self.resolution.x == 0 || self.resolution.y == 0
    }
}

/// Normal weight pass parameters, shared by the CPU and WGSL kernels
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct NormalWeightUniforms {
    pub width: u32,
    pub height: u32,
    pub slices: u32,
    pub reduction: u32,
    pub resolution: [u32; 2],
    pub atlas_width: u32,
    pub atlas_columns: u32,
    pub atlas_height: u32,
    pub falloff_power: f32,
    pub min_weight: f32,
    pub _padding: u32,
}

impl NormalWeightUniforms {
    pub fn new(layout: &NormalWeightLayout, settings: &NormalWeightSettings, table: &PerspectiveTable) -> Self {
        Self {
            width: layout.width(),
            height: layout.height(),
            slices: layout.slices,
            reduction: layout.reduction,
            resolution: layout.resolution.to_array(),
            atlas_width: table.texture_width,
            atlas_columns: table.num_columns.max(1),
            atlas_height: table.texture_height,
            falloff_power: settings.falloff_power,
            min_weight: settings.min_weight,
            _padding: 0,
        }
    }

    pub fn with_atlas_size(mut self, width: u32, height: u32) -> Self {
        self.atlas_width = width;
        self.atlas_height = height;
        self
    }
}

fn decoded_depth(
    frame: &FrameAtlas,
    uniforms: &NormalWeightUniforms,
    perspective: &PerspectiveGpu,
    slice: u32,
    pixel: IVec2,
) -> Option<f32> {
    let res = UVec2::from_array(uniforms.resolution).as_ivec2();
    if pixel.x < 0 || pixel.y < 0 || pixel.x >= res.x || pixel.y >= res.y {
        return None;
    }
    let columns = uniforms.atlas_columns.max(1);
    let x = (slice % columns) * res.x as u32 + pixel.x as u32;
    let y = (slice / columns) * res.y as u32 * 2 + res.y as u32 + pixel.y as u32;
    let normalized = frame.texel(x, y)?[0];
    if normalized <= perspective.clip_epsilon {
        return None;
    }
    Some(perspective.near_clip + normalized * (perspective.far_clip - perspective.near_clip))
}

/// Camera-space point of a perspective pixel, radial bias applied
fn unproject(uniforms: &NormalWeightUniforms, perspective: &PerspectiveGpu, pixel: IVec2, depth: f32) -> Vec3 {
    let res = UVec2::from_array(uniforms.resolution).as_vec2();
    let image = (pixel.as_vec2() + 0.5) / res * Vec2::from_array(perspective.depth_image_size);
    let ray = ((image - Vec2::from_array(perspective.principal_point)) / Vec2::from_array(perspective.focal_length))
        .extend(1.0);
    ray * (depth - perspective.radial_bias / ray.length())
}

/// Weight of one texel. Pixels without depth or without a usable normal
/// keep the neutral weight 1.
pub fn normal_weight_texel(
    frame: &FrameAtlas,
    perspectives: &[PerspectiveGpu],
    uniforms: &NormalWeightUniforms,
    slice: u32,
    x: u32,
    y: u32,
) -> f32 {
    let Some(perspective) = perspectives.get(slice as usize) else {
        return 1.0;
    };
    let res = UVec2::from_array(uniforms.resolution);
    if res.x == 0 || res.y == 0 {
        return 1.0;
    }
    let reduction = uniforms.reduction.max(1);
    let pixel = UVec2::new(
        (x * reduction + reduction / 2).min(res.x - 1),
        (y * reduction + reduction / 2).min(res.y - 1),
    )
    .as_ivec2();

    let point = |at: IVec2| {
        decoded_depth(frame, uniforms, perspective, slice, at).map(|depth| unproject(uniforms, perspective, at, depth))
    };
    let Some(center) = point(pixel) else {
        return 1.0;
    };

    // Central difference, one-sided where a neighbour has no depth
    let step = reduction as i32;
    let tangent = |offset: IVec2| match (point(pixel + offset), point(pixel - offset)) {
        (Some(a), Some(b)) => Some(a - b),
        (Some(a), None) => Some(a - center),
        (None, Some(b)) => Some(center - b),
        (None, None) => None,
    };
    let (Some(tx), Some(ty)) = (tangent(IVec2::new(step, 0)), tangent(IVec2::new(0, step))) else {
        return 1.0;
    };

    let normal = tx.cross(ty);
    let length = normal.length();
    let distance = center.length();
    if length <= f32::EPSILON || distance <= f32::EPSILON {
        return 1.0;
    }
    let facing = (normal.dot(center) / (length * distance)).abs();
    let shaped = if facing > 0.0 {
        facing.powf(uniforms.falloff_power)
    } else {
        0.0
    };
    shaped.max(uniforms.min_weight).min(1.0)
}

/// Weights the volume pass samples
#[derive(Debug, Clone, Copy)]
pub struct NormalWeightView<'a> {
    pub layout: &'a NormalWeightLayout,
    pub values: &'a [f32],
}

impl NormalWeightView<'_> {
    /// Weight at a perspective pixel
    pub fn weight(&self, slice: u32, px: u32, py: u32) -> f32 {
        let (width, height) = (self.layout.width(), self.layout.height());
        let reduction = self.layout.reduction.max(1);
        let x = (px / reduction).min(width - 1);
        let y = (py / reduction).min(height - 1);
        let texel = ((slice * height + y) * width + x) as usize;
        self.values.get(texel).copied().unwrap_or(1.0)
    }
}

/// CPU normal weight generator
#[derive(Debug, Default)]
pub struct NormalWeightGenerator {
    settings: NormalWeightSettings,
    layout: Option<NormalWeightLayout>,
    weights: Vec<f32>,
}

impl NormalWeightGenerator {
    pub fn new(settings: NormalWeightSettings) -> Self {
        Self {
            settings: settings.clamped(),
            ..Default::default()
        }
    }

    pub fn settings(&self) -> &NormalWeightSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: NormalWeightSettings) {
        self.settings = settings.clamped();
    }

    /// Size the weights for `table`. Returns true when storage was reallocated.
    pub fn ensure_texture(&mut self, table: &PerspectiveTable) -> bool {
        let layout = NormalWeightLayout::new(table, self.settings.resolution_reduction);
        if self.layout == Some(layout) {
            return false;
        }
        log::debug!(
            "[NormalWeightGenerator] Weights resized to {}x{}x{}",
            layout.width(),
            layout.height(),
            layout.slices
        );
        self.weights = vec![1.0; layout.texel_count()];
        self.layout = Some(layout);
        true
    }

    pub fn layout(&self) -> Option<&NormalWeightLayout> {
        self.layout.as_ref()
    }

    /// Fill the weights from `frame`. Returns false when nothing was produced.
    pub fn generate(&mut self, frame: &FrameAtlas, table: &PerspectiveTable, perspectives: &[PerspectiveGpu]) -> bool {
        self.ensure_texture(table);
        let Some(layout) = self.layout else {
            return false;
        };
        if layout.is_empty() || !frame.matches(table) {
            return false;
        }

        let uniforms = NormalWeightUniforms::new(&layout, &self.settings, table);
        let width = layout.width() as usize;
        let plane = width * layout.height() as usize;
        self.weights.par_iter_mut().enumerate().for_each(|(index, out)| {
            let slice = (index / plane) as u32;
            let x = ((index % plane) % width) as u32;
            let y = ((index % plane) / width) as u32;
            *out = normal_weight_texel(frame, perspectives, &uniforms, slice, x, y);
        });
        true
    }

    pub fn view(&self) -> Option<NormalWeightView<'_>> {
        Some(NormalWeightView {
            layout: self.layout.as_ref()?,
            values: &self.weights,
        })
    }

    pub fn release(&mut self) {
        self.layout = None;
        self.weights = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perspective::synthetic::{look_at, pinhole, Shape, SyntheticCapture};

    fn generate(capture: &SyntheticCapture, settings: NormalWeightSettings) -> NormalWeightGenerator {
        let perspectives = capture.table.gpu_records(&vec![0.0; capture.table.len()]);
        let mut generator = NormalWeightGenerator::new(settings);
        assert!(generator.generate(&capture.frame, &capture.table, &perspectives));
        generator
    }

    #[test]
    fn test_uniform_layout() {
        assert_eq!(std::mem::size_of::<NormalWeightUniforms>(), 48);
    }

    #[test]
    fn test_facing_plane_weighs_fully_at_center() {
        let capture = SyntheticCapture::facing_plane(32, 1.0, Vec3::new(0.0, 0.0, 1.0), Vec3::ONE).unwrap();
        let generator = generate(&capture, NormalWeightSettings::default());
        let view = generator.view().unwrap();
        let center = view.weight(0, 16, 16);
        assert!((center - 1.0).abs() < 1e-2, "center weight {}", center);
        // Off-axis rays meet the plane at an angle
        assert!(view.weight(0, 0, 0) < center);
    }

    #[test]
    fn test_oblique_plane_weighs_less() {
        let camera = pinhole(32, 30.0, 0.1, 3.0, look_at(Vec3::ZERO, Vec3::Z, Vec3::Y));
        let normal = Vec3::new(0.0, 60f32.to_radians().sin(), -60f32.to_radians().cos());
        let capture = SyntheticCapture::render(
            vec![camera],
            1,
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::ONE,
            &[Shape::Plane {
                point: Vec3::new(0.0, 0.0, 1.0),
                normal,
            }],
        )
        .unwrap();
        let generator = generate(&capture, NormalWeightSettings::default());
        let weight = generator.view().unwrap().weight(0, 16, 16);
        assert!((weight - 0.5).abs() < 0.05, "oblique weight {}", weight);
    }

    #[test]
    fn test_reduction_divides_resolution() {
        let capture = SyntheticCapture::sphere_ring(2, 32, 0.3).unwrap();
        let generator = generate(
            &capture,
            NormalWeightSettings {
                resolution_reduction: 4,
                ..Default::default()
            },
        );
        let layout = *generator.layout().unwrap();
        assert_eq!((layout.width(), layout.height(), layout.slices), (8, 8, 2));
        assert_eq!(generator.view().unwrap().values.len(), 8 * 8 * 2);
    }

    #[test]
    fn test_pixels_without_depth_stay_neutral() {
        let capture = SyntheticCapture::sphere_ring(1, 32, 0.3).unwrap();
        let generator = generate(&capture, NormalWeightSettings::default());
        let view = generator.view().unwrap();
        // The sphere does not reach the image corner
        assert_eq!(view.weight(0, 0, 0), 1.0);
        assert!(view.values.iter().all(|w| (0.05..=1.0).contains(w)));
    }

    #[test]
    fn test_settings_are_clamped() {
        let mut generator = NormalWeightGenerator::new(NormalWeightSettings {
            resolution_reduction: 9,
            ..Default::default()
        });
        assert_eq!(generator.settings().resolution_reduction, MAX_NORMAL_REDUCTION);
        generator.set_settings(NormalWeightSettings {
            resolution_reduction: 0,
            min_weight: 2.0,
            ..Default::default()
        });
        assert_eq!(generator.settings().resolution_reduction, 1);
        assert_eq!(generator.settings().min_weight, 1.0);
    }
}
