//! Edge mask generation
//!
//! Per-perspective confidence derived from depth discontinuities. A Sobel
//! pass writes one slice per perspective at `padded / scale`, an optional
//! separable blur softens it, and an optional min/max halving chain reduces it
//! to `padded / downscale`.

use super::field::PingPong;
use super::gaussian;
use crate::perspective::{FrameAtlas, PerspectiveTable};
use bytemuck::{Pod, Zeroable};
use glam::UVec2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Largest supported mask scale
pub const MAX_MASK_SCALE: u32 = 8;

/// Edge mask configuration (`[mask]` section)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskSettings {
    pub enabled: bool,
    /// Mask resolution divisor, a power of two in `1..=8`
    pub scale: u32,
    /// Requested downscale factor; values at or below `scale` disable the chain
    pub downscale: u32,
    /// Sobel neighbour distance in pixels
    pub invalidate_edge_width: f32,
    pub invalidate_strength: f32,
    /// Depth step (cm) that fully invalidates a pixel at strength 1
    pub sobel_multiplier_cm: f32,
    pub blur_enabled: bool,
    pub blur_radius: f32,
}

impl Default for MaskSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            scale: 1,
            downscale: 0,
            invalidate_edge_width: 1.0,
            invalidate_strength: 1.0,
            sobel_multiplier_cm: 0.5,
            blur_enabled: false,
            blur_radius: 0.3,
        }
    }
}

fn floor_power_of_two(value: u32) -> u32 {
    if value == 0 {
        1
    } else {
        1 << value.ilog2()
    }
}

impl MaskSettings {
    pub fn effective_scale(&self) -> u32 {
        floor_power_of_two(self.scale.clamp(1, MAX_MASK_SCALE))
    }

    pub fn effective_downscale(&self) -> u32 {
        floor_power_of_two(self.downscale.max(self.effective_scale()))
    }

    /// Number of halving passes between the mask and the downscaled mask
    pub fn downscale_levels(&self) -> u32 {
        self.effective_downscale().ilog2() - self.effective_scale().ilog2()
    }

    pub fn clamped(self) -> Self {
        Self {
            scale: self.effective_scale(),
            invalidate_edge_width: self.invalidate_edge_width.clamp(0.0, 10.0),
            invalidate_strength: self.invalidate_strength.clamp(1.0, 10.0),
            sobel_multiplier_cm: self.sobel_multiplier_cm.clamp(0.1, 100.0),
            blur_radius: self.blur_radius.max(0.0),
            ..self
        }
    }

    pub fn neighbour_step(&self) -> u32 {
        self.invalidate_edge_width.round().max(1.0) as u32
    }
}

/// Size of the mask array for one perspective table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskLayout {
    pub resolution: UVec2,
    pub padded: UVec2,
    pub slices: u32,
    pub scale: u32,
}

impl MaskLayout {
    pub fn new(table: &PerspectiveTable, scale: u32) -> Self {
        Self {
            resolution: table.perspective_resolution(),
            padded: table.padded_resolution(),
            slices: table.len() as u32,
            scale: scale.max(1),
        }
    }

    pub fn width(&self) -> u32 {
        self.padded.x / self.scale
    }

    pub fn height(&self) -> u32 {
        self.padded.y / self.scale
    }

    pub fn texel_count(&self) -> usize {
        self.width() as usize * self.height() as usize * self.slices as usize
    }

    pub fn is_empty(&self) -> bool {
        self.texel_count() == 0
    }
}

/// Sobel pass parameters, shared by the CPU and WGSL kernels
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MaskUniforms {
    pub mask_width: u32,
    pub mask_height: u32,
    pub slices: u32,
    pub scale: u32,
    pub resolution: [u32; 2],
    pub atlas_width: u32,
    pub atlas_columns: u32,
    pub step: u32,
    pub strength: f32,
    /// Sobel multiplier in meters
    pub sobel_multiplier: f32,
    pub _padding: u32,
}

impl MaskUniforms {
    pub fn new(layout: &MaskLayout, settings: &MaskSettings, table: &PerspectiveTable) -> Self {
        Self {
            mask_width: layout.width(),
            mask_height: layout.height(),
            slices: layout.slices,
            scale: layout.scale,
            resolution: layout.resolution.to_array(),
            atlas_width: table.texture_width,
            atlas_columns: table.num_columns,
            step: settings.neighbour_step(),
            strength: settings.invalidate_strength,
            sobel_multiplier: settings.sobel_multiplier_cm / 100.0,
            _padding: 0,
        }
    }
}

/// Min/max halving pass parameters
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DownscaleUniforms {
    pub src_width: u32,
    pub src_height: u32,
    pub dst_width: u32,
    pub dst_height: u32,
    pub slices: u32,
    /// 1 for the plain mask, 2 for a min/max image
    pub src_channels: u32,
    pub _padding: [u32; 2],
}

/// Sizes of every pass in the halving chain, last entry = final size
pub fn downscale_chain(layout: &MaskLayout, downscale: u32) -> Vec<UVec2> {
    let levels = downscale.max(layout.scale).ilog2().saturating_sub(layout.scale.ilog2());
    let mut sizes = Vec::with_capacity(levels as usize);
    let mut size = UVec2::new(layout.width(), layout.height());
    for level in 0..levels {
        size /= 2;
        if level + 1 == levels {
            size = layout.padded / downscale;
        }
        sizes.push(size.max(UVec2::ONE));
    }
    sizes
}

/// Confidence of one mask texel from the atlas depth
pub fn sobel_texel(
    frame: &FrameAtlas,
    table: &PerspectiveTable,
    uniforms: &MaskUniforms,
    slice: u32,
    x: u32,
    y: u32,
) -> f32 {
    let res = UVec2::from_array(uniforms.resolution);
    let px = x * uniforms.scale;
    let py = y * uniforms.scale;
    if px >= res.x || py >= res.y {
        return 0.0;
    }

    let step = uniforms.step.max(1) as i32;
    let mut taps = [[0.0f32; 3]; 3];
    for (j, row) in taps.iter_mut().enumerate() {
        for (i, tap) in row.iter_mut().enumerate() {
            let sx = (px as i32 + (i as i32 - 1) * step).clamp(0, res.x as i32 - 1) as u32;
            let sy = (py as i32 + (j as i32 - 1) * step).clamp(0, res.y as i32 - 1) as u32;
            match frame.depth_at(table, slice as usize, sx, sy) {
                Some(depth) => *tap = depth,
                None => return 0.0,
            }
        }
    }

    let gx = (taps[0][2] + 2.0 * taps[1][2] + taps[2][2]) - (taps[0][0] + 2.0 * taps[1][0] + taps[2][0]);
    let gy = (taps[2][0] + 2.0 * taps[2][1] + taps[2][2]) - (taps[0][0] + 2.0 * taps[0][1] + taps[0][2]);
    // Depth change per neighbour step
    let gradient = (gx * gx + gy * gy).sqrt() / 8.0;
    let multiplier = uniforms.sobel_multiplier.max(1.0e-6);
    (1.0 - gradient * uniforms.strength / multiplier).clamp(0.0, 1.0)
}

/// One min/max halving pass
pub fn downscale_pass(src: &[f32], dst: &mut [[f32; 2]], uniforms: &DownscaleUniforms) {
    let channels = uniforms.src_channels.max(1) as usize;
    let src_plane = (uniforms.src_width * uniforms.src_height) as usize;
    let dst_plane = (uniforms.dst_width * uniforms.dst_height) as usize;
    let dst_width = uniforms.dst_width.max(1) as usize;

    dst.par_iter_mut().enumerate().for_each(|(index, out)| {
        let slice = index / dst_plane.max(1);
        let x = ((index % dst_plane.max(1)) % dst_width) as u32;
        let y = ((index % dst_plane.max(1)) / dst_width) as u32;
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            let sx = (2 * x + dx).min(uniforms.src_width.saturating_sub(1));
            let sy = (2 * y + dy).min(uniforms.src_height.saturating_sub(1));
            let texel = slice * src_plane + (sy * uniforms.src_width + sx) as usize;
            let (mn, mx) = if channels == 2 {
                (src[texel * 2], src[texel * 2 + 1])
            } else {
                (src[texel], src[texel])
            };
            lo = lo.min(mn);
            hi = hi.max(mx);
        }
        *out = [lo, hi];
    });
}

/// Min/max reduced mask
#[derive(Debug, Clone, PartialEq)]
pub struct MinMaxTexture {
    pub width: u32,
    pub height: u32,
    pub slices: u32,
    pub texels: Vec<[f32; 2]>,
}

/// Mask the volume pass samples: the base (or blurred) mask, or the reduced one
#[derive(Debug, Clone, Copy)]
pub enum MaskView<'a> {
    Full {
        layout: &'a MaskLayout,
        values: &'a [f32],
    },
    Reduced {
        texture: &'a MinMaxTexture,
        downscale: u32,
    },
}

impl MaskView<'_> {
    pub fn width(&self) -> u32 {
        match self {
            MaskView::Full { layout, .. } => layout.width(),
            MaskView::Reduced { texture, .. } => texture.width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            MaskView::Full { layout, .. } => layout.height(),
            MaskView::Reduced { texture, .. } => texture.height,
        }
    }

    /// Perspective pixels per mask texel
    pub fn scale(&self) -> u32 {
        match self {
            MaskView::Full { layout, .. } => layout.scale,
            MaskView::Reduced { downscale, .. } => *downscale,
        }
    }

    /// Sampled values, two floats per texel for a reduced mask
    pub fn channels(&self) -> u32 {
        match self {
            MaskView::Full { .. } => 1,
            MaskView::Reduced { .. } => 2,
        }
    }

    pub fn raw(&self) -> &[f32] {
        match self {
            MaskView::Full { values, .. } => values,
            MaskView::Reduced { texture, .. } => bytemuck::cast_slice(&texture.texels),
        }
    }

    /// Confidence at a perspective pixel; reduced masks report their minimum
    pub fn confidence(&self, slice: u32, px: u32, py: u32) -> f32 {
        let (width, height) = (self.width(), self.height());
        if width == 0 || height == 0 {
            return 1.0;
        }
        let scale = self.scale().max(1);
        let x = (px / scale).min(width - 1);
        let y = (py / scale).min(height - 1);
        let texel = ((slice * height + y) * width + x) as usize;
        let channels = self.channels() as usize;
        self.raw().get(texel * channels).copied().unwrap_or(1.0)
    }
}

/// CPU edge mask generator
#[derive(Debug, Default)]
pub struct EdgeMaskGenerator {
    settings: MaskSettings,
    layout: Option<MaskLayout>,
    base: Vec<f32>,
    blurred: Option<PingPong<Vec<f32>>>,
    downscaled: Option<MinMaxTexture>,
    blur_applied: bool,
}

impl EdgeMaskGenerator {
    pub fn new(settings: MaskSettings) -> Self {
        Self {
            settings: settings.clamped(),
            ..Default::default()
        }
    }

    pub fn settings(&self) -> &MaskSettings {
        &self.settings
    }

    /// Store `settings`, clamped to the supported ranges
    pub fn set_settings(&mut self, settings: MaskSettings) {
        self.settings = settings.clamped();
    }

    /// Size the mask for `table`. Returns true when storage was reallocated.
    pub fn ensure_texture(&mut self, table: &PerspectiveTable) -> bool {
        let layout = MaskLayout::new(table, self.settings.effective_scale());
        if self.layout == Some(layout) {
            return false;
        }
        log::debug!(
            "[EdgeMaskGenerator] Mask resized to {}x{}x{}",
            layout.width(),
            layout.height(),
            layout.slices
        );
        self.base = vec![0.0; layout.texel_count()];
        self.blurred = None;
        self.downscaled = None;
        self.blur_applied = false;
        self.layout = Some(layout);
        true
    }

    pub fn layout(&self) -> Option<&MaskLayout> {
        self.layout.as_ref()
    }

    /// Run Sobel, blur and downscale. Returns false when nothing was produced.
    pub fn generate_mask(&mut self, frame: &FrameAtlas, table: &PerspectiveTable) -> bool {
        self.ensure_texture(table);
        let Some(layout) = self.layout else {
            return false;
        };
        if layout.is_empty() || !frame.matches(table) {
            return false;
        }

        let uniforms = MaskUniforms::new(&layout, &self.settings, table);
        let width = layout.width() as usize;
        let plane = width * layout.height() as usize;
        self.base.par_iter_mut().enumerate().for_each(|(index, out)| {
            let slice = (index / plane) as u32;
            let x = ((index % plane) % width) as u32;
            let y = ((index % plane) / width) as u32;
            *out = sobel_texel(frame, table, &uniforms, slice, x, y);
        });

        self.blur_applied = self.settings.blur_enabled;
        if self.blur_applied {
            let blurred = self.blurred.get_or_insert_with(|| {
                PingPong::new(vec![0.0; layout.texel_count()], vec![0.0; layout.texel_count()])
            });
            gaussian::blur_image(
                &self.base,
                blurred,
                self.settings.blur_radius,
                layout.width(),
                layout.height(),
                layout.slices,
            );
        }

        self.downscale(&layout);
        true
    }

    fn downscale(&mut self, layout: &MaskLayout) {
        let downscale = self.settings.effective_downscale();
        let chain = downscale_chain(layout, downscale);
        if chain.is_empty() {
            self.downscaled = None;
            return;
        }

        let mut source: Vec<f32> = self.mask_values().to_vec();
        let mut src_size = UVec2::new(layout.width(), layout.height());
        let mut src_channels = 1;
        let mut result = Vec::new();
        for size in &chain {
            // Temporaries are dropped as soon as the next level exists
            let mut dst = vec![[0.0f32; 2]; (size.x * size.y * layout.slices) as usize];
            let uniforms = DownscaleUniforms {
                src_width: src_size.x,
                src_height: src_size.y,
                dst_width: size.x,
                dst_height: size.y,
                slices: layout.slices,
                src_channels,
                _padding: [0; 2],
            };
            downscale_pass(&source, &mut dst, &uniforms);
            source = bytemuck::cast_slice(&dst).to_vec();
            src_size = *size;
            src_channels = 2;
            result = dst;
        }

        let size = chain[chain.len() - 1];
        self.downscaled = Some(MinMaxTexture {
            width: size.x,
            height: size.y,
            slices: layout.slices,
            texels: result,
        });
    }

    fn mask_values(&self) -> &[f32] {
        match (&self.blurred, self.blur_applied) {
            (Some(blurred), true) => blurred.current(),
            _ => &self.base,
        }
    }

    /// Blurred mask when blur is enabled, else the Sobel output
    pub fn mask_texture(&self) -> Option<MaskView<'_>> {
        let layout = self.layout.as_ref()?;
        Some(MaskView::Full {
            layout,
            values: self.mask_values(),
        })
    }

    /// Reduced mask when a downscale chain ran, else the same view as
    /// [`mask_texture`](Self::mask_texture)
    pub fn downscaled_mask(&self) -> Option<MaskView<'_>> {
        match &self.downscaled {
            Some(texture) => Some(MaskView::Reduced {
                texture,
                downscale: self.settings.effective_downscale(),
            }),
            None => self.mask_texture(),
        }
    }

    /// Drop all mask storage; the next generate reallocates it
    pub fn release(&mut self) {
        self.layout = None;
        self.base = Vec::new();
        self.blurred = None;
        self.downscaled = None;
    }
}
