//! Frame atlas: one decoded playback frame with every perspective packed in

use crate::error::{EngineError, EngineResult};
use crate::perspective::PerspectiveTable;
use glam::Vec2;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// RGBA float image laid out as a grid of perspective cells.
///
/// Each cell holds the color image on top and the depth image below it. Depth
/// is stored normalised in the red channel between the perspective's near and
/// far clip.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameAtlas {
    width: u32,
    height: u32,
    texels: Vec<[f32; 4]>,
}

impl FrameAtlas {
    /// Black atlas of the given size
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            texels: vec![[0.0; 4]; (width as usize) * (height as usize)],
        }
    }

    pub fn from_texels(width: u32, height: u32, texels: Vec<[f32; 4]>) -> EngineResult<Self> {
        let expected = (width as usize) * (height as usize);
        if texels.len() != expected {
            return Err(EngineError::InvalidConfig {
                field: "frame texels".to_string(),
                value: texels.len().to_string(),
                reason: format!("expected {} texels for {}x{}", expected, width, height),
            });
        }
        Ok(Self {
            width,
            height,
            texels,
        })
    }

    /// Load an atlas image from disk
    pub fn from_image(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let image = image::open(path).map_err(|e| EngineError::IoError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Ok(Self::from_dynamic_image(&image))
    }

    pub fn from_dynamic_image(image: &image::DynamicImage) -> Self {
        let rgba = image.to_rgba32f();
        let (width, height) = rgba.dimensions();
        let texels = rgba.pixels().map(|p| p.0).collect();
        Self {
            width,
            height,
            texels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.texels.is_empty()
    }

    pub fn texels(&self) -> &[[f32; 4]] {
        &self.texels
    }

    pub fn texel(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.texels.get((y * self.width + x) as usize).copied()
    }

    pub fn set_texel(&mut self, x: u32, y: u32, value: [f32; 4]) {
        if x < self.width && y < self.height {
            let index = (y * self.width + x) as usize;
            self.texels[index] = value;
        }
    }

    /// True when the atlas can hold every cell of `table`
    pub fn matches(&self, table: &PerspectiveTable) -> bool {
        !self.is_empty() && self.width >= table.texture_width && self.height >= table.texture_height
    }

    /// Metric depth at a perspective pixel, `None` for invalid samples
    pub fn depth_at(&self, table: &PerspectiveTable, perspective: usize, px: u32, py: u32) -> Option<f32> {
        let camera = table.get(perspective)?;
        let res = table.perspective_resolution();
        if px >= res.x || py >= res.y {
            return None;
        }
        let origin = table.cell_origin(perspective);
        let normalized = self.texel(origin.x + px, origin.y + res.y + py)?[0];
        if normalized <= camera.clip_epsilon {
            return None;
        }
        Some(camera.near_clip + normalized * (camera.far_clip - camera.near_clip))
    }

    /// Nearest-texel depth lookup at a normalised depth-image coordinate
    pub fn sample_depth(&self, table: &PerspectiveTable, perspective: usize, uv: Vec2) -> Option<f32> {
        let res = table.perspective_resolution();
        let px = ((uv.x * res.x as f32) as u32).min(res.x.saturating_sub(1));
        let py = ((uv.y * res.y as f32) as u32).min(res.y.saturating_sub(1));
        self.depth_at(table, perspective, px, py)
    }

    /// Store a metric depth (or `None` for no data) at a perspective pixel
    pub fn write_depth(
        &mut self,
        table: &PerspectiveTable,
        perspective: usize,
        px: u32,
        py: u32,
        depth: Option<f32>,
    ) {
        let Some(camera) = table.get(perspective) else {
            return;
        };
        let res = table.perspective_resolution();
        let origin = table.cell_origin(perspective);
        let normalized = depth
            .map(|d| (d - camera.near_clip) / (camera.far_clip - camera.near_clip))
            .filter(|n| *n > camera.clip_epsilon && *n <= 1.0)
            .unwrap_or(0.0);
        self.set_texel(origin.x + px, origin.y + res.y + py, [normalized, normalized, normalized, 1.0]);
    }
}

/// Read-only access to the frame currently presented by playback
pub trait FrameSource: Send + Sync {
    /// Current frame, `None` while nothing is decoded
    fn current_frame(&self) -> Option<Arc<FrameAtlas>>;

    /// Monotonic counter bumped on every new frame
    fn frame_version(&self) -> u64;
}

/// Frame slot shared between a playback producer and the generators
#[derive(Default)]
pub struct SharedFrame {
    frame: RwLock<Option<Arc<FrameAtlas>>>,
    version: AtomicU64,
}

impl SharedFrame {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish a new frame
    pub fn present(&self, frame: FrameAtlas) {
        *self.frame.write() = Some(Arc::new(frame));
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Drop the current frame
    pub fn clear(&self) {
        *self.frame.write() = None;
        self.version.fetch_add(1, Ordering::Release);
    }
}

impl FrameSource for SharedFrame {
    fn current_frame(&self) -> Option<Arc<FrameAtlas>> {
        self.frame.read().clone()
    }

    fn frame_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}
