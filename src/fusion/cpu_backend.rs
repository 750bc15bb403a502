//! Rayon reference backend
//!
//! Runs the same kernels as the WGSL shaders over host memory. Every stage
//! reads the same `#[repr(C)]` uniform structs the GPU passes upload.

use super::backend::{FusionPass, PassReport, PassSettings};
use super::error::{FusionErrorContext, FusionResult};
use super::grid::VoxelGrid;
use super::indirect_args::{prepare_args, ArgsSettings, DispatchIndirectArgs, DrawIndirectArgs};
use super::mask::EdgeMaskGenerator;
use super::normal_weight::NormalWeightGenerator;
use super::surface::{extract_surface, ExtractUniforms, TriangleAppendBuffer, TriangleRecord};
use super::volume::{VolumeGenerator, VolumeInputs, VolumeUniforms};
use crate::perspective::PerspectiveTable;

#[derive(Debug, Default)]
pub struct CpuFusion {
    mask: EdgeMaskGenerator,
    normals: NormalWeightGenerator,
    volume: VolumeGenerator,
    triangles: TriangleAppendBuffer,
    draw: DrawIndirectArgs,
    dispatch: DispatchIndirectArgs,
}

impl CpuFusion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a new grid and triangle capacity. Returns true when storage changed.
    pub fn resize(&mut self, grid: VoxelGrid, table: &PerspectiveTable, settings: &PassSettings) -> bool {
        let mut changed = self.volume.resize(grid);

        self.mask.set_settings(settings.mask);
        if settings.mask.enabled {
            changed |= self.mask.ensure_texture(table);
        } else {
            self.mask.release();
        }

        self.normals.set_settings(settings.normals);
        if settings.normals.enabled {
            changed |= self.normals.ensure_texture(table);
        } else {
            self.normals.release();
        }

        if self.triangles.capacity() != settings.args.capacity {
            self.triangles.set_capacity(settings.args.capacity);
            changed = true;
        }
        changed
    }

    /// normal weights → mask → volume → smoothing → extraction → args
    pub fn generate(&mut self, pass: &FusionPass<'_>) -> FusionResult<PassReport> {
        let grid = *self.volume.grid().fusion_context("cpu volume grid")?;
        let settings = pass.settings;

        let normals_ready = settings.normals.enabled && {
            self.normals.set_settings(settings.normals);
            self.normals.generate(pass.frame, pass.table, pass.perspectives)
        };
        let normals = if normals_ready { self.normals.view() } else { None };

        let mask_ready = settings.mask.enabled && {
            self.mask.set_settings(settings.mask);
            self.mask.generate_mask(pass.frame, pass.table)
        };
        let mask = if mask_ready { self.mask.downscaled_mask() } else { None };

        let mut uniforms = VolumeUniforms::new(&grid, settings.lod_stride, pass.table, &settings.weights);
        if let Some(view) = mask.as_ref() {
            uniforms = uniforms.with_mask(view);
        }
        if let Some(view) = normals.as_ref() {
            uniforms = uniforms.with_normal_weights(view.layout.width(), view.layout.height(), view.layout.reduction);
        }
        let inputs = VolumeInputs {
            frame: pass.frame,
            perspectives: pass.perspectives,
            geometry: pass.geometry.as_slice(),
            mask,
            normals,
        };
        self.volume.generate(settings.strategy, &uniforms, &inputs, pass.active);

        if let Some(sigma) = settings.smoothing {
            self.volume.smooth(sigma, settings.lod_stride);
        }

        let extract = ExtractUniforms::new(&grid, settings.lod_stride, settings.threshold, self.triangles.capacity());
        extract_surface(self.volume.values(), &extract, &mut self.triangles);

        let args = ArgsSettings {
            capacity: self.triangles.capacity(),
            ..settings.args
        };
        let (draw, dispatch) = prepare_args(self.triangles.counter(), &args.uniforms());
        self.draw = draw;
        self.dispatch = dispatch;

        log::debug!(
            "[CpuFusion] Extracted {} triangles ({} stored)",
            self.triangles.counter(),
            self.triangles.triangles().len()
        );
        Ok(PassReport {
            triangle_count: Some(self.triangles.counter()),
            draw: Some(draw),
            dispatch: Some(dispatch),
        })
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangles.counter()
    }

    pub fn triangles(&self) -> &[TriangleRecord] {
        self.triangles.triangles()
    }

    pub fn field(&self) -> &[f32] {
        self.volume.values()
    }

    pub fn args(&self) -> (DrawIndirectArgs, DispatchIndirectArgs) {
        (self.draw, self.dispatch)
    }

    pub fn mask(&self) -> &EdgeMaskGenerator {
        &self.mask
    }

    pub fn normal_weights(&self) -> &NormalWeightGenerator {
        &self.normals
    }

    pub fn release(&mut self) {
        self.mask.release();
        self.normals.release();
        self.volume.release();
        self.triangles.clear();
        self.draw = DrawIndirectArgs::default();
        self.dispatch = DispatchIndirectArgs::default();
    }
}
