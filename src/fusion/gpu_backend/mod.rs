//! wgpu compute backend
//!
//! One `generate` call records normal weights → mask → volume → smoothing →
//! extraction → args into a single command encoder and submits it without
//! waiting. Queue order is the only synchronisation between passes.
//! Readbacks are explicit and stall the calling thread.

pub mod pipelines;

use super::backend::{FusionPass, PassReport, PassSettings};
use super::error::{FusionErrorContext, FusionResult};
use super::field::PingPong;
use super::gaussian::{GaussianKernel, GaussianUniforms};
use super::grid::VoxelGrid;
use super::indirect_args::{ArgsSettings, DispatchIndirectArgs, DrawIndirectArgs};
use super::mask::{downscale_chain, DownscaleUniforms, MaskLayout, MaskSettings, MaskUniforms};
use super::march_tables::flattened_triangle_table;
use super::normal_weight::{NormalWeightLayout, NormalWeightSettings, NormalWeightUniforms};
use super::surface::{ExtractUniforms, TriangleRecord};
use super::volume::{multi_pass_plan, GenerationStrategy, VolumeUniforms};
use super::{WORKGROUP_SIZE_2D, WORKGROUP_SIZE_3D};
use crate::gpu::{workgroups_2d, workgroups_3d, GpuBufferManager, GpuContext};
use crate::perspective::{FrameAtlas, PerspectiveTable};
use bytemuck::Pod;
use glam::UVec2;
use pipelines::{FusionPipelines, KernelPipelines, BLUR_IMAGE, BLUR_VOLUME, VOLUME_MULTI_PASS, VOLUME_SINGLE_PASS};

const TRIANGLE_RECORD_SIZE: u64 = std::mem::size_of::<TriangleRecord>() as u64;

/// Device handles every encode step needs
struct Kernels<'a> {
    device: &'a wgpu::Device,
    buffers: &'a GpuBufferManager,
    pipelines: &'a FusionPipelines,
}

impl Kernels<'_> {
    fn uniform<T: Pod>(&self, label: &str, value: &T) -> wgpu::Buffer {
        self.buffers.create_uniform(label, value)
    }

    /// Bind `resources` to bindings `0..n` and record one compute pass
    fn dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        label: &str,
        kernel: &KernelPipelines,
        entry: usize,
        resources: &[&wgpu::Buffer],
        groups: (u32, u32, u32),
    ) -> FusionResult<()> {
        let pipeline = kernel.pipeline(entry)?;
        let entries: Vec<wgpu::BindGroupEntry> = resources
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &kernel.layout,
            entries: &entries,
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups.0, groups.1, groups.2);
        Ok(())
    }
}

/// Mask that the volume kernel binds
struct MaskBinding<'a> {
    buffer: &'a wgpu::Buffer,
    width: u32,
    height: u32,
    scale: u32,
    channels: u32,
}

/// Edge mask storage on the device
#[derive(Default)]
struct GpuMask {
    layout: Option<MaskLayout>,
    base: Option<wgpu::Buffer>,
    blurred: Option<PingPong<wgpu::Buffer>>,
    /// Final min/max level and its size
    downscaled: Option<(wgpu::Buffer, UVec2)>,
    downscale: u32,
    blur_applied: bool,
}

impl GpuMask {
    fn ensure(&mut self, buffers: &GpuBufferManager, table: &PerspectiveTable, settings: &MaskSettings) -> bool {
        let layout = MaskLayout::new(table, settings.effective_scale());
        if self.layout == Some(layout) {
            return false;
        }
        let bytes = layout.texel_count() as u64 * 4;
        self.base = Some(buffers.create_storage("Edge Mask", bytes, wgpu::BufferUsages::empty()));
        self.blurred = None;
        self.downscaled = None;
        self.blur_applied = false;
        self.layout = Some(layout);
        log::debug!(
            "[GpuMask] Mask resized to {}x{}x{}",
            layout.width(),
            layout.height(),
            layout.slices
        );
        true
    }

    fn values(&self) -> Option<&wgpu::Buffer> {
        match (&self.blurred, self.blur_applied) {
            (Some(blurred), true) => Some(blurred.current()),
            _ => self.base.as_ref(),
        }
    }

    /// Sobel, optional blur, optional downscale chain. Temporaries of the
    /// chain go to `scratch` and must outlive the submit.
    fn encode(
        &mut self,
        kernels: &Kernels<'_>,
        encoder: &mut wgpu::CommandEncoder,
        pass: &FusionPass<'_>,
        perspectives: &wgpu::Buffer,
        atlas: &wgpu::Buffer,
        scratch: &mut Vec<wgpu::Buffer>,
    ) -> FusionResult<bool> {
        let settings = pass.settings.mask.clamped();
        self.ensure(kernels.buffers, pass.table, &settings);
        let layout = self.layout.fusion_context("mask layout")?;
        if layout.is_empty() || !pass.frame.matches(pass.table) {
            return Ok(false);
        }
        let base = self.base.as_ref().fusion_context("mask buffer")?;
        let (width, height, slices) = (layout.width(), layout.height(), layout.slices);
        let groups = workgroups_2d(width, height, slices, WORKGROUP_SIZE_2D);

        let mut uniforms = MaskUniforms::new(&layout, &settings, pass.table);
        uniforms.atlas_width = pass.frame.width();
        let uniform = kernels.uniform("Mask Uniforms", &uniforms);
        kernels.dispatch(
            encoder,
            "Mask Sobel",
            &kernels.pipelines.sobel,
            0,
            &[&uniform, perspectives, atlas, base],
            groups,
        )?;

        self.blur_applied = settings.blur_enabled;
        if self.blur_applied {
            let bytes = layout.texel_count() as u64 * 4;
            let blurred = self.blurred.get_or_insert_with(|| {
                PingPong::new(
                    kernels.buffers.create_storage("Blurred Mask A", bytes, wgpu::BufferUsages::empty()),
                    kernels.buffers.create_storage("Blurred Mask B", bytes, wgpu::BufferUsages::empty()),
                )
            });
            let kernel = GaussianKernel::from_sigma(settings.blur_radius);

            let horizontal = kernels.uniform("Mask Blur Uniforms", &GaussianUniforms::image(&kernel, width, height, slices, 0));
            kernels.dispatch(
                encoder,
                "Mask Blur Horizontal",
                &kernels.pipelines.blur,
                BLUR_IMAGE,
                &[&horizontal, base, blurred.other()],
                groups,
            )?;
            blurred.flip();

            let vertical = kernels.uniform("Mask Blur Uniforms", &GaussianUniforms::image(&kernel, width, height, slices, 1));
            kernels.dispatch(
                encoder,
                "Mask Blur Vertical",
                &kernels.pipelines.blur,
                BLUR_IMAGE,
                &[&vertical, blurred.current(), blurred.other()],
                groups,
            )?;
            blurred.flip();
        }

        self.downscale = settings.effective_downscale();
        let chain = downscale_chain(&layout, self.downscale);
        let Some(&final_size) = chain.last() else {
            self.downscaled = None;
            return Ok(true);
        };

        let values = self.values().fusion_context("mask values")?;
        let mut previous: Option<wgpu::Buffer> = None;
        let mut src_size = UVec2::new(width, height);
        for size in &chain {
            let dst = kernels.buffers.create_storage(
                "Mask Downscale Level",
                size.x as u64 * size.y as u64 * slices as u64 * 8,
                wgpu::BufferUsages::empty(),
            );
            let uniforms = DownscaleUniforms {
                src_width: src_size.x,
                src_height: src_size.y,
                dst_width: size.x,
                dst_height: size.y,
                slices,
                src_channels: if previous.is_some() { 2 } else { 1 },
                _padding: [0; 2],
            };
            let uniform = kernels.uniform("Downscale Uniforms", &uniforms);
            let src = previous.as_ref().unwrap_or(values);
            kernels.dispatch(
                encoder,
                "Mask Downscale",
                &kernels.pipelines.downscale,
                0,
                &[&uniform, src, &dst],
                workgroups_2d(size.x, size.y, slices, WORKGROUP_SIZE_2D),
            )?;
            if let Some(level) = previous.replace(dst) {
                scratch.push(level);
            }
            src_size = *size;
        }
        self.downscaled = previous.map(|buffer| (buffer, final_size));
        Ok(true)
    }

    fn binding(&self) -> Option<MaskBinding<'_>> {
        let layout = self.layout.as_ref()?;
        if let Some((buffer, size)) = &self.downscaled {
            return Some(MaskBinding {
                buffer,
                width: size.x,
                height: size.y,
                scale: self.downscale,
                channels: 2,
            });
        }
        Some(MaskBinding {
            buffer: self.values()?,
            width: layout.width(),
            height: layout.height(),
            scale: layout.scale,
            channels: 1,
        })
    }

    fn release(&mut self) {
        *self = Self::default();
    }
}

/// Normal weight storage on the device
#[derive(Default)]
struct GpuNormalWeights {
    layout: Option<NormalWeightLayout>,
    buffer: Option<wgpu::Buffer>,
}

impl GpuNormalWeights {
    fn ensure(&mut self, buffers: &GpuBufferManager, table: &PerspectiveTable, settings: &NormalWeightSettings) -> bool {
        let layout = NormalWeightLayout::new(table, settings.resolution_reduction);
        if self.layout == Some(layout) {
            return false;
        }
        let bytes = layout.texel_count() as u64 * 4;
        self.buffer = Some(buffers.create_storage("Normal Weights", bytes, wgpu::BufferUsages::empty()));
        self.layout = Some(layout);
        log::debug!(
            "[GpuNormalWeights] Weights resized to {}x{}x{}",
            layout.width(),
            layout.height(),
            layout.slices
        );
        true
    }

    fn encode(
        &mut self,
        kernels: &Kernels<'_>,
        encoder: &mut wgpu::CommandEncoder,
        pass: &FusionPass<'_>,
        perspectives: &wgpu::Buffer,
        atlas: &wgpu::Buffer,
    ) -> FusionResult<bool> {
        let settings = pass.settings.normals.clamped();
        self.ensure(kernels.buffers, pass.table, &settings);
        let layout = self.layout.fusion_context("normal weight layout")?;
        if layout.is_empty() || !pass.frame.matches(pass.table) {
            return Ok(false);
        }
        let buffer = self.buffer.as_ref().fusion_context("normal weight buffer")?;
        let uniforms = NormalWeightUniforms::new(&layout, &settings, pass.table)
            .with_atlas_size(pass.frame.width(), pass.frame.height());
        let uniform = kernels.uniform("Normal Weight Uniforms", &uniforms);
        kernels.dispatch(
            encoder,
            "Normal Weights",
            &kernels.pipelines.normal_weight,
            0,
            &[&uniform, perspectives, atlas, buffer],
            workgroups_2d(layout.width(), layout.height(), layout.slices, WORKGROUP_SIZE_2D),
        )?;
        Ok(true)
    }

    fn release(&mut self) {
        *self = Self::default();
    }
}

/// GPU implementation of the fusion pipeline
pub struct GpuFusion {
    context: GpuContext,
    buffers: GpuBufferManager,
    pipelines: FusionPipelines,
    grid: Option<VoxelGrid>,
    field: Option<PingPong<wgpu::Buffer>>,
    atlas: Option<wgpu::Buffer>,
    atlas_version: Option<u64>,
    perspectives: Option<wgpu::Buffer>,
    mask: GpuMask,
    normals: GpuNormalWeights,
    triangles: Option<wgpu::Buffer>,
    capacity: u32,
    counter: wgpu::Buffer,
    draw_args: wgpu::Buffer,
    dispatch_args: wgpu::Buffer,
    triangle_table: wgpu::Buffer,
    /// Bound in place of the mask while masking is off
    empty_mask: wgpu::Buffer,
    /// Bound in place of the normal weights while they are off
    empty_normals: wgpu::Buffer,
}

impl GpuFusion {
    pub fn new(context: GpuContext) -> FusionResult<Self> {
        let pipelines = FusionPipelines::new(&context.device)?;
        let buffers = context.buffers();

        let counter = buffers.create_storage("Triangle Counter", 4, wgpu::BufferUsages::empty());
        let draw_args = buffers.create_storage(
            "Draw Indirect Args",
            std::mem::size_of::<DrawIndirectArgs>() as u64,
            wgpu::BufferUsages::INDIRECT,
        );
        let dispatch_args = buffers.create_storage(
            "Dispatch Indirect Args",
            std::mem::size_of::<DispatchIndirectArgs>() as u64,
            wgpu::BufferUsages::INDIRECT,
        );
        let triangle_table = buffers.create_storage_init("Triangle Table", &flattened_triangle_table());
        let empty_mask = buffers.create_storage_init("Empty Mask", &[1.0f32]);
        let empty_normals = buffers.create_storage_init("Empty Normal Weights", &[1.0f32]);

        Ok(Self {
            context,
            buffers,
            pipelines,
            grid: None,
            field: None,
            atlas: None,
            atlas_version: None,
            perspectives: None,
            mask: GpuMask::default(),
            normals: GpuNormalWeights::default(),
            triangles: None,
            capacity: 0,
            counter,
            draw_args,
            dispatch_args,
            triangle_table,
            empty_mask,
            empty_normals,
        })
    }

    pub fn buffers(&self) -> &GpuBufferManager {
        &self.buffers
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    /// Reallocate size-dependent buffers. Returns true when any changed.
    pub fn resize(&mut self, grid: VoxelGrid, table: &PerspectiveTable, settings: &PassSettings) -> FusionResult<bool> {
        let mut changed = false;

        let field_bytes = grid.total_voxels() as u64 * 4;
        let field_matches = self
            .field
            .as_ref()
            .map(|field| field.current().size() == crate::gpu::buffer_manager::padded_size(field_bytes))
            .unwrap_or(false);
        if !field_matches {
            self.field = Some(PingPong::new(
                self.buffers.create_storage("Volume Field A", field_bytes, wgpu::BufferUsages::empty()),
                self.buffers.create_storage("Volume Field B", field_bytes, wgpu::BufferUsages::empty()),
            ));
            changed = true;
        }
        self.grid = Some(grid);

        let capacity = settings.args.capacity;
        if self.triangles.is_none() || self.capacity != capacity {
            self.triangles = Some(self.buffers.create_storage(
                "Triangle Records",
                capacity as u64 * TRIANGLE_RECORD_SIZE,
                wgpu::BufferUsages::VERTEX,
            ));
            self.capacity = capacity;
            changed = true;
        }

        if settings.mask.enabled {
            changed |= self.mask.ensure(&self.buffers, table, &settings.mask.clamped());
        } else {
            self.mask.release();
        }

        if settings.normals.enabled {
            changed |= self.normals.ensure(&self.buffers, table, &settings.normals.clamped());
        } else {
            self.normals.release();
        }
        Ok(changed)
    }

    fn upload_frame(&mut self, frame: &FrameAtlas, version: u64) -> FusionResult<()> {
        let size = std::mem::size_of_val(frame.texels()) as u64;
        let reallocated = self
            .buffers
            .ensure_storage(&mut self.atlas, "Frame Atlas", size, wgpu::BufferUsages::empty());
        if reallocated || self.atlas_version != Some(version) {
            let atlas = self.atlas.as_ref().fusion_context("frame atlas buffer")?;
            self.buffers.write("Frame Atlas", atlas, frame.texels())?;
            self.atlas_version = Some(version);
        }
        Ok(())
    }

    /// Record and submit one full pass. Does not wait for the device.
    pub fn generate(&mut self, pass: &FusionPass<'_>) -> FusionResult<PassReport> {
        let grid = self.grid.fusion_context("gpu volume grid")?;
        let settings = pass.settings;

        self.upload_frame(pass.frame, pass.frame_version)?;
        self.buffers.ensure_storage(
            &mut self.perspectives,
            "Perspectives",
            std::mem::size_of_val(pass.perspectives) as u64,
            wgpu::BufferUsages::empty(),
        );
        let perspectives = self.perspectives.as_ref().fusion_context("perspective buffer")?;
        self.buffers.write("Perspectives", perspectives, pass.perspectives)?;

        let geometry = pass.geometry.buffer().fusion_context("geometry records buffer")?;
        let atlas = self.atlas.as_ref().fusion_context("frame atlas buffer")?;
        let field = self.field.as_mut().fusion_context("volume field buffers")?;
        let triangles = self.triangles.as_ref().fusion_context("triangle buffer")?;

        let kernels = Kernels {
            device: &self.context.device,
            buffers: &self.buffers,
            pipelines: &self.pipelines,
        };
        let mut encoder = kernels.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Fusion Pass Encoder"),
        });
        let mut scratch = Vec::new();

        // Normal weights
        let normals_ready = settings.normals.enabled
            && self
                .normals
                .encode(&kernels, &mut encoder, pass, perspectives, atlas)?;

        // Edge mask
        let mask_ready = settings.mask.enabled
            && self
                .mask
                .encode(&kernels, &mut encoder, pass, perspectives, atlas, &mut scratch)?;
        let mask = if mask_ready { self.mask.binding() } else { None };

        // Volume
        let mut uniforms = VolumeUniforms::new(&grid, settings.lod_stride, pass.table, &settings.weights)
            .with_atlas_size(pass.frame.width(), pass.frame.height());
        if let Some(mask) = mask.as_ref() {
            uniforms = uniforms.with_mask_dims(mask.width, mask.height, mask.scale, mask.channels);
        }
        let mask_buffer = mask.as_ref().map(|mask| mask.buffer).unwrap_or(&self.empty_mask);
        let mut normal_buffer = &self.empty_normals;
        if normals_ready {
            if let (Some(layout), Some(buffer)) = (self.normals.layout, self.normals.buffer.as_ref()) {
                uniforms = uniforms.with_normal_weights(layout.width(), layout.height(), layout.reduction);
                normal_buffer = buffer;
            }
        }
        let lod_dims = grid.lod_dims(settings.lod_stride.max(1));
        let volume_groups = workgroups_3d(lod_dims, WORKGROUP_SIZE_3D);
        match settings.strategy {
            GenerationStrategy::SinglePass => {
                let uniform = kernels.uniform("Volume Uniforms", &uniforms);
                kernels.dispatch(
                    &mut encoder,
                    "Volume Single Pass",
                    &kernels.pipelines.volume,
                    VOLUME_SINGLE_PASS,
                    &[&uniform, perspectives, geometry, atlas, mask_buffer, normal_buffer, field.current(), field.other()],
                    volume_groups,
                )?;
            }
            GenerationStrategy::MultiPass => {
                for step in multi_pass_plan(pass.active) {
                    let uniform = kernels.uniform("Volume Step Uniforms", &uniforms.for_step(&step));
                    kernels.dispatch(
                        &mut encoder,
                        "Volume Multi Pass",
                        &kernels.pipelines.volume,
                        VOLUME_MULTI_PASS,
                        &[&uniform, perspectives, geometry, atlas, mask_buffer, normal_buffer, field.current(), field.other()],
                        volume_groups,
                    )?;
                }
            }
        }

        // Smoothing, x then y then z
        if let Some(sigma) = settings.smoothing {
            let kernel = GaussianKernel::from_sigma(sigma);
            for axis in 0..3 {
                let blur = GaussianUniforms::new(&kernel, grid.dims, lod_dims, settings.lod_stride, axis);
                let uniform = kernels.uniform("Volume Blur Uniforms", &blur);
                kernels.dispatch(
                    &mut encoder,
                    "Volume Blur",
                    &kernels.pipelines.blur,
                    BLUR_VOLUME,
                    &[&uniform, field.current(), field.other()],
                    workgroups_3d(grid.dims, WORKGROUP_SIZE_3D),
                )?;
                field.flip();
            }
        }

        // Extraction
        encoder.clear_buffer(&self.counter, 0, None);
        let extract = ExtractUniforms::new(&grid, settings.lod_stride, settings.threshold, self.capacity);
        let uniform = kernels.uniform("Extract Uniforms", &extract);
        kernels.dispatch(
            &mut encoder,
            "Surface Extraction",
            &kernels.pipelines.extract,
            0,
            &[&uniform, field.current(), &self.triangle_table, &self.counter, triangles],
            workgroups_3d(extract.cell_dims(), WORKGROUP_SIZE_3D),
        )?;

        // Indirect args
        let args = ArgsSettings {
            capacity: self.capacity,
            ..settings.args
        };
        let uniform = kernels.uniform("Args Uniforms", &args.uniforms());
        kernels.dispatch(
            &mut encoder,
            "Indirect Args",
            &kernels.pipelines.args,
            0,
            &[&uniform, &self.counter, &self.draw_args, &self.dispatch_args],
            (1, 1, 1),
        )?;

        self.context.queue.submit(Some(encoder.finish()));
        drop(scratch);

        log::debug!(
            "[GpuFusion] Submitted {:?} pass over {}x{}x{} (stride {})",
            settings.strategy,
            grid.dims.x,
            grid.dims.y,
            grid.dims.z,
            settings.lod_stride
        );
        Ok(PassReport::default())
    }

    pub fn read_triangle_count(&self) -> FusionResult<u32> {
        let counter = self.buffers.read::<u32>(&self.counter, 1)?;
        counter.first().copied().fusion_context("triangle counter")
    }

    pub fn read_triangles(&self) -> FusionResult<Vec<TriangleRecord>> {
        let triangles = self.triangles.as_ref().fusion_context("triangle buffer")?;
        let stored = self.read_triangle_count()?.min(self.capacity);
        Ok(self.buffers.read::<TriangleRecord>(triangles, stored as usize)?)
    }

    pub fn read_field(&self) -> FusionResult<Vec<f32>> {
        let grid = self.grid.fusion_context("gpu volume grid")?;
        let field = self.field.as_ref().fusion_context("volume field buffers")?;
        Ok(self.buffers.read::<f32>(field.current(), grid.total_voxels())?)
    }

    pub fn read_args(&self) -> FusionResult<(DrawIndirectArgs, DispatchIndirectArgs)> {
        let draw = self.buffers.read::<DrawIndirectArgs>(&self.draw_args, 1)?;
        let dispatch = self.buffers.read::<DispatchIndirectArgs>(&self.dispatch_args, 1)?;
        Ok((
            draw.first().copied().fusion_context("draw args")?,
            dispatch.first().copied().fusion_context("dispatch args")?,
        ))
    }

    /// Triangle records for an indirect draw
    pub fn triangle_buffer(&self) -> Option<&wgpu::Buffer> {
        self.triangles.as_ref()
    }

    pub fn draw_args_buffer(&self) -> &wgpu::Buffer {
        &self.draw_args
    }

    pub fn dispatch_args_buffer(&self) -> &wgpu::Buffer {
        &self.dispatch_args
    }

    pub fn counter_buffer(&self) -> &wgpu::Buffer {
        &self.counter
    }

    pub fn release(&mut self) {
        self.grid = None;
        self.field = None;
        self.atlas = None;
        self.atlas_version = None;
        self.perspectives = None;
        self.mask.release();
        self.normals.release();
        self.triangles = None;
        self.capacity = 0;
    }
}
