//! Volumetric mesh source: the generator node that owns one fusion pipeline
//!
//! Setup picks a backend and sizes the per-perspective records, resize
//! derives the voxel grid and (re)allocates storage, generate runs one full
//! mask → volume → smoothing → extraction → args pass over the current frame.
//! New frames, radial-bias changes and visibility changes become generate
//! requests that the scheduler drains once per tick.

use super::backend::{FusionBackend, FusionPass, PassReport};
use super::error::{FusionErrorContext, FusionResult};
use super::grid::{VolumeBounds, VoxelGrid};
use super::indirect_args::{recalibrated_capacity, DispatchIndirectArgs, DrawIndirectArgs};
use super::lod::{iso_scalar, num_levels, LevelOfDetail};
use super::surface::TriangleRecord;
use super::visibility::{PlaybackControl, Viewpoint, VisibilityChange, VisibilityGate};
use super::weighting::RadialBias;
use crate::config::FusionConfig;
use crate::error::{EngineError, EngineResult};
use crate::gpu::GpuContext;
use crate::lifecycle::{GeneratorNode, ScheduleRequest};
use crate::perspective::{FrameSource, PerspectiveColorBlendingData, PerspectiveGeometryData, PerspectiveTable};
use glam::{Mat4, Vec3};
use std::any::Any;
use std::sync::Arc;

pub struct VolumetricMeshSource {
    name: String,
    config: FusionConfig,
    frame_source: Arc<dyn FrameSource>,
    table: Option<PerspectiveTable>,
    gpu_context: Option<GpuContext>,
    backend: Option<FusionBackend>,
    geometry: PerspectiveGeometryData,
    color: PerspectiveColorBlendingData,
    radial_bias: RadialBias,
    lod: LevelOfDetail,
    lod_level: u32,
    viewpoint: Viewpoint,
    local_to_world: Mat4,
    gate: VisibilityGate,
    grid: Option<VoxelGrid>,
    /// Frame version of the last successful pass
    generated_version: Option<u64>,
    requests: ScheduleRequest,
    report: PassReport,
}

impl VolumetricMeshSource {
    pub fn new(name: impl Into<String>, config: FusionConfig, frame_source: Arc<dyn FrameSource>) -> Self {
        let gate = VisibilityGate::new(
            config.visibility.pause_generation_when_invisible,
            config.visibility.pause_player_when_invisible,
        );
        Self {
            name: name.into(),
            lod: config.lod.into(),
            radial_bias: RadialBias::new(config.radial_bias.bias_cm, 0),
            config,
            frame_source,
            table: None,
            gpu_context: None,
            backend: None,
            geometry: PerspectiveGeometryData::new(0),
            color: PerspectiveColorBlendingData::new(0),
            lod_level: 0,
            viewpoint: Viewpoint::default(),
            local_to_world: Mat4::IDENTITY,
            gate,
            grid: None,
            generated_version: None,
            requests: ScheduleRequest::default(),
            report: PassReport::default(),
        }
    }

    /// Run on a device owned by the host instead of acquiring one
    pub fn with_gpu(mut self, context: GpuContext) -> Self {
        self.gpu_context = Some(context);
        self
    }

    /// Adopt a new perspective table. Records keep their per-index state.
    pub fn set_table(&mut self, table: PerspectiveTable) {
        let count = table.len();
        self.geometry.resize(count);
        self.color.resize(count);
        self.radial_bias.resize(count);
        self.table = Some(table);
        self.apply_perspective_overrides();
        self.requests.merge(ScheduleRequest::RESIZE_AND_GENERATE);
        log::info!("[VolumetricMeshSource] '{}' received {} perspectives", self.name, count);
    }

    pub fn table(&self) -> Option<&PerspectiveTable> {
        self.table.as_ref()
    }

    /// Replace the whole configuration; takes effect on the next tick
    pub fn update_config(&mut self, config: FusionConfig) {
        self.gate.pause_generation_when_invisible = config.visibility.pause_generation_when_invisible;
        self.gate.pause_player_when_invisible = config.visibility.pause_player_when_invisible;
        self.lod = config.lod.into();
        self.radial_bias.set_global_cm(config.radial_bias.bias_cm);
        self.config = config;
        self.apply_perspective_overrides();
        self.requests.merge(ScheduleRequest::RESIZE_AND_GENERATE);
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn set_viewpoint(&mut self, viewpoint: Viewpoint) {
        if self.viewpoint == viewpoint {
            return;
        }
        self.viewpoint = viewpoint;
        if self.config.view_dependence.enabled || self.lod.automatic {
            self.requests.generate = true;
        }
    }

    pub fn set_local_to_world(&mut self, local_to_world: Mat4) {
        if self.local_to_world == local_to_world {
            return;
        }
        self.local_to_world = local_to_world;
        if self.config.view_dependence.enabled || self.lod.automatic {
            self.requests.generate = true;
        }
    }

    /// Manual LOD level, clamped to `>= 0` here and to `num_levels` per pass
    pub fn set_lod_level(&mut self, level: i32) {
        self.lod.set_level(level);
        self.config.lod.level = self.lod.level;
        self.requests.generate = true;
    }

    pub fn set_radial_bias_cm(&mut self, cm: f32) {
        self.radial_bias.set_global_cm(cm);
        self.config.radial_bias.bias_cm = self.radial_bias.global_cm();
    }

    pub fn set_perspective_enabled(&mut self, index: usize, enabled: bool) {
        let changed = self.geometry.set_enabled(index, enabled) | self.color.set_enabled(index, enabled);
        if changed {
            self.requests.generate = true;
        }
    }

    pub fn attach_player(&mut self, player: Box<dyn PlaybackControl>) {
        self.gate.attach_player(player);
    }

    pub fn geometry(&self) -> &PerspectiveGeometryData {
        &self.geometry
    }

    pub fn geometry_mut(&mut self) -> &mut PerspectiveGeometryData {
        self.requests.generate = true;
        &mut self.geometry
    }

    pub fn color(&self) -> &PerspectiveColorBlendingData {
        &self.color
    }

    pub fn color_mut(&mut self) -> &mut PerspectiveColorBlendingData {
        self.requests.generate = true;
        &mut self.color
    }

    /// Resize the triangle buffer to the last count plus headroom.
    ///
    /// Reads the counter back, so it stalls on the GPU backend.
    pub fn request_recalibration(&mut self) -> FusionResult<u32> {
        let backend = self.backend.as_ref().fusion_context("fusion backend")?;
        let count = backend.read_triangle_count()?;
        let capacity = self.config.triangles.capacity();
        if count > capacity {
            log::warn!(
                "[VolumetricMeshSource] '{}' produced {} triangles, {} were dropped at capacity {}",
                self.name,
                count,
                count - capacity,
                capacity
            );
        }
        let recalibrated = recalibrated_capacity(count);
        self.config.triangles.max_triangles = recalibrated;
        self.requests.merge(ScheduleRequest::RESIZE_AND_GENERATE);
        log::info!(
            "[VolumetricMeshSource] '{}' triangle capacity recalibrated to {}",
            self.name,
            recalibrated
        );
        Ok(recalibrated)
    }

    pub fn backend(&self) -> Option<&FusionBackend> {
        self.backend.as_ref()
    }

    pub fn grid(&self) -> Option<&VoxelGrid> {
        self.grid.as_ref()
    }

    /// Selectable LOD levels of the current grid
    pub fn num_levels(&self) -> u32 {
        self.grid.map(|grid| num_levels(grid.dims)).unwrap_or(0)
    }

    /// LOD level used by the last pass
    pub fn lod_level(&self) -> u32 {
        self.lod_level
    }

    /// What the last pass reported without a readback
    pub fn last_report(&self) -> PassReport {
        self.report
    }

    /// Raw append counter of the last pass
    pub fn triangle_count(&self) -> FusionResult<u32> {
        self.backend.as_ref().fusion_context("fusion backend")?.read_triangle_count()
    }

    pub fn triangles(&self) -> FusionResult<Vec<TriangleRecord>> {
        self.backend.as_ref().fusion_context("fusion backend")?.read_triangles()
    }

    pub fn draw_args(&self) -> FusionResult<(DrawIndirectArgs, DispatchIndirectArgs)> {
        self.backend.as_ref().fusion_context("fusion backend")?.read_args()
    }

    /// Copy of the current field side
    pub fn field_snapshot(&self) -> FusionResult<Vec<f32>> {
        self.backend.as_ref().fusion_context("fusion backend")?.read_field()
    }

    /// World-space AABB of the reconstruction volume
    pub fn world_bounds(&self) -> Option<(Vec3, Vec3)> {
        self.bounds().map(|bounds| bounds.transformed_aabb(&self.local_to_world))
    }

    fn bounds(&self) -> Option<VolumeBounds> {
        self.config.bounds_override().or_else(|| {
            self.table
                .as_ref()
                .map(|table| VolumeBounds::new(table.bounds_center, table.bounds_size))
        })
    }

    fn apply_perspective_overrides(&mut self) {
        for over in &self.config.perspectives {
            let index = over.index;
            if let Some(enabled) = over.enabled {
                self.geometry.set_enabled(index, enabled);
                self.color.set_enabled(index, enabled);
            }
            if let Some(overridden) = over.override_weight_unknown {
                self.geometry.set_override_weight_unknown(index, overridden);
            }
            if let Some(weight) = over.weight_unknown {
                self.geometry.set_weight_unknown(index, weight);
            }
            if let Some(contribution) = over.view_dependent_contribution {
                self.geometry.set_view_dependent_contribution(index, contribution);
            }
            if let Some(matches) = over.match_color_weight {
                self.geometry.set_matches_color_weight(index, matches);
            }
            self.radial_bias.set_override_cm(index, over.radial_bias_cm);
        }
    }

    /// Refresh each perspective's view-dependent weight for the current viewer
    fn update_view_weights(&mut self) {
        let Some(table) = self.table.as_ref() else {
            return;
        };
        let view = self.config.view_dependence;
        for (index, perspective) in table.perspectives.iter().enumerate() {
            let normal = self
                .local_to_world
                .transform_vector3(perspective.camera_normal())
                .normalize_or_zero();
            let matches_color = self.geometry.matches_color_weight(index);
            let contribution = if matches_color {
                self.color.view_weight_power_contribution(index)
            } else {
                self.geometry.view_dependent_contribution(index)
            };
            let weight = view.weight(self.viewpoint.forward, normal, view.power(contribution, matches_color));
            self.geometry.set_view_dependent_weight(index, weight);
        }
    }

    fn select_lod_level(&self, grid: &VoxelGrid) -> u32 {
        let center = self.local_to_world.transform_point3(grid.bounds.center);
        self.lod.resolve(
            self.viewpoint.position,
            center,
            self.viewpoint.far_clip,
            num_levels(grid.dims),
        )
    }

    fn resize_pass(&mut self) -> FusionResult<bool> {
        let Some(bounds) = self.bounds().filter(|bounds| !bounds.is_degenerate()) else {
            log::debug!("[VolumetricMeshSource] '{}' has no usable bounds yet", self.name);
            return Ok(false);
        };
        let grid = VoxelGrid::new(bounds, self.config.volume.density);
        if grid.is_empty() {
            log::debug!("[VolumetricMeshSource] '{}' grid {:?} has no cells", self.name, grid.dims);
            return Ok(false);
        }
        let table = self.table.as_ref().fusion_context("perspective table")?;
        let backend = self.backend.as_mut().fusion_context("fusion backend")?;
        backend.resize(grid, table, &self.config.pass_settings())?;

        if self.grid.map(|old| old.dims) != Some(grid.dims) {
            log::info!(
                "[VolumetricMeshSource] Resized grid to {}x{}x{} ({} voxels)",
                grid.dims.x,
                grid.dims.y,
                grid.dims.z,
                grid.total_voxels()
            );
        }
        self.grid = Some(grid);
        Ok(true)
    }

    fn generate_pass(&mut self) -> FusionResult<bool> {
        let Some(frame) = self.frame_source.current_frame() else {
            log::debug!("[VolumetricMeshSource] '{}' has no frame to fuse", self.name);
            return Ok(false);
        };
        let frame_version = self.frame_source.frame_version();
        let Some(grid) = self.grid else {
            return Ok(false);
        };

        self.update_view_weights();
        let level = self.select_lod_level(&grid);
        let mut settings = self.config.pass_settings();
        settings.lod_stride = iso_scalar(level);

        let table = self.table.as_ref().fusion_context("perspective table")?;
        if frame.is_empty() || !frame.matches(table) {
            log::debug!(
                "[VolumetricMeshSource] '{}' frame {}x{} does not match the atlas layout",
                self.name,
                frame.width(),
                frame.height()
            );
            return Ok(false);
        }

        let backend = self.backend.as_mut().fusion_context("fusion backend")?;
        backend.sync_records(self.geometry.records_mut());
        backend.sync_records(self.color.records_mut());

        let perspectives = table.gpu_records(&self.radial_bias.meters());
        let active = self.geometry.active_indices();
        let pass = FusionPass {
            table,
            frame: &frame,
            frame_version,
            perspectives: &perspectives,
            geometry: self.geometry.records(),
            active: &active,
            settings: &settings,
        };
        let report = backend.generate(&pass)?;

        log::debug!(
            "[VolumetricMeshSource] '{}' fused frame {} with {} perspectives at LOD {}",
            self.name,
            frame_version,
            active.len(),
            level
        );
        self.lod_level = level;
        self.report = report;
        self.generated_version = Some(frame_version);
        Ok(true)
    }
}

impl GeneratorNode for VolumetricMeshSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_setup(&mut self) -> EngineResult<()> {
        let count = match self.table.as_ref() {
            Some(table) if !table.is_empty() => table.len(),
            _ => {
                return Err(EngineError::SetupFailed {
                    node: self.name.clone(),
                    reason: "no perspective table".to_string(),
                })
            }
        };
        self.geometry.resize(count);
        self.color.resize(count);
        self.radial_bias.resize(count);
        self.apply_perspective_overrides();

        if self.backend.is_none() {
            let backend = FusionBackend::select(self.config.backend, self.gpu_context.clone())?;
            log::info!(
                "[VolumetricMeshSource] '{}' running on the {} backend",
                self.name,
                backend.kind()
            );
            self.backend = Some(backend);
        }
        Ok(())
    }

    fn on_resize(&mut self) -> bool {
        match self.resize_pass() {
            Ok(changed) => changed,
            Err(e) => {
                log::warn!("[VolumetricMeshSource] '{}' resize failed: {}", self.name, e);
                false
            }
        }
    }

    fn on_generate(&mut self) -> bool {
        match self.generate_pass() {
            Ok(generated) => generated,
            Err(e) => {
                log::error!("[VolumetricMeshSource] '{}' generate failed: {}", self.name, e);
                false
            }
        }
    }

    fn can_generate(&mut self) -> bool {
        self.gate.allows_generation()
    }

    fn on_update(&mut self) {
        if self.radial_bias.propagate() {
            self.requests.generate = true;
        }

        if let Some((min, max)) = self.world_bounds() {
            match self.gate.update(min, max, &self.viewpoint) {
                VisibilityChange::BecameVisible => {
                    log::info!("[VolumetricMeshSource] '{}' became visible", self.name);
                    self.requests.generate = true;
                }
                VisibilityChange::BecameInvisible => {
                    log::info!("[VolumetricMeshSource] '{}' became invisible", self.name);
                }
                VisibilityChange::Unchanged => {}
            }
        }
    }

    fn on_cleanup(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.release();
        }
        self.backend = None;
        self.grid = None;
        self.generated_version = None;
        self.report = PassReport::default();
        log::info!("[VolumetricMeshSource] '{}' released its buffers", self.name);
    }

    fn take_requests(&mut self) -> ScheduleRequest {
        // A frame we have not fused yet is a generate request
        let version = self.frame_source.frame_version();
        if self.generated_version != Some(version) && self.frame_source.current_frame().is_some() {
            self.requests.generate = true;
        }
        std::mem::take(&mut self.requests)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
