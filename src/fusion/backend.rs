//! Backend selection and the per-pass contract shared by both backends

use super::cpu_backend::CpuFusion;
use super::error::FusionResult;
use super::gpu_backend::GpuFusion;
use super::grid::VoxelGrid;
use super::indirect_args::{ArgsSettings, DispatchIndirectArgs, DrawIndirectArgs};
use super::mask::MaskSettings;
use super::normal_weight::NormalWeightSettings;
use super::surface::TriangleRecord;
use super::volume::GenerationStrategy;
use super::weighting::WeightingParams;
use crate::config::BackendPreference;
use crate::error::EngineError;
use crate::gpu::GpuContext;
use crate::perspective::records::SyncedRecords;
use crate::perspective::{FrameAtlas, PerspectiveGeometry, PerspectiveGpu, PerspectiveTable};
use bytemuck::Pod;

/// Settings that stay fixed for one generate call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassSettings {
    pub strategy: GenerationStrategy,
    pub weights: WeightingParams,
    pub mask: MaskSettings,
    pub normals: NormalWeightSettings,
    /// Smoothing σ in voxels, `None` when smoothing is off
    pub smoothing: Option<f32>,
    pub lod_stride: u32,
    pub threshold: f32,
    pub args: ArgsSettings,
}

impl Default for PassSettings {
    fn default() -> Self {
        Self {
            strategy: GenerationStrategy::default(),
            weights: WeightingParams::default(),
            mask: MaskSettings::default(),
            normals: NormalWeightSettings::default(),
            smoothing: None,
            lod_stride: 1,
            threshold: 0.5,
            args: ArgsSettings::default(),
        }
    }
}

/// Inputs of one generate call
pub struct FusionPass<'a> {
    pub table: &'a PerspectiveTable,
    pub frame: &'a FrameAtlas,
    /// Bumped by the frame source whenever `frame` changes
    pub frame_version: u64,
    /// GPU records with the radial bias already applied
    pub perspectives: &'a [PerspectiveGpu],
    pub geometry: &'a SyncedRecords<PerspectiveGeometry>,
    /// Enabled perspectives in ascending order
    pub active: &'a [u32],
    pub settings: &'a PassSettings,
}

/// What a generate call can report without waiting on the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Raw append counter; `None` when reading it would stall
    pub triangle_count: Option<u32>,
    pub draw: Option<DrawIndirectArgs>,
    pub dispatch: Option<DispatchIndirectArgs>,
}

/// The compute backend a mesh source runs on
pub enum FusionBackend {
    Cpu(CpuFusion),
    Gpu(Box<GpuFusion>),
}

impl std::fmt::Debug for FusionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

impl FusionBackend {
    /// Pick a backend. `Auto` falls back to the CPU when no device is usable.
    pub fn select(preference: BackendPreference, context: Option<GpuContext>) -> FusionResult<Self> {
        match preference {
            BackendPreference::Cpu => Ok(Self::cpu()),
            BackendPreference::Gpu => {
                let context = match context {
                    Some(context) => context,
                    None => GpuContext::new_blocking()?,
                };
                Ok(Self::Gpu(Box::new(GpuFusion::new(context)?)))
            }
            BackendPreference::Auto => {
                let context = match context {
                    Some(context) => Ok(context),
                    None => GpuContext::new_blocking(),
                };
                match context.map_err(EngineError::from).and_then(GpuFusion::new) {
                    Ok(gpu) => Ok(Self::Gpu(Box::new(gpu))),
                    Err(e) => {
                        log::warn!("[FusionBackend] GPU unavailable ({}), using CPU kernels", e);
                        Ok(Self::cpu())
                    }
                }
            }
        }
    }

    pub fn cpu() -> Self {
        Self::Cpu(CpuFusion::new())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FusionBackend::Cpu(_) => "cpu",
            FusionBackend::Gpu(_) => "gpu",
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, FusionBackend::Gpu(_))
    }

    pub fn resize(&mut self, grid: VoxelGrid, table: &PerspectiveTable, settings: &PassSettings) -> FusionResult<bool> {
        match self {
            FusionBackend::Cpu(cpu) => Ok(cpu.resize(grid, table, settings)),
            FusionBackend::Gpu(gpu) => gpu.resize(grid, table, settings),
        }
    }

    pub fn generate(&mut self, pass: &FusionPass<'_>) -> FusionResult<PassReport> {
        match self {
            FusionBackend::Cpu(cpu) => cpu.generate(pass),
            FusionBackend::Gpu(gpu) => gpu.generate(pass),
        }
    }

    /// Push dirty records to wherever the kernels read them from
    pub fn sync_records<T: Pod>(&self, records: &mut SyncedRecords<T>) -> bool {
        match self {
            FusionBackend::Cpu(_) => records.take_dirty(),
            FusionBackend::Gpu(gpu) => records.sync(gpu.buffers()),
        }
    }

    /// Raw triangle counter. Stalls on the GPU backend.
    pub fn read_triangle_count(&self) -> FusionResult<u32> {
        match self {
            FusionBackend::Cpu(cpu) => Ok(cpu.triangle_count()),
            FusionBackend::Gpu(gpu) => gpu.read_triangle_count(),
        }
    }

    /// Stored triangles. Stalls on the GPU backend.
    pub fn read_triangles(&self) -> FusionResult<Vec<TriangleRecord>> {
        match self {
            FusionBackend::Cpu(cpu) => Ok(cpu.triangles().to_vec()),
            FusionBackend::Gpu(gpu) => gpu.read_triangles(),
        }
    }

    /// Current field side. Stalls on the GPU backend.
    pub fn read_field(&self) -> FusionResult<Vec<f32>> {
        match self {
            FusionBackend::Cpu(cpu) => Ok(cpu.field().to_vec()),
            FusionBackend::Gpu(gpu) => gpu.read_field(),
        }
    }

    pub fn read_args(&self) -> FusionResult<(DrawIndirectArgs, DispatchIndirectArgs)> {
        match self {
            FusionBackend::Cpu(cpu) => Ok(cpu.args()),
            FusionBackend::Gpu(gpu) => gpu.read_args(),
        }
    }

    pub fn release(&mut self) {
        match self {
            FusionBackend::Cpu(cpu) => cpu.release(),
            FusionBackend::Gpu(gpu) => gpu.release(),
        }
    }
}
