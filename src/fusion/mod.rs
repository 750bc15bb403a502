//! Volumetric depth fusion
//!
//! Turns a multi-perspective depth atlas into a triangle list:
//!
//! 1. **Normal weights** - per-pixel weight from how squarely the surface faces the sensor
//! 2. **Edge mask** - per-perspective confidence from depth discontinuities
//! 3. **Volume** - weighted occupancy blended from every active perspective
//! 4. **Smoothing** - optional separable Gaussian over the field
//! 5. **Extraction** - marching cubes into an append buffer
//! 6. **Indirect args** - draw/dispatch arguments from the append counter
//!
//! Every stage exists as a WGSL kernel and as a rayon reference kernel that
//! consume the same uniform structs. [`VolumetricMeshSource`] wires the stages
//! into the generator lifecycle.

pub mod backend;
pub mod cpu_backend;
pub mod error;
pub mod field;
pub mod gaussian;
pub mod gpu_backend;
pub mod grid;
pub mod indirect_args;
pub mod lod;
pub mod march_tables;
pub mod mask;
pub mod mesh_source;
pub mod normal_weight;
pub mod surface;
pub mod visibility;
pub mod volume;
pub mod weighting;

#[cfg(test)]
mod tests;

pub use backend::{FusionBackend, FusionPass, PassReport, PassSettings};
pub use cpu_backend::CpuFusion;
pub use error::{FusionErrorContext, FusionResult};
pub use field::PingPong;
pub use gaussian::GaussianKernel;
pub use gpu_backend::GpuFusion;
pub use grid::{VolumeBounds, VoxelGrid};
pub use indirect_args::{
    recalibrated_capacity, ArgsSettings, DispatchIndirectArgs, DrawIndirectArgs, DEFAULT_MAX_TRIANGLES,
    TRIANGLE_HEADROOM,
};
pub use lod::LevelOfDetail;
pub use mask::{EdgeMaskGenerator, MaskSettings, MaskView};
pub use mesh_source::VolumetricMeshSource;
pub use normal_weight::{NormalWeightGenerator, NormalWeightSettings, NormalWeightView};
pub use surface::{SurfaceVertex, TriangleRecord};
pub use visibility::{PlaybackControl, Viewpoint, VisibilityChange, VisibilityGate};
pub use volume::{GenerationStrategy, VolumeGenerator};
pub use weighting::{RadialBias, ViewDependence, WeightingParams};

/// Threads per axis of the 3D volume, blur and extraction kernels
pub const WORKGROUP_SIZE_3D: u32 = 4;

/// Threads per axis of the layered 2D mask and normal weight kernels
pub const WORKGROUP_SIZE_2D: u32 = 8;

/// Threads of 1D kernels
pub const WORKGROUP_SIZE_1D: u32 = 64;
