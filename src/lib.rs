//! Depth fusion engine
//!
//! Reconstructs a surface every frame from a multi-perspective depth atlas
//! and emits a triangle list plus indirect draw/dispatch arguments. The
//! pipeline runs as a node of a generator tree that schedules Setup, Resize
//! and Generate phases parent-before-child.

pub mod config;
pub mod error;
pub mod fusion;
pub mod gpu;
pub mod lifecycle;
pub mod perspective;

pub use config::{BackendPreference, ConfigError, ConfigFormat, FusionConfig};
pub use error::{EngineError, EngineResult, ErrorContext, OptionExt};
pub use fusion::{
    FusionBackend, GenerationStrategy, TriangleRecord, Viewpoint, VolumeBounds, VolumetricMeshSource, VoxelGrid,
};
pub use gpu::{GpuContext, GpuError};
pub use lifecycle::{GeneratorEvent, GeneratorNode, GeneratorTree, NodeHandle, NodeState, ScheduleRequest};
pub use perspective::{FrameAtlas, FrameSource, Perspective, PerspectiveTable, SharedFrame};
