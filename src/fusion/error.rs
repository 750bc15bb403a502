//! Fusion error handling
//!
//! Error aliases and context helpers for the reconstruction pipeline.

use crate::error::{EngineError, EngineResult};

/// Fusion-specific result type
pub type FusionResult<T> = EngineResult<T>;

/// Error context for fusion operations
pub trait FusionErrorContext<T> {
    fn fusion_context(self, context: &str) -> FusionResult<T>;
}

impl<T> FusionErrorContext<T> for Option<T> {
    fn fusion_context(self, context: &str) -> FusionResult<T> {
        self.ok_or_else(|| EngineError::ResourceNotFound {
            resource_type: "fusion".to_string(),
            id: context.to_string(),
        })
    }
}

impl<T, E> FusionErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn fusion_context(self, context: &str) -> FusionResult<T> {
        self.map_err(|e| EngineError::SystemError {
            component: "fusion".to_string(),
            error: format!("{}: {}", context, e),
        })
    }
}
