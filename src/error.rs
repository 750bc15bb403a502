//! Unified error handling for the fusion engine
//!
//! Every fallible operation in the crate returns [`EngineResult`]. Subsystems
//! keep their own `thiserror` enums and convert into [`EngineError`] at the
//! boundary, so the lifecycle layer only ever deals with one error type.

use std::error::Error as StdError;
use std::fmt;

/// Main error type for the fusion engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    // Resource Errors
    ResourceNotFound {
        resource_type: String,
        id: String,
    },
    StaleHandle {
        index: u32,
        generation: u32,
    },

    // GPU Errors
    DeviceNotFound,
    GpuOperationFailed {
        operation: String,
        error: String,
    },
    BufferError {
        operation: String,
        error: String,
    },

    // Configuration Errors
    InvalidConfig {
        field: String,
        value: String,
        reason: String,
    },
    MissingConfig {
        field: String,
    },

    // Lifecycle Errors
    SetupFailed {
        node: String,
        reason: String,
    },

    // System Errors
    SystemError {
        component: String,
        error: String,
    },
    IoError {
        path: String,
        error: String,
    },
    SerializationError {
        context: String,
        error: String,
    },
    DeserializationError {
        context: String,
        error: String,
    },

    // Generic fallback for unexpected errors
    Internal {
        message: String,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::ResourceNotFound { resource_type, id } => {
                write!(f, "Resource not found: {} '{}'", resource_type, id)
            }
            EngineError::StaleHandle { index, generation } => write!(
                f,
                "Stale node handle: slot {} generation {}",
                index, generation
            ),

            EngineError::DeviceNotFound => write!(f, "No compatible GPU device found"),
            EngineError::GpuOperationFailed { operation, error } => {
                write!(f, "GPU operation '{}' failed: {}", operation, error)
            }
            EngineError::BufferError { operation, error } => {
                write!(f, "Buffer error during {}: {}", operation, error)
            }

            EngineError::InvalidConfig {
                field,
                value,
                reason,
            } => write!(f, "Invalid config: {} = {} ({})", field, value, reason),
            EngineError::MissingConfig { field } => {
                write!(f, "Missing config field: {}", field)
            }

            EngineError::SetupFailed { node, reason } => {
                write!(f, "Setup failed for {}: {}", node, reason)
            }

            EngineError::SystemError { component, error } => {
                write!(f, "System error in {}: {}", component, error)
            }
            EngineError::IoError { path, error } => write!(f, "IO error at {}: {}", path, error),
            EngineError::SerializationError { context, error } => {
                write!(f, "Serialization error in {}: {}", context, error)
            }
            EngineError::DeserializationError { context, error } => {
                write!(f, "Deserialization error in {}: {}", context, error)
            }

            EngineError::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl StdError for EngineError {}

/// Type alias for Results in the fusion engine
pub type EngineResult<T> = Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        EngineError::IoError {
            path: String::new(),
            error: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::DeserializationError {
            context: "json".to_string(),
            error: error.to_string(),
        }
    }
}

impl From<image::ImageError> for EngineError {
    fn from(error: image::ImageError) -> Self {
        EngineError::ResourceNotFound {
            resource_type: "frame image".to_string(),
            id: error.to_string(),
        }
    }
}

/// Convert Option to Result with a not-found error
pub trait OptionExt<T> {
    fn ok_or_not_found(self, resource_type: &str, id: impl fmt::Display) -> EngineResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource_type: &str, id: impl fmt::Display) -> EngineResult<T> {
        self.ok_or_else(|| EngineError::ResourceNotFound {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        })
    }
}

/// Extension trait for adding context to foreign errors
pub trait ErrorContext<T> {
    fn context(self, component: &str) -> EngineResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: fmt::Display,
{
    fn context(self, component: &str) -> EngineResult<T> {
        self.map_err(|e| EngineError::SystemError {
            component: component.to_string(),
            error: e.to_string(),
        })
    }
}
