use std::path::PathBuf;
use thiserror::Error;

/// Structured error type for the segmentation backend.
///
/// # Variant domains
///
/// Loading (catalog lookup, file access, session creation, type introspection) and
/// model-family detection each have their own variant so callers can tell a missing
/// model apart from a broken one. Inference failures are wrapped from [`RunError`],
/// which keeps the small fixed taxonomy `run` reports.
#[derive(Error, Debug)]
pub enum SegError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Catalog error: {path:?}: {reason}")]
    Catalog { path: PathBuf, reason: String },

    #[error("Model not found: {id}")]
    ModelNotFound { id: String },

    #[error("Unknown backend '{backend}' for model '{id}'")]
    UnknownBackend { id: String, backend: String },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unsupported element type {type_name} for tensor '{tensor}'")]
    UnsupportedType { tensor: String, type_name: String },

    #[error("Decoder has {outputs} outputs, expected 1 or at least 3")]
    ModelFamily { outputs: usize },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("Inference failed: {0}")]
    Inference(#[from] RunError),
}

pub type Result<T> = std::result::Result<T, SegError>;

/// Failure modes of a single `run` call.
///
/// No partial output is guaranteed when any of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("no loaded session")]
    NullContext,

    #[error("tensor count mismatch: session expects {expected}, caller passed {got}")]
    IoCountMismatch { expected: usize, got: usize },

    #[error("runtime execution failed: {0}")]
    Execution(String),

    #[error("invalid tensor #{index}: {reason}")]
    InvalidTensor { index: usize, reason: String },
}

impl RunError {
    /// Legacy negative status code, for hosts that persist or compare them.
    pub const fn code(&self) -> i32 {
        match self {
            Self::NullContext => -1,
            Self::IoCountMismatch { .. } => -2,
            Self::Execution(_) => -3,
            Self::InvalidTensor { .. } => -4,
        }
    }
}

impl From<ort::Error> for RunError {
    fn from(err: ort::Error) -> Self {
        Self::Execution(err.to_string())
    }
}

/// Convert anyhow errors to configuration errors.
impl From<anyhow::Error> for SegError {
    fn from(err: anyhow::Error) -> Self {
        SegError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// # Default context
///
/// Code that knows the path and operation should build `SegError::FileSystem`
/// directly; this conversion only covers the call sites that don't.
impl From<std::io::Error> for SegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for SegError {
    fn from(err: image::ImageError) -> Self {
        Self::Model {
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for SegError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of tensor staging, so they count as model errors.
impl From<ndarray::ShapeError> for SegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_json::Error> for SegError {
    fn from(err: serde_json::Error) -> Self {
        Self::Catalog {
            path: PathBuf::from("unknown"),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_codes_are_distinct_and_negative() {
        let errs = [
            RunError::NullContext,
            RunError::IoCountMismatch {
                expected: 1,
                got: 2,
            },
            RunError::Execution("boom".into()),
            RunError::InvalidTensor {
                index: 0,
                reason: "negative dim".into(),
            },
        ];
        let codes: Vec<i32> = errs.iter().map(RunError::code).collect();
        assert_eq!(codes, vec![-1, -2, -3, -4]);
    }

    #[test]
    fn run_error_wraps_into_seg_error() {
        let err: SegError = RunError::NullContext.into();
        assert!(matches!(err, SegError::Inference(RunError::NullContext)));
        assert!(err.to_string().contains("no loaded session"));
    }
}
