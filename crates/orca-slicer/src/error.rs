//! Error taxonomy and native error mapping.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::native::{codes, NativeError};

/// Errors surfaced to callers of the slicer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// An operation needed the engine but it is not initialized and
    /// auto-initialization is disabled.
    #[error("engine is not initialized")]
    NotInitialized,

    /// Bad parameters or a conflicting re-initialization.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced file does not exist.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Failure reported by the native engine, code and message verbatim.
    #[error("native engine failure [{code}]: {message}")]
    NativeFailure {
        /// Native error code.
        code: i32,
        /// Native error message.
        message: String,
    },

    /// The work queue is saturated.
    #[error("engine busy: {capacity} operations already in flight")]
    Busy {
        /// Configured queue bound.
        capacity: usize,
    },

    /// The operation was cancelled while still queued.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller stopped waiting. A native call that was already running
    /// still completes; its result is discarded.
    #[error("operation abandoned after {0:?}")]
    TimedOut(Duration),
}

impl EngineError {
    /// Failure synthesized when the worker thread is unavailable.
    pub(crate) fn worker_stopped() -> Self {
        EngineError::NativeFailure {
            code: codes::WORKER_STOPPED,
            message: "engine worker is not running".into(),
        }
    }

    /// Failure synthesized from a panic payload caught at the native boundary.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "native call panicked".to_string()
        };
        EngineError::NativeFailure {
            code: codes::PANIC,
            message,
        }
    }
}

impl From<NativeError> for EngineError {
    fn from(err: NativeError) -> Self {
        map_native(err, None)
    }
}

/// Map a native failure onto the error taxonomy.
///
/// `subject` is the file the operation was about, if any. A "file not found"
/// code without a subject has nothing to point at and stays a native failure.
pub fn map_native(err: NativeError, subject: Option<&Path>) -> EngineError {
    match (err.code, subject) {
        (codes::INVALID_ARGUMENTS, _) => EngineError::InvalidInput(err.message),
        (codes::FILE_NOT_FOUND, Some(path)) => EngineError::FileNotFound(path.to_path_buf()),
        _ => EngineError::NativeFailure {
            code: err.code,
            message: err.message,
        },
    }
}

/// Result type for slicer operations.
pub type Result<T> = std::result::Result<T, EngineError>;
