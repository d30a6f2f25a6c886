//! Interface to the native slicing engine.
//!
//! The engine is synchronous, blocking and holds process-wide mutable state.
//! Nothing in this module is thread-aware: implementations are only ever
//! driven from the single worker thread owned by [`crate::queue::WorkQueue`].

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::{ModelInfo, SliceRequest};

/// Error codes reported by the native engine.
///
/// Positive values come from the engine itself. Negative values are
/// synthesized by this crate when the failure happens at the boundary.
pub mod codes {
    /// Bad arguments passed to the engine.
    pub const INVALID_ARGUMENTS: i32 = 1;
    /// A referenced file does not exist.
    pub const FILE_NOT_FOUND: i32 = 2;
    /// The model file could not be parsed.
    pub const INVALID_FILE: i32 = 3;
    /// Profile or configuration problem.
    pub const CONFIGURATION: i32 = 4;
    /// Slicing or G-code export failed.
    pub const SLICING: i32 = 5;
    /// Engine initialization failed.
    pub const INITIALIZATION: i32 = 6;
    /// Internal engine error.
    pub const INTERNAL: i32 = 7;
    /// Unclassified engine error.
    pub const UNKNOWN: i32 = 99;

    /// The native call panicked.
    pub const PANIC: i32 = -1;
    /// The native call returned data that violates its contract.
    pub const MALFORMED_OUTPUT: i32 = -2;
    /// The worker thread is gone.
    pub const WORKER_STOPPED: i32 = -3;
}

/// A failure reported by the native engine, as a raw code and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    /// Engine error code (see [`codes`]).
    pub code: i32,
    /// Message as reported by the engine.
    pub message: String,
}

impl NativeError {
    /// Create a native error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Native output that violates the engine contract.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(codes::MALFORMED_OUTPUT, message)
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for NativeError {}

/// Result type for native calls.
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Kind of profile preset the engine can load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetKind {
    /// Vendor bundle (printer family definitions).
    Vendor,
    /// Printer (machine) profile.
    Printer,
    /// Filament profile.
    Filament,
    /// Process (print settings) profile.
    Process,
}

impl fmt::Display for PresetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PresetKind::Vendor => "vendor",
            PresetKind::Printer => "printer",
            PresetKind::Filament => "filament",
            PresetKind::Process => "process",
        };
        f.write_str(name)
    }
}

/// A model loaded into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHandle {
    id: u64,
    path: PathBuf,
}

impl ModelHandle {
    /// Create a handle. Engines choose the id.
    pub fn new(id: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
        }
    }

    /// Engine-assigned identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Source file of the model.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A native slicing engine.
///
/// Every method blocks until the engine is done. Implementations may assume
/// they are never called concurrently.
pub trait NativeEngine: Send + 'static {
    /// Engine version string. Must be side-effect free and must not require
    /// initialization.
    fn version(&self) -> String;

    /// Load engine resources. `resources_path` is the profile search root.
    /// With `strict`, only presets loaded explicitly through
    /// [`load_preset`](Self::load_preset) may be used; nothing is autoloaded.
    fn initialize(
        &mut self,
        resources_path: Option<&Path>,
        verbose: bool,
        strict: bool,
    ) -> NativeResult<()>;

    /// Release engine resources. Called only on an initialized engine.
    fn shutdown(&mut self);

    /// Load a profile preset by name.
    fn load_preset(&mut self, kind: PresetKind, name: &str) -> NativeResult<()>;

    /// Load a model file.
    fn load_model(&mut self, path: &Path) -> NativeResult<ModelHandle>;

    /// Describe a loaded model.
    fn inspect(&mut self, model: &ModelHandle) -> NativeResult<ModelInfo>;

    /// Slice a loaded model and write the output file. Returns the path
    /// actually written.
    fn slice_to_gcode(&mut self, model: &ModelHandle, request: &SliceRequest)
        -> NativeResult<PathBuf>;
}
