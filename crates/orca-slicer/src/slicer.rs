//! Public async surface.
//!
//! [`Slicer`] validates inputs on the caller's side, then hands the native
//! work to the [`WorkQueue`]. Validation failures never occupy a queue slot.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{InitOptions, SlicerConfig};
use crate::error::{EngineError, Result};
use crate::handle::{EngineHandle, EngineState};
use crate::model::{check_model_path, ModelInfo, SliceParams, SliceResult};
use crate::native::{NativeEngine, PresetKind};
use crate::queue::{OperationKind, Pending, WorkQueue};

/// Async front end to a native slicing engine.
///
/// All native calls run one at a time on a dedicated engine thread, in
/// submission order. Dropping the slicer cancels queued operations and shuts
/// the engine down once the executing call returns.
pub struct Slicer {
    queue: WorkQueue,
    version: String,
    timeout: Option<Duration>,
    output_extension: String,
    state: watch::Receiver<EngineState>,
}

impl Slicer {
    /// Start the engine thread. The engine is not initialized yet.
    pub fn new(engine: impl NativeEngine, config: SlicerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;

        let version = engine.version();
        let handle = EngineHandle::new(Box::new(engine), config.init.clone(), config.auto_initialize);
        let state = handle.subscribe();
        let queue = WorkQueue::start(handle, config.queue_capacity)?;

        info!(
            version = %version,
            capacity = config.queue_capacity,
            auto_initialize = config.auto_initialize,
            "slicer started"
        );

        Ok(Self {
            queue,
            version,
            timeout: config.timeout(),
            output_extension: config.output_extension().to_string(),
            state,
        })
    }

    /// Engine version. Never touches the queue or requires initialization.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn state_changes(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    /// Operations queued or executing.
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Initialize the engine explicitly.
    ///
    /// A second call with the same or no resources path is a no-op apart from
    /// loading presets not loaded yet. A different resources path fails with
    /// [`EngineError::InvalidInput`]. A missing resources path on an engine
    /// that is not yet initialized fails with [`EngineError::FileNotFound`].
    pub async fn initialize(&self, options: InitOptions) -> Result<()> {
        if let Some((kind, _)) = options.presets().find(|(_, name)| name.trim().is_empty()) {
            return Err(EngineError::InvalidInput(format!("{kind} preset name is empty")));
        }

        debug!(resources = ?options.resources_path, "initialize requested");
        self.submit(OperationKind::Initialize, move |h| h.initialize(options))?
            .wait()
            .await
    }

    /// Release native resources. Later operations initialize again lazily.
    pub async fn shutdown(&self) -> Result<()> {
        self.submit(OperationKind::Shutdown, |h| {
            h.shutdown();
            Ok(())
        })?
        .wait()
        .await
    }

    /// Load a single profile preset.
    pub async fn load_preset(&self, kind: PresetKind, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidInput(format!("{kind} preset name is empty")));
        }
        let name = name.to_string();
        self.submit(OperationKind::LoadPreset, move |h| h.load_preset(kind, &name))?
            .wait()
            .await
    }

    /// Load a model and describe it.
    pub async fn model_info(&self, path: impl AsRef<Path>) -> Result<ModelInfo> {
        self.submit_model_info(path)?.wait().await
    }

    /// Queue a model inspection without waiting for it.
    pub fn submit_model_info(&self, path: impl AsRef<Path>) -> Result<Pending<ModelInfo>> {
        let path: PathBuf = path.as_ref().to_path_buf();
        check_model_path(&path)?;
        debug!(path = %path.display(), "model info requested");
        self.submit(OperationKind::GetModelInfo, move |h| h.model_info(&path))
    }

    /// Slice a model to G-code.
    pub async fn slice(&self, params: SliceParams) -> Result<SliceResult> {
        self.submit_slice(params)?.wait().await
    }

    /// Queue a slice without waiting for it.
    pub fn submit_slice(&self, params: SliceParams) -> Result<Pending<SliceResult>> {
        let request = params.into_request(&self.output_extension)?;
        debug!(
            input = %request.input.display(),
            output = %request.output.display(),
            plate = request.plate,
            "slice requested"
        );
        self.submit(OperationKind::Slice, move |h| h.slice(&request))
    }

    fn submit<T, F>(&self, kind: OperationKind, work: F) -> Result<Pending<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineHandle) -> Result<T> + Send + 'static,
    {
        Ok(self.queue.submit(kind, work)?.with_timeout(self.timeout))
    }
}

impl std::fmt::Debug for Slicer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slicer")
            .field("version", &self.version)
            .field("state", &self.state())
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}
