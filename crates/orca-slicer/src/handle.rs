//! Engine lifecycle.
//!
//! [`EngineHandle`] owns the native engine and its state machine:
//!
//! ```text
//! Uninitialized -> Initializing -> Ready -> ShuttingDown -> Uninitialized
//!        ^              |
//!        +---- failure -+
//! ```
//!
//! The handle lives on the worker thread, so every transition is already
//! serialized with respect to native calls.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::InitOptions;
use crate::error::{map_native, EngineError, Result};
use crate::model::{ModelInfo, SliceRequest, SliceResult};
use crate::native::{NativeEngine, NativeError, PresetKind};

/// Lifecycle state of the native engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No native resources loaded.
    Uninitialized,
    /// Native initialization in progress.
    Initializing,
    /// Accepting native calls.
    Ready,
    /// Native resources being released.
    ShuttingDown,
}

/// Owner of the native engine instance.
pub struct EngineHandle {
    engine: Box<dyn NativeEngine>,
    state: EngineState,
    active: Option<InitOptions>,
    defaults: InitOptions,
    presets: BTreeSet<(PresetKind, String)>,
    auto_initialize: bool,
    state_tx: watch::Sender<EngineState>,
}

impl EngineHandle {
    /// Wrap an engine. `defaults` drive lazy initialization until an explicit
    /// [`initialize`](Self::initialize) replaces them.
    pub fn new(engine: Box<dyn NativeEngine>, defaults: InitOptions, auto_initialize: bool) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Uninitialized);
        Self {
            engine,
            state: EngineState::Uninitialized,
            active: None,
            defaults,
            presets: BTreeSet::new(),
            auto_initialize,
            state_tx,
        }
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// Bring the engine to `Ready` with `options`.
    ///
    /// On a `Ready` engine this is a no-op unless `options` names a different
    /// resources path, which is rejected. Presets not yet loaded are loaded.
    /// Any failure, including a panic in the engine, leaves it `Uninitialized`.
    pub fn initialize(&mut self, options: InitOptions) -> Result<()> {
        if self.state == EngineState::Ready {
            let current = self.active.as_ref().and_then(|o| o.resources_path.as_deref());
            if let Some(requested) = options.resources_path.as_deref() {
                if current != Some(requested) {
                    return Err(EngineError::InvalidInput(format!(
                        "engine already initialized with resources {}; refusing to switch to {}",
                        current.map_or_else(|| "<none>".into(), |p| p.display().to_string()),
                        requested.display()
                    )));
                }
            }
            return self.load_presets(&options);
        }

        let resources = options.resources_path.clone();
        if let Some(path) = resources.as_deref() {
            if !path.exists() {
                return Err(EngineError::FileNotFound(path.to_path_buf()));
            }
        }

        self.set_state(EngineState::Initializing);
        let verbose = options.verbose;
        log(verbose, "initializing native engine", resources.as_deref());

        let started = panic::catch_unwind(AssertUnwindSafe(|| {
            self.engine
                .initialize(resources.as_deref(), verbose, options.strict)
        }));
        match started {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(code = err.code, error = %err.message, "native initialization failed");
                self.set_state(EngineState::Uninitialized);
                return Err(map_native(err, resources.as_deref()));
            }
            Err(payload) => {
                self.set_state(EngineState::Uninitialized);
                let err = EngineError::from_panic(payload);
                warn!(error = %err, "native initialization panicked");
                return Err(err);
            }
        }

        let loaded = panic::catch_unwind(AssertUnwindSafe(|| self.load_presets(&options)))
            .unwrap_or_else(|payload| Err(EngineError::from_panic(payload)));
        if let Err(err) = loaded {
            self.release();
            self.set_state(EngineState::Uninitialized);
            return Err(err);
        }

        self.defaults = options.clone();
        self.active = Some(options);
        self.set_state(EngineState::Ready);
        Ok(())
    }

    /// Initialize with the remembered options if auto-initialization is on.
    pub fn ensure_initialized(&mut self) -> Result<()> {
        match self.state {
            EngineState::Ready => Ok(()),
            _ if self.auto_initialize => {
                debug!("lazy engine initialization");
                self.initialize(self.defaults.clone())
            }
            _ => Err(EngineError::NotInitialized),
        }
    }

    /// Release native resources. The engine is only told to shut down when
    /// it is `Ready`; otherwise this is a no-op.
    pub fn shutdown(&mut self) {
        if self.state != EngineState::Ready {
            if self.state != EngineState::Uninitialized {
                self.set_state(EngineState::Uninitialized);
            }
            return;
        }
        self.set_state(EngineState::ShuttingDown);
        self.release();
        self.active = None;
        self.set_state(EngineState::Uninitialized);
        info!("native engine shut down");
    }

    /// Load a profile preset.
    pub fn load_preset(&mut self, kind: PresetKind, name: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.load_one(kind, name)
    }

    /// Load a model and describe it.
    pub fn model_info(&mut self, path: &Path) -> Result<ModelInfo> {
        self.ensure_initialized()?;
        log(self.verbose(), "inspecting model", Some(path));

        let subject = Some(path);
        let model = self.engine.load_model(path).map_err(|e| map_native(e, subject))?;
        let info = self.engine.inspect(&model).map_err(|e| map_native(e, subject))?;
        info.check().map_err(EngineError::from)?;
        Ok(info)
    }

    /// Load the request's model and slice it.
    pub fn slice(&mut self, request: &SliceRequest) -> Result<SliceResult> {
        self.ensure_initialized()?;
        let verbose = request.verbose || self.verbose();
        log(verbose, "slicing model", Some(&request.input));
        if verbose {
            info!(
                plate = request.plate,
                output = %request.output.display(),
                overrides = request.overrides.len(),
                dry_run = request.dry_run,
                "slice parameters"
            );
        }

        let subject = Some(request.input.as_path());
        let model = self
            .engine
            .load_model(&request.input)
            .map_err(|e| map_native(e, subject))?;
        let output = self
            .engine
            .slice_to_gcode(&model, request)
            .map_err(|e| map_native(e, subject))?;

        let output = checked_output(output, request)?;
        log(verbose, "slice complete", Some(&output));
        Ok(SliceResult { output })
    }

    fn release(&mut self) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.engine.shutdown())).is_err() {
            warn!("native shutdown panicked");
        }
        self.presets.clear();
    }

    fn verbose(&self) -> bool {
        self.active.as_ref().is_some_and(|o| o.verbose)
    }

    fn load_presets(&mut self, options: &InitOptions) -> Result<()> {
        for (kind, name) in options.presets() {
            self.load_one(kind, name)?;
        }
        Ok(())
    }

    fn load_one(&mut self, kind: PresetKind, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidInput(format!("{kind} preset name is empty")));
        }
        let key = (kind, name.to_string());
        if self.presets.contains(&key) {
            return Ok(());
        }
        debug!(%kind, name, "loading preset");
        self.engine.load_preset(kind, name).map_err(EngineError::from)?;
        self.presets.insert(key);
        Ok(())
    }

    fn set_state(&mut self, state: EngineState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn checked_output(output: PathBuf, request: &SliceRequest) -> Result<PathBuf> {
    if request.dry_run {
        return Ok(request.output.clone());
    }
    if output.as_os_str().is_empty() {
        return Err(NativeError::malformed("engine reported an empty output path").into());
    }
    Ok(output)
}

fn log(verbose: bool, message: &str, path: Option<&Path>) {
    let path = path.map(|p| p.display().to_string()).unwrap_or_default();
    if verbose {
        info!(path = %path, "{}", message);
    } else {
        debug!(path = %path, "{}", message);
    }
}
