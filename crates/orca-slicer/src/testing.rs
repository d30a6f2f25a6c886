//! Scripted engine for unit tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::model::{ModelInfo, SliceRequest};
use crate::native::{codes, ModelHandle, NativeEngine, NativeError, NativeResult, PresetKind};

/// A native call observed by the fake.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Initialize(Option<PathBuf>),
    Shutdown,
    LoadPreset(PresetKind, String),
    LoadModel(PathBuf),
    Inspect(PathBuf),
    Slice {
        input: PathBuf,
        output: PathBuf,
        overrides: BTreeMap<String, String>,
    },
}

/// Shared view of what the fake engine did.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Recorder {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, call: Call) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(call);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Holds slice calls until opened.
#[derive(Clone, Default)]
pub(crate) struct Gate {
    open: Arc<(Mutex<bool>, Condvar)>,
    entered: Arc<AtomicUsize>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn open(&self) {
        let (lock, cvar) = &*self.open;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    /// Block until `n` calls have reached the gate.
    pub(crate) fn wait_entered(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.entered.load(Ordering::SeqCst) < n {
            assert!(Instant::now() < deadline, "gate never reached");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    pub(crate) fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let (lock, cvar) = &*self.open;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }
}

pub(crate) struct FakeEngine {
    recorder: Recorder,
    gate: Option<Gate>,
    init_failures: usize,
    init_panics: usize,
    rejected_preset: Option<String>,
    load_failure: Option<NativeError>,
    slice_failure: Option<NativeError>,
    panic_on_inspect: bool,
    volume: f64,
    next_model: u64,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self {
            recorder: Recorder::default(),
            gate: None,
            init_failures: 0,
            init_panics: 0,
            rejected_preset: None,
            load_failure: None,
            slice_failure: None,
            panic_on_inspect: false,
            volume: 1000.0,
            next_model: 0,
        }
    }

    pub(crate) fn recorder(&self) -> Recorder {
        self.recorder.clone()
    }

    pub(crate) fn gated(mut self, gate: &Gate) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    pub(crate) fn fail_initialize(mut self, times: usize) -> Self {
        self.init_failures = times;
        self
    }

    pub(crate) fn panic_on_initialize(mut self, times: usize) -> Self {
        self.init_panics = times;
        self
    }

    pub(crate) fn reject_preset(mut self, name: &str) -> Self {
        self.rejected_preset = Some(name.to_string());
        self
    }

    pub(crate) fn fail_load(mut self, err: NativeError) -> Self {
        self.load_failure = Some(err);
        self
    }

    pub(crate) fn fail_slice(mut self, err: NativeError) -> Self {
        self.slice_failure = Some(err);
        self
    }

    pub(crate) fn panic_on_inspect(mut self) -> Self {
        self.panic_on_inspect = true;
        self
    }

    pub(crate) fn report_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }
}

impl NativeEngine for FakeEngine {
    fn version(&self) -> String {
        "fake-engine 2.3.0".into()
    }

    fn initialize(
        &mut self,
        resources_path: Option<&Path>,
        _verbose: bool,
        _strict: bool,
    ) -> NativeResult<()> {
        self.recorder.enter(Call::Initialize(resources_path.map(Path::to_path_buf)));
        self.recorder.leave();
        if self.init_panics > 0 {
            self.init_panics -= 1;
            panic!("init crashed");
        }
        if self.init_failures > 0 {
            self.init_failures -= 1;
            return Err(NativeError::new(codes::INITIALIZATION, "resources not found"));
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.recorder.enter(Call::Shutdown);
        self.recorder.leave();
    }

    fn load_preset(&mut self, kind: PresetKind, name: &str) -> NativeResult<()> {
        self.recorder.enter(Call::LoadPreset(kind, name.to_string()));
        self.recorder.leave();
        if self.rejected_preset.as_deref() == Some(name) {
            return Err(NativeError::new(codes::CONFIGURATION, format!("unknown preset {name}")));
        }
        Ok(())
    }

    fn load_model(&mut self, path: &Path) -> NativeResult<ModelHandle> {
        self.recorder.enter(Call::LoadModel(path.to_path_buf()));
        self.recorder.leave();
        if let Some(err) = self.load_failure.clone() {
            return Err(err);
        }
        self.next_model += 1;
        Ok(ModelHandle::new(self.next_model, path))
    }

    fn inspect(&mut self, model: &ModelHandle) -> NativeResult<ModelInfo> {
        self.recorder.enter(Call::Inspect(model.path().to_path_buf()));
        self.recorder.leave();
        if self.panic_on_inspect {
            panic!("mesh repair crashed");
        }
        Ok(ModelInfo {
            filename: model
                .path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            object_count: 1,
            triangle_count: 12,
            volume: self.volume,
            bounding_box: "[0, 0, 0] - [10, 10, 10]".into(),
            is_valid: true,
        })
    }

    fn slice_to_gcode(
        &mut self,
        _model: &ModelHandle,
        request: &SliceRequest,
    ) -> NativeResult<PathBuf> {
        self.recorder.enter(Call::Slice {
            input: request.input.clone(),
            output: request.output.clone(),
            overrides: request.overrides.clone(),
        });
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        std::thread::sleep(Duration::from_millis(1));
        self.recorder.leave();
        if let Some(err) = self.slice_failure.take() {
            return Err(err);
        }
        Ok(request.output.clone())
    }
}
