//! Operation inputs and results.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::native::NativeError;

/// Model file extensions the engine can load.
pub const SUPPORTED_MODEL_EXTENSIONS: &[&str] = &["3mf", "stl", "obj"];

/// Snapshot of a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Model file name.
    pub filename: String,
    /// Number of objects.
    pub object_count: u32,
    /// Number of triangles across all objects.
    pub triangle_count: u32,
    /// Volume (mm³).
    pub volume: f64,
    /// Bounding box extent as reported by the engine.
    pub bounding_box: String,
    /// Whether the engine considers the model printable.
    pub is_valid: bool,
}

impl ModelInfo {
    /// Reject snapshots the engine could not legitimately have produced.
    pub(crate) fn check(&self) -> std::result::Result<(), NativeError> {
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(NativeError::malformed(format!(
                "model volume {} is not a non-negative number",
                self.volume
            )));
        }
        Ok(())
    }
}

/// A slicing option value. Coerced to a string before reaching the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// Boolean, sent as `1` or `0`.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Free text.
    Text(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(true) => f.write_str("1"),
            OptionValue::Bool(false) => f.write_str("0"),
            OptionValue::Int(v) => write!(f, "{v}"),
            OptionValue::Float(v) => write!(f, "{v}"),
            OptionValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Int(v.into())
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

/// Parameters of a slice request, as supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SliceParams {
    /// Input model (.3mf, .stl or .obj).
    pub input: PathBuf,
    /// Output file. Defaults to the input path with the output extension.
    pub output: Option<PathBuf>,
    /// Plate to slice (1-based). Defaults to 1.
    pub plate: Option<u32>,
    /// Printer profile name.
    pub printer_profile: Option<String>,
    /// Filament profile name.
    pub filament_profile: Option<String>,
    /// Process profile name.
    pub process_profile: Option<String>,
    /// Log this operation at info level and ask the engine for diagnostics.
    pub verbose: bool,
    /// Validate without writing output.
    pub dry_run: bool,
    /// Config overrides. Wins over `custom` on key collision.
    pub options: BTreeMap<String, OptionValue>,
    /// Legacy string-only overrides.
    pub custom: BTreeMap<String, String>,
}

impl SliceParams {
    /// Parameters for slicing `input` with defaults everywhere else.
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    /// Parse a camelCase JSON parameter object.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::InvalidInput(e.to_string()))
    }

    /// Set the output path.
    pub fn output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Set the plate index (1-based).
    pub fn plate(mut self, plate: u32) -> Self {
        self.plate = Some(plate);
        self
    }

    /// Set the printer profile.
    pub fn printer_profile(mut self, name: impl Into<String>) -> Self {
        self.printer_profile = Some(name.into());
        self
    }

    /// Set the filament profile.
    pub fn filament_profile(mut self, name: impl Into<String>) -> Self {
        self.filament_profile = Some(name.into());
        self
    }

    /// Set the process profile.
    pub fn process_profile(mut self, name: impl Into<String>) -> Self {
        self.process_profile = Some(name.into());
        self
    }

    /// Add a typed override.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Add a legacy string override.
    pub fn custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Enable or disable dry-run mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Enable or disable verbose diagnostics.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Validate and normalize into a request the engine can execute.
    ///
    /// Checks run against the filesystem at call time.
    pub fn into_request(self, output_extension: &str) -> Result<SliceRequest> {
        if self.input.as_os_str().is_empty() {
            return Err(EngineError::InvalidInput("input is required".into()));
        }
        check_model_path(&self.input)?;

        let plate = self.plate.unwrap_or(1);
        if plate < 1 {
            return Err(EngineError::InvalidInput(format!(
                "plate must be 1 or greater, got {plate}"
            )));
        }

        let output = match self.output {
            Some(output) if !output.as_os_str().is_empty() => output,
            _ => default_output(&self.input, output_extension),
        };
        if output == self.input {
            return Err(EngineError::InvalidInput(format!(
                "output would overwrite input {}",
                self.input.display()
            )));
        }

        let overrides = merge_overrides(&self.options, &self.custom)?;

        Ok(SliceRequest {
            input: self.input,
            output,
            plate,
            printer_profile: non_empty(self.printer_profile),
            filament_profile: non_empty(self.filament_profile),
            process_profile: non_empty(self.process_profile),
            verbose: self.verbose,
            dry_run: self.dry_run,
            overrides,
        })
    }
}

/// A validated slice request as handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceRequest {
    /// Input model.
    pub input: PathBuf,
    /// Output file.
    pub output: PathBuf,
    /// Plate index (1-based).
    pub plate: u32,
    /// Printer profile name.
    pub printer_profile: Option<String>,
    /// Filament profile name.
    pub filament_profile: Option<String>,
    /// Process profile name.
    pub process_profile: Option<String>,
    /// Verbose diagnostics.
    pub verbose: bool,
    /// Validate without writing output.
    pub dry_run: bool,
    /// Merged config overrides, string-coerced.
    pub overrides: BTreeMap<String, String>,
}

/// Outcome of a successful slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceResult {
    /// File written by the engine.
    pub output: PathBuf,
}

/// Merge typed options over legacy custom overrides.
pub fn merge_overrides(
    options: &BTreeMap<String, OptionValue>,
    custom: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut merged = custom.clone();
    for (key, value) in options {
        merged.insert(key.clone(), value.to_string());
    }
    if merged.keys().any(|k| k.trim().is_empty()) {
        return Err(EngineError::InvalidInput("option keys must not be empty".into()));
    }
    Ok(merged)
}

/// Output path next to `input`, with the extension replaced.
pub fn default_output(input: &Path, extension: &str) -> PathBuf {
    input.with_extension(extension)
}

/// Check that `path` names an existing model file of a supported format.
pub(crate) fn check_model_path(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(EngineError::FileNotFound(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(EngineError::InvalidInput(format!(
            "{} is not a file",
            path.display()
        )));
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !SUPPORTED_MODEL_EXTENSIONS.contains(&extension.as_str()) {
        return Err(EngineError::InvalidInput(format!(
            "unsupported model format '{}' (expected one of: {})",
            extension,
            SUPPORTED_MODEL_EXTENSIONS.join(", ")
        )));
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
