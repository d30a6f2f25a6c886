//! Slicer configuration.
//!
//! Loaded from TOML, then adjusted from the environment:
//!
//! ```toml
//! queue_capacity = 16
//! auto_initialize = true
//! timeout_secs = 600
//! output_extension = "gcode"
//!
//! [init]
//! resources_path = "/opt/OrcaSlicer/resources"
//! verbose = false
//! vendors = ["BBL"]
//! printer_profiles = ["Bambu Lab X1 Carbon 0.4 nozzle"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::native::PresetKind;

/// Environment variable overriding `init.resources_path`.
pub const ENV_RESOURCES: &str = "ORCACLI_RESOURCES";
/// Environment variable overriding `queue_capacity`.
pub const ENV_QUEUE_CAPACITY: &str = "ORCA_QUEUE_CAPACITY";
/// Environment variable overriding `timeout_secs`.
pub const ENV_TIMEOUT_SECS: &str = "ORCA_TIMEOUT_SECS";
/// Environment variable overriding `init.verbose`.
pub const ENV_VERBOSE: &str = "ORCA_VERBOSE";

/// Errors from loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading the config file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML document is malformed.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment variable holds an unusable value.
    #[error("invalid value for {name}: {value}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },

    /// A setting is out of range.
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Engine initialization options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitOptions {
    /// Profile and resource search root.
    pub resources_path: Option<PathBuf>,
    /// Diagnostic logging.
    pub verbose: bool,
    /// Use only explicitly loaded presets. On by default.
    pub strict: bool,
    /// Vendor bundles to load after initialization.
    #[serde(alias = "presets")]
    pub vendors: Vec<String>,
    /// Printer profiles to load after initialization.
    pub printer_profiles: Vec<String>,
    /// Filament profiles to load after initialization.
    pub filament_profiles: Vec<String>,
    /// Process profiles to load after initialization.
    pub process_profiles: Vec<String>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            resources_path: None,
            verbose: false,
            strict: true,
            vendors: Vec::new(),
            printer_profiles: Vec::new(),
            filament_profiles: Vec::new(),
            process_profiles: Vec::new(),
        }
    }
}

impl InitOptions {
    /// Options with only a resources path.
    pub fn with_resources(path: impl Into<PathBuf>) -> Self {
        Self {
            resources_path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Presets to load, in load order: vendors, printers, filaments, processes.
    pub fn presets(&self) -> impl Iterator<Item = (PresetKind, &str)> + '_ {
        [
            (PresetKind::Vendor, &self.vendors),
            (PresetKind::Printer, &self.printer_profiles),
            (PresetKind::Filament, &self.filament_profiles),
            (PresetKind::Process, &self.process_profiles),
        ]
        .into_iter()
        .flat_map(|(kind, names)| names.iter().map(move |name| (kind, name.as_str())))
    }
}

/// Slicer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicerConfig {
    /// Maximum number of operations queued or executing.
    pub queue_capacity: usize,
    /// Initialize lazily on the first operation that needs the engine.
    pub auto_initialize: bool,
    /// Give up waiting on an operation after this many seconds.
    pub timeout_secs: Option<u64>,
    /// Extension of derived output paths.
    pub output_extension: String,
    /// Options used by lazy initialization.
    pub init: InitOptions,
}

impl Default for SlicerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            auto_initialize: true,
            timeout_secs: None,
            output_extension: "gcode".into(),
            init: InitOptions::default(),
        }
    }
}

impl SlicerConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: SlicerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(path) = var(ENV_RESOURCES).filter(|v| !v.is_empty()) {
            self.init.resources_path = Some(PathBuf::from(path));
        }
        if let Some(value) = var(ENV_QUEUE_CAPACITY) {
            self.queue_capacity = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_QUEUE_CAPACITY,
                value: value.clone(),
            })?;
        }
        if let Some(value) = var(ENV_TIMEOUT_SECS) {
            let secs: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_TIMEOUT_SECS,
                value: value.clone(),
            })?;
            self.timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(value) = var(ENV_VERBOSE) {
            self.init.verbose = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        name: ENV_VERBOSE,
                        value,
                    })
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    /// Check settings for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid("timeout_secs must be positive".into()));
        }
        let ext = self.output_extension.trim_start_matches('.');
        if ext.is_empty() || ext.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "output_extension '{}' is not a file extension",
                self.output_extension
            )));
        }
        Ok(())
    }

    /// Operation timeout, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Output extension without a leading dot.
    pub fn output_extension(&self) -> &str {
        self.output_extension.trim_start_matches('.')
    }
}
