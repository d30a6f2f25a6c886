#![warn(missing_docs)]

//! Async orchestration for the OrcaSlicer slicing engine.
//!
//! The engine is blocking, stateful, and not safe for concurrent use. This
//! crate puts it behind a single worker thread fed by a bounded FIFO queue,
//! manages its init/shutdown lifecycle, and maps native failures onto a
//! stable error taxonomy.
//!
//! # Example
//!
//! ```ignore
//! use orca_slicer::{CliEngine, SliceParams, Slicer, SlicerConfig};
//!
//! async fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SlicerConfig::load("orca.toml")?.apply_env()?;
//!     let slicer = Slicer::new(CliEngine::default(), config)?;
//!
//!     let info = slicer.model_info("cube.3mf").await?;
//!     println!("Triangles: {}", info.triangle_count);
//!
//!     let params = SliceParams::new("cube.3mf")
//!         .plate(1)
//!         .option("layer_height", 0.2)
//!         .option("enable_support", true);
//!     let result = slicer.slice(params).await?;
//!     println!("G-code: {}", result.output.display());
//!     Ok(())
//! }
//! ```

pub mod cli_engine;
pub mod config;
pub mod error;
pub mod handle;
pub mod model;
pub mod native;
pub mod queue;
pub mod slicer;

#[cfg(test)]
mod testing;

pub use cli_engine::CliEngine;
pub use config::{ConfigError, InitOptions, SlicerConfig};
pub use error::{map_native, EngineError, Result};
pub use handle::{EngineHandle, EngineState};
pub use model::{ModelInfo, OptionValue, SliceParams, SliceRequest, SliceResult};
pub use native::{ModelHandle, NativeEngine, NativeError, NativeResult, PresetKind};
pub use queue::{OperationId, OperationKind, Pending, WorkQueue};
pub use slicer::Slicer;
