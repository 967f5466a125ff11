//! Exporters Library
//!
//! Resumable batch export pipeline: records are read in batches, optionally
//! filtered, transformed and grouped, formatted into spool files and
//! delivered to a destination. The read position is checkpointed after
//! every delivered batch so an interrupted job resumes without losing or
//! repeating confirmed output.
//!
//! # Modules
//!
//! - `buffer`: Spool files per group key with flush thresholds
//! - `bypass`: Direct unit copy when no per-record work is needed
//! - `cli`: Command-line interface and argument parsing
//! - `config`: Job configuration and declared module options
//! - `error`: Error types and handling
//! - `formatter`: Export formatters (JSON, CSV)
//! - `persistence`: Checkpoint stores and resume URIs
//! - `pipeline`: Export manager driving one job
//! - `reader`: Batch readers
//! - `record`: Records and group keys
//! - `registry`: Name to constructor maps for every module kind
//! - `retry`: Retry policy with exponential backoff
//! - `stages`: Filter, transform and grouper
//! - `writer`: Writer lifecycle and destinations
//!
//! # Example
//!
//! ```no_run
//! use exporters::{ExportConfig, ExportManager, Registry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ExportConfig::from_file("job.toml")?;
//!     let result = ExportManager::new(config, Registry::default()).run().await?;
//!     println!("Exported {} records", result.records_written);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod bypass;
pub mod cli;
pub mod config;
pub mod error;
pub mod formatter;
pub mod persistence;
pub mod pipeline;
pub mod reader;
pub mod record;
pub mod registry;
pub mod retry;
pub mod stages;
pub mod writer;

// Re-export commonly used types
pub use config::{ExportConfig, ModuleConfig};
pub use error::{ExportError, Result};
pub use persistence::{CheckpointStore, JobId, Position};
pub use pipeline::{ExportManager, ExportResult};
pub use record::{GroupKey, Record};
pub use registry::Registry;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version string
///
/// # Returns
/// * `&str` - Version string
pub fn version() -> &'static str {
    VERSION
}
