//! Error handling for export jobs.
//!
//! This module provides the error taxonomy used throughout the pipeline:
//! - Configuration errors (fatal, except when they only disqualify the bypass)
//! - Transient transport errors, which the retry policy may retry
//! - Inconsistent-write errors from the post-delivery consistency check
//!
//! Reaching the items limit is not an error; see [`crate::writer::BatchOutcome`].
//!
//! # Example
//!
//! ```rust
//! use exporters::error::{ConfigError, ExportError, Result};
//!
//! fn require_filebase(value: Option<&str>) -> Result<String> {
//!     value
//!         .map(str::to_string)
//!         .ok_or_else(|| ConfigError::MissingField("writer.filebase".into()).into())
//! }
//!
//! assert!(matches!(require_filebase(None), Err(ExportError::Config(_))));
//! ```

pub mod kinds;

// Re-export commonly used types
pub use kinds::{
    ConfigError, ExportError, InconsistentWriteError, PersistenceError, Result, TransferError,
};
