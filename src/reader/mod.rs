//! Source readers
//!
//! A reader yields records in batches and reports the position just after
//! the last record it returned. Readers are built with the position to
//! resume from, so a resumed job continues exactly where the last commit
//! left off.

use async_trait::async_trait;

use crate::error::Result;
use crate::persistence::Position;
use crate::record::Record;

pub mod fs;
pub mod mongo;

pub use fs::FsReader;
pub use mongo::MongoReader;

/// Default number of records per batch
pub const DEFAULT_BATCH_SIZE: i64 = 10_000;

/// One batch read from the source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadBatch {
    pub records: Vec<Record>,
    /// The source is exhausted
    pub finished: bool,
}

/// Trait for reading records from a source store in batches
#[async_trait]
pub trait Reader: Send {
    /// Registry name of the reader
    fn name(&self) -> &str;

    /// Fetch the next batch
    ///
    /// # Returns
    /// * `Result<ReadBatch>` - Records in source order and whether the
    ///   source is exhausted
    async fn next_batch(&mut self) -> Result<ReadBatch>;

    /// Position just after the last returned record
    fn last_position(&self) -> Position;
}
