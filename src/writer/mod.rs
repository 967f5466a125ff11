//! Writer lifecycle and destination connectors
//!
//! This module provides the part of the pipeline every destination shares:
//! formatting records into the write buffer, delivering flushed spool files
//! through a [`Destination`], enforcing the items limit, running the
//! post-write consistency check and delivering the optional checksum unit.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::buffer::{
    Compression, DEFAULT_ITEMS_PER_BUFFER_WRITE, DEFAULT_SIZE_PER_BUFFER_WRITE, SpoolFile,
    WriteBuffer,
};
use crate::config::{ModuleConfig, OptionDefault, OptionKind, OptionSpec};
use crate::error::{InconsistentWriteError, Result};
use crate::formatter::ExportFormatter;
use crate::record::{GroupKey, Record};
use crate::retry::{RetryPolicy, with_retry};

pub mod console;
pub mod fs;

pub use console::ConsoleDestination;
pub use fs::FsDestination;

const ITEMS_PER_BUFFER_WRITE: OptionSpec = OptionSpec::optional(
    "items_per_buffer_write",
    OptionKind::Int,
)
.with_default(OptionDefault::Int(DEFAULT_ITEMS_PER_BUFFER_WRITE as i64));
const SIZE_PER_BUFFER_WRITE: OptionSpec = OptionSpec::optional(
    "size_per_buffer_write",
    OptionKind::Int,
)
.with_default(OptionDefault::Int(DEFAULT_SIZE_PER_BUFFER_WRITE as i64));
const ITEMS_LIMIT: OptionSpec =
    OptionSpec::optional("items_limit", OptionKind::Int).with_default(OptionDefault::Int(0));
const CHECK_CONSISTENCY: OptionSpec = OptionSpec::optional("check_consistency", OptionKind::Bool)
    .with_default(OptionDefault::Bool(false));
const COMPRESSION: OptionSpec =
    OptionSpec::optional("compression", OptionKind::Str).with_default(OptionDefault::Str("none"));
const GENERATE_MD5: OptionSpec = OptionSpec::optional("generate_md5", OptionKind::Bool)
    .with_default(OptionDefault::Bool(false));

/// Name of the checksum unit delivered when `generate_md5` is set
pub const MD5_FILE_NAME: &str = "md5checksum.md5";

/// Trait for delivering spool files to a destination store
#[async_trait]
pub trait Destination: Send + Sync {
    /// Registry name of the destination
    fn name(&self) -> &str;

    /// Retry profile used for deliveries
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::short()
    }

    /// Deliver a spool file
    ///
    /// Must be safe to call again after a failed attempt.
    ///
    /// # Arguments
    /// * `path` - Local spool file
    /// * `group_key` - Group the file belongs to
    ///
    /// # Returns
    /// * `Result<String>` - Destination unit id
    async fn write(&self, path: &Path, group_key: &GroupKey) -> Result<String>;

    /// Deliver a file under a fixed name, outside the group layout
    ///
    /// Used for the checksum unit. Destinations without named units
    /// deliver it like an ungrouped spool file.
    async fn write_named(&self, path: &Path, file_name: &str) -> Result<String> {
        debug!("Delivering {} as an ungrouped unit", file_name);
        self.write(path, &GroupKey::empty()).await
    }

    /// Actual size of a delivered unit, `None` when it does not exist
    async fn unit_size(&self, unit: &str) -> Result<Option<u64>>;
}

/// Writer options shared by every destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterOptions {
    pub items_per_buffer_write: u64,
    pub size_per_buffer_write: u64,
    /// Maximum records accepted, `None` for unlimited
    pub items_limit: Option<u64>,
    pub check_consistency: bool,
    pub compression: Compression,
    /// Deliver a checksum unit listing every delivered unit
    pub generate_md5: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            items_per_buffer_write: DEFAULT_ITEMS_PER_BUFFER_WRITE,
            size_per_buffer_write: DEFAULT_SIZE_PER_BUFFER_WRITE,
            items_limit: None,
            check_consistency: false,
            compression: Compression::None,
            generate_md5: false,
        }
    }
}

impl WriterOptions {
    /// Resolve from the `writer` section of the job configuration
    pub fn from_config(module: &ModuleConfig) -> Result<Self> {
        let opts = module.options_for("writer");
        Ok(Self {
            items_per_buffer_write: opts
                .positive(&ITEMS_PER_BUFFER_WRITE)?
                .unwrap_or(DEFAULT_ITEMS_PER_BUFFER_WRITE),
            size_per_buffer_write: opts
                .positive(&SIZE_PER_BUFFER_WRITE)?
                .unwrap_or(DEFAULT_SIZE_PER_BUFFER_WRITE),
            items_limit: opts.unsigned(&ITEMS_LIMIT)?.filter(|limit| *limit > 0),
            check_consistency: opts.boolean(&CHECK_CONSISTENCY)?.unwrap_or(false),
            compression: match opts.string(&COMPRESSION)? {
                Some(value) => Compression::parse(&value)?,
                None => Compression::None,
            },
            generate_md5: opts.boolean(&GENERATE_MD5)?.unwrap_or(false),
        })
    }

    /// Whether both buffering thresholds are at their defaults
    pub fn has_default_buffering(&self) -> bool {
        self.items_per_buffer_write == DEFAULT_ITEMS_PER_BUFFER_WRITE
            && self.size_per_buffer_write == DEFAULT_SIZE_PER_BUFFER_WRITE
    }

    /// Whether delivered units are byte copies of the formatted output
    pub fn has_plain_output(&self) -> bool {
        self.compression == Compression::None && !self.generate_md5
    }
}

/// One confirmed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub unit: String,
    pub size: u64,
    pub record_count: u64,
    /// Hex MD5 of the delivered bytes, kept when `generate_md5` is set
    pub md5: Option<String>,
}

/// Counters owned by one writer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterState {
    /// Records accepted into the buffer
    pub items_count: u64,
    /// Spool files delivered
    pub files_written: u64,
    /// Deliveries in order, checked by the consistency check
    pub deliveries: Vec<DeliveryRecord>,
    /// Unit id of the delivered checksum file
    pub checksum_unit: Option<String>,
}

/// Result of one `write_batch` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Records accepted from the batch
    pub accepted: u64,
    /// The items limit was reached; no further records will be accepted
    pub limit_reached: bool,
}

/// Drives formatting, buffering and delivery for one job
pub struct WriterLifecycle {
    destination: Box<dyn Destination>,
    formatter: Box<dyn ExportFormatter>,
    buffer: WriteBuffer,
    options: WriterOptions,
    retry: RetryPolicy,
    state: WriterState,
}

impl WriterLifecycle {
    /// Create a new writer lifecycle
    ///
    /// # Arguments
    /// * `destination` - Connector receiving spool files
    /// * `formatter` - Formatter for records and spool framing
    /// * `options` - Buffering, limit and consistency options
    pub fn new(
        destination: Box<dyn Destination>,
        formatter: Box<dyn ExportFormatter>,
        options: WriterOptions,
    ) -> Result<Self> {
        let buffer = WriteBuffer::new(
            options.items_per_buffer_write,
            options.size_per_buffer_write,
            formatter.framing(),
            formatter.file_extension(),
        )?
        .with_compression(options.compression);
        let retry = destination.retry_policy();

        Ok(Self {
            destination,
            formatter,
            buffer,
            options,
            retry,
            state: WriterState::default(),
        })
    }

    /// Override the delivery retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> &WriterState {
        &self.state
    }

    /// Whether the items limit has been reached
    pub fn limit_reached(&self) -> bool {
        self.options
            .items_limit
            .is_some_and(|limit| self.state.items_count >= limit)
    }

    /// Format and buffer a batch, delivering every buffer that fills up
    ///
    /// Stops accepting records once the items limit is reached.
    ///
    /// # Arguments
    /// * `records` - Records in reader order
    ///
    /// # Returns
    /// * `Result<BatchOutcome>` - Accepted count and limit flag
    pub async fn write_batch(&mut self, records: &[Record]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        for record in records {
            if self.limit_reached() {
                break;
            }

            let fragment = self.formatter.format(record)?;
            let key = record.group_key();
            self.buffer.append(key, &fragment, 1)?;
            self.state.items_count += 1;
            outcome.accepted += 1;

            if self.buffer.should_flush(key) {
                if let Some(file) = self.buffer.flush(key)? {
                    self.deliver(file).await?;
                }
            }
        }

        outcome.limit_reached = self.limit_reached();
        if outcome.limit_reached {
            info!(
                "Items limit reached ({} records), stopping",
                self.state.items_count
            );
        }
        Ok(outcome)
    }

    /// Deliver a closed spool file and register the delivery
    async fn deliver(&mut self, file: SpoolFile) -> Result<()> {
        let destination = self.destination.as_ref();
        let path = file.path.as_path();
        let key = &file.group_key;
        let unit = with_retry(&self.retry, "write", move || destination.write(path, key)).await?;

        let md5 = if self.options.generate_md5 {
            Some(format!("{:x}", md5::compute(std::fs::read(path)?)))
        } else {
            None
        };
        let metadata = self.buffer.metadata_for(&file.path);
        let delivery = DeliveryRecord {
            unit,
            size: metadata.map_or(file.size, |m| m.size),
            record_count: metadata.map_or(file.record_count, |m| m.record_count),
            md5,
        };
        debug!(
            "Delivered {} records ({} bytes) to {}",
            delivery.record_count, delivery.size, delivery.unit
        );

        self.buffer.release(&file.path)?;
        self.state.files_written += 1;
        self.state.deliveries.push(delivery);
        Ok(())
    }

    /// Force-deliver every buffer holding records
    pub async fn flush(&mut self) -> Result<()> {
        for file in self.buffer.flush_all()? {
            self.deliver(file).await?;
        }
        Ok(())
    }

    /// Deliver remaining buffers, run the consistency check if enabled and
    /// deliver the checksum unit if requested
    ///
    /// Calling this again against an unchanged destination gives the same
    /// result.
    pub async fn finish_writing(&mut self) -> Result<()> {
        self.flush().await?;

        if self.options.check_consistency {
            self.check_consistency().await?;
        }
        if self.options.generate_md5 && self.state.checksum_unit.is_none() {
            self.deliver_checksums().await?;
        }
        Ok(())
    }

    /// Compare every delivered unit's actual size with the recorded size
    async fn check_consistency(&self) -> Result<()> {
        let destination = self.destination.as_ref();
        for delivery in &self.state.deliveries {
            let unit = delivery.unit.as_str();
            let actual =
                with_retry(&self.retry, "unit_size", move || destination.unit_size(unit)).await?;
            match actual {
                None => {
                    return Err(InconsistentWriteError::Missing {
                        unit: delivery.unit.clone(),
                    }
                    .into());
                }
                Some(actual) if actual != delivery.size => {
                    return Err(InconsistentWriteError::SizeMismatch {
                        unit: delivery.unit.clone(),
                        expected: delivery.size,
                        actual,
                    }
                    .into());
                }
                Some(_) => {}
            }
        }

        info!(
            "Consistency check passed for {} units on {}",
            self.state.deliveries.len(),
            self.destination.name()
        );
        Ok(())
    }

    /// Write `<md5>  <unit name>` for every delivery and deliver the list
    async fn deliver_checksums(&mut self) -> Result<()> {
        let mut content = String::new();
        for delivery in &self.state.deliveries {
            let Some(md5) = &delivery.md5 else {
                continue;
            };
            let name = Path::new(&delivery.unit)
                .file_name()
                .map_or_else(|| delivery.unit.clone(), |n| n.to_string_lossy().into_owned());
            content.push_str(&format!("{md5}  {name}\n"));
        }

        let path = self.buffer.dir()?.join(MD5_FILE_NAME);
        std::fs::write(&path, content)?;

        let destination = self.destination.as_ref();
        let spool = path.as_path();
        let unit = with_retry(&self.retry, "write", move || {
            destination.write_named(spool, MD5_FILE_NAME)
        })
        .await?;
        std::fs::remove_file(&path)?;

        info!("Delivered checksums of {} units to {}", self.state.deliveries.len(), unit);
        self.state.files_written += 1;
        self.state.checksum_unit = Some(unit);
        Ok(())
    }

    /// Release the write buffer and its spool directory
    ///
    /// Records still buffered are discarded.
    pub fn close(&mut self) -> Result<()> {
        if self.buffer.has_pending() {
            warn!(
                "Discarding buffered records not delivered to {}",
                self.destination.name()
            );
        }
        self.buffer.close()
    }
}
