//! Bypass optimizer
//!
//! Before any record is read, the job configuration is checked once for a
//! direct source to destination transfer. When every condition holds, the
//! general pipeline is skipped: source units are listed natively and copied
//! one by one, with no formatter or write buffer involved.
//!
//! Conditions, in order:
//! 0. `prevent_bypass` is not set
//! 1. a direct copy exists for the (reader, writer) pair
//! 2. no filter, transform or grouper is configured
//! 3. no items limit is set on the writer
//! 4. writer buffering parameters are at their defaults
//!
//! Progress is counted in units: after each copy the number of confirmed
//! units is committed, and a resumed run restarts at the first unconfirmed
//! unit.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ExportConfig, ModuleConfig, OptionKind, OptionSpec};
use crate::error::{ConfigError, PersistenceError, Result, TransferError};
use crate::persistence::{CheckpointStore, JobId, Position};
use crate::reader::fs::FsSource;
use crate::record::GroupKey;
use crate::registry::Registry;
use crate::retry::{RetryPolicy, with_retry};
use crate::writer::WriterOptions;
use crate::writer::fs::{render_filebase, split_filebase, validate_filebase};

const FILEBASE: OptionSpec = OptionSpec::required("filebase", OptionKind::Str);

/// One unit of the source, as listed natively
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Native location, e.g. a file path or object key
    pub location: String,
    /// Size in bytes when the listing provides it
    pub size: Option<u64>,
}

/// Lists source units lazily
#[async_trait]
pub trait Lister: Send + Sync {
    /// Units in a stable order
    async fn list_units(&self) -> Result<BoxStream<'_, Result<SourceUnit>>>;
}

/// Copies one unit straight to the destination
#[async_trait]
pub trait DirectCopier: Send + Sync {
    /// Copy a unit, overwriting any partial copy of it
    ///
    /// # Returns
    /// * `Result<u64>` - Bytes copied
    async fn copy(&self, unit: &SourceUnit) -> Result<u64>;
}

/// Reason the general pipeline must run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotEligible {
    pub reason: String,
}

impl NotEligible {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for NotEligible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bypass not eligible: {}", self.reason)
    }
}

/// Decide whether the job can run as a direct transfer
///
/// Pure: reads the configuration and the registry, nothing else.
pub fn meets_conditions(
    config: &ExportConfig,
    registry: &Registry,
) -> std::result::Result<(), NotEligible> {
    if config.exporter_options.prevent_bypass {
        return Err(NotEligible::new("prevent_bypass is set"));
    }

    let (source, destination) = (config.reader.name.as_str(), config.writer.name.as_str());
    let Some(pair_check) = registry.bypass_check(source, destination) else {
        return Err(NotEligible::new(format!(
            "no direct copy from {source} to {destination}"
        )));
    };

    if config.has_record_stages() {
        return Err(NotEligible::new("record stages are configured"));
    }

    let writer = WriterOptions::from_config(&config.writer)
        .map_err(|e| NotEligible::new(format!("writer options: {e}")))?;
    if writer.items_limit.is_some() {
        return Err(NotEligible::new("an items limit is set"));
    }
    if !writer.has_default_buffering() {
        return Err(NotEligible::new("buffering parameters are not the defaults"));
    }
    if !writer.has_plain_output() {
        return Err(NotEligible::new("compression or checksums are requested"));
    }

    pair_check(config).map_err(NotEligible::new)
}

/// Totals of one bypass run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BypassResult {
    pub units_copied: u64,
    pub units_skipped: u64,
    pub bytes_copied: u64,
    pub cancelled: bool,
}

/// Lister and copier for one (reader, writer) pair
pub struct BypassEngine {
    lister: Box<dyn Lister>,
    copier: Box<dyn DirectCopier>,
    retry: RetryPolicy,
}

impl BypassEngine {
    pub fn new(lister: Box<dyn Lister>, copier: Box<dyn DirectCopier>) -> Self {
        Self {
            lister,
            copier,
            retry: RetryPolicy::long(),
        }
    }

    /// Override the copy retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Copy every unit not yet confirmed, committing after each one
    ///
    /// # Arguments
    /// * `store` - Checkpoint store of the job
    /// * `job_id` - Job being run
    /// * `resume_from` - `None` or the count of confirmed units
    /// * `cancel` - Checked between units
    pub async fn run(
        &self,
        store: &mut dyn CheckpointStore,
        job_id: &JobId,
        resume_from: &Position,
        cancel: Option<&CancellationToken>,
    ) -> Result<BypassResult> {
        let confirmed = resume_from.as_count().ok_or_else(|| PersistenceError::CorruptPosition {
            tag: resume_from.type_tag().to_string(),
            raw: resume_from.to_string(),
            reason: "bypass resumes from a unit count".to_string(),
        })?;

        let lister = self.lister.as_ref();
        let mut units = with_retry(&self.retry, "list", move || lister.list_units()).await?;
        let mut result = BypassResult::default();
        let mut index = 0u64;

        while let Some(unit) = units.next().await {
            let unit = unit?;
            index += 1;
            if index <= confirmed {
                result.units_skipped += 1;
                continue;
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                info!("Bypass cancelled after {} units", index - 1);
                result.cancelled = true;
                return Ok(result);
            }

            let copier = self.copier.as_ref();
            let unit_ref = &unit;
            let bytes = with_retry(&self.retry, "copy", move || copier.copy(unit_ref)).await?;
            store
                .commit_position(job_id, &Position::Integer(index as i64))
                .await?;

            debug!("Copied unit {} ({} bytes)", unit.location, bytes);
            result.units_copied += 1;
            result.bytes_copied += bytes;
        }

        info!(
            "Bypass copied {} units ({} bytes), {} already confirmed",
            result.units_copied, result.bytes_copied, result.units_skipped
        );
        Ok(result)
    }
}

/// Lists the files of an `fs` reader
pub struct FsLister {
    source: FsSource,
}

impl FsLister {
    pub fn new(source: FsSource) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Lister for FsLister {
    async fn list_units(&self) -> Result<BoxStream<'_, Result<SourceUnit>>> {
        if !self.source.path.is_dir() {
            return Err(ConfigError::InvalidValue {
                field: "reader.path".to_string(),
                value: self.source.path.display().to_string(),
            }
            .into());
        }
        let files = self
            .source
            .list_files()
            .map_err(|e| {
                TransferError::ListFailed(format!("{}: {e}", self.source.path.display()))
            })?;
        let units = files.into_iter().map(|path| {
            let size = std::fs::metadata(&path).map(|m| m.len()).ok();
            Ok(SourceUnit {
                location: path.to_string_lossy().into_owned(),
                size,
            })
        });
        Ok(stream::iter(units).boxed())
    }
}

/// Copies files into an `fs` writer's filebase, keeping their names
pub struct FsCopier {
    filebase: String,
}

impl FsCopier {
    pub fn new(filebase: impl Into<String>) -> Result<Self> {
        let filebase = filebase.into();
        validate_filebase(&filebase)?;
        Ok(Self { filebase })
    }

    fn target(&self, unit: &SourceUnit) -> Result<PathBuf> {
        let (dir, prefix) = split_filebase(&render_filebase(&self.filebase, &GroupKey::empty())?);
        let name = PathBuf::from(&unit.location)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::CopyFailed(format!("not a file: {}", unit.location)))?;
        Ok(dir.join(format!("{prefix}{name}")))
    }
}

#[async_trait]
impl DirectCopier for FsCopier {
    async fn copy(&self, unit: &SourceUnit) -> Result<u64> {
        let target = self.target(unit)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = tokio::fs::copy(&unit.location, &target).await?;
        Ok(bytes)
    }
}

/// Build the (`fs`, `fs`) engine
pub fn fs_to_fs(config: &ExportConfig) -> Result<BypassEngine> {
    let source = FsSource::from_config(&config.reader)?;
    let filebase = config.writer.options_for("writer").required_string(&FILEBASE)?;
    Ok(BypassEngine::new(
        Box::new(FsLister::new(source)),
        Box::new(FsCopier::new(filebase)?),
    ))
}

/// Extra (`fs`, `fs`) condition: files are copied as-is, so the output
/// format must be the one the reader consumes
pub fn fs_to_fs_check(config: &ExportConfig) -> std::result::Result<(), String> {
    let formatter: &ModuleConfig = &config.exporter_options.formatter;
    let jsonlines = formatter
        .options
        .get("jsonlines")
        .and_then(toml::Value::as_bool)
        .unwrap_or(true);
    let pretty = formatter
        .options
        .get("pretty_print")
        .and_then(toml::Value::as_bool)
        .unwrap_or(false);

    if formatter.name != "json" || !jsonlines || pretty {
        return Err("the formatter is not plain JSON lines".to_string());
    }
    if formatter.options.keys().any(|k| k != "jsonlines" && k != "pretty_print") {
        return Err("the formatter has extra options".to_string());
    }
    Ok(())
}
