//! Export manager
//!
//! Runs one job end to end. The bypass optimizer is evaluated once before any
//! record is read; when it does not engage, records flow through
//!
//! ```text
//! Reader -> Filter -> Transform -> Grouper -> WriterLifecycle -> Destination
//! ```
//!
//! and the reader position is committed after every batch has been
//! delivered in full. A batch cut short by the items limit leaves the
//! previous checkpoint in place. Cancellation is only observed between
//! batches.

mod progress;

pub use progress::ProgressTracker;

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bypass;
use crate::config::ExportConfig;
use crate::error::{PersistenceError, Result};
use crate::persistence::{CheckpointStore, JobId, Position};
use crate::reader::{ReadBatch, Reader};
use crate::registry::Registry;
use crate::stages::Stages;
use crate::writer::{WriterLifecycle, WriterOptions};

/// Result of an export job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportResult {
    pub job_id: JobId,
    /// Records returned by the reader in this run
    pub records_read: u64,
    /// Records accepted by the writer in this run
    pub records_written: u64,
    /// Units delivered, or copied when bypassed
    pub files_delivered: u64,
    /// The bypass optimizer handled the job
    pub bypassed: bool,
    pub limit_reached: bool,
    /// Stopped by the cancellation token; the job can be resumed
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl ExportResult {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            records_read: 0,
            records_written: 0,
            files_delivered: 0,
            bypassed: false,
            limit_reached: false,
            cancelled: false,
            elapsed_ms: 0,
        }
    }
}

/// Drives one export job
pub struct ExportManager {
    config: ExportConfig,
    registry: Registry,
    /// Store to use instead of the configured one
    store: Option<Box<dyn CheckpointStore>>,
    cancel_token: Option<CancellationToken>,
    show_progress: bool,
}

impl ExportManager {
    /// Create a new export manager
    ///
    /// # Arguments
    /// * `config` - Job configuration
    /// * `registry` - Modules available to the job
    pub fn new(config: ExportConfig, registry: Registry) -> Self {
        Self {
            config,
            registry,
            store: None,
            cancel_token: None,
            show_progress: false,
        }
    }

    /// Use this checkpoint store instead of the configured one
    pub fn with_store(mut self, store: Box<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set cancellation token for this job
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Run the job
    ///
    /// 1. Resolve the job (create it, or load its last position on resume)
    /// 2. Run the bypass engine if the configuration is eligible
    /// 3. Otherwise read, process, write and commit batch by batch
    /// 4. Finish writing, mark the job finished and close the writer
    ///
    /// On error the writer is closed and the checkpoint is left at the last
    /// confirmed batch.
    ///
    /// # Returns
    /// * `Result<ExportResult>` - Job statistics or error
    pub async fn run(&mut self) -> Result<ExportResult> {
        let start_time = Instant::now();
        self.registry.validate(&self.config)?;

        let mut store = match self.store.take() {
            Some(store) => store,
            None => self.registry.store(self.config.persistence.as_ref())?,
        };
        let (job_id, resume_from) = self.resolve_job(store.as_mut()).await?;

        let mut result = match bypass::meets_conditions(&self.config, &self.registry) {
            Ok(()) => self.run_bypass(store.as_mut(), job_id, &resume_from).await?,
            Err(reason) => {
                warn!("Bypass not engaged: {}", reason);
                self.run_pipeline(store.as_mut(), job_id, &resume_from).await?
            }
        };

        result.elapsed_ms = start_time.elapsed().as_millis() as u64;
        info!(
            "Job {} {}: {} records read, {} written, {} units, {} ms",
            result.job_id,
            if result.cancelled { "interrupted" } else { "completed" },
            result.records_read,
            result.records_written,
            result.files_delivered,
            result.elapsed_ms
        );
        Ok(result)
    }

    async fn resolve_job(&self, store: &mut dyn CheckpointStore) -> Result<(JobId, Position)> {
        match self.config.resume_job_id() {
            Some(id) => {
                let job_id = JobId::new(id);
                let lenient = self.config.exporter_options.lenient_position_decoding;
                let stored = store.load_stored(&job_id).await?;
                if stored.finished {
                    return Err(PersistenceError::JobFinished(job_id.to_string()).into());
                }
                let position = store.get_last_position(&job_id, lenient).await?;
                info!("Resuming job {} from position {}", job_id, position);
                Ok((job_id, position))
            }
            None => {
                let job_id = store.create_job(&self.config.to_toml_string()?).await?;
                info!("Created job {} in {} store", job_id, store.name());
                Ok((job_id, Position::None))
            }
        }
    }

    async fn run_bypass(
        &self,
        store: &mut dyn CheckpointStore,
        job_id: JobId,
        resume_from: &Position,
    ) -> Result<ExportResult> {
        info!(
            "Bypass engaged: copying units from {} to {} directly",
            self.config.reader.name, self.config.writer.name
        );
        let engine = self.registry.bypass(&self.config)?;
        let tracker = ProgressTracker::new(None, "units", self.show_progress);
        let outcome = engine
            .run(store, &job_id, resume_from, self.cancel_token.as_ref())
            .await;
        if let Ok(ref outcome) = outcome {
            tracker.update(outcome.units_copied);
        }
        tracker.finish();
        let outcome = outcome?;

        if !outcome.cancelled {
            store.mark_finished(&job_id).await?;
        }

        let mut result = ExportResult::new(job_id);
        result.files_delivered = outcome.units_copied;
        result.bypassed = true;
        result.cancelled = outcome.cancelled;
        Ok(result)
    }

    async fn run_pipeline(
        &self,
        store: &mut dyn CheckpointStore,
        job_id: JobId,
        resume_from: &Position,
    ) -> Result<ExportResult> {
        let mut reader = self.registry.reader(&self.config.reader, resume_from)?;
        let stages = self.registry.stages(&self.config)?;
        let mut writer = WriterLifecycle::new(
            self.registry.destination(&self.config.writer)?,
            self.registry.formatter(&self.config.exporter_options.formatter)?,
            WriterOptions::from_config(&self.config.writer)?,
        )?;
        let tracker = ProgressTracker::new(None, "records", self.show_progress);
        let mut result = ExportResult::new(job_id);

        let outcome = self
            .drive(reader.as_mut(), &stages, &mut writer, store, &mut result, &tracker)
            .await;
        tracker.finish();

        match outcome {
            Ok(()) => {
                writer.close()?;
                result.files_delivered = writer.state().files_written;
                Ok(result)
            }
            Err(e) => {
                if let Err(close_error) = writer.close() {
                    warn!("Failed to close writer after error: {}", close_error);
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        reader: &mut dyn Reader,
        stages: &Stages,
        writer: &mut WriterLifecycle,
        store: &mut dyn CheckpointStore,
        result: &mut ExportResult,
        tracker: &ProgressTracker,
    ) -> Result<()> {
        info!(
            "Exporting from {} to {}",
            reader.name(),
            self.config.writer.name
        );
        let mut batch_count = 0u64;

        loop {
            if self.is_cancelled() {
                info!("Job {} cancelled after {} batches", result.job_id, batch_count);
                result.cancelled = true;
                return Ok(());
            }

            let ReadBatch { records, finished } = reader.next_batch().await?;
            result.records_read += records.len() as u64;

            let records = stages.process(records)?;
            let outcome = writer.write_batch(&records).await?;
            writer.flush().await?;

            batch_count += 1;
            result.records_written += outcome.accepted;
            tracker.update(result.records_written);

            // records refused by the items limit stay behind the checkpoint
            if outcome.accepted < records.len() as u64 {
                debug!(
                    "Batch #{} cut short by the items limit, keeping the last checkpoint",
                    batch_count
                );
            } else {
                store
                    .commit_position(&result.job_id, &reader.last_position())
                    .await?;
                debug!(
                    "Batch #{} committed at {}",
                    batch_count,
                    reader.last_position()
                );
            }

            if outcome.limit_reached {
                result.limit_reached = true;
                break;
            }
            if finished {
                break;
            }
        }

        writer.finish_writing().await?;
        store.mark_finished(&result.job_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;
    use crate::error::{ExportError, TransferError};
    use crate::persistence::MemoryStore;
    use crate::record::GroupKey;
    use crate::retry::RetryPolicy;
    use crate::writer::{Destination, FsDestination};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    /// Filesystem destination whose writes fail after `healthy_writes`
    struct FailingDestination {
        inner: FsDestination,
        healthy_writes: u32,
        writes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Destination for FailingDestination {
        fn name(&self) -> &str {
            "failing"
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::none()
        }

        async fn write(&self, path: &Path, group_key: &GroupKey) -> Result<String> {
            if self.writes.fetch_add(1, Ordering::SeqCst) >= self.healthy_writes {
                return Err(TransferError::WriteFailed("connection reset".into()).into());
            }
            self.inner.write(path, group_key).await
        }

        async fn unit_size(&self, unit: &str) -> Result<Option<u64>> {
            self.inner.unit_size(unit).await
        }
    }

    fn input(records: &[Value]) -> TempDir {
        let dir = TempDir::new().unwrap();
        let lines: Vec<String> = records.iter().map(Value::to_string).collect();
        std::fs::write(dir.path().join("part-0.jl"), lines.join("\n") + "\n").unwrap();
        dir
    }

    fn numbered(n: i64) -> Vec<Value> {
        (1..=n)
            .map(|i| {
                let country = if i % 2 == 0 { "es" } else { "fr" };
                json!({"id": i, "country": country})
            })
            .collect()
    }

    fn config(input: &TempDir, output: &TempDir, batch_size: i64) -> ExportConfig {
        ExportConfig::new(
            ModuleConfig::new("fs")
                .with_option("path", input.path().display().to_string())
                .with_option("batch_size", batch_size),
            ModuleConfig::new("fs")
                .with_option("filebase", format!("{}/export_", output.path().display())),
        )
    }

    /// Every `.jl` line under `dir`, files in name order
    fn output_lines(dir: &Path) -> Vec<Value> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        files.sort();
        files
            .iter()
            .flat_map(|f| {
                std::fs::read_to_string(f)
                    .unwrap()
                    .lines()
                    .map(|l| serde_json::from_str(l).unwrap())
                    .collect::<Vec<Value>>()
            })
            .collect()
    }

    fn ids(values: &[Value]) -> Vec<i64> {
        values.iter().map(|v| v["id"].as_i64().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_general_pipeline_end_to_end() {
        let source = input(&numbered(5));
        let output = TempDir::new().unwrap();
        let mut config = config(&source, &output, 2);
        config.exporter_options.prevent_bypass = true;
        let store = MemoryStore::new();

        let result = ExportManager::new(config, Registry::default())
            .with_store(Box::new(store.clone()))
            .run()
            .await
            .unwrap();

        assert!(!result.bypassed);
        assert!(!result.cancelled);
        assert_eq!(result.records_read, 5);
        assert_eq!(result.records_written, 5);
        assert_eq!(result.files_delivered, 3);
        assert_eq!(ids(&output_lines(output.path())), [1, 2, 3, 4, 5]);

        let job = store.clone().load_job(&result.job_id).await.unwrap();
        assert!(job.finished);
        assert_eq!(job.last_position, Position::Integer(5));
        let stored = ExportConfig::from_toml_str(&job.configuration).unwrap();
        assert!(stored.exporter_options.prevent_bypass);
    }

    #[tokio::test]
    async fn test_resume_skips_confirmed_records() {
        let source = input(&numbered(6));
        let output = TempDir::new().unwrap();
        let mut config = config(&source, &output, 2);
        config.exporter_options.prevent_bypass = true;

        let mut store = MemoryStore::new();
        let job_id = store.create_job(&config.to_toml_string().unwrap()).await.unwrap();
        store
            .commit_position(&job_id, &Position::Integer(4))
            .await
            .unwrap();

        config.exporter_options.resume = true;
        config.exporter_options.job_id = Some(job_id.to_string());
        let result = ExportManager::new(config, Registry::default())
            .with_store(Box::new(store.clone()))
            .run()
            .await
            .unwrap();

        assert_eq!(result.job_id, job_id);
        assert_eq!(result.records_written, 2);
        assert_eq!(ids(&output_lines(output.path())), [5, 6]);
        let job = store.load_job(&job_id).await.unwrap();
        assert_eq!(job.last_position, Position::Integer(6));
        assert!(job.finished);
    }

    #[tokio::test]
    async fn test_resume_unknown_job_fails() {
        let source = input(&numbered(1));
        let output = TempDir::new().unwrap();
        let mut config = config(&source, &output, 2);
        config.exporter_options.resume = true;
        config.exporter_options.job_id = Some("99".to_string());

        let result = ExportManager::new(config, Registry::default()).run().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bypass_copies_files() {
        let source = input(&numbered(3));
        let output = TempDir::new().unwrap();
        let config = config(&source, &output, 2);
        let store = MemoryStore::new();

        let result = ExportManager::new(config, Registry::default())
            .with_store(Box::new(store.clone()))
            .run()
            .await
            .unwrap();

        assert!(result.bypassed);
        assert_eq!(result.files_delivered, 1);
        assert_eq!(result.records_read, 0);
        let copied = std::fs::read_to_string(output.path().join("export_part-0.jl")).unwrap();
        let original = std::fs::read_to_string(source.path().join("part-0.jl")).unwrap();
        assert_eq!(copied, original);

        let job = store.clone().load_job(&result.job_id).await.unwrap();
        assert!(job.finished);
        assert_eq!(job.last_position, Position::Integer(1));
    }

    #[tokio::test]
    async fn test_grouper_uses_general_pipeline() {
        let source = input(&numbered(4));
        let output = TempDir::new().unwrap();
        let mut config = config(&source, &output, 10);
        config.writer = ModuleConfig::new("fs").with_option(
            "filebase",
            format!("{}/{{groups[0]}}/part_", output.path().display()),
        );
        config.grouper = Some(ModuleConfig::new("file_key").with_option("keys", vec!["country"]));

        let result = ExportManager::new(config, Registry::default())
            .run()
            .await
            .unwrap();

        assert!(!result.bypassed);
        assert_eq!(result.files_delivered, 2);
        assert_eq!(ids(&output_lines(&output.path().join("es"))), [2, 4]);
        assert_eq!(ids(&output_lines(&output.path().join("fr"))), [1, 3]);
    }

    #[tokio::test]
    async fn test_items_limit_stops_early() {
        let source = input(&numbered(10));
        let output = TempDir::new().unwrap();
        let mut config = config(&source, &output, 3);
        config.writer = config.writer.with_option("items_limit", 5_i64);
        let store = MemoryStore::new();

        let result = ExportManager::new(config, Registry::default())
            .with_store(Box::new(store.clone()))
            .run()
            .await
            .unwrap();

        assert!(!result.bypassed);
        assert!(result.limit_reached);
        assert_eq!(result.records_written, 5);
        assert_eq!(result.records_read, 6);
        assert_eq!(ids(&output_lines(output.path())), [1, 2, 3, 4, 5]);
        let job = store.clone().load_job(&result.job_id).await.unwrap();
        assert!(job.finished);
    }

    #[tokio::test]
    async fn test_items_limit_keeps_checkpoint_of_delivered_records() {
        let source = input(&numbered(10));
        let output = TempDir::new().unwrap();
        let mut config = config(&source, &output, 3);
        config.writer = config.writer.with_option("items_limit", 5_i64);
        let store = MemoryStore::new();

        let result = assert_ok!(
            ExportManager::new(config.clone(), Registry::default())
                .with_store(Box::new(store.clone()))
                .run()
                .await
        );
        assert_eq!(result.records_written, 5);

        // record 6 was read but refused, so only the first full batch counts
        let job = store.clone().load_job(&result.job_id).await.unwrap();
        assert_eq!(job.last_position, Position::Integer(3));
        assert!(job.finished);

        config.exporter_options.resume = true;
        config.exporter_options.job_id = Some(result.job_id.to_string());
        let err = assert_err!(
            ExportManager::new(config, Registry::default())
                .with_store(Box::new(store.clone()))
                .run()
                .await
        );
        assert!(matches!(
            err,
            ExportError::Persistence(PersistenceError::JobFinished(_))
        ));
        assert_eq!(ids(&output_lines(output.path())), [1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_items_limit_on_batch_boundary_commits() {
        let source = input(&numbered(10));
        let output = TempDir::new().unwrap();
        let mut config = config(&source, &output, 3);
        config.writer = config.writer.with_option("items_limit", 6_i64);
        let store = MemoryStore::new();

        let result = assert_ok!(
            ExportManager::new(config, Registry::default())
                .with_store(Box::new(store.clone()))
                .run()
                .await
        );
        assert!(result.limit_reached);
        let job = store.clone().load_job(&result.job_id).await.unwrap();
        assert_eq!(job.last_position, Position::Integer(6));
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_last_checkpoint() {
        let source = input(&numbered(4));
        let output = TempDir::new().unwrap();
        let mut config = config(&source, &output, 2);
        config.exporter_options.prevent_bypass = true;
        config.writer = ModuleConfig::new("failing")
            .with_option("filebase", format!("{}/export_", output.path().display()));

        let writes = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::default();
        let counter = writes.clone();
        registry.register_destination("failing", move |module| {
            Ok(Box::new(FailingDestination {
                inner: FsDestination::from_config(module)?,
                healthy_writes: 1,
                writes: counter.clone(),
            }))
        });
        let store = MemoryStore::new();

        let err = assert_err!(
            ExportManager::new(config, registry)
                .with_store(Box::new(store.clone()))
                .run()
                .await
        );
        assert!(matches!(err, ExportError::Transfer(_)));
        assert_eq!(writes.load(Ordering::SeqCst), 2);

        let job = store.clone().load_job(&JobId::new("1")).await.unwrap();
        assert_eq!(job.last_position, Position::Integer(2));
        assert!(!job.finished);
        assert_eq!(ids(&output_lines(output.path())), [1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let source = input(&numbered(3));
        let output = TempDir::new().unwrap();
        let mut config = config(&source, &output, 2);
        config.exporter_options.prevent_bypass = true;
        let store = MemoryStore::new();
        let token = CancellationToken::new();
        token.cancel();

        let result = ExportManager::new(config, Registry::default())
            .with_store(Box::new(store.clone()))
            .with_cancellation(token)
            .run()
            .await
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.records_written, 0);
        let job = store.clone().load_job(&result.job_id).await.unwrap();
        assert!(!job.finished);
        assert_eq!(job.last_position, Position::None);
    }

    #[tokio::test]
    async fn test_consistency_check_passes_on_fs() {
        let source = input(&numbered(3));
        let output = TempDir::new().unwrap();
        let mut config = config(&source, &output, 2);
        config.writer = config.writer.with_option("check_consistency", true);
        config.exporter_options.prevent_bypass = true;

        let result = ExportManager::new(config, Registry::default())
            .run()
            .await
            .unwrap();
        assert!(!result.bypassed);
        assert_eq!(result.files_delivered, 2);
    }

    #[tokio::test]
    async fn test_unknown_module_fails_before_job_creation() {
        let source = input(&numbered(1));
        let output = TempDir::new().unwrap();
        let mut config = config(&source, &output, 2);
        config.exporter_options.formatter = ModuleConfig::new("xml");
        let store = MemoryStore::new();

        let result = ExportManager::new(config, Registry::default())
            .with_store(Box::new(store.clone()))
            .run()
            .await;
        assert!(matches!(result, Err(ExportError::Config(_))));
        assert!(store.clone().load_job(&JobId::new("1")).await.is_err());
    }
}
