//! In-memory checkpoint store
//!
//! Nothing survives the process. Clones share the same jobs, which lets a
//! second run in the same process resume a first one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ExportError, PersistenceError, Result};

use super::{CheckpointStore, JobId, Position, StoredJob};

#[derive(Default)]
struct Jobs {
    next_id: u64,
    rows: HashMap<JobId, StoredJob>,
}

/// Checkpoint store backed by a shared map
#[derive(Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<Mutex<Jobs>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> Result<MutexGuard<'_, Jobs>> {
        self.jobs
            .lock()
            .map_err(|_| ExportError::Generic("memory store poisoned".to_string()))
    }

    fn update<F>(&self, job_id: &JobId, apply: F) -> Result<()>
    where
        F: FnOnce(&mut StoredJob),
    {
        let mut jobs = self.jobs()?;
        let row = jobs
            .rows
            .get_mut(job_id)
            .ok_or_else(|| PersistenceError::JobNotFound(job_id.to_string()))?;
        apply(row);
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_job(&mut self, configuration: &str) -> Result<JobId> {
        let mut jobs = self.jobs()?;
        jobs.next_id += 1;
        let id = JobId::new(jobs.next_id.to_string());
        jobs.rows
            .insert(id.clone(), StoredJob::new(id.clone(), configuration));
        Ok(id)
    }

    async fn load_stored(&mut self, job_id: &JobId) -> Result<StoredJob> {
        self.jobs()?
            .rows
            .get(job_id)
            .cloned()
            .ok_or_else(|| PersistenceError::JobNotFound(job_id.to_string()).into())
    }

    async fn commit_position(&mut self, job_id: &JobId, position: &Position) -> Result<()> {
        let (tag, raw) = position.encode()?;
        self.update(job_id, |row| {
            row.position_type = tag.to_string();
            row.position = raw;
            row.last_committed = Some(Utc::now());
        })
    }

    async fn mark_finished(&mut self, job_id: &JobId) -> Result<()> {
        self.update(job_id, |row| {
            row.finished = true;
            row.last_committed = Some(Utc::now());
        })
    }
}
