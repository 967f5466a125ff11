//! SQLite checkpoint store
//!
//! Keeps one row per job in a `job` table. Schema changes go through
//! `rusqlite_migration`, and every update is a single statement so a reader
//! never observes a half-written row.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite_migration::{M, Migrations};
use tracing::debug;

use crate::config::{ModuleConfig, OptionKind, OptionSpec};
use crate::error::{PersistenceError, Result};

use super::{CheckpointStore, JobId, Position, StoredJob};

const DATABASE: OptionSpec =
    OptionSpec::optional("database", OptionKind::Str).with_env("EXPORTERS_SQLITE_DATABASE");

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE job ( \
         id INTEGER PRIMARY KEY AUTOINCREMENT, \
         last_position TEXT NOT NULL, \
         type TEXT NOT NULL, \
         last_committed TEXT, \
         job_finished INTEGER NOT NULL DEFAULT 0, \
         configuration TEXT NOT NULL \
         )",
    )])
}

/// Default database location under the user data directory
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("exporters")
        .join("jobs.db")
}

/// Checkpoint store backed by a SQLite file
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteStore {
    /// Open or create the database and bring its schema up to date
    ///
    /// # Arguments
    /// * `path` - Database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;
        migrations().to_latest(&mut conn)?;
        debug!("Opened checkpoint database {}", path.display());

        Ok(Self { conn, path })
    }

    /// Build from the `persistence` section of the job configuration
    pub fn from_config(module: &ModuleConfig) -> Result<Self> {
        let path = module
            .options_for("persistence")
            .string(&DATABASE)?
            .map(PathBuf::from)
            .unwrap_or_else(default_database_path);
        Self::open(path)
    }

    fn row_id(job_id: &JobId) -> Result<i64> {
        job_id
            .as_str()
            .parse()
            .map_err(|_| PersistenceError::JobNotFound(job_id.to_string()).into())
    }

    fn expect_updated(job_id: &JobId, updated: usize) -> Result<()> {
        if updated == 0 {
            return Err(PersistenceError::JobNotFound(job_id.to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_job(&mut self, configuration: &str) -> Result<JobId> {
        let (tag, raw) = Position::None.encode()?;
        self.conn.execute(
            "INSERT INTO job (last_position, type, configuration) VALUES (?1, ?2, ?3)",
            params![raw, tag, configuration],
        )?;
        let id = JobId::new(self.conn.last_insert_rowid().to_string());
        debug!("Created job {} in {}", id, self.path.display());
        Ok(id)
    }

    async fn load_stored(&mut self, job_id: &JobId) -> Result<StoredJob> {
        let id = Self::row_id(job_id)?;
        let row = self
            .conn
            .query_row(
                "SELECT last_position, type, last_committed, job_finished, configuration \
                 FROM job WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let (position, position_type, last_committed, finished, configuration) =
            row.ok_or_else(|| PersistenceError::JobNotFound(job_id.to_string()))?;

        Ok(StoredJob {
            id: job_id.clone(),
            position_type,
            position,
            configuration,
            finished,
            last_committed: last_committed
                .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
                .map(|ts| ts.with_timezone(&Utc)),
        })
    }

    async fn commit_position(&mut self, job_id: &JobId, position: &Position) -> Result<()> {
        let id = Self::row_id(job_id)?;
        let (tag, raw) = position.encode()?;
        let updated = self.conn.execute(
            "UPDATE job SET last_position = ?1, type = ?2, last_committed = ?3 WHERE id = ?4",
            params![raw, tag, Utc::now().to_rfc3339(), id],
        )?;
        Self::expect_updated(job_id, updated)?;
        debug!("Committed position {} for job {}", position, job_id);
        Ok(())
    }

    async fn mark_finished(&mut self, job_id: &JobId) -> Result<()> {
        let id = Self::row_id(job_id)?;
        let updated = self.conn.execute(
            "UPDATE job SET job_finished = 1, last_committed = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Self::expect_updated(job_id, updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_migrations_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[tokio::test]
    async fn test_positions_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.db");

        let id = {
            let mut store = SqliteStore::open(&path).unwrap();
            let id = store.create_job("[reader]\nname = \"fs\"\n").await.unwrap();
            store
                .commit_position(&id, &Position::Cursor(json!({"$oid": "abc"})))
                .await
                .unwrap();
            id
        };

        let mut store = SqliteStore::open(&path).unwrap();
        let job = store.load_job(&id).await.unwrap();
        assert_eq!(job.last_position, Position::Cursor(json!({"$oid": "abc"})));
        assert_eq!(job.configuration, "[reader]\nname = \"fs\"\n");
        assert!(!job.finished);
        assert!(job.last_committed.is_some());

        store.mark_finished(&id).await.unwrap();
        assert!(store.load_job(&id).await.unwrap().finished);
    }

    #[tokio::test]
    async fn test_ids_are_sequential() {
        let dir = TempDir::new().unwrap();
        let mut store = SqliteStore::open(dir.path().join("jobs.db")).unwrap();
        let first = store.create_job("").await.unwrap();
        let second = store.create_job("").await.unwrap();
        assert_eq!(first.as_str(), "1");
        assert_eq!(second.as_str(), "2");
    }

    #[tokio::test]
    async fn test_corrupt_row_strict_and_lenient() {
        let dir = TempDir::new().unwrap();
        let mut store = SqliteStore::open(dir.path().join("jobs.db")).unwrap();
        let id = store.create_job("").await.unwrap();
        store
            .conn
            .execute(
                "UPDATE job SET type = 'int', last_position = 'NaN' WHERE id = 1",
                [],
            )
            .unwrap();

        assert!(store.get_last_position(&id, false).await.is_err());
        assert_eq!(
            store.get_last_position(&id, true).await.unwrap(),
            Position::None
        );
    }

    #[tokio::test]
    async fn test_missing_job() {
        let dir = TempDir::new().unwrap();
        let mut store = SqliteStore::open(dir.path().join("jobs.db")).unwrap();
        assert!(store.load_job(&JobId::new("9")).await.is_err());
        assert!(store.mark_finished(&JobId::new("9")).await.is_err());
        assert!(store.load_job(&JobId::new("abc")).await.is_err());
    }
}
