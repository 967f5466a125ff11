//! Checkpoint persistence for resumable jobs
//!
//! A job row holds the serialized configuration, the last confirmed
//! position and a finished flag. The position is only committed after the
//! output it covers was delivered, so resuming from it never loses data and
//! never repeats confirmed output.
//!
//! Positions are stored as a `(type_tag, raw_value)` pair and decoded by a
//! match on the tag.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::error::{PersistenceError, Result};

pub mod memory;
pub mod mongo;
pub mod sqlite;
pub mod uri;

pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use sqlite::SqliteStore;
pub use uri::{ResumeUri, resolve_job_from_uri};

/// Last confirmed read position of a job
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Position {
    /// Nothing confirmed yet
    #[default]
    None,
    /// Record or unit counter
    Integer(i64),
    /// Opaque token such as a file name
    Text(String),
    /// Structured cursor such as a last seen document id
    Cursor(Value),
}

impl Position {
    /// Tag persisted next to the raw value
    pub fn type_tag(&self) -> &'static str {
        match self {
            Position::None => "none",
            Position::Integer(_) => "int",
            Position::Text(_) => "str",
            Position::Cursor(_) => "cursor",
        }
    }

    /// Encode into `(type_tag, raw_value)`
    pub fn encode(&self) -> Result<(&'static str, String)> {
        let raw = match self {
            Position::None => String::new(),
            Position::Integer(i) => i.to_string(),
            Position::Text(s) => s.clone(),
            Position::Cursor(value) => serde_json::to_string(value)?,
        };
        Ok((self.type_tag(), raw))
    }

    /// Decode a stored `(type_tag, raw_value)` pair
    ///
    /// # Arguments
    /// * `tag` - Stored type tag
    /// * `raw` - Stored raw value
    ///
    /// # Returns
    /// * `Result<Position>` - The position, or an error for unknown tags and
    ///   values that do not parse as their tag says
    pub fn decode(tag: &str, raw: &str) -> Result<Self> {
        let corrupt = |reason: String| PersistenceError::CorruptPosition {
            tag: tag.to_string(),
            raw: raw.to_string(),
            reason,
        };

        match tag {
            "none" => Ok(Position::None),
            "int" => raw
                .trim()
                .parse::<i64>()
                .map(Position::Integer)
                .map_err(|e| corrupt(e.to_string()).into()),
            "str" => Ok(Position::Text(raw.to_string())),
            "cursor" => serde_json::from_str(raw)
                .map(Position::Cursor)
                .map_err(|e| corrupt(e.to_string()).into()),
            other => Err(PersistenceError::UnknownPositionType(other.to_string()).into()),
        }
    }

    /// Decode, optionally falling back to [`Position::None`] on failure
    pub fn decode_with_fallback(tag: &str, raw: &str, lenient: bool) -> Result<Self> {
        match Self::decode(tag, raw) {
            Err(e) if lenient => {
                warn!("Ignoring undecodable position ({e}), starting from the beginning");
                Ok(Position::None)
            }
            other => other,
        }
    }

    /// Integer value, `0` for [`Position::None`]
    pub fn as_count(&self) -> Option<u64> {
        match self {
            Position::None => Some(0),
            Position::Integer(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::None => write!(f, "none"),
            Position::Integer(i) => write!(f, "{i}"),
            Position::Text(s) => write!(f, "{s:?}"),
            Position::Cursor(value) => write!(f, "{value}"),
        }
    }
}

/// Identifier of a persisted job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Job row as stored, with the position still encoded
#[derive(Debug, Clone, PartialEq)]
pub struct StoredJob {
    pub id: JobId,
    pub position_type: String,
    pub position: String,
    pub configuration: String,
    pub finished: bool,
    pub last_committed: Option<DateTime<Utc>>,
}

/// Decoded job row
#[derive(Debug, Clone, PartialEq)]
pub struct JobCheckpoint {
    pub id: JobId,
    pub last_position: Position,
    /// Job configuration as TOML
    pub configuration: String,
    pub finished: bool,
    pub last_committed: Option<DateTime<Utc>>,
}

impl StoredJob {
    /// Row for a freshly created job
    pub fn new(id: JobId, configuration: &str) -> Self {
        Self {
            id,
            position_type: Position::None.type_tag().to_string(),
            position: String::new(),
            configuration: configuration.to_string(),
            finished: false,
            last_committed: None,
        }
    }

    /// Decode the position
    pub fn into_checkpoint(self, lenient: bool) -> Result<JobCheckpoint> {
        let last_position =
            Position::decode_with_fallback(&self.position_type, &self.position, lenient)?;
        Ok(JobCheckpoint {
            id: self.id,
            last_position,
            configuration: self.configuration,
            finished: self.finished,
            last_committed: self.last_committed,
        })
    }
}

/// Durable store of job checkpoints
///
/// One store instance serves one job run.
#[async_trait]
pub trait CheckpointStore: Send {
    /// Registry name of the backend
    fn name(&self) -> &str;

    /// Create a job row and return its id
    ///
    /// # Arguments
    /// * `configuration` - Job configuration serialized as TOML
    async fn create_job(&mut self, configuration: &str) -> Result<JobId>;

    /// Load a job row without decoding the position
    async fn load_stored(&mut self, job_id: &JobId) -> Result<StoredJob>;

    /// Replace the job's position and commit timestamp in one update
    async fn commit_position(&mut self, job_id: &JobId, position: &Position) -> Result<()>;

    /// Flag the job as finished
    async fn mark_finished(&mut self, job_id: &JobId) -> Result<()>;

    /// Load and decode a job row
    async fn load_job(&mut self, job_id: &JobId) -> Result<JobCheckpoint> {
        self.load_stored(job_id).await?.into_checkpoint(false)
    }

    /// Position to resume from
    ///
    /// # Arguments
    /// * `job_id` - Job to resume
    /// * `lenient` - Resume from the beginning instead of failing when the
    ///   stored position cannot be decoded
    async fn get_last_position(&mut self, job_id: &JobId, lenient: bool) -> Result<Position> {
        let stored = self.load_stored(job_id).await?;
        Position::decode_with_fallback(&stored.position_type, &stored.position, lenient)
    }
}
