//! MongoDB checkpoint store
//!
//! One document per job in a `jobs` collection, keyed by `_id`. Positions
//! are replaced with a single `update_one` so readers see either the old or
//! the new value.

use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{DateTime as BsonDateTime, Document, doc};
use mongodb::{Client, Collection};
use tracing::debug;

use crate::config::{ModuleConfig, OptionDefault, OptionKind, OptionSpec};
use crate::error::{PersistenceError, Result};

use super::{CheckpointStore, JobId, Position, StoredJob};

const URI: OptionSpec =
    OptionSpec::required("uri", OptionKind::Str).with_env("EXPORTERS_MONGODB_URI");
const DATABASE: OptionSpec = OptionSpec::required("database", OptionKind::Str);
const COLLECTION: OptionSpec =
    OptionSpec::optional("collection", OptionKind::Str).with_default(OptionDefault::Str("jobs"));

/// Checkpoint store backed by a MongoDB collection
///
/// The connection is opened on first use.
pub struct MongoStore {
    uri: String,
    database: String,
    collection_name: String,
    collection: Option<Collection<Document>>,
}

impl MongoStore {
    /// Create a new store
    ///
    /// # Arguments
    /// * `uri` - MongoDB connection string
    /// * `database` - Database holding the jobs collection
    /// * `collection` - Jobs collection name
    pub fn new(
        uri: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
            collection_name: collection.into(),
            collection: None,
        }
    }

    /// Build from the `persistence` section of the job configuration
    pub fn from_config(module: &ModuleConfig) -> Result<Self> {
        let opts = module.options_for("persistence");
        Ok(Self::new(
            opts.required_string(&URI)?,
            opts.required_string(&DATABASE)?,
            opts.required_string(&COLLECTION)?,
        ))
    }

    async fn collection(&mut self) -> Result<&Collection<Document>> {
        if self.collection.is_none() {
            let client = Client::with_uri_str(&self.uri).await?;
            debug!(
                "Connected checkpoint store to {}.{}",
                self.database, self.collection_name
            );
            self.collection = Some(
                client
                    .database(&self.database)
                    .collection::<Document>(&self.collection_name),
            );
        }
        self.collection
            .as_ref()
            .ok_or_else(|| PersistenceError::InvalidUri(self.uri.clone()).into())
    }

    fn object_id(job_id: &JobId) -> Result<ObjectId> {
        ObjectId::parse_str(job_id.as_str())
            .map_err(|_| PersistenceError::JobNotFound(job_id.to_string()).into())
    }

    async fn set_fields(&mut self, job_id: &JobId, fields: Document) -> Result<()> {
        let id = Self::object_id(job_id)?;
        let result = self
            .collection()
            .await?
            .update_one(doc! { "_id": id }, doc! { "$set": fields })
            .await?;
        if result.matched_count == 0 {
            return Err(PersistenceError::JobNotFound(job_id.to_string()).into());
        }
        Ok(())
    }
}

fn now() -> BsonDateTime {
    BsonDateTime::from_millis(Utc::now().timestamp_millis())
}

#[async_trait]
impl CheckpointStore for MongoStore {
    fn name(&self) -> &str {
        "mongodb"
    }

    async fn create_job(&mut self, configuration: &str) -> Result<JobId> {
        let (tag, raw) = Position::None.encode()?;
        let result = self
            .collection()
            .await?
            .insert_one(doc! {
                "last_position": raw,
                "type": tag,
                "job_finished": false,
                "configuration": configuration,
            })
            .await?;

        let id = result
            .inserted_id
            .as_object_id()
            .map(|oid| JobId::new(oid.to_hex()))
            .ok_or_else(|| PersistenceError::JobNotFound(result.inserted_id.to_string()))?;
        debug!("Created job {} in {}", id, self.database);
        Ok(id)
    }

    async fn load_stored(&mut self, job_id: &JobId) -> Result<StoredJob> {
        let id = Self::object_id(job_id)?;
        let document = self
            .collection()
            .await?
            .find_one(doc! { "_id": id })
            .await?
            .ok_or_else(|| PersistenceError::JobNotFound(job_id.to_string()))?;

        let text = |field: &str| document.get_str(field).unwrap_or_default().to_string();
        Ok(StoredJob {
            id: job_id.clone(),
            position_type: text("type"),
            position: text("last_position"),
            configuration: text("configuration"),
            finished: document.get_bool("job_finished").unwrap_or(false),
            last_committed: document
                .get_datetime("last_committed")
                .ok()
                .and_then(|ts| chrono::DateTime::from_timestamp_millis(ts.timestamp_millis())),
        })
    }

    async fn commit_position(&mut self, job_id: &JobId, position: &Position) -> Result<()> {
        let (tag, raw) = position.encode()?;
        self.set_fields(
            job_id,
            doc! { "last_position": raw, "type": tag, "last_committed": now() },
        )
        .await?;
        debug!("Committed position {} for job {}", position, job_id);
        Ok(())
    }

    async fn mark_finished(&mut self, job_id: &JobId) -> Result<()> {
        self.set_fields(job_id, doc! { "job_finished": true, "last_committed": now() })
            .await
    }
}
