//! MongoDB reader: full collection scan ordered by `_id`
//!
//! Documents are converted to relaxed extended JSON. The position is the
//! last returned `_id`, and a resumed reader only asks for larger ids.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::{Client, Cursor};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{ModuleConfig, OptionDefault, OptionKind, OptionSpec};
use crate::error::{PersistenceError, Result};
use crate::persistence::Position;
use crate::record::Record;

use super::{DEFAULT_BATCH_SIZE, ReadBatch, Reader};

const URI: OptionSpec =
    OptionSpec::required("uri", OptionKind::Str).with_env("EXPORTERS_MONGODB_URI");
const DATABASE: OptionSpec = OptionSpec::required("database", OptionKind::Str);
const COLLECTION: OptionSpec = OptionSpec::required("collection", OptionKind::Str);
const BATCH_SIZE: OptionSpec = OptionSpec::optional("batch_size", OptionKind::Int)
    .with_default(OptionDefault::Int(DEFAULT_BATCH_SIZE));

/// Reader over one MongoDB collection
pub struct MongoReader {
    uri: String,
    database: String,
    collection: String,
    batch_size: u32,
    /// Exclusive lower bound on `_id`
    after: Option<Bson>,
    cursor: Option<Cursor<Document>>,
    last_id: Option<Value>,
    total_fetched: u64,
    finished: bool,
}

impl MongoReader {
    /// Build from the `reader` section of the job configuration
    ///
    /// # Arguments
    /// * `module` - Reader configuration
    /// * `resume_from` - `None` or a `Cursor` holding the last `_id`
    pub fn from_config(module: &ModuleConfig, resume_from: &Position) -> Result<Self> {
        let opts = module.options_for("reader");
        let batch_size = opts
            .positive(&BATCH_SIZE)?
            .unwrap_or(DEFAULT_BATCH_SIZE as u64)
            .min(u32::MAX as u64) as u32;

        let (after, last_id) = match resume_from {
            Position::None => (None, None),
            Position::Cursor(value) => {
                let bson = Bson::try_from(value.clone()).map_err(|e| {
                    PersistenceError::CorruptPosition {
                        tag: "cursor".to_string(),
                        raw: value.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                (Some(bson), Some(value.clone()))
            }
            other => {
                return Err(PersistenceError::CorruptPosition {
                    tag: other.type_tag().to_string(),
                    raw: other.to_string(),
                    reason: "mongodb reader resumes from an _id cursor".to_string(),
                }
                .into());
            }
        };

        Ok(Self {
            uri: opts.required_string(&URI)?,
            database: opts.required_string(&DATABASE)?,
            collection: opts.required_string(&COLLECTION)?,
            batch_size,
            after,
            cursor: None,
            last_id,
            total_fetched: 0,
            finished: false,
        })
    }

    fn filter(&self) -> Document {
        match &self.after {
            Some(id) => doc! { "_id": { "$gt": id.clone() } },
            None => doc! {},
        }
    }

    async fn cursor(&mut self) -> Result<&mut Cursor<Document>> {
        if self.cursor.is_none() {
            let client = Client::with_uri_str(&self.uri).await?;
            let collection = client
                .database(&self.database)
                .collection::<Document>(&self.collection);
            let cursor = collection
                .find(self.filter())
                .sort(doc! { "_id": 1 })
                .batch_size(self.batch_size)
                .await?;
            info!(
                "Reading {}.{} from {}",
                self.database,
                self.collection,
                self.after
                    .as_ref()
                    .map_or_else(|| "the start".to_string(), |id| format!("_id > {id}"))
            );
            self.cursor = Some(cursor);
        }
        self.cursor
            .as_mut()
            .ok_or_else(|| PersistenceError::InvalidUri(self.uri.clone()).into())
    }
}

#[async_trait]
impl Reader for MongoReader {
    fn name(&self) -> &str {
        "mongodb"
    }

    async fn next_batch(&mut self) -> Result<ReadBatch> {
        if self.finished {
            return Ok(ReadBatch {
                records: Vec::new(),
                finished: true,
            });
        }

        let limit = self.batch_size as usize;
        let mut documents = Vec::with_capacity(limit.min(1024));
        let cursor = self.cursor().await?;
        let mut exhausted = false;
        while documents.len() < limit {
            match cursor.try_next().await? {
                Some(document) => documents.push(document),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        let mut records = Vec::with_capacity(documents.len());
        for document in documents {
            if let Some(id) = document.get("_id") {
                self.last_id = Some(id.clone().into_relaxed_extjson());
            }
            records.push(Record::from_value(
                Bson::Document(document).into_relaxed_extjson(),
            )?);
        }

        self.total_fetched += records.len() as u64;
        if exhausted {
            self.cursor = None;
            self.finished = true;
            debug!("Collection exhausted after {} documents", self.total_fetched);
        }

        Ok(ReadBatch {
            records,
            finished: self.finished,
        })
    }

    fn last_position(&self) -> Position {
        self.last_id
            .clone()
            .map_or(Position::None, Position::Cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn module() -> ModuleConfig {
        ModuleConfig::new("mongodb")
            .with_option("uri", "mongodb://localhost:27017")
            .with_option("database", "shop")
            .with_option("collection", "orders")
            .with_option("batch_size", 50_i64)
    }

    #[test]
    fn test_fresh_reader_scans_everything() {
        let reader = MongoReader::from_config(&module(), &Position::None).unwrap();
        assert_eq!(reader.filter(), doc! {});
        assert_eq!(reader.batch_size, 50);
        assert_eq!(reader.last_position(), Position::None);
    }

    #[test]
    fn test_resume_filters_after_last_id() {
        let last = json!({"$oid": "65f1c0ffee00000000000001"});
        let reader =
            MongoReader::from_config(&module(), &Position::Cursor(last.clone())).unwrap();

        let filter = reader.filter();
        let bound = filter.get_document("_id").unwrap().get("$gt").unwrap();
        assert!(matches!(bound, Bson::ObjectId(_)));
        assert_eq!(reader.last_position(), Position::Cursor(last));
    }

    #[test]
    fn test_integer_ids_resume() {
        let reader =
            MongoReader::from_config(&module(), &Position::Cursor(json!(41))).unwrap();
        let filter = reader.filter();
        let bound = filter.get_document("_id").unwrap().get("$gt").unwrap();
        assert!(matches!(bound, Bson::Int32(41) | Bson::Int64(41)));
    }

    #[test]
    fn test_rejects_count_position() {
        assert!(MongoReader::from_config(&module(), &Position::Integer(3)).is_err());
    }
}
