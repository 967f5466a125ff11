//! Optional record stages: filter, transform and grouper
//!
//! Stages run in that order between the reader and the writer. Filters drop
//! records, transforms derive new records and groupers assign the group key
//! that partitions output into separate units.

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{ModuleConfig, OptionKind, OptionSpec};
use crate::error::{ConfigError, Result};
use crate::record::{GroupKey, Record, plain_text};

const KEYS: OptionSpec = OptionSpec::required("keys", OptionKind::List);
const FIELDS: OptionSpec = OptionSpec::required("fields", OptionKind::List);

/// Decides which records continue down the pipeline
pub trait Filter: Send + Sync {
    fn keep(&self, record: &Record) -> bool;
}

/// Derives a new record from an existing one
pub trait Transform: Send + Sync {
    fn apply(&self, record: &Record) -> Result<Record>;
}

/// Assigns group keys
pub trait Grouper: Send + Sync {
    fn group(&self, record: Record) -> Record;
}

/// Look up a dotted path such as `address.country`
fn lookup<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Keeps records whose fields equal every configured value
///
/// ```toml
/// [filter]
/// name = "key_value"
/// options = { keys = [{ name = "country", value = "es" }] }
/// ```
#[derive(Debug, Clone)]
pub struct KeyValueFilter {
    conditions: Vec<(String, String)>,
}

impl KeyValueFilter {
    pub fn new(conditions: Vec<(String, String)>) -> Self {
        Self { conditions }
    }

    pub fn from_config(module: &ModuleConfig) -> Result<Self> {
        let tables = module
            .options_for("filter")
            .table_list(&KEYS)?
            .unwrap_or_default();

        let mut conditions = Vec::with_capacity(tables.len());
        for table in tables {
            let name = table.get("name").and_then(toml::Value::as_str);
            let value = table.get("value");
            match (name, value) {
                (Some(name), Some(value)) => {
                    let value = match value {
                        toml::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    conditions.push((name.to_string(), value));
                }
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: "filter.keys".to_string(),
                        value: toml::Value::Table(table).to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(Self::new(conditions))
    }
}

impl Filter for KeyValueFilter {
    fn keep(&self, record: &Record) -> bool {
        self.conditions.iter().all(|(name, value)| {
            lookup(record, name).is_some_and(|v| plain_text(Some(v)) == *value)
        })
    }
}

/// Keeps only the listed fields, in the listed order
#[derive(Debug, Clone)]
pub struct SelectFieldsTransform {
    fields: Vec<String>,
}

impl SelectFieldsTransform {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn from_config(module: &ModuleConfig) -> Result<Self> {
        Ok(Self::new(
            module
                .options_for("transform")
                .string_list(&FIELDS)?
                .unwrap_or_default(),
        ))
    }
}

impl Transform for SelectFieldsTransform {
    fn apply(&self, record: &Record) -> Result<Record> {
        let mut fields = Map::with_capacity(self.fields.len());
        for name in &self.fields {
            if let Some(value) = record.get(name) {
                fields.insert(name.clone(), value.clone());
            }
        }
        Ok(Record::new(fields).with_group_key(record.group_key().clone()))
    }
}

/// Groups records by the values of the listed fields
#[derive(Debug, Clone)]
pub struct FileKeyGrouper {
    keys: Vec<String>,
}

impl FileKeyGrouper {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }

    pub fn from_config(module: &ModuleConfig) -> Result<Self> {
        let keys = module
            .options_for("grouper")
            .string_list(&KEYS)?
            .unwrap_or_default();
        if keys.is_empty() {
            return Err(ConfigError::MissingField("grouper.keys".to_string()).into());
        }
        Ok(Self::new(keys))
    }
}

impl Grouper for FileKeyGrouper {
    fn group(&self, record: Record) -> Record {
        let key = GroupKey::new(self.keys.iter().map(|k| plain_text(lookup(&record, k))));
        record.with_group_key(key)
    }
}

/// The configured stages of one job
#[derive(Default)]
pub struct Stages {
    pub filter: Option<Box<dyn Filter>>,
    pub transform: Option<Box<dyn Transform>>,
    pub grouper: Option<Box<dyn Grouper>>,
}

impl Stages {
    /// Run filter, transform and grouper over a batch
    ///
    /// # Arguments
    /// * `records` - Batch in reader order
    ///
    /// # Returns
    /// * `Result<Vec<Record>>` - Surviving records, order preserved
    pub fn process(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        let total = records.len();
        let mut out = Vec::with_capacity(total);

        for record in records {
            if let Some(filter) = &self.filter {
                if !filter.keep(&record) {
                    continue;
                }
            }
            let record = match &self.transform {
                Some(transform) => transform.apply(&record)?,
                None => record,
            };
            let record = match &self.grouper {
                Some(grouper) => grouper.group(record),
                None => record,
            };
            out.push(record);
        }

        if out.len() != total {
            debug!("Filtered {} of {} records", total - out.len(), total);
        }
        Ok(out)
    }
}
