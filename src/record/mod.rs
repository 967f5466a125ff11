//! Records flowing through the export pipeline
//!
//! A [`Record`] is an ordered field mapping plus a [`GroupKey`]. Readers
//! produce records, stages derive new ones, and formatters only read them.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::{ExportError, Result};

/// Ordered tuple of values partitioning records into separate outputs.
///
/// The empty key `()` is the default: everything lands in one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(Vec<String>);

impl GroupKey {
    /// The empty key `()`
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Key from ordered values
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    /// Key values in order
    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Values with every non-word character replaced by `_`, safe to use
    /// as path segments.
    pub fn path_segments(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|value| {
                value
                    .chars()
                    .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
                    .collect()
            })
            .collect()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// Minimal data entity: ordered fields plus a group key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Map<String, Value>,
    group_key: GroupKey,
}

impl Record {
    /// Record in the default group
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            group_key: GroupKey::empty(),
        }
    }

    /// Build a record from a JSON value, which must be an object
    ///
    /// # Arguments
    /// * `value` - JSON object
    ///
    /// # Returns
    /// * `Result<Record>` - Record in the default group, or a format error
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self::new(fields)),
            other => Err(ExportError::Format(format!(
                "expected a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Same fields, different group
    pub fn with_group_key(self, group_key: GroupKey) -> Self {
        Self {
            fields: self.fields,
            group_key,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn group_key(&self) -> &GroupKey {
        &self.group_key
    }

    /// Field values as a JSON object
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Consume the record, keeping only its fields
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Render a field value the way it appears in paths, group keys and CSV
/// cells: strings verbatim, null empty, everything else as JSON.
pub fn plain_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
