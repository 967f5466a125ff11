//! JSON export formatter
//!
//! Exports records either as JSON lines (one compact object per line, the
//! default) or as a JSON array per unit. `pretty_print` indents objects and
//! sorts their keys.

use serde_json::{Map, Value};

use crate::config::{ModuleConfig, OptionDefault, OptionKind, OptionSpec};
use crate::error::Result;
use crate::record::Record;

use super::ExportFormatter;

const PRETTY_PRINT: OptionSpec =
    OptionSpec::optional("pretty_print", OptionKind::Bool).with_default(OptionDefault::Bool(false));
const JSONLINES: OptionSpec =
    OptionSpec::optional("jsonlines", OptionKind::Bool).with_default(OptionDefault::Bool(true));

/// Formatter for JSON output
#[derive(Debug, Clone)]
pub struct JsonExportFormatter {
    /// Indent and sort keys
    pretty_print: bool,
    /// One object per line instead of an array per unit
    jsonlines: bool,
}

impl Default for JsonExportFormatter {
    fn default() -> Self {
        Self::new(false, true)
    }
}

impl JsonExportFormatter {
    /// Create a new JSON formatter
    ///
    /// # Arguments
    /// * `pretty_print` - Indent output and sort keys
    /// * `jsonlines` - Emit JSON lines instead of a JSON array
    pub fn new(pretty_print: bool, jsonlines: bool) -> Self {
        Self {
            pretty_print,
            jsonlines,
        }
    }

    /// Build from the `formatter` section of the job configuration
    pub fn from_config(module: &ModuleConfig) -> Result<Self> {
        let opts = module.options_for("exporter_options.formatter");
        Ok(Self::new(
            opts.boolean(&PRETTY_PRINT)?.unwrap_or(false),
            opts.boolean(&JSONLINES)?.unwrap_or(true),
        ))
    }
}

impl ExportFormatter for JsonExportFormatter {
    fn file_extension(&self) -> &str {
        if self.jsonlines { "jl" } else { "json" }
    }

    fn format(&self, record: &Record) -> Result<String> {
        if self.pretty_print {
            let sorted = sort_keys(&record.to_value());
            Ok(serde_json::to_string_pretty(&sorted)?)
        } else {
            Ok(serde_json::to_string(record.fields())?)
        }
    }

    fn format_header(&self) -> String {
        if self.jsonlines {
            String::new()
        } else {
            "[".to_string()
        }
    }

    fn item_separator(&self) -> &str {
        if self.jsonlines { "" } else { "," }
    }

    fn format_footer(&self) -> String {
        if self.jsonlines {
            String::new()
        } else {
            "]".to_string()
        }
    }
}

/// Recursively rebuild objects with keys in lexicographic order
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
