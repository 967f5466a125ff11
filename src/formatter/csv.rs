//! CSV export formatter
//!
//! Exports a fixed list of fields per record, with an optional title row at
//! the top of every unit and proper value escaping.

use crate::config::{ModuleConfig, OptionDefault, OptionKind, OptionSpec};
use crate::error::{ConfigError, Result};
use crate::record::{Record, plain_text};

use super::ExportFormatter;

const FIELDS: OptionSpec = OptionSpec::required("fields", OptionKind::List);
const SHOW_TITLES: OptionSpec =
    OptionSpec::optional("show_titles", OptionKind::Bool).with_default(OptionDefault::Bool(true));
const DELIMITER: OptionSpec =
    OptionSpec::optional("delimiter", OptionKind::Str).with_default(OptionDefault::Str(","));

/// Formatter for CSV output
#[derive(Debug, Clone)]
pub struct CsvExportFormatter {
    /// Column order
    fields: Vec<String>,
    /// Write a title row at the top of each unit
    show_titles: bool,
    /// Column delimiter
    delimiter: char,
}

impl CsvExportFormatter {
    /// Create a new CSV formatter
    ///
    /// # Arguments
    /// * `fields` - Fields to export, in column order
    /// * `show_titles` - Write a title row per unit
    /// * `delimiter` - Column delimiter
    pub fn new(fields: Vec<String>, show_titles: bool, delimiter: char) -> Self {
        Self {
            fields,
            show_titles,
            delimiter,
        }
    }

    /// Build from the `formatter` section of the job configuration
    pub fn from_config(module: &ModuleConfig) -> Result<Self> {
        let opts = module.options_for("exporter_options.formatter");
        let fields = opts.string_list(&FIELDS)?.unwrap_or_default();
        if fields.is_empty() {
            return Err(ConfigError::MissingField(
                "exporter_options.formatter.fields".to_string(),
            )
            .into());
        }

        let delimiter = opts.required_string(&DELIMITER)?;
        let mut chars = delimiter.chars();
        let delimiter = match (chars.next(), chars.next()) {
            (Some(c), None) => c,
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "exporter_options.formatter.delimiter".to_string(),
                    value: delimiter,
                }
                .into());
            }
        };

        Ok(Self::new(
            fields,
            opts.boolean(&SHOW_TITLES)?.unwrap_or(true),
            delimiter,
        ))
    }

    /// Escape a CSV value if necessary
    ///
    /// Values containing the delimiter, a quote or a newline are wrapped in
    /// quotes, with inner quotes doubled.
    fn escape(&self, value: &str) -> String {
        if value.contains(self.delimiter)
            || value.contains('"')
            || value.contains('\n')
            || value.contains('\r')
        {
            format!("\"{}\"", value.replace('"', "\"\""))
        } else {
            value.to_string()
        }
    }

    fn join(&self, cells: impl Iterator<Item = String>) -> String {
        cells
            .map(|cell| self.escape(&cell))
            .collect::<Vec<_>>()
            .join(&self.delimiter.to_string())
    }
}

impl ExportFormatter for CsvExportFormatter {
    fn file_extension(&self) -> &str {
        "csv"
    }

    fn format(&self, record: &Record) -> Result<String> {
        Ok(self.join(
            self.fields
                .iter()
                .map(|field| plain_text(record.get(field))),
        ))
    }

    fn format_header(&self) -> String {
        if self.show_titles {
            self.join(self.fields.iter().cloned())
        } else {
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn formatter() -> CsvExportFormatter {
        CsvExportFormatter::new(vec!["key1".into(), "key2".into()], true, ',')
    }

    #[test]
    fn test_format_row_in_field_order() {
        let record = Record::from_value(json!({"key2": "value21", "key1": "value11"})).unwrap();
        assert_eq!(formatter().format(&record).unwrap(), "value11,value21");
    }

    #[test]
    fn test_missing_fields_are_empty() {
        let record = Record::from_value(json!({"key1": 5})).unwrap();
        assert_eq!(formatter().format(&record).unwrap(), "5,");
    }

    #[test]
    fn test_escaping() {
        let record =
            Record::from_value(json!({"key1": "a,b", "key2": "say \"hi\""})).unwrap();
        assert_eq!(
            formatter().format(&record).unwrap(),
            "\"a,b\",\"say \"\"hi\"\"\""
        );
    }

    #[test]
    fn test_titles() {
        assert_eq!(formatter().format_header(), "key1,key2");
        let untitled = CsvExportFormatter::new(vec!["key1".into()], false, ',');
        assert_eq!(untitled.format_header(), "");
    }

    #[test]
    fn test_from_config_requires_fields() {
        let module = ModuleConfig::new("csv");
        assert!(CsvExportFormatter::from_config(&module).is_err());

        let module = ModuleConfig::new("csv")
            .with_option("fields", vec!["a", "b"])
            .with_option("delimiter", ";");
        let formatter = CsvExportFormatter::from_config(&module).unwrap();
        let record = Record::from_value(json!({"a": "x;y", "b": 1})).unwrap();
        assert_eq!(formatter.format(&record).unwrap(), "\"x;y\";1");
    }
}
