//! Configuration management for export jobs
//!
//! This module handles loading and resolving job configuration:
//! - Job configuration files (TOML format)
//! - Per-module option declarations ([`OptionSpec`])
//! - Environment variable fallbacks for secrets and endpoints
//!
//! Option precedence (highest to lowest):
//! 1. Value in the module's `options` table
//! 2. Environment variable named by the declaration
//! 3. Declared default

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ConfigError, ExportError, Result};

/// Fully resolved configuration of one export job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportConfig {
    /// Job-wide options
    #[serde(default)]
    pub exporter_options: ExporterOptions,

    /// Source connector
    pub reader: ModuleConfig,

    /// Destination connector
    pub writer: ModuleConfig,

    /// Optional record filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ModuleConfig>,

    /// Optional record transform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<ModuleConfig>,

    /// Optional grouper assigning group keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouper: Option<ModuleConfig>,

    /// Checkpoint store (memory when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<ModuleConfig>,
}

/// Job-wide options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExporterOptions {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Resume an existing job instead of creating one
    #[serde(default)]
    pub resume: bool,

    /// Job to resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Never engage the bypass optimizer
    #[serde(default)]
    pub prevent_bypass: bool,

    /// Resume from the beginning when a stored position cannot be decoded,
    /// instead of failing the job
    #[serde(default)]
    pub lenient_position_decoding: bool,

    /// Export formatter
    #[serde(default = "default_formatter")]
    pub formatter: ModuleConfig,
}

/// Name of a registered module plus its raw options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig {
    /// Registry name, e.g. `fs` or `json`
    pub name: String,

    /// Raw options, resolved against the module's [`OptionSpec`]s
    #[serde(default)]
    pub options: toml::Table,
}

/// Log level options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Value type of a declared option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Str,
    Int,
    Bool,
    List,
}

/// Default value of a declared option
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionDefault {
    Str(&'static str),
    Int(i64),
    Bool(bool),
}

/// Declaration of a module option: type, required flag, default and
/// environment fallback
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub required: bool,
    pub default: Option<OptionDefault>,
    pub env_fallback: Option<&'static str>,
}

impl OptionSpec {
    /// Declare a required option
    pub const fn required(name: &'static str, kind: OptionKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
            env_fallback: None,
        }
    }

    /// Declare an optional option
    pub const fn optional(name: &'static str, kind: OptionKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: None,
            env_fallback: None,
        }
    }

    /// Attach a default value
    pub const fn with_default(mut self, default: OptionDefault) -> Self {
        self.default = Some(default);
        self
    }

    /// Attach an environment variable fallback
    pub const fn with_env(mut self, var: &'static str) -> Self {
        self.env_fallback = Some(var);
        self
    }
}

/// Resolved view over a module's options, used by module constructors
pub struct ModuleOptions<'a> {
    section: &'a str,
    module: &'a ModuleConfig,
}

// Default value functions
fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_formatter() -> ModuleConfig {
    ModuleConfig::new("json")
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            resume: false,
            job_id: None,
            prevent_bypass: false,
            lenient_position_decoding: false,
            formatter: default_formatter(),
        }
    }
}

impl ExportConfig {
    /// Create a configuration with the given reader and writer and
    /// defaults everywhere else
    pub fn new(reader: ModuleConfig, writer: ModuleConfig) -> Self {
        Self {
            exporter_options: ExporterOptions::default(),
            reader,
            writer,
            filter: None,
            transform: None,
            grouper: None,
            persistence: None,
        }
    }

    /// Load configuration from a file
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file (TOML format)
    ///
    /// # Returns
    /// * `Result<ExportConfig>` - Loaded and validated configuration or error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ExportError::Config(ConfigError::FileNotFound(path.display().to_string()))
            }
            _ => ExportError::Io(e),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ExportConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML text, as stored by the checkpoint store
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Validate the configuration
    ///
    /// # Returns
    /// * `Result<()>` - Ok if valid, error otherwise
    pub fn validate(&self) -> Result<()> {
        for (section, module) in [
            ("reader", &self.reader),
            ("writer", &self.writer),
            ("exporter_options.formatter", &self.exporter_options.formatter),
        ] {
            if module.name.trim().is_empty() {
                return Err(ConfigError::MissingField(format!("{section}.name")).into());
            }
        }

        if self.exporter_options.resume && self.exporter_options.job_id.is_none() {
            return Err(ConfigError::MissingField("exporter_options.job_id".to_string()).into());
        }

        Ok(())
    }

    /// Job id to resume, if this run is a resume
    pub fn resume_job_id(&self) -> Option<&str> {
        if self.exporter_options.resume {
            self.exporter_options.job_id.as_deref()
        } else {
            None
        }
    }

    /// Whether any of filter, transform or grouper is configured
    pub fn has_record_stages(&self) -> bool {
        self.filter.is_some() || self.transform.is_some() || self.grouper.is_some()
    }
}

impl ModuleConfig {
    /// Module with no options
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: toml::Table::new(),
        }
    }

    /// Builder-style option setter
    pub fn with_option(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// View this module's options under a section name used in error messages
    pub fn options_for<'a>(&'a self, section: &'a str) -> ModuleOptions<'a> {
        ModuleOptions {
            section,
            module: self,
        }
    }
}

impl<'a> ModuleOptions<'a> {
    fn field(&self, spec: &OptionSpec) -> String {
        format!("{}.{}", self.section, spec.name)
    }

    fn invalid(&self, spec: &OptionSpec, value: impl ToString) -> ConfigError {
        ConfigError::InvalidValue {
            field: self.field(spec),
            value: value.to_string(),
        }
    }

    /// Resolve an option: explicit value, then environment, then default
    ///
    /// # Returns
    /// * `Result<Option<toml::Value>>` - The value, `None` when optional and
    ///   unset, or an error when required and missing or of the wrong type
    pub fn value(&self, spec: &OptionSpec) -> Result<Option<toml::Value>> {
        if let Some(value) = self.module.options.get(spec.name) {
            return self.check_kind(spec, value.clone()).map(Some);
        }

        if let Some(var) = spec.env_fallback {
            if let Ok(raw) = std::env::var(var) {
                return self.parse_env(spec, &raw).map(Some);
            }
        }

        if let Some(default) = spec.default {
            return Ok(Some(match default {
                OptionDefault::Str(s) => toml::Value::String(s.to_string()),
                OptionDefault::Int(i) => toml::Value::Integer(i),
                OptionDefault::Bool(b) => toml::Value::Boolean(b),
            }));
        }

        if spec.required {
            return Err(ConfigError::MissingField(self.field(spec)).into());
        }

        Ok(None)
    }

    fn check_kind(&self, spec: &OptionSpec, value: toml::Value) -> Result<toml::Value> {
        let ok = matches!(
            (spec.kind, &value),
            (OptionKind::Str, toml::Value::String(_))
                | (OptionKind::Int, toml::Value::Integer(_))
                | (OptionKind::Bool, toml::Value::Boolean(_))
                | (OptionKind::List, toml::Value::Array(_))
        );
        if ok {
            Ok(value)
        } else {
            Err(self.invalid(spec, value).into())
        }
    }

    fn parse_env(&self, spec: &OptionSpec, raw: &str) -> Result<toml::Value> {
        let value = match spec.kind {
            OptionKind::Str => toml::Value::String(raw.to_string()),
            OptionKind::Int => raw
                .trim()
                .parse::<i64>()
                .map(toml::Value::Integer)
                .map_err(|_| self.invalid(spec, raw))?,
            OptionKind::Bool => match raw.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => toml::Value::Boolean(true),
                "0" | "false" | "no" => toml::Value::Boolean(false),
                _ => return Err(self.invalid(spec, raw).into()),
            },
            OptionKind::List => toml::Value::Array(
                raw.split(',')
                    .map(|s| toml::Value::String(s.trim().to_string()))
                    .collect(),
            ),
        };
        Ok(value)
    }

    /// Resolve a string option
    pub fn string(&self, spec: &OptionSpec) -> Result<Option<String>> {
        Ok(self.value(spec)?.and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Resolve an integer option
    pub fn integer(&self, spec: &OptionSpec) -> Result<Option<i64>> {
        Ok(self.value(spec)?.and_then(|v| v.as_integer()))
    }

    /// Resolve a non-negative integer option
    pub fn unsigned(&self, spec: &OptionSpec) -> Result<Option<u64>> {
        match self.integer(spec)? {
            Some(i) if i < 0 => Err(self.invalid(spec, i).into()),
            Some(i) => Ok(Some(i as u64)),
            None => Ok(None),
        }
    }

    /// Resolve a strictly positive integer option
    pub fn positive(&self, spec: &OptionSpec) -> Result<Option<u64>> {
        match self.unsigned(spec)? {
            Some(0) => Err(self.invalid(spec, 0).into()),
            other => Ok(other),
        }
    }

    /// Resolve a boolean option
    pub fn boolean(&self, spec: &OptionSpec) -> Result<Option<bool>> {
        Ok(self.value(spec)?.and_then(|v| v.as_bool()))
    }

    /// Resolve a list of strings
    pub fn string_list(&self, spec: &OptionSpec) -> Result<Option<Vec<String>>> {
        match self.value(spec)? {
            Some(toml::Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    toml::Value::String(s) => Ok(s),
                    other => Err(self.invalid(spec, other).into()),
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            _ => Ok(None),
        }
    }

    /// Resolve a list of tables
    pub fn table_list(&self, spec: &OptionSpec) -> Result<Option<Vec<toml::Table>>> {
        match self.value(spec)? {
            Some(toml::Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    toml::Value::Table(t) => Ok(t),
                    other => Err(self.invalid(spec, other).into()),
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            _ => Ok(None),
        }
    }

    /// Resolve a required string option
    pub fn required_string(&self, spec: &OptionSpec) -> Result<String> {
        self.string(spec)?
            .ok_or_else(|| ConfigError::MissingField(self.field(spec)).into())
    }
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[exporter_options]
log_level = "debug"

[exporter_options.formatter]
name = "json"
options = { jsonlines = true }

[reader]
name = "fs"
options = { path = "/data/in", batch_size = 100 }

[writer]
name = "fs"
options = { filebase = "/data/out/export_", check_consistency = true }

[grouper]
name = "file_key"
options = { keys = ["country"] }
"#;

    const FILEBASE: OptionSpec = OptionSpec::required("filebase", OptionKind::Str);
    const BATCH_SIZE: OptionSpec =
        OptionSpec::optional("batch_size", OptionKind::Int).with_default(OptionDefault::Int(10000));

    #[test]
    fn test_parse_sample() {
        let config = ExportConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.exporter_options.log_level, LogLevel::Debug);
        assert_eq!(config.reader.name, "fs");
        assert_eq!(config.writer.name, "fs");
        assert!(config.grouper.is_some());
        assert!(config.has_record_stages());
        assert!(config.persistence.is_none());
        assert_eq!(config.resume_job_id(), None);
    }

    #[test]
    fn test_default_formatter_is_json() {
        let config = ExportConfig::new(ModuleConfig::new("fs"), ModuleConfig::new("console"));
        assert_eq!(config.exporter_options.formatter.name, "json");
        assert!(!config.has_record_stages());
    }

    #[test]
    fn test_toml_round_trip_keeps_options() {
        let config = ExportConfig::from_toml_str(SAMPLE).unwrap();
        let text = config.to_toml_string().unwrap();
        let back = ExportConfig::from_toml_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_resume_requires_job_id() {
        let mut config = ExportConfig::new(ModuleConfig::new("fs"), ModuleConfig::new("fs"));
        config.exporter_options.resume = true;
        assert!(config.validate().is_err());

        config.exporter_options.job_id = Some("7".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.resume_job_id(), Some("7"));
    }

    #[test]
    fn test_missing_required_option_names_field() {
        let module = ModuleConfig::new("fs");
        let err = module.options_for("writer").required_string(&FILEBASE).unwrap_err();
        assert!(err.to_string().contains("writer.filebase"));
    }

    #[test]
    fn test_default_and_explicit_values() {
        let module = ModuleConfig::new("fs");
        let opts = module.options_for("reader");
        assert_eq!(opts.integer(&BATCH_SIZE).unwrap(), Some(10000));

        let module = ModuleConfig::new("fs").with_option("batch_size", 5_i64);
        assert_eq!(module.options_for("reader").integer(&BATCH_SIZE).unwrap(), Some(5));
    }

    #[test]
    fn test_wrong_type_is_invalid_value() {
        let module = ModuleConfig::new("fs").with_option("batch_size", "many");
        let err = module.options_for("reader").integer(&BATCH_SIZE).unwrap_err();
        assert!(matches!(
            err,
            ExportError::Config(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_env_fallback() {
        const URI: OptionSpec = OptionSpec::required("uri", OptionKind::Str)
            .with_env("EXPORTERS_TEST_CONFIG_URI");

        // SAFETY: the variable name is unique to this test
        unsafe { std::env::set_var("EXPORTERS_TEST_CONFIG_URI", "mongodb://db:27017") };
        let module = ModuleConfig::new("mongodb");
        assert_eq!(
            module.options_for("reader").required_string(&URI).unwrap(),
            "mongodb://db:27017"
        );

        let module = ModuleConfig::new("mongodb").with_option("uri", "mongodb://explicit");
        assert_eq!(
            module.options_for("reader").required_string(&URI).unwrap(),
            "mongodb://explicit"
        );
    }

    #[test]
    fn test_positive_rejects_zero() {
        const ITEMS: OptionSpec = OptionSpec::optional("items_per_buffer_write", OptionKind::Int);
        let module = ModuleConfig::new("fs").with_option("items_per_buffer_write", 0_i64);
        assert!(module.options_for("writer").positive(&ITEMS).is_err());
    }
}
