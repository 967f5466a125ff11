//! Module registry
//!
//! Maps configuration names to constructors for every pluggable kind.
//! Lookups fail with [`ConfigError::UnknownModule`] instead of guessing.
//!
//! Built-ins:
//!
//! | Kind        | Names                        |
//! |-------------|------------------------------|
//! | reader      | `fs`, `mongodb`              |
//! | writer      | `fs`, `console`              |
//! | formatter   | `json`, `csv`                |
//! | filter      | `key_value`                  |
//! | transform   | `select_fields`              |
//! | grouper     | `file_key`                   |
//! | persistence | `memory`, `sqlite`, `mongodb`|
//! | bypass      | (`fs`, `fs`)                 |

use std::collections::HashMap;

use crate::bypass::{self, BypassEngine};
use crate::config::{ExportConfig, ModuleConfig};
use crate::error::{ConfigError, Result};
use crate::formatter::{CsvExportFormatter, ExportFormatter, JsonExportFormatter};
use crate::persistence::{CheckpointStore, MemoryStore, MongoStore, Position, SqliteStore};
use crate::reader::{FsReader, MongoReader, Reader};
use crate::stages::{
    FileKeyGrouper, Filter, Grouper, KeyValueFilter, SelectFieldsTransform, Stages, Transform,
};
use crate::writer::{ConsoleDestination, Destination, FsDestination};

type Factory<T> = Box<dyn Fn(&ModuleConfig) -> Result<T> + Send + Sync>;
type ReaderFactory =
    Box<dyn Fn(&ModuleConfig, &Position) -> Result<Box<dyn Reader>> + Send + Sync>;

/// Pair-specific eligibility check, `Err` carries the reason
pub type BypassCheck = fn(&ExportConfig) -> std::result::Result<(), String>;

/// Builder of a bypass engine for one (reader, writer) pair
pub type BypassBuilder = fn(&ExportConfig) -> Result<BypassEngine>;

/// Typed name to constructor maps
pub struct Registry {
    readers: HashMap<String, ReaderFactory>,
    destinations: HashMap<String, Factory<Box<dyn Destination>>>,
    formatters: HashMap<String, Factory<Box<dyn ExportFormatter>>>,
    filters: HashMap<String, Factory<Box<dyn Filter>>>,
    transforms: HashMap<String, Factory<Box<dyn Transform>>>,
    groupers: HashMap<String, Factory<Box<dyn Grouper>>>,
    stores: HashMap<String, Factory<Box<dyn CheckpointStore>>>,
    bypasses: HashMap<(String, String), (BypassCheck, BypassBuilder)>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn lookup<'a, V>(map: &'a HashMap<String, V>, kind: &str, name: &str) -> Result<&'a V> {
    map.get(name).ok_or_else(|| {
        ConfigError::UnknownModule {
            kind: kind.to_string(),
            name: name.to_string(),
        }
        .into()
    })
}

impl Registry {
    /// Registry with no modules
    pub fn empty() -> Self {
        Self {
            readers: HashMap::new(),
            destinations: HashMap::new(),
            formatters: HashMap::new(),
            filters: HashMap::new(),
            transforms: HashMap::new(),
            groupers: HashMap::new(),
            stores: HashMap::new(),
            bypasses: HashMap::new(),
        }
    }

    /// Registry with every built-in module
    pub fn builtin() -> Self {
        let mut registry = Self::empty();

        registry.register_reader("fs", |module, position| {
            Ok(Box::new(FsReader::from_config(module, position)?))
        });
        registry.register_reader("mongodb", |module, position| {
            Ok(Box::new(MongoReader::from_config(module, position)?))
        });

        registry.register_destination("fs", |module| {
            Ok(Box::new(FsDestination::from_config(module)?))
        });
        registry.register_destination("console", |_| Ok(Box::new(ConsoleDestination::new())));

        registry.register_formatter("json", |module| {
            Ok(Box::new(JsonExportFormatter::from_config(module)?))
        });
        registry.register_formatter("csv", |module| {
            Ok(Box::new(CsvExportFormatter::from_config(module)?))
        });

        registry.register_filter("key_value", |module| {
            Ok(Box::new(KeyValueFilter::from_config(module)?))
        });
        registry.register_transform("select_fields", |module| {
            Ok(Box::new(SelectFieldsTransform::from_config(module)?))
        });
        registry.register_grouper("file_key", |module| {
            Ok(Box::new(FileKeyGrouper::from_config(module)?))
        });

        registry.register_store("memory", |_| Ok(Box::new(MemoryStore::new())));
        registry.register_store("sqlite", |module| {
            Ok(Box::new(SqliteStore::from_config(module)?))
        });
        registry.register_store("mongodb", |module| {
            Ok(Box::new(MongoStore::from_config(module)?))
        });

        registry.register_bypass("fs", "fs", bypass::fs_to_fs_check, bypass::fs_to_fs);

        registry
    }

    pub fn register_reader<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModuleConfig, &Position) -> Result<Box<dyn Reader>> + Send + Sync + 'static,
    {
        self.readers.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_destination<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModuleConfig) -> Result<Box<dyn Destination>> + Send + Sync + 'static,
    {
        self.destinations.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_formatter<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModuleConfig) -> Result<Box<dyn ExportFormatter>> + Send + Sync + 'static,
    {
        self.formatters.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_filter<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModuleConfig) -> Result<Box<dyn Filter>> + Send + Sync + 'static,
    {
        self.filters.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_transform<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModuleConfig) -> Result<Box<dyn Transform>> + Send + Sync + 'static,
    {
        self.transforms.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_grouper<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModuleConfig) -> Result<Box<dyn Grouper>> + Send + Sync + 'static,
    {
        self.groupers.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_store<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModuleConfig) -> Result<Box<dyn CheckpointStore>> + Send + Sync + 'static,
    {
        self.stores.insert(name.to_string(), Box::new(factory));
    }

    /// Register a direct copy from `source` readers to `destination` writers
    pub fn register_bypass(
        &mut self,
        source: &str,
        destination: &str,
        check: BypassCheck,
        build: BypassBuilder,
    ) {
        self.bypasses
            .insert((source.to_string(), destination.to_string()), (check, build));
    }

    /// Build a reader positioned at `resume_from`
    pub fn reader(&self, module: &ModuleConfig, resume_from: &Position) -> Result<Box<dyn Reader>> {
        lookup(&self.readers, "reader", &module.name)?(module, resume_from)
    }

    pub fn destination(&self, module: &ModuleConfig) -> Result<Box<dyn Destination>> {
        lookup(&self.destinations, "writer", &module.name)?(module)
    }

    pub fn formatter(&self, module: &ModuleConfig) -> Result<Box<dyn ExportFormatter>> {
        lookup(&self.formatters, "formatter", &module.name)?(module)
    }

    /// Build a checkpoint store; `memory` when none is configured
    pub fn store(&self, module: Option<&ModuleConfig>) -> Result<Box<dyn CheckpointStore>> {
        let default = ModuleConfig::new("memory");
        let module = module.unwrap_or(&default);
        lookup(&self.stores, "persistence", &module.name)?(module)
    }

    /// Build the configured filter, transform and grouper
    pub fn stages(&self, config: &ExportConfig) -> Result<Stages> {
        Ok(Stages {
            filter: config
                .filter
                .as_ref()
                .map(|m| lookup(&self.filters, "filter", &m.name).and_then(|f| f(m)))
                .transpose()?,
            transform: config
                .transform
                .as_ref()
                .map(|m| lookup(&self.transforms, "transform", &m.name).and_then(|f| f(m)))
                .transpose()?,
            grouper: config
                .grouper
                .as_ref()
                .map(|m| lookup(&self.groupers, "grouper", &m.name).and_then(|f| f(m)))
                .transpose()?,
        })
    }

    /// Pair-specific check when a direct copy exists for the pair
    pub fn bypass_check(&self, source: &str, destination: &str) -> Option<BypassCheck> {
        self.bypasses
            .get(&(source.to_string(), destination.to_string()))
            .map(|(check, _)| *check)
    }

    /// Build the bypass engine for the configured pair
    pub fn bypass(&self, config: &ExportConfig) -> Result<BypassEngine> {
        let key = (config.reader.name.clone(), config.writer.name.clone());
        let (_, build) = self.bypasses.get(&key).ok_or_else(|| ConfigError::UnknownModule {
            kind: "bypass".to_string(),
            name: format!("{} -> {}", key.0, key.1),
        })?;
        build(config)
    }

    /// Fail early on any name the registry does not know
    pub fn validate(&self, config: &ExportConfig) -> Result<()> {
        lookup(&self.readers, "reader", &config.reader.name)?;
        lookup(&self.destinations, "writer", &config.writer.name)?;
        lookup(&self.formatters, "formatter", &config.exporter_options.formatter.name)?;
        if let Some(m) = &config.filter {
            lookup(&self.filters, "filter", &m.name)?;
        }
        if let Some(m) = &config.transform {
            lookup(&self.transforms, "transform", &m.name)?;
        }
        if let Some(m) = &config.grouper {
            lookup(&self.groupers, "grouper", &m.name)?;
        }
        if let Some(m) = &config.persistence {
            lookup(&self.stores, "persistence", &m.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportError;

    fn config() -> ExportConfig {
        ExportConfig::new(
            ModuleConfig::new("fs").with_option("path", "/tmp/in"),
            ModuleConfig::new("console"),
        )
    }

    #[test]
    fn test_builtins_resolve() {
        let registry = Registry::default();
        let config = config();
        assert!(registry.validate(&config).is_ok());
        assert!(registry.reader(&config.reader, &Position::None).is_ok());
        assert!(registry.destination(&config.writer).is_ok());
        assert!(registry.formatter(&config.exporter_options.formatter).is_ok());
        assert_eq!(registry.store(None).unwrap().name(), "memory");
        assert!(registry.bypass_check("fs", "fs").is_some());
        assert!(registry.bypass_check("fs", "console").is_none());
    }

    #[test]
    fn test_unknown_names_fail() {
        let registry = Registry::default();
        let mut config = config();
        config.writer = ModuleConfig::new("ftp");

        match registry.validate(&config) {
            Err(ExportError::Config(ConfigError::UnknownModule { kind, name })) => {
                assert_eq!(kind, "writer");
                assert_eq!(name, "ftp");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(registry.destination(&config.writer).is_err());
        assert!(registry.bypass(&config).is_err());
    }

    #[test]
    fn test_stages_built_from_config() {
        let registry = Registry::default();
        let mut config = config();
        config.transform =
            Some(ModuleConfig::new("select_fields").with_option("fields", vec!["id"]));
        let stages = registry.stages(&config).unwrap();
        assert!(stages.filter.is_none());
        assert!(stages.transform.is_some());
        assert!(stages.grouper.is_none());

        config.grouper = Some(ModuleConfig::new("by_magic"));
        assert!(registry.stages(&config).is_err());
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = Registry::empty();
        registry.register_destination("null", |_| Ok(Box::new(ConsoleDestination::new())));
        assert!(registry.destination(&ModuleConfig::new("null")).is_ok());
        assert!(registry.destination(&ModuleConfig::new("fs")).is_err());
    }
}
