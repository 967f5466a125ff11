//! Console destination: prints every delivered unit to stdout

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{ExportError, Result};
use crate::record::GroupKey;

use super::Destination;

/// Destination printing spool files to standard output
#[derive(Default)]
pub struct ConsoleDestination {
    /// Bytes printed per unit
    printed: Mutex<HashMap<String, u64>>,
}

impl ConsoleDestination {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Destination for ConsoleDestination {
    fn name(&self) -> &str {
        "console"
    }

    async fn write(&self, path: &Path, _group_key: &GroupKey) -> Result<String> {
        let content = tokio::fs::read(path).await?;

        let mut stdout = tokio::io::stdout();
        stdout.write_all(&content).await?;
        stdout.flush().await?;

        let mut printed = self
            .printed
            .lock()
            .map_err(|_| ExportError::Generic("console writer state poisoned".to_string()))?;
        let unit = format!("stdout#{}", printed.len());
        printed.insert(unit.clone(), content.len() as u64);
        Ok(unit)
    }

    async fn unit_size(&self, unit: &str) -> Result<Option<u64>> {
        let printed = self
            .printed
            .lock()
            .map_err(|_| ExportError::Generic("console writer state poisoned".to_string()))?;
        Ok(printed.get(unit).copied())
    }
}
