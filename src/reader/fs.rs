//! Filesystem reader: JSON lines files in a directory
//!
//! Files matching the configured extension are read in name order, one JSON
//! object per line. The position is the number of records consumed, so a
//! resumed reader skips exactly that many records.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::debug;

use crate::config::{ModuleConfig, OptionDefault, OptionKind, OptionSpec};
use crate::error::{ExportError, PersistenceError, Result};
use crate::persistence::Position;
use crate::record::Record;

use super::{DEFAULT_BATCH_SIZE, ReadBatch, Reader};

const PATH: OptionSpec = OptionSpec::required("path", OptionKind::Str);
const BATCH_SIZE: OptionSpec = OptionSpec::optional("batch_size", OptionKind::Int)
    .with_default(OptionDefault::Int(DEFAULT_BATCH_SIZE));
const EXTENSION: OptionSpec =
    OptionSpec::optional("extension", OptionKind::Str).with_default(OptionDefault::Str("jl"));

/// Resolved `fs` reader options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsSource {
    pub path: PathBuf,
    pub extension: String,
}

impl FsSource {
    /// Resolve from the `reader` section of the job configuration
    pub fn from_config(module: &ModuleConfig) -> Result<Self> {
        let opts = module.options_for("reader");
        Ok(Self {
            path: PathBuf::from(opts.required_string(&PATH)?),
            extension: opts.required_string(&EXTENSION)?,
        })
    }

    /// Source files in name order
    pub fn list_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let path = entry?.path();
            let matches = path
                .extension()
                .is_some_and(|ext| ext.to_string_lossy() == self.extension);
            if path.is_file() && matches {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Reader over JSON lines files
pub struct FsReader {
    source: FsSource,
    batch_size: usize,
    /// Remaining files, reversed so the next one is popped from the end
    pending: Option<Vec<PathBuf>>,
    current: Option<(PathBuf, Lines<BufReader<File>>)>,
    /// Records consumed since the start of the job
    consumed: u64,
    /// Records still to skip after a resume
    skip: u64,
    finished: bool,
}

impl FsReader {
    /// Create a new reader
    ///
    /// # Arguments
    /// * `source` - Directory and extension to read
    /// * `batch_size` - Records per batch
    /// * `resume_from` - Position to resume from
    pub fn new(source: FsSource, batch_size: usize, resume_from: &Position) -> Result<Self> {
        let skip = resume_from.as_count().ok_or_else(|| {
            let (tag, raw) = resume_from
                .encode()
                .unwrap_or((resume_from.type_tag(), String::new()));
            PersistenceError::CorruptPosition {
                tag: tag.to_string(),
                raw,
                reason: "fs reader resumes from a record count".to_string(),
            }
        })?;

        Ok(Self {
            source,
            batch_size: batch_size.max(1),
            pending: None,
            current: None,
            consumed: 0,
            skip,
            finished: false,
        })
    }

    /// Build from the `reader` section of the job configuration
    pub fn from_config(module: &ModuleConfig, resume_from: &Position) -> Result<Self> {
        let batch_size = module
            .options_for("reader")
            .positive(&BATCH_SIZE)?
            .unwrap_or(DEFAULT_BATCH_SIZE as u64);
        Self::new(FsSource::from_config(module)?, batch_size as usize, resume_from)
    }

    async fn open_next(&mut self) -> Result<bool> {
        if self.pending.is_none() {
            let mut files = self.source.list_files()?;
            files.reverse();
            debug!(
                "Found {} source files in {}",
                files.len(),
                self.source.path.display()
            );
            self.pending = Some(files);
        }

        match self.pending.as_mut().and_then(Vec::pop) {
            Some(path) => {
                let file = File::open(&path).await?;
                self.current = Some((path, BufReader::new(file).lines()));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn parse_line(path: &Path, line: &str) -> Result<Record> {
    let value = serde_json::from_str(line).map_err(|e| {
        ExportError::Format(format!("{}: invalid JSON line: {e}", path.display()))
    })?;
    Record::from_value(value)
}

#[async_trait]
impl Reader for FsReader {
    fn name(&self) -> &str {
        "fs"
    }

    async fn next_batch(&mut self) -> Result<ReadBatch> {
        let mut records = Vec::with_capacity(self.batch_size.min(1024));

        while !self.finished && records.len() < self.batch_size {
            let Some((path, lines)) = self.current.as_mut() else {
                if !self.open_next().await? {
                    self.finished = true;
                }
                continue;
            };

            let Some(line) = lines.next_line().await? else {
                self.current = None;
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }

            self.consumed += 1;
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            records.push(parse_line(path, &line)?);
        }

        debug!(
            "Read {} records ({} consumed)",
            records.len(),
            self.consumed
        );
        Ok(ReadBatch {
            records,
            finished: self.finished,
        })
    }

    fn last_position(&self) -> Position {
        Position::Integer(self.consumed as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_dir(files: &[(&str, &[i64])]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, ids) in files {
            let content: String = ids.iter().map(|id| format!("{{\"id\":{id}}}\n")).collect();
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    fn source(dir: &TempDir) -> FsSource {
        FsSource {
            path: dir.path().to_path_buf(),
            extension: "jl".to_string(),
        }
    }

    async fn read_all(reader: &mut FsReader) -> Vec<i64> {
        let mut ids = Vec::new();
        loop {
            let batch = reader.next_batch().await.unwrap();
            ids.extend(batch.records.iter().map(|r| r.get("id").unwrap().as_i64().unwrap()));
            if batch.finished {
                return ids;
            }
        }
    }

    #[tokio::test]
    async fn test_reads_files_in_name_order() {
        let dir = source_dir(&[("b.jl", &[3, 4]), ("a.jl", &[1, 2]), ("skip.txt", &[9])]);
        let mut reader = FsReader::new(source(&dir), 3, &Position::None).unwrap();

        let first = reader.next_batch().await.unwrap();
        assert_eq!(first.records.len(), 3);
        assert!(!first.finished);
        assert_eq!(reader.last_position(), Position::Integer(3));

        let rest = read_all(&mut reader).await;
        assert_eq!(rest, vec![4]);
        assert_eq!(reader.last_position(), Position::Integer(4));
    }

    #[tokio::test]
    async fn test_resume_skips_consumed_records() {
        let dir = source_dir(&[("a.jl", &[1, 2, 3]), ("b.jl", &[4, 5])]);
        let mut reader = FsReader::new(source(&dir), 10, &Position::Integer(4)).unwrap();
        assert_eq!(read_all(&mut reader).await, vec![5]);
        assert_eq!(reader.last_position(), Position::Integer(5));
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        let mut reader = FsReader::new(source(&dir), 10, &Position::None).unwrap();
        let batch = reader.next_batch().await.unwrap();
        assert!(batch.records.is_empty());
        assert!(batch.finished);
    }

    #[test]
    fn test_rejects_non_count_position() {
        let dir = TempDir::new().unwrap();
        assert!(FsReader::new(source(&dir), 10, &Position::Text("x".into())).is_err());
    }

    #[tokio::test]
    async fn test_invalid_line_is_format_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jl"), "{\"id\":1}\nnot json\n").unwrap();
        let mut reader = FsReader::new(source(&dir), 10, &Position::None).unwrap();
        assert!(matches!(
            reader.next_batch().await,
            Err(ExportError::Format(_))
        ));
    }
}
