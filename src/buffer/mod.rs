//! Write buffer: per group key spool files bounded by count and size
//!
//! Formatted fragments are appended to one open spool file per group key.
//! When either threshold is reached the file is closed, framed with the
//! formatter footer and handed back as a [`SpoolFile`] for delivery, and a
//! fresh file is opened for the same key. With gzip compression enabled
//! the spool file is written through a gzip encoder and its metadata size
//! is the compressed size on disk.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression as GzLevel;
use flate2::write::GzEncoder;
use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ConfigError, ExportError, Result};
use crate::formatter::Framing;
use crate::record::GroupKey;

/// Default record count that triggers a flush
pub const DEFAULT_ITEMS_PER_BUFFER_WRITE: u64 = 500_000;

/// Default byte size that triggers a flush
pub const DEFAULT_SIZE_PER_BUFFER_WRITE: u64 = 4_000_000_000;

/// Compression applied to spool files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    /// Parse the `compression` writer option
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" | "" => Ok(Self::None),
            "gz" | "gzip" => Ok(Self::Gzip),
            other => Err(ConfigError::InvalidValue {
                field: "writer.compression".to_string(),
                value: other.to_string(),
            }
            .into()),
        }
    }

    /// Spool file extension for a formatter extension
    pub fn extension(self, base: &str) -> String {
        match self {
            Self::None => base.to_string(),
            Self::Gzip => format!("{base}.gz"),
        }
    }
}

/// Size and record count of a closed spool file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpoolMetadata {
    pub size: u64,
    pub record_count: u64,
}

/// A closed spool file ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolFile {
    pub path: PathBuf,
    pub group_key: GroupKey,
    pub size: u64,
    pub record_count: u64,
}

enum SpoolWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl SpoolWriter {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(writer) => writer.write_all(bytes),
            Self::Gzip(encoder) => encoder.write_all(bytes),
        }
    }

    /// Flush buffered bytes and write the gzip trailer
    fn finish(self) -> std::io::Result<()> {
        match self {
            Self::Plain(mut writer) => writer.flush(),
            Self::Gzip(encoder) => encoder.finish()?.flush(),
        }
    }
}

struct OpenSpool {
    path: PathBuf,
    writer: SpoolWriter,
    /// Uncompressed bytes written, compared to the size threshold
    size: u64,
    record_count: u64,
}

impl OpenSpool {
    fn write(&mut self, text: &str) -> Result<()> {
        self.writer.write_all(text.as_bytes())?;
        self.size += text.len() as u64;
        Ok(())
    }
}

/// Groups formatted output per key into bounded spool files
pub struct WriteBuffer {
    items_per_buffer_write: u64,
    size_per_buffer_write: u64,
    framing: Framing,
    extension: String,
    compression: Compression,
    dir: Option<TempDir>,
    open: HashMap<GroupKey, OpenSpool>,
    closed: HashMap<PathBuf, SpoolMetadata>,
}

impl WriteBuffer {
    /// Create a new write buffer in a private temporary directory
    ///
    /// # Arguments
    /// * `items_per_buffer_write` - Record count that triggers a flush
    /// * `size_per_buffer_write` - Byte size that triggers a flush
    /// * `framing` - Header, separator and footer of every spool file
    /// * `extension` - Spool file extension
    ///
    /// # Returns
    /// * `Result<Self>` - New buffer, or an error for zero thresholds
    pub fn new(
        items_per_buffer_write: u64,
        size_per_buffer_write: u64,
        framing: Framing,
        extension: &str,
    ) -> Result<Self> {
        for (field, value) in [
            ("writer.items_per_buffer_write", items_per_buffer_write),
            ("writer.size_per_buffer_write", size_per_buffer_write),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                }
                .into());
            }
        }

        let dir = tempfile::Builder::new().prefix("exporters-").tempdir()?;
        debug!("Created spool directory: {}", dir.path().display());

        Ok(Self {
            items_per_buffer_write,
            size_per_buffer_write,
            framing,
            extension: extension.to_string(),
            compression: Compression::None,
            dir: Some(dir),
            open: HashMap::new(),
            closed: HashMap::new(),
        })
    }

    /// Compress spool files opened from now on
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Directory holding the spool files
    pub fn dir(&self) -> Result<&Path> {
        self.dir
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| ExportError::Generic("write buffer is closed".to_string()))
    }

    fn open_spool(&self) -> Result<OpenSpool> {
        let extension = self.compression.extension(&self.extension);
        let path = self.dir()?.join(format!("{}.{extension}", Uuid::new_v4()));
        let file = BufWriter::new(File::create(&path)?);
        let writer = match self.compression {
            Compression::None => SpoolWriter::Plain(file),
            Compression::Gzip => SpoolWriter::Gzip(GzEncoder::new(file, GzLevel::default())),
        };
        let mut spool = OpenSpool {
            path,
            writer,
            size: 0,
            record_count: 0,
        };
        if !self.framing.header.is_empty() {
            spool.write(&self.framing.header)?;
            spool.write("\n")?;
        }
        Ok(spool)
    }

    /// Append one formatted fragment to the key's spool file
    ///
    /// # Arguments
    /// * `group_key` - Group the fragment belongs to
    /// * `fragment` - Formatted record, without trailing newline
    /// * `record_count` - Number of records the fragment holds
    pub fn append(
        &mut self,
        group_key: &GroupKey,
        fragment: &str,
        record_count: u64,
    ) -> Result<()> {
        if !self.open.contains_key(group_key) {
            let spool = self.open_spool()?;
            self.open.insert(group_key.clone(), spool);
        }
        let separator = self.framing.separator.clone();
        let spool = self
            .open
            .get_mut(group_key)
            .ok_or_else(|| ExportError::Generic(format!("no spool file for {group_key}")))?;

        if spool.record_count > 0 && !separator.is_empty() {
            spool.write(&separator)?;
        }
        spool.write(fragment)?;
        spool.write("\n")?;
        spool.record_count += record_count;
        Ok(())
    }

    /// Whether the key's buffer reached either threshold
    pub fn should_flush(&self, group_key: &GroupKey) -> bool {
        self.open.get(group_key).is_some_and(|spool| {
            spool.record_count >= self.items_per_buffer_write
                || spool.size >= self.size_per_buffer_write
        })
    }

    fn close_spool(&mut self, group_key: GroupKey, mut spool: OpenSpool) -> Result<SpoolFile> {
        if !self.framing.footer.is_empty() {
            let footer = self.framing.footer.clone();
            spool.write(&footer)?;
            spool.write("\n")?;
        }
        let OpenSpool {
            path,
            writer,
            record_count,
            ..
        } = spool;
        writer.finish()?;

        let metadata = SpoolMetadata {
            size: std::fs::metadata(&path)?.len(),
            record_count,
        };
        self.closed.insert(path.clone(), metadata);
        debug!(
            "Closed spool file {} for {} ({} records, {} bytes)",
            path.display(),
            group_key,
            metadata.record_count,
            metadata.size
        );

        Ok(SpoolFile {
            path,
            group_key,
            size: metadata.size,
            record_count: metadata.record_count,
        })
    }

    /// Close the key's spool file and open a fresh one for the same key
    ///
    /// # Returns
    /// * `Result<Option<SpoolFile>>` - The closed file, or `None` when the
    ///   key holds no records
    pub fn flush(&mut self, group_key: &GroupKey) -> Result<Option<SpoolFile>> {
        let has_records = self
            .open
            .get(group_key)
            .is_some_and(|spool| spool.record_count > 0);
        if !has_records {
            return Ok(None);
        }

        let fresh = self.open_spool()?;
        let Some(spool) = self.open.insert(group_key.clone(), fresh) else {
            return Ok(None);
        };
        self.close_spool(group_key.clone(), spool).map(Some)
    }

    /// Close every spool file holding records, in group key order
    ///
    /// Spool files without records are discarded.
    pub fn flush_all(&mut self) -> Result<Vec<SpoolFile>> {
        let mut pending: Vec<(GroupKey, OpenSpool)> = self.open.drain().collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        let mut files = Vec::new();
        for (group_key, spool) in pending {
            if spool.record_count == 0 {
                let path = spool.path.clone();
                drop(spool);
                std::fs::remove_file(&path)?;
                continue;
            }
            files.push(self.close_spool(group_key, spool)?);
        }
        Ok(files)
    }

    /// Metadata of a closed, not yet released spool file
    pub fn metadata_for(&self, path: &Path) -> Option<SpoolMetadata> {
        self.closed.get(path).copied()
    }

    /// Delete a delivered spool file and forget its metadata
    pub fn release(&mut self, path: &Path) -> Result<()> {
        if self.closed.remove(path).is_some() && path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Whether any open spool file holds records
    pub fn has_pending(&self) -> bool {
        self.open.values().any(|spool| spool.record_count > 0)
    }

    /// Release all state and remove the spool directory
    pub fn close(&mut self) -> Result<()> {
        self.open.clear();
        self.closed.clear();
        if let Some(dir) = self.dir.take() {
            dir.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(items: u64, size: u64) -> WriteBuffer {
        WriteBuffer::new(items, size, Framing::lines(), "jl").unwrap()
    }

    #[test]
    fn test_flush_by_count_two_then_one() {
        let mut buffer = buffer(2, DEFAULT_SIZE_PER_BUFFER_WRITE);
        let key = GroupKey::empty();
        let mut flushed = Vec::new();

        for fragment in ["{\"a\":1}", "{\"a\":2}", "{\"a\":3}"] {
            buffer.append(&key, fragment, 1).unwrap();
            if buffer.should_flush(&key) {
                flushed.extend(buffer.flush(&key).unwrap());
            }
        }
        flushed.extend(buffer.flush_all().unwrap());

        let counts: Vec<u64> = flushed.iter().map(|f| f.record_count).collect();
        assert_eq!(counts, vec![2, 1]);
        assert!(!buffer.has_pending());
    }

    #[test]
    fn test_flush_by_size() {
        let mut buffer = buffer(1000, 10);
        let key = GroupKey::empty();

        buffer.append(&key, "1234", 1).unwrap();
        assert!(!buffer.should_flush(&key));
        buffer.append(&key, "5678", 1).unwrap();
        assert!(buffer.should_flush(&key));

        let file = buffer.flush(&key).unwrap().unwrap();
        assert_eq!(file.size, 10);
        assert_eq!(file.record_count, 2);
    }

    #[test]
    fn test_metadata_matches_file_bytes() {
        let framing = Framing {
            header: "[".to_string(),
            separator: ",".to_string(),
            footer: "]".to_string(),
        };
        let mut buffer = WriteBuffer::new(10, 1 << 20, framing, "json").unwrap();
        let key = GroupKey::new(["es"]);
        buffer.append(&key, "{\"x\":1}", 1).unwrap();
        buffer.append(&key, "{\"x\":2}", 1).unwrap();

        let file = buffer.flush(&key).unwrap().unwrap();
        let bytes = std::fs::read(&file.path).unwrap();
        assert_eq!(bytes.len() as u64, file.size);
        assert_eq!(buffer.metadata_for(&file.path).unwrap().size, file.size);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "[\n{\"x\":1}\n,{\"x\":2}\n]\n"
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let mut buffer = buffer(2, DEFAULT_SIZE_PER_BUFFER_WRITE);
        let es = GroupKey::new(["es"]);
        let fr = GroupKey::new(["fr"]);

        buffer.append(&es, "1", 1).unwrap();
        buffer.append(&fr, "2", 1).unwrap();
        assert!(!buffer.should_flush(&es));
        buffer.append(&es, "3", 1).unwrap();
        assert!(buffer.should_flush(&es));
        assert!(!buffer.should_flush(&fr));

        let files = buffer.flush_all().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].group_key, es);
        assert_eq!(files[1].group_key, fr);
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let mut buffer = buffer(2, DEFAULT_SIZE_PER_BUFFER_WRITE);
        let key = GroupKey::empty();
        assert!(buffer.flush(&key).unwrap().is_none());

        buffer.append(&key, "1", 1).unwrap();
        buffer.append(&key, "2", 1).unwrap();
        assert!(buffer.flush(&key).unwrap().is_some());
        // a fresh spool was opened but holds nothing
        assert!(buffer.flush(&key).unwrap().is_none());
        assert!(buffer.flush_all().unwrap().is_empty());
    }

    #[test]
    fn test_release_and_close() {
        let mut buffer = buffer(1, DEFAULT_SIZE_PER_BUFFER_WRITE);
        let key = GroupKey::empty();
        buffer.append(&key, "1", 1).unwrap();
        let file = buffer.flush(&key).unwrap().unwrap();
        assert!(file.path.exists());

        buffer.release(&file.path).unwrap();
        assert!(!file.path.exists());
        assert!(buffer.metadata_for(&file.path).is_none());

        let dir = file.path.parent().unwrap().to_path_buf();
        buffer.close().unwrap();
        assert!(!dir.exists());
        assert!(buffer.append(&key, "2", 1).is_err());
    }

    #[test]
    fn test_gzip_spool_files() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let mut buffer =
            buffer(10, DEFAULT_SIZE_PER_BUFFER_WRITE).with_compression(Compression::Gzip);
        let key = GroupKey::empty();
        buffer.append(&key, "{\"a\":1}", 1).unwrap();
        buffer.append(&key, "{\"a\":2}", 1).unwrap();

        let file = buffer.flush(&key).unwrap().unwrap();
        assert!(file.path.to_string_lossy().ends_with(".jl.gz"));

        let compressed = std::fs::read(&file.path).unwrap();
        assert_eq!(compressed.len() as u64, file.size);
        assert_eq!(buffer.metadata_for(&file.path).unwrap().size, file.size);

        let mut text = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "{\"a\":1}\n{\"a\":2}\n");
    }

    #[test]
    fn test_compression_option_values() {
        assert_eq!(Compression::parse("none").unwrap(), Compression::None);
        assert_eq!(Compression::parse("gz").unwrap(), Compression::Gzip);
        assert_eq!(Compression::parse("gzip").unwrap(), Compression::Gzip);
        assert!(Compression::parse("zip").is_err());
        assert_eq!(Compression::Gzip.extension("csv"), "csv.gz");
    }

    #[test]
    fn test_zero_threshold_rejected() {
        assert!(WriteBuffer::new(0, 10, Framing::lines(), "jl").is_err());
        assert!(WriteBuffer::new(10, 0, Framing::lines(), "jl").is_err());
    }
}
