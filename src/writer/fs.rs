//! Filesystem destination
//!
//! Delivers spool files under a configurable filebase. The filebase may
//! contain `strftime` placeholders (rendered once per delivery) and
//! `{groups[N]}` placeholders replaced by the N-th group key value:
//!
//! ```text
//! /data/out/%Y-%m-%d/{groups[0]}/export_
//! ```
//!
//! Units are named `<prefix><NNNN>.<ext>` in the rendered directory, and an
//! existing file is never overwritten. Named units such as the checksum
//! file land in the filebase directory above the first group placeholder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use chrono::format::{Item, StrftimeItems};
use tracing::debug;

use crate::config::{ModuleConfig, OptionKind, OptionSpec};
use crate::error::{ConfigError, ExportError, Result};
use crate::record::GroupKey;

use super::Destination;

const FILEBASE: OptionSpec = OptionSpec::required("filebase", OptionKind::Str);

/// Destination writing units to a local or mounted filesystem
pub struct FsDestination {
    filebase: String,
    /// Next candidate number per rendered filebase
    counters: Mutex<HashMap<PathBuf, u32>>,
}

impl FsDestination {
    /// Create a new filesystem destination
    ///
    /// # Arguments
    /// * `filebase` - Directory plus file prefix, with optional placeholders
    pub fn new(filebase: impl Into<String>) -> Result<Self> {
        let filebase = filebase.into();
        validate_filebase(&filebase)?;
        Ok(Self {
            filebase,
            counters: Mutex::new(HashMap::new()),
        })
    }

    /// Build from the `writer` section of the job configuration
    pub fn from_config(module: &ModuleConfig) -> Result<Self> {
        Self::new(module.options_for("writer").required_string(&FILEBASE)?)
    }

    /// Pick the first free `<prefix><NNNN>.<ext>` path for a rendered filebase
    fn next_target(&self, filebase: &str, extension: &str) -> Result<PathBuf> {
        let (dir, prefix) = split_filebase(filebase);
        std::fs::create_dir_all(&dir)?;

        let mut counters = self
            .counters
            .lock()
            .map_err(|_| ExportError::Generic("filesystem writer state poisoned".to_string()))?;
        let number = counters.entry(dir.join(&prefix)).or_insert(0);

        loop {
            let candidate = dir.join(format!("{prefix}{number:04}.{extension}"));
            *number += 1;
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    /// Pick the first free path for a named unit, numbering repeats
    fn named_target(&self, file_name: &str) -> Result<PathBuf> {
        let ungrouped = match self.filebase.find("{groups[") {
            Some(start) => &self.filebase[..start],
            None => self.filebase.as_str(),
        };
        let rendered = Utc::now()
            .format_with_items(StrftimeItems::new(ungrouped))
            .to_string();
        let (dir, _) = split_filebase(&rendered);
        std::fs::create_dir_all(&dir)?;

        let (stem, extension) = file_name.rsplit_once('.').unwrap_or((file_name, ""));
        let mut candidate = dir.join(file_name);
        let mut number = 1;
        while candidate.exists() {
            candidate = dir.join(format!("{stem}-{number:04}.{extension}"));
            number += 1;
        }
        Ok(candidate)
    }

    async fn copy_to(&self, path: &Path, target: &Path) -> Result<String> {
        if let Err(e) = tokio::fs::copy(path, target).await {
            let _ = tokio::fs::remove_file(target).await;
            return Err(e.into());
        }

        debug!("Copied {} to {}", path.display(), target.display());
        Ok(target.to_string_lossy().into_owned())
    }
}

/// Reject filebases with malformed `strftime` placeholders
pub(crate) fn validate_filebase(template: &str) -> Result<()> {
    if StrftimeItems::new(template).any(|item| matches!(item, Item::Error)) {
        return Err(ConfigError::InvalidValue {
            field: "writer.filebase".to_string(),
            value: template.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Render date and group placeholders of a filebase
pub(crate) fn render_filebase(template: &str, group_key: &GroupKey) -> Result<String> {
    let mut rendered = Utc::now()
        .format_with_items(StrftimeItems::new(template))
        .to_string();

    let segments = group_key.path_segments();
    while let Some(start) = rendered.find("{groups[") {
        let rest = &rendered[start + "{groups[".len()..];
        let Some(end) = rest.find("]}") else {
            break;
        };
        let index: usize = rest[..end].parse().map_err(|_| ConfigError::InvalidValue {
            field: "writer.filebase".to_string(),
            value: template.to_string(),
        })?;
        let value = segments.get(index).ok_or_else(|| {
            ExportError::Format(format!(
                "filebase references group {index} but key {group_key} has {} values",
                segments.len()
            ))
        })?;
        let placeholder_end = start + "{groups[".len() + end + "]}".len();
        rendered.replace_range(start..placeholder_end, value);
    }

    Ok(rendered)
}

/// Split a filebase into its directory and file name prefix
pub(crate) fn split_filebase(filebase: &str) -> (PathBuf, String) {
    if filebase.ends_with('/') {
        return (PathBuf::from(filebase), String::new());
    }
    let path = Path::new(filebase);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let prefix = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    (dir, prefix)
}

#[async_trait]
impl Destination for FsDestination {
    fn name(&self) -> &str {
        "fs"
    }

    async fn write(&self, path: &Path, group_key: &GroupKey) -> Result<String> {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();
        let filebase = render_filebase(&self.filebase, group_key)?;
        let target = self.next_target(&filebase, &extension)?;
        self.copy_to(path, &target).await
    }

    async fn write_named(&self, path: &Path, file_name: &str) -> Result<String> {
        let target = self.named_target(file_name)?;
        self.copy_to(path, &target).await
    }

    async fn unit_size(&self, unit: &str) -> Result<Option<u64>> {
        match tokio::fs::metadata(unit).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spool(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_sequential_names() {
        let out = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let filebase = format!("{}/export_", out.path().display());
        let destination = FsDestination::new(filebase).unwrap();

        let first = destination
            .write(&spool(&work, "a.jl", "1\n"), &GroupKey::empty())
            .await
            .unwrap();
        let second = destination
            .write(&spool(&work, "b.jl", "22\n"), &GroupKey::empty())
            .await
            .unwrap();

        assert!(first.ends_with("export_0000.jl"));
        assert!(second.ends_with("export_0001.jl"));
        assert_eq!(destination.unit_size(&second).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_never_overwrites() {
        let out = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        std::fs::write(out.path().join("export_0000.jl"), "existing").unwrap();

        let destination =
            FsDestination::new(format!("{}/export_", out.path().display())).unwrap();
        let unit = destination
            .write(&spool(&work, "a.jl", "new\n"), &GroupKey::empty())
            .await
            .unwrap();

        assert!(unit.ends_with("export_0001.jl"));
        let kept = std::fs::read_to_string(out.path().join("export_0000.jl")).unwrap();
        assert_eq!(kept, "existing");
    }

    #[tokio::test]
    async fn test_group_placeholders() {
        let out = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let destination =
            FsDestination::new(format!("{}/{{groups[0]}}/part_", out.path().display())).unwrap();

        let unit = destination
            .write(&spool(&work, "a.jl", "x\n"), &GroupKey::new(["es/north"]))
            .await
            .unwrap();
        assert!(unit.contains("/es_north/part_0000.jl"));

        let err = destination
            .write(&spool(&work, "b.jl", "x\n"), &GroupKey::empty())
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_named_unit_above_group_dirs() {
        let out = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let destination =
            FsDestination::new(format!("{}/{{groups[0]}}/part_", out.path().display())).unwrap();

        let first = destination
            .write_named(&spool(&work, "sums", "abc  part_0000.jl\n"), "md5checksum.md5")
            .await
            .unwrap();
        let second = destination
            .write_named(&spool(&work, "sums", "def  part_0000.jl\n"), "md5checksum.md5")
            .await
            .unwrap();

        assert_eq!(PathBuf::from(&first), out.path().join("md5checksum.md5"));
        assert_eq!(PathBuf::from(&second), out.path().join("md5checksum-0001.md5"));
        assert_eq!(destination.unit_size(&first).await.unwrap(), Some(18));
    }

    #[tokio::test]
    async fn test_gzip_spool_keeps_gz_extension() {
        let out = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let destination =
            FsDestination::new(format!("{}/exporter_test", out.path().display())).unwrap();

        let unit = destination
            .write(&spool(&work, "a.jl.gz", "x"), &GroupKey::empty())
            .await
            .unwrap();
        assert!(unit.ends_with("exporter_test0000.gz"));
    }

    #[tokio::test]
    async fn test_missing_unit_size_is_none() {
        let destination = FsDestination::new("/tmp/exporters-never/export_").unwrap();
        assert_eq!(
            destination
                .unit_size("/tmp/exporters-never/export_9999.jl")
                .await
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_split_filebase() {
        assert_eq!(
            split_filebase("/data/out/export_"),
            (PathBuf::from("/data/out"), "export_".to_string())
        );
        assert_eq!(
            split_filebase("/data/out/"),
            (PathBuf::from("/data/out/"), String::new())
        );
        assert_eq!(
            split_filebase("export_"),
            (PathBuf::from("."), "export_".to_string())
        );
    }

    #[test]
    fn test_required_filebase() {
        assert!(FsDestination::from_config(&ModuleConfig::new("fs")).is_err());
    }
}
