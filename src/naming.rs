//! Chunk File Naming
//!
//! Maps a logical chunk index (and version) to a file path and enumerates
//! the chunk files present in the database directory.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Extension used for files still being written (scavenge output, truncation copies)
pub const TEMP_EXTENSION: &str = "tmp";

/// `(index, version)` of a chunk file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkFileId {
    pub index: i32,
    pub version: i32,
}

/// Chunk file naming scheme
pub trait FileNamingStrategy: Debug + Send + Sync {
    /// Directory holding the chunk files
    fn path(&self) -> &Path;

    /// File name for `index` at `version`
    fn filename_for(&self, index: i32, version: i32) -> Result<PathBuf>;

    /// Parse a bare file name
    fn parse(&self, file_name: &str) -> Option<ChunkFileId>;

    /// File name for `index` at version 0
    fn filename_for_index(&self, index: i32) -> Result<PathBuf> {
        self.filename_for(index, 0)
    }

    /// Every file matching the pattern, unsorted
    fn all_present_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.path().exists() {
            return Ok(files);
        }

        for entry in std::fs::read_dir(self.path())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if file_name(&path).and_then(|n| self.parse(n)).is_some() {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Every file for `index`, newest version first
    fn all_versions_for(&self, index: i32) -> Result<Vec<PathBuf>> {
        check_range("index", index)?;

        let mut versions: Vec<(i32, PathBuf)> = self
            .all_present_files()?
            .into_iter()
            .filter_map(|path| {
                let id = file_name(&path).and_then(|n| self.parse(n))?;
                (id.index == index).then_some((id.version, path))
            })
            .collect();

        versions.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(versions.into_iter().map(|(_, path)| path).collect())
    }

    /// Index encoded in a file path
    fn index_for(&self, path: &Path) -> Option<i32> {
        file_name(path).and_then(|n| self.parse(n)).map(|id| id.index)
    }

    /// Version encoded in a file path
    fn version_for(&self, path: &Path) -> Option<i32> {
        file_name(path).and_then(|n| self.parse(n)).map(|id| id.version)
    }

    /// Fresh temporary file name in the database directory
    fn temp_filename(&self) -> PathBuf {
        self.path()
            .join(format!("{}.{}", uuid::Uuid::new_v4(), TEMP_EXTENSION))
    }

    /// Leftover temporary files
    fn all_temp_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.path().exists() {
            return Ok(files);
        }
        for entry in std::fs::read_dir(self.path())? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == TEMP_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

fn check_range(name: &'static str, value: i32) -> Result<()> {
    if value < 0 {
        return Err(Error::OutOfRange {
            name,
            value: value as i64,
        });
    }
    Ok(())
}

fn check_not_empty(path: &Path, prefix: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidArgument("path cannot be empty".into()));
    }
    if prefix.is_empty() {
        return Err(Error::InvalidArgument("prefix cannot be empty".into()));
    }
    Ok(())
}

fn parse_digits(s: &str, min_len: usize) -> Option<i32> {
    if s.len() < min_len || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// `<prefix><index:06>.<version:06>`
#[derive(Debug, Clone)]
pub struct VersionedPatternFileNamingStrategy {
    path: PathBuf,
    prefix: String,
}

impl VersionedPatternFileNamingStrategy {
    pub fn new(path: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        check_not_empty(path.as_ref(), prefix)?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            prefix: prefix.to_string(),
        })
    }
}

impl FileNamingStrategy for VersionedPatternFileNamingStrategy {
    fn path(&self) -> &Path {
        &self.path
    }

    fn filename_for(&self, index: i32, version: i32) -> Result<PathBuf> {
        check_range("index", index)?;
        check_range("version", version)?;
        Ok(self
            .path
            .join(format!("{}{:06}.{:06}", self.prefix, index, version)))
    }

    fn parse(&self, file_name: &str) -> Option<ChunkFileId> {
        let rest = file_name.strip_prefix(&self.prefix)?;
        let (index, version) = rest.split_once('.')?;
        Some(ChunkFileId {
            index: parse_digits(index, 6)?,
            version: parse_digits(version, 6)?,
        })
    }
}

/// Legacy `<prefix><index>` naming; every file is version 0
#[derive(Debug, Clone)]
pub struct PrefixFileNamingStrategy {
    path: PathBuf,
    prefix: String,
}

impl PrefixFileNamingStrategy {
    pub fn new(path: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        check_not_empty(path.as_ref(), prefix)?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            prefix: prefix.to_string(),
        })
    }
}

impl FileNamingStrategy for PrefixFileNamingStrategy {
    fn path(&self) -> &Path {
        &self.path
    }

    fn filename_for(&self, index: i32, version: i32) -> Result<PathBuf> {
        check_range("index", index)?;
        check_range("version", version)?;
        Ok(self.path.join(format!("{}{}", self.prefix, index)))
    }

    fn parse(&self, file_name: &str) -> Option<ChunkFileId> {
        let rest = file_name.strip_prefix(&self.prefix)?;
        Some(ChunkFileId {
            index: parse_digits(rest, 1)?,
            version: 0,
        })
    }
}
