//! Temp file store: one reserved directory of short-lived, uniquely named files.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::{Result, StashError};

/// Suffix appended to generated file names.
const FILE_SUFFIX: &str = ".tmp";

/// A file living inside the reserved temp directory.
///
/// Holds no open handle; the producer opens it for writing with
/// [`StoredFile::writer`] and the gateway opens it for reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    path: PathBuf,
}

impl StoredFile {
    /// Full path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name (the unique part of the path).
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Last-modified timestamp as reported by the filesystem.
    pub fn modified(&self) -> Result<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|e| StashError::open(&self.path, e))
    }

    /// Size in bytes.
    pub fn len(&self) -> Result<u64> {
        std::fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|e| StashError::open(&self.path, e))
    }

    /// `true` if the file holds no bytes (or is gone).
    pub fn is_empty(&self) -> bool {
        self.len().map(|n| n == 0).unwrap_or(true)
    }

    /// Open the file for writing the payload, truncating anything already there.
    pub fn writer(&self) -> Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| StashError::open(&self.path, e))?;
        Ok(BufWriter::new(file))
    }
}

/// Owns the reserved temp directory.
#[derive(Debug, Clone)]
pub struct TempFileStore {
    dir: PathBuf,
    prefix: String,
}

impl TempFileStore {
    /// Store rooted at `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Store at the configured location inside the cache directory.
    pub fn from_config(config: &Config) -> Self {
        Self::new(crate::config::temp_dir(config), &config.store.file_prefix)
    }

    /// The reserved directory.
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Name of the reserved directory (last path component).
    pub fn directory_name(&self) -> &str {
        self.dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Allocate a new, uniquely named empty file.
    ///
    /// A failure to create the directory is only logged here; the file
    /// creation that follows then reports the real filesystem error.
    pub fn create_file(&self) -> Result<StoredFile> {
        self.ensure_directory();
        let temp = tempfile::Builder::new()
            .prefix(&self.prefix)
            .suffix(FILE_SUFFIX)
            .tempfile_in(&self.dir)
            .map_err(|e| StashError::io(&self.dir, e))?;
        let (_file, path) = temp
            .keep()
            .map_err(|e| StashError::io(&self.dir, e.error))?;
        debug!(path = %path.display(), "Created temp file");
        Ok(StoredFile { path })
    }

    /// Enumerate the directory. Empty if it is absent or unreadable.
    pub fn list_files(&self) -> Vec<StoredFile> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list temp directory");
                return Vec::new();
            }
        };

        let mut files: Vec<StoredFile> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| StoredFile { path: entry.path() })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    /// Remove a file, returning the raw I/O outcome.
    pub fn remove(&self, file: &StoredFile) -> std::io::Result<()> {
        std::fs::remove_file(&file.path)
    }

    /// Delete a file. Failure is soft: logged and reported as `false`.
    pub fn delete_file(&self, file: &StoredFile) -> bool {
        match self.remove(file) {
            Ok(()) => {
                debug!(path = %file.path.display(), "Deleted temp file");
                true
            }
            Err(e) => {
                error!(path = %file.path.display(), error = %e, "Failed to delete temp file");
                false
            }
        }
    }

    /// Look up a file by name without touching the filesystem.
    ///
    /// Names that could escape the directory are rejected.
    pub fn resolve(&self, name: &str) -> Result<StoredFile> {
        if !is_plain_file_name(name) {
            return Err(StashError::MalformedReference(format!(
                "invalid file name '{name}'"
            )));
        }
        Ok(StoredFile {
            path: self.dir.join(name),
        })
    }

    /// `true` if `file` lives directly inside the reserved directory.
    pub fn contains(&self, file: &StoredFile) -> bool {
        file.path.parent() == Some(self.dir.as_path()) && is_plain_file_name(file.name())
    }

    fn ensure_directory(&self) {
        if self.dir.is_dir() {
            return;
        }
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            error!(dir = %self.dir.display(), error = %e, "Error creating temp directory");
        }
    }
}

/// A single path component that is not `.` or `..`.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store_in(tmp: &tempfile::TempDir) -> TempFileStore {
        TempFileStore::new(tmp.path().join("decrypted"), "decrypted-")
    }

    #[test]
    fn test_create_file_makes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        assert!(!store.directory().exists());

        let file = store.create_file().unwrap();
        assert!(store.directory().is_dir());
        assert!(file.path().exists());
        assert!(file.name().starts_with("decrypted-"));
        assert!(file.name().ends_with(".tmp"));
        assert!(store.contains(&file));
    }

    #[test]
    fn test_create_file_unique_names() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        let a = store.create_file().unwrap();
        let b = store.create_file().unwrap();
        assert_ne!(a.name(), b.name());
        assert_eq!(store.list_files().len(), 2);
    }

    #[test]
    fn test_create_file_fails_when_directory_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("decrypted");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let store = TempFileStore::new(&blocker, "decrypted-");

        let err = store.create_file().unwrap_err();
        assert!(matches!(err, StashError::Io { .. }));
    }

    #[test]
    fn test_list_files_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        assert!(store.list_files().is_empty());
    }

    #[test]
    fn test_writer_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        let file = store.create_file().unwrap();
        {
            let mut w = file.writer().unwrap();
            w.write_all(b"payload").unwrap();
        }
        assert_eq!(file.len().unwrap(), 7);

        assert!(store.delete_file(&file));
        assert!(!file.path().exists());
        assert!(!store.delete_file(&file), "second delete fails softly");
        assert!(matches!(file.modified(), Err(StashError::NotFound(_))));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        for bad in ["", ".", "..", "../secret", "a/b", "a\\b"] {
            assert!(
                matches!(store.resolve(bad), Err(StashError::MalformedReference(_))),
                "'{bad}' should be rejected"
            );
        }
        let ok = store.resolve("decrypted-x.tmp").unwrap();
        assert_eq!(ok.path(), store.directory().join("decrypted-x.tmp"));
    }
}
