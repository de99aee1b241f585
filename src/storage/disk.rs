//! Disk Storage Module
//!
//! Content-addressed backing store on the filesystem. Each key maps to one
//! file named by its content address plus a fixed suffix, all in a single
//! root directory. The root defaults to a per-user data directory but can
//! be overridden through configuration.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use super::hasher;
use crate::error::Result;

/// Suffix appended to every backing file so unrelated files in the root
/// directory are never counted or deleted.
pub const CACHE_ENTRY_SUFFIX: &str = ".cache_entry";

// == Disk Storage ==
/// Filesystem-backed store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Creates a store rooted at `root`. The directory is created lazily by
    /// write paths; read paths treat a missing root as empty.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default root: the platform data directory, then the executable's
    /// stem, then `data_cache`. Falls back to a relative path when the
    /// platform reports no data directory.
    pub fn default_root() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        let app = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.file_stem().map(|stem| stem.to_os_string()))
            .unwrap_or_else(|| "memstash".into());
        base.join(app).join("data_cache")
    }

    /// The configured root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves the backing file path for `key`.
    ///
    /// # Errors
    /// `Internal` if the key cannot be serialized for hashing.
    pub fn path_for<K>(&self, key: &K) -> Result<PathBuf>
    where
        K: Serialize + ?Sized,
    {
        let address = hasher::content_address(key)?;
        Ok(self.root.join(format!("{}{}", address, CACHE_ENTRY_SUFFIX)))
    }

    /// Counts backing files currently on disk. A missing root directory
    /// counts as zero.
    ///
    /// # Errors
    /// `Io` for filesystem failures other than a missing root.
    pub fn count(&self) -> Result<usize> {
        let dir = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut count = 0;
        for item in dir {
            let item = item?;
            if item
                .file_name()
                .to_string_lossy()
                .ends_with(CACHE_ENTRY_SUFFIX)
            {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Writes `bytes` as the backing file for `key`, creating the root
    /// directory if needed.
    ///
    /// # Errors
    /// `Io` for filesystem failures.
    pub fn write<K>(&self, key: &K, bytes: &[u8]) -> Result<()>
    where
        K: Serialize + ?Sized,
    {
        std::fs::create_dir_all(&self.root)?;
        let path = self.path_for(key)?;
        std::fs::write(&path, bytes)?;
        debug!(path = %path.display(), "wrote backing file");
        Ok(())
    }

    /// Reads the backing file for `key`, if present.
    ///
    /// # Errors
    /// `Io` for filesystem failures other than a missing file.
    pub fn read<K>(&self, key: &K) -> Result<Option<Vec<u8>>>
    where
        K: Serialize + ?Sized,
    {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes the backing file for `key`. Returns whether a file existed.
    ///
    /// # Errors
    /// `Io` for filesystem failures other than a missing file.
    pub fn remove<K>(&self, key: &K) -> Result<bool>
    where
        K: Serialize + ?Sized,
    {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

impl Default for DiskStorage {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn temp_storage() -> (tempfile::TempDir, DiskStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path().join("data_cache"));
        (dir, storage)
    }

    #[test]
    fn test_missing_root_counts_zero() {
        let (_dir, storage) = temp_storage();
        assert_eq!(storage.count().unwrap(), 0);
    }

    #[test]
    fn test_write_read_remove_roundtrip() {
        let (_dir, storage) = temp_storage();
        storage.write("key1", b"payload").unwrap();

        assert_eq!(storage.read("key1").unwrap(), Some(b"payload".to_vec()));
        assert_eq!(storage.count().unwrap(), 1);

        assert!(storage.remove("key1").unwrap());
        assert!(!storage.remove("key1").unwrap());
        assert_eq!(storage.read("key1").unwrap(), None);
        assert_eq!(storage.count().unwrap(), 0);
    }

    #[test]
    fn test_count_ignores_foreign_files() {
        let (_dir, storage) = temp_storage();
        storage.write("key1", b"payload").unwrap();
        std::fs::write(storage.root().join("notes.txt"), b"junk").unwrap();

        assert_eq!(storage.count().unwrap(), 1);
    }

    #[test]
    fn test_path_is_stable_and_suffixed() {
        let (_dir, storage) = temp_storage();
        let a = storage.path_for("key1").unwrap();
        let b = storage.path_for("key1").unwrap();
        assert_eq!(a, b);
        assert!(a.to_string_lossy().ends_with(CACHE_ENTRY_SUFFIX));
    }
}
