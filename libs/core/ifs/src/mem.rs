//! In-memory filesystem for tests.

use crate::{Fs, FsError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// In-memory [`Fs`] keyed by path. Clones share the same files.
#[derive(Clone, Debug, Default)]
pub struct MemFs {
    files: Arc<RwLock<HashMap<PathBuf, Vec<u8>>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_file(self, path: impl Into<PathBuf>, contents: impl AsRef<[u8]>) -> Self {
        self.insert(path, contents);
        self
    }

    /// Store `contents` at `path`, replacing any previous file.
    pub fn insert(&self, path: impl Into<PathBuf>, contents: impl AsRef<[u8]>) {
        self.files
            .write()
            .insert(path.into(), contents.as_ref().to_vec());
    }

    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        self.files.write().remove(path.as_ref()).is_some()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl Fs for MemFs {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, FsError> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::not_found(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_inserted_file() {
        let fs = MemFs::new().with_file("/certs/ca.pem", "ca");

        assert_eq!(fs.read_file(Path::new("/certs/ca.pem")).unwrap(), b"ca");
        assert_eq!(fs.len(), 1);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let fs = MemFs::new();
        let err = fs.read_file(Path::new("/certs/missing.pem")).unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(err.path(), Path::new("/certs/missing.pem"));
    }

    #[test]
    fn test_clones_share_files() {
        let fs = MemFs::new();
        let other = fs.clone();
        other.insert("/k.pem", "key");

        assert_eq!(fs.read_file(Path::new("/k.pem")).unwrap(), b"key");
        assert!(fs.remove("/k.pem"));
        assert!(other.is_empty());
    }
}
