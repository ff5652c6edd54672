use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error returned by [`Fs`](crate::Fs) implementations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    /// The path the failed operation was acting on.
    pub fn path(&self) -> &Path {
        match self {
            FsError::Read { path, .. } => path,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            FsError::Read { source, .. } => source.kind() == io::ErrorKind::NotFound,
        }
    }

    pub(crate) fn not_found(path: PathBuf) -> Self {
        FsError::Read {
            path,
            source: io::Error::new(io::ErrorKind::NotFound, "file does not exist"),
        }
    }
}
