//! Injectable filesystem access.
//!
//! Certificate and key material is read through the [`Fs`] trait instead of
//! `std::fs` directly, so callers can hand in the real filesystem ([`os()`])
//! or an in-memory store ([`MemFs`]) in tests.
//!
//! ```rust,ignore
//! use ifs::{Fs, MemFs};
//!
//! let fs = MemFs::new().with_file("/certs/client.pem", PEM);
//! let bytes = fs.read_file("/certs/client.pem".as_ref())?;
//! ```

mod error;
mod mem;

pub use error::FsError;
pub use mem::MemFs;

use std::path::Path;
use tracing::trace;

/// Read access to a backing store of files.
pub trait Fs: Send + Sync {
    /// Read the full contents of the file at `path`.
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, FsError>;

    /// Whether this implementation is backed by the operating system.
    fn is_os(&self) -> bool {
        false
    }
}

/// The operating system filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsFs;

impl Fs for OsFs {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, FsError> {
        trace!(path = %path.display(), "Reading file from disk");
        std::fs::read(path).map_err(|source| FsError::Read {
            path: path.to_path_buf(),
            source,
        })
    }

    fn is_os(&self) -> bool {
        true
    }
}

/// The operating system filesystem.
pub fn os() -> OsFs {
    OsFs
}

/// Whether `fs` is the operating system filesystem.
pub fn is_os(fs: &dyn Fs) -> bool {
    fs.is_os()
}

/// Read `path` from `fs`.
pub fn read_file(fs: &dyn Fs, path: impl AsRef<Path>) -> Result<Vec<u8>, FsError> {
    fs.read_file(path.as_ref())
}
