//! Host file system adapter contract.
//!
//! The encrypting stack never touches the OS directly; everything below it
//! goes through these traits. An adapter provides byte-addressable files,
//! directory enumeration and basic metadata. The POSIX extras are optional:
//! the default implementations fail with `NotSupported`, which the layers
//! above surface as `ENOSYS`.

use std::path::Path;

use veil_core::{DirEntry, FileAttrs, VeilError, VeilResult};

/// One open host file with positional I/O.
///
/// `read_at` and `write_at` may be short; retry policy lives in the layer
/// above ([`crate::fileio::RawFile`]).
pub trait HostFile: Send {
    fn attrs(&self) -> VeilResult<FileAttrs>;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> VeilResult<usize>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> VeilResult<usize>;

    fn truncate(&mut self, size: u64) -> VeilResult<()>;

    /// `data_only` requests an fdatasync-style flush.
    fn sync(&self, data_only: bool) -> VeilResult<()>;

    fn is_writable(&self) -> bool;
}

impl std::fmt::Debug for dyn HostFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn HostFile").finish_non_exhaustive()
    }
}

/// Directory enumeration, `.` and `..` excluded.
pub trait DirIter: Iterator<Item = VeilResult<DirEntry>> + Send {}

impl<T: Iterator<Item = VeilResult<DirEntry>> + Send> DirIter for T {}

/// The host file system.
///
/// Paths handed to an adapter are always ciphertext paths under the vault
/// root; the adapter needs no knowledge of the encryption above it.
pub trait HostFs: Send + Sync {
    fn open_dir(&self, path: &Path) -> VeilResult<Box<dyn DirIter>>;

    /// Open (optionally creating) a file. Opening with `writable` yields a
    /// handle whose `is_writable` reports true.
    fn open_file(&self, path: &Path, writable: bool, create: bool)
        -> VeilResult<Box<dyn HostFile>>;

    fn mkdir(&self, path: &Path) -> VeilResult<()>;
    fn rmdir(&self, path: &Path) -> VeilResult<()>;
    fn unlink(&self, path: &Path) -> VeilResult<()>;
    fn rename(&self, from: &Path, to: &Path) -> VeilResult<()>;

    /// Stat without following a final symlink; symlink resolution (and
    /// target decryption) happens in the directory layer.
    fn get_attrs(&self, path: &Path) -> VeilResult<FileAttrs>;

    /// Update access/modification times (seconds since the epoch); `None`
    /// leaves a field unchanged.
    fn set_times(&self, path: &Path, atime: Option<i64>, mtime: Option<i64>) -> VeilResult<()>;

    // Optional POSIX extensions.

    fn symlink(&self, target: &str, link: &Path) -> VeilResult<()> {
        let _ = (target, link);
        Err(VeilError::NotSupported)
    }

    fn readlink(&self, path: &Path) -> VeilResult<String> {
        let _ = path;
        Err(VeilError::NotSupported)
    }

    fn link(&self, from: &Path, to: &Path) -> VeilResult<()> {
        let _ = (from, to);
        Err(VeilError::NotSupported)
    }

    fn mknod(&self, path: &Path, mode: u32, dev: u64) -> VeilResult<()> {
        let _ = (path, mode, dev);
        Err(VeilError::NotSupported)
    }

    fn chmod(&self, path: &Path, mode: u32) -> VeilResult<()> {
        let _ = (path, mode);
        Err(VeilError::NotSupported)
    }
}
