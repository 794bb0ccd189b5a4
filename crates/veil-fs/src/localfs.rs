//! Local-disk implementation of the host adapter.
//!
//! Thin wrappers over `std::fs` plus unix positional I/O. Attribute
//! lookups do not follow final symlinks: symlink handling (decrypting the
//! target) is the directory layer's job.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirEntryExt, FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use veil_core::{DirEntry, FileAttrs, FileKind, PosixAttrs, VeilError, VeilResult};

use crate::hostfs::{DirIter, HostFile, HostFs};

pub struct LocalFs;

/// Lift `io::Error` into the domain taxonomy, keeping raw OS codes.
fn map_io(err: io::Error) -> VeilError {
    match err.raw_os_error() {
        Some(libc::ENOENT) => VeilError::NotFound,
        Some(libc::EISDIR) => VeilError::IsDirectory,
        _ => VeilError::Io(err),
    }
}

fn attrs_of(meta: &std::fs::Metadata) -> FileAttrs {
    let kind = if meta.file_type().is_dir() {
        FileKind::Directory
    } else if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else if meta.file_type().is_file() {
        FileKind::Regular
    } else {
        FileKind::Unknown
    };

    FileAttrs {
        kind,
        size: meta.len(),
        mtime: meta.mtime(),
        file_id: meta.ino(),
        posix: Some(PosixAttrs {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
        }),
    }
}

fn c_path(path: &Path) -> VeilResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| VeilError::InvalidArgument(format!("path contains NUL: {}", path.display())))
}

pub struct LocalFile {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl HostFile for LocalFile {
    fn attrs(&self) -> VeilResult<FileAttrs> {
        Ok(attrs_of(&self.file.metadata().map_err(map_io)?))
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> VeilResult<usize> {
        self.file.read_at(buf, offset).map_err(map_io)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> VeilResult<usize> {
        self.file.write_at(buf, offset).map_err(map_io)
    }

    fn truncate(&mut self, size: u64) -> VeilResult<()> {
        if self.writable {
            self.file.set_len(size).map_err(map_io)?;
            self.file.sync_data().map_err(map_io)
        } else {
            // read-only handle: truncate through the path instead
            OpenOptions::new()
                .write(true)
                .open(&self.path)
                .map_err(map_io)?
                .set_len(size)
                .map_err(map_io)
        }
    }

    fn sync(&self, data_only: bool) -> VeilResult<()> {
        if data_only {
            self.file.sync_data().map_err(map_io)
        } else {
            self.file.sync_all().map_err(map_io)
        }
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

impl HostFs for LocalFs {
    fn open_dir(&self, path: &Path) -> VeilResult<Box<dyn DirIter>> {
        let entries = std::fs::read_dir(path).map_err(map_io)?;
        let iter = entries.map(|entry| {
            let entry = entry.map_err(map_io)?;
            let kind = entry.file_type().ok().map(|t| {
                if t.is_dir() {
                    FileKind::Directory
                } else if t.is_symlink() {
                    FileKind::Symlink
                } else if t.is_file() {
                    FileKind::Regular
                } else {
                    FileKind::Unknown
                }
            });
            Ok(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                file_id: entry.ino(),
                kind,
            })
        });
        Ok(Box::new(iter))
    }

    fn open_file(
        &self,
        path: &Path,
        writable: bool,
        create: bool,
    ) -> VeilResult<Box<dyn HostFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(create && writable)
            .open(path)
            .map_err(map_io)?;
        Ok(Box::new(LocalFile {
            file,
            path: path.to_path_buf(),
            writable,
        }))
    }

    fn mkdir(&self, path: &Path) -> VeilResult<()> {
        std::fs::create_dir(path).map_err(map_io)
    }

    fn rmdir(&self, path: &Path) -> VeilResult<()> {
        std::fs::remove_dir(path).map_err(map_io)
    }

    fn unlink(&self, path: &Path) -> VeilResult<()> {
        std::fs::remove_file(path).map_err(map_io)
    }

    fn rename(&self, from: &Path, to: &Path) -> VeilResult<()> {
        std::fs::rename(from, to).map_err(map_io)
    }

    fn get_attrs(&self, path: &Path) -> VeilResult<FileAttrs> {
        Ok(attrs_of(&std::fs::symlink_metadata(path).map_err(map_io)?))
    }

    fn set_times(&self, path: &Path, atime: Option<i64>, mtime: Option<i64>) -> VeilResult<()> {
        fn spec(t: Option<i64>) -> libc::timespec {
            match t {
                Some(sec) => libc::timespec {
                    tv_sec: sec,
                    tv_nsec: 0,
                },
                None => libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
            }
        }

        let cpath = c_path(path)?;
        let times = [spec(atime), spec(mtime)];
        let res = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                cpath.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if res < 0 {
            return Err(map_io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn symlink(&self, target: &str, link: &Path) -> VeilResult<()> {
        std::os::unix::fs::symlink(target, link).map_err(map_io)
    }

    fn readlink(&self, path: &Path) -> VeilResult<String> {
        let target = std::fs::read_link(path).map_err(map_io)?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn link(&self, from: &Path, to: &Path) -> VeilResult<()> {
        std::fs::hard_link(from, to).map_err(map_io)
    }

    fn mknod(&self, path: &Path, mode: u32, dev: u64) -> VeilResult<()> {
        let cpath = c_path(path)?;
        let res = unsafe { libc::mknod(cpath.as_ptr(), mode as libc::mode_t, dev as libc::dev_t) };
        if res < 0 {
            return Err(map_io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> VeilResult<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(map_io)
    }
}
