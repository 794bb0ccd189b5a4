//! The per-file I/O interface shared by every layer of the stack, and the
//! bottom layer: `RawFile` over a host file handle.

use tracing::warn;
use veil_core::{FileAttrs, VeilError, VeilResult};

use crate::hostfs::HostFile;

/// One layer of the per-file stack.
///
/// `read` decodes in place into the caller's buffer and returns the byte
/// count (short at EOF). `write` never mutates the caller's data; layers
/// that transform bytes encode into their own scratch blocks.
pub trait FileIo: Send {
    fn get_attrs(&self) -> VeilResult<FileAttrs>;

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> VeilResult<usize>;

    fn write(&mut self, offset: u64, data: &[u8]) -> VeilResult<()>;

    fn truncate(&mut self, size: u64) -> VeilResult<()>;

    fn is_writable(&self) -> bool;

    fn sync(&mut self, data_only: bool) -> VeilResult<()>;
}

/// Byte-addressable file over the host adapter.
///
/// Positional reads pass straight through; writes retry short writes so
/// the layers above see all-or-nothing semantics.
pub struct RawFile {
    inner: Box<dyn HostFile>,
}

/// A short write is retried at the advanced offset this many times before
/// the write fails as an I/O error. Interrupted writes don't count.
const WRITE_RETRIES: u32 = 10;

impl RawFile {
    pub fn new(inner: Box<dyn HostFile>) -> Self {
        Self { inner }
    }
}

impl FileIo for RawFile {
    fn get_attrs(&self) -> VeilResult<FileAttrs> {
        self.inner.attrs()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> VeilResult<usize> {
        self.inner.read_at(offset, buf)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> VeilResult<()> {
        if !self.inner.is_writable() {
            return Err(VeilError::NotWritable);
        }

        let mut remaining = data;
        let mut offset = offset;
        let mut retries = WRITE_RETRIES;

        while !remaining.is_empty() && retries > 0 {
            let written = match self.inner.write_at(offset, remaining) {
                Ok(n) => n,
                Err(VeilError::Io(err)) if err.kind() == std::io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(err) => return Err(err),
            };
            remaining = &remaining[written..];
            offset += written as u64;
            retries -= 1;
        }

        if !remaining.is_empty() {
            warn!(
                wrote = data.len() - remaining.len(),
                requested = data.len(),
                "write incomplete, max retries reached"
            );
            return Err(VeilError::from_errno(libc::EIO));
        }
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> VeilResult<()> {
        self.inner.truncate(size)
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn sync(&mut self, data_only: bool) -> VeilResult<()> {
        self.inner.sync(data_only)
    }
}
