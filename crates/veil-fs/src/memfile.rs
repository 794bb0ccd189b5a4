//! In-memory `FileIo` used by layer unit tests.

use veil_core::{FileAttrs, FileKind, VeilResult};

use crate::fileio::FileIo;

pub(crate) struct MemFile {
    buf: Vec<u8>,
}

impl MemFile {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

/// `MemFile` behind a shared handle, so a test can reopen "the same file"
/// with a fresh stack or tamper with its bytes out-of-band.
#[derive(Clone)]
pub(crate) struct SharedMemFile {
    buf: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    writable: bool,
}

impl SharedMemFile {
    pub fn new() -> Self {
        Self {
            buf: Default::default(),
            writable: true,
        }
    }

    pub fn read_only(&self) -> Self {
        Self {
            buf: self.buf.clone(),
            writable: false,
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }

    pub fn corrupt(&self, offset: usize, xor: u8) {
        self.buf.lock().unwrap()[offset] ^= xor;
    }
}

impl FileIo for SharedMemFile {
    fn get_attrs(&self) -> VeilResult<FileAttrs> {
        Ok(FileAttrs {
            kind: FileKind::Regular,
            size: self.buf.lock().unwrap().len() as u64,
            mtime: 0,
            file_id: 0,
            posix: None,
        })
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> VeilResult<usize> {
        let data = self.buf.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> VeilResult<()> {
        if !self.writable {
            return Err(veil_core::VeilError::NotWritable);
        }
        let mut buf = self.buf.lock().unwrap();
        let offset = offset as usize;
        if buf.len() < offset + data.len() {
            buf.resize(offset + data.len(), 0);
        }
        buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> VeilResult<()> {
        if !self.writable {
            return Err(veil_core::VeilError::NotWritable);
        }
        self.buf.lock().unwrap().resize(size as usize, 0);
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn sync(&mut self, _data_only: bool) -> VeilResult<()> {
        Ok(())
    }
}

impl FileIo for MemFile {
    fn get_attrs(&self) -> VeilResult<FileAttrs> {
        Ok(FileAttrs {
            kind: FileKind::Regular,
            size: self.buf.len() as u64,
            mtime: 0,
            file_id: 0,
            posix: None,
        })
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> VeilResult<usize> {
        let offset = offset as usize;
        if offset >= self.buf.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.buf.len() - offset);
        buf[..n].copy_from_slice(&self.buf[offset..offset + n]);
        Ok(n)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> VeilResult<()> {
        let offset = offset as usize;
        if self.buf.len() < offset + data.len() {
            self.buf.resize(offset + data.len(), 0);
        }
        self.buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> VeilResult<()> {
        self.buf.resize(size as usize, 0);
        Ok(())
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn sync(&mut self, _data_only: bool) -> VeilResult<()> {
        Ok(())
    }
}
