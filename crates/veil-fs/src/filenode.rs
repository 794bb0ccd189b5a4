//! One open file: owns the cipher stack and keeps it in sync with the
//! file's names and per-path IV.
//!
//! A node's mutex covers the whole stack invocation, so two threads
//! touching the same file serialize while independent files proceed in
//! parallel.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};
use veil_core::{FileAttrs, VeilError, VeilResult};

use crate::cipherio::CipherFileIo;
use crate::context::Context;
use crate::fileio::{FileIo, RawFile};
use crate::macio::MacFileIo;
use crate::vault::FsRuntime;

/// The rebuildable per-file stack: `Mac(Cipher(Raw))` when block MACs are
/// configured, `Cipher(Raw)` otherwise.
enum FileStack {
    Cipher(CipherFileIo),
    Mac(MacFileIo),
}

impl FileStack {
    fn io(&mut self) -> &mut dyn FileIo {
        match self {
            FileStack::Cipher(io) => io,
            FileStack::Mac(io) => io,
        }
    }

    fn io_ref(&self) -> &dyn FileIo {
        match self {
            FileStack::Cipher(io) => io,
            FileStack::Mac(io) => io,
        }
    }

    fn cipher(&mut self) -> &mut CipherFileIo {
        match self {
            FileStack::Cipher(io) => io,
            FileStack::Mac(io) => io.cipher_io_mut(),
        }
    }

    fn cipher_ref(&self) -> &CipherFileIo {
        match self {
            FileStack::Cipher(io) => io,
            FileStack::Mac(io) => io.cipher_io(),
        }
    }
}

struct NodeState {
    pname: PathBuf,
    cname: PathBuf,
    stack: FileStack,
}

pub struct FileNode {
    ctx: Arc<Context>,
    runtime: FsRuntime,
    state: Mutex<NodeState>,
}

impl std::fmt::Debug for FileNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileNode").finish_non_exhaustive()
    }
}

/// Offsets past the signed 63-bit band would overflow the block and
/// header arithmetic below; fail closed, like a negative `off_t`.
const MAX_FILE_OFFSET: u64 = i64::MAX as u64;

fn check_range(offset: u64, len: usize) -> VeilResult<()> {
    if len > isize::MAX as usize {
        return Err(VeilError::InvalidArgument(format!(
            "request length out of range: {len}"
        )));
    }
    match offset.checked_add(len as u64) {
        Some(end) if end <= MAX_FILE_OFFSET => Ok(()),
        _ => Err(VeilError::InvalidArgument(format!(
            "file offset out of range: {offset}"
        ))),
    }
}

impl FileNode {
    pub(crate) fn new(
        ctx: Arc<Context>,
        runtime: FsRuntime,
        pname: PathBuf,
        cname: PathBuf,
    ) -> Self {
        let cipher_io = CipherFileIo::new(None, &runtime.config, runtime.cipher.clone());
        let stack = if runtime.config.mac_enabled() {
            FileStack::Mac(MacFileIo::new(
                cipher_io,
                &runtime.config,
                runtime.cipher.clone(),
            ))
        } else {
            FileStack::Cipher(cipher_io)
        };

        Self {
            ctx,
            runtime,
            state: Mutex::new(NodeState {
                pname,
                cname,
                stack,
            }),
        }
    }

    pub fn plaintext_name(&self) -> PathBuf {
        self.state.lock().unwrap().pname.clone()
    }

    pub fn cipher_name(&self) -> PathBuf {
        self.state.lock().unwrap().cname.clone()
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap()
    }

    /// Open (or upgrade) the raw handle. Re-opens the file for writing if
    /// it was opened previously without write access; swapping the base
    /// invalidates any cached header materialization.
    pub fn open(&self, request_write: bool, create: bool) -> VeilResult<()> {
        let mut state = self.lock();
        Self::open_locked(&self.runtime, &mut state, request_write, create)
    }

    fn open_locked(
        runtime: &FsRuntime,
        state: &mut NodeState,
        request_write: bool,
        create: bool,
    ) -> VeilResult<()> {
        let cipher = state.stack.cipher_ref();
        if cipher.has_base() && (cipher.is_writable() || !request_write) {
            return Ok(());
        }

        let raw = runtime
            .host
            .open_file(&state.cname, request_write, create)?;
        state.stack.cipher().set_base(Box::new(RawFile::new(raw)));
        Ok(())
    }

    /// Propagate the per-path IV to the header. Only matters when the
    /// config both chains per-path IVs and writes per-file headers.
    fn set_iv_locked(runtime: &FsRuntime, state: &mut NodeState, iv: u64) -> VeilResult<()> {
        if !(runtime.config.external_iv && runtime.config.per_file_iv) {
            return Ok(());
        }

        // The first adoption records the IV without touching disk. Only an
        // update rewrites the header, and that needs a writable handle;
        // directories have no header at all.
        if state.stack.cipher_ref().has_external_iv() {
            match Self::open_locked(runtime, state, true, false) {
                Ok(()) => {}
                Err(VeilError::IsDirectory) => return Ok(()),
                Err(VeilError::NotFound) => {}
                Err(err) => warn!("open for IV update failed: {err}"),
            }
        }

        state.stack.cipher().set_iv(iv)
    }

    /// Rename bookkeeping: update the stored names and synchronize the
    /// external IV, in the order the caller needs (`set_iv_first` when the
    /// on-disk file is already at its new location). Reverts both names if
    /// the IV update fails.
    pub fn set_name(
        &self,
        pname: Option<&Path>,
        cname: Option<&Path>,
        iv: u64,
        set_iv_first: bool,
    ) -> VeilResult<()> {
        let mut state = self.lock();
        let old_pname = state.pname.clone();
        debug!(cname = %state.cname.display(), iv, "set_name");

        if set_iv_first {
            Self::set_iv_locked(&self.runtime, &mut state, iv)?;
            if let Some(p) = pname {
                state.pname = p.to_path_buf();
            }
            if let Some(c) = cname {
                state.cname = c.to_path_buf();
            }
        } else {
            let old_cname = state.cname.clone();
            if let Some(p) = pname {
                state.pname = p.to_path_buf();
            }
            if let Some(c) = cname {
                state.cname = c.to_path_buf();
            }

            if let Err(err) = Self::set_iv_locked(&self.runtime, &mut state, iv) {
                state.pname = old_pname;
                state.cname = old_cname;
                return Err(err);
            }
        }

        if pname.is_some() {
            self.ctx.rename_node(&old_pname, &state.pname);
        }
        Ok(())
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> VeilResult<usize> {
        check_range(offset, buf.len())?;
        let mut state = self.lock();
        state.stack.io().read(offset, buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> VeilResult<()> {
        check_range(offset, data.len())?;
        let mut state = self.lock();
        state.stack.io().write(offset, data)
    }

    /// Truncate, opening for write first: callers may truncate a path that
    /// was never opened.
    pub fn truncate(&self, size: u64) -> VeilResult<()> {
        check_range(size, 0)?;
        let mut state = self.lock();
        Self::open_locked(&self.runtime, &mut state, true, false)?;
        state.stack.io().truncate(size)
    }

    pub fn sync(&self, data_only: bool) -> VeilResult<()> {
        let mut state = self.lock();
        state.stack.io().sync(data_only)
    }

    pub fn get_attrs(&self) -> VeilResult<FileAttrs> {
        let state = self.lock();
        state.stack.io_ref().get_attrs()
    }

    pub fn get_size(&self) -> VeilResult<u64> {
        Ok(self.get_attrs()?.size)
    }
}

impl Drop for FileNode {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            let pname = std::mem::take(&mut state.pname);
            self.ctx.erase_node(&pname);
        }
    }
}
