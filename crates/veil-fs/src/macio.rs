//! Per-block authentication: interleaves a MAC + random prefix with data.
//!
//! The user-visible block is `block_size - mac_bytes - rand_bytes` bytes;
//! each on-disk block is laid out `[MAC ‖ RND ‖ data]`. Offsets therefore
//! need remapping between the two coordinate systems:
//!
//! ```text
//! loc_with_header(u)    = u + ceil(u / (bs - h)) * h
//! loc_without_header(d) = d - ceil(d / bs) * h
//! ```
//!
//! Verification compares the low `mac_bytes` bytes of a 64-bit keyed MAC
//! over `[RND ‖ data]` with the stored prefix. With `mac_bytes == 0` the
//! random bytes only salt the layout and no check runs.

use std::sync::Arc;

use tracing::{debug, warn};
use veil_core::{FileAttrs, VaultConfig, VeilError, VeilResult};
use veil_crypto::ContentCipher;

use crate::blockio::{self, BlockCache, BlockOps};
use crate::cipherio::CipherFileIo;
use crate::fileio::FileIo;

pub struct MacFileIo {
    base: CipherFileIo,
    cache: BlockCache,
    cipher: Arc<dyn ContentCipher>,
    mac_bytes: usize,
    rand_bytes: usize,
    warn_only: bool,
    allow_holes: bool,
    data_block_size: usize,
    scratch: Vec<u8>,
}

/// Map a user-data offset to the on-disk offset once headers are
/// interleaved. The header of block `k` sits in front of its data, so even
/// the first data byte lands past `header_size` on disk.
pub(crate) fn loc_with_header(offset: u64, block_size: usize, header_size: usize) -> u64 {
    let block_num = offset.div_ceil((block_size - header_size) as u64);
    offset + block_num * header_size as u64
}

/// Inverse of [`loc_with_header`]: on-disk offset back to user data.
pub(crate) fn loc_without_header(offset: u64, block_size: usize, header_size: usize) -> u64 {
    let block_num = offset.div_ceil(block_size as u64);
    offset - block_num * header_size as u64
}

impl MacFileIo {
    pub fn new(base: CipherFileIo, config: &VaultConfig, cipher: Arc<dyn ContentCipher>) -> Self {
        debug_assert!(config.mac_bytes <= 8);
        debug!(
            block_size = config.block_size,
            mac_bytes = config.mac_bytes,
            rand_bytes = config.rand_bytes,
            "MAC layer enabled"
        );
        Self {
            base,
            cache: BlockCache::new(config.data_block_size()),
            cipher,
            mac_bytes: config.mac_bytes,
            rand_bytes: config.rand_bytes,
            warn_only: config.force_decode,
            allow_holes: config.allow_holes,
            data_block_size: config.data_block_size(),
            scratch: Vec::new(),
        }
    }

    pub fn cipher_io(&self) -> &CipherFileIo {
        &self.base
    }

    pub fn cipher_io_mut(&mut self) -> &mut CipherFileIo {
        &mut self.base
    }

    fn header_size(&self) -> usize {
        self.mac_bytes + self.rand_bytes
    }

    /// On-disk block length at the layer below.
    fn disk_block_size(&self) -> usize {
        self.data_block_size + self.header_size()
    }

    /// Remap a regular file's size from the on-disk to the user view.
    pub fn wrap_attrs(
        data_block_size: usize,
        mac_bytes: usize,
        rand_bytes: usize,
        mut attrs: FileAttrs,
    ) -> FileAttrs {
        if attrs.is_regular() {
            let header_size = mac_bytes + rand_bytes;
            let bs = data_block_size + header_size;
            attrs.size = loc_without_header(attrs.size, bs, header_size);
        }
        attrs
    }

    pub fn wrap_attrs_config(config: &VaultConfig, attrs: FileAttrs) -> FileAttrs {
        Self::wrap_attrs(
            config.data_block_size(),
            config.mac_bytes,
            config.rand_bytes,
            attrs,
        )
    }
}

impl BlockOps for MacFileIo {
    fn block_size(&self) -> usize {
        self.data_block_size
    }

    fn allow_holes(&self) -> bool {
        self.allow_holes
    }

    fn cache_mut(&mut self) -> &mut BlockCache {
        &mut self.cache
    }

    fn read_one_block(&mut self, offset: u64, buf: &mut [u8]) -> VeilResult<usize> {
        debug_assert_eq!(offset % self.data_block_size as u64, 0);
        debug_assert!(buf.len() <= self.data_block_size);

        let header_size = self.header_size();
        let bs = self.disk_block_size();

        let mut block = std::mem::take(&mut self.scratch);
        block.clear();
        block.resize(header_size + buf.len(), 0);

        let disk_off = loc_with_header(offset, bs, header_size);
        let result = self.base.read(disk_off, &mut block);
        let n = match result {
            Ok(n) => n,
            Err(err) => {
                self.scratch = block;
                return Err(err);
            }
        };

        // zero-block pass-through: a hole has no MAC to check
        let skip_block = if self.allow_holes {
            block[..n].iter().all(|&b| b == 0)
        } else {
            self.mac_bytes == 0
        };

        let read_size = if n > header_size {
            if !skip_block {
                let mut mac = self.cipher.mac64(&block[self.mac_bytes..n]);
                let mut mismatch = false;
                for stored in &block[..self.mac_bytes] {
                    if (mac & 0xff) as u8 != *stored {
                        mismatch = true;
                        break;
                    }
                    mac >>= 8;
                }
                if mismatch {
                    let block_num = offset / bs as u64;
                    warn!(block = block_num, "MAC comparison failure");
                    if !self.warn_only {
                        self.scratch = block;
                        return Err(VeilError::MacMismatch);
                    }
                }
            }
            let data_len = n - header_size;
            buf[..data_len].copy_from_slice(&block[header_size..n]);
            data_len
        } else {
            debug!(read = n, offset, "short read inside block header");
            0
        };

        self.scratch = block;
        Ok(read_size)
    }

    fn write_one_block(&mut self, offset: u64, data: &[u8]) -> VeilResult<()> {
        debug_assert_eq!(offset % self.data_block_size as u64, 0);
        debug_assert!(data.len() <= self.data_block_size);

        let header_size = self.header_size();
        let bs = self.disk_block_size();

        let mut block = std::mem::take(&mut self.scratch);
        block.clear();
        block.resize(header_size + data.len(), 0);

        if self.rand_bytes > 0 {
            self.cipher
                .randomize(&mut block[self.mac_bytes..header_size]);
        }
        block[header_size..].copy_from_slice(data);

        if self.mac_bytes > 0 {
            // the MAC covers the random bytes and the data
            let mut mac = self.cipher.mac64(&block[self.mac_bytes..]);
            for slot in &mut block[..self.mac_bytes] {
                *slot = (mac & 0xff) as u8;
                mac >>= 8;
            }
        }

        let disk_off = loc_with_header(offset, bs, header_size);
        let result = self.base.write(disk_off, &block);
        self.scratch = block;
        result
    }

    fn wrapped_size(&mut self) -> VeilResult<u64> {
        Ok(self.get_attrs()?.size)
    }
}

impl FileIo for MacFileIo {
    fn get_attrs(&self) -> VeilResult<FileAttrs> {
        Ok(Self::wrap_attrs(
            self.data_block_size,
            self.mac_bytes,
            self.rand_bytes,
            self.base.get_attrs()?,
        ))
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> VeilResult<usize> {
        blockio::read(self, offset, buf)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> VeilResult<()> {
        blockio::write(self, offset, data)
    }

    fn truncate(&mut self, size: u64) -> VeilResult<()> {
        let header_size = self.header_size();
        let bs = self.disk_block_size();

        blockio::block_truncate(self, size, false)?;
        self.base.truncate(loc_with_header(size, bs, header_size))
    }

    fn is_writable(&self) -> bool {
        self.base.is_writable()
    }

    fn sync(&mut self, data_only: bool) -> VeilResult<()> {
        self.base.sync(data_only)
    }
}
