//! Block alignment engine.
//!
//! Arbitrary `(offset, len)` requests are aligned onto fixed-size cipher
//! blocks; partial writes become read-modify-write, extending writes pad
//! the hole (or leave it sparse when holes are allowed), and a one-block
//! cache short-circuits the common read-after-write pattern.
//!
//! The engine is shared by the cipher and MAC layers through [`BlockOps`]:
//! a layer supplies single-block transforms plus a size/truncate view of
//! its base, and gets full read/write/truncate semantics back.

use tracing::debug;
use veil_core::VeilResult;

/// One-block scratch cache: `len == 0` means empty.
pub(crate) struct BlockCache {
    pub offset: u64,
    pub len: usize,
    pub data: Vec<u8>,
}

impl BlockCache {
    pub fn new(block_size: usize) -> Self {
        Self {
            offset: 0,
            len: 0,
            data: vec![0u8; block_size],
        }
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }

    pub fn store(&mut self, offset: u64, data: &[u8]) {
        self.data[..data.len()].copy_from_slice(data);
        self.offset = offset;
        self.len = data.len();
    }
}

/// Single-block interface a layer exposes to the engine.
///
/// `read_one_block` / `write_one_block` get block-aligned offsets and at
/// most one block of data. `wrapped_size` is the file size as seen at this
/// layer (headers already subtracted).
pub(crate) trait BlockOps {
    fn block_size(&self) -> usize;
    fn allow_holes(&self) -> bool;
    fn cache_mut(&mut self) -> &mut BlockCache;

    fn read_one_block(&mut self, offset: u64, buf: &mut [u8]) -> VeilResult<usize>;
    fn write_one_block(&mut self, offset: u64, data: &[u8]) -> VeilResult<()>;

    fn wrapped_size(&mut self) -> VeilResult<u64>;

    /// Truncate the layer's base to hold `size` user bytes. Only invoked
    /// by [`block_truncate`] when the caller asks for it.
    fn truncate_base(&mut self, size: u64) -> VeilResult<()> {
        let _ = size;
        Ok(())
    }
}

/// Serve one block through the cache, reading a full block on a miss.
///
/// A hit requires the exact offset; the cache may hold fewer valid bytes
/// than requested because reads always fetch whole blocks.
pub(crate) fn cached_read_block<O: BlockOps + ?Sized>(
    ops: &mut O,
    offset: u64,
    buf: &mut [u8],
) -> VeilResult<usize> {
    let bs = ops.block_size();

    {
        let cache = ops.cache_mut();
        if cache.offset == offset && cache.len > 0 {
            let n = cache.len.min(buf.len());
            buf[..n].copy_from_slice(&cache.data[..n]);
            return Ok(n);
        }
        cache.clear();
    }

    // reuse the cache's own buffer as the full-block scratch
    let mut scratch = std::mem::take(&mut ops.cache_mut().data);
    scratch.resize(bs, 0);
    let result = ops.read_one_block(offset, &mut scratch);

    let n = match &result {
        Ok(n) => *n,
        Err(_) => 0,
    };
    let cache = ops.cache_mut();
    cache.data = scratch;
    if n > 0 {
        cache.offset = offset;
        cache.len = n;
    }
    let n = result?;

    let take = n.min(buf.len());
    buf[..take].copy_from_slice(&ops.cache_mut().data[..take]);
    Ok(take)
}

/// Write one block, keeping the cache coherent with what lands on disk.
pub(crate) fn cached_write_block<O: BlockOps + ?Sized>(
    ops: &mut O,
    offset: u64,
    data: &[u8],
) -> VeilResult<()> {
    ops.cache_mut().store(offset, data);
    let result = ops.write_one_block(offset, data);
    if result.is_err() {
        ops.cache_mut().clear();
    }
    result
}

/// Read `buf.len()` bytes starting at `offset`, stopping early at EOF.
pub(crate) fn read<O: BlockOps + ?Sized>(
    ops: &mut O,
    offset: u64,
    buf: &mut [u8],
) -> VeilResult<usize> {
    let bs = ops.block_size();
    let mut partial = (offset % bs as u64) as usize;
    let mut block = offset / bs as u64;

    // aligned single-block request: serve as-is
    if partial == 0 && buf.len() <= bs {
        return cached_read_block(ops, offset, buf);
    }

    let mut tmp: Vec<u8> = Vec::new();
    let mut pos = 0usize;

    while pos < buf.len() {
        let block_off = block * bs as u64;
        let want = buf.len() - pos;

        let read_size = if partial == 0 && want >= bs {
            // full aligned block: read directly into the caller's buffer
            cached_read_block(ops, block_off, &mut buf[pos..pos + bs])?
        } else {
            if tmp.is_empty() {
                tmp.resize(bs, 0);
            }
            let n = cached_read_block(ops, block_off, &mut tmp)?;
            if n > partial {
                let cpy = (n - partial).min(want);
                buf[pos..pos + cpy].copy_from_slice(&tmp[partial..partial + cpy]);
            }
            n
        };

        if read_size <= partial {
            break; // didn't get enough bytes
        }
        let cpy = (read_size - partial).min(want);
        pos += cpy;
        block += 1;
        partial = 0;

        if read_size < bs {
            break;
        }
    }

    Ok(pos)
}

/// Write `data` at `offset`, merging with existing blocks and padding any
/// hole between the current EOF and the write position.
pub(crate) fn write<O: BlockOps + ?Sized>(
    ops: &mut O,
    offset: u64,
    data: &[u8],
) -> VeilResult<()> {
    let bs = ops.block_size();
    let file_size = ops.wrapped_size()?;

    let mut block = offset / bs as u64;
    let mut partial = (offset % bs as u64) as usize;

    // last block of the file, for testing overlap with the boundary
    let last_file_block = file_size / bs as u64;
    let last_block_size = (file_size % bs as u64) as usize;
    let last_non_empty = last_file_block as i64 - i64::from(last_block_size == 0);

    if offset > file_size {
        // extend the file first so the gap reads as zeros
        pad_file(ops, file_size, offset, false)?;
    }

    // edge cases the single-block path handles as-is
    if partial == 0 && data.len() <= bs {
        // a full block, or a partial tail covering at least what's there
        if data.len() == bs || (block == last_file_block && data.len() >= last_block_size) {
            return cached_write_block(ops, offset, data);
        }
    }

    // have to merge with existing block(s)
    let mut tmp: Vec<u8> = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let block_off = block * bs as u64;
        let to_copy = (bs - partial).min(data.len() - pos);

        if to_copy == bs || (partial == 0 && block_off + to_copy as u64 >= file_size) {
            // whole block, or fresh bytes past EOF: write straight through
            cached_write_block(ops, block_off, &data[pos..pos + to_copy])?;
        } else {
            if tmp.is_empty() {
                tmp.resize(bs, 0);
            }
            tmp.fill(0);

            let valid = if block as i64 > last_non_empty {
                // brand-new block past the old EOF: just pad
                partial + to_copy
            } else {
                let n = cached_read_block(ops, block_off, &mut tmp)?;
                // extend if the write reaches past the current tail
                n.max(partial + to_copy)
            };

            tmp[partial..partial + to_copy].copy_from_slice(&data[pos..pos + to_copy]);
            cached_write_block(ops, block_off, &tmp[..valid])?;
        }

        pos += to_copy;
        block += 1;
        partial = 0;
    }

    Ok(())
}

/// Extend the file from `old_size` to `new_size` with zeros.
///
/// The old tail block is completed to full length; intermediate blocks are
/// zero-written unless holes are allowed; the new tail is only written when
/// `force_write` is set (a following write would pad it anyway).
pub(crate) fn pad_file<O: BlockOps + ?Sized>(
    ops: &mut O,
    old_size: u64,
    new_size: u64,
    force_write: bool,
) -> VeilResult<()> {
    let bs = ops.block_size();
    let mut old_last = old_size / bs as u64;
    let new_last = new_size / bs as u64;
    let new_tail_len = (new_size % bs as u64) as usize;

    let mut buf = vec![0u8; bs];

    if old_last == new_last {
        // the eventual write will read-modify-write the tail anyway
        if force_write {
            let old_tail_len = (old_size % bs as u64) as usize;
            if new_tail_len > 0 {
                let block_off = old_last * bs as u64;
                cached_read_block(ops, block_off, &mut buf[..old_tail_len])?;
                cached_write_block(ops, block_off, &buf[..new_tail_len])?;
            }
        }
        return Ok(());
    }

    // 1. complete the old tail block to full length
    let old_tail_len = (old_size % bs as u64) as usize;
    if old_tail_len != 0 {
        debug!(block = old_last, "padding tail block");
        let block_off = old_last * bs as u64;
        cached_read_block(ops, block_off, &mut buf[..old_tail_len])?;
        cached_write_block(ops, block_off, &buf[..bs])?;
        old_last += 1;
    }

    // 2. zero the blocks in between, unless the layout may keep holes
    if !ops.allow_holes() {
        while old_last != new_last {
            debug!(block = old_last, "padding block");
            buf.fill(0);
            cached_write_block(ops, old_last * bs as u64, &buf[..bs])?;
            old_last += 1;
        }
    }

    // 3. the new tail, only when forced and non-empty
    if force_write && new_tail_len > 0 {
        buf.fill(0);
        cached_write_block(ops, new_last * bs as u64, &buf[..new_tail_len])?;
    }

    Ok(())
}

/// Truncate to `size` user bytes.
///
/// Growing delegates to the base first (so the host can allocate sparse
/// space) and then pads. Shrinking to mid-block re-encodes the new tail:
/// it was written under the old layout and would not decode otherwise.
pub(crate) fn block_truncate<O: BlockOps + ?Sized>(
    ops: &mut O,
    size: u64,
    with_base: bool,
) -> VeilResult<()> {
    let bs = ops.block_size();
    let partial = (size % bs as u64) as usize;
    let old_size = ops.wrapped_size()?;

    if size > old_size {
        if with_base {
            ops.truncate_base(size)?;
        }
        pad_file(ops, old_size, size, true)?;
    } else if size == old_size {
        // nothing to do
    } else if partial > 0 {
        // read the new tail under the old layout, shrink, re-write it
        let block_off = (size / bs as u64) * bs as u64;
        let mut buf = vec![0u8; bs];
        cached_read_block(ops, block_off, &mut buf)?;
        if with_base {
            ops.truncate_base(size)?;
        }
        cached_write_block(ops, block_off, &buf[..partial])?;
    } else {
        ops.cache_mut().clear(); // cached tail is past the new EOF
        if with_base {
            ops.truncate_base(size)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileio::FileIo;
    use crate::memfile::MemFile;

    /// Pass-through layer: blocks map 1:1 onto a memory file, no
    /// transformation. Exercises the engine in isolation.
    struct PlainBlocks {
        base: MemFile,
        cache: BlockCache,
        bs: usize,
        holes: bool,
    }

    impl PlainBlocks {
        fn new(bs: usize, holes: bool) -> Self {
            Self {
                base: MemFile::new(),
                cache: BlockCache::new(bs),
                bs,
                holes,
            }
        }
    }

    impl BlockOps for PlainBlocks {
        fn block_size(&self) -> usize {
            self.bs
        }
        fn allow_holes(&self) -> bool {
            self.holes
        }
        fn cache_mut(&mut self) -> &mut BlockCache {
            &mut self.cache
        }
        fn read_one_block(&mut self, offset: u64, buf: &mut [u8]) -> VeilResult<usize> {
            self.base.read(offset, buf)
        }
        fn write_one_block(&mut self, offset: u64, data: &[u8]) -> VeilResult<()> {
            self.base.write(offset, data)
        }
        fn wrapped_size(&mut self) -> VeilResult<u64> {
            Ok(self.base.get_attrs()?.size)
        }
        fn truncate_base(&mut self, size: u64) -> VeilResult<()> {
            self.base.truncate(size)
        }
    }

    const BS: usize = 64;

    #[test]
    fn aligned_single_block_roundtrip() {
        let mut ops = PlainBlocks::new(BS, false);
        write(&mut ops, 0, &[0xAA; BS]).unwrap();

        let mut buf = [0u8; BS];
        assert_eq!(read(&mut ops, 0, &mut buf).unwrap(), BS);
        assert_eq!(buf, [0xAA; BS]);
    }

    #[test]
    fn cache_serves_repeat_reads() {
        let mut ops = PlainBlocks::new(BS, false);
        write(&mut ops, 0, &[7u8; BS]).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(read(&mut ops, 0, &mut buf).unwrap(), 16);
        // clobber the backing store; a cache hit won't notice
        ops.base.write(0, &[0u8; BS]).unwrap();
        assert_eq!(read(&mut ops, 0, &mut buf).unwrap(), 16);
        assert_eq!(buf, [7u8; 16]);
    }

    #[test]
    fn straddling_write_merges_blocks() {
        let mut ops = PlainBlocks::new(BS, false);
        write(&mut ops, 0, &[0xAA; BS]).unwrap();
        write(&mut ops, (BS - 8) as u64, &[0xBB; 16]).unwrap();

        let mut buf = vec![0u8; BS + 8];
        assert_eq!(read(&mut ops, 0, &mut buf).unwrap(), BS + 8);
        assert!(buf[..BS - 8].iter().all(|&b| b == 0xAA));
        assert!(buf[BS - 8..].iter().all(|&b| b == 0xBB));
        assert_eq!(ops.wrapped_size().unwrap(), (BS + 8) as u64);
    }

    #[test]
    fn unaligned_read_across_blocks() {
        let mut ops = PlainBlocks::new(BS, false);
        let data: Vec<u8> = (0..3 * BS).map(|i| i as u8).collect();
        write(&mut ops, 0, &data).unwrap();

        let mut buf = vec![0u8; BS];
        assert_eq!(read(&mut ops, 17, &mut buf).unwrap(), BS);
        assert_eq!(buf[..], data[17..17 + BS]);
    }

    #[test]
    fn extending_write_zero_fills_gap() {
        let mut ops = PlainBlocks::new(BS, false);
        write(&mut ops, 0, b"start").unwrap();
        write(&mut ops, (3 * BS) as u64, b"end").unwrap();

        let size = ops.wrapped_size().unwrap() as usize;
        assert_eq!(size, 3 * BS + 3);

        let mut buf = vec![0xFFu8; size];
        assert_eq!(read(&mut ops, 0, &mut buf).unwrap(), size);
        assert_eq!(&buf[..5], b"start");
        assert!(buf[5..3 * BS].iter().all(|&b| b == 0), "gap must read zero");
        assert_eq!(&buf[3 * BS..], b"end");
    }

    #[test]
    fn hole_mode_skips_intermediate_blocks() {
        let mut ops = PlainBlocks::new(BS, true);
        write(&mut ops, 0, &[1u8; BS]).unwrap();
        let before = ops.base.len();
        pad_file(&mut ops, BS as u64, (5 * BS) as u64, false).unwrap();
        // nothing written for the middle blocks
        assert_eq!(ops.base.len(), before);
    }

    #[test]
    fn pad_without_force_skips_same_block_tail() {
        let mut ops = PlainBlocks::new(BS, false);
        write(&mut ops, 0, &[1u8; 10]).unwrap();
        pad_file(&mut ops, 10, 20, false).unwrap();
        // same block, not forced: underlying file untouched
        assert_eq!(ops.base.len(), 10);
    }

    #[test]
    fn truncate_grow_pads_with_zeros() {
        let mut ops = PlainBlocks::new(BS, false);
        write(&mut ops, 0, &[9u8; 10]).unwrap();
        block_truncate(&mut ops, (BS + 10) as u64, true).unwrap();

        assert_eq!(ops.wrapped_size().unwrap(), (BS + 10) as u64);
        let mut buf = vec![0xFFu8; BS + 10];
        assert_eq!(read(&mut ops, 0, &mut buf).unwrap(), BS + 10);
        assert!(buf[..10].iter().all(|&b| b == 9));
        assert!(buf[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn truncate_shrink_keeps_partial_tail() {
        let mut ops = PlainBlocks::new(BS, false);
        let data: Vec<u8> = (0..2 * BS).map(|i| i as u8).collect();
        write(&mut ops, 0, &data).unwrap();

        block_truncate(&mut ops, (BS + 7) as u64, true).unwrap();
        assert_eq!(ops.wrapped_size().unwrap(), (BS + 7) as u64);

        let mut buf = vec![0u8; 2 * BS];
        let n = read(&mut ops, 0, &mut buf).unwrap();
        assert_eq!(n, BS + 7);
        assert_eq!(buf[..n], data[..n]);
    }

    #[test]
    fn truncate_to_same_size_is_noop() {
        let mut ops = PlainBlocks::new(BS, false);
        write(&mut ops, 0, &[3u8; 40]).unwrap();
        block_truncate(&mut ops, 40, true).unwrap();
        assert_eq!(ops.wrapped_size().unwrap(), 40);
    }

    #[test]
    fn read_at_eof_returns_zero() {
        let mut ops = PlainBlocks::new(BS, false);
        write(&mut ops, 0, &[1u8; 10]).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(read(&mut ops, 10, &mut buf).unwrap(), 0);
    }
}
