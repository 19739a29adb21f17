//! SST: the immutable on-disk sorted string table.
//!
//! ```text
//!     +------------+-------------+-------------+-----+
//!     | IndexBlock | DataBlock 0 | DataBlock 1 | ... |
//!     +------------+-------------+-------------+-----+
//!
//!     IndexBlock: [index_size u64][block_count u64]
//!                 then per block [offset u64][key_len u64][first_key]
//! ```
//!
//! Index entries are sorted by `first_key`; `offset` is the absolute file
//! offset of the corresponding data block. The file is written once and
//! reopened through a shared memory mapping; every in-memory structure
//! refers to the mapping by offset, never by pointer, so views stay valid
//! for as long as the `Sst` handle (an `Arc` around the mapping) lives.

pub mod block;

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use memmap::Mmap;

use crate::cache::BlockCache;
use crate::compress::CompressionConfig;
use crate::error::{Error, IResult};
use crate::memtable::MemTable;
use crate::util::coding::{decode_fixed_64, put_fixed_64};
use self::block::{decode_block, BlockBuilder, DataBlock};

/// Build-time knobs an SST needs from the engine config.
#[derive(Debug, Clone)]
pub struct SstOptions {
    pub block_size: usize,
    pub compression: CompressionConfig,
}

impl Default for SstOptions {
    fn default() -> Self {
        SstOptions {
            block_size: 16 * 1024,
            compression: CompressionConfig::default(),
        }
    }
}

pub fn sst_file_name(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}.sst", id))
}

struct IndexEntry {
    offset: u64,
    first_key: Bytes,
}

struct SstInner {
    id: u64,
    path: PathBuf,
    mmap: Mmap,
    file_size: usize,
    index: Vec<IndexEntry>,
    first_key: Bytes,
    last_key: Bytes,
    compression: CompressionConfig,
    cache: OnceLock<Arc<BlockCache>>,
    obsolete: AtomicBool,
}

/// A shared handle to one table. Cloning is cheap; the mapping and the
/// file live until the last handle drops (and the file is deleted then if
/// compaction made it obsolete).
#[derive(Clone)]
pub struct Sst {
    inner: Arc<SstInner>,
}

impl Sst {
    /// Builds an SST file from an ascending entry stream and opens it.
    pub fn build<I>(dir: &Path, id: u64, opts: &SstOptions, entries: I) -> IResult<Sst>
    where
        I: IntoIterator<Item = (Bytes, Bytes)>,
    {
        let mut blocks: Vec<Vec<u8>> = vec![];
        let mut first_keys: Vec<Bytes> = vec![];
        let mut builder = BlockBuilder::new();
        for (key, value) in entries {
            if builder.is_empty() {
                first_keys.push(key.clone());
            }
            builder.add(key, value);
            if builder.estimated_size() >= opts.block_size {
                blocks.push(builder.finish(&opts.compression)?);
            }
        }
        if !builder.is_empty() {
            blocks.push(builder.finish(&opts.compression)?);
        }
        assert!(!blocks.is_empty(), "[Sst] refusing to build an empty table");

        let index_size: usize = 16 + first_keys.iter().map(|k| 16 + k.len()).sum::<usize>();
        let total: usize = index_size + blocks.iter().map(Vec::len).sum::<usize>();
        let mut buf = Vec::with_capacity(total);
        put_fixed_64(&mut buf, index_size as u64);
        put_fixed_64(&mut buf, blocks.len() as u64);
        let mut offset = index_size as u64;
        for (block, key) in blocks.iter().zip(&first_keys) {
            put_fixed_64(&mut buf, offset);
            put_fixed_64(&mut buf, key.len() as u64);
            buf.extend_from_slice(key);
            offset += block.len() as u64;
        }
        debug_assert_eq!(buf.len(), index_size);
        for block in &blocks {
            buf.extend_from_slice(block);
        }

        let path = sst_file_name(dir, id);
        fs::write(&path, &buf)?;
        Sst::open(dir, id, opts.compression)
    }

    /// Builds an SST from one (immutable) memtable.
    pub fn from_memtable(
        dir: &Path,
        id: u64,
        opts: &SstOptions,
        memtable: &MemTable,
    ) -> IResult<Sst> {
        Sst::build(dir, id, opts, memtable.iter())
    }

    /// Opens and maps an existing table, verifying the index and every
    /// block header against the file bounds.
    pub fn open(dir: &Path, id: u64, compression: CompressionConfig) -> IResult<Sst> {
        let path = sst_file_name(dir, id);
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let data: &[u8] = &mmap;
        let file_size = data.len();
        if file_size < 32 {
            return Err(Error::Corruption(format!(
                "{}: file too short to be an sst",
                path.display()
            )));
        }

        let index_size = decode_fixed_64(data) as usize;
        let block_count = decode_fixed_64(&data[8..]) as usize;
        if index_size < 16 || index_size > file_size || block_count == 0 {
            return Err(Error::Corruption(format!(
                "{}: bad index header (size {}, blocks {})",
                path.display(),
                index_size,
                block_count
            )));
        }

        let mut index = Vec::with_capacity(block_count);
        let mut pos = 16usize;
        for _ in 0..block_count {
            if pos + 16 > index_size {
                return Err(Error::Corruption(format!(
                    "{}: index entry overruns index block",
                    path.display()
                )));
            }
            let offset = decode_fixed_64(&data[pos..]);
            let key_len = decode_fixed_64(&data[pos + 8..]) as usize;
            pos += 16;
            if pos + key_len > index_size {
                return Err(Error::Corruption(format!(
                    "{}: index key overruns index block",
                    path.display()
                )));
            }
            let first_key = Bytes::copy_from_slice(&data[pos..pos + key_len]);
            pos += key_len;
            if let Some(prev) = index.last() {
                let prev: &IndexEntry = prev;
                if prev.first_key >= first_key {
                    return Err(Error::Corruption(format!(
                        "{}: index first keys are not strictly ascending",
                        path.display()
                    )));
                }
            }
            index.push(IndexEntry { offset, first_key });
        }
        if pos != index_size {
            return Err(Error::Corruption(format!(
                "{}: index block has {} trailing bytes",
                path.display(),
                index_size - pos
            )));
        }

        // Validate that every advertised block lies inside the file.
        for entry in &index {
            let off = entry.offset as usize;
            if off < index_size || off + 8 > file_size {
                return Err(Error::Corruption(format!(
                    "{}: block offset {} out of bounds",
                    path.display(),
                    off
                )));
            }
            let size = decode_fixed_64(&data[off..]) as usize;
            if off + 8 + size > file_size {
                return Err(Error::Corruption(format!(
                    "{}: block at {} advertises {} bytes past end of file",
                    path.display(),
                    off,
                    size
                )));
            }
        }

        let first_key = index[0].first_key.clone();
        let mut inner = SstInner {
            id,
            path,
            mmap,
            file_size,
            index,
            first_key,
            last_key: Bytes::new(),
            compression,
            cache: OnceLock::new(),
            obsolete: AtomicBool::new(false),
        };
        let last = inner.decode_block_at(inner.index.len() - 1)?;
        let last = DataBlock::parse(last)?;
        if last.entry_count() == 0 {
            return Err(Error::Corruption(format!(
                "{}: empty trailing data block",
                inner.path.display()
            )));
        }
        inner.last_key = last.entry(last.entry_count() - 1).0;
        Ok(Sst {
            inner: Arc::new(inner),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Total file size; the unit of the compaction thresholds.
    pub fn binary_size(&self) -> usize {
        self.inner.file_size
    }

    pub fn first_key(&self) -> &Bytes {
        &self.inner.first_key
    }

    pub fn last_key(&self) -> &Bytes {
        &self.inner.last_key
    }

    pub fn block_count(&self) -> usize {
        self.inner.index.len()
    }

    /// Attaches a block cache. Later reads fill and consult it; at most one
    /// cache can ever be attached.
    pub fn attach_cache(&self, cache: Arc<BlockCache>) {
        let _ = self.inner.cache.set(cache);
    }

    /// Deletes the backing file once the last handle drops.
    pub fn mark_obsolete(&self) {
        self.inner.obsolete.store(true, Ordering::Release);
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> IResult<Option<Bytes>> {
        let Some(block_idx) = self.candidate_block(key) else {
            return Ok(None);
        };
        let block = self.load_block(block_idx, true)?;
        Ok(block.get(key))
    }

    /// The block whose range may contain `key`: the one with the greatest
    /// first key <= `key`.
    fn candidate_block(&self, key: &[u8]) -> Option<usize> {
        let index = &self.inner.index;
        let after = index.partition_point(|e| e.first_key.as_ref() <= key);
        after.checked_sub(1)
    }

    fn load_block(&self, block_idx: usize, fill_cache: bool) -> IResult<DataBlock> {
        let offset = self.inner.index[block_idx].offset;
        if let Some(cache) = self.inner.cache.get() {
            if let Some(decoded) = cache.get(self.inner.id, offset) {
                return DataBlock::parse(decoded);
            }
            let decoded = self.inner.decode_block_at(block_idx)?;
            if fill_cache {
                cache.put(self.inner.id, offset, decoded.clone());
            }
            DataBlock::parse(decoded)
        } else {
            DataBlock::parse(self.inner.decode_block_at(block_idx)?)
        }
    }

    /// Materializes block `i` into the attached cache. Returns false when
    /// no cache is attached or the cache rejected the block.
    pub fn prefetch_block(&self, block_idx: usize) -> IResult<bool> {
        let Some(cache) = self.inner.cache.get() else {
            return Ok(false);
        };
        if block_idx >= self.inner.index.len() {
            return Ok(false);
        }
        let offset = self.inner.index[block_idx].offset;
        if cache.get(self.inner.id, offset).is_some() {
            return Ok(true);
        }
        let decoded = self.inner.decode_block_at(block_idx)?;
        Ok(cache.put(self.inner.id, offset, decoded))
    }

    /// Prefetches up to `count` blocks starting at `start`. Returns how
    /// many ended up cached.
    pub fn prefetch_blocks(&self, start: usize, count: usize) -> IResult<usize> {
        let mut prefetched = 0;
        for i in start..(start + count).min(self.inner.index.len()) {
            if self.prefetch_block(i)? {
                prefetched += 1;
            }
        }
        Ok(prefetched)
    }

    pub fn prefetch_all(&self) -> IResult<usize> {
        self.prefetch_blocks(0, self.inner.index.len())
    }

    /// Forward iterator over all entries. Bypasses the block cache so bulk
    /// scans (compaction) do not wash the LRU out.
    pub fn iter(&self) -> SstIter {
        SstIter {
            sst: self.clone(),
            block_idx: 0,
            block: None,
            entry_idx: 0,
        }
    }
}

impl SstInner {
    /// Reads and decodes the block body at index position `block_idx`.
    fn decode_block_at(&self, block_idx: usize) -> IResult<Bytes> {
        let offset = self.index[block_idx].offset as usize;
        let data: &[u8] = &self.mmap;
        let size = decode_fixed_64(&data[offset..]) as usize;
        decode_block(&data[offset + 8..offset + 8 + size], &self.compression)
    }
}

impl Drop for SstInner {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove obsolete sst");
            }
        }
    }
}

/// Streaming cursor over one SST, block by block.
pub struct SstIter {
    sst: Sst,
    block_idx: usize,
    block: Option<DataBlock>,
    entry_idx: usize,
}

impl SstIter {
    pub fn next_entry(&mut self) -> IResult<Option<(Bytes, Bytes)>> {
        loop {
            if self.block.is_none() {
                if self.block_idx >= self.sst.inner.index.len() {
                    return Ok(None);
                }
                let decoded = self.sst.inner.decode_block_at(self.block_idx)?;
                self.block = Some(DataBlock::parse(decoded)?);
                self.entry_idx = 0;
            }
            let block = self.block.as_ref().unwrap();
            if self.entry_idx < block.entry_count() {
                let entry = block.entry(self.entry_idx);
                self.entry_idx += 1;
                return Ok(Some(entry));
            }
            self.block = None;
            self.block_idx += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::compress::CompressionType;
    use crate::config::BlockCacheConfig;
    use tempfile::TempDir;

    fn pairs(n: usize) -> Vec<(Bytes, Bytes)> {
        (0..n)
            .map(|i| {
                (
                    Bytes::from(format!("key-{:06}", i)),
                    Bytes::from(format!("value-{:06}", i)),
                )
            })
            .collect()
    }

    fn small_block_opts(compression: CompressionConfig) -> SstOptions {
        SstOptions {
            block_size: 256,
            compression,
        }
    }

    #[test]
    fn test_build_then_iterate_echoes_input() {
        let dir = TempDir::new().unwrap();
        let input = pairs(500);
        let sst = Sst::build(
            dir.path(),
            1,
            &small_block_opts(CompressionConfig::disabled()),
            input.clone(),
        )
        .unwrap();
        assert!(sst.block_count() > 1, "input should span several blocks");

        let mut iter = sst.iter();
        let mut output = vec![];
        while let Some(entry) = iter.next_entry().unwrap() {
            output.push(entry);
        }
        assert_eq!(input, output);
    }

    #[test]
    fn test_point_lookups() {
        let dir = TempDir::new().unwrap();
        let sst = Sst::build(
            dir.path(),
            7,
            &small_block_opts(CompressionConfig::disabled()),
            pairs(300),
        )
        .unwrap();
        for i in (0..300).step_by(13) {
            let key = format!("key-{:06}", i);
            assert_eq!(
                sst.get(key.as_bytes()).unwrap(),
                Some(Bytes::from(format!("value-{:06}", i)))
            );
        }
        assert_eq!(sst.get(b"key-999999").unwrap(), None);
        assert_eq!(sst.get(b"aaa").unwrap(), None);
        assert_eq!(sst.first_key(), &Bytes::from_static(b"key-000000"));
        assert_eq!(sst.last_key(), &Bytes::from_static(b"key-000299"));
    }

    #[test]
    fn test_single_entry_table() {
        let dir = TempDir::new().unwrap();
        let sst = Sst::build(
            dir.path(),
            1,
            &SstOptions::default(),
            vec![(Bytes::from_static(b"only"), Bytes::from_static(b"one"))],
        )
        .unwrap();
        assert_eq!(sst.block_count(), 1);
        assert_eq!(sst.get(b"only").unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(sst.get(b"other").unwrap(), None);
        assert_eq!(sst.first_key(), sst.last_key());
    }

    #[test]
    fn test_compressed_round_trip_and_reopen() {
        let dir = TempDir::new().unwrap();
        for (id, codec) in [(1u64, CompressionType::Lz4), (2, CompressionType::Snappy)] {
            let cfg = CompressionConfig {
                codec,
                enable: true,
                min_size_for_compression: 64,
            };
            let input = pairs(400);
            {
                Sst::build(dir.path(), id, &small_block_opts(cfg), input.clone()).unwrap();
            }
            let sst = Sst::open(dir.path(), id, cfg).unwrap();
            let mut iter = sst.iter();
            let mut output = vec![];
            while let Some(entry) = iter.next_entry().unwrap() {
                output.push(entry);
            }
            assert_eq!(input, output);
        }
    }

    #[test]
    fn test_reopen_sees_same_data() {
        let dir = TempDir::new().unwrap();
        let opts = small_block_opts(CompressionConfig::disabled());
        {
            Sst::build(dir.path(), 3, &opts, pairs(100)).unwrap();
        }
        let sst = Sst::open(dir.path(), 3, CompressionConfig::disabled()).unwrap();
        assert_eq!(
            sst.get(b"key-000042").unwrap(),
            Some(Bytes::from_static(b"value-000042"))
        );
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let opts = small_block_opts(CompressionConfig::disabled());
        let sst = Sst::build(dir.path(), 9, &opts, pairs(200)).unwrap();
        let path = sst_file_name(dir.path(), 9);
        let len = sst.binary_size();
        drop(sst);
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len as u64 - 40).unwrap();
        drop(file);
        assert!(Sst::open(dir.path(), 9, CompressionConfig::disabled()).is_err());
    }

    #[test]
    fn test_block_cache_integration() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(BlockCache::new(BlockCacheConfig {
            min_block_size: 16,
            min_utilization: 0.0,
            ..BlockCacheConfig::default()
        }));
        let sst = Sst::build(
            dir.path(),
            5,
            &small_block_opts(CompressionConfig::disabled()),
            pairs(300),
        )
        .unwrap();
        sst.attach_cache(cache.clone());

        assert_eq!(
            sst.get(b"key-000007").unwrap(),
            Some(Bytes::from_static(b"value-000007"))
        );
        let after_first = cache.stats();
        assert_eq!(after_first.misses, 1);
        assert!(after_first.current_count >= 1);

        assert_eq!(
            sst.get(b"key-000007").unwrap(),
            Some(Bytes::from_static(b"value-000007"))
        );
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_prefetch_all_fills_cache() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(BlockCache::new(BlockCacheConfig {
            min_block_size: 16,
            min_utilization: 0.0,
            ..BlockCacheConfig::default()
        }));
        let sst = Sst::build(
            dir.path(),
            6,
            &small_block_opts(CompressionConfig::disabled()),
            pairs(300),
        )
        .unwrap();
        assert_eq!(sst.prefetch_all().unwrap(), 0); // no cache attached yet
        sst.attach_cache(cache.clone());
        assert_eq!(sst.prefetch_all().unwrap(), sst.block_count());
        assert_eq!(cache.stats().current_count, sst.block_count());
        // Already cached: prefetch reports success without re-reading.
        assert_eq!(sst.prefetch_all().unwrap(), sst.block_count());
    }

    #[test]
    fn test_obsolete_file_removed_on_last_drop() {
        let dir = TempDir::new().unwrap();
        let path = sst_file_name(dir.path(), 11);
        let sst = Sst::build(dir.path(), 11, &SstOptions::default(), pairs(10)).unwrap();
        let clone = sst.clone();
        sst.mark_obsolete();
        drop(sst);
        assert!(path.exists(), "file must survive while a handle lives");
        drop(clone);
        assert!(!path.exists(), "file must be removed with the last handle");
    }
}
