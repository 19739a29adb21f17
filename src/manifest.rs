//! Manifest: the authoritative snapshot of which SSTs exist at each level.
//!
//! Mutations never happen in place on a published manifest. `insert_and_update`
//! returns a fresh copy (levels share `Sst` handles with the old version), the
//! engine publishes it behind its RwLock, and readers that still hold the old
//! `Arc<Manifest>` keep every table they can see alive. Compaction runs on the
//! in-flight copy before it is published.
//!
//! Persisted form, little-endian u64 throughout:
//!
//! ```text
//!     [version][level_count] ([sst_id]... [u64::MAX])  per level
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use priority_queue::PriorityQueue;
use std::cmp::Reverse;

use crate::cache::BlockCache;
use crate::error::{Error, IResult};
use crate::sstable::{Sst, SstIter, SstOptions};
use crate::util::coding::{put_fixed_64, take_fixed_64};

pub const MANIFEST_FILE_NAME: &str = "manifest";

/// Hard cap on the number of levels.
pub const MAX_LEVELS: usize = 5;

const LEVEL_END: u64 = u64::MAX;

/// One tier of the tree.
///
/// Level 0 receives freshly flushed tables, so its SSTs may overlap in key
/// range and are searched newest-first. Every deeper level is range-disjoint
/// and sorted by first key, so a lookup probes exactly one candidate.
#[derive(Clone)]
pub struct Level {
    level: usize,
    ssts: Vec<Sst>,
}

impl Level {
    fn new(level: usize) -> Self {
        Level {
            level,
            ssts: vec![],
        }
    }

    fn get(&self, key: &[u8]) -> IResult<Option<Bytes>> {
        if self.level == 0 {
            for sst in self.ssts.iter().rev() {
                if let Some(value) = sst.get(key)? {
                    return Ok(Some(value));
                }
            }
            Ok(None)
        } else {
            let after = self.ssts.partition_point(|s| s.first_key().as_ref() <= key);
            match after.checked_sub(1) {
                Some(i) => self.ssts[i].get(key),
                None => Ok(None),
            }
        }
    }

    fn insert(&mut self, sst: Sst) {
        self.ssts.push(sst);
    }

    pub fn byte_size(&self) -> u64 {
        self.ssts.iter().map(|s| s.binary_size() as u64).sum()
    }

    pub fn len(&self) -> usize {
        self.ssts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ssts.is_empty()
    }

    pub fn ssts(&self) -> &[Sst] {
        &self.ssts
    }
}

#[derive(Clone)]
pub struct Manifest {
    version: u64,
    levels: Vec<Level>,
    max_sst_id: u64,
    dir: PathBuf,
    opts: SstOptions,
    thresholds: Vec<u64>,
    cache: Option<Arc<BlockCache>>,
}

impl Manifest {
    /// Loads the manifest from `dir`, reopening every referenced SST, or
    /// starts a fresh single-level manifest when none is persisted.
    pub fn open(
        dir: &Path,
        opts: SstOptions,
        thresholds: Vec<u64>,
        cache: Option<Arc<BlockCache>>,
    ) -> IResult<Manifest> {
        assert!(
            !thresholds.is_empty(),
            "[Manifest] at least the level-0 threshold is required"
        );
        let path = dir.join(MANIFEST_FILE_NAME);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Manifest {
                    version: 1,
                    levels: vec![Level::new(0)],
                    max_sst_id: 0,
                    dir: dir.to_path_buf(),
                    opts,
                    thresholds,
                    cache,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if data.len() < 16 {
            return Err(Error::Corruption("manifest header truncated".into()));
        }
        let mut index = 0;
        let version = take_fixed_64(&data, &mut index);
        let level_count = take_fixed_64(&data, &mut index) as usize;
        if level_count > MAX_LEVELS {
            return Err(Error::Corruption(format!(
                "manifest claims {} levels, limit is {}",
                level_count, MAX_LEVELS
            )));
        }

        let mut max_sst_id = 0u64;
        let mut levels = Vec::with_capacity(level_count.max(1));
        for level_no in 0..level_count {
            let mut level = Level::new(level_no);
            loop {
                if index + 8 > data.len() {
                    return Err(Error::Corruption("manifest level list truncated".into()));
                }
                let sst_id = take_fixed_64(&data, &mut index);
                if sst_id == LEVEL_END {
                    break;
                }
                let sst = Sst::open(dir, sst_id, opts.compression)?;
                if let Some(cache) = &cache {
                    sst.attach_cache(cache.clone());
                }
                max_sst_id = max_sst_id.max(sst_id);
                level.insert(sst);
            }
            levels.push(level);
        }
        if levels.is_empty() {
            levels.push(Level::new(0));
        }

        Ok(Manifest {
            version,
            levels,
            max_sst_id,
            dir: dir.to_path_buf(),
            opts,
            thresholds,
            cache,
        })
    }

    /// Serializes the level structure to the well-known manifest file.
    pub fn save(&self) -> IResult<()> {
        let mut buf = vec![];
        put_fixed_64(&mut buf, self.version);
        put_fixed_64(&mut buf, self.levels.len() as u64);
        for level in &self.levels {
            for sst in level.ssts() {
                put_fixed_64(&mut buf, sst.id());
            }
            put_fixed_64(&mut buf, LEVEL_END);
        }
        fs::write(self.dir.join(MANIFEST_FILE_NAME), buf)?;
        Ok(())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn max_sst_id(&self) -> u64 {
        self.max_sst_id
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Layered lookup: the first level that knows the key wins.
    pub fn get(&self, key: &[u8]) -> IResult<Option<Bytes>> {
        for level in &self.levels {
            if let Some(value) = level.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Copy-on-write insert: returns the successor manifest with `sst`
    /// appended to level 0. `self` is left untouched and stays valid for
    /// concurrent readers.
    pub fn insert_and_update(&self, sst: Sst) -> Manifest {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.max_sst_id = next.max_sst_id.max(sst.id());
        next.levels[0].insert(sst);
        next
    }

    /// True when level 0 has outgrown its threshold.
    pub fn can_compact(&self) -> bool {
        self.levels[0].byte_size() > self.thresholds[0]
    }

    /// Size-tiered compaction: starting at level 0, merge any level that
    /// exceeds its threshold into the next one, stopping at the first level
    /// still under its threshold. Each merged level draws a fresh SST id
    /// from `next_sst_id`.
    pub fn size_tiered_compaction(&mut self, next_sst_id: &AtomicU64) -> IResult<()> {
        for level in 0..MAX_LEVELS - 1 {
            if level >= self.levels.len() || level >= self.thresholds.len() {
                break;
            }
            if self.levels[level].byte_size() <= self.thresholds[level] {
                break;
            }
            let id = next_sst_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.compact_level(level, id)?;
        }
        Ok(())
    }

    /// Merges all of level `level` (plus the overlapping part of the next
    /// level) into one new SST on level `level + 1`.
    fn compact_level(&mut self, level: usize, new_id: u64) -> IResult<()> {
        if self.levels[level].is_empty() {
            return Ok(());
        }
        if self.levels.len() == level + 1 {
            self.levels.push(Level::new(level + 1));
        }

        // Sources merge newest-first so that on duplicate keys the younger
        // value survives; the age is the enumeration position.
        let sources: Vec<Sst> = self.levels[level].ssts().iter().rev().cloned().collect();
        let min_key = sources.iter().map(|s| s.first_key()).min().unwrap().clone();
        let max_key = sources.iter().map(|s| s.last_key()).max().unwrap().clone();

        let mut left: Vec<Sst> = vec![];
        let mut overlap: Vec<Sst> = vec![];
        let mut right: Vec<Sst> = vec![];
        for sst in self.levels[level + 1].ssts() {
            if *sst.last_key() < min_key {
                left.push(sst.clone());
            } else if *sst.first_key() > max_key {
                right.push(sst.clone());
            } else {
                overlap.push(sst.clone());
            }
        }

        let merged = merge_newest_wins(sources.iter().chain(overlap.iter()))?;
        let new_sst = Sst::build(&self.dir, new_id, &self.opts, merged)?;
        if let Some(cache) = &self.cache {
            new_sst.attach_cache(cache.clone());
        }
        self.max_sst_id = self.max_sst_id.max(new_id);

        tracing::info!(
            from_level = level,
            sources = sources.len(),
            overlap = overlap.len(),
            new_sst = new_id,
            new_size = new_sst.binary_size(),
            "size-tiered compaction"
        );

        for sst in sources.iter().chain(overlap.iter()) {
            sst.mark_obsolete();
        }

        let mut next_level = left;
        next_level.push(new_sst);
        next_level.extend(right);
        self.levels[level + 1].ssts = next_level;
        self.levels[level].ssts.clear();
        Ok(())
    }
}

/// K-way merge of SST streams keyed by `(key, age)`: the smallest key pops
/// first, and on equal keys the stream enumerated earlier (the newer one)
/// wins while later duplicates are dropped.
fn merge_newest_wins<'a>(ssts: impl Iterator<Item = &'a Sst>) -> IResult<Vec<(Bytes, Bytes)>> {
    let mut iters: Vec<SstIter> = vec![];
    let mut current: Vec<Option<(Bytes, Bytes)>> = vec![];
    let mut queue: PriorityQueue<usize, Reverse<(Bytes, u64)>> = PriorityQueue::new();
    for sst in ssts {
        let slot = iters.len();
        let mut iter = sst.iter();
        match iter.next_entry()? {
            Some((key, value)) => {
                queue.push(slot, Reverse((key.clone(), slot as u64)));
                current.push(Some((key, value)));
            }
            None => current.push(None),
        }
        iters.push(iter);
    }

    let mut merged: Vec<(Bytes, Bytes)> = vec![];
    while let Some((slot, _)) = queue.pop() {
        let (key, value) = current[slot].take().expect("queued slot without entry");
        if merged.last().map_or(true, |(last, _)| *last != key) {
            merged.push((key, value));
        }
        if let Some((next_key, next_value)) = iters[slot].next_entry()? {
            queue.push(slot, Reverse((next_key.clone(), slot as u64)));
            current[slot] = Some((next_key, next_value));
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressionConfig;
    use tempfile::TempDir;

    fn opts() -> SstOptions {
        SstOptions {
            block_size: 256,
            compression: CompressionConfig::disabled(),
        }
    }

    fn thresholds() -> Vec<u64> {
        vec![1024, 10 * 1024 * 1024, 100 * 1024 * 1024]
    }

    fn build_sst(dir: &Path, id: u64, keys: std::ops::Range<usize>, tag: &str) -> Sst {
        let entries = keys.map(|i| {
            (
                Bytes::from(format!("{:06}", i)),
                Bytes::from(format!("{}-{}", tag, i)),
            )
        });
        Sst::build(dir, id, &opts(), entries).unwrap()
    }

    #[test]
    fn test_insert_is_copy_on_write() {
        let dir = TempDir::new().unwrap();
        let base = Manifest::open(dir.path(), opts(), thresholds(), None).unwrap();
        let sst = build_sst(dir.path(), 1, 0..10, "a");
        let next = base.insert_and_update(sst);

        assert_eq!(base.version(), 1);
        assert_eq!(next.version(), 2);
        assert_eq!(base.levels()[0].len(), 0);
        assert_eq!(next.levels()[0].len(), 1);
        assert_eq!(next.max_sst_id(), 1);
        // The old version still answers (with nothing) while the new one
        // sees the table.
        assert_eq!(base.get(b"000003").unwrap(), None);
        assert_eq!(
            next.get(b"000003").unwrap(),
            Some(Bytes::from_static(b"a-3"))
        );
    }

    #[test]
    fn test_level0_searches_newest_first() {
        let dir = TempDir::new().unwrap();
        let base = Manifest::open(dir.path(), opts(), thresholds(), None).unwrap();
        let older = build_sst(dir.path(), 1, 0..20, "old");
        let newer = build_sst(dir.path(), 2, 10..30, "new");
        let manifest = base.insert_and_update(older).insert_and_update(newer);

        assert_eq!(
            manifest.get(b"000005").unwrap(),
            Some(Bytes::from_static(b"old-5"))
        );
        assert_eq!(
            manifest.get(b"000015").unwrap(),
            Some(Bytes::from_static(b"new-15"))
        );
        assert_eq!(
            manifest.get(b"000025").unwrap(),
            Some(Bytes::from_static(b"new-25"))
        );
    }

    #[test]
    fn test_save_load_save_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let base = Manifest::open(dir.path(), opts(), thresholds(), None).unwrap();
        let manifest = base
            .insert_and_update(build_sst(dir.path(), 1, 0..10, "a"))
            .insert_and_update(build_sst(dir.path(), 2, 10..20, "b"));
        manifest.save().unwrap();
        let first = fs::read(dir.path().join(MANIFEST_FILE_NAME)).unwrap();

        let reloaded = Manifest::open(dir.path(), opts(), thresholds(), None).unwrap();
        assert_eq!(reloaded.version(), manifest.version());
        assert_eq!(reloaded.max_sst_id(), 2);
        reloaded.save().unwrap();
        let second = fs::read(dir.path().join(MANIFEST_FILE_NAME)).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            reloaded.get(b"000015").unwrap(),
            Some(Bytes::from_static(b"b-15"))
        );
    }

    #[test]
    fn test_overlap_compaction_newest_wins() {
        let n = 200;
        let dir = TempDir::new().unwrap();
        let base = Manifest::open(dir.path(), opts(), thresholds(), None).unwrap();
        let older = build_sst(dir.path(), 1, 0..n, "old");
        let newer = build_sst(dir.path(), 2, n / 2..3 * n / 2, "new");
        let mut manifest = base.insert_and_update(older).insert_and_update(newer);
        assert!(manifest.can_compact());

        let next_id = AtomicU64::new(manifest.max_sst_id());
        manifest.size_tiered_compaction(&next_id).unwrap();

        assert!(manifest.levels()[0].is_empty());
        assert_eq!(manifest.levels()[1].len(), 1, "one merged table expected");
        let merged = &manifest.levels()[1].ssts()[0];
        assert_eq!(merged.first_key(), &Bytes::from(format!("{:06}", 0)));
        assert_eq!(
            merged.last_key(),
            &Bytes::from(format!("{:06}", 3 * n / 2 - 1))
        );

        // Every key appears exactly once; overlapping keys carry the value
        // from the newer table.
        let mut iter = merged.iter();
        let mut seen = 0;
        let mut prev: Option<Bytes> = None;
        while let Some((key, value)) = iter.next_entry().unwrap() {
            if let Some(prev) = &prev {
                assert!(*prev < key, "duplicate or unsorted key in output");
            }
            let i: usize = std::str::from_utf8(&key).unwrap().parse().unwrap();
            let expect = if i >= n / 2 { "new" } else { "old" };
            assert_eq!(value, Bytes::from(format!("{}-{}", expect, i)));
            prev = Some(key);
            seen += 1;
        }
        assert_eq!(seen, 3 * n / 2);
    }

    #[test]
    fn test_compaction_below_threshold_is_noop() {
        let dir = TempDir::new().unwrap();
        let base = Manifest::open(dir.path(), opts(), thresholds(), None).unwrap();
        let mut manifest = base.insert_and_update(build_sst(dir.path(), 1, 0..500, "a"));
        let next_id = AtomicU64::new(manifest.max_sst_id());
        manifest.size_tiered_compaction(&next_id).unwrap();
        let after_first: Vec<Vec<u64>> = manifest
            .levels()
            .iter()
            .map(|l| l.ssts().iter().map(Sst::id).collect())
            .collect();

        // Level 0 is now empty, far below threshold: compacting again must
        // change nothing.
        manifest.size_tiered_compaction(&next_id).unwrap();
        let after_second: Vec<Vec<u64>> = manifest
            .levels()
            .iter()
            .map(|l| l.ssts().iter().map(Sst::id).collect())
            .collect();
        assert_eq!(after_first, after_second);
        assert!(!manifest.can_compact());
    }

    #[test]
    fn test_disjoint_tables_keep_their_places() {
        let dir = TempDir::new().unwrap();
        let base = Manifest::open(dir.path(), opts(), thresholds(), None).unwrap();
        // Fill level 1 via a first compaction.
        let mut manifest = base.insert_and_update(build_sst(dir.path(), 1, 500..1000, "mid"));
        let next_id = AtomicU64::new(10);
        manifest.size_tiered_compaction(&next_id).unwrap();
        assert_eq!(manifest.levels()[1].len(), 1);

        // A second round with keys entirely to the left must keep the
        // existing level-1 table intact (it is disjoint).
        let manifest = manifest.insert_and_update(build_sst(dir.path(), 2, 0..400, "left"));
        let mut manifest = manifest;
        manifest.size_tiered_compaction(&next_id).unwrap();
        assert_eq!(manifest.levels()[1].len(), 2);
        let firsts: Vec<Bytes> = manifest.levels()[1]
            .ssts()
            .iter()
            .map(|s| s.first_key().clone())
            .collect();
        assert!(firsts.windows(2).all(|w| w[0] < w[1]), "level 1 sorted");
        assert_eq!(
            manifest.get(b"000750").unwrap(),
            Some(Bytes::from_static(b"mid-750"))
        );
        assert_eq!(
            manifest.get(b"000100").unwrap(),
            Some(Bytes::from_static(b"left-100"))
        );
    }
}
