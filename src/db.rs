//! The storage engine: memtable rotation, background flush, compaction
//! triggering and manifest publication.
//!
//! Writes go to the active memtable. Once it outgrows the configured
//! threshold it is swapped onto an immutable FIFO under a short write lock
//! and the flush worker is signalled; `put` never waits for a flush. Reads
//! walk the active table, then the immutable queue newest-first, then the
//! latest manifest.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};

use crate::cache::{BlockCache, CacheStats};
use crate::config::DbConfig;
use crate::error::{Error, IResult};
use crate::manifest::Manifest;
use crate::memtable::MemTable;
use crate::sstable::{Sst, SstOptions};

enum FlushSignal {
    MemTable,
    Shutdown,
}

struct MemState {
    active: Arc<MemTable>,
    /// Oldest first; the flush worker drains from the front.
    immutables: VecDeque<Arc<MemTable>>,
}

struct DbInner {
    config: DbConfig,
    mem: RwLock<MemState>,
    manifest: RwLock<Arc<Manifest>>,
    cache: Option<Arc<BlockCache>>,
    next_sst_id: AtomicU64,
    flush_tx: Sender<FlushSignal>,
    /// Set when a background flush failed; the engine stays readable but
    /// refuses further writes.
    poisoned: AtomicBool,
    closed: AtomicBool,
}

pub struct DB {
    inner: Arc<DbInner>,
    flush_worker: Option<JoinHandle<()>>,
}

impl DB {
    pub fn open(config: DbConfig) -> IResult<DB> {
        std::fs::create_dir_all(&config.dir)?;
        let cache = if config.enable_block_cache {
            Some(Arc::new(BlockCache::new(config.block_cache)))
        } else {
            None
        };
        let opts = SstOptions {
            block_size: config.block_size,
            compression: config.compression,
        };
        let manifest = Manifest::open(
            &config.dir,
            opts,
            config.level_thresholds.clone(),
            cache.clone(),
        )?;
        let next_sst_id = AtomicU64::new(manifest.max_sst_id());

        let (flush_tx, flush_rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(DbInner {
            config,
            mem: RwLock::new(MemState {
                active: Arc::new(MemTable::new()),
                immutables: VecDeque::new(),
            }),
            manifest: RwLock::new(Arc::new(manifest)),
            cache,
            next_sst_id,
            flush_tx,
            poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let worker_inner = inner.clone();
        let flush_worker = std::thread::Builder::new()
            .name("shoalkv-flush".into())
            .spawn(move || flush_loop(worker_inner, flush_rx))?;

        Ok(DB {
            inner,
            flush_worker: Some(flush_worker),
        })
    }

    /// Writes into the active memtable, rotating it onto the immutable
    /// queue when it crosses the flush threshold. Never blocks on I/O.
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> IResult<()> {
        self.check_writable()?;
        let inner = &self.inner;
        let (key, value) = (key.into(), value.into());
        {
            let mem = inner.mem.read().unwrap();
            mem.active.put(key, value);
            if mem.active.byte_size() <= inner.config.memtable_max_size {
                return Ok(());
            }
        }
        let mut mem = inner.mem.write().unwrap();
        // Another writer may have rotated while we upgraded the lock.
        if mem.active.byte_size() > inner.config.memtable_max_size {
            let full = std::mem::replace(&mut mem.active, Arc::new(MemTable::new()));
            mem.immutables.push_back(full);
            let _ = inner.flush_tx.send(FlushSignal::MemTable);
        }
        Ok(())
    }

    /// Removes the key from the active memtable only. No tombstone exists
    /// in the on-disk format, so values already flushed are unaffected.
    pub fn delete(&self, key: &[u8]) -> IResult<bool> {
        self.check_writable()?;
        let mem = self.inner.mem.read().unwrap();
        Ok(mem.active.delete(key))
    }

    pub fn get(&self, key: &[u8]) -> IResult<Option<Bytes>> {
        {
            let mem = self.inner.mem.read().unwrap();
            if let Some(value) = mem.active.get(key) {
                return Ok(Some(value));
            }
            for table in mem.immutables.iter().rev() {
                if let Some(value) = table.get(key) {
                    return Ok(Some(value));
                }
            }
        }
        let manifest = self.inner.manifest.read().unwrap().clone();
        manifest.get(key)
    }

    /// The directory this engine persists into.
    pub fn dir(&self) -> &Path {
        &self.inner.config.dir
    }

    /// A snapshot of the current manifest; callers holding it keep every
    /// SST it references alive.
    pub fn manifest(&self) -> Arc<Manifest> {
        self.inner.manifest.read().unwrap().clone()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.inner.cache.as_ref().map(|c| c.stats())
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
    }

    fn check_writable(&self) -> IResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        if self.inner.poisoned.load(Ordering::Acquire) {
            return Err(Error::Background(
                "a previous flush failed; engine is read-only".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        {
            let mut mem = self.inner.mem.write().unwrap();
            if !mem.active.is_empty() {
                let last = std::mem::replace(&mut mem.active, Arc::new(MemTable::new()));
                mem.immutables.push_back(last);
            }
        }
        let _ = self.inner.flush_tx.send(FlushSignal::Shutdown);
        if let Some(worker) = self.flush_worker.take() {
            let _ = worker.join();
        }
        let manifest = self.inner.manifest.read().unwrap().clone();
        if let Err(e) = manifest.save() {
            tracing::error!(error = %e, "failed to save manifest on shutdown");
        }
    }
}

fn flush_loop(inner: Arc<DbInner>, rx: Receiver<FlushSignal>) {
    for signal in rx.iter() {
        let shutdown = matches!(signal, FlushSignal::Shutdown);
        if !inner.poisoned.load(Ordering::Acquire) {
            if let Err(e) = drain_immutables(&inner) {
                tracing::error!(error = %e, "flush failed, refusing further writes");
                inner.poisoned.store(true, Ordering::Release);
            }
        }
        if shutdown {
            break;
        }
    }
}

/// Flushes queued immutable memtables oldest-first, one SST per table.
/// Each flushed table stays visible to readers until its SST is published.
fn drain_immutables(inner: &DbInner) -> IResult<()> {
    loop {
        let table = {
            let mem = inner.mem.read().unwrap();
            match mem.immutables.front() {
                Some(table) => table.clone(),
                None => return Ok(()),
            }
        };

        if !table.is_empty() {
            let id = inner.next_sst_id.fetch_add(1, Ordering::SeqCst) + 1;
            let opts = SstOptions {
                block_size: inner.config.block_size,
                compression: inner.config.compression,
            };
            let sst = Sst::from_memtable(&inner.config.dir, id, &opts, &table)?;
            if let Some(cache) = &inner.cache {
                sst.attach_cache(cache.clone());
            }
            tracing::info!(
                sst = id,
                entries = table.len(),
                bytes = sst.binary_size(),
                "flushed memtable"
            );

            let mut manifest = inner.manifest.write().unwrap();
            let mut next = manifest.insert_and_update(sst);
            if next.can_compact() {
                next.size_tiered_compaction(&inner.next_sst_id)?;
            }
            *manifest = Arc::new(next);
        }

        let mut mem = inner.mem.write().unwrap();
        mem.immutables.pop_front();
    }
}
