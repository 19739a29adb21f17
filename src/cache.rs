//! Block cache: a bounded LRU of decoded SST data blocks.
//!
//! Keyed by `(sst_id, block_offset)`. One mutex guards the whole cache; the
//! LRU order lives in an intrusive doubly linked list between two sentinel
//! nodes, so every operation is O(1) plus hashing.

use std::collections::HashMap;
use std::ptr;
use std::sync::Mutex;

use bytes::Bytes;

use crate::config::BlockCacheConfig;

type CacheKey = (u64, u64);

struct LruEntry {
    key: CacheKey,
    data: Bytes,
    prev: *mut LruEntry,
    next: *mut LruEntry,
}

impl LruEntry {
    fn sentinel() -> Box<LruEntry> {
        Box::new(LruEntry {
            key: (0, 0),
            data: Bytes::new(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        })
    }
}

/// Counters exposed by [`BlockCache::stats`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_access: u64,
    pub hits: u64,
    pub misses: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub current_size: usize,
    pub current_count: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.total_access == 0 {
            return 0.0;
        }
        self.hits as f64 / self.total_access as f64
    }
}

struct CacheInner {
    table: HashMap<CacheKey, Box<LruEntry>>,
    /// `head.next` is the most recently used entry.
    head: *mut LruEntry,
    /// `tail.prev` is the eviction candidate.
    tail: *mut LruEntry,
    stats: CacheStats,
}

impl CacheInner {
    fn unlink(&mut self, entry: *mut LruEntry) {
        unsafe {
            (*(*entry).next).prev = (*entry).prev;
            (*(*entry).prev).next = (*entry).next;
        }
    }

    fn push_front(&mut self, entry: *mut LruEntry) {
        unsafe {
            (*entry).next = (*self.head).next;
            (*entry).prev = self.head;
            (*(*entry).next).prev = entry;
            (*self.head).next = entry;
        }
    }

    fn move_to_front(&mut self, entry: *mut LruEntry) {
        self.unlink(entry);
        self.push_front(entry);
    }
}

pub struct BlockCache {
    config: BlockCacheConfig,
    inner: Mutex<CacheInner>,
}

impl BlockCache {
    pub fn new(config: BlockCacheConfig) -> Self {
        let head = Box::into_raw(LruEntry::sentinel());
        let tail = Box::into_raw(LruEntry::sentinel());
        unsafe {
            (*head).next = tail;
            (*tail).prev = head;
        }
        BlockCache {
            config,
            inner: Mutex::new(CacheInner {
                table: HashMap::new(),
                head,
                tail,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Returns the cached block and promotes it to most recently used.
    pub fn get(&self, sst_id: u64, block_offset: u64) -> Option<Bytes> {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.total_access += 1;
        if let Some(entry) = inner.table.get_mut(&(sst_id, block_offset)) {
            let p = entry.as_mut() as *mut LruEntry;
            let data = entry.data.clone();
            inner.move_to_front(p);
            inner.stats.hits += 1;
            Some(data)
        } else {
            inner.stats.misses += 1;
            None
        }
    }

    /// Inserts a block, evicting from the LRU tail until it fits. Returns
    /// false when the block is rejected (empty, oversized, or too small to
    /// be worth the slot).
    pub fn put(&self, sst_id: u64, block_offset: u64, data: Bytes) -> bool {
        if data.is_empty() {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        if data.len() > self.config.max_block_size {
            inner.stats.rejected += 1;
            return false;
        }
        let utilization = data.len() as f64 / self.config.min_block_size as f64;
        if utilization < self.config.min_utilization {
            inner.stats.rejected += 1;
            return false;
        }

        let key = (sst_id, block_offset);
        if let Some(entry) = inner.table.get_mut(&key) {
            let p = entry.as_mut() as *mut LruEntry;
            let old_len = entry.data.len();
            entry.data = data.clone();
            let new_len = data.len();
            inner.move_to_front(p);
            inner.stats.current_size = inner.stats.current_size - old_len + new_len;
            return true;
        }

        self.evict_for(&mut inner, data.len());

        let mut entry = Box::new(LruEntry {
            key,
            data,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        });
        let p = entry.as_mut() as *mut LruEntry;
        inner.stats.current_size += entry.data.len();
        inner.stats.current_count += 1;
        inner.push_front(p);
        inner.table.insert(key, entry);
        true
    }

    fn evict_for(&self, inner: &mut CacheInner, incoming: usize) {
        loop {
            let over_capacity = inner.stats.current_size + incoming > self.config.max_capacity;
            let over_count = self.config.max_block_count > 0
                && inner.stats.current_count + 1 > self.config.max_block_count;
            if !over_capacity && !over_count {
                return;
            }
            let victim = unsafe { (*inner.tail).prev };
            if victim == inner.head {
                return;
            }
            let key = unsafe { (*victim).key };
            inner.unlink(victim);
            let entry = inner
                .table
                .remove(&key)
                .expect("lru list and table out of sync");
            inner.stats.current_size -= entry.data.len();
            inner.stats.current_count -= 1;
            inner.stats.evicted += 1;
        }
    }

    pub fn remove(&self, sst_id: u64, block_offset: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut entry) = inner.table.remove(&(sst_id, block_offset)) {
            inner.unlink(entry.as_mut() as *mut LruEntry);
            inner.stats.current_size -= entry.data.len();
            inner.stats.current_count -= 1;
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let entries: Vec<*mut LruEntry> = inner
            .table
            .values_mut()
            .map(|e| e.as_mut() as *mut LruEntry)
            .collect();
        for p in entries {
            inner.unlink(p);
        }
        inner.table.clear();
        inner.stats.current_size = 0;
        inner.stats.current_count = 0;
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats.clone()
    }

    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock().unwrap();
        let (size, count) = (inner.stats.current_size, inner.stats.current_count);
        inner.stats = CacheStats {
            current_size: size,
            current_count: count,
            ..CacheStats::default()
        };
    }

    pub fn config(&self) -> &BlockCacheConfig {
        &self.config
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        let inner = self.inner.lock().unwrap();
        unsafe {
            let _head = Box::from_raw(inner.head);
            let _tail = Box::from_raw(inner.tail);
        }
    }
}

unsafe impl Send for BlockCache {}

unsafe impl Sync for BlockCache {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BlockCacheConfig {
        BlockCacheConfig {
            max_capacity: 1000,
            min_block_size: 10,
            max_block_size: 500,
            max_block_count: 0,
            min_utilization: 0.5,
        }
    }

    fn block(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = BlockCache::new(test_config());
        assert_eq!(cache.get(1, 0), None);
        assert!(cache.put(1, 0, block(100, 0xaa)));
        assert_eq!(cache.get(1, 0), Some(block(100, 0xaa)));
        assert_eq!(cache.get(1, 8), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.total_access, 3);
        assert_eq!(stats.current_size, 100);
        assert_eq!(stats.current_count, 1);
    }

    #[test]
    fn test_strict_lru_eviction_order() {
        let cache = BlockCache::new(test_config());
        for i in 0..10 {
            assert!(cache.put(1, i * 8, block(100, i as u8)));
        }
        // Full at 1000 bytes. Touch block 0 so it becomes MRU.
        assert!(cache.get(1, 0).is_some());
        // Inserting one more evicts the LRU entry, which is now block 1.
        assert!(cache.put(2, 0, block(100, 0xff)));
        assert!(cache.get(1, 8).is_none());
        assert!(cache.get(1, 0).is_some());
        assert_eq!(cache.stats().evicted, 1);
    }

    #[test]
    fn test_put_rejects_oversized_and_underutilized() {
        let cache = BlockCache::new(test_config());
        assert!(!cache.put(1, 0, block(501, 0))); // > max_block_size
        assert!(!cache.put(1, 0, block(4, 0))); // 4/10 < 0.5 utilization
        assert!(!cache.put(1, 0, Bytes::new()));
        assert_eq!(cache.stats().rejected, 2);
        assert_eq!(cache.stats().current_count, 0);
    }

    #[test]
    fn test_put_replaces_existing_key() {
        let cache = BlockCache::new(test_config());
        assert!(cache.put(1, 0, block(100, 1)));
        assert!(cache.put(1, 0, block(200, 2)));
        assert_eq!(cache.get(1, 0), Some(block(200, 2)));
        let stats = cache.stats();
        assert_eq!(stats.current_count, 1);
        assert_eq!(stats.current_size, 200);
    }

    #[test]
    fn test_max_block_count() {
        let cache = BlockCache::new(BlockCacheConfig {
            max_block_count: 3,
            ..test_config()
        });
        for i in 0..5 {
            assert!(cache.put(1, i * 8, block(10, i as u8)));
        }
        let stats = cache.stats();
        assert_eq!(stats.current_count, 3);
        assert_eq!(stats.evicted, 2);
        assert!(cache.get(1, 0).is_none());
        assert!(cache.get(1, 32).is_some());
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = BlockCache::new(test_config());
        cache.put(1, 0, block(100, 1));
        cache.put(1, 8, block(100, 2));
        assert!(cache.remove(1, 0));
        assert!(!cache.remove(1, 0));
        assert_eq!(cache.stats().current_count, 1);
        cache.clear();
        assert_eq!(cache.stats().current_count, 0);
        assert_eq!(cache.stats().current_size, 0);
        assert!(cache.get(1, 8).is_none());
    }

    #[test]
    fn test_reset_stats_keeps_contents() {
        let cache = BlockCache::new(test_config());
        cache.put(1, 0, block(100, 1));
        cache.get(1, 0);
        cache.reset_stats();
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.total_access, 0);
        assert_eq!(stats.current_count, 1);
        assert_eq!(cache.get(1, 0), Some(block(100, 1)));
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(BlockCache::new(BlockCacheConfig {
            max_capacity: 1 << 20,
            ..test_config()
        }));
        let mut handles = vec![];
        for t in 0..4u64 {
            let cache = cache.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100u64 {
                    cache.put(t, i * 8, Bytes::from(vec![t as u8; 64]));
                    assert_eq!(cache.get(t, i * 8), Some(Bytes::from(vec![t as u8; 64])));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.stats().current_count, 400);
    }
}
