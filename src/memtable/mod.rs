//! The in-memory mutable top tier of the LSM tree.

pub mod skiplist;

use bytes::Bytes;

use self::skiplist::{SkipList, SkipListIter};

/// The active (or rotated-out immutable) write buffer.
///
/// All writes land here first. When [`MemTable::byte_size`] crosses the
/// engine's flush threshold the table is moved onto the immutable queue and
/// the flush worker turns it into one SST.
pub struct MemTable {
    list: SkipList,
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    pub fn new() -> Self {
        MemTable {
            list: SkipList::new(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.list.get(key)
    }

    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.list.put(key, value)
    }

    /// Removes the key from this table. No tombstone: the deletion does not
    /// shadow older values already persisted in SSTs.
    pub fn delete(&self, key: &[u8]) -> bool {
        self.list.delete(key)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Sum of key and value lengths, the flush-threshold metric.
    pub fn byte_size(&self) -> usize {
        self.list.byte_size()
    }

    /// Ascending iterator over all entries.
    pub fn iter(&self) -> SkipListIter<'_> {
        self.list.iter()
    }
}
