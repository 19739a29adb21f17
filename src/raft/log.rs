//! The volatile raft log and its background applier.
//!
//! Entries live in a bounded ring; four counters track progress and always
//! satisfy `start_index <= last_applied <= commited <= index`. Only the
//! commit index is persisted (`raft_log_meta`, 8 bytes little-endian): on
//! restart all four counters resume from it with an empty ring, and the
//! leader re-replicates from there.
//!
//! The applier thread wakes whenever the commit index moves and writes
//! committed entries into the engine in index order. An engine failure at
//! that point means the replicated state machine can no longer follow the
//! log, so it aborts the process.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::db::DB;
use crate::error::IResult;
use crate::raft::message::{Entry, EntryMode};
use crate::util::coding::decode_fixed_64;
use crate::util::ring::RingQueue;

pub const LOG_META_FILE_NAME: &str = "raft_log_meta";

struct LogState {
    ring: RingQueue<Entry>,
    stopped: bool,
}

struct LogShared {
    state: Mutex<LogState>,
    /// Signalled when `commited` advances and on shutdown; the applier and
    /// quorum waiters sleep on it.
    commit_cv: Condvar,
    index: AtomicU64,
    commited: AtomicU64,
    last_applied: AtomicU64,
    start_index: AtomicU64,
}

pub struct RaftLog {
    shared: Arc<LogShared>,
    meta_path: PathBuf,
    applier: Mutex<Option<JoinHandle<()>>>,
}

impl RaftLog {
    /// Opens the log, restoring the persisted commit index, and starts the
    /// applier that feeds committed entries into `db`.
    pub fn open(dir: &Path, capacity: usize, db: Arc<DB>) -> IResult<RaftLog> {
        let meta_path = dir.join(LOG_META_FILE_NAME);
        let commited = match fs::read(&meta_path) {
            Ok(data) if data.len() >= 8 => decode_fixed_64(&data),
            Ok(_) => 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let shared = Arc::new(LogShared {
            state: Mutex::new(LogState {
                ring: RingQueue::with_capacity(capacity),
                stopped: false,
            }),
            commit_cv: Condvar::new(),
            index: AtomicU64::new(commited),
            commited: AtomicU64::new(commited),
            last_applied: AtomicU64::new(commited),
            start_index: AtomicU64::new(commited),
        });

        let applier_shared = shared.clone();
        let applier = std::thread::Builder::new()
            .name("shoalkv-applier".into())
            .spawn(move || apply_loop(applier_shared, db))?;

        Ok(RaftLog {
            shared,
            meta_path,
            applier: Mutex::new(Some(applier)),
        })
    }

    #[inline]
    pub fn index(&self) -> u64 {
        self.shared.index.load(Ordering::Acquire)
    }

    #[inline]
    pub fn commited(&self) -> u64 {
        self.shared.commited.load(Ordering::Acquire)
    }

    #[inline]
    pub fn last_applied(&self) -> u64 {
        self.shared.last_applied.load(Ordering::Acquire)
    }

    #[inline]
    pub fn start_index(&self) -> u64 {
        self.shared.start_index.load(Ordering::Acquire)
    }

    /// Appends a fresh leader-side entry. Returns its index, or None when
    /// the ring is full or the log is shut down.
    pub fn put(&self, key: Bytes, value: Bytes, mode: EntryMode, term: u64) -> Option<u64> {
        let mut state = self.shared.state.lock().unwrap();
        if state.stopped {
            return None;
        }
        let index = self.shared.index.load(Ordering::Acquire) + 1;
        let entry = Entry {
            term,
            index,
            key,
            value,
            mode,
        };
        if !state.ring.push_back(entry) {
            return None;
        }
        self.shared.index.store(index, Ordering::Release);
        Some(index)
    }

    /// Appends a replicated entry carrying its own index and term. The
    /// caller must have verified `entry.index == self.index() + 1`.
    pub fn put_entry(&self, entry: Entry) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.stopped {
            return false;
        }
        debug_assert_eq!(entry.index, self.shared.index.load(Ordering::Acquire) + 1);
        let index = entry.index;
        if !state.ring.push_back(entry) {
            return false;
        }
        self.shared.index.store(index, Ordering::Release);
        true
    }

    /// Random access by absolute log index.
    pub fn at(&self, index: u64) -> Option<Entry> {
        let state = self.shared.state.lock().unwrap();
        let start = self.shared.start_index.load(Ordering::Acquire);
        if index <= start || index > self.shared.index.load(Ordering::Acquire) {
            return None;
        }
        state.ring.at((index - start - 1) as usize).cloned()
    }

    /// Discards the uncommitted suffix so that `index() == target`. Used by
    /// a follower that must realign with the leader.
    pub fn reset(&self, target: u64) {
        let mut state = self.shared.state.lock().unwrap();
        let index = self.shared.index.load(Ordering::Acquire);
        if index > target {
            let removed = state.ring.truncate_back((index - target) as usize) as u64;
            self.shared.index.store(index - removed, Ordering::Release);
        }
    }

    /// `commited = max(commited, min(index, leader_commit))`; wakes the
    /// applier and any quorum waiters when it moves.
    pub fn update_commit(&self, leader_commit: u64) {
        let _state = self.shared.state.lock().unwrap();
        let index = self.shared.index.load(Ordering::Acquire);
        let old = self.shared.commited.load(Ordering::Acquire);
        let new = old.max(index.min(leader_commit));
        if new != old {
            self.shared.commited.store(new, Ordering::Release);
            self.shared.commit_cv.notify_all();
        }
    }

    /// Blocks until `commited >= index` or the timeout elapses. Returns
    /// whether the index committed in time.
    pub fn wait_commited(&self, index: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if self.shared.commited.load(Ordering::Acquire) >= index {
                return true;
            }
            if state.stopped {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .shared
                .commit_cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
        }
    }

    /// Stops the applier and persists the commit index.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stopped = true;
            self.shared.commit_cv.notify_all();
        }
        if let Some(handle) = self.applier.lock().unwrap().take() {
            let _ = handle.join();
        }
        let commited = self.shared.commited.load(Ordering::Acquire);
        if let Err(e) = fs::write(&self.meta_path, commited.to_le_bytes()) {
            tracing::error!(error = %e, "failed to persist raft log meta");
        }
    }
}

impl Drop for RaftLog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn apply_loop(shared: Arc<LogShared>, db: Arc<DB>) {
    loop {
        let entry = {
            let mut state = shared.state.lock().unwrap();
            loop {
                let applied = shared.last_applied.load(Ordering::Acquire);
                let commited = shared.commited.load(Ordering::Acquire);
                if applied < commited {
                    let start = shared.start_index.load(Ordering::Acquire);
                    let entry = state
                        .ring
                        .at((applied - start) as usize)
                        .cloned()
                        .expect("committed entry missing from ring");
                    break entry;
                }
                if state.stopped {
                    return;
                }
                let (next, _) = shared
                    .commit_cv
                    .wait_timeout(state, Duration::from_millis(100))
                    .unwrap();
                state = next;
            }
        };

        // Apply outside the lock; appends and commit updates proceed.
        let result = match entry.mode {
            EntryMode::Put => db.put(entry.key.clone(), entry.value.clone()),
            EntryMode::Delete => db.delete(&entry.key).map(|_| ()),
        };
        if let Err(e) = result {
            // The state machine diverged from the committed log; continuing
            // would serve inconsistent data.
            tracing::error!(index = entry.index, error = %e, "applying committed entry failed");
            std::process::abort();
        }
        shared.last_applied.store(entry.index, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use tempfile::TempDir;

    fn open_log(dir: &Path, capacity: usize) -> (RaftLog, Arc<DB>) {
        let db = Arc::new(DB::open(DbConfig::new(dir.join("db"))).unwrap());
        let log = RaftLog::open(dir, capacity, db.clone()).unwrap();
        (log, db)
    }

    fn entry(index: u64, term: u64) -> Entry {
        Entry {
            term,
            index,
            key: Bytes::from(format!("k{}", index)),
            value: Bytes::from(format!("v{}", index)),
            mode: EntryMode::Put,
        }
    }

    #[test]
    fn test_put_assigns_increasing_indexes() {
        let dir = TempDir::new().unwrap();
        let (log, _db) = open_log(dir.path(), 16);
        assert_eq!(
            log.put(Bytes::from_static(b"a"), Bytes::from_static(b"1"), EntryMode::Put, 1),
            Some(1)
        );
        assert_eq!(
            log.put(Bytes::from_static(b"b"), Bytes::from_static(b"2"), EntryMode::Put, 1),
            Some(2)
        );
        assert_eq!(log.index(), 2);
        assert_eq!(log.at(1).unwrap().key, Bytes::from_static(b"a"));
        assert_eq!(log.at(2).unwrap().key, Bytes::from_static(b"b"));
        assert_eq!(log.at(3), None);
        assert_eq!(log.at(0), None);
    }

    #[test]
    fn test_full_ring_rejects_put() {
        let dir = TempDir::new().unwrap();
        let (log, _db) = open_log(dir.path(), 4);
        for i in 0..4 {
            assert!(log
                .put(
                    Bytes::from(format!("k{}", i)),
                    Bytes::new(),
                    EntryMode::Put,
                    1
                )
                .is_some());
        }
        assert_eq!(
            log.put(Bytes::from_static(b"x"), Bytes::new(), EntryMode::Put, 1),
            None
        );
        // Counters are untouched by the failed append.
        assert_eq!(log.index(), 4);
        assert_eq!(log.at(4).unwrap().key, Bytes::from_static(b"k3"));
    }

    #[test]
    fn test_reset_truncates_uncommitted_suffix() {
        let dir = TempDir::new().unwrap();
        let (log, _db) = open_log(dir.path(), 16);
        for i in 1..=5 {
            log.put_entry(entry(i, 1));
        }
        log.update_commit(2);
        log.reset(2);
        assert_eq!(log.index(), 2);
        assert_eq!(log.at(3), None);
        // Re-append after the truncation point.
        assert!(log.put_entry(entry(3, 2)));
        assert_eq!(log.at(3).unwrap().term, 2);
    }

    #[test]
    fn test_update_commit_is_capped_and_monotonic() {
        let dir = TempDir::new().unwrap();
        let (log, _db) = open_log(dir.path(), 16);
        for i in 1..=3 {
            log.put_entry(entry(i, 1));
        }
        log.update_commit(10);
        assert_eq!(log.commited(), 3, "commit is capped at the last index");
        log.update_commit(1);
        assert_eq!(log.commited(), 3, "commit never regresses");
    }

    #[test]
    fn test_applier_writes_committed_entries_into_engine() {
        let dir = TempDir::new().unwrap();
        let (log, db) = open_log(dir.path(), 16);
        for i in 1..=3 {
            log.put_entry(entry(i, 1));
        }
        log.update_commit(3);
        assert!(log.wait_commited(3, Duration::from_secs(1)));

        let deadline = Instant::now() + Duration::from_secs(5);
        while log.last_applied() < 3 {
            assert!(Instant::now() < deadline, "applier stalled");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(db.get(b"k2").unwrap(), Some(Bytes::from_static(b"v2")));
        assert!(log.start_index() <= log.last_applied());
        assert!(log.last_applied() <= log.commited());
        assert!(log.commited() <= log.index());
    }

    #[test]
    fn test_delete_mode_applies_as_engine_delete() {
        let dir = TempDir::new().unwrap();
        let (log, db) = open_log(dir.path(), 16);
        log.put_entry(entry(1, 1));
        log.put_entry(Entry {
            term: 1,
            index: 2,
            key: Bytes::from_static(b"k1"),
            value: Bytes::new(),
            mode: EntryMode::Delete,
        });
        log.update_commit(2);
        let deadline = Instant::now() + Duration::from_secs(5);
        while log.last_applied() < 2 {
            assert!(Instant::now() < deadline, "applier stalled");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(db.get(b"k1").unwrap(), None);
    }

    #[test]
    fn test_meta_round_trip_on_restart() {
        let dir = TempDir::new().unwrap();
        {
            let (log, _db) = open_log(dir.path(), 16);
            for i in 1..=4 {
                log.put_entry(entry(i, 1));
            }
            log.update_commit(3);
            log.shutdown();
        }
        let (log, _db) = open_log(dir.path(), 16);
        // All counters resume from the stored commit index; entries are
        // never persisted, so the ring starts empty.
        assert_eq!(log.index(), 3);
        assert_eq!(log.commited(), 3);
        assert_eq!(log.last_applied(), 3);
        assert_eq!(log.start_index(), 3);
        assert_eq!(log.at(3), None);
        // New appends continue the numbering.
        assert_eq!(
            log.put(Bytes::from_static(b"n"), Bytes::new(), EntryMode::Put, 2),
            Some(4)
        );
    }

    #[test]
    fn test_wait_commited_times_out() {
        let dir = TempDir::new().unwrap();
        let (log, _db) = open_log(dir.path(), 16);
        log.put_entry(entry(1, 1));
        assert!(!log.wait_commited(1, Duration::from_millis(50)));
        log.update_commit(1);
        assert!(log.wait_commited(1, Duration::from_millis(50)));
    }
}
