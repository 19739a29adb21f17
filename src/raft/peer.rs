//! Leader-side view of one follower: its `next_index` and the replicator
//! thread that ships log entries to it.
//!
//! Each replicator owns exactly its peer's `next_index` slot; quorum
//! computation reads every slot plus the leader's own last index, so no
//! cross-peer references exist. Appends carry one entry at a time; on an
//! index mismatch the replicator walks `next_index` back one step and
//! retries until the follower accepts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::raft::log::RaftLog;
use crate::raft::message::{Address, AppendRequest, CODE_OK, CODE_REDIRECT};
use crate::raft::transport::Transport;

/// How often an idle replicator re-checks the log tail.
const REPLICATE_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Backoff after an RPC failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

pub struct Peer {
    addr: Address,
    /// Highest log index known replicated on this peer. Written only by
    /// this peer's replicator (and by the leader on election).
    next_index: AtomicU64,
    stop: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(addr: Address) -> Peer {
        Peer {
            addr,
            next_index: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.addr.id
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    pub fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::Acquire)
    }

    pub fn set_next_index(&self, index: u64) {
        self.next_index.store(index, Ordering::Release);
    }

    /// An empty append that asserts leadership and carries the commit
    /// index. Failures are ignored; the next beat retries.
    pub fn send_heartbeat(&self, transport: &dyn Transport, term: u64, leader_id: u32, commited: u64) {
        let req = AppendRequest {
            term,
            leader_id,
            commited_index: commited,
            entries: vec![],
        };
        if let Err(e) = transport.append(self.id(), req) {
            tracing::debug!(peer = self.id(), error = %e, "heartbeat failed");
        }
    }

    /// Starts the replicator. `peers` is the full peer set (including this
    /// one) so the thread can recompute the quorum match after an advance.
    /// The thread self-terminates as soon as `current_term` moves past the
    /// `term` this leadership was won with.
    ///
    /// Must not be called with node locks held: it joins the previous
    /// replicator first.
    pub fn run(
        self: Arc<Peer>,
        peers: Vec<Arc<Peer>>,
        log: Arc<RaftLog>,
        transport: Arc<dyn Transport>,
        term: u64,
        leader_id: u32,
        current_term: Arc<AtomicU64>,
    ) {
        self.stop_replicator();
        self.stop.store(false, Ordering::Release);
        let peer = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("shoalkv-repl-{}", self.id()))
            .spawn(move || {
                replicate_loop(peer, peers, log, transport, term, leader_id, current_term)
            })
            .expect("spawning replicator thread");
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Asks the replicator to exit without waiting for it. Safe to call
    /// with node locks held.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Signals and joins the replicator. Must not be called with node
    /// locks held.
    pub fn stop_replicator(&self) {
        self.signal_stop();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

fn replicate_loop(
    peer: Arc<Peer>,
    peers: Vec<Arc<Peer>>,
    log: Arc<RaftLog>,
    transport: Arc<dyn Transport>,
    term: u64,
    leader_id: u32,
    current_term: Arc<AtomicU64>,
) {
    let deposed = || current_term.load(Ordering::Acquire) != term;
    while !peer.stopped() && !deposed() {
        std::thread::sleep(REPLICATE_POLL_INTERVAL);
        while !peer.stopped() && !deposed() && peer.next_index() < log.index() {
            let idx = peer.next_index() + 1;
            let entry = match log.at(idx) {
                Some(entry) => entry,
                None => {
                    // The ring no longer holds this entry (it predates the
                    // leader's start index). The engine already contains
                    // its effect, so skip the peer forward.
                    let start = log.start_index();
                    tracing::warn!(
                        peer = peer.id(),
                        idx,
                        start,
                        "entry fell out of the ring, advancing peer to start index"
                    );
                    peer.set_next_index(start.max(peer.next_index()));
                    break;
                }
            };
            let req = AppendRequest {
                term,
                leader_id,
                commited_index: log.commited(),
                entries: vec![entry],
            };
            match transport.append(peer.id(), req) {
                Ok(rsp) if rsp.code == CODE_OK => {
                    peer.set_next_index(idx);
                    advance_quorum(&peers, &log);
                }
                Ok(rsp) if rsp.code == CODE_REDIRECT => {
                    // Index mismatch: walk back and retry.
                    let back = peer.next_index().saturating_sub(1);
                    peer.set_next_index(back);
                    tracing::debug!(peer = peer.id(), next_index = back, "append mismatch");
                }
                Ok(rsp) => {
                    tracing::warn!(peer = peer.id(), code = rsp.code, "append rejected");
                    std::thread::sleep(RETRY_BACKOFF);
                }
                Err(e) => {
                    tracing::debug!(peer = peer.id(), error = %e, "append rpc failed");
                    std::thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }
}

/// Recomputes the quorum match index: the highest N replicated on a strict
/// majority (the leader's own log included), and commits up to it.
pub fn advance_quorum(peers: &[Arc<Peer>], log: &RaftLog) {
    let mut matches: Vec<u64> = peers.iter().map(|p| p.next_index()).collect();
    matches.push(log.index());
    matches.sort_unstable_by(|a, b| b.cmp(a));
    let quorum = matches.len() / 2 + 1;
    let n = matches[quorum - 1];
    if n > log.commited() {
        log.update_commit(n);
    }
}
