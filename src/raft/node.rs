//! The raft node ("pod"): role state machine, election timer, heartbeat
//! loop and the client-facing Put/Get handlers with leader redirect.
//!
//! One background ticker drives both timers. While not leader it sleeps a
//! jittered election timeout (uniform in [T, 2T)) and starts an election
//! when no append or vote arrived in time; as leader it beats every
//! `heartbeat_interval`. Replication itself runs in per-peer threads
//! ([`crate::raft::peer`]).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{ClusterConfig, RaftConfig};
use crate::db::DB;
use crate::error::IResult;
use crate::raft::log::RaftLog;
use crate::raft::message::{
    Address, AppendRequest, AppendResponse, EntryMode, GetRequest, GetResponse, PutRequest,
    PutResponse, VoteRequest, VoteResponse, CODE_NOT_FOUND, CODE_OK, CODE_REDIRECT, CODE_REJECTED,
    CODE_UNSUPPORTED,
};
use crate::raft::peer::{advance_quorum, Peer};
use crate::raft::transport::Transport;
use crate::raft::Role;

/// Upper bound on how long a client Put waits for its quorum.
const PUT_QUORUM_TIMEOUT: Duration = Duration::from_secs(10);

struct ElectionState {
    role: Role,
    term: u64,
    /// Whether this node already voted in `term`.
    voted: bool,
    leader_id: Option<u32>,
    last_heartbeat: Instant,
}

struct NodeShared {
    id: u32,
    state: Mutex<ElectionState>,
    /// Lock-free mirrors of the hot fields.
    role: AtomicU8,
    term: Arc<AtomicU64>,
    stop: AtomicBool,
    /// The ticker sleeps on this; shutdown wakes it.
    ticker_mutex: Mutex<()>,
    ticker_cv: Condvar,
}

impl NodeShared {
    fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    fn set_role(&self, state: &mut ElectionState, role: Role) {
        if state.role != role {
            tracing::info!(id = self.id, term = state.term, ?role, "role transition");
        }
        state.role = role;
        self.role.store(role.as_u8(), Ordering::Release);
    }

    fn set_term(&self, state: &mut ElectionState, term: u64) {
        state.term = term;
        self.term.store(term, Ordering::Release);
    }

    /// Adopts a higher term and falls back to follower. Leader duties are
    /// signalled to stop; the replicator threads observe the term change
    /// and exit on their own.
    fn step_down(&self, state: &mut ElectionState, term: u64, peers: &[Arc<Peer>]) {
        if state.role == Role::Leader {
            for peer in peers {
                peer.signal_stop();
            }
        }
        self.set_term(state, term);
        state.voted = false;
        state.leader_id = None;
        self.set_role(state, Role::Follower);
    }
}

pub struct Pod {
    shared: Arc<NodeShared>,
    local_addr: Address,
    peers: Vec<Arc<Peer>>,
    log: Arc<RaftLog>,
    db: Arc<DB>,
    /// Serializes incoming append processing.
    append_lock: Mutex<()>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Pod {
    /// Builds the node, restores the raft log meta from the engine
    /// directory and starts the election ticker.
    pub fn new(
        cluster: ClusterConfig,
        raft: RaftConfig,
        db: Arc<DB>,
        transport: Arc<dyn Transport>,
    ) -> IResult<Arc<Pod>> {
        let local_addr = cluster.local.clone();
        let peers: Vec<Arc<Peer>> = cluster
            .peers
            .iter()
            .filter(|addr| addr.id != local_addr.id)
            .map(|addr| Arc::new(Peer::new(addr.clone())))
            .collect();
        let log = Arc::new(RaftLog::open(db.dir(), raft.log_capacity, db.clone())?);

        let shared = Arc::new(NodeShared {
            id: local_addr.id,
            state: Mutex::new(ElectionState {
                role: Role::Follower,
                term: 0,
                voted: false,
                leader_id: None,
                last_heartbeat: Instant::now(),
            }),
            role: AtomicU8::new(Role::Follower.as_u8()),
            term: Arc::new(AtomicU64::new(0)),
            stop: AtomicBool::new(false),
            ticker_mutex: Mutex::new(()),
            ticker_cv: Condvar::new(),
        });

        let pod = Arc::new(Pod {
            shared: shared.clone(),
            local_addr,
            peers: peers.clone(),
            log: log.clone(),
            db,
            append_lock: Mutex::new(()),
            ticker: Mutex::new(None),
        });

        let ticker = std::thread::Builder::new()
            .name(format!("shoalkv-raft-{}", shared.id))
            .spawn(move || ticker_loop(shared, peers, log, transport, raft))?;
        *pod.ticker.lock().unwrap() = Some(ticker);
        Ok(pod)
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn local_addr(&self) -> &Address {
        &self.local_addr
    }

    pub fn role(&self) -> Role {
        self.shared.role()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn term(&self) -> u64 {
        self.shared.term.load(Ordering::Acquire)
    }

    pub fn leader_id(&self) -> Option<u32> {
        self.shared.state.lock().unwrap().leader_id
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn db(&self) -> &Arc<DB> {
        &self.db
    }

    /// The believed-current leader's address, for client redirects.
    fn leader_addr(&self) -> Option<Address> {
        let leader_id = self.leader_id()?;
        if leader_id == self.shared.id {
            return Some(self.local_addr.clone());
        }
        self.peers
            .iter()
            .find(|p| p.id() == leader_id)
            .map(|p| p.addr().clone())
    }

    /// Voter side of RequestVote.
    pub fn handle_vote(&self, req: &VoteRequest) -> VoteResponse {
        let mut state = self.shared.state.lock().unwrap();
        if req.term < state.term {
            return VoteResponse {
                code: CODE_REJECTED,
            };
        }
        if req.term == state.term {
            if req.last_log_index < self.log.index() || state.voted {
                return VoteResponse {
                    code: CODE_REJECTED,
                };
            }
        } else {
            self.shared.step_down(&mut state, req.term, &self.peers);
        }
        state.voted = true;
        state.leader_id = None;
        state.last_heartbeat = Instant::now();
        tracing::debug!(
            id = self.shared.id,
            candidate = req.candidate_id,
            term = req.term,
            "vote granted"
        );
        VoteResponse { code: CODE_OK }
    }

    /// Follower side of Append: heartbeats, term adoption and single-entry
    /// log replication.
    pub fn handle_append(&self, req: &AppendRequest) -> AppendResponse {
        let _guard = self.append_lock.lock().unwrap();
        {
            let mut state = self.shared.state.lock().unwrap();
            state.last_heartbeat = Instant::now();
            if req.term < state.term {
                return AppendResponse {
                    code: CODE_REDIRECT,
                };
            }
            let beyond_local_tail = req
                .entries
                .first()
                .map_or(false, |e| e.index > self.log.index());
            if req.term > state.term || (req.term == state.term && beyond_local_tail) {
                self.shared.step_down(&mut state, req.term, &self.peers);
            }
            if state.role != Role::Leader {
                state.leader_id = Some(req.leader_id);
            }
        }
        self.log.update_commit(req.commited_index);

        match req.entries.len() {
            0 => AppendResponse { code: CODE_OK },
            1 => {
                let entry = &req.entries[0];
                if entry.index == self.log.index() + 1 {
                    return self.append_entry(entry.clone());
                }
                // A diverging suffix can only be uncommitted; drop it and
                // try once more.
                let commited = self.log.commited();
                let index = self.log.index();
                if commited < index && req.commited_index > commited && req.commited_index <= index
                {
                    self.log.reset(commited);
                }
                if entry.index == self.log.index() + 1 {
                    self.append_entry(entry.clone())
                } else {
                    AppendResponse {
                        code: CODE_REDIRECT,
                    }
                }
            }
            _ => AppendResponse {
                code: CODE_UNSUPPORTED,
            },
        }
    }

    fn append_entry(&self, entry: crate::raft::message::Entry) -> AppendResponse {
        if self.log.put_entry(entry) {
            AppendResponse { code: CODE_OK }
        } else {
            tracing::warn!(id = self.shared.id, "raft log full, rejecting append");
            AppendResponse {
                code: CODE_REDIRECT,
            }
        }
    }

    /// Client Put. Only the leader accepts; everyone else redirects. The
    /// call returns once a majority holds the entry (signalled through the
    /// log's commit condvar, not by polling).
    pub fn put(&self, req: PutRequest) -> PutResponse {
        if !self.is_leader() {
            return match self.leader_addr() {
                Some(addr) => PutResponse {
                    code: CODE_REDIRECT,
                    leader_addr: Some(addr),
                },
                None => PutResponse {
                    code: CODE_REJECTED,
                    leader_addr: None,
                },
            };
        }
        let term = self.term();
        let Some(index) = self.log.put(req.key, req.value, EntryMode::Put, term) else {
            return PutResponse {
                code: CODE_REJECTED,
                leader_addr: None,
            };
        };
        // With no peers the quorum is this node alone; recompute so the
        // commit does not wait for a replicator that does not exist.
        advance_quorum(&self.peers, &self.log);
        if self.log.wait_commited(index, PUT_QUORUM_TIMEOUT) {
            PutResponse {
                code: CODE_OK,
                leader_addr: None,
            }
        } else {
            tracing::warn!(id = self.shared.id, index, "put timed out waiting for quorum");
            PutResponse {
                code: CODE_REJECTED,
                leader_addr: None,
            }
        }
    }

    /// Client Get. Follower reads are allowed (and may be stale) unless the
    /// request demands the leader.
    pub fn get(&self, req: GetRequest) -> GetResponse {
        if req.read_from_leader && !self.is_leader() {
            return GetResponse {
                code: CODE_REDIRECT,
                value: None,
                leader_addr: self.leader_addr(),
            };
        }
        match self.db.get(&req.key) {
            Ok(Some(value)) => GetResponse {
                code: CODE_OK,
                value: Some(value),
                leader_addr: None,
            },
            Ok(None) => GetResponse {
                code: CODE_NOT_FOUND,
                value: None,
                leader_addr: None,
            },
            Err(e) => {
                tracing::error!(id = self.shared.id, error = %e, "engine read failed");
                GetResponse {
                    code: CODE_REJECTED,
                    value: None,
                    leader_addr: None,
                }
            }
        }
    }

    /// Stops the ticker, the replicators and the log applier, persisting
    /// the raft meta. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.ticker_cv.notify_all();
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            let _ = handle.join();
        }
        for peer in &self.peers {
            peer.stop_replicator();
        }
        self.log.shutdown();
    }
}

impl Drop for Pod {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ticker_loop(
    shared: Arc<NodeShared>,
    peers: Vec<Arc<Peer>>,
    log: Arc<RaftLog>,
    transport: Arc<dyn Transport>,
    raft: RaftConfig,
) {
    let heartbeat = Duration::from_millis(raft.heartbeat_interval_ms);
    loop {
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        if shared.role() == Role::Leader {
            sleep_on_cv(&shared, heartbeat);
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            if shared.role() != Role::Leader {
                continue;
            }
            let term = shared.term.load(Ordering::Acquire);
            let commited = log.commited();
            for peer in &peers {
                peer.send_heartbeat(transport.as_ref(), term, shared.id, commited);
            }
        } else {
            let timeout = jittered_timeout(raft.election_timeout_ms);
            sleep_on_cv(&shared, timeout);
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            if shared.role() == Role::Leader {
                continue;
            }
            let quiet = shared.state.lock().unwrap().last_heartbeat.elapsed();
            if quiet < timeout {
                continue;
            }
            run_election(&shared, &peers, &log, &transport);
        }
    }
}

/// Uniform draw from [T, 2T).
fn jittered_timeout(election_timeout_ms: u64) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..election_timeout_ms.max(1));
    Duration::from_millis(election_timeout_ms + jitter)
}

fn sleep_on_cv(shared: &NodeShared, timeout: Duration) {
    let guard = shared.ticker_mutex.lock().unwrap();
    let _ = shared.ticker_cv.wait_timeout(guard, timeout).unwrap();
}

/// Candidate flow: bump the term, vote for self, fan RequestVote out in
/// parallel, and take leadership on a strict majority.
fn run_election(
    shared: &Arc<NodeShared>,
    peers: &[Arc<Peer>],
    log: &Arc<RaftLog>,
    transport: &Arc<dyn Transport>,
) {
    let my_term = {
        let mut state = shared.state.lock().unwrap();
        shared.set_role(&mut state, Role::Candidate);
        let next_term = state.term + 1;
        shared.set_term(&mut state, next_term);
        state.voted = true;
        state.leader_id = None;
        state.last_heartbeat = Instant::now();
        state.term
    };
    tracing::info!(id = shared.id, term = my_term, "starting election");

    let last_log_index = log.index();
    let (tx, rx) = mpsc::channel();
    for peer in peers {
        let tx = tx.clone();
        let transport = transport.clone();
        let req = VoteRequest {
            term: my_term,
            candidate_id: shared.id,
            last_log_index,
        };
        let peer_id = peer.id();
        std::thread::spawn(move || {
            let granted = matches!(
                transport.request_vote(peer_id, req),
                Ok(rsp) if rsp.code == CODE_OK
            );
            let _ = tx.send(granted);
        });
    }
    drop(tx);

    let total = peers.len() + 1;
    let majority = total / 2 + 1;
    let mut votes = 1; // self
    while votes < majority {
        match rx.recv_timeout(Duration::from_secs(3)) {
            Ok(true) => votes += 1,
            Ok(false) => {}
            Err(_) => break,
        }
    }
    if votes < majority {
        tracing::info!(id = shared.id, term = my_term, votes, "election lost");
        return;
    }

    let won = {
        let mut state = shared.state.lock().unwrap();
        if state.role == Role::Candidate && state.term == my_term {
            shared.set_role(&mut state, Role::Leader);
            state.leader_id = Some(shared.id);
            true
        } else {
            false
        }
    };
    if !won {
        return;
    }
    tracing::info!(id = shared.id, term = my_term, votes, "won election");

    let commited = log.commited();
    let peer_vec: Vec<Arc<Peer>> = peers.to_vec();
    for peer in peers {
        peer.set_next_index(commited);
    }
    for peer in peers {
        peer.clone().run(
            peer_vec.clone(),
            log.clone(),
            transport.clone(),
            my_term,
            shared.id,
            shared.term.clone(),
        );
    }
}
