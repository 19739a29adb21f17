//! The RPC seam.
//!
//! The real wire transport lives outside this crate; replication code only
//! needs the two peer-facing calls with their 2-second deadline contract.
//! [`MemoryTransport`] is the in-process implementation used by tests and
//! single-host clusters: it routes calls straight into registered pods and
//! can simulate network partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, IResult};
use crate::raft::message::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use crate::raft::node::Pod;

/// Peer-to-peer RPC. Implementations enforce a 2 s deadline per call and
/// surface expiry as [`Error::Timeout`].
pub trait Transport: Send + Sync + 'static {
    fn request_vote(&self, to: u32, req: VoteRequest) -> IResult<VoteResponse>;

    fn append(&self, to: u32, req: AppendRequest) -> IResult<AppendResponse>;
}

#[derive(Default)]
struct MemoryInner {
    pods: HashMap<u32, Weak<Pod>>,
    isolated: HashSet<u32>,
}

/// In-process transport: a registry of pods plus a partition set. A call
/// from or to an isolated node fails like a timed-out RPC.
#[derive(Default)]
pub struct MemoryTransport {
    inner: Mutex<MemoryInner>,
}

impl MemoryTransport {
    pub fn new() -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::default())
    }

    pub fn register(&self, pod: &Arc<Pod>) {
        let mut inner = self.inner.lock().unwrap();
        inner.pods.insert(pod.id(), Arc::downgrade(pod));
    }

    /// Cuts the node off in both directions until [`restore`](Self::restore).
    pub fn isolate(&self, id: u32) {
        self.inner.lock().unwrap().isolated.insert(id);
    }

    pub fn restore(&self, id: u32) {
        self.inner.lock().unwrap().isolated.remove(&id);
    }

    fn route(&self, from: u32, to: u32) -> IResult<Arc<Pod>> {
        let inner = self.inner.lock().unwrap();
        if inner.isolated.contains(&from) || inner.isolated.contains(&to) {
            return Err(Error::Timeout);
        }
        inner
            .pods
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or(Error::Timeout)
    }
}

impl Transport for MemoryTransport {
    fn request_vote(&self, to: u32, req: VoteRequest) -> IResult<VoteResponse> {
        let pod = self.route(req.candidate_id, to)?;
        Ok(pod.handle_vote(&req))
    }

    fn append(&self, to: u32, req: AppendRequest) -> IResult<AppendResponse> {
        let pod = self.route(req.leader_id, to)?;
        Ok(pod.handle_append(&req))
    }
}
