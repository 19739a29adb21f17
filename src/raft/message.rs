//! RPC message schemas.
//!
//! Field-compatible with the wire protocol: the transport itself (gRPC or
//! otherwise) lives outside this crate behind the [`Transport`] trait, so
//! only the shapes and the response codes matter here.
//!
//! [`Transport`]: crate::raft::transport::Transport

use std::fmt;

use bytes::Bytes;

/// Request granted / accepted.
pub const CODE_OK: i32 = 0;
/// Vote denied, or a client operation failed outright.
pub const CODE_REJECTED: i32 = -1;
/// Not the leader (client ops) or log index mismatch (append).
pub const CODE_REDIRECT: i32 = -2;
/// Append carried a batch size the follower does not support.
pub const CODE_UNSUPPORTED: i32 = -3;
/// Get found no value for the key.
pub const CODE_NOT_FOUND: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub id: u32,
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// How an applied entry mutates the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryMode {
    Put = 0,
    Delete = 1,
}

/// One replicated log record.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub key: Bytes,
    pub value: Bytes,
    pub mode: EntryMode,
}

#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u32,
    pub last_log_index: u64,
}

#[derive(Debug, Clone)]
pub struct VoteResponse {
    pub code: i32,
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: u32,
    pub commited_index: u64,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
pub struct AppendResponse {
    pub code: i32,
}

#[derive(Debug, Clone)]
pub struct GetRequest {
    pub key: Bytes,
    /// Demand a linearizable read served by the leader.
    pub read_from_leader: bool,
}

#[derive(Debug, Clone)]
pub struct GetResponse {
    pub code: i32,
    pub value: Option<Bytes>,
    pub leader_addr: Option<Address>,
}

#[derive(Debug, Clone)]
pub struct PutRequest {
    pub key: Bytes,
    pub value: Bytes,
}

#[derive(Debug, Clone)]
pub struct PutResponse {
    pub code: i32,
    pub leader_addr: Option<Address>,
}
