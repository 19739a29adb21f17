//! Raft replication core: leader election, single-entry log shipping,
//! quorum commit and the background application of committed entries into
//! the storage engine.

pub mod log;
pub mod message;
pub mod node;
pub mod peer;
pub mod transport;

pub use self::log::RaftLog;
pub use self::node::Pod;
pub use self::transport::{MemoryTransport, Transport};

/// The three classic roles. At most one leader exists per term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Role::Follower => 0,
            Role::Candidate => 1,
            Role::Leader => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Role {
        match v {
            1 => Role::Candidate,
            2 => Role::Leader,
            _ => Role::Follower,
        }
    }
}
