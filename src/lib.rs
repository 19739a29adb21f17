//! shoalkv: a replicated key-value store.
//!
//! An LSM-tree storage engine ([`DB`]) sits under a Raft consensus core
//! ([`raft::Pod`]). Clients send Put/Get to any node; followers redirect
//! writes (and leader-demanded reads) to the current leader, committed
//! entries are applied into every node's engine in log order, and the
//! engine persists through memtable flushes, size-tiered compaction and a
//! copy-on-write manifest.

pub mod cache;
pub mod compress;
pub mod config;
mod db;
pub mod error;
pub mod filter;
pub mod manifest;
pub mod memtable;
pub mod raft;
pub mod sstable;
pub mod util;

pub use config::{ClusterConfig, DbConfig, RaftConfig};
pub use db::DB;
pub use error::{Error, IResult};
