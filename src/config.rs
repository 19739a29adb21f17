use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compress::CompressionConfig;
use crate::error::{Error, IResult};
use crate::raft::message::Address;

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Directory holding the manifest, SST files and raft metadata.
    pub dir: PathBuf,
    /// Flush threshold: the active memtable rotates to the immutable queue
    /// once its byte size exceeds this. Kept below the huge-page size so a
    /// single flush stays one sequential write.
    pub memtable_max_size: usize,
    /// Target size of one SST data block.
    pub block_size: usize,
    pub compression: CompressionConfig,
    pub enable_block_cache: bool,
    pub block_cache: BlockCacheConfig,
    /// Per-level compaction triggers, level 0 first.
    pub level_thresholds: Vec<u64>,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            dir: PathBuf::from("."),
            memtable_max_size: 3 * 1024 * 1024,
            block_size: 16 * 1024,
            compression: CompressionConfig::default(),
            enable_block_cache: true,
            block_cache: BlockCacheConfig::default(),
            level_thresholds: vec![
                1024,
                10 * 1024 * 1024,
                100 * 1024 * 1024,
                1000 * 1024 * 1024,
                10000 * 1024 * 1024,
            ],
        }
    }
}

impl DbConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DbConfig {
            dir: dir.into(),
            ..DbConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockCacheConfig {
    pub max_capacity: usize,
    pub min_block_size: usize,
    pub max_block_size: usize,
    /// 0 means unlimited.
    pub max_block_count: usize,
    /// Blocks whose size-to-`min_block_size` ratio falls below this are not
    /// worth caching and are rejected.
    pub min_utilization: f64,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        BlockCacheConfig {
            max_capacity: 256 * 1024 * 1024,
            min_block_size: 4096,
            max_block_size: 64 * 1024,
            max_block_count: 0,
            min_utilization: 0.5,
        }
    }
}

/// Raft timer and log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub heartbeat_interval_ms: u64,
    /// Base election timeout T; each cycle waits a uniform draw from
    /// [T, 2T) to keep split votes rare.
    pub election_timeout_ms: u64,
    pub log_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            heartbeat_interval_ms: 1000,
            election_timeout_ms: 5000,
            log_capacity: 1 << 16,
        }
    }
}

/// Cluster membership, loaded from the `raft.cfg` text format:
///
/// ```text
///     N
///     id ip port      (N lines, one per peer)
///     id ip port      (the local address)
/// ```
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub peers: Vec<Address>,
    pub local: Address,
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> IResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> IResult<Self> {
        let mut tokens = text.split_whitespace();
        let count: usize = next_token(&mut tokens)?
            .parse()
            .map_err(|_| Error::Config("peer count is not a number".into()))?;
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            peers.push(parse_address(&mut tokens)?);
        }
        let local = parse_address(&mut tokens)?;
        Ok(ClusterConfig { peers, local })
    }
}

fn next_token<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> IResult<&'a str> {
    tokens
        .next()
        .ok_or_else(|| Error::Config("cluster config truncated".into()))
}

fn parse_address<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> IResult<Address> {
    let id = next_token(tokens)?
        .parse()
        .map_err(|_| Error::Config("address id is not a number".into()))?;
    let ip = next_token(tokens)?.to_string();
    let port = next_token(tokens)?
        .parse()
        .map_err(|_| Error::Config("address port is not a number".into()))?;
    Ok(Address { id, ip, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cluster_config() {
        let cfg = ClusterConfig::parse(
            "3\n\
             1 10.0.0.1 7001\n\
             2 10.0.0.2 7002\n\
             3 10.0.0.3 7003\n\
             1 10.0.0.1 7001\n",
        )
        .unwrap();
        assert_eq!(cfg.peers.len(), 3);
        assert_eq!(cfg.peers[1].id, 2);
        assert_eq!(cfg.peers[1].ip, "10.0.0.2");
        assert_eq!(cfg.peers[1].port, 7002);
        assert_eq!(cfg.local.id, 1);
    }

    #[test]
    fn test_parse_rejects_truncation() {
        assert!(ClusterConfig::parse("2\n1 10.0.0.1 7001\n").is_err());
        assert!(ClusterConfig::parse("").is_err());
        assert!(ClusterConfig::parse("x\n").is_err());
    }

    #[test]
    fn test_db_config_defaults_match_source() {
        let cfg = DbConfig::default();
        assert_eq!(cfg.memtable_max_size, 3 * 1024 * 1024);
        assert_eq!(cfg.level_thresholds[0], 1024);
        assert_eq!(cfg.level_thresholds.len(), 5);
        assert!(cfg.enable_block_cache);
    }

    #[test]
    fn test_raft_config_defaults_match_source() {
        let cfg = RaftConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 1000);
        assert_eq!(cfg.election_timeout_ms, 5000);
    }
}
