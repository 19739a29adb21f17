use std::io;
use thiserror::Error;

use crate::raft::message::Address;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Corruption: {0}")]
    Corruption(String),
    #[error("IO error: {0}")]
    Io(#[source] Box<io::Error>),
    #[error("Compression failed: {0}")]
    Compression(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Raft log is full")]
    LogFull,
    #[error("Not the leader")]
    NotLeader { leader: Option<Address> },
    #[error("RPC deadline exceeded")]
    Timeout,
    #[error("Background flush failed: {0}")]
    Background(String),
    #[error("Database closed")]
    DbClosed,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(Box::new(e))
    }
}

impl From<snap::Error> for Error {
    fn from(e: snap::Error) -> Self {
        Self::Compression(e.to_string())
    }
}

impl From<lz4_flex::block::DecompressError> for Error {
    fn from(e: lz4_flex::block::DecompressError) -> Self {
        Self::Compression(e.to_string())
    }
}

pub type IResult<T> = std::result::Result<T, Error>;
