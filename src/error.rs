//! Error types shared across the client.
//!
//! Each subsystem has its own error enum; [`Error`] unifies them for the
//! session-level API.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use crate::bencode_parser::errors::BencodeError;

/// Convenience alias used by the session-level API.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// No tracker produced a peer and none were supplied by the caller.
    #[error("no reachable trackers and no peers supplied")]
    NoPeers,

    #[error("download already started")]
    AlreadyStarted,
}

/// Problems found while loading or validating torrent metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read metadata file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bencode decoding failed: {0}")]
    Decode(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' has the wrong type")]
    WrongType(&'static str),

    #[error("'pieces' length {0} is not a multiple of 20")]
    BadPieces(usize),

    #[error("chunk size must be positive")]
    ZeroChunkSize,

    #[error("expected {expected} chunk hashes, found {found}")]
    HashCountMismatch { expected: usize, found: usize },

    #[error("unsafe file path {0:?}")]
    UnsafePath(PathBuf),
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid announce url: {0}")]
    Url(#[from] url::ParseError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker returned status {0}")]
    Status(u16),

    #[error("tracker response is not valid bencode: {0}")]
    Decode(String),

    #[error("tracker response is malformed: {0}")]
    Malformed(&'static str),

    #[error("tracker refused announce: {0}")]
    Failure(String),
}

/// Disk failures, classified so the scheduler can decide whether to retry.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("range {offset}+{length} is outside the torrent ({total} bytes)")]
    OutOfBounds { offset: u64, length: u64, total: u64 },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    /// Transient failures worth retrying on the next request for the block.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            StorageError::OutOfBounds { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(std::net::SocketAddr),

    #[error("connection is not open")]
    NotConnected,

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("write to {0} timed out")]
    WriteTimeout(std::net::SocketAddr),
}
