//! The error taxonomy used throughout the engine (spec.md §7).
//!
//! Peer-local errors (`Protocol`) close only the offending session. Disk
//! errors (`Io`) propagate up to the torrent engine, which records them and
//! keeps running. `DuplicateTorrent` and `ParseError` are returned
//! synchronously from the control-surface init APIs and have no side effects.

use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] IoError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("assertion violated: {0}")]
    AssertViolation(String),

    #[error("torrent already exists")]
    DuplicateTorrent,

    #[error("failed to parse metainfo: {0}")]
    ParseError(String),

    #[error("invalid piece index")]
    InvalidPieceIndex,

    #[error("invalid torrent id")]
    InvalidTorrentId,

    #[error("channel closed unexpectedly")]
    ChannelClosed,
}

/// Local disk issues, mapped from the underlying OS errno (spec.md §4.3,
/// §7).
#[derive(Debug, Error)]
pub enum IoError {
    #[error("failed to open file: {0}")]
    Open(io::Error),
    #[error("failed to seek in file: {0}")]
    Seek(io::Error),
    #[error("short transfer, expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("permission denied: {0}")]
    Permission(io::Error),
    #[error("io error: {0}")]
    Other(io::Error),
}

impl From<io::Error> for IoError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied => IoError::Permission(e),
            io::ErrorKind::NotFound => IoError::Open(e),
            _ => IoError::Other(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError::from(e))
    }
}

/// Fatal to the session that raised them; the peer's connection candidate is
/// marked dirty and not retried for a cooldown (spec.md §4.5, §7).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad handshake")]
    BadHandshake,
    #[error("malformed message length")]
    BadLength,
    #[error("malformed message payload")]
    BadPayload,
    #[error("bitfield has non-zero spare bits")]
    SpareBitsSet,
    #[error("piece or block index out of range")]
    IndexOutOfRange,
    #[error("duplicate connection for this peer id")]
    DuplicatePeer,
    #[error("remote peer id equals our own")]
    SelfConnect,
}

/// Surfaced in stats; retries are owned by the (external) tracker
/// collaborator, not by this crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("tracker warning: {0}")]
    Warning(String),
    #[error("tracker error: {0}")]
    Error(String),
    #[error("tracker unreachable")]
    Unreachable,
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::ParseError(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_from_kind() {
        let e = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(IoError::from(e), IoError::Permission(_)));
    }
}
