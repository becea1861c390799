//! Error types for the engine.
//!
//! Per-connection failures are contained within that connection's task and
//! never poison the shared coordinator state. Violations of internal
//! invariants (index bookkeeping, bitfield lengths we created ourselves) are
//! programming errors and assert instead of returning an error.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type surfaced through the public API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Errors that terminate a single peer connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PeerError {
    /// Network I/O error on the peer's transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection before the handshake completed.
    #[error("peer closed the connection")]
    ConnectionClosed,

    /// The first bytes received were not a well-formed handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's handshake carried a different info hash than ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// A message id outside the known vocabulary.
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    /// A request larger than the standard 128 KiB ceiling.
    #[error("request of {0} bytes exceeds the protocol maximum")]
    RequestTooLarge(u32),

    /// Any other violation of the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}
