//! A BitTorrent peer wire protocol engine with a pluggable piece-selection
//! and scheduling layer.
//!
//! The crate is built around two cooperating subsystems:
//!
//! - the peer connection engine, which owns one transport stream per
//!   remote peer and turns bytes into framed protocol messages (handshake,
//!   choke/interest flow control, bitfield/have accounting, request/piece
//!   exchange) under optional rate limits;
//! - the [`coordinator::Coordinator`], which owns the shared download
//!   bookkeeping (wanted pieces, availability counts, piece assembly and
//!   hash verification) and delegates the question "what should this peer
//!   download next?" to a selection policy chosen at construction. Policies
//!   range from plain rarest-first to deadline-driven strategies for
//!   streaming playback.
//!
//! Storage, tracker announces and metainfo parsing are deliberately not part
//! of this crate; they are consumed through the [`storage::Storage`],
//! [`source::ExternalSource`] and [`listener::Listener`] seams.

use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use bitvec::prelude::{BitVec, Msb0};

pub mod conf;
pub mod coordinator;
pub mod error;
pub mod listener;
pub(crate) mod peer;
pub mod piece;
pub mod pool;
pub mod source;
pub mod storage;

/// Index of a piece within the torrent, stable for the torrent's lifetime.
pub type PieceIndex = usize;

/// The client's or a remote peer's 20-byte identifier.
pub type PeerId = [u8; 20];

/// A bit vector over piece indices. Bit `i` set means piece `i` is fully
/// downloaded and hash-verified (for the local field) or advertised as
/// possessed (for a peer's field). The bit order matches the wire format:
/// MSB-first within each byte.
pub type Bitfield = BitVec<u8, Msb0>;

/// The de-facto standard block length requested from peers.
pub const BLOCK_LEN: u32 = 0x4000;

/// The largest request the protocol allows; anything beyond this is a
/// protocol violation that terminates the connection.
pub(crate) const MAX_REQUEST_LEN: u32 = 0x2_0000;

/// A block is a contiguous byte range within a single piece, as exchanged by
/// one `request`/`piece` message pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// The piece the block belongs to.
    pub piece_index: PieceIndex,
    /// Byte offset of the block within its piece.
    pub offset: u32,
    /// Length of the block in bytes.
    pub len: u32,
}

/// Identifies one peer connection for the lifetime of the torrent session.
///
/// Ids are process-unique and never reused, so a teardown racing a selection
/// pass can never confuse two connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        ConnectionId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}
