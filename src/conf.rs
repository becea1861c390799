//! Session configuration, passed explicitly at construction.

use crate::PeerId;

/// Top-level configuration for one torrent session.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The 20-byte peer id presented in handshakes.
    pub client_id: PeerId,
    /// Connection and rate limits.
    pub torrent: TorrentConf,
    /// The piece-selection strategy the coordinator is built with.
    pub strategy: Strategy,
}

impl Conf {
    pub fn new(client_id: PeerId) -> Self {
        Self {
            client_id,
            torrent: TorrentConf::default(),
            strategy: Strategy::RarestFirst,
        }
    }
}

/// Per-torrent connection limits.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// Upper bound on concurrently connected peers.
    pub max_connected_peer_count: usize,
    /// Upper bound on peers unchoked at the same time.
    pub max_unchoked_peer_count: usize,
    /// Inbound rate limit shared by all connections.
    pub download_rate_limit: Limit,
    /// Outbound rate limit shared by all connections.
    pub upload_rate_limit: Limit,
}

impl Default for TorrentConf {
    fn default() -> Self {
        Self {
            max_connected_peer_count: 50,
            max_unchoked_peer_count: 4,
            download_rate_limit: Limit::Unlimited,
            upload_rate_limit: Limit::Unlimited,
        }
    }
}

/// A byte-rate budget. `BytesPerSec(0)` pauses the direction entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Limit {
    Unlimited,
    BytesPerSec(u32),
}

/// Which selection policy drives `wantPiece` style decisions.
///
/// The streaming variants take the media bitrate in bits per second; it
/// sizes their windows and playback deadlines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Download the globally rarest piece first. The default.
    RarestFirst,
    /// Fixed in-order window fetched from an external source, peers fill
    /// the lookahead beyond it.
    Windowed { bitrate: u32 },
    /// Small in-order window plus a trailing rarest-first lookahead window.
    DualWindow { bitrate: u32 },
    /// Per-peer download queues scheduled against playback deadlines.
    Deadline { bitrate: u32 },
}
