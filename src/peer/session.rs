//! Connection-scoped peer state.

use crate::{
    peer::state::{ChokeState, InterestState},
    Bitfield, PeerId, PieceIndex,
};

/// Number of one-second samples the throughput window keeps.
const THROUGHPUT_WINDOW: usize = 20;

/// State of one remote peer for the lifetime of its connection.
///
/// Everything here is owned by the connection's task; the coordinator keeps
/// its own copy of the peer's bitfield for selection so that teardown can
/// remove the availability contribution atomically.
pub(crate) struct Session {
    /// The remote peer id, known once the handshake completed.
    pub peer_id: Option<PeerId>,
    /// Client name decoded from the peer id, for log lines.
    pub client: String,
    /// The pieces the peer advertised via bitfield and have messages.
    pub pieces: Bitfield,
    /// Local -> peer: are we serving their requests?
    pub choking_peer: ChokeState,
    /// Local -> peer: do we want their pieces?
    pub interested_in_peer: InterestState,
    /// Peer -> local: are they serving our requests?
    pub peer_choking: ChokeState,
    /// Peer -> local: do they want our pieces?
    pub peer_interested: InterestState,
    /// Total payload bytes downloaded from this peer.
    pub downloaded: u64,
    /// Total payload bytes uploaded to this peer.
    pub uploaded: u64,
    /// Set once the peer's bitfield becomes all ones. Seed-to-seed links
    /// are dropped after the download completes.
    pub is_seed: bool,
    /// Pieces that became available locally and still need a have message
    /// sent to this peer.
    pub pending_haves: Vec<PieceIndex>,
    throughput: Throughput,
}

impl Session {
    pub fn new(piece_count: usize) -> Self {
        Self {
            peer_id: None,
            client: String::from("Unknown"),
            pieces: Bitfield::repeat(false, piece_count),
            choking_peer: ChokeState::default(),
            interested_in_peer: InterestState::default(),
            peer_choking: ChokeState::default(),
            peer_interested: InterestState::default(),
            downloaded: 0,
            uploaded: 0,
            is_seed: false,
            pending_haves: Vec::new(),
            throughput: Throughput::default(),
        }
    }

    /// Re-checks the seed flag after a bitfield or have update. Returns true
    /// the one time the peer becomes a seed.
    pub fn update_seed(&mut self) -> bool {
        if !self.is_seed && self.pieces.all() {
            self.is_seed = true;
            true
        } else {
            false
        }
    }

    /// Records a one-second throughput sample and returns the current
    /// `(download, upload)` rates in bytes per second, averaged over the
    /// sample window.
    pub fn record_second(&mut self) -> (f64, f64) {
        self.throughput.sample(self.downloaded, self.uploaded);
        (self.throughput.down_rate(), self.throughput.up_rate())
    }
}

/// Rolling throughput window of one-second byte deltas.
#[derive(Default)]
struct Throughput {
    down: [u64; THROUGHPUT_WINDOW],
    up: [u64; THROUGHPUT_WINDOW],
    pos: usize,
    last_down: u64,
    last_up: u64,
}

impl Throughput {
    fn sample(&mut self, downloaded: u64, uploaded: u64) {
        if self.pos == THROUGHPUT_WINDOW {
            self.pos = 0;
        }
        self.down[self.pos] = downloaded - self.last_down;
        self.up[self.pos] = uploaded - self.last_up;
        self.last_down = downloaded;
        self.last_up = uploaded;
        self.pos += 1;
    }

    fn down_rate(&self) -> f64 {
        self.down.iter().sum::<u64>() as f64 / THROUGHPUT_WINDOW as f64
    }

    fn up_rate(&self) -> f64 {
        self.up.iter().sum::<u64>() as f64 / THROUGHPUT_WINDOW as f64
    }
}

/// Decodes the client name advertised through the peer id convention.
pub(crate) fn client_name(peer_id: &PeerId) -> String {
    // Azureus style: -XX1234-
    if peer_id[0] == b'-' && peer_id[7] == b'-' {
        let client = match &peer_id[1..3] {
            b"AZ" => "Azureus",
            b"BC" => "BitComet",
            b"CT" => "CTorrent",
            b"DE" => "Deluge",
            b"LT" => "libtorrent",
            b"lt" => "libTorrent",
            b"qB" => "qBittorrent",
            b"TR" => "Transmission",
            b"UT" => "uTorrent",
            _ => return String::from("Unknown"),
        };
        let v = &peer_id[3..7];
        if v.iter().all(u8::is_ascii_alphanumeric) {
            return format!(
                "{} {}.{}.{}.{}",
                client, v[0] as char, v[1] as char, v[2] as char, v[3] as char
            );
        }
        return String::from(client);
    }

    // Shadow style: a single letter followed by version characters
    let client = match peer_id[0] {
        b'A' => "ABC",
        b'M' => "Mainline",
        b'S' => "Shadow's client",
        b'T' => "BitTornado",
        _ => return String::from("Unknown"),
    };
    format!(
        "{} {}.{}.{}",
        client, peer_id[1] as char, peer_id[2] as char, peer_id[3] as char
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_average_throughput_over_the_window() {
        let mut session = Session::new(4);
        session.downloaded = 200;
        let (down, up) = session.record_second();
        assert_eq!(down, 200.0 / THROUGHPUT_WINDOW as f64);
        assert_eq!(up, 0.0);

        // a second with no traffic lowers nothing; the delta is just zero
        let (down, _) = session.record_second();
        assert_eq!(down, 200.0 / THROUGHPUT_WINDOW as f64);

        // old samples fall out of the window once it wraps
        for _ in 0..THROUGHPUT_WINDOW {
            session.record_second();
        }
        let (down, _) = session.record_second();
        assert_eq!(down, 0.0);
    }

    #[test]
    fn should_mark_seed_once() {
        let mut session = Session::new(3);
        session.pieces.set(0, true);
        assert!(!session.update_seed());
        session.pieces.set(1, true);
        session.pieces.set(2, true);
        assert!(session.update_seed());
        assert!(!session.update_seed());
        assert!(session.is_seed);
    }

    #[test]
    fn should_decode_client_names() {
        assert_eq!(client_name(b"-TR4060-abcdefghijkl"), "Transmission 4.0.6.0");
        assert_eq!(client_name(b"T03I-----abcdefghijk"), "BitTornado 0.3.I");
        assert_eq!(client_name(b"-xy1234-abcdefghijkl"), "Unknown");
        assert_eq!(client_name(b"00000000000000000000"), "Unknown");
    }
}
