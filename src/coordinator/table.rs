//! The scheduling table of the deadline strategy.
//!
//! Each entry is a `(peer, piece, estimated finish time)` triple. The table
//! is queried through three views — the global list, per-peer queues and
//! per-piece queues, all ordered by finish time — that are derived from one
//! owned list, so an entry is reachable from every view or from none and
//! removal can never be partial.
//!
//! Finish times are estimated from each peer's measured throughput, and
//! every peer carries an adaptively tuned bound on how many requests may be
//! queued on it at once.

use std::collections::HashMap;

use crate::{ConnectionId, PieceIndex};

/// Queue growth factor on improving throughput.
const SIGMA: f64 = 1.0;
/// Queue shrink factor on degrading throughput.
const RHO: f64 = 0.1;

#[derive(Clone, Copy, Debug)]
struct Entry {
    peer: ConnectionId,
    piece: PieceIndex,
    /// Estimated seconds until this download finishes.
    finish: f64,
    /// Insertion order, the tie breaker for equal finish times.
    seq: u64,
}

pub(crate) struct ScheduleTable {
    entries: Vec<Entry>,
    /// Permitted queue length per peer; absent means the initial 1.
    queue_caps: HashMap<ConnectionId, usize>,
    piece_len: u32,
    /// Playback rate in pieces per second.
    rate: f64,
    next_seq: u64,
}

impl ScheduleTable {
    /// `bitrate` is the media bitrate in bits per second.
    pub fn new(piece_len: u32, bitrate: u32) -> Self {
        assert!(bitrate > 0, "deadline scheduling needs a nonzero bitrate");
        Self {
            entries: Vec::new(),
            queue_caps: HashMap::new(),
            piece_len,
            rate: f64::from(bitrate) / 8.0 / f64::from(piece_len),
            next_seq: 0,
        }
    }

    /// The playback deadline of a piece, in seconds from stream start.
    pub fn deadline(&self, piece: PieceIndex) -> f64 {
        piece as f64 / self.rate
    }

    pub fn queue_len(&self, peer: ConnectionId) -> usize {
        self.entries.iter().filter(|e| e.peer == peer).count()
    }

    pub fn queue_cap(&self, peer: ConnectionId) -> usize {
        self.queue_caps.get(&peer).copied().unwrap_or(1)
    }

    pub fn is_queue_full(&self, peer: ConnectionId) -> bool {
        self.queue_len(peer) >= self.queue_cap(peer)
    }

    pub fn is_requested(&self, piece: PieceIndex) -> bool {
        self.entries.iter().any(|e| e.piece == piece)
    }

    /// Pieces with at least one queued request, deduplicated.
    pub fn requested_pieces(&self) -> Vec<PieceIndex> {
        let mut pieces: Vec<_> = self.entries.iter().map(|e| e.piece).collect();
        pieces.sort_unstable();
        pieces.dedup();
        pieces
    }

    /// Head of the peer's queue: its earliest-finishing piece.
    pub fn first_in_queue(&self, peer: ConnectionId) -> Option<PieceIndex> {
        self.entries
            .iter()
            .filter(|e| e.peer == peer)
            .min_by(|a, b| {
                a.finish
                    .total_cmp(&b.finish)
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|e| e.piece)
    }

    /// Queues a request on the peer unless its queue is full.
    pub fn add_request(&mut self, peer: ConnectionId, piece: PieceIndex, finish: f64) -> bool {
        if self.is_queue_full(peer) {
            return false;
        }
        self.entries.push(Entry {
            peer,
            piece,
            finish,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        true
    }

    pub fn remove_request(&mut self, peer: ConnectionId, piece: PieceIndex) {
        self.entries.retain(|e| e.peer != peer || e.piece != piece);
    }

    /// Removes every queued request for a piece, returning the peers that
    /// held one.
    pub fn remove_piece(&mut self, piece: PieceIndex) -> Vec<ConnectionId> {
        let mut peers = Vec::new();
        self.entries.retain(|e| {
            if e.piece == piece {
                peers.push(e.peer);
                false
            } else {
                true
            }
        });
        peers
    }

    pub fn remove_peer(&mut self, peer: ConnectionId) {
        self.entries.retain(|e| e.peer != peer);
        self.queue_caps.remove(&peer);
    }

    /// Projected seconds until the peer finishes everything queued on it.
    pub fn all_downloads_finish(&self, peer: ConnectionId, speed: f64) -> f64 {
        let queued = self.queue_len(peer);
        if queued == 0 {
            return 0.0;
        }
        if speed == 0.0 {
            return f64::INFINITY;
        }
        f64::from(self.piece_len) * queued as f64 / speed
    }

    /// Projected finish time of one more piece queued on the peer after its
    /// current work.
    pub fn next_download_finish(&self, peer: ConnectionId, speed: f64) -> f64 {
        if speed == 0.0 {
            return f64::INFINITY;
        }
        self.all_downloads_finish(peer, speed) + f64::from(self.piece_len) / speed
    }

    /// Earliest projected finish of a piece across every peer downloading
    /// it, infinity when nobody is.
    pub fn earliest_finish(&self, piece: PieceIndex) -> f64 {
        self.entries
            .iter()
            .filter(|e| e.piece == piece)
            .map(|e| e.finish)
            .fold(f64::INFINITY, f64::min)
    }

    /// Whether some peer is projected to deliver the piece by its playback
    /// deadline.
    pub fn can_meet_deadline(&self, piece: PieceIndex) -> bool {
        self.earliest_finish(piece) <= self.deadline(piece)
    }

    /// Re-estimates the peer's finish times from its latest measured speed:
    /// the i-th queued piece finishes after `(i + 1) * piece_len / speed`
    /// seconds.
    pub fn update_times(&mut self, peer: ConnectionId, speed: f64) {
        let mut positions: Vec<usize> = (0..self.entries.len())
            .filter(|&i| self.entries[i].peer == peer)
            .collect();
        positions.sort_by(|&a, &b| {
            self.entries[a]
                .finish
                .total_cmp(&self.entries[b].finish)
                .then(self.entries[a].seq.cmp(&self.entries[b].seq))
        });
        for (rank, &i) in positions.iter().enumerate() {
            self.entries[i].finish = if speed == 0.0 {
                f64::INFINITY
            } else {
                (rank + 1) as f64 * f64::from(self.piece_len) / speed
            };
        }
    }

    /// Adapts the peer's permitted queue length to its throughput trend:
    /// grow by `(1 + SIGMA)` when throughput improved, shrink by
    /// `(1 - RHO)` with a floor of one when it degraded.
    pub fn update_queue_length(&mut self, peer: ConnectionId, old_speed: f64, new_speed: f64) {
        let cap = self.queue_cap(peer);
        let cap = if new_speed > old_speed {
            (cap as f64 * (1.0 + SIGMA)) as usize
        } else if new_speed < old_speed {
            ((cap as f64 * (1.0 - RHO)) as usize).max(1)
        } else {
            cap
        };
        self.queue_caps.insert(peer, cap);
    }
}
