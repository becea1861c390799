//! Dual-window selection for video-on-demand playback.
//!
//! Two positions move through the torrent: a small strictly in-order window
//! that peers fill first, and a larger trailing rarest-first lookahead
//! window served once the in-order window has been fully handed out. When
//! every piece of the in-order window is requested, whatever the peers have
//! not delivered yet is scheduled onto the external source and the window
//! clears. A periodic timer force-advances both positions regardless, so a
//! stalling window can never pin playback.

use std::{collections::HashMap, time::Duration};

use crate::{
    coordinator::{Action, Book, SelectionPolicy, TimerKind, TimerSpec},
    storage::StorageInfo,
    Bitfield, ConnectionId, PieceIndex,
};

/// Estimated look-ahead delay in seconds; sizes the in-order window and
/// paces the force-advance timer.
const LOOKAHEAD_SECS: u64 = 30;

/// Size of the trailing rarest-first window, in pieces.
const RAREST_WINDOW: usize = 100;

pub(crate) struct DualWindowPolicy {
    /// In-order window size in pieces.
    w1: usize,
    /// Wanted pieces of the current in-order window, ascending.
    in_order: Vec<PieceIndex>,
    /// First piece of the in-order window.
    pos_in_order: usize,
    /// Start of the rarest-first lookahead window.
    pos_rarest: usize,
    /// In-order pieces already handed to a peer, by requesting peer.
    requested: HashMap<PieceIndex, ConnectionId>,
    actions: Vec<Action>,
}

impl DualWindowPolicy {
    /// `bitrate` is the media bitrate in bits per second.
    pub fn new(info: &StorageInfo, bitrate: u32) -> Self {
        assert!(bitrate > 0, "dual-window strategy needs a nonzero bitrate");
        let window_bytes = LOOKAHEAD_SECS * u64::from(bitrate) / 8;
        let w1 = (window_bytes / u64::from(info.piece_len)).max(1) as usize;
        log::info!("dual-window selection started with in-order window {}", w1);
        Self {
            w1,
            in_order: Vec::new(),
            pos_in_order: 0,
            pos_rarest: w1,
            requested: HashMap::new(),
            actions: Vec::new(),
        }
    }

    fn refill_in_order(&mut self, book: &Book) {
        self.in_order = book
            .wanted
            .iter()
            .copied()
            .filter(|&piece| {
                self.pos_in_order <= piece && piece < self.pos_in_order + self.w1
            })
            .collect();
        self.in_order.sort_unstable();
    }

    /// Advances both windows. The rarest-first position keeps at least `w1`
    /// pieces of headroom over the in-order window.
    fn advance_windows(&mut self, book: &Book) {
        let headroom = self.pos_rarest as i64 - (self.pos_in_order + self.w1) as i64;
        let shortfall = self.w1 as i64 - headroom;
        if shortfall > 0 {
            self.pos_rarest += shortfall as usize;
        }
        self.pos_in_order += self.w1;
        self.refill_in_order(book);
    }

    /// Rarest still-wanted piece the peer has within the lookahead window.
    fn pick_rarest(&self, book: &Book, have: &Bitfield) -> Option<PieceIndex> {
        let mut best: Option<(usize, PieceIndex)> = None;
        for &piece in &book.wanted {
            if piece < self.pos_rarest || piece >= self.pos_rarest + RAREST_WINDOW {
                continue;
            }
            if !have[piece] || book.pending.contains(&piece) {
                continue;
            }
            let frequency = book.availability[piece];
            let better = match best {
                None => true,
                Some((best_frequency, best_piece)) => {
                    frequency < best_frequency
                        || (frequency == best_frequency && piece < best_piece)
                }
            };
            if better {
                best = Some((frequency, piece));
            }
        }
        best.map(|(_, piece)| piece)
    }
}

impl SelectionPolicy for DualWindowPolicy {
    fn timers(&self) -> Vec<TimerSpec> {
        vec![TimerSpec {
            kind: TimerKind::ForceAdvance,
            period: Duration::from_secs(LOOKAHEAD_SECS),
            initial_delay: Duration::from_secs(LOOKAHEAD_SECS),
        }]
    }

    fn started(&mut self, book: &mut Book) {
        book.wanted.sort_unstable();
        self.refill_in_order(book);
    }

    fn want_piece(
        &mut self,
        book: &mut Book,
        peer: ConnectionId,
        have: &Bitfield,
    ) -> Option<PieceIndex> {
        if self.in_order.is_empty() {
            return self.pick_rarest(book, have);
        }

        for i in 0..self.in_order.len() {
            let piece = self.in_order[i];
            if !have[piece] || self.requested.contains_key(&piece) {
                continue;
            }
            self.requested.insert(piece, peer);

            // once the whole window is handed out, the undelivered remainder
            // goes to the external source and the window clears
            if self
                .in_order
                .iter()
                .all(|p| self.requested.contains_key(p))
            {
                self.actions.push(Action::FetchWindow {
                    pieces: self.in_order.clone(),
                    window: self.pos_in_order,
                });
                self.in_order.clear();
                self.requested.clear();
            }
            return Some(piece);
        }
        None
    }

    fn piece_completed(
        &mut self,
        _book: &mut Book,
        _from: Option<ConnectionId>,
        piece: PieceIndex,
        valid: bool,
    ) {
        if valid {
            self.in_order.retain(|&p| p != piece);
            self.requested.remove(&piece);
            if piece == self.pos_rarest {
                self.pos_rarest += 1;
            }
        }
    }

    fn assignment_released(&mut self, _book: &mut Book, peer: ConnectionId, piece: PieceIndex) {
        if self.requested.get(&piece) == Some(&peer) {
            self.requested.remove(&piece);
        }
    }

    fn peer_removed(&mut self, _book: &mut Book, peer: ConnectionId) {
        self.requested.retain(|_, &mut requester| requester != peer);
    }

    /// The periodic force-advance: anything peers did not deliver in time
    /// goes to the external source, then both windows move forward whether
    /// or not the in-order window was satisfied.
    fn on_timer(&mut self, book: &mut Book, timer: TimerKind) {
        debug_assert_eq!(timer, TimerKind::ForceAdvance);
        self.requested.clear();
        if !self.in_order.is_empty() {
            self.actions.push(Action::FetchWindow {
                pieces: self.in_order.clone(),
                window: self.pos_in_order,
            });
        }
        self.advance_windows(book);
    }

    fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::test_util::*;

    /// Geometry where the in-order window covers three 16 KiB pieces:
    /// 16 kbit/s over 30 s is 60 KiB, which floors to three pieces.
    fn policy(book: &mut Book) -> DualWindowPolicy {
        let mut policy = DualWindowPolicy::new(&book.info, 0x4000);
        policy.started(book);
        assert_eq!(policy.w1, 3);
        policy
    }

    fn complete(book: &mut Book, policy: &mut DualWindowPolicy, piece: PieceIndex) {
        book.own.set(piece, true);
        book.wanted.retain(|&p| p != piece);
        book.pending.remove(&piece);
        policy.piece_completed(book, None, piece, true);
    }

    #[test]
    fn should_fill_the_in_order_window_first() {
        let mut book = empty_book(200, 0x4000);
        let mut policy = policy(&mut book);

        let peer = conn(1);
        add_peer(&mut book, peer, &[0, 1, 2, 50]);
        let have = book.peers[&peer].have.clone();

        assert_eq!(policy.want_piece(&mut book, peer, &have), Some(0));
        assert_eq!(policy.want_piece(&mut book, peer, &have), Some(1));
        // handing out the last window piece schedules the window on the
        // external source and clears it
        assert_eq!(policy.want_piece(&mut book, peer, &have), Some(2));
        match policy.take_actions().as_slice() {
            [Action::FetchWindow { pieces, window }] => {
                assert_eq!(pieces, &[0, 1, 2]);
                assert_eq!(*window, 0);
            }
            _ => panic!("expected the window hand-off fetch"),
        }
        assert!(policy.in_order.is_empty());
    }

    #[test]
    fn should_serve_rarest_lookahead_once_window_is_empty() {
        let mut book = empty_book(200, 0x4000);
        let mut policy = policy(&mut book);
        for piece in [0, 1, 2] {
            complete(&mut book, &mut policy, piece);
        }
        assert!(policy.in_order.is_empty());

        // lookahead starts at pos_rarest = 3; piece 4 is rarer than 3
        add_peer(&mut book, conn(1), &[3]);
        let peer = conn(2);
        add_peer(&mut book, peer, &[3, 4]);
        let have = book.peers[&peer].have.clone();
        assert_eq!(policy.want_piece(&mut book, peer, &have), Some(4));

        // pieces beyond the lookahead window are out of reach
        let far = conn(3);
        add_peer(&mut book, far, &[150]);
        let have = book.peers[&far].have.clone();
        assert_eq!(policy.want_piece(&mut book, far, &have), None);
    }

    #[test]
    fn should_advance_rarest_position_past_completed_piece() {
        let mut book = empty_book(200, 0x4000);
        let mut policy = policy(&mut book);
        assert_eq!(policy.pos_rarest, 3);
        complete(&mut book, &mut policy, 3);
        assert_eq!(policy.pos_rarest, 4);
        // completing elsewhere leaves the position alone
        complete(&mut book, &mut policy, 10);
        assert_eq!(policy.pos_rarest, 4);
    }

    #[test]
    fn should_force_advance_an_unfinished_window() {
        let mut book = empty_book(200, 0x4000);
        let mut policy = policy(&mut book);

        let peer = conn(1);
        add_peer(&mut book, peer, &[0]);
        let have = book.peers[&peer].have.clone();
        assert_eq!(policy.want_piece(&mut book, peer, &have), Some(0));

        policy.on_timer(&mut book, TimerKind::ForceAdvance);

        // the stalled window went to the external source...
        match policy.take_actions().as_slice() {
            [Action::FetchWindow { pieces, window }] => {
                assert_eq!(pieces, &[0, 1, 2]);
                assert_eq!(*window, 0);
            }
            _ => panic!("expected a fetch of the abandoned window"),
        }
        // ...and both positions moved forward with full headroom restored
        assert_eq!(policy.pos_in_order, 3);
        assert_eq!(policy.in_order, vec![3, 4, 5]);
        assert_eq!(policy.pos_rarest, policy.pos_in_order + policy.w1);
        // the abandoned pieces are still wanted, satisfying the wanted-set
        // invariant for later retry
        assert!(book.wanted_contains(0));
    }
}
