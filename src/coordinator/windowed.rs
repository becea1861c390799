//! Windowed-sequential selection.
//!
//! The wanted pieces are walked through fixed-size windows sized to cover
//! about twenty seconds of playback. The pieces of the current window come
//! from the external byte-range source on a background fetch; peers are
//! only asked for pieces beyond the window, filling the lookahead. When the
//! window's missing set drains, the window slides forward, skipping ranges
//! that hold nothing still wanted, and a fresh background fetch starts.

use std::collections::HashMap;

use crate::{
    coordinator::{Action, Book, SelectionPolicy},
    storage::StorageInfo,
    Bitfield, ConnectionId, PieceIndex,
};

/// Playback seconds one window covers.
const WINDOW_SECS: u64 = 20;

pub(crate) struct WindowedPolicy {
    /// Window size in pieces.
    window_size: usize,
    /// First piece of the current window.
    window_pos: usize,
    /// Still-wanted pieces of the current window, fetched externally.
    missing: Vec<PieceIndex>,
    /// Pieces handed to a peer beyond the window, by requesting peer.
    requested: HashMap<PieceIndex, ConnectionId>,
    actions: Vec<Action>,
}

impl WindowedPolicy {
    /// `bitrate` is the media bitrate in bits per second.
    pub fn new(info: &StorageInfo, bitrate: u32) -> Self {
        assert!(bitrate > 0, "windowed strategy needs a nonzero bitrate");
        let window_bytes = u64::from(bitrate) / 8 * WINDOW_SECS;
        let window_size = window_bytes.div_ceil(u64::from(info.piece_len)).max(1) as usize;
        log::info!("windowed selection started with window size {}", window_size);
        Self {
            window_size,
            window_pos: 0,
            missing: Vec::new(),
            requested: HashMap::new(),
            actions: Vec::new(),
        }
    }

    fn refill_missing(&mut self, book: &Book) {
        self.missing = book
            .wanted
            .iter()
            .copied()
            .filter(|&piece| self.window_pos <= piece && piece < self.window_pos + self.window_size)
            .collect();
        self.missing.sort_unstable();
    }

    /// Slides the window forward until it again covers at least one wanted
    /// piece, then schedules its fetch. Pieces left wanted behind the window
    /// (an earlier fetch failed while the window moved on) are picked up by
    /// wrapping back to the earliest wanted piece.
    fn advance(&mut self, book: &Book) {
        while self.missing.is_empty() && !book.wanted.is_empty() {
            if self.window_pos + self.window_size < book.info.piece_count {
                self.window_pos += self.window_size;
            } else {
                let earliest = *book.wanted.iter().min().expect("wanted is nonempty");
                self.window_pos = earliest / self.window_size * self.window_size;
            }
            self.refill_missing(book);
        }
        if !self.missing.is_empty() {
            self.actions.push(Action::FetchWindow {
                pieces: self.missing.clone(),
                window: self.window_pos,
            });
        }
    }
}

impl SelectionPolicy for WindowedPolicy {
    fn started(&mut self, book: &mut Book) {
        book.wanted.sort_unstable();
        self.refill_missing(book);
        if !self.missing.is_empty() {
            self.actions.push(Action::FetchWindow {
                pieces: self.missing.clone(),
                window: self.window_pos,
            });
        }
    }

    /// Serves only pieces beyond the current window, closest first. The
    /// requested piece drops to the end of the wanted list so the window
    /// advance prefers untouched pieces.
    fn want_piece(
        &mut self,
        book: &mut Book,
        peer: ConnectionId,
        have: &Bitfield,
    ) -> Option<PieceIndex> {
        let from = self.window_pos + self.window_size;
        for piece in from..book.info.piece_count {
            if have[piece]
                && book.wanted_contains(piece)
                && !book.pending.contains(&piece)
                && !self.requested.contains_key(&piece)
            {
                self.requested.insert(piece, peer);
                book.move_to_end(piece);
                return Some(piece);
            }
        }
        None
    }

    fn piece_completed(
        &mut self,
        book: &mut Book,
        _from: Option<ConnectionId>,
        piece: PieceIndex,
        valid: bool,
    ) {
        if !valid {
            // the piece stays wanted; if it sat in the current window, retry
            // the remainder so the window can still drain
            if self.missing.contains(&piece) {
                self.actions.push(Action::FetchWindow {
                    pieces: self.missing.clone(),
                    window: self.window_pos,
                });
            }
            return;
        }

        self.requested.remove(&piece);
        self.missing.retain(|&p| p != piece);
        if self.missing.is_empty() {
            self.advance(book);
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

    fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::test_util::*;

    fn policy(book: &mut Book, bitrate: u32) -> WindowedPolicy {
        let mut policy = WindowedPolicy::new(&book.info, bitrate);
        policy.started(book);
        policy
    }

    fn complete(book: &mut Book, policy: &mut WindowedPolicy, piece: PieceIndex) {
        book.own.set(piece, true);
        book.wanted.retain(|&p| p != piece);
        book.pending.remove(&piece);
        policy.piece_completed(book, None, piece, true);
    }

    #[test]
    fn should_size_window_from_bitrate() {
        let book = empty_book(100, 0x4000);
        // 64 KiB/s of media over 20 s is 1.25 MiB, or 80 pieces of 16 KiB
        let policy = WindowedPolicy::new(&book.info, 64 * 1024 * 8);
        assert_eq!(policy.window_size, 80);

        // tiny bitrates still get a window of one piece
        let policy = WindowedPolicy::new(&book.info, 8);
        assert_eq!(policy.window_size, 1);
    }

    #[test]
    fn should_fetch_first_window_on_start() {
        let mut book = empty_book(10, 0x4000);
        // bitrate chosen so the window covers two pieces
        let mut policy = policy(&mut book, 2 * 0x4000 * 8 / 20);
        assert_eq!(policy.window_size, 2);

        match policy.take_actions().as_slice() {
            [Action::FetchWindow { pieces, window }] => {
                assert_eq!(pieces, &[0, 1]);
                assert_eq!(*window, 0);
            }
            other => panic!("expected one fetch, got {} actions", other.len()),
        }
    }

    #[test]
    fn should_only_serve_pieces_beyond_the_window() {
        let mut book = empty_book(10, 0x4000);
        let mut policy = policy(&mut book, 2 * 0x4000 * 8 / 20);
        policy.take_actions();

        let peer = conn(1);
        add_peer(&mut book, peer, &[0, 1, 2, 3]);
        let have = book.peers[&peer].have.clone();

        // pieces 0 and 1 belong to the window; 2 is the first the peer may
        // take, and a repeat call must not hand out the same piece again
        assert_eq!(policy.want_piece(&mut book, peer, &have), Some(2));
        assert_eq!(policy.want_piece(&mut book, peer, &have), Some(3));
        assert_eq!(policy.want_piece(&mut book, peer, &have), None);

        // the requested pieces moved to the end of the wanted list
        assert_eq!(book.wanted, vec![0, 1, 4, 5, 6, 7, 8, 9, 2, 3]);
    }

    #[test]
    fn should_advance_window_when_missing_set_drains() {
        let mut book = empty_book(10, 0x4000);
        let mut policy = policy(&mut book, 2 * 0x4000 * 8 / 20);
        policy.take_actions();

        // pieces 2 and 3 complete out of band first, so the next window is
        // empty and gets skipped
        complete(&mut book, &mut policy, 2);
        complete(&mut book, &mut policy, 3);
        policy.take_actions();

        complete(&mut book, &mut policy, 0);
        assert!(policy.take_actions().is_empty());
        complete(&mut book, &mut policy, 1);

        assert_eq!(policy.window_pos, 4);
        match policy.take_actions().as_slice() {
            [Action::FetchWindow { pieces, window }] => {
                assert_eq!(pieces, &[4, 5]);
                assert_eq!(*window, 4);
            }
            _ => panic!("expected a fetch for the next window"),
        }
    }

    #[test]
    fn should_reoffer_pieces_after_requester_disconnects() {
        let mut book = empty_book(10, 0x4000);
        let mut policy = policy(&mut book, 2 * 0x4000 * 8 / 20);
        policy.take_actions();

        let first = conn(1);
        add_peer(&mut book, first, &[5]);
        let have = book.peers[&first].have.clone();
        assert_eq!(policy.want_piece(&mut book, first, &have), Some(5));
        assert_eq!(policy.want_piece(&mut book, first, &have), None);

        policy.peer_removed(&mut book, first);
        let second = conn(2);
        add_peer(&mut book, second, &[5]);
        let have = book.peers[&second].have.clone();
        assert_eq!(policy.want_piece(&mut book, second, &have), Some(5));
    }
}
