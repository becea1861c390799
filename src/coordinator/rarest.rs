//! The default selection policy: rarest piece first.

use crate::{
    coordinator::{Book, SelectionPolicy},
    Bitfield, ConnectionId, PieceIndex,
};

/// Picks, among the pieces the calling peer has and we still want, the one
/// held by the fewest peers. Ties break to the lowest index so selection is
/// deterministic.
#[derive(Default)]
pub(crate) struct RarestFirst;

impl SelectionPolicy for RarestFirst {
    fn want_piece(
        &mut self,
        book: &mut Book,
        _peer: ConnectionId,
        have: &Bitfield,
    ) -> Option<PieceIndex> {
        let mut best: Option<(usize, PieceIndex)> = None;
        for &piece in &book.wanted {
            if book.pending.contains(&piece) || !have[piece] {
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

    fn piece_completed(
        &mut self,
        _book: &mut Book,
        _from: Option<ConnectionId>,
        _piece: PieceIndex,
        _valid: bool,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::test_util::*;

    #[test]
    fn should_pick_the_rarest_piece_first() {
        let mut book = empty_book(3, 16);
        // both remote peers hold piece 1, only one holds piece 2
        add_peer(&mut book, conn(1), &[1, 2]);
        add_peer(&mut book, conn(2), &[1]);

        let requester = conn(3);
        add_peer(&mut book, requester, &[1, 2]);

        let mut policy = RarestFirst;
        let have = book.peers[&requester].have.clone();
        // piece 2 has fewer holders than piece 1
        assert_eq!(policy.want_piece(&mut book, requester, &have), Some(2));

        book.pending.insert(2);
        assert_eq!(policy.want_piece(&mut book, requester, &have), Some(1));

        book.pending.insert(1);
        assert_eq!(policy.want_piece(&mut book, requester, &have), None);
    }

    #[test]
    fn should_break_ties_by_lowest_index() {
        let mut book = empty_book(4, 16);
        let requester = conn(1);
        add_peer(&mut book, requester, &[1, 3]);

        let mut policy = RarestFirst;
        let have = book.peers[&requester].have.clone();
        assert_eq!(policy.want_piece(&mut book, requester, &have), Some(1));
    }

    #[test]
    fn should_never_pick_a_piece_the_peer_lacks() {
        let mut book = empty_book(4, 16);
        add_peer(&mut book, conn(1), &[0, 1, 2, 3]);
        let requester = conn(2);
        add_peer(&mut book, requester, &[]);

        let mut policy = RarestFirst;
        let have = book.peers[&requester].have.clone();
        assert_eq!(policy.want_piece(&mut book, requester, &have), None);
    }
}
