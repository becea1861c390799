//! Deadline-driven selection for live and streaming playback.
//!
//! The policy keeps delivering pieces in time for the playback deadline
//! `piece / rate`. New work is chosen probabilistically between the first
//! wanted piece a ready peer has (favoring in-order delivery) and the
//! globally rarest piece over a bounded most-wanted set; a cap on
//! concurrently in-flight pieces prevents over-commitment. Three periodic
//! tasks drive it: picking new piece/peer pairings, rescheduling every
//! assignment projected to miss its deadline onto the least loaded
//! qualifying peer, and tuning the per-peer queue bounds to throughput.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use rand::Rng;

use crate::{
    coordinator::{
        table::ScheduleTable, Action, Book, SelectionPolicy, TimerKind, TimerSpec,
    },
    storage::StorageInfo,
    Bitfield, ConnectionId, PieceIndex,
};

/// How often a new most-wanted pairing is attempted.
const MOST_WANTED_INTERVAL: Duration = Duration::from_secs(1);
/// How often deadline misses are rescheduled.
const RESCHEDULE_INTERVAL: Duration = Duration::from_secs(40);
/// How often queue bounds are tuned; offset by half a period against the
/// reschedule pass.
const TUNE_QUEUE_INTERVAL: Duration = RESCHEDULE_INTERVAL;

/// A piece in flight longer than this may be handed out again.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the most-wanted candidate set.
const MOST_WANTED_BOUND: usize = 32;
/// Cap on concurrently in-flight pieces.
const MAX_INFLIGHT: usize = 32;
/// Probability of favoring the peer-order choice over the rarest choice.
const PEER_CHOICE_PROB: f64 = 0.8;

pub(crate) struct DeadlinePolicy {
    table: ScheduleTable,
    /// When each in-flight piece was handed out.
    downloading: HashMap<PieceIndex, Instant>,
    actions: Vec<Action>,
}

impl DeadlinePolicy {
    /// `bitrate` is the media bitrate in bits per second.
    pub fn new(info: &StorageInfo, bitrate: u32) -> Self {
        log::info!("deadline selection started at {} bit/s playback", bitrate);
        Self {
            table: ScheduleTable::new(info.piece_len, bitrate),
            downloading: HashMap::new(),
            actions: Vec::new(),
        }
    }

    /// One most-wanted choice. With `have` the candidates are limited to
    /// pieces that peer holds; without it any connected peer counts.
    fn most_wanted(&self, book: &Book, have: Option<&Bitfield>) -> Option<PieceIndex> {
        if self.downloading.len() > MAX_INFLIGHT {
            return None;
        }
        if rand::rng().random_bool(PEER_CHOICE_PROB) {
            self.first_available(book, have)
        } else {
            self.rarest_candidate(book, have)
        }
    }

    /// The first wanted piece that is available and not in flight within
    /// the download timeout.
    fn first_available(&self, book: &Book, have: Option<&Bitfield>) -> Option<PieceIndex> {
        for &piece in &book.wanted {
            let available = match have {
                Some(have) => have[piece],
                None => self.piece_available(book, piece),
            };
            let stale = match self.downloading.get(&piece) {
                Some(since) => since.elapsed() > DOWNLOAD_TIMEOUT,
                None => true,
            };
            if available && stale {
                return Some(piece);
            }
        }
        None
    }

    /// Whether some peer with queue capacity left holds the piece.
    fn piece_available(&self, book: &Book, piece: PieceIndex) -> bool {
        book.peers
            .iter()
            .any(|(&id, entry)| entry.have[piece] && !self.table.is_queue_full(id))
    }

    /// The globally rarest wanted piece not yet in flight, over a bounded
    /// candidate set, with random tie-breaking.
    fn rarest_candidate(&self, book: &Book, have: Option<&Bitfield>) -> Option<PieceIndex> {
        let mut ties: Vec<PieceIndex> = Vec::new();
        let mut best_frequency = usize::MAX;
        let mut considered = 0;
        for &piece in &book.wanted {
            if self.downloading.contains_key(&piece) || self.table.is_requested(piece) {
                continue;
            }
            let available = match have {
                Some(have) => have[piece],
                None => book.availability[piece] > 0,
            };
            if !available {
                continue;
            }
            considered += 1;
            if considered > MOST_WANTED_BOUND {
                break;
            }
            let frequency = book.availability[piece];
            if frequency < best_frequency {
                best_frequency = frequency;
                ties.clear();
                ties.push(piece);
            } else if frequency == best_frequency {
                ties.push(piece);
            }
        }
        if ties.is_empty() {
            None
        } else {
            Some(ties[rand::rng().random_range(0..ties.len())])
        }
    }

    /// Queues the piece on the qualifying peer with the smallest projected
    /// time to finish all its queued work including the new piece. Finding
    /// no qualifying peer is not an error; the piece is simply skipped
    /// until the next pass.
    fn assign(&mut self, book: &Book, piece: PieceIndex) {
        let candidate = book
            .peers
            .iter()
            .filter(|&(&id, ref entry)| entry.have[piece] && !self.table.is_queue_full(id))
            .min_by(|&(&a, ref ea), &(&b, ref eb)| {
                self.table
                    .next_download_finish(a, ea.rate.down)
                    .total_cmp(&self.table.next_download_finish(b, eb.rate.down))
            })
            .map(|(&id, entry)| (id, entry.rate.down));

        let Some((peer, speed)) = candidate else {
            log::debug!("no qualifying peer for piece {}, skipping", piece);
            return;
        };
        let finish = self.table.next_download_finish(peer, speed);
        self.table.add_request(peer, piece, finish);
        log::debug!(
            "queued piece {} on {} (estimated finish {:.1}s)",
            piece,
            peer,
            finish
        );
    }

    /// Cancels every queued request for a deadline-missing piece and
    /// re-assigns the piece to the currently fastest qualifying peer.
    fn reschedule_piece(&mut self, book: &Book, piece: PieceIndex) {
        for peer in self.table.remove_piece(piece) {
            self.actions.push(Action::CancelAssignment { peer, piece });
        }
        self.assign(book, piece);
    }

    /// The reschedule pass: refresh every peer's finish estimates, then
    /// re-route any in-flight piece projected to miss its playback
    /// deadline.
    fn reschedule(&mut self, book: &Book) {
        for (&id, entry) in &book.peers {
            self.table.update_times(id, entry.rate.down);
        }
        for piece in self.table.requested_pieces() {
            if !self.table.can_meet_deadline(piece) {
                log::debug!(
                    "piece {} projected to miss its {:.1}s deadline, rescheduling",
                    piece,
                    self.table.deadline(piece)
                );
                self.reschedule_piece(book, piece);
            }
        }
    }

    /// The queue tuning pass: compare each peer's throughput with the
    /// previous sample and adapt its queue bound.
    fn tune_queues(&mut self, book: &mut Book) {
        for (&id, entry) in book.peers.iter_mut() {
            let old_speed = entry.rate.last_tuned;
            let new_speed = entry.rate.down;
            self.table.update_queue_length(id, old_speed, new_speed);
            entry.rate.last_tuned = new_speed;
        }
    }
}

impl SelectionPolicy for DeadlinePolicy {
    fn timers(&self) -> Vec<TimerSpec> {
        vec![
            TimerSpec {
                kind: TimerKind::MostWanted,
                period: MOST_WANTED_INTERVAL,
                initial_delay: Duration::ZERO,
            },
            TimerSpec {
                kind: TimerKind::Reschedule,
                period: RESCHEDULE_INTERVAL,
                initial_delay: Duration::ZERO,
            },
            TimerSpec {
                kind: TimerKind::TuneQueues,
                period: TUNE_QUEUE_INTERVAL,
                initial_delay: TUNE_QUEUE_INTERVAL / 2,
            },
        ]
    }

    fn started(&mut self, book: &mut Book) {
        book.wanted.sort_unstable();
    }

    /// Serves the head of the peer's download queue, falling back to a
    /// fresh most-wanted choice when the queue is empty.
    fn want_piece(
        &mut self,
        book: &mut Book,
        peer: ConnectionId,
        have: &Bitfield,
    ) -> Option<PieceIndex> {
        let piece = match self.table.first_in_queue(peer) {
            Some(piece) => {
                self.table.remove_request(peer, piece);
                piece
            }
            None => self
                .most_wanted(book, Some(have))
                .filter(|&piece| have[piece])?,
        };
        self.downloading.insert(piece, Instant::now());
        Some(piece)
    }

    fn piece_completed(
        &mut self,
        _book: &mut Book,
        _from: Option<ConnectionId>,
        piece: PieceIndex,
        valid: bool,
    ) {
        self.downloading.remove(&piece);
        if valid {
            self.table.remove_piece(piece);
        }
    }

    fn assignment_released(&mut self, _book: &mut Book, _peer: ConnectionId, piece: PieceIndex) {
        self.downloading.remove(&piece);
    }

    fn peer_removed(&mut self, _book: &mut Book, peer: ConnectionId) {
        self.table.remove_peer(peer);
    }

    fn on_timer(&mut self, book: &mut Book, timer: TimerKind) {
        match timer {
            TimerKind::MostWanted => {
                if let Some(piece) = self.most_wanted(book, None) {
                    self.assign(book, piece);
                }
            }
            TimerKind::Reschedule => self.reschedule(book),
            TimerKind::TuneQueues => self.tune_queues(book),
            TimerKind::ForceAdvance => unreachable!("not a deadline policy timer"),
        }
    }

    fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::test_util::*;

    /// 16 KiB pieces at one piece per second of playback.
    fn policy(book: &Book) -> DeadlinePolicy {
        DeadlinePolicy::new(&book.info, 0x4000 * 8)
    }

    fn set_speed(book: &mut Book, peer: ConnectionId, speed: f64) {
        book.peers.get_mut(&peer).unwrap().rate.down = speed;
    }

    #[test]
    fn should_serve_queue_head_before_fresh_choices() {
        let mut book = empty_book(10, 0x4000);
        let peer = conn(1);
        add_peer(&mut book, peer, &[0, 1, 2]);
        let mut policy = policy(&book);

        policy.table.add_request(peer, 2, 1.0);
        let have = book.peers[&peer].have.clone();
        assert_eq!(policy.want_piece(&mut book, peer, &have), Some(2));
        // the queued request was consumed and the piece is now in flight
        assert_eq!(policy.table.queue_len(peer), 0);
        assert!(policy.downloading.contains_key(&2));
    }

    #[test]
    fn should_cap_concurrently_inflight_pieces() {
        let mut book = empty_book(MAX_INFLIGHT * 2, 0x4000);
        let peer = conn(1);
        let all: Vec<PieceIndex> = (0..book.info.piece_count).collect();
        add_peer(&mut book, peer, &all);
        let mut policy = policy(&book);

        for piece in 0..=MAX_INFLIGHT {
            policy.downloading.insert(piece, Instant::now());
        }
        assert_eq!(policy.most_wanted(&book, None), None);
    }

    #[test]
    fn should_not_reissue_pieces_within_the_timeout() {
        let mut book = empty_book(4, 0x4000);
        let peer = conn(1);
        add_peer(&mut book, peer, &[0, 1]);
        let mut policy = policy(&book);

        policy.downloading.insert(0, Instant::now());
        // piece 0 is fresh in flight, so the in-order choice must skip to 1
        assert_eq!(policy.first_available(&book, None), Some(1));

        // an assignment stalled past the timeout is fair game again
        policy
            .downloading
            .insert(0, Instant::now() - DOWNLOAD_TIMEOUT * 2);
        assert_eq!(policy.first_available(&book, None), Some(0));
    }

    #[test]
    fn should_assign_to_least_loaded_peer() {
        let mut book = empty_book(10, 0x4000);
        let (busy, idle) = (conn(1), conn(2));
        add_peer(&mut book, busy, &[5]);
        add_peer(&mut book, idle, &[5]);
        set_speed(&mut book, busy, 100.0);
        set_speed(&mut book, idle, 100.0);
        let mut policy = policy(&book);

        policy.table.update_queue_length(busy, 0.0, 1.0); // cap 2
        policy.table.add_request(busy, 1, 100.0);

        policy.assign(&book, 5);
        assert_eq!(policy.table.first_in_queue(idle), Some(5));
        assert_eq!(policy.table.queue_len(busy), 1);
    }

    /// After a reschedule pass no assignment that is projected to miss its
    /// playback deadline survives untouched: a synthetic ten-piece torrent
    /// with one slow and one fast peer must end up with every queued
    /// request on the fast peer and cancels issued for the slow one.
    #[test]
    fn reschedule_moves_deadline_misses_to_the_fast_peer() {
        let mut book = empty_book(10, 0x4000);
        let (slow, fast) = (conn(1), conn(2));
        let all: Vec<PieceIndex> = (0..10).collect();
        add_peer(&mut book, slow, &all);
        add_peer(&mut book, fast, &all);
        // the slow peer moves a piece in ~16 s, far past the one-piece-per-
        // second playback; the fast peer moves ten pieces per second
        set_speed(&mut book, slow, f64::from(0x4000u32) / 16.0);
        set_speed(&mut book, fast, f64::from(0x4000u32) * 10.0);

        let mut policy = policy(&book);
        policy.table.update_queue_length(slow, 0.0, 1.0); // cap 2
        policy.table.update_queue_length(fast, 0.0, 1.0); // cap 2
        policy.table.add_request(slow, 4, 0.0);
        policy.table.add_request(slow, 8, 0.0);

        policy.on_timer(&mut book, TimerKind::Reschedule);

        // every deadline-missing assignment was cancelled on the slow peer
        // and re-queued on the fast one
        let actions = policy.take_actions();
        assert_eq!(actions.len(), 2);
        for action in actions {
            match action {
                Action::CancelAssignment { peer, .. } => assert_eq!(peer, slow),
                _ => panic!("expected only cancels"),
            }
        }
        assert_eq!(policy.table.queue_len(slow), 0);
        assert_eq!(policy.table.queue_len(fast), 2);
        for piece in policy.table.requested_pieces() {
            assert!(policy.table.can_meet_deadline(piece));
        }
    }
}
