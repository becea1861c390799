//! The piece coordinator.
//!
//! The [`Coordinator`] owns all download bookkeeping shared between peer
//! connections: the ordered wanted-pieces set, per-piece availability
//! counts, piece assembly and hash verification, and the per-peer registry.
//! The question *which piece should this peer download next* is delegated
//! to a [`SelectionPolicy`] chosen at construction; shared bookkeeping
//! never moves into a policy.
//!
//! A single mutex per torrent serializes every entry point, the same
//! coarse-grained discipline the per-connection tasks rely on: a session's
//! availability contribution is removed atomically with its deregistration,
//! so no selection pass can observe a half-torn-down peer.

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use sha1::{Digest, Sha1};
use tokio::{sync::watch, task, time};

use crate::{
    conf::{Conf, Limit, Strategy},
    listener::Listener,
    peer::{codec::Handshake, throttle::RateLimiter, Command, CommandSender},
    piece::PieceState,
    source::ExternalSource,
    storage::{Storage, StorageInfo},
    Bitfield, BlockInfo, ConnectionId, PieceIndex, BLOCK_LEN,
};

mod deadline;
mod dual_window;
mod rarest;
mod table;
mod windowed;

/// Everything needed to construct a coordinator.
pub struct Params {
    pub conf: Conf,
    pub info: StorageInfo,
    /// The torrent's info hash, exchanged in handshakes.
    pub info_hash: [u8; 20],
    /// Expected SHA-1 digest of every piece, in index order.
    pub piece_hashes: Vec<[u8; 20]>,
    pub storage: Arc<dyn Storage>,
    /// Byte-range fallback used by the windowed strategies. Optional; the
    /// strategies degrade to peer-only downloading without it.
    pub source: Option<Arc<dyn ExternalSource>>,
    pub listeners: Vec<Arc<dyn Listener>>,
}

/// Shared download bookkeeping for one torrent.
pub(crate) struct Book {
    pub(crate) info: StorageInfo,
    /// Pieces still to download, in selection order. Policies may reorder
    /// it to express priority.
    pub(crate) wanted: Vec<PieceIndex>,
    /// How many connected peers hold each piece.
    pub(crate) availability: Vec<usize>,
    /// The pieces we have, downloaded and verified.
    pub(crate) own: Bitfield,
    /// Pieces currently assigned to a peer or an external fetch.
    pub(crate) pending: HashSet<PieceIndex>,
    pub(crate) peers: HashMap<ConnectionId, PeerEntry>,
    pieces: Vec<PieceState>,
    assignments: HashMap<ConnectionId, Assignment>,
    halted: bool,
}

impl Book {
    fn new(info: StorageInfo, own: Bitfield) -> Self {
        let wanted = (0..info.piece_count).filter(|&i| !own[i]).collect();
        Self {
            wanted,
            availability: vec![0; info.piece_count],
            pieces: PieceState::create_states(&info),
            pending: HashSet::new(),
            peers: HashMap::new(),
            assignments: HashMap::new(),
            halted: false,
            own,
            info,
        }
    }

    pub(crate) fn wanted_contains(&self, piece: PieceIndex) -> bool {
        self.wanted.contains(&piece)
    }

    /// Demotes a piece to the end of the wanted list.
    pub(crate) fn move_to_end(&mut self, piece: PieceIndex) {
        if let Some(pos) = self.wanted.iter().position(|&p| p == piece) {
            self.wanted.remove(pos);
            self.wanted.push(piece);
        }
    }
}

/// Per-peer state the coordinator tracks on behalf of the policies.
pub(crate) struct PeerEntry {
    /// The coordinator's copy of the peer's advertised pieces.
    pub(crate) have: Bitfield,
    /// Measured transfer rates, fed by the connection's one-second samples.
    pub(crate) rate: PeerRate,
    pub(crate) is_seed: bool,
    cmd: CommandSender,
}

/// Measured download throughput of one peer, in bytes per second.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PeerRate {
    pub(crate) down: f64,
    /// The rate observed at the last queue-tuning pass.
    pub(crate) last_tuned: f64,
}

/// The blocks of one piece being requested from one peer, in order.
struct Assignment {
    piece: PieceIndex,
    len: u32,
    next_offset: u32,
}

impl Assignment {
    fn new(piece: PieceIndex, len: u32) -> Self {
        Self {
            piece,
            len,
            next_offset: 0,
        }
    }

    fn next_block(&mut self) -> Option<BlockInfo> {
        if self.next_offset >= self.len {
            return None;
        }
        let len = BLOCK_LEN.min(self.len - self.next_offset);
        let block = BlockInfo {
            piece_index: self.piece,
            offset: self.next_offset,
            len,
        };
        self.next_offset += len;
        Some(block)
    }
}

/// Periodic task kinds a policy can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerKind {
    MostWanted,
    Reschedule,
    TuneQueues,
    ForceAdvance,
}

pub(crate) struct TimerSpec {
    pub kind: TimerKind,
    pub period: Duration,
    pub initial_delay: Duration,
}

/// Side effects a policy hands back to the coordinator for execution
/// outside the lock.
pub(crate) enum Action {
    /// Fetch these pieces from the external source on a background task.
    FetchWindow {
        pieces: Vec<PieceIndex>,
        window: PieceIndex,
    },
    /// Abort a peer's in-flight work on a piece, sending a cancel message.
    CancelAssignment {
        peer: ConnectionId,
        piece: PieceIndex,
    },
}

/// A piece selection strategy.
///
/// Hooks are always invoked under the coordinator lock with exclusive
/// access to the [`Book`]; deferred side effects are returned through
/// [`SelectionPolicy::take_actions`] and executed after the lock is
/// released.
pub(crate) trait SelectionPolicy: Send {
    /// The periodic tasks this policy runs on, spawned when the tracker
    /// becomes available.
    fn timers(&self) -> Vec<TimerSpec> {
        Vec::new()
    }

    /// Called once when the tracker becomes available.
    fn started(&mut self, _book: &mut Book) {}

    /// Picks the piece the given peer should download next. Must never
    /// return a piece the peer lacks.
    fn want_piece(
        &mut self,
        book: &mut Book,
        peer: ConnectionId,
        have: &Bitfield,
    ) -> Option<PieceIndex>;

    /// A piece finished assembly; `valid` is the verification verdict. On
    /// failure the piece's blocks were already cleared and it remains
    /// wanted.
    fn piece_completed(
        &mut self,
        book: &mut Book,
        from: Option<ConnectionId>,
        piece: PieceIndex,
        valid: bool,
    );

    /// A peer's assignment was dropped without the piece completing (the
    /// peer choked us or disconnected). The piece is up for selection
    /// again.
    fn assignment_released(&mut self, _book: &mut Book, _peer: ConnectionId, _piece: PieceIndex) {}

    fn peer_removed(&mut self, _book: &mut Book, _peer: ConnectionId) {}

    fn on_timer(&mut self, _book: &mut Book, _timer: TimerKind) {}

    /// Drains the side effects produced by the preceding hook call.
    fn take_actions(&mut self) -> Vec<Action> {
        Vec::new()
    }
}

struct State {
    book: Book,
    policy: Box<dyn SelectionPolicy>,
}

enum Outcome {
    Progress,
    Verified { all_complete: bool },
    Discarded,
}

/// The piece coordinator of one torrent. See the module documentation.
pub struct Coordinator {
    me: Weak<Coordinator>,
    conf: Conf,
    info: StorageInfo,
    info_hash: [u8; 20],
    piece_hashes: Vec<[u8; 20]>,
    storage: Arc<dyn Storage>,
    source: Option<Arc<dyn ExternalSource>>,
    listeners: Vec<Arc<dyn Listener>>,
    down_limiter: Arc<RateLimiter>,
    up_limiter: Arc<RateLimiter>,
    state: Mutex<State>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Coordinator {
    /// Creates the coordinator and its selection policy.
    ///
    /// # Panics
    ///
    /// Panics if the piece hashes or the storage bitfield disagree with the
    /// piece count, or if a streaming strategy is configured with a zero
    /// bitrate.
    pub fn new(params: Params) -> Arc<Self> {
        let Params {
            conf,
            info,
            info_hash,
            piece_hashes,
            storage,
            source,
            listeners,
        } = params;

        assert_eq!(
            piece_hashes.len(),
            info.piece_count,
            "piece hash count must match the piece count"
        );
        let own = storage.bitfield();
        assert_eq!(
            own.len(),
            info.piece_count,
            "storage bitfield length must match the piece count"
        );

        let policy: Box<dyn SelectionPolicy> = match conf.strategy {
            Strategy::RarestFirst => Box::new(rarest::RarestFirst::default()),
            Strategy::Windowed { bitrate } => {
                Box::new(windowed::WindowedPolicy::new(&info, bitrate))
            }
            Strategy::DualWindow { bitrate } => {
                Box::new(dual_window::DualWindowPolicy::new(&info, bitrate))
            }
            Strategy::Deadline { bitrate } => {
                Box::new(deadline::DeadlinePolicy::new(&info, bitrate))
            }
        };

        let book = Book::new(info, own);
        log::info!(
            "coordinator starting for torrent {} ({} of {} pieces present)",
            storage.hex_hash(),
            book.own.count_ones(),
            info.piece_count
        );

        let down_limiter = Arc::new(RateLimiter::new(conf.torrent.download_rate_limit));
        let up_limiter = Arc::new(RateLimiter::new(conf.torrent.upload_rate_limit));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            conf,
            info,
            info_hash,
            piece_hashes,
            storage,
            source,
            listeners,
            down_limiter,
            up_limiter,
            state: Mutex::new(State { book, policy }),
            started: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Signals that a tracker is available: starts the policy and its
    /// periodic tasks. The tracker client itself is owned by the embedder;
    /// this hook only consumes the lifecycle trigger.
    pub fn set_tracker(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("tracker available, starting selection policy");
        let actions = self.with_state(|book, policy| {
            policy.started(book);
            policy.take_actions()
        });
        self.execute(actions);
        self.spawn_timers();
    }

    /// Halts the torrent: cancels the periodic tasks, tells every session
    /// to shut down and makes outstanding background fetches stop early.
    /// Idempotent.
    pub fn halt(&self) {
        {
            let mut state = self.lock();
            if state.book.halted {
                return;
            }
            state.book.halted = true;
            for entry in state.book.peers.values() {
                entry.cmd.send(Command::Shutdown).ok();
            }
        }
        self.shutdown_tx.send(true).ok();
        log::info!("torrent halted");
    }

    /// Number of pieces still missing.
    pub fn missing_piece_count(&self) -> usize {
        self.lock().book.wanted.len()
    }

    /// Whether every piece is downloaded and verified.
    pub fn is_complete(&self) -> bool {
        self.lock().book.own.all()
    }

    /// Replaces the session-wide rate limits; `BytesPerSec(0)` pauses the
    /// direction.
    pub fn set_rate_limits(&self, download: Limit, upload: Limit) {
        self.down_limiter.set_limit(download);
        self.up_limiter.set_limit(upload);
    }

    pub(crate) fn conf(&self) -> &Conf {
        &self.conf
    }

    pub(crate) fn info(&self) -> StorageInfo {
        self.info
    }

    pub(crate) fn local_handshake(&self) -> Handshake {
        Handshake::new(self.info_hash, self.conf.client_id)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn download_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.down_limiter)
    }

    pub(crate) fn upload_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.up_limiter)
    }

    pub(crate) fn own_pieces(&self) -> Bitfield {
        self.lock().book.own.clone()
    }

    pub(crate) fn register_peer(&self, id: ConnectionId, cmd: CommandSender) {
        let mut state = self.lock();
        if state.book.halted {
            cmd.send(Command::Shutdown).ok();
            return;
        }
        state.book.peers.insert(
            id,
            PeerEntry {
                have: Bitfield::repeat(false, self.info.piece_count),
                rate: PeerRate::default(),
                is_seed: false,
                cmd,
            },
        );
        log::debug!("{} registered ({} connected)", id, state.book.peers.len());
    }

    /// Deregisters a peer, removing its availability contribution and
    /// releasing any assignment in the same critical section. Idempotent.
    pub(crate) fn remove_peer(&self, id: ConnectionId) {
        let actions = {
            let mut state = self.lock();
            let State { book, policy } = &mut *state;
            let Some(entry) = book.peers.remove(&id) else {
                return;
            };
            for piece in entry.have.iter_ones() {
                assert!(
                    book.availability[piece] > 0,
                    "availability count underflow for piece {}",
                    piece
                );
                book.availability[piece] -= 1;
            }
            if let Some(assignment) = book.assignments.remove(&id) {
                book.pending.remove(&assignment.piece);
                policy.assignment_released(book, id, assignment.piece);
            }
            policy.peer_removed(book, id);
            log::debug!("{} removed ({} connected)", id, book.peers.len());
            policy.take_actions()
        };
        self.execute(actions);
    }

    /// Registers a peer's full bitfield and returns whether it has a piece
    /// we lack.
    pub(crate) fn peer_bitfield(&self, id: ConnectionId, pieces: &Bitfield) -> bool {
        let mut state = self.lock();
        let book = &mut state.book;
        let Some(entry) = book.peers.get_mut(&id) else {
            return false;
        };
        assert_eq!(pieces.len(), self.info.piece_count, "bitfield length");
        for piece in pieces.iter_ones() {
            book.availability[piece] += 1;
        }
        entry.have = pieces.clone();
        entry.is_seed = pieces.all();
        pieces.iter_ones().any(|piece| !book.own[piece])
    }

    /// Registers a single newly available piece and returns whether we lack
    /// it.
    pub(crate) fn peer_has_piece(&self, id: ConnectionId, piece: PieceIndex) -> bool {
        let mut state = self.lock();
        let book = &mut state.book;
        let Some(entry) = book.peers.get_mut(&id) else {
            return false;
        };
        if !entry.have[piece] {
            entry.have.set(piece, true);
            book.availability[piece] += 1;
            entry.is_seed = entry.have.all();
        }
        !book.own[piece]
    }

    /// Whether the peer has anything we still want.
    pub(crate) fn is_interesting(&self, id: ConnectionId) -> bool {
        let state = self.lock();
        let book = &state.book;
        match book.peers.get(&id) {
            Some(entry) => book.wanted.iter().any(|&piece| entry.have[piece]),
            None => false,
        }
    }

    /// The next block this peer should request, continuing its current
    /// assignment or asking the policy for a fresh piece.
    pub(crate) fn next_block(&self, id: ConnectionId) -> Option<BlockInfo> {
        let mut new_piece = None;
        let mut actions = Vec::new();
        let block = {
            let mut state = self.lock();
            let State { book, policy } = &mut *state;
            if book.halted || !book.peers.contains_key(&id) {
                return None;
            }

            let block = if let Some(assignment) = book.assignments.get_mut(&id) {
                // all blocks requested but the piece not yet complete means
                // the peer is saturated; don't hand it another piece
                assignment.next_block()
            } else {
                let have = book.peers[&id].have.clone();
                match policy.want_piece(book, id, &have) {
                    Some(piece) => {
                        debug_assert!(have[piece], "policy picked a piece the peer lacks");
                        let mut assignment = Assignment::new(piece, book.info.piece_len(piece));
                        let block = assignment.next_block();
                        book.assignments.insert(id, assignment);
                        book.pending.insert(piece);
                        new_piece = Some(piece);
                        block
                    }
                    None => None,
                }
            };
            actions = policy.take_actions();
            block
        };

        if let Some(piece) = new_piece {
            log::debug!("{} assigned piece {}", id, piece);
            for listener in &self.listeners {
                listener.piece_requested(Some(id), piece);
            }
        }
        self.execute(actions);
        block
    }

    /// Drops a peer's current assignment without completing it; the piece
    /// stays wanted and goes back up for selection.
    pub(crate) fn release_assignment(&self, id: ConnectionId) {
        let actions = {
            let mut state = self.lock();
            let State { book, policy } = &mut *state;
            let Some(assignment) = book.assignments.remove(&id) else {
                return;
            };
            book.pending.remove(&assignment.piece);
            policy.assignment_released(book, id, assignment.piece);
            policy.take_actions()
        };
        self.execute(actions);
    }

    /// Stores a downloaded block and, when it completes its piece, verifies
    /// the piece hash. Returns whether the data was acceptable; a `false`
    /// means the assembled piece failed verification, its blocks were
    /// discarded and it will be re-downloaded.
    pub(crate) fn got_block(
        &self,
        from: Option<ConnectionId>,
        piece: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> io::Result<bool> {
        let mut actions = Vec::new();
        let outcome = {
            let mut state = self.lock();
            let State { book, policy } = &mut *state;
            if book.halted || book.own[piece] {
                // duplicate delivery of a piece we already verified
                return Ok(true);
            }

            self.storage.write(piece, offset, data)?;
            let piece_state = &mut book.pieces[piece];
            piece_state.add_block(offset, data.len() as u32);
            if !piece_state.is_complete() {
                Outcome::Progress
            } else {
                let len = book.info.piece_len(piece);
                let bytes = self.storage.read(piece, 0, len)?;
                let mut hasher = Sha1::new();
                hasher.update(&bytes);
                let digest: [u8; 20] = hasher.finalize().into();

                if digest == self.piece_hashes[piece] {
                    piece_state.set_complete();
                    book.own.set(piece, true);
                    book.wanted.retain(|&p| p != piece);
                    book.pending.remove(&piece);
                    book.assignments.retain(|_, a| a.piece != piece);
                    for entry in book.peers.values() {
                        entry.cmd.send(Command::Have(piece)).ok();
                    }
                    policy.piece_completed(book, from, piece, true);

                    let all_complete = book.own.all();
                    if all_complete {
                        // no use for seed-to-seed links once we are a seed
                        for entry in book.peers.values() {
                            if entry.is_seed {
                                entry.cmd.send(Command::Shutdown).ok();
                            }
                        }
                    }
                    log::info!(
                        "piece {} complete and verified ({} missing)",
                        piece,
                        book.wanted.len()
                    );
                    actions = policy.take_actions();
                    Outcome::Verified { all_complete }
                } else {
                    let dropped = piece_state.bytes_downloaded();
                    piece_state.clear();
                    book.pending.remove(&piece);
                    book.assignments.retain(|_, a| a.piece != piece);
                    policy.piece_completed(book, from, piece, false);
                    log::warn!(
                        "piece {} failed hash verification, discarding {} bytes",
                        piece,
                        dropped
                    );
                    actions = policy.take_actions();
                    Outcome::Discarded
                }
            }
        };

        let valid = match outcome {
            Outcome::Progress => true,
            Outcome::Verified { all_complete } => {
                for listener in &self.listeners {
                    listener.piece_downloaded(from, piece);
                }
                if all_complete {
                    log::info!("download complete");
                    for listener in &self.listeners {
                        listener.download_complete();
                    }
                }
                true
            }
            Outcome::Discarded => {
                for listener in &self.listeners {
                    listener.piece_discarded(piece);
                }
                false
            }
        };
        self.execute(actions);
        Ok(valid)
    }

    /// Reads a requested byte range for outbound piece service.
    pub(crate) fn read_block(&self, block: &BlockInfo) -> io::Result<Vec<u8>> {
        self.storage.read(block.piece_index, block.offset, block.len)
    }

    /// Feeds a connection's one-second throughput sample into the peer
    /// registry for the deadline strategy's estimates.
    pub(crate) fn update_peer_rate(&self, id: ConnectionId, down: f64, up: f64) {
        log::trace!("{} rates: {:.0}/{:.0} B/s down/up", id, down, up);
        let mut state = self.lock();
        if let Some(entry) = state.book.peers.get_mut(&id) {
            entry.rate.down = down;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("coordinator lock poisoned")
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut Book, &mut dyn SelectionPolicy) -> R) -> R {
        let mut state = self.lock();
        let State { book, policy } = &mut *state;
        f(book, policy.as_mut())
    }

    fn arc(&self) -> Arc<Coordinator> {
        self.me.upgrade().expect("coordinator dropped while in use")
    }

    fn halted(&self) -> bool {
        self.lock().book.halted
    }

    fn still_wanted(&self, piece: PieceIndex) -> bool {
        let state = self.lock();
        !state.book.halted && state.book.wanted_contains(piece)
    }

    fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::FetchWindow { pieces, window } => self.spawn_fetch(pieces, window),
                Action::CancelAssignment { peer, piece } => {
                    let mut state = self.lock();
                    let book = &mut state.book;
                    if let Some(entry) = book.peers.get(&peer) {
                        entry.cmd.send(Command::Cancel(piece)).ok();
                    }
                    if book.assignments.get(&peer).is_some_and(|a| a.piece == piece) {
                        book.assignments.remove(&peer);
                        book.pending.remove(&piece);
                    }
                }
            }
        }
    }

    /// Downloads the given pieces from the external source on a background
    /// task. Each piece is checked against the wanted set right before its
    /// fetch, so halting or a competing download makes the task stop doing
    /// useless work.
    fn spawn_fetch(&self, pieces: Vec<PieceIndex>, window: PieceIndex) {
        let Some(source) = self.source.clone() else {
            log::warn!(
                "no external source configured, {} window pieces stay peer-only",
                pieces.len()
            );
            return;
        };
        let this = self.arc();
        task::spawn(async move {
            log::info!("external fetch session started [window={}]", window);
            for piece in pieces {
                if this.halted() {
                    break;
                }
                if !this.still_wanted(piece) {
                    continue;
                }
                let len = this.info.piece_len(piece);
                let offset = this.info.piece_offset(piece);
                for listener in &this.listeners {
                    listener.piece_requested(None, piece);
                }
                match source.get_block(offset, len).await {
                    Ok(data) if data.len() == len as usize => {
                        match this.got_block(None, piece, 0, &data) {
                            Ok(true) => {}
                            Ok(false) => log::error!(
                                "bad piece {} from {}",
                                piece,
                                source.describe()
                            ),
                            Err(e) => log::error!("failed to store piece {}: {}", piece, e),
                        }
                    }
                    Ok(data) => log::error!(
                        "{} returned {} bytes for piece {}, expected {}",
                        source.describe(),
                        data.len(),
                        piece,
                        len
                    ),
                    Err(e) => log::warn!(
                        "failed to fetch piece {} from {}: {}",
                        piece,
                        source.describe(),
                        e
                    ),
                }
            }
            log::info!("external fetch session completed [window={}]", window);
        });
    }

    fn spawn_timers(&self) {
        let specs = self.lock().policy.timers();
        for spec in specs {
            let this = self.arc();
            let mut shutdown = self.shutdown_signal();
            task::spawn(async move {
                if !spec.initial_delay.is_zero() {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = time::sleep(spec.initial_delay) => {}
                    }
                }
                let mut interval = time::interval(spec.period);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = interval.tick() => {
                            if this.halted() {
                                break;
                            }
                            let actions = this.with_state(|book, policy| {
                                policy.on_timer(book, spec.kind);
                                policy.take_actions()
                            });
                            this.execute(actions);
                        }
                    }
                }
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use tokio::sync::mpsc;

    use super::*;

    /// A book over an empty download with the given geometry.
    pub(crate) fn empty_book(piece_count: usize, piece_len: u32) -> Book {
        let info = StorageInfo::new(piece_len, u64::from(piece_len) * piece_count as u64);
        Book::new(info, Bitfield::repeat(false, piece_count))
    }

    /// Registers a synthetic peer advertising the given pieces.
    pub(crate) fn add_peer(book: &mut Book, id: ConnectionId, pieces: &[PieceIndex]) {
        let mut have = Bitfield::repeat(false, book.info.piece_count);
        for &piece in pieces {
            have.set(piece, true);
            book.availability[piece] += 1;
        }
        // commands sent to synthetic peers go nowhere, which every send
        // site already tolerates
        let (cmd, _rx) = mpsc::unbounded_channel();
        let is_seed = have.all();
        book.peers.insert(
            id,
            PeerEntry {
                have,
                rate: PeerRate::default(),
                is_seed,
                cmd,
            },
        );
    }

    pub(crate) fn conn(n: u32) -> ConnectionId {
        // ids only need to be distinct within a test
        let _ = n;
        ConnectionId::next()
    }
}
