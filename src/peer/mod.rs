//! The peer connection engine.
//!
//! Each connection runs as its own task and owns its transport stream and
//! [`Session`] state. The engine frames bytes into protocol messages,
//! enforces the handshake and the request size ceiling, applies the
//! session-wide rate limits, and forwards piece traffic to the coordinator.
//! It never hash-checks pieces itself; verification is the coordinator's
//! job.
//!
//! All failures here are connection-fatal at worst: the task returns, the
//! pool reclaims the slot, and the coordinator drops the session's
//! availability contribution. Nothing can poison the shared state.

use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{interval, Duration, MissedTickBehavior},
};
use tokio_util::codec::Framed;

use crate::{
    coordinator::Coordinator,
    error::PeerError,
    peer::{
        codec::{HandshakeCodec, Message, PeerCodec},
        session::Session,
        throttle::Throttled,
    },
    pool::ChokeSlots,
    BlockInfo, ConnectionId, PieceIndex, MAX_REQUEST_LEN,
};

pub(crate) mod codec;
pub(crate) mod session;
pub(crate) mod state;
pub(crate) mod throttle;

/// Instructions delivered to a connection task from the coordinator.
#[derive(Debug)]
pub(crate) enum Command {
    /// Piece became available locally; notify the peer with a have message.
    Have(PieceIndex),
    /// Abort the in-flight request for this piece, sending a cancel message.
    Cancel(PieceIndex),
    /// Close the connection.
    Shutdown,
}

pub(crate) type CommandSender = UnboundedSender<Command>;
type CommandReceiver = UnboundedReceiver<Command>;

type PeerStream = Framed<Throttled<TcpStream>, PeerCodec>;

/// Dials the remote peer, then runs the connection to completion.
pub(crate) async fn run_outbound(
    id: ConnectionId,
    coordinator: Arc<Coordinator>,
    slots: Arc<ChokeSlots>,
    addr: SocketAddr,
) -> Result<(), PeerError> {
    log::debug!("{}: connecting to {}", id, addr);
    let socket = TcpStream::connect(addr).await?;
    log::debug!("{}: established outgoing connection with {}", id, addr);
    run(id, coordinator, slots, socket, addr, true).await
}

/// Runs an accepted incoming connection to completion.
pub(crate) async fn run_inbound(
    id: ConnectionId,
    coordinator: Arc<Coordinator>,
    slots: Arc<ChokeSlots>,
    socket: TcpStream,
    addr: SocketAddr,
) -> Result<(), PeerError> {
    log::debug!("{}: established incoming connection from {}", id, addr);
    run(id, coordinator, slots, socket, addr, false).await
}

async fn run(
    id: ConnectionId,
    coordinator: Arc<Coordinator>,
    slots: Arc<ChokeSlots>,
    socket: TcpStream,
    addr: SocketAddr,
    outbound: bool,
) -> Result<(), PeerError> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let mut conn = PeerConnection {
        id,
        addr,
        session: Session::new(coordinator.info().piece_count),
        coordinator,
        slots,
        cmd_tx,
        cmd_rx,
        in_flight: None,
        expect_bitfield: true,
        registered: false,
    };
    let result = conn.drive(socket, outbound).await;
    conn.teardown();
    result
}

enum Event {
    Message(Message),
    Command(Command),
    Tick,
}

struct PeerConnection {
    id: ConnectionId,
    addr: SocketAddr,
    session: Session,
    coordinator: Arc<Coordinator>,
    slots: Arc<ChokeSlots>,
    cmd_tx: CommandSender,
    cmd_rx: CommandReceiver,
    /// The single outstanding request towards the peer, if any.
    in_flight: Option<BlockInfo>,
    /// A bitfield is only legal as the first post-handshake message.
    expect_bitfield: bool,
    registered: bool,
}

impl PeerConnection {
    async fn drive(&mut self, socket: TcpStream, outbound: bool) -> Result<(), PeerError> {
        let socket = Throttled::new(
            socket,
            self.coordinator.download_limiter(),
            self.coordinator.upload_limiter(),
        );
        let mut handshake_stream = Framed::new(socket, HandshakeCodec);

        let ours = self.coordinator.local_handshake();
        if outbound {
            handshake_stream.send(ours).await?;
        }
        let theirs = match handshake_stream.next().await {
            Some(handshake) => handshake?,
            None => return Err(PeerError::ConnectionClosed),
        };
        if theirs.info_hash != ours.info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        if !outbound {
            handshake_stream.send(ours).await?;
        }

        self.session.peer_id = Some(theirs.peer_id);
        self.session.client = session::client_name(&theirs.peer_id);
        log::debug!(
            "{}: handshake complete with {} running {} (peer id {})",
            self.id,
            self.addr,
            self.session.client,
            self.session.peer_id.map(hex::encode).unwrap_or_default()
        );

        // switch to the message codec; bytes the peer piggy-backed after its
        // handshake are still in the buffer and decode as normal messages
        let mut stream = handshake_stream.map_codec(|_| PeerCodec);

        // no point in advertising an empty bitfield
        let own = self.coordinator.own_pieces();
        if own.any() {
            stream.send(Message::Bitfield(own)).await?;
        }

        self.coordinator.register_peer(self.id, self.cmd_tx.clone());
        self.registered = true;

        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.flush_haves(&mut stream).await?;
            self.maybe_request(&mut stream).await?;

            let event = tokio::select! {
                maybe_msg = stream.next() => match maybe_msg {
                    Some(msg) => Event::Message(msg?),
                    None => {
                        log::debug!("{}: end of stream", self.id);
                        return Ok(());
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => Event::Command(cmd),
                    None => Event::Command(Command::Shutdown),
                },
                _ = tick.tick() => Event::Tick,
            };

            match event {
                Event::Message(msg) => self.handle_message(&mut stream, msg).await?,
                Event::Command(Command::Shutdown) => {
                    log::debug!("{}: session shut down", self.id);
                    return Ok(());
                }
                Event::Command(cmd) => self.handle_command(&mut stream, cmd).await?,
                Event::Tick => {
                    let (down, up) = self.session.record_second();
                    self.coordinator.update_peer_rate(self.id, down, up);
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        stream: &mut PeerStream,
        msg: Message,
    ) -> Result<(), PeerError> {
        let piece_count = self.coordinator.info().piece_count;
        match msg {
            Message::KeepAlive => {
                log::trace!("{}: keep-alive", self.id);
            }
            Message::Choke => {
                if self.session.peer_choking.choke() {
                    log::trace!("{}: peer choked us", self.id);
                    // the outstanding request will not be answered; put the
                    // piece back up for selection
                    self.in_flight = None;
                    self.coordinator.release_assignment(self.id);
                }
            }
            Message::Unchoke => {
                if self.session.peer_choking.unchoke() {
                    log::trace!("{}: peer unchoked us", self.id);
                }
            }
            Message::Interested => {
                if self.session.peer_interested.set_interested() {
                    log::trace!("{}: peer is interested", self.id);
                    if self.slots.try_unchoke() && self.session.choking_peer.unchoke() {
                        stream.send(Message::Unchoke).await?;
                    }
                }
            }
            Message::NotInterested => {
                if self.session.peer_interested.clear_interested() {
                    log::trace!("{}: peer is no longer interested", self.id);
                    if self.session.choking_peer.choke() {
                        stream.send(Message::Choke).await?;
                        self.slots.unchoked_cleared();
                    }
                }
            }
            Message::Have { piece_index } => {
                if piece_index >= piece_count {
                    return Err(PeerError::Protocol("have index out of range"));
                }
                log::trace!("{}: peer has piece {}", self.id, piece_index);
                if !self.session.pieces[piece_index] {
                    self.session.pieces.set(piece_index, true);
                    let interesting = self.coordinator.peer_has_piece(self.id, piece_index);
                    if interesting && self.session.interested_in_peer.set_interested() {
                        stream.send(Message::Interested).await?;
                    }
                    if self.session.update_seed() {
                        log::debug!("{}: peer became a seed", self.id);
                    }
                }
            }
            Message::Bitfield(mut pieces) => {
                if !self.expect_bitfield {
                    return Err(PeerError::Protocol("unexpected bitfield"));
                }
                if pieces.len() != piece_count.div_ceil(8) * 8 {
                    return Err(PeerError::Protocol("bad bitfield length"));
                }
                pieces.truncate(piece_count);
                log::debug!(
                    "{}: peer bitfield with {} pieces",
                    self.id,
                    pieces.count_ones()
                );
                self.session.pieces = pieces;
                let interesting = self
                    .coordinator
                    .peer_bitfield(self.id, &self.session.pieces);
                if interesting && self.session.interested_in_peer.set_interested() {
                    stream.send(Message::Interested).await?;
                }
                if self.session.update_seed() {
                    log::debug!("{}: peer is a seed", self.id);
                }
            }
            Message::Request(block) => {
                self.handle_request(stream, block).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block(piece_index, offset, data)?;
            }
            Message::Cancel(block) => {
                // requests are serviced synchronously on receipt, so there
                // is never an outstanding request left to abort
                log::trace!("{}: cancel for {:?}, nothing outstanding", self.id, block);
            }
            Message::Port(advert) => {
                log::trace!("{}: ignoring port advert {}", self.id, advert);
            }
        }
        self.expect_bitfield = false;
        Ok(())
    }

    async fn handle_request(
        &mut self,
        stream: &mut PeerStream,
        block: BlockInfo,
    ) -> Result<(), PeerError> {
        if self.session.choking_peer.is_choked() {
            log::debug!(
                "{}: ignoring request for piece {} while peer is choked",
                self.id,
                block.piece_index
            );
            return Ok(());
        }
        if block.len == 0 {
            return Err(PeerError::Protocol("empty request"));
        }
        if block.len > MAX_REQUEST_LEN {
            return Err(PeerError::RequestTooLarge(block.len));
        }
        let info = self.coordinator.info();
        if block.piece_index >= info.piece_count
            || u64::from(block.offset) + u64::from(block.len)
                > u64::from(info.piece_len(block.piece_index))
        {
            return Err(PeerError::Protocol("request out of range"));
        }

        // a storage failure here means we cannot honor the byte range, which
        // closes the connection
        let data = self.coordinator.read_block(&block).map_err(|e| {
            log::warn!("{}: storage read failed: {}", self.id, e);
            PeerError::Io(e)
        })?;

        log::trace!(
            "{}: sending piece {} [{}..{}]",
            self.id,
            block.piece_index,
            block.offset,
            block.offset + block.len
        );
        stream
            .send(Message::Block {
                piece_index: block.piece_index,
                offset: block.offset,
                data,
            })
            .await?;
        self.session.uploaded += u64::from(block.len);
        Ok(())
    }

    fn handle_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<(), PeerError> {
        let info = self.coordinator.info();
        if piece_index >= info.piece_count
            || u64::from(offset) + data.len() as u64 > u64::from(info.piece_len(piece_index))
        {
            return Err(PeerError::Protocol("piece data out of range"));
        }

        log::trace!(
            "{}: received piece {} [{}..{}]",
            self.id,
            piece_index,
            offset,
            offset + data.len() as u32
        );
        self.session.downloaded += data.len() as u64;
        if self
            .in_flight
            .is_some_and(|b| b.piece_index == piece_index && b.offset == offset)
        {
            self.in_flight = None;
        }

        // hash verification and retry-on-mismatch happen in the coordinator;
        // a write failure is an I/O error that closes this connection
        self.coordinator
            .got_block(Some(self.id), piece_index, offset, &data)
            .map_err(PeerError::Io)?;
        Ok(())
    }

    /// Sends queued have notifications before the next dispatch round.
    async fn flush_haves(&mut self, stream: &mut PeerStream) -> Result<(), PeerError> {
        if self.session.pending_haves.is_empty() {
            return Ok(());
        }
        let haves = std::mem::take(&mut self.session.pending_haves);
        for piece_index in haves {
            log::trace!("{}: announcing piece {}", self.id, piece_index);
            stream.send(Message::Have { piece_index }).await?;
        }
        Ok(())
    }

    /// Keeps one request in flight towards an unchoked peer, and keeps our
    /// interest flag in sync with whether the peer has anything we want.
    async fn maybe_request(&mut self, stream: &mut PeerStream) -> Result<(), PeerError> {
        if self.in_flight.is_some() {
            return Ok(());
        }
        if self.session.peer_choking.is_choked() {
            if self.coordinator.is_interesting(self.id)
                && self.session.interested_in_peer.set_interested()
            {
                stream.send(Message::Interested).await?;
            }
            return Ok(());
        }

        match self.coordinator.next_block(self.id) {
            Some(block) => {
                if self.session.interested_in_peer.set_interested() {
                    stream.send(Message::Interested).await?;
                }
                log::trace!(
                    "{}: requesting piece {} [{}..{}]",
                    self.id,
                    block.piece_index,
                    block.offset,
                    block.offset + block.len
                );
                stream.send(Message::Request(block)).await?;
                self.in_flight = Some(block);
            }
            None => {
                if self.session.interested_in_peer.clear_interested() {
                    stream.send(Message::NotInterested).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_command(
        &mut self,
        stream: &mut PeerStream,
        cmd: Command,
    ) -> Result<(), PeerError> {
        match cmd {
            Command::Have(piece) => {
                // flushed at the top of the next dispatch round
                self.session.pending_haves.push(piece);
            }
            Command::Cancel(piece) => {
                if let Some(block) = self.in_flight {
                    if block.piece_index == piece {
                        log::debug!("{}: cancelling request for piece {}", self.id, piece);
                        stream.send(Message::Cancel(block)).await?;
                        self.in_flight = None;
                    }
                }
            }
            Command::Shutdown => unreachable!("handled in the dispatch loop"),
        }
        Ok(())
    }

    /// Releases everything this connection holds in shared state. Safe to
    /// call no matter how the connection ended.
    fn teardown(&mut self) {
        if self.registered {
            self.coordinator.remove_peer(self.id);
            self.registered = false;
        }
        if !self.session.choking_peer.is_choked() {
            self.slots.unchoked_cleared();
            self.session.choking_peer.choke();
        }
        log::debug!("{}: connection with {} closed", self.id, self.addr);
    }
}
