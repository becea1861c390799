//! The connection pool.
//!
//! Bounds how many peer connections run at once, arbitrates the global
//! unchoke slots, and owns the dial/accept work queue. The bounded worker
//! set of the original thread-per-connection design maps onto a semaphore
//! here: queued work waits for a permit, and every connection task holds its
//! permit until the socket closes.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Semaphore},
    task,
};

use crate::{coordinator::Coordinator, error::Result, peer, ConnectionId};

/// Global unchoke slot accounting, shared by all connections of a torrent.
///
/// A connection acquires a slot when its peer turns interested and gets
/// unchoked, and releases it when the peer loses interest or the connection
/// closes.
pub(crate) struct ChokeSlots {
    max: usize,
    unchoked: AtomicUsize,
}

impl ChokeSlots {
    fn new(max: usize) -> Self {
        Self {
            max,
            unchoked: AtomicUsize::new(0),
        }
    }

    /// Claims an unchoke slot if one is free.
    pub fn try_unchoke(&self) -> bool {
        self.unchoked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < self.max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Returns a previously claimed slot.
    pub fn unchoked_cleared(&self) {
        self.unchoked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .ok();
    }
}

enum Work {
    Dial(SocketAddr),
    Accept(TcpStream, SocketAddr),
}

/// Handle to the pool of peer connections for one torrent.
///
/// The pool stops when the coordinator is halted; dropping the handle also
/// stops it once queued work has drained.
pub struct ConnectionPool {
    work_tx: mpsc::UnboundedSender<Work>,
    coordinator: Arc<Coordinator>,
}

impl ConnectionPool {
    /// Spawns the pool dispatcher for the given coordinator.
    pub fn spawn(coordinator: Arc<Coordinator>) -> Self {
        let conf = coordinator.conf();
        let slots = Arc::new(ChokeSlots::new(conf.torrent.max_unchoked_peer_count));
        let semaphore = Arc::new(Semaphore::new(conf.torrent.max_connected_peer_count));
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        task::spawn(dispatch(work_rx, Arc::clone(&coordinator), slots, semaphore));
        Self {
            work_tx,
            coordinator,
        }
    }

    /// Queues an outgoing connection to the given peer address.
    pub fn connect(&self, addr: SocketAddr) {
        self.work_tx.send(Work::Dial(addr)).ok();
    }

    /// Queues an already accepted incoming connection.
    pub fn accept(&self, socket: TcpStream, addr: SocketAddr) {
        self.work_tx.send(Work::Accept(socket, addr)).ok();
    }

    /// Binds a listener and feeds accepted connections into the pool.
    /// Returns the bound address (useful with port 0).
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let work_tx = self.work_tx.clone();
        let mut shutdown = self.coordinator.shutdown_signal();
        task::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, addr)) => {
                            if work_tx.send(Work::Accept(socket, addr)).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("failed to accept connection: {}", e),
                    }
                }
            }
        });
        log::info!("listening for peers on {}", local_addr);
        Ok(local_addr)
    }
}

async fn dispatch(
    mut work_rx: mpsc::UnboundedReceiver<Work>,
    coordinator: Arc<Coordinator>,
    slots: Arc<ChokeSlots>,
    semaphore: Arc<Semaphore>,
) {
    let mut shutdown = coordinator.shutdown_signal();
    loop {
        let work = tokio::select! {
            _ = shutdown.changed() => break,
            work = work_rx.recv() => match work {
                Some(work) => work,
                None => break,
            },
        };

        // pending work waits here until a connection slot frees up; a halt
        // signal releases the wait instead of letting queued dials run
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let id = ConnectionId::next();
        let coordinator = Arc::clone(&coordinator);
        let slots = Arc::clone(&slots);
        task::spawn(async move {
            let result = match work {
                Work::Dial(addr) => peer::run_outbound(id, coordinator, slots, addr).await,
                Work::Accept(socket, addr) => {
                    peer::run_inbound(id, coordinator, slots, socket, addr).await
                }
            };
            if let Err(e) = result {
                log::debug!("{}: closed: {}", id, e);
            }
            drop(permit);
        });
    }
    log::debug!("connection pool dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_bound_unchoke_slots() {
        let slots = ChokeSlots::new(2);
        assert!(slots.try_unchoke());
        assert!(slots.try_unchoke());
        assert!(!slots.try_unchoke());

        slots.unchoked_cleared();
        assert!(slots.try_unchoke());
        assert!(!slots.try_unchoke());

        // clearing more than was claimed never underflows
        slots.unchoked_cleared();
        slots.unchoked_cleared();
        slots.unchoked_cleared();
        assert!(slots.try_unchoke());
    }
}
