//! Background datagram reader.
//!
//! [`ReceiveLoop::spawn`] starts a tokio task that waits for the socket to
//! become readable, drains every queued datagram with non-blocking reads,
//! decodes each one and hands it to a [`PacketReceiver`] synchronously.
//!
//! ```text
//!   socket ──readable──▶ drain try_recv_from ──decode──▶ PacketReceiver::packet_received
//!      ▲                                                          │
//!      └──────────────────── until WouldBlock ────────────────────┘
//! ```
//!
//! The task holds only a [`Weak`] reference to its receiver, so it never
//! keeps a connection or server alive; it exits once the receiver is gone,
//! on [`ReceiveLoop::stop`], or when the handle is dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ConnError;
use crate::lock;
use crate::packet::Packet;
use crate::socket::{DatagramSocket, RECV_BUFFER_LEN};

/// Consumer of decoded datagrams.  Called on the receive task.
pub trait PacketReceiver: Send + Sync {
    fn packet_received(&self, from: SocketAddr, packet: Packet) -> Result<(), ConnError>;
}

pub struct ReceiveLoop {
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: JoinHandle<()>,
}

impl ReceiveLoop {
    /// Spawn the loop on the current tokio runtime.
    pub fn spawn(socket: Arc<dyn DatagramSocket>, receiver: Weak<dyn PacketReceiver>) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(socket, receiver, shutdown_rx));
        Self {
            shutdown: Mutex::new(Some(shutdown_tx)),
            task,
        }
    }

    /// Interrupt the wait and end the task.  Calling it again does nothing.
    pub fn stop(&self) {
        if let Some(tx) = lock(&self.shutdown).take() {
            // The task may already have exited on its own.
            let _ = tx.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    socket: Arc<dyn DatagramSocket>,
    receiver: Weak<dyn PacketReceiver>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let local = socket
        .local_addr()
        .map_or_else(|_| "?".to_string(), |addr| addr.to_string());
    log::debug!("[recv {local}] started");
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            ready = socket.readable() => {
                if let Err(e) = ready {
                    report(&local, &e);
                    break;
                }
            }
        }

        match drain(socket.as_ref(), &receiver, &mut buf) {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("[recv {local}] receiver dropped");
                break;
            }
            Err(e) => {
                report(&local, &e);
                break;
            }
        }
    }

    log::debug!("[recv {local}] stopped");
}

fn report(local: &str, e: &io::Error) {
    if e.kind() == io::ErrorKind::NotConnected {
        log::debug!("[recv {local}] socket closed");
    } else {
        log::error!("[recv {local}] socket failed: {e}");
    }
}

/// Read until `WouldBlock`.  `Ok(false)` once the receiver no longer exists.
fn drain(
    socket: &dyn DatagramSocket,
    receiver: &Weak<dyn PacketReceiver>,
    buf: &mut [u8],
) -> io::Result<bool> {
    loop {
        let (n, from) = match socket.try_recv_from(buf) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) if is_transient(&e) => {
                log::trace!("[recv] ignoring {e}");
                continue;
            }
            Err(e) => return Err(e),
        };

        let Some(receiver) = receiver.upgrade() else {
            return Ok(false);
        };

        let packet = match Packet::decode(&buf[..n]) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("[recv] dropping datagram from {from}: {e}");
                continue;
            }
        };
        log::trace!("[recv] <- {from} {packet}");

        if let Err(e) = receiver.packet_received(from, packet) {
            log::warn!("[recv] packet from {from} rejected: {e}");
        }
    }
}

/// Errors some platforms surface on UDP reads after an ICMP unreachable.
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
    )
}
