//! Server side: handshake acceptance and multiplexing of many clients over
//! one socket.
//!
//! ```text
//!                       ┌──────────────── Server ─────────────────┐
//!   datagram from A ──▶ │ A connected?        ──▶ Connection(A)    │
//!                       │ ack matches pending ──▶ new Connection   │
//!                       │ connect request     ──▶ admit? reply     │
//!                       │ anything else       ──▶ ignored          │
//!                       └─────────────────────────────────────────┘
//! ```
//!
//! A failure while handling one client's traffic closes that client only.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::ConnError;
use crate::handler::{Admission, HandlerFactory};
use crate::lock;
use crate::packet::Packet;
use crate::pending::PendingConnections;
use crate::receive_loop::{PacketReceiver, ReceiveLoop};
use crate::socket::{DatagramSocket, SocketFactory, UdpSocketFactory};
use crate::state::ConnectionState;

pub struct Server {
    shared: Arc<ServerShared>,
    receive_loop: ReceiveLoop,
}

struct ServerShared {
    socket: Arc<dyn DatagramSocket>,
    clients: Mutex<HashMap<SocketAddr, Connection>>,
    pending: Mutex<PendingConnections>,
    handlers: Box<dyn HandlerFactory>,
    admission: Box<dyn Admission>,
    config: Config,
    pending_ttl: Mutex<Duration>,
}

impl Server {
    /// Bind a UDP socket on `bind` and start accepting clients with the
    /// default [`Config`].
    ///
    /// Must be called within a tokio runtime; the receive loop is spawned on
    /// it.
    pub fn new(
        bind: SocketAddr,
        handlers: impl HandlerFactory + 'static,
        admission: impl Admission + 'static,
    ) -> io::Result<Self> {
        Self::with_options(bind, handlers, admission, &UdpSocketFactory, Config::default())
    }

    pub fn with_options(
        bind: SocketAddr,
        handlers: impl HandlerFactory + 'static,
        admission: impl Admission + 'static,
        socket_factory: &dyn SocketFactory,
        config: Config,
    ) -> io::Result<Self> {
        let socket = socket_factory.bind(bind)?;
        let local = socket.local_addr()?;
        let shared = Arc::new(ServerShared {
            socket: Arc::clone(&socket),
            clients: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingConnections::new()),
            handlers: Box::new(handlers),
            admission: Box::new(admission),
            pending_ttl: Mutex::new(config.pending_ttl),
            config,
        });
        let receiver = Arc::downgrade(&shared) as Weak<dyn PacketReceiver>;
        let receive_loop = ReceiveLoop::spawn(socket, receiver);

        log::info!("[server] listening on {local}");
        Ok(Self {
            shared,
            receive_loop,
        })
    }

    /// Expire stale handshakes, then poll every client and forget the ones
    /// that have finished closing.
    ///
    /// Must not be called from two threads at once.
    pub fn poll(&self, elapsed: Duration) {
        let ttl = *lock(&self.shared.pending_ttl);
        let expired = lock(&self.shared.pending).sweep(Instant::now(), ttl);
        if expired > 0 {
            log::debug!("[server] {expired} pending handshake(s) expired");
        }

        for conn in self.connections() {
            match conn.poll(elapsed) {
                Ok(()) | Err(ConnError::ConnectionClosed) => {}
                Err(e) => {
                    log::error!("[server] poll of {} failed: {e}; closing", conn.peer_addr());
                    conn.close();
                }
            }
        }

        lock(&self.shared.clients).retain(|addr, conn| {
            let keep = conn.state() != ConnectionState::Closed;
            if !keep {
                log::info!("[server] {addr} disconnected");
            }
            keep
        });
    }

    /// Stop receiving, close every client and release the listening
    /// address.  Close callbacks run before this returns.
    pub fn stop(&self) {
        self.receive_loop.stop();

        let clients: Vec<Connection> = lock(&self.shared.clients)
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in &clients {
            conn.close();
            match conn.poll(Duration::ZERO) {
                Ok(()) | Err(ConnError::ConnectionClosed) => {}
                Err(e) => log::error!("[server] final poll of {} failed: {e}", conn.peer_addr()),
            }
        }
        self.shared.socket.close();
        log::info!("[server] stopped; closed {} connection(s)", clients.len());
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.clients).len()
    }

    /// Handles to every connected client.
    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.shared.clients).values().cloned().collect()
    }

    /// How long a half-open handshake may wait for the client's final ACK.
    pub fn set_pending_ttl(&self, ttl: Duration) {
        *lock(&self.shared.pending_ttl) = ttl;
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr().ok())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ServerShared {
    fn accept(&self, from: SocketAddr, request: &Packet) -> Result<(), ConnError> {
        if !self.admission.admit(from) {
            log::info!("[server] connect request from {from} rejected");
            return Ok(());
        }

        let client_sequence_in = request.next_sequence();
        let reply = Packet::builder()
            .connect_request()
            .random_sequence()
            .ack(client_sequence_in)
            .build()?;
        let expected_ack = reply.next_sequence();

        // Register before replying so a fast final ACK finds the entry.
        lock(&self.pending).insert(from, expected_ack, client_sequence_in, Instant::now());
        log::debug!("[server] -> {from} {reply}");
        match self.socket.try_send_to(&reply.encode(), from) {
            Ok(_) => Ok(()),
            // The client retries its request.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn complete(&self, from: SocketAddr, ack: u16) {
        let Some(sequence_in) = lock(&self.pending).complete(from, ack) else {
            log::info!("[server] unexpected ack {ack} from {from}");
            return;
        };

        let conn = Connection::establish(
            Arc::clone(&self.socket),
            from,
            sequence_in,
            ack,
            &self.config,
            self.handlers.create(),
        );
        lock(&self.clients).insert(from, conn);
        log::info!("[server] accepted {from} (in={sequence_in}, out={ack})");
    }
}

impl PacketReceiver for ServerShared {
    fn packet_received(&self, from: SocketAddr, packet: Packet) -> Result<(), ConnError> {
        let client = lock(&self.clients).get(&from).cloned();
        if let Some(conn) = client {
            if let Err(e) = conn.packet_received(from, packet) {
                log::warn!("[server] closing {from}: {e}");
                conn.close();
            }
            return Ok(());
        }

        if let Some(ack) = packet.ack() {
            self.complete(from, ack);
        } else if packet.is_connect_request() {
            if let Err(e) = self.accept(from, &packet) {
                log::warn!("[server] handshake with {from} failed: {e}");
            }
        } else {
            log::trace!("[server] ignoring {packet} from unknown {from}");
        }
        Ok(())
    }
}
