//! Per-connection lifecycle manager.
//!
//! A [`Connection`] owns the complete state for one peer:
//! - the reliable and unreliable streams, which share one
//!   [`PiggybackAck`](crate::piggyback::PiggybackAck) through the [`Link`],
//! - the lifecycle state (see [`crate::state`]),
//! - the application's [`ConnectionHandler`].
//!
//! Connections are created either by [`Connection::open`] (client side,
//! which also owns a socket and a [`ReceiveLoop`]) or by a
//! [`Server`](crate::Server) once a handshake completes (sharing the server
//! socket).
//!
//! # Threading model
//!
//! Inbound packets arrive on the receive task and are only *buffered*.
//! Everything the application observes happens inside [`Connection::poll`]:
//! open, read and close callbacks, retransmits, deferred ACKs.  Sending is
//! safe from any thread at any time.
//!
//! # Client handshake
//!
//! ```text
//!   client                                   server
//!     │ ── CONNECT_REQUEST seq=S ─────────────▶ │   (resent every retry interval
//!     │ ◀── CONNECT_REQUEST seq=T ack=S+1 ──── │    with a fresh S)
//!     │ ── ACK ack=T+1 ───────────────────────▶ │
//!   sequence_in = T+1, sequence_out = S+1
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::Config;
use crate::error::ConnError;
use crate::handler::ConnectionHandler;
use crate::link::Link;
use crate::lock;
use crate::packet::Packet;
use crate::piggyback::PiggybackAck;
use crate::receive_loop::{self, PacketReceiver, ReceiveLoop};
use crate::reliable::{ReliableStream, StreamHealth};
use crate::seq;
use crate::socket::{self, DatagramSocket, SocketFactory, UdpSocketFactory, RECV_BUFFER_LEN};
use crate::state::{AtomicState, ConnectionState};
use crate::unreliable::UnreliableStream;

/// Snapshot of a connection's reliable-stream counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub window_size: usize,
    /// Packets sent but not yet acknowledged.
    pub in_flight: usize,
    /// Packets waiting for room in the window.
    pub queued: usize,
    pub rto: Duration,
    /// Next reliable sequence expected from the peer.
    pub reliable_sequence_in: u16,
    /// Sequence the next reliable send will use.
    pub reliable_sequence_out: u16,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A cheap, cloneable handle to one connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    link: Link,
    state: AtomicState,
    reliable: ReliableStream,
    unreliable: UnreliableStream,
    handler: Mutex<Box<dyn ConnectionHandler>>,
    /// `on_open` has been delivered.
    announced: AtomicBool,
    /// Only client-side connections own a receive loop.
    receive_loop: Mutex<Option<ReceiveLoop>>,
}

impl Connection {
    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    /// Build an established connection.  Used by the client once its
    /// handshake completes and by the server on a matching final ACK.
    pub(crate) fn establish(
        socket: Arc<dyn DatagramSocket>,
        peer: SocketAddr,
        sequence_in: u16,
        sequence_out: u16,
        config: &Config,
        handler: Box<dyn ConnectionHandler>,
    ) -> Self {
        let link = Link::new(socket, peer, PiggybackAck::new(config.piggyback_delay));
        Self {
            shared: Arc::new(Shared {
                link,
                state: AtomicState::new(ConnectionState::Open),
                reliable: ReliableStream::new(sequence_in, sequence_out, config),
                unreliable: UnreliableStream::new(sequence_in, sequence_out),
                handler: Mutex::new(handler),
                announced: AtomicBool::new(false),
                receive_loop: Mutex::new(None),
            }),
        }
    }

    /// Connect to `target` over real UDP with the default [`Config`].
    ///
    /// Fails with [`ConnError::Timeout`] if no valid handshake reply arrives
    /// within `timeout`.  Must be called within a tokio runtime.
    pub async fn open(
        target: SocketAddr,
        timeout: Duration,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<Self, ConnError> {
        Self::open_with(&UdpSocketFactory, &Config::default(), target, timeout, handler).await
    }

    /// Connect to `target` with an explicit socket factory and configuration.
    pub async fn open_with(
        factory: &dyn SocketFactory,
        config: &Config,
        target: SocketAddr,
        timeout: Duration,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<Self, ConnError> {
        let socket = factory.bind(socket::ephemeral_for(target))?;
        let (sequence_in, sequence_out) =
            handshake(socket.as_ref(), target, timeout, config).await?;

        socket.writable().await?;
        match socket.try_send_to(&Packet::ack_only(sequence_in).encode(), target) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::warn!("[handshake] final ack to {target} would block; not sent");
            }
            Err(e) => return Err(e.into()),
        }

        let conn = Self::establish(
            Arc::clone(&socket),
            target,
            sequence_in,
            sequence_out,
            config,
            handler,
        );
        let receiver = Arc::downgrade(&conn.shared) as Weak<dyn PacketReceiver>;
        *lock(&conn.shared.receive_loop) = Some(ReceiveLoop::spawn(socket, receiver));

        log::info!(
            "[conn {target}] established (in={sequence_in}, out={sequence_out})"
        );
        Ok(conn)
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Send `payload` on the reliable stream.
    ///
    /// Returns once the payload is queued or handed to the socket; delivery
    /// happens over subsequent polls.
    pub fn send_reliable(&self, payload: impl Into<Bytes>) -> Result<(), ConnError> {
        self.ensure_open()?;
        let result = self
            .shared
            .reliable
            .send(&self.shared.link, payload.into(), Instant::now());
        self.shared.check_send(result)
    }

    /// Send `payload` on the unreliable stream.  It may never arrive.
    pub fn send_unreliable(&self, payload: impl Into<Bytes>) -> Result<(), ConnError> {
        self.ensure_open()?;
        let result = self
            .shared
            .unreliable
            .send(&self.shared.link, payload.into(), Instant::now());
        self.shared.check_send(result)
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Deliver buffered reads and lifecycle events to the handler and drive
    /// the reliable stream's timers.
    ///
    /// `_elapsed` is the time since the previous poll; timers read the clock
    /// themselves, so it is informational only.  Must not be called from two
    /// threads at once.  Fails with [`ConnError::ConnectionClosed`] once the
    /// close callback has been delivered.
    pub fn poll(&self, _elapsed: Duration) -> Result<(), ConnError> {
        match self.shared.state.load() {
            ConnectionState::Closed => Err(ConnError::ConnectionClosed),
            ConnectionState::Closing => {
                self.announce_open();
                self.finish_close();
                Ok(())
            }
            ConnectionState::Open => {
                self.announce_open();
                self.dispatch_reads();
                if !self.is_open() {
                    return Ok(());
                }

                let peer = self.peer_addr();
                match self.shared.reliable.poll(&self.shared.link, Instant::now()) {
                    Ok(StreamHealth::Alive) => {}
                    Ok(StreamHealth::Dead) => {
                        log::warn!("[conn {peer}] peer stopped acknowledging; closing");
                        self.shared.close();
                    }
                    Err(e) => {
                        log::error!("[conn {peer}] {e}; closing");
                        self.shared.close();
                    }
                }
                Ok(())
            }
        }
    }

    fn announce_open(&self) {
        if !self.shared.announced.swap(true, Ordering::AcqRel) {
            lock(&self.shared.handler).on_open(self);
        }
    }

    fn dispatch_reads(&self) {
        let unreliable = self.shared.unreliable.take_delivered();
        let reliable = self.shared.reliable.take_delivered();
        if unreliable.is_empty() && reliable.is_empty() {
            return;
        }

        let mut handler = lock(&self.shared.handler);
        for payload in unreliable {
            handler.on_unreliable_read(self, payload);
        }
        for payload in reliable {
            handler.on_reliable_read(self, payload);
        }
    }

    fn finish_close(&self) {
        if self
            .shared
            .state
            .transition(ConnectionState::Closing, ConnectionState::Closed)
        {
            log::debug!("[conn {}] closed", self.peer_addr());
            lock(&self.shared.handler).on_close(self);
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Best-effort notify the peer and mark the connection closed.
    ///
    /// The close callback runs on the next poll.  Closing twice is a no-op.
    pub fn close(&self) {
        self.shared.close();
    }

    /// `true` until the connection starts closing.
    pub fn is_open(&self) -> bool {
        self.shared.state.load() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.link.peer()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.link.socket().local_addr()
    }

    /// Close the connection if reliable data goes unacknowledged this long.
    pub fn set_send_timeout(&self, timeout: Duration) {
        self.shared.reliable.set_send_timeout(timeout);
    }

    pub fn stats(&self) -> ConnectionStats {
        let (reliable_sequence_out, window_size, in_flight, queued, rto) =
            self.shared.reliable.send_stats();
        ConnectionStats {
            window_size,
            in_flight,
            queued,
            rto,
            reliable_sequence_in: self.shared.reliable.sequence_in(),
            reliable_sequence_out,
        }
    }

    /// Route a packet received on a socket this connection does not own.
    pub(crate) fn packet_received(
        &self,
        from: SocketAddr,
        packet: Packet,
    ) -> Result<(), ConnError> {
        self.shared.packet_received(from, packet)
    }

    fn ensure_open(&self) -> Result<(), ConnError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ConnError::ConnectionClosed)
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer_addr())
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

impl Shared {
    fn close(&self) {
        let peer = self.link.peer();
        if !self
            .state
            .transition(ConnectionState::Open, ConnectionState::Closing)
        {
            log::debug!(
                "[conn {peer}] close() on a connection that is already {}",
                self.state.load()
            );
            return;
        }

        if let Err(e) = self.link.send(&Packet::close_notice(), Instant::now()) {
            log::warn!("[conn {peer}] close notice not sent: {e}");
        }
        self.stop_receiving();
        log::info!("[conn {peer}] closing");
    }

    /// The peer closed; no notice goes back.
    fn closed_by_peer(&self) {
        if self
            .state
            .transition(ConnectionState::Open, ConnectionState::Closing)
        {
            self.stop_receiving();
            log::info!("[conn {}] closed by peer", self.link.peer());
        }
    }

    /// Stop the client's receive loop and release its socket.  Server-side
    /// connections own neither; their socket belongs to the server.
    fn stop_receiving(&self) {
        if let Some(receive_loop) = lock(&self.receive_loop).take() {
            receive_loop.stop();
            self.link.socket().close();
        }
    }

    /// Send errors other than bad payloads are fatal to the connection.
    fn check_send(&self, result: Result<(), ConnError>) -> Result<(), ConnError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                log::error!("[conn {}] send failed: {e}; closing", self.link.peer());
                self.close();
            }
        }
        result
    }
}

impl PacketReceiver for Shared {
    fn packet_received(&self, from: SocketAddr, packet: Packet) -> Result<(), ConnError> {
        if self.state.load() != ConnectionState::Open {
            return Ok(());
        }
        let peer = self.link.peer();
        if from != peer {
            log::trace!("[conn {peer}] ignoring packet from stranger {from}");
            return Ok(());
        }
        if packet.is_connect_request() {
            log::debug!("[conn {peer}] ignoring late connect request");
            return Ok(());
        }
        if packet.is_close() {
            self.closed_by_peer();
            return Ok(());
        }

        let now = Instant::now();
        if packet.is_reliable() || packet.has_ack() {
            if let Err(e) = self.reliable.packet_received(&self.link, &packet, now) {
                log::error!("[conn {peer}] {e}; closing");
                self.close();
                return Err(e);
            }
        }
        if !packet.is_reliable() && packet.has_payload() {
            self.unreliable.packet_received(&packet);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Client handshake
// ---------------------------------------------------------------------------

/// Run the client side of the handshake and return
/// `(sequence_in, sequence_out)`.
async fn handshake(
    socket: &dyn DatagramSocket,
    target: SocketAddr,
    timeout: Duration,
    config: &Config,
) -> Result<(u16, u16), ConnError> {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    let request = Packet::builder().connect_request().random_sequence().build()?;
    let mut request_sequence = request.sequence();

    loop {
        if Instant::now() >= deadline {
            return Err(ConnError::Timeout(timeout));
        }

        let expected_ack = seq::next(request_sequence);
        let request = Packet::builder()
            .connect_request()
            .sequence(request_sequence)
            .build()?;
        // A fresh tokio socket reports WouldBlock until the reactor has
        // seen it writable.
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, socket.writable()).await {
            Ok(ready) => ready?,
            Err(_) => return Err(ConnError::Timeout(timeout)),
        }
        log::debug!("[handshake] -> {target} {request}");
        match socket.try_send_to(&request.encode(), target) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("[handshake] request to {target} would block; retrying later");
            }
            Err(e) => return Err(e.into()),
        }

        let retry_at = (Instant::now() + config.connect_retry_interval).min(deadline);
        loop {
            if let Some(server_sequence) = take_reply(socket, target, expected_ack, &mut buf)? {
                log::debug!("[handshake] <- {target} reply seq={server_sequence}");
                return Ok((seq::next(server_sequence), expected_ack));
            }

            let now = Instant::now();
            if now >= retry_at {
                break;
            }
            if let Ok(ready) = tokio::time::timeout(retry_at - now, socket.readable()).await {
                ready?;
            }
        }

        // A fresh sequence invalidates replies to the previous attempt.
        request_sequence = seq::next(expected_ack);
    }
}

/// Drain queued datagrams looking for the reply acknowledging `expected_ack`.
fn take_reply(
    socket: &dyn DatagramSocket,
    target: SocketAddr,
    expected_ack: u16,
    buf: &mut [u8],
) -> io::Result<Option<u16>> {
    loop {
        let (n, from) = match socket.try_recv_from(buf) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if receive_loop::is_transient(&e) => continue,
            Err(e) => return Err(e),
        };
        if from != target {
            continue;
        }
        match Packet::decode(&buf[..n]) {
            Ok(reply) if reply.is_connect_request() && reply.ack() == Some(expected_ack) => {
                return Ok(Some(reply.sequence()));
            }
            Ok(other) => log::debug!("[handshake] ignoring {other}"),
            Err(e) => log::debug!("[handshake] dropping datagram from {from}: {e}"),
        }
    }
}
