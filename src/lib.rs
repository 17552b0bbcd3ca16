//! `streams-over-udp`: two virtual streams per connection over plain UDP.
//!
//! Every connection carries an ordered, reliable stream (Go-Back-N ARQ with
//! cumulative ACKs) and a latest-wins unreliable stream.  Connections are
//! set up with a three-way handshake; a [`Server`] multiplexes any number of
//! clients over a single socket.
//!
//! # Architecture
//!
//! ```text
//!   application ── send_reliable / send_unreliable ──┐
//!        ▲                                            │
//!        │ callbacks (inside poll only)               ▼
//!  ┌─────┴───────────────────────────────────────────────────┐
//!  │                        Connection                       │
//!  │  ┌────────────────┐  ┌──────────────────┐  ┌─────────┐  │
//!  │  │ ReliableStream │  │ UnreliableStream │  │  state  │  │
//!  │  │ (GoBackNWindow)│  │  (latest wins)   │  └─────────┘  │
//!  │  └───────┬────────┘  └────────┬─────────┘               │
//!  │          └──── Link (peer + PiggybackAck) ──┘           │
//!  └──────────────────────┬──────────────────────────────────┘
//!                         │ datagrams                ▲
//!                 ┌───────▼──────┐          ┌────────┴────────┐
//!                 │    socket    │─readable▶│   ReceiveLoop   │
//!                 └──────────────┘          └─────────────────┘
//! ```
//!
//! Inbound datagrams are decoded on a background task and buffered; the
//! application calls `poll` periodically to receive callbacks and drive
//! retransmissions.
//!
//! Each module has a single responsibility:
//! - [`packet`]       wire format (serialise / deserialise)
//! - [`seq`]          wrapping 16-bit sequence arithmetic
//! - [`gbn_window`]   Go-Back-N send window, RTO and fast retransmit
//! - [`reliable`]     ordered reliable stream
//! - [`unreliable`]   latest-wins unreliable stream
//! - [`piggyback`]    deferred ACK shared by both streams
//! - [`timer`]        restartable timers and adaptive RTO
//! - [`link`]         socket + peer + piggybacked ACK attachment
//! - [`state`]        connection lifecycle state
//! - [`connection`]   per-connection lifecycle and client handshake
//! - [`server`]       handshake acceptance and client multiplexing
//! - [`pending`]      half-open handshakes awaiting the final ACK
//! - [`handler`]      application callbacks and admission
//! - [`socket`]       datagram socket capability and its UDP impl
//! - [`receive_loop`] background datagram reader
//! - [`simulator`]    in-memory lossy network for testing
//! - [`config`]       protocol timing knobs
//! - [`error`]        error taxonomy

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod connection;
pub mod error;
pub mod gbn_window;
pub mod handler;
pub mod link;
pub mod packet;
pub mod pending;
pub mod piggyback;
pub mod receive_loop;
pub mod reliable;
pub mod seq;
pub mod server;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod timer;
pub mod unreliable;

pub use config::Config;
pub use connection::{Connection, ConnectionStats};
pub use error::ConnError;
pub use handler::{AcceptAll, Admission, ConnectionHandler, HandlerFactory, NoopHandler};
pub use packet::{Packet, PacketError};
pub use server::Server;
pub use socket::{DatagramSocket, SocketFactory, UdpSocketFactory};
pub use state::ConnectionState;

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
