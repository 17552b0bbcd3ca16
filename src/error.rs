//! Error taxonomy for connections and servers.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::packet::PacketError;

#[derive(Debug, Error)]
pub enum ConnError {
    /// A datagram could not be decoded, or a packet could not be built.
    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),

    /// The peer acknowledged more packets than are outstanding.
    #[error(
        "protocol violation: ack {ack} against base {base} covers {acked} packets \
         but only {outstanding} are outstanding"
    )]
    ProtocolViolation {
        base: u16,
        ack: u16,
        acked: usize,
        outstanding: usize,
    },

    /// The handshake did not complete in time.
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Send or poll on a connection that is no longer open.
    #[error("connection is closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnError {
    /// Whether the error ends the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnError::Packet(_))
    }
}
