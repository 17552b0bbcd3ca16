//! Wire-format definitions for protocol datagrams.
//!
//! Every datagram exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (flags, sequence, optional ACK, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for truncated input.
//! - Validating packet construction through [`PacketBuilder`].
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3               4
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-
//! |     Flags     |        Sequence Number        |  ACK Sequence (opt.)  | Payload ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-
//! ```
//!
//! The ACK sequence is present only when [`flags::ACK`] is set.  Whatever
//! follows the header is the payload; an empty remainder means no payload.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::seq;

/// Bit-flag constants for the `flags` header byte.
pub mod flags {
    /// Payload belongs to the reliable (Go-Back-N) stream.
    pub const RELIABLE: u8 = 0b0000_0001;
    /// The ACK sequence field is present.
    pub const ACK: u8 = 0b0000_0010;
    /// Handshake request (client) or handshake reply (server, together with ACK).
    pub const CONNECT_REQUEST: u8 = 0b0000_0100;
    /// The sender has closed the connection.
    pub const CLOSE: u8 = 0b0000_1000;
}

/// Byte length of the fixed part of the header: flags(1) + sequence(2).
pub const HEADER_LEN: usize = 3;

/// Byte length of the optional ACK sequence field.
pub const ACK_LEN: usize = 2;

/// Upper bound on the encoded size of any packet.
pub const MAX_PACKET_SIZE: usize = 8192;

/// Largest payload a [`PacketBuilder`] accepts.
///
/// Room for the ACK field is always reserved so that piggybacking an ACK
/// onto a data packet can never push it over [`MAX_PACKET_SIZE`].
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_LEN - ACK_LEN;

const OFF_FLAGS: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_ACK: usize = 3;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while decoding a datagram or building a packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Datagram shorter than the fixed header.
    #[error("datagram of {0} bytes is shorter than the {HEADER_LEN}-byte header")]
    TooShort(usize),
    /// Datagram longer than [`MAX_PACKET_SIZE`].
    #[error("datagram of at least {0} bytes exceeds the maximum of {MAX_PACKET_SIZE}")]
    TooLong(usize),
    /// ACK flag set but the ACK sequence field is truncated.
    #[error("ACK flag set but only {0} bytes remain for the ACK field")]
    MissingAckField(usize),
    /// A payload was supplied but it contains no bytes.
    #[error("payload cannot be empty")]
    EmptyPayload,
    /// The payload would not fit in a single datagram.
    #[error("payload of {0} bytes exceeds the maximum of {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),
    /// A payload-bearing packet was built without an explicit sequence.
    #[error("a packet with a payload must have its sequence set")]
    MissingSequence,
    /// CONNECT_REQUEST and CLOSE were both requested.
    #[error("a packet cannot be both CONNECT_REQUEST and CLOSE")]
    ConflictingFlags,
    /// CONNECT_REQUEST or CLOSE packets never carry a payload.
    #[error("CONNECT_REQUEST and CLOSE packets cannot carry a payload")]
    PayloadOnControlPacket,
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// An immutable protocol datagram.
///
/// Build one with [`Packet::builder`], or with the infallible control-packet
/// constructors [`Packet::ack_only`] and [`Packet::close_notice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Option<Bytes>,
    sequence: u16,
    reliable: bool,
    connect_request: bool,
    close: bool,
    ack: Option<u16>,
}

impl Packet {
    /// Start building a packet.
    pub fn builder() -> PacketBuilder {
        PacketBuilder::default()
    }

    /// A payload-less packet that only acknowledges `ack_sequence`.
    pub fn ack_only(ack_sequence: u16) -> Self {
        Self {
            payload: None,
            sequence: 0,
            reliable: false,
            connect_request: false,
            close: false,
            ack: Some(ack_sequence),
        }
    }

    /// The best-effort notice sent when a connection is closed locally.
    pub fn close_notice() -> Self {
        Self {
            payload: None,
            sequence: 0,
            reliable: false,
            connect_request: false,
            close: true,
            ack: None,
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// The sequence following this packet's own.
    pub fn next_sequence(&self) -> u16 {
        seq::next(self.sequence)
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn is_connect_request(&self) -> bool {
        self.connect_request
    }

    pub fn is_close(&self) -> bool {
        self.close
    }

    /// The acknowledged sequence, if this packet carries an ACK.
    pub fn ack(&self) -> Option<u16> {
        self.ack
    }

    pub fn has_ack(&self) -> bool {
        self.ack.is_some()
    }

    /// A copy of this packet that also acknowledges `ack_sequence`.
    ///
    /// The payload buffer is shared, not copied; `self` is left untouched.
    /// Used to piggyback a pending ACK on an outgoing data packet.
    pub fn with_ack(&self, ack_sequence: u16) -> Self {
        Self {
            ack: Some(ack_sequence),
            ..self.clone()
        }
    }

    /// Number of bytes [`encode`](Self::encode) will produce.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + if self.ack.is_some() { ACK_LEN } else { 0 }
            + self.payload.as_ref().map_or(0, Bytes::len)
    }

    fn flag_bits(&self) -> u8 {
        let mut bits = 0;
        if self.reliable {
            bits |= flags::RELIABLE;
        }
        if self.ack.is_some() {
            bits |= flags::ACK;
        }
        if self.connect_request {
            bits |= flags::CONNECT_REQUEST;
        }
        if self.close {
            bits |= flags::CLOSE;
        }
        bits
    }

    /// Serialise this packet into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];

        buf[OFF_FLAGS] = self.flag_bits();
        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.sequence.to_be_bytes());

        let mut offset = HEADER_LEN;
        if let Some(ack) = self.ack {
            buf[OFF_ACK..OFF_ACK + ACK_LEN].copy_from_slice(&ack.to_be_bytes());
            offset += ACK_LEN;
        }
        if let Some(payload) = &self.payload {
            buf[offset..].copy_from_slice(payload);
        }

        buf
    }

    /// Parse a [`Packet`] from a raw datagram.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`] or longer than
    ///   [`MAX_PACKET_SIZE`], or
    /// - the ACK flag is set but fewer than [`ACK_LEN`] bytes follow the header.
    ///
    /// Flag combinations are not validated here; the payload is copied out so
    /// the returned packet does not borrow `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::TooShort(buf.len()));
        }
        if buf.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLong(buf.len()));
        }

        let bits = buf[OFF_FLAGS];
        let sequence = u16::from_be_bytes([buf[OFF_SEQ], buf[OFF_SEQ + 1]]);

        let mut offset = HEADER_LEN;
        let ack = if bits & flags::ACK != 0 {
            let remaining = buf.len() - HEADER_LEN;
            if remaining < ACK_LEN {
                return Err(PacketError::MissingAckField(remaining));
            }
            offset += ACK_LEN;
            Some(u16::from_be_bytes([buf[OFF_ACK], buf[OFF_ACK + 1]]))
        } else {
            None
        };

        let payload = (offset < buf.len()).then(|| Bytes::copy_from_slice(&buf[offset..]));

        Ok(Packet {
            payload,
            sequence,
            reliable: bits & flags::RELIABLE != 0,
            connect_request: bits & flags::CONNECT_REQUEST != 0,
            close: bits & flags::CLOSE != 0,
            ack,
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet{{seq={}", self.sequence)?;
        if let Some(ack) = self.ack {
            write!(f, " ack={ack}")?;
        }
        if self.reliable {
            f.write_str(" RELIABLE")?;
        }
        if self.connect_request {
            f.write_str(" CONNECT_REQUEST")?;
        }
        if self.close {
            f.write_str(" CLOSE")?;
        }
        if let Some(payload) = &self.payload {
            f.write_str(" payload=[")?;
            for (i, byte) in payload.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{byte:02X}")?;
            }
            f.write_str("]")?;
        }
        f.write_str("}")
    }
}

// ---------------------------------------------------------------------------
// PacketBuilder
// ---------------------------------------------------------------------------

/// Validating builder for [`Packet`].
///
/// Sequence and ACK values are `u16`, so the `[0, 65536)` range is enforced
/// by the type; [`build`](Self::build) checks the remaining invariants.
#[derive(Debug, Default)]
pub struct PacketBuilder {
    payload: Option<Bytes>,
    sequence: Option<u16>,
    reliable: bool,
    connect_request: bool,
    close: bool,
    ack: Option<u16>,
}

impl PacketBuilder {
    /// Attach a payload.  A sequence must also be set.
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn sequence(mut self, sequence: u16) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Pick a random sequence, as the handshake does for its initial number.
    pub fn random_sequence(mut self) -> Self {
        self.sequence = Some(rand::random());
        self
    }

    pub fn ack(mut self, ack_sequence: u16) -> Self {
        self.ack = Some(ack_sequence);
        self
    }

    /// Mark the packet reliable.  Packets are unreliable unless marked.
    pub fn reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    pub fn connect_request(mut self) -> Self {
        self.connect_request = true;
        self
    }

    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }

    pub fn build(self) -> Result<Packet, PacketError> {
        if self.connect_request && self.close {
            return Err(PacketError::ConflictingFlags);
        }
        if let Some(payload) = &self.payload {
            if self.connect_request || self.close {
                return Err(PacketError::PayloadOnControlPacket);
            }
            if payload.is_empty() {
                return Err(PacketError::EmptyPayload);
            }
            if payload.len() > MAX_PAYLOAD_SIZE {
                return Err(PacketError::PayloadTooLarge(payload.len()));
            }
            if self.sequence.is_none() {
                return Err(PacketError::MissingSequence);
            }
        }

        Ok(Packet {
            payload: self.payload,
            sequence: self.sequence.unwrap_or(0),
            reliable: self.reliable,
            connect_request: self.connect_request,
            close: self.close,
            ack: self.ack,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u16, payload: &'static [u8]) -> Packet {
        Packet::builder()
            .reliable()
            .sequence(seq)
            .payload(payload)
            .build()
            .unwrap()
    }

    #[test]
    fn encode_decode_roundtrip() {
        let pkt = data(65535, b"test");
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(decoded.payload().unwrap().as_ref(), b"test");
        assert!(decoded.is_reliable());
        assert_eq!(decoded.sequence(), 65535);
    }

    #[test]
    fn roundtrip_with_ack_and_payload() {
        let pkt = data(7, b"hi").with_ack(40000);
        let bytes = pkt.encode();
        assert_eq!(bytes.len(), HEADER_LEN + ACK_LEN + 2);
        assert_eq!(Packet::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn wire_layout_is_big_endian() {
        let pkt = Packet::builder()
            .sequence(0x0102)
            .ack(0x0304)
            .payload(&b"\xAA"[..])
            .build()
            .unwrap();
        assert_eq!(pkt.encode(), vec![flags::ACK, 0x01, 0x02, 0x03, 0x04, 0xAA]);
    }

    #[test]
    fn flag_bits_on_the_wire() {
        let request = Packet::builder().sequence(1).connect_request().ack(2).build().unwrap();
        assert_eq!(request.encode()[0], flags::CONNECT_REQUEST | flags::ACK);
        assert_eq!(Packet::close_notice().encode()[0], flags::CLOSE);
        assert_eq!(data(0, b"x").encode()[0], flags::RELIABLE);
    }

    #[test]
    fn ack_only_has_no_payload() {
        let decoded = Packet::decode(&Packet::ack_only(9).encode()).unwrap();
        assert_eq!(decoded.ack(), Some(9));
        assert!(!decoded.has_payload());
        assert!(!decoded.is_reliable());
    }

    #[test]
    fn decode_too_short() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::TooShort(0)));
        assert_eq!(Packet::decode(&[0]), Err(PacketError::TooShort(1)));
        assert_eq!(Packet::decode(&[0, 0]), Err(PacketError::TooShort(2)));
    }

    #[test]
    fn decode_rejects_datagrams_over_the_size_limit() {
        let mut bytes = vec![flags::RELIABLE, 0, 1];
        bytes.resize(MAX_PACKET_SIZE, 0xAB);
        assert!(Packet::decode(&bytes).is_ok());

        bytes.push(0xAB);
        assert_eq!(
            Packet::decode(&bytes),
            Err(PacketError::TooLong(MAX_PACKET_SIZE + 1))
        );
    }

    #[test]
    fn decode_missing_ack_field() {
        let bytes = Packet::ack_only(5).encode();
        assert_eq!(
            Packet::decode(&bytes[..3]),
            Err(PacketError::MissingAckField(0))
        );
        assert_eq!(
            Packet::decode(&bytes[..4]),
            Err(PacketError::MissingAckField(1))
        );
    }

    #[test]
    fn payload_requires_sequence() {
        let err = Packet::builder().payload(&b"x"[..]).build().unwrap_err();
        assert_eq!(err, PacketError::MissingSequence);
    }

    #[test]
    fn control_flags_are_exclusive_and_payload_less() {
        assert_eq!(
            Packet::builder().connect_request().close().build().unwrap_err(),
            PacketError::ConflictingFlags
        );
        assert_eq!(
            Packet::builder()
                .close()
                .sequence(1)
                .payload(&b"x"[..])
                .build()
                .unwrap_err(),
            PacketError::PayloadOnControlPacket
        );
    }

    #[test]
    fn empty_and_oversized_payloads_rejected() {
        assert_eq!(
            Packet::builder().sequence(1).payload(Vec::new()).build().unwrap_err(),
            PacketError::EmptyPayload
        );
        let big = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert_eq!(
            Packet::builder().sequence(1).payload(big).build().unwrap_err(),
            PacketError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1)
        );
    }

    #[test]
    fn largest_payload_still_fits_with_piggybacked_ack() {
        let pkt = Packet::builder()
            .sequence(1)
            .payload(vec![7u8; MAX_PAYLOAD_SIZE])
            .build()
            .unwrap()
            .with_ack(3);
        assert_eq!(pkt.encode().len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn with_ack_leaves_original_untouched() {
        let original = data(3, b"abc");
        let acked = original.with_ack(11);
        assert!(!original.has_ack());
        assert_eq!(acked.ack(), Some(11));
        assert_eq!(acked.payload(), original.payload());
    }

    #[test]
    fn display_shows_hex_payload() {
        let shown = data(1, b"\x00\xff").to_string();
        assert!(shown.contains("payload=[00 FF]"), "{shown}");
    }
}
