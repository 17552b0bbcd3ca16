//! Outbound path of one connection.
//!
//! A [`Link`] pairs a socket with the peer address and the connection's
//! [`PiggybackAck`].  Every packet leaving a connection goes through
//! [`Link::send`], which attaches any pending ACK the packet does not
//! already carry.

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::piggyback::PiggybackAck;
use crate::packet::Packet;
use crate::socket::DatagramSocket;

pub struct Link {
    socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    piggyback: PiggybackAck,
}

impl Link {
    pub fn new(socket: Arc<dyn DatagramSocket>, peer: SocketAddr, piggyback: PiggybackAck) -> Self {
        Self {
            socket,
            peer,
            piggyback,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn socket(&self) -> &Arc<dyn DatagramSocket> {
        &self.socket
    }

    pub fn piggyback(&self) -> &PiggybackAck {
        &self.piggyback
    }

    /// Hand `packet` to the socket.
    ///
    /// Returns `Ok(false)` when the socket reported `WouldBlock`; nothing was
    /// sent and any ACK taken for piggybacking is put back.
    pub fn send(&self, packet: &Packet, now: Instant) -> io::Result<bool> {
        let mut attached = None;
        let packet = if packet.has_ack() {
            Cow::Borrowed(packet)
        } else {
            match self.piggyback.take() {
                Some(ack) => {
                    attached = Some(ack);
                    Cow::Owned(packet.with_ack(ack))
                }
                None => Cow::Borrowed(packet),
            }
        };

        log::trace!("[link] -> {} {}", self.peer, packet);
        match self.socket.try_send_to(&packet.encode(), self.peer) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(ack) = attached {
                    self.piggyback.restore(ack, now);
                }
                Ok(false)
            }
            Err(e) => {
                if let Some(ack) = attached {
                    self.piggyback.restore(ack, now);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A socket that records what is sent and can be told to refuse sends.

    use std::collections::VecDeque;
    use std::future;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::socket::Readiness;

    #[derive(Default)]
    pub struct RecordingSocket {
        pub sent: Mutex<Vec<(Packet, SocketAddr)>>,
        pub would_block: AtomicBool,
        pub inbound: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
        pub closed: AtomicBool,
    }

    impl RecordingSocket {
        pub fn take_sent(&self) -> Vec<Packet> {
            self.sent
                .lock()
                .unwrap()
                .drain(..)
                .map(|(packet, _)| packet)
                .collect()
        }

        pub fn set_would_block(&self, on: bool) {
            self.would_block.store(on, Ordering::SeqCst);
        }
    }

    impl DatagramSocket for RecordingSocket {
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:1".parse().unwrap())
        }

        fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            if self.would_block.load(Ordering::SeqCst) {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let packet = Packet::decode(buf).unwrap();
            self.sent.lock().unwrap().push((packet, target));
            Ok(buf.len())
        }

        fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            match self.inbound.lock().unwrap().pop_front() {
                Some((bytes, from)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok((bytes.len(), from))
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn readable(&self) -> Readiness<'_> {
            Box::pin(future::pending())
        }

        fn writable(&self) -> Readiness<'_> {
            Box::pin(future::ready(Ok(())))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub fn peer() -> SocketAddr {
        "127.0.0.1:2".parse().unwrap()
    }

    pub fn link(socket: &Arc<RecordingSocket>) -> Link {
        Link::new(
            Arc::clone(socket) as Arc<dyn DatagramSocket>,
            peer(),
            PiggybackAck::new(std::time::Duration::from_millis(50)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn data(seq: u16) -> Packet {
        Packet::builder()
            .sequence(seq)
            .payload(&b"x"[..])
            .build()
            .unwrap()
    }

    #[test]
    fn pending_ack_rides_on_outgoing_packet() {
        let socket = Arc::new(RecordingSocket::default());
        let link = link(&socket);
        let now = Instant::now();
        link.piggyback().set(42, now);

        assert!(link.send(&data(1), now).unwrap());
        let sent = socket.take_sent();
        assert_eq!(sent[0].ack(), Some(42));
        assert_eq!(link.piggyback().take(), None);
    }

    #[test]
    fn packet_with_own_ack_keeps_pending_one() {
        let socket = Arc::new(RecordingSocket::default());
        let link = link(&socket);
        let now = Instant::now();
        link.piggyback().set(42, now);

        link.send(&Packet::ack_only(7), now).unwrap();
        assert_eq!(socket.take_sent()[0].ack(), Some(7));
        assert_eq!(link.piggyback().take(), Some(42));
    }

    #[test]
    fn would_block_restores_ack() {
        let socket = Arc::new(RecordingSocket::default());
        let link = link(&socket);
        let now = Instant::now();
        link.piggyback().set(42, now);
        socket.set_would_block(true);

        assert!(!link.send(&data(1), now).unwrap());
        assert!(socket.take_sent().is_empty());
        assert_eq!(link.piggyback().take(), Some(42));
    }
}
