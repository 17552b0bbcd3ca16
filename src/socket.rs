//! Non-blocking datagram socket abstraction.
//!
//! Connections and servers never touch `tokio::net::UdpSocket` directly.
//! They receive a [`SocketFactory`] at construction and talk to the
//! [`DatagramSocket`] it binds, which lets tests swap in the in-memory
//! network from [`crate::simulator`].
//!
//! All sends and receives are non-blocking: `WouldBlock` from
//! [`try_send_to`](DatagramSocket::try_send_to) means the kernel buffer is
//! full, from [`try_recv_from`](DatagramSocket::try_recv_from) that nothing
//! is queued.  The await points are [`readable`](DatagramSocket::readable),
//! used by the receive loop and the client handshake, and
//! [`writable`](DatagramSocket::writable), awaited before the handshake
//! sends anything on a fresh socket.
//!
//! [`close`](DatagramSocket::close) releases the address for every holder
//! of the socket at once; afterwards all operations fail with
//! `NotConnected`.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::lock;

/// Largest datagram written to a socket or accepted from one.
pub const MAX_DATAGRAM: usize = crate::packet::MAX_PACKET_SIZE;

/// Receive buffer size.  One byte of slack makes an oversized datagram
/// show up as a read longer than [`MAX_DATAGRAM`] instead of being
/// silently truncated to a valid-looking one.
pub const RECV_BUFFER_LEN: usize = MAX_DATAGRAM + 1;

pub type Readiness<'a> = Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait DatagramSocket: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Send one datagram without waiting.
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one queued datagram without waiting.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Resolves once a datagram may be available.  Readiness can be
    /// spurious; callers must still handle `WouldBlock`.
    fn readable(&self) -> Readiness<'_>;

    /// Resolves once a send may succeed.  Same caveat as
    /// [`readable`](Self::readable).
    fn writable(&self) -> Readiness<'_>;

    /// Release the address.  Idempotent.
    fn close(&self);
}

/// Binds sockets.  Injected into [`crate::Connection`] and [`crate::Server`].
pub trait SocketFactory: Send + Sync {
    fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>>;
}

/// The wildcard address of the same family as `target`, port 0.
pub fn ephemeral_for(target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is closed")
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

/// A real UDP socket driven by the tokio reactor.
///
/// The tokio socket sits behind an `Arc` so a pending readiness future can
/// own a handle; the descriptor is released once [`close`](DatagramSocket::close)
/// has run and that future is gone.
#[derive(Debug)]
pub struct UdpSocket {
    inner: Mutex<Option<Arc<tokio::net::UdpSocket>>>,
}

impl UdpSocket {
    /// Bind `addr` and register the socket with the current tokio runtime.
    ///
    /// Must be called from within a runtime.  Passing port `0` lets the OS
    /// choose an ephemeral port.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let std_socket = std::net::UdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;
        let inner = tokio::net::UdpSocket::from_std(std_socket)?;
        Ok(Self {
            inner: Mutex::new(Some(Arc::new(inner))),
        })
    }

    fn handle(&self) -> io::Result<Arc<tokio::net::UdpSocket>> {
        lock(&self.inner).clone().ok_or_else(closed_error)
    }
}

impl DatagramSocket for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.handle()?.local_addr()
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.handle()?.try_send_to(buf, target)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.handle()?.try_recv_from(buf)
    }

    fn readable(&self) -> Readiness<'_> {
        let handle = self.handle();
        Box::pin(async move { handle?.readable().await })
    }

    fn writable(&self) -> Readiness<'_> {
        let handle = self.handle();
        Box::pin(async move { handle?.writable().await })
    }

    fn close(&self) {
        lock(&self.inner).take();
    }
}

/// Binds [`UdpSocket`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpSocketFactory;

impl SocketFactory for UdpSocketFactory {
    fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>> {
        Ok(Arc::new(UdpSocket::bind(addr)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn ephemeral_matches_family() {
        let v4: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let v6: SocketAddr = "[::1]:9000".parse().unwrap();
        assert!(ephemeral_for(v4).is_ipv4());
        assert!(ephemeral_for(v6).is_ipv6());
        assert_eq!(ephemeral_for(v4).port(), 0);
    }

    #[tokio::test]
    async fn loopback_datagram_roundtrip() {
        let a = UdpSocketFactory.bind(any()).unwrap();
        let b = UdpSocketFactory.bind(any()).unwrap();
        let b_addr = b.local_addr().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(
            b.try_recv_from(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        loop {
            a.writable().await.unwrap();
            match a.try_send_to(b"ping", b_addr) {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("{e}"),
            }
        }
        loop {
            b.readable().await.unwrap();
            match b.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    assert_eq!(&buf[..n], b"ping");
                    assert_eq!(from, a.local_addr().unwrap());
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("{e}"),
            }
        }
    }

    #[tokio::test]
    async fn close_releases_the_address() {
        let socket = UdpSocketFactory.bind(any()).unwrap();
        let addr = socket.local_addr().unwrap();

        socket.close();
        socket.close();
        assert_eq!(
            socket.try_send_to(b"x", addr).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert_eq!(
            socket.readable().await.unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );

        std::net::UdpSocket::bind(addr).unwrap();
    }
}
