//! Application-facing capabilities.
//!
//! - [`ConnectionHandler`]: per-connection callbacks.  They run only inside
//!   [`Connection::poll`](crate::Connection::poll) (directly, or through
//!   [`Server::poll`](crate::Server::poll)), never on the receive task.
//! - [`HandlerFactory`]: gives the server one handler per accepted client.
//! - [`Admission`]: decides whether a connect request is answered.
//!
//! Closures work for the last two:
//!
//! ```
//! use streams_over_udp::handler::{Admission, ConnectionHandler, HandlerFactory, NoopHandler};
//!
//! let factory = || Box::new(NoopHandler) as Box<dyn ConnectionHandler>;
//! let _: &dyn HandlerFactory = &factory;
//! let only_loopback = |addr: std::net::SocketAddr| addr.ip().is_loopback();
//! assert!(only_loopback.admit("127.0.0.1:9".parse().unwrap()));
//! ```

use std::net::SocketAddr;

use bytes::Bytes;

use crate::connection::Connection;

/// Callbacks for one connection.  Every method defaults to doing nothing.
pub trait ConnectionHandler: Send {
    /// First poll of a freshly established connection.
    fn on_open(&mut self, _conn: &Connection) {}

    /// The connection closed, for whatever reason.  No error is attached.
    fn on_close(&mut self, _conn: &Connection) {}

    fn on_reliable_read(&mut self, _conn: &Connection, _payload: Bytes) {}

    fn on_unreliable_read(&mut self, _conn: &Connection, _payload: Bytes) {}
}

/// A handler that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}

pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Box<dyn ConnectionHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn ConnectionHandler> + Send + Sync,
{
    fn create(&self) -> Box<dyn ConnectionHandler> {
        self()
    }
}

pub trait Admission: Send + Sync {
    fn admit(&self, addr: SocketAddr) -> bool;
}

impl<F> Admission for F
where
    F: Fn(SocketAddr) -> bool + Send + Sync,
{
    fn admit(&self, addr: SocketAddr) -> bool {
        self(addr)
    }
}

/// Admits every address.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl Admission for AcceptAll {
    fn admit(&self, _addr: SocketAddr) -> bool {
        true
    }
}
