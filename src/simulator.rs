//! In-memory lossy network for deterministic testing.
//!
//! Real networks drop, reorder and duplicate datagrams.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! this module provides a [`SimNetwork`] (a registry of in-memory sockets
//! keyed by address) and a [`SimSocketFactory`] that binds sockets on it
//! and applies a configurable fault model to everything they send:
//!
//! | Fault           | Description                                          |
//! |-----------------|------------------------------------------------------|
//! | Packet loss     | Drop with probability `loss_rate`, at the send       |
//! |                 | indices in `drop_indices`, or when `drop_when` says. |
//! | Reordering      | Hold a datagram back for `delay` (probability        |
//! |                 | `delay_rate` or index in `delay_indices`), letting   |
//! |                 | later datagrams overtake it.                         |
//! | Duplication     | Deliver a datagram twice.                            |
//!
//! Dropped datagrams still report success to the sender, exactly like a
//! datagram lost somewhere on the wire.
//!
//! All sockets bound through one factory share its fault model, RNG and send
//! counter, so a test can say "drop the tenth datagram the client side
//! sends".  Each side of a test usually gets its own factory on a shared
//! network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;

use crate::lock;
use crate::packet::Packet;
use crate::socket::{closed_error, DatagramSocket, Readiness, SocketFactory};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Decides from the decoded packet whether to drop it.
pub type DropPredicate = Arc<dyn Fn(&Packet) -> bool + Send + Sync>;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.  Indices count every
/// datagram sent through the factory's sockets, starting at zero.
#[derive(Clone)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that a datagram is held back by `delay`.
    pub delay_rate: f64,
    /// How long delayed datagrams are held back.
    pub delay: Duration,
    /// Seed for the probabilistic faults.
    pub seed: u64,
    /// Send indices that are always dropped.
    pub drop_indices: HashSet<u64>,
    /// Send indices that are always delayed.
    pub delay_indices: HashSet<u64>,
    /// Drop any packet for which this returns `true`.
    pub drop_when: Option<DropPredicate>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default; the network is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            delay_rate: 0.0,
            delay: Duration::from_millis(50),
            seed: 0,
            drop_indices: HashSet::new(),
            delay_indices: HashSet::new(),
            drop_when: None,
        }
    }
}

impl SimulatorConfig {
    /// Drop exactly the datagrams sent at `indices`.
    pub fn dropping(indices: impl IntoIterator<Item = u64>) -> Self {
        Self {
            drop_indices: indices.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Drop every packet matching `predicate`.
    pub fn dropping_when(predicate: impl Fn(&Packet) -> bool + Send + Sync + 'static) -> Self {
        Self {
            drop_when: Some(Arc::new(predicate)),
            ..Self::default()
        }
    }
}

impl fmt::Debug for SimulatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatorConfig")
            .field("loss_rate", &self.loss_rate)
            .field("duplicate_rate", &self.duplicate_rate)
            .field("delay_rate", &self.delay_rate)
            .field("delay", &self.delay)
            .field("seed", &self.seed)
            .field("drop_indices", &self.drop_indices)
            .field("delay_indices", &self.delay_indices)
            .field("drop_when", &self.drop_when.as_ref().map(|_| ".."))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SimNetwork
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    notify: Notify,
    closed: AtomicBool,
}

#[derive(Default)]
struct Registry {
    sockets: HashMap<SocketAddr, Arc<Mailbox>>,
    next_port: u16,
}

/// Shared registry of in-memory sockets.  Cheap to clone.
#[derive(Clone, Default)]
pub struct SimNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver raw bytes to `to` as if `from` had sent them, bypassing any
    /// fault model.  Unknown destinations are ignored.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, bytes: impl Into<Vec<u8>>) {
        self.deliver(from, to, bytes.into());
    }

    fn register(&self, addr: SocketAddr) -> io::Result<(SocketAddr, Arc<Mailbox>)> {
        let mut registry = lock(&self.registry);
        let ip = if addr.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            addr.ip()
        };

        let addr = if addr.port() == 0 {
            loop {
                if registry.next_port < FIRST_EPHEMERAL_PORT {
                    registry.next_port = FIRST_EPHEMERAL_PORT;
                }
                let candidate = SocketAddr::new(ip, registry.next_port);
                registry.next_port = registry.next_port.wrapping_add(1);
                if !registry.sockets.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            SocketAddr::new(ip, addr.port())
        };

        if registry.sockets.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} is already bound"),
            ));
        }
        let mailbox = Arc::new(Mailbox::default());
        registry.sockets.insert(addr, Arc::clone(&mailbox));
        Ok((addr, mailbox))
    }

    /// Free `addr` if it is still bound to `mailbox`.  A socket that was
    /// closed earlier must not evict whoever rebound the address since.
    fn unregister(&self, addr: SocketAddr, mailbox: &Arc<Mailbox>) {
        let mut registry = lock(&self.registry);
        if registry
            .sockets
            .get(&addr)
            .is_some_and(|bound| Arc::ptr_eq(bound, mailbox))
        {
            registry.sockets.remove(&addr);
        }
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, bytes: Vec<u8>) {
        let mailbox = lock(&self.registry).sockets.get(&to).cloned();
        match mailbox {
            Some(mailbox) => {
                lock(&mailbox.queue).push_back((bytes, from));
                mailbox.notify.notify_one();
            }
            None => log::trace!("[sim] {from} -> {to}: no such socket"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fault model
// ---------------------------------------------------------------------------

enum Fate {
    Drop,
    Deliver { copies: usize, delayed: bool },
}

struct FaultModel {
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    sent: AtomicU64,
}

impl FaultModel {
    fn decide(&self, bytes: &[u8]) -> Fate {
        let index = self.sent.fetch_add(1, Ordering::SeqCst);
        let config = &self.config;

        if config.drop_indices.contains(&index) {
            return Fate::Drop;
        }
        if let Some(predicate) = &config.drop_when {
            if Packet::decode(bytes).map_or(false, |packet| predicate(&packet)) {
                return Fate::Drop;
            }
        }

        let mut rng = lock(&self.rng);
        if rng.random::<f64>() < config.loss_rate {
            return Fate::Drop;
        }
        let copies = if rng.random::<f64>() < config.duplicate_rate { 2 } else { 1 };
        let delayed =
            config.delay_indices.contains(&index) || rng.random::<f64>() < config.delay_rate;
        Fate::Deliver { copies, delayed }
    }
}

// ---------------------------------------------------------------------------
// SimSocketFactory / SimSocket
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SimSocketFactory {
    network: SimNetwork,
    faults: Arc<FaultModel>,
}

impl SimSocketFactory {
    pub fn new(network: SimNetwork, config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            network,
            faults: Arc::new(FaultModel {
                config,
                rng: Mutex::new(rng),
                sent: AtomicU64::new(0),
            }),
        }
    }

    /// Datagrams sent so far through this factory's sockets, dropped ones
    /// included.
    pub fn sent_count(&self) -> u64 {
        self.faults.sent.load(Ordering::SeqCst)
    }
}

impl SocketFactory for SimSocketFactory {
    fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>> {
        let (local, mailbox) = self.network.register(addr)?;
        log::trace!("[sim] bound {local}");
        Ok(Arc::new(SimSocket {
            local,
            mailbox,
            network: self.network.clone(),
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct SimSocket {
    local: SocketAddr,
    mailbox: Arc<Mailbox>,
    network: SimNetwork,
    faults: Arc<FaultModel>,
}

impl DatagramSocket for SimSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let (copies, delayed) = match self.faults.decide(buf) {
            Fate::Drop => {
                log::trace!("[sim] {} -> {target}: dropped", self.local);
                return Ok(buf.len());
            }
            Fate::Deliver { copies, delayed } => (copies, delayed),
        };

        for _ in 0..copies {
            if delayed {
                self.deliver_later(target, buf.to_vec());
            } else {
                self.network.deliver(self.local, target, buf.to_vec());
            }
        }
        Ok(buf.len())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let (bytes, from) = lock(&self.mailbox.queue)
            .pop_front()
            .ok_or(io::ErrorKind::WouldBlock)?;
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok((n, from))
    }

    fn readable(&self) -> Readiness<'_> {
        Box::pin(async move {
            loop {
                let notified = self.mailbox.notify.notified();
                if self.is_closed() {
                    return Err(closed_error());
                }
                if !lock(&self.mailbox.queue).is_empty() {
                    return Ok(());
                }
                notified.await;
            }
        })
    }

    fn writable(&self) -> Readiness<'_> {
        let ready = if self.is_closed() {
            Err(closed_error())
        } else {
            Ok(())
        };
        Box::pin(std::future::ready(ready))
    }

    fn close(&self) {
        if self.mailbox.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.network.unregister(self.local, &self.mailbox);
        lock(&self.mailbox.queue).clear();
        self.mailbox.notify.notify_waiters();
        log::trace!("[sim] closed {}", self.local);
    }
}

impl SimSocket {
    fn is_closed(&self) -> bool {
        self.mailbox.closed.load(Ordering::SeqCst)
    }

    fn deliver_later(&self, target: SocketAddr, bytes: Vec<u8>) {
        let network = self.network.clone();
        let from = self.local;
        let delay = self.faults.config.delay;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    network.deliver(from, target, bytes);
                });
            }
            Err(_) => network.deliver(from, target, bytes),
        }
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        self.network.unregister(self.local, &self.mailbox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any() -> SocketAddr {
        "0.0.0.0:0".parse().unwrap()
    }

    fn recv_all(socket: &Arc<dyn DatagramSocket>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while let Ok((n, _)) = socket.try_recv_from(&mut buf) {
            out.push(buf[..n].to_vec());
        }
        out
    }

    #[test]
    fn ephemeral_ports_are_unique_and_on_loopback() {
        let factory = SimSocketFactory::new(SimNetwork::new(), SimulatorConfig::default());
        let a = factory.bind(any()).unwrap().local_addr().unwrap();
        let b = factory.bind(any()).unwrap().local_addr().unwrap();
        assert_ne!(a, b);
        assert!(a.ip().is_loopback());
    }

    #[test]
    fn binding_taken_address_fails() {
        let factory = SimSocketFactory::new(SimNetwork::new(), SimulatorConfig::default());
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let _held = factory.bind(addr).unwrap();
        let err = factory.bind(addr).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn address_freed_on_drop() {
        let factory = SimSocketFactory::new(SimNetwork::new(), SimulatorConfig::default());
        let addr: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        drop(factory.bind(addr).unwrap());
        assert!(factory.bind(addr).is_ok());
    }

    #[tokio::test]
    async fn closed_address_can_be_rebound() {
        let net = SimNetwork::new();
        let factory = SimSocketFactory::new(net.clone(), SimulatorConfig::default());
        let addr: SocketAddr = "127.0.0.1:7002".parse().unwrap();
        let old = factory.bind(addr).unwrap();

        old.close();
        assert_eq!(
            old.try_send_to(b"x", addr).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert_eq!(
            old.readable().await.unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );

        let new = factory.bind(addr).unwrap();
        // The stale handle going away must leave the new binding alone.
        drop(old);
        net.inject("127.0.0.1:1".parse().unwrap(), addr, vec![7]);
        assert_eq!(recv_all(&new), vec![vec![7]]);
    }

    #[tokio::test]
    async fn close_wakes_a_pending_reader() {
        let factory = SimSocketFactory::new(SimNetwork::new(), SimulatorConfig::default());
        let socket = factory.bind(any()).unwrap();

        let closer = Arc::clone(&socket);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });

        let woken = tokio::time::timeout(Duration::from_secs(1), socket.readable())
            .await
            .expect("woken");
        assert!(woken.is_err());
    }

    #[test]
    fn drops_by_index_across_sockets_of_one_factory() {
        let net = SimNetwork::new();
        let lossy = SimSocketFactory::new(net.clone(), SimulatorConfig::dropping([1, 2]));
        let clean = SimSocketFactory::new(net, SimulatorConfig::default());
        let sink = clean.bind(any()).unwrap();
        let to = sink.local_addr().unwrap();

        let a = lossy.bind(any()).unwrap();
        let b = lossy.bind(any()).unwrap();
        a.try_send_to(b"0", to).unwrap();
        b.try_send_to(b"1", to).unwrap();
        a.try_send_to(b"2", to).unwrap();
        b.try_send_to(b"3", to).unwrap();

        assert_eq!(recv_all(&sink), vec![b"0".to_vec(), b"3".to_vec()]);
        assert_eq!(lossy.sent_count(), 4);
    }

    #[test]
    fn predicate_sees_decoded_packet() {
        let net = SimNetwork::new();
        let factory = SimSocketFactory::new(
            net.clone(),
            SimulatorConfig::dropping_when(|p: &Packet| p.has_ack()),
        );
        let sink = SimSocketFactory::new(net, SimulatorConfig::default())
            .bind(any())
            .unwrap();
        let to = sink.local_addr().unwrap();
        let socket = factory.bind(any()).unwrap();

        socket.try_send_to(&Packet::ack_only(1).encode(), to).unwrap();
        socket.try_send_to(&Packet::close_notice().encode(), to).unwrap();
        assert_eq!(recv_all(&sink).len(), 1);
    }

    #[test]
    fn full_duplication() {
        let net = SimNetwork::new();
        let config = SimulatorConfig {
            duplicate_rate: 1.0,
            ..SimulatorConfig::default()
        };
        let socket = SimSocketFactory::new(net.clone(), config).bind(any()).unwrap();
        let sink = SimSocketFactory::new(net, SimulatorConfig::default())
            .bind(any())
            .unwrap();
        socket.try_send_to(b"x", sink.local_addr().unwrap()).unwrap();
        assert_eq!(recv_all(&sink).len(), 2);
    }

    #[tokio::test]
    async fn delayed_datagram_is_overtaken() {
        let net = SimNetwork::new();
        let config = SimulatorConfig {
            delay_indices: [0].into_iter().collect(),
            delay: Duration::from_millis(20),
            ..SimulatorConfig::default()
        };
        let socket = SimSocketFactory::new(net.clone(), config).bind(any()).unwrap();
        let sink = SimSocketFactory::new(net, SimulatorConfig::default())
            .bind(any())
            .unwrap();
        let to = sink.local_addr().unwrap();

        socket.try_send_to(b"first", to).unwrap();
        socket.try_send_to(b"second", to).unwrap();
        assert_eq!(recv_all(&sink), vec![b"second".to_vec()]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(recv_all(&sink), vec![b"first".to_vec()]);
    }

    #[tokio::test]
    async fn readable_wakes_on_delivery() {
        let net = SimNetwork::new();
        let factory = SimSocketFactory::new(net.clone(), SimulatorConfig::default());
        let socket = factory.bind(any()).unwrap();
        let to = socket.local_addr().unwrap();

        let injector = net.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            injector.inject("127.0.0.1:1".parse().unwrap(), to, vec![1, 2, 3]);
        });

        tokio::time::timeout(Duration::from_secs(1), socket.readable())
            .await
            .expect("woken")
            .unwrap();
        assert_eq!(recv_all(&socket), vec![vec![1, 2, 3]]);
    }
}
