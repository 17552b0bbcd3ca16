//! Shared harness: a server and one or more clients on a simulated network,
//! with handlers that record every callback.

#![allow(dead_code)]

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use streams_over_udp::simulator::{SimNetwork, SimSocketFactory, SimulatorConfig};
use streams_over_udp::{AcceptAll, Admission, Config, Connection, ConnectionHandler, Server};

pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
pub const TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open,
    Close,
    Reliable(Bytes),
    Unreliable(Bytes),
}

/// Callback log shared by every handler created from it, tagged by peer.
#[derive(Debug, Clone, Default)]
pub struct Events(Arc<Mutex<Vec<(SocketAddr, Event)>>>);

impl Events {
    pub fn handler(&self) -> Box<dyn ConnectionHandler> {
        Box::new(Recorder(self.clone()))
    }

    pub fn all(&self) -> Vec<Event> {
        self.0.lock().unwrap().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn from_peer(&self, peer: SocketAddr) -> Vec<Event> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(from, _)| *from == peer)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.all().iter().filter(|e| *e == wanted).count()
    }

    pub fn reliable(&self) -> Vec<Bytes> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Event::Reliable(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    pub fn unreliable(&self) -> Vec<Bytes> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Event::Unreliable(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    /// Reliable payloads decoded as big-endian `u32`s.
    pub fn reliable_ints(&self) -> Vec<u32> {
        self.reliable().iter().map(|b| decode_int(b)).collect()
    }

    pub fn reliable_ints_from(&self, peer: SocketAddr) -> Vec<u32> {
        self.from_peer(peer)
            .into_iter()
            .filter_map(|e| match e {
                Event::Reliable(b) => Some(decode_int(&b)),
                _ => None,
            })
            .collect()
    }
}

struct Recorder(Events);

impl Recorder {
    fn push(&self, conn: &Connection, event: Event) {
        (self.0).0.lock().unwrap().push((conn.peer_addr(), event));
    }
}

impl ConnectionHandler for Recorder {
    fn on_open(&mut self, conn: &Connection) {
        self.push(conn, Event::Open);
    }

    fn on_close(&mut self, conn: &Connection) {
        self.push(conn, Event::Close);
    }

    fn on_reliable_read(&mut self, conn: &Connection, payload: Bytes) {
        self.push(conn, Event::Reliable(payload));
    }

    fn on_unreliable_read(&mut self, conn: &Connection, payload: Bytes) {
        self.push(conn, Event::Unreliable(payload));
    }
}

pub fn int(i: u32) -> Bytes {
    Bytes::copy_from_slice(&i.to_be_bytes())
}

pub fn decode_int(b: &[u8]) -> u32 {
    u32::from_be_bytes(b.try_into().unwrap())
}

pub fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub net: SimNetwork,
    pub server: Server,
    pub server_factory: SimSocketFactory,
    pub server_events: Events,
    pub config: Config,
}

impl Harness {
    pub fn new(server_faults: SimulatorConfig) -> Self {
        Self::with_admission(server_faults, AcceptAll)
    }

    pub fn with_admission(
        server_faults: SimulatorConfig,
        admission: impl Admission + 'static,
    ) -> Self {
        let net = SimNetwork::new();
        let server_factory = SimSocketFactory::new(net.clone(), server_faults);
        let server_events = Events::default();
        let factory_events = server_events.clone();
        let config = Config::default();
        let server = Server::with_options(
            any_addr(),
            move || factory_events.handler(),
            admission,
            &server_factory,
            config.clone(),
        )
        .unwrap();
        Self {
            net,
            server,
            server_factory,
            server_events,
            config,
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server.local_addr().unwrap()
    }

    /// Open a client whose outbound datagrams go through `faults`.
    pub async fn open(
        &self,
        faults: SimulatorConfig,
        timeout: Duration,
    ) -> Result<Client, streams_over_udp::ConnError> {
        let factory = SimSocketFactory::new(self.net.clone(), faults);
        let events = Events::default();
        let conn = Connection::open_with(
            &factory,
            &self.config,
            self.server_addr(),
            timeout,
            events.handler(),
        )
        .await?;
        Ok(Client {
            conn,
            events,
            factory,
        })
    }

    pub async fn connect(&self, faults: SimulatorConfig) -> Client {
        let client = self.open(faults, CONNECT_TIMEOUT).await.unwrap();
        let addr = client.addr();
        assert!(
            pump_until(self, &[&client], Duration::from_secs(2), || self
                .server
                .connections()
                .iter()
                .any(|c| c.peer_addr() == addr))
            .await,
            "server never accepted {addr}"
        );
        client
    }

    /// The server's handle for `client`.
    pub fn server_side(&self, client: &Client) -> Connection {
        let addr = client.addr();
        self.server
            .connections()
            .into_iter()
            .find(|c| c.peer_addr() == addr)
            .unwrap()
    }
}

pub struct Client {
    pub conn: Connection,
    pub events: Events,
    pub factory: SimSocketFactory,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("conn", &self.conn)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn addr(&self) -> SocketAddr {
        self.conn.local_addr().unwrap()
    }
}

/// One round: poll the server and every client, then let the network run.
pub async fn pump(h: &Harness, clients: &[&Client]) {
    h.server.poll(TICK);
    for client in clients {
        let _ = client.conn.poll(TICK);
    }
    tokio::time::sleep(TICK).await;
}

/// Pump until `done` holds or `limit` elapses.  Returns whether `done` held.
pub async fn pump_until(
    h: &Harness,
    clients: &[&Client],
    limit: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        pump(h, clients).await;
    }
    done()
}

/// Pump until `progress` stops changing for `idle_rounds` polls of 50 ms.
pub async fn pump_while_progressing(
    h: &Harness,
    clients: &[&Client],
    idle_rounds: usize,
    mut progress: impl FnMut() -> usize,
    target: usize,
) {
    let mut last = progress();
    let mut idle = 0;
    while last < target && idle < idle_rounds {
        let round_end = Instant::now() + Duration::from_millis(50);
        while Instant::now() < round_end {
            pump(h, clients).await;
        }
        let now = progress();
        if now == last {
            idle += 1;
        } else {
            idle = 0;
            last = now;
        }
    }
}
