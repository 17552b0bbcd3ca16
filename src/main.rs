//! Entry point for `streams-over-udp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All actual protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing) and the demo
//! echo protocol: the client sends big-endian `u32` counters on the reliable
//! stream and the server echoes them back.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use streams_over_udp::{AcceptAll, Config, Connection, ConnectionHandler, Server};

/// Reliable and unreliable streams over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run an echo server.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        /// Poll interval in milliseconds.
        #[arg(long, default_value_t = 10)]
        tick_ms: u64,
        /// How long a half-open handshake is kept, in milliseconds.
        #[arg(long)]
        pending_ttl_ms: Option<u64>,
    },
    /// Connect to an echo server, send counters and wait for the echoes.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Number of counters to send.
        #[arg(short, long, default_value_t = 1000)]
        count: u32,
        #[arg(long, default_value_t = 5000)]
        connect_timeout_ms: u64,
        /// Poll interval in milliseconds.
        #[arg(long, default_value_t = 10)]
        tick_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            bind,
            tick_ms,
            pending_ttl_ms,
        } => run_server(bind, Duration::from_millis(tick_ms), pending_ttl_ms).await,
        Mode::Client {
            server,
            count,
            connect_timeout_ms,
            tick_ms,
        } => {
            run_client(
                server,
                count,
                Duration::from_millis(connect_timeout_ms),
                Duration::from_millis(tick_ms),
            )
            .await
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct Echo;

impl ConnectionHandler for Echo {
    fn on_open(&mut self, conn: &Connection) {
        log::info!("{} connected", conn.peer_addr());
    }

    fn on_close(&mut self, conn: &Connection) {
        log::info!("{} disconnected", conn.peer_addr());
    }

    fn on_reliable_read(&mut self, conn: &Connection, payload: Bytes) {
        if let Err(e) = conn.send_reliable(payload) {
            log::warn!("echo to {} failed: {e}", conn.peer_addr());
        }
    }

    fn on_unreliable_read(&mut self, conn: &Connection, payload: Bytes) {
        log::info!("{} unreliable: {} bytes", conn.peer_addr(), payload.len());
    }
}

async fn run_server(
    bind: SocketAddr,
    tick: Duration,
    pending_ttl_ms: Option<u64>,
) -> anyhow::Result<()> {
    let mut config = Config::default();
    if let Some(ms) = pending_ttl_ms {
        config.pending_ttl = Duration::from_millis(ms);
    }
    let server = Server::with_options(
        bind,
        || Box::new(Echo) as Box<dyn ConnectionHandler>,
        AcceptAll,
        &streams_over_udp::UdpSocketFactory,
        config,
    )
    .with_context(|| format!("binding {bind}"))?;

    let mut interval = time::interval(tick);
    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                server.poll(now - last);
                last = now;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server.stop();
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Forwards echoed counters to the main loop.
struct Collect {
    echoes: mpsc::UnboundedSender<Bytes>,
}

impl ConnectionHandler for Collect {
    fn on_close(&mut self, conn: &Connection) {
        log::info!("connection to {} closed", conn.peer_addr());
    }

    fn on_reliable_read(&mut self, _conn: &Connection, payload: Bytes) {
        let _ = self.echoes.send(payload);
    }
}

async fn run_client(
    server: SocketAddr,
    count: u32,
    connect_timeout: Duration,
    tick: Duration,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Connection::open(server, connect_timeout, Box::new(Collect { echoes: tx }))
        .await
        .with_context(|| format!("connecting to {server}"))?;

    let started = Instant::now();
    for i in 0..count {
        conn.send_reliable(Bytes::copy_from_slice(&i.to_be_bytes()))?;
    }

    let mut expected = 0u32;
    let mut interval = time::interval(tick);
    let mut last = Instant::now();
    while expected < count {
        interval.tick().await;
        let now = Instant::now();
        conn.poll(now - last)?;
        last = now;

        while let Ok(echo) = rx.try_recv() {
            let value = <[u8; 4]>::try_from(echo.as_ref())
                .map(u32::from_be_bytes)
                .context("echo is not a 4-byte counter")?;
            if value != expected {
                bail!("echo out of order: expected {expected}, got {value}");
            }
            expected += 1;
        }

        if !conn.is_open() {
            bail!("connection closed after {expected} of {count} echoes");
        }
    }

    let stats = conn.stats();
    log::info!(
        "{count} echoes in {:?} (window {}, rto {:?})",
        started.elapsed(),
        stats.window_size,
        stats.rto
    );
    conn.close();
    conn.poll(Duration::ZERO)?;
    Ok(())
}
