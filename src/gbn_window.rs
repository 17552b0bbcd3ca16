//! Go-Back-N send window.
//!
//! [`GoBackNWindow`] tracks reliable packets that were handed to the socket
//! but not yet acknowledged, oldest first.  It decides when the whole window
//! must be resent and how large the window may grow.
//!
//! # Protocol contract
//!
//! - At most `window_size` packets are registered at send time; the size
//!   lives in `[MIN_WINDOW_SIZE, MAX_WINDOW_SIZE]`, starts at the minimum,
//!   grows by one for every packet an ACK removes and halves on a plain
//!   retransmit timeout.
//! - ACKs are **cumulative**: `ack = K` means the peer expects `K` next, so
//!   every packet before `K` is removed.  An ACK that is not "newer than"
//!   the base is stale and ignored; one covering more packets than are
//!   outstanding is a protocol violation.
//! - Three ACKs in a row that repeat the unmoving base trigger a fast
//!   retransmit of the whole window (no halving).
//! - A second timer, never reset by retransmits, measures the time since the
//!   last ACK that advanced the window; the owner uses it to declare the
//!   connection dead.
//!
//! ```text
//!    base                      base + in_flight
//!      │                              │
//!  ────┼──────────────────────────────┼────────────────▶ seq space (mod 65536)
//!      │ <──────── in flight ───────▶ │ <── sendable (window_size − in_flight)
//! ```
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::ConnError;
use crate::packet::Packet;
use crate::seq;
use crate::timer::{Timer, VariableTimeout};

pub const MIN_WINDOW_SIZE: usize = 5;
pub const MAX_WINDOW_SIZE: usize = 100;

/// Repeated base ACKs that trigger a fast retransmit.
const FAST_RETRANSMIT_THRESHOLD: u32 = 3;

// ---------------------------------------------------------------------------
// WindowEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct WindowEntry {
    packet: Packet,
    /// Most recent transmission, for RTT sampling.
    last_sent: Instant,
}

// ---------------------------------------------------------------------------
// GoBackNWindow
// ---------------------------------------------------------------------------

/// Not synchronised; the owning stream keeps it behind its send lock.
#[derive(Debug)]
pub struct GoBackNWindow {
    /// Sequence of the oldest unacked packet, or of the next packet to send
    /// when nothing is outstanding.
    base: u16,
    window_size: usize,
    sent: VecDeque<WindowEntry>,
    retransmit_timer: Timer,
    close_timer: Timer,
    rto: VariableTimeout,
    fast_retransmit: bool,
    repeated_acks: u32,
}

impl GoBackNWindow {
    pub fn new(initial_sequence_out: u16, initial_rto: Duration) -> Self {
        Self {
            base: initial_sequence_out,
            window_size: MIN_WINDOW_SIZE,
            sent: VecDeque::with_capacity(MIN_WINDOW_SIZE),
            retransmit_timer: Timer::default(),
            close_timer: Timer::default(),
            rto: VariableTimeout::new(initial_rto),
            fast_retransmit: true,
            repeated_acks: 0,
        }
    }

    pub fn set_fast_retransmit(&mut self, enabled: bool) {
        self.fast_retransmit = enabled;
        self.repeated_acks = 0;
    }

    pub fn is_full(&self) -> bool {
        self.sent.len() >= self.window_size
    }

    pub fn in_flight(&self) -> usize {
        self.sent.len()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto.timeout()
    }

    /// Register a packet that was just handed to the socket.
    ///
    /// Starts either timer that is not already running, so they keep timing
    /// the oldest outstanding packet.
    ///
    /// # Panics
    ///
    /// Panics in debug mode if the packet's sequence is behind the base or
    /// the window is already full.  Check [`is_full`](Self::is_full) first.
    pub fn packet_sent(&mut self, packet: Packet, now: Instant) {
        debug_assert!(
            seq::newer_than_expected(self.base, packet.sequence()),
            "window expects a sequence at or after {}, got {}",
            self.base,
            packet.sequence()
        );
        debug_assert!(
            !self.is_full(),
            "packet_sent on a full window ({} / {})",
            self.sent.len(),
            self.window_size
        );

        if !self.retransmit_timer.is_active() {
            self.retransmit_timer.restart(now);
        }
        if !self.close_timer.is_active() {
            self.close_timer.restart(now);
        }
        self.sent.push_back(WindowEntry {
            packet,
            last_sent: now,
        });
    }

    /// Process a cumulative ACK and return how many packets it removed.
    pub fn ack_received(&mut self, ack: u16, now: Instant) -> Result<usize, ConnError> {
        if !seq::newer_than_expected(self.base, ack) {
            log::trace!("[gbn] stale ack {ack} (base {})", self.base);
            return Ok(0);
        }

        let acked = usize::from(seq::distance(self.base, ack));
        if acked > self.sent.len() {
            return Err(ConnError::ProtocolViolation {
                base: self.base,
                ack,
                acked,
                outstanding: self.sent.len(),
            });
        }

        if self.fast_retransmit {
            if acked == 0 {
                self.repeated_acks += 1;
            } else {
                self.repeated_acks = 0;
            }
        }
        if acked == 0 {
            return Ok(0);
        }

        for entry in self.sent.drain(..acked) {
            self.rto
                .update(now.saturating_duration_since(entry.last_sent));
        }
        self.window_size = (self.window_size + acked).min(MAX_WINDOW_SIZE);
        self.base = ack;

        if self.sent.is_empty() {
            self.retransmit_timer.stop();
            self.close_timer.stop();
        } else {
            self.retransmit_timer.restart(now);
            self.close_timer.restart(now);
        }

        log::trace!(
            "[gbn] ack {ack}: removed {acked}, in flight {}, window {}, rto {:?}",
            self.sent.len(),
            self.window_size,
            self.rto.timeout()
        );
        Ok(acked)
    }

    /// Whether the window must be resent now.
    ///
    /// A fast retransmit consumes the repeated-ACK count and restarts the
    /// retransmit timer if it is running.  A plain timeout restarts the timer
    /// and halves the window.
    pub fn need_to_retransmit(&mut self, now: Instant) -> bool {
        if self.fast_retransmit && self.repeated_acks >= FAST_RETRANSMIT_THRESHOLD {
            self.repeated_acks = 0;
            if self.retransmit_timer.is_active() {
                self.retransmit_timer.restart(now);
            }
            log::debug!("[gbn] fast retransmit from base {}", self.base);
            return true;
        }

        if !self.retransmit_timer.has_passed(now, self.rto.timeout()) {
            return false;
        }

        self.retransmit_timer.restart(now);
        self.window_size = (self.window_size / 2).max(MIN_WINDOW_SIZE);
        log::debug!(
            "[gbn] retransmit timeout after {:?}; base {}, window shrinks to {}",
            self.rto.timeout(),
            self.base,
            self.window_size
        );
        true
    }

    /// Every outstanding packet, oldest first, each marked as resent now.
    pub fn packets_to_retransmit(&mut self, now: Instant) -> Vec<Packet> {
        self.sent
            .iter_mut()
            .map(|entry| {
                entry.last_sent = now;
                entry.packet.clone()
            })
            .collect()
    }

    /// Whether packets are outstanding and no ACK has advanced the window
    /// for longer than `timeout`.
    pub fn has_passed_since_last_useful_ack(&self, now: Instant, timeout: Duration) -> bool {
        self.close_timer.has_passed(now, timeout)
    }
}
