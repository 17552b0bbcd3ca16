//! Server-side half-open handshakes.
//!
//! An entry is created when the server answers a connect request and is
//! keyed by the client address plus the ACK the server expects back.  It
//! lives until the client's final ACK completes it or it outlives the TTL.
//! Entries are swept in insertion order and the sweep stops at the first
//! live one, since everything after it is younger.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

type Key = (SocketAddr, u16);

#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Sequence the server expects first from the client.
    client_sequence_in: u16,
    created: Instant,
}

#[derive(Debug, Default)]
pub struct PendingConnections {
    entries: HashMap<Key, Entry>,
    /// Insertion order; may hold keys that were already completed.
    order: VecDeque<(Key, Instant)>,
}

impl PendingConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a handshake awaiting `expected_ack` from `addr`.
    ///
    /// Re-inserting an existing key refreshes it.
    pub fn insert(
        &mut self,
        addr: SocketAddr,
        expected_ack: u16,
        client_sequence_in: u16,
        now: Instant,
    ) {
        let key = (addr, expected_ack);
        self.entries.insert(
            key,
            Entry {
                client_sequence_in,
                created: now,
            },
        );
        self.order.push_back((key, now));
    }

    /// Remove the handshake matching `(addr, ack)` and return the client's
    /// initial sequence.
    pub fn complete(&mut self, addr: SocketAddr, ack: u16) -> Option<u16> {
        self.entries
            .remove(&(addr, ack))
            .map(|entry| entry.client_sequence_in)
    }

    /// Drop entries older than `ttl`, oldest first.  Returns how many
    /// handshakes expired.
    pub fn sweep(&mut self, now: Instant, ttl: Duration) -> usize {
        let mut expired = 0;
        while let Some(&(key, created)) = self.order.front() {
            if now.saturating_duration_since(created) <= ttl {
                break;
            }
            self.order.pop_front();
            // Only remove the entry this order slot was recorded for; a
            // refreshed or completed key has a different (or no) entry.
            if self
                .entries
                .get(&key)
                .map_or(false, |entry| entry.created == created)
            {
                self.entries.remove(&key);
                expired += 1;
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
