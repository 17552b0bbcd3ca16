//! Latest-wins unreliable stream.
//!
//! Payloads are sent once and never buffered or resent.  On receipt a
//! payload is kept only if its sequence is "newer than" the watermark, which
//! then moves to just past it: gaps are fine, late arrivals are dropped.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;

use crate::error::ConnError;
use crate::link::Link;
use crate::lock;
use crate::packet::Packet;
use crate::seq;

#[derive(Debug)]
struct State {
    sequence_in: u16,
    sequence_out: u16,
    delivered: VecDeque<Bytes>,
}

#[derive(Debug)]
pub struct UnreliableStream {
    state: Mutex<State>,
}

impl UnreliableStream {
    pub fn new(sequence_in: u16, sequence_out: u16) -> Self {
        Self {
            state: Mutex::new(State {
                sequence_in,
                sequence_out,
                delivered: VecDeque::new(),
            }),
        }
    }

    /// Best-effort send.  A full kernel buffer silently drops the payload.
    pub fn send(&self, link: &Link, payload: Bytes, now: Instant) -> Result<(), ConnError> {
        let packet = {
            let mut state = lock(&self.state);
            let packet = Packet::builder()
                .sequence(state.sequence_out)
                .payload(payload)
                .build()?;
            state.sequence_out = seq::next(state.sequence_out);
            packet
        };

        match link.send(&packet, now) {
            Ok(true) => {}
            Ok(false) => log::trace!("[unreliable] dropped {} (would block)", packet.sequence()),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub fn packet_received(&self, packet: &Packet) {
        let Some(payload) = packet.payload() else {
            return;
        };
        let mut state = lock(&self.state);
        if seq::newer_than_expected(state.sequence_in, packet.sequence()) {
            state.delivered.push_back(payload.clone());
            state.sequence_in = packet.next_sequence();
        } else {
            log::debug!(
                "[unreliable] stale packet {} (expected at least {})",
                packet.sequence(),
                state.sequence_in
            );
        }
    }

    pub fn take_delivered(&self) -> Vec<Bytes> {
        lock(&self.state).delivered.drain(..).collect()
    }
}
