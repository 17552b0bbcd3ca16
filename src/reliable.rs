//! Ordered, reliable stream built on [`GoBackNWindow`].
//!
//! Receive side:
//!
//! - Only **in-order** packets are accepted (`sequence == sequence_in`);
//!   their payloads are buffered until the connection's next poll.
//! - A packet **ahead** of `sequence_in` means the expected one was most
//!   likely lost.  It is discarded and an ACK for the unchanged
//!   `sequence_in` goes out immediately, bypassing the piggyback delay, so
//!   the sender's fast retransmit can kick in.
//! - Packets **behind** `sequence_in` are duplicates and are discarded.
//!
//! Accepted and duplicate packets schedule a deferred ACK through the
//! connection's [`PiggybackAck`](crate::piggyback::PiggybackAck).
//!
//! Send side: each payload gets the next outgoing sequence.  It is sent at
//! once when nothing is queued ahead of it and the window has room, and
//! queued otherwise; [`ReliableStream::poll`] drains the queue in order as
//! the window opens.
//!
//! The two sides sit behind separate locks so the receive loop and the
//! polling thread rarely contend.  The send lock may be held while the
//! piggyback lock is taken, and so may the receive lock; the send and
//! receive locks are never held together.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::Config;
use crate::error::ConnError;
use crate::gbn_window::GoBackNWindow;
use crate::link::Link;
use crate::lock;
use crate::packet::Packet;
use crate::seq;

/// Outcome of [`ReliableStream::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHealth {
    Alive,
    /// No useful ACK arrived within the send timeout.
    Dead,
}

#[derive(Debug)]
struct SendSide {
    sequence_out: u16,
    window: GoBackNWindow,
    out_queue: VecDeque<Packet>,
    send_timeout: Duration,
}

#[derive(Debug)]
struct RecvSide {
    sequence_in: u16,
    delivered: VecDeque<Bytes>,
}

#[derive(Debug)]
pub struct ReliableStream {
    send: Mutex<SendSide>,
    recv: Mutex<RecvSide>,
}

impl ReliableStream {
    /// `sequence_in` and `sequence_out` come from the handshake.
    pub fn new(sequence_in: u16, sequence_out: u16, config: &Config) -> Self {
        let mut window = GoBackNWindow::new(sequence_out, config.initial_rto);
        window.set_fast_retransmit(config.fast_retransmit);
        Self {
            send: Mutex::new(SendSide {
                sequence_out,
                window,
                out_queue: VecDeque::new(),
                send_timeout: config.send_timeout,
            }),
            recv: Mutex::new(RecvSide {
                sequence_in,
                delivered: VecDeque::new(),
            }),
        }
    }

    pub fn set_send_timeout(&self, timeout: Duration) {
        lock(&self.send).send_timeout = timeout;
    }

    /// Queue `payload` for in-order delivery, sending it right away if
    /// possible.
    ///
    /// A full kernel buffer is not an error; the packet waits in the queue.
    pub fn send(&self, link: &Link, payload: Bytes, now: Instant) -> Result<(), ConnError> {
        let mut side = lock(&self.send);
        let packet = Packet::builder()
            .reliable()
            .sequence(side.sequence_out)
            .payload(payload)
            .build()?;
        side.sequence_out = seq::next(side.sequence_out);

        if !side.out_queue.is_empty() || side.window.is_full() {
            side.out_queue.push_back(packet);
            return Ok(());
        }

        if link.send(&packet, now)? {
            side.window.packet_sent(packet, now);
        } else {
            side.out_queue.push_back(packet);
        }
        Ok(())
    }

    /// Handle a packet routed to this stream by the connection.
    ///
    /// Any ACK is applied to the send window first; a
    /// [`ConnError::ProtocolViolation`] from it is returned unchanged.
    pub fn packet_received(
        &self,
        link: &Link,
        packet: &Packet,
        now: Instant,
    ) -> Result<(), ConnError> {
        if let Some(ack) = packet.ack() {
            lock(&self.send).window.ack_received(ack, now)?;
        }

        let payload = match packet.payload() {
            Some(payload) if packet.is_reliable() => payload,
            _ => return Ok(()),
        };

        let mut recv = lock(&self.recv);
        let sequence = packet.sequence();
        if sequence == recv.sequence_in {
            recv.delivered.push_back(payload.clone());
            recv.sequence_in = seq::next(sequence);
        } else if seq::newer_than_expected(recv.sequence_in, sequence) {
            log::debug!(
                "[reliable] gap: expected {}, got {}; acking immediately",
                recv.sequence_in,
                sequence
            );
            link.piggyback().take();
            if let Err(e) = link.send(&Packet::ack_only(recv.sequence_in), now) {
                log::warn!("[reliable] immediate ack to {} failed: {e}", link.peer());
            }
            return Ok(());
        } else {
            log::trace!(
                "[reliable] duplicate {} (expected {})",
                sequence,
                recv.sequence_in
            );
        }

        link.piggyback().set(recv.sequence_in, now);
        Ok(())
    }

    /// Remove and return every payload accepted since the last call, in
    /// order.
    pub fn take_delivered(&self) -> Vec<Bytes> {
        lock(&self.recv).delivered.drain(..).collect()
    }

    /// Drive timers: detect a dead peer, retransmit, drain the outbound
    /// queue and flush an expired piggyback ACK.
    pub fn poll(&self, link: &Link, now: Instant) -> Result<StreamHealth, ConnError> {
        {
            let mut side = lock(&self.send);
            if side
                .window
                .has_passed_since_last_useful_ack(now, side.send_timeout)
            {
                log::warn!(
                    "[reliable] no useful ack from {} for {:?}",
                    link.peer(),
                    side.send_timeout
                );
                return Ok(StreamHealth::Dead);
            }

            if side.window.need_to_retransmit(now) {
                for packet in side.window.packets_to_retransmit(now) {
                    link.send(&packet, now)?;
                }
            }

            side.send_queued(link, now)?;
        }

        if let Some(ack) = link.piggyback().take_if_expired(now) {
            if let Err(e) = link.send(&Packet::ack_only(ack), now) {
                log::warn!("[reliable] ack to {} failed: {e}", link.peer());
            }
        }
        Ok(StreamHealth::Alive)
    }

    pub fn sequence_in(&self) -> u16 {
        lock(&self.recv).sequence_in
    }

    /// `(sequence_out, window_size, in_flight, queued, rto)`.
    pub(crate) fn send_stats(&self) -> (u16, usize, usize, usize, Duration) {
        let side = lock(&self.send);
        (
            side.sequence_out,
            side.window.window_size(),
            side.window.in_flight(),
            side.out_queue.len(),
            side.window.rto(),
        )
    }
}

impl SendSide {
    fn send_queued(&mut self, link: &Link, now: Instant) -> Result<(), ConnError> {
        while !self.window.is_full() {
            let Some(packet) = self.out_queue.front() else {
                break;
            };
            if !link.send(packet, now)? {
                break;
            }
            if let Some(packet) = self.out_queue.pop_front() {
                self.window.packet_sent(packet, now);
            }
        }
        Ok(())
    }
}
