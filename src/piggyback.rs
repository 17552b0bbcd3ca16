//! Deferred ACK holder shared by the streams of one connection.
//!
//! When the reliable stream wants to acknowledge something it stores the
//! sequence here instead of sending a bare ACK.  Any packet the connection
//! sends in the meantime picks the value up and carries it.  If nothing is
//! sent within the delay, the reliable stream flushes a payload-less ACK.
//!
//! Setting a new value while the delay is already running keeps the
//! original start time, so an ACK is never deferred for longer than one
//! delay.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::lock;
use crate::timer::Timer;

#[derive(Debug, Default)]
struct Inner {
    ack: Option<u16>,
    timer: Timer,
}

#[derive(Debug)]
pub struct PiggybackAck {
    delay: Duration,
    inner: Mutex<Inner>,
}

impl PiggybackAck {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Replace the pending ACK value, starting the delay if it is not running.
    pub fn set(&self, ack_sequence: u16, now: Instant) {
        let mut inner = self.lock();
        inner.ack = Some(ack_sequence);
        if !inner.timer.is_active() {
            inner.timer.restart(now);
        }
    }

    /// Remove and return the pending ACK, if any.
    pub fn take(&self) -> Option<u16> {
        let mut inner = self.lock();
        inner.timer.stop();
        inner.ack.take()
    }

    /// Like [`take`](Self::take), but only once the delay has run out.
    pub fn take_if_expired(&self, now: Instant) -> Option<u16> {
        let mut inner = self.lock();
        if !inner.timer.has_passed(now, self.delay) {
            return None;
        }
        inner.timer.stop();
        inner.ack.take()
    }

    /// Put back an ACK that was taken but could not be sent.
    ///
    /// A value set in the meantime is newer and wins.
    pub fn restore(&self, ack_sequence: u16, now: Instant) {
        let mut inner = self.lock();
        if inner.ack.is_none() {
            inner.ack = Some(ack_sequence);
            inner.timer.restart(now);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn take_clears() {
        let p = PiggybackAck::new(ms(50));
        p.set(4, Instant::now());
        assert_eq!(p.take(), Some(4));
        assert_eq!(p.take(), None);
    }

    #[test]
    fn expires_after_delay_from_first_set() {
        let start = Instant::now();
        let p = PiggybackAck::new(ms(50));
        p.set(1, start);
        p.set(2, start + ms(40));
        assert_eq!(p.take_if_expired(start + ms(45)), None);
        // Timer kept the first start, so 51 ms after it the newest value flushes.
        assert_eq!(p.take_if_expired(start + ms(51)), Some(2));
        assert_eq!(p.take_if_expired(start + ms(200)), None);
    }

    #[test]
    fn restore_does_not_clobber_newer_value() {
        let now = Instant::now();
        let p = PiggybackAck::new(ms(50));
        p.set(9, now);
        p.restore(7, now);
        assert_eq!(p.take(), Some(9));

        p.restore(7, now);
        assert_eq!(p.take(), Some(7));
    }
}
