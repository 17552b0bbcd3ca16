//! Connection lifecycle state.
//!
//! ```text
//!   OPEN ──close() / CLOSE packet / dead peer──▶ CLOSING ──next poll──▶ CLOSED
//! ```
//!
//! A connection exists only after its handshake completed, so it starts in
//! [`ConnectionState::Open`].  `Closing` means "closed, but the handler has
//! not been told yet"; the close callback runs on the next poll, which then
//! moves to `Closed`.
//!
//! The receive loop and the polling thread both change the state, so it is
//! kept in an [`AtomicState`] and moved with compare-and-set.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Closing => 1,
            Self::Closed => 2,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; `false` if the state was not `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
