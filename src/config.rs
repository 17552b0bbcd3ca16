//! Tunable protocol parameters.

use std::time::Duration;

/// Timing and behaviour knobs shared by clients and servers.
///
/// The defaults are the protocol's reference values; tests shorten them to
/// keep runs fast.
#[derive(Debug, Clone)]
pub struct Config {
    /// RTO used before the first RTT sample is available.
    pub initial_rto: Duration,
    /// Close the connection if no useful ACK arrives for this long while
    /// reliable data is outstanding.
    pub send_timeout: Duration,
    /// Lifetime of a server-side half-open handshake.
    pub pending_ttl: Duration,
    /// Interval between client connect-request retransmissions.
    pub connect_retry_interval: Duration,
    /// How long a bare ACK waits for an outgoing packet to ride on.
    pub piggyback_delay: Duration,
    /// Retransmit the window after three repeated base ACKs.
    pub fast_retransmit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(500),
            send_timeout: Duration::from_millis(5000),
            pending_ttl: Duration::from_millis(5000),
            connect_retry_interval: Duration::from_millis(500),
            piggyback_delay: Duration::from_millis(50),
            fast_retransmit: true,
        }
    }
}
