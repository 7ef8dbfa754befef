//! TCP termination
//!
//! Client TCP flows are terminated in userspace:
//!
//! - [`TcpVirtualConnection`]: per-flow state machine and byte stream
//! - [`TcpFlowDispatcher`]: routes segments to flows and starts bridges
//! - [`TcpState`]: connection states

mod conn;
mod dispatcher;
mod state;

use std::time::Duration;

pub use conn::{ConnSnapshot, Received, TcpVirtualConnection, LOCAL_WINDOW_SCALE};
pub use dispatcher::{TcpDispatcherStats, TcpFlowDispatcher};
pub use state::TcpState;

use crate::config::Config;
use crate::packet::{IPV4_MIN_HEADER_LEN, TCP_MIN_HEADER_LEN};

/// Tunables shared by every TCP flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSettings {
    /// Device MTU; bounds segment size and transmit buffers
    pub mtu: u16,
    /// Inbound segments queued per flow
    pub queue_depth: usize,
    /// Transmit buffers per flow
    pub tx_buffers: usize,
    /// Upper bound on the close handshake after the relay ends
    pub linger: Duration,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            mtu: 1500,
            queue_depth: 16,
            tx_buffers: 4,
            linger: Duration::from_secs(2),
        }
    }
}

impl TcpSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            mtu: config.tun.mtu,
            queue_depth: config.tcp.queue_depth,
            tx_buffers: config.tcp.tx_buffers,
            linger: config.tcp.linger(),
        }
    }

    /// Largest payload per segment
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn mss(&self) -> u16 {
        self.mtu
            .saturating_sub((IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN) as u16)
    }
}
