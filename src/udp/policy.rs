//! Admission and expiration policies for UDP virtual connections

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{LimitAction, UdpConfig};

/// Default idle time before a UDP connection expires
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between expiration sweeps
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Decision for a datagram that would open a new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny,
    /// Allow after evicting the least recently used connection
    AllowDropLru,
}

/// Decides whether a new connection may be opened
pub trait NewConnPolicy: Send + Sync + fmt::Debug {
    /// `current` is the number of open connections
    fn decide(&self, current: usize) -> Admission;
}

/// Decides when an idle connection is dropped
pub trait ConnExpirationPolicy: Send + Sync + fmt::Debug {
    fn is_expired(&self, now: Instant, last_used: Instant) -> bool;

    /// How often the manager sweeps for expired connections
    fn poll_frequency(&self) -> Duration;
}

/// Admit everything
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedConnections;

impl NewConnPolicy for UnlimitedConnections {
    fn decide(&self, _current: usize) -> Admission {
        Admission::Allow
    }
}

/// Cap the number of open connections
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimit {
    pub max: usize,
    pub on_limit: LimitAction,
}

impl ConnectionLimit {
    #[must_use]
    pub const fn new(max: usize, on_limit: LimitAction) -> Self {
        Self { max, on_limit }
    }
}

impl NewConnPolicy for ConnectionLimit {
    fn decide(&self, current: usize) -> Admission {
        if current < self.max {
            return Admission::Allow;
        }
        match self.on_limit {
            LimitAction::Deny => Admission::Deny,
            LimitAction::DropLru => Admission::AllowDropLru,
        }
    }
}

/// Expire connections unused for longer than `timeout`
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for IdleTimeout {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_IDLE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ConnExpirationPolicy for IdleTimeout {
    fn is_expired(&self, now: Instant, last_used: Instant) -> bool {
        now.saturating_duration_since(last_used) > self.timeout
    }

    fn poll_frequency(&self) -> Duration {
        self.poll_interval
    }
}

/// Admission policy described by `config`; zero means unlimited
#[must_use]
pub fn admission_from_config(config: &UdpConfig) -> Box<dyn NewConnPolicy> {
    if config.max_connections == 0 {
        Box::new(UnlimitedConnections)
    } else {
        Box::new(ConnectionLimit::new(config.max_connections, config.on_limit))
    }
}

/// Expiration policy described by `config`
#[must_use]
pub fn expiration_from_config(config: &UdpConfig) -> Box<dyn ConnExpirationPolicy> {
    Box::new(IdleTimeout {
        timeout: config.idle_timeout(),
        poll_interval: config.poll_interval(),
    })
}
