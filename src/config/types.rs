//! Configuration types for tun-interceptor
//!
//! Configuration is loaded from a JSON file and validated at startup. Every
//! section has defaults, so an empty object is a valid configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::flow::InterceptAddress;
use crate::packet::{IPV4_MIN_HEADER_LEN, TCP_MIN_HEADER_LEN};

/// Smallest MTU every IPv4 host must accept
pub const MIN_MTU: u16 = 576;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// TUN device settings
    #[serde(default)]
    pub tun: TunConfig,

    /// TCP termination settings
    #[serde(default)]
    pub tcp: TcpConfig,

    /// UDP connection management settings
    #[serde(default)]
    pub udp: UdpConfig,

    /// Upstream dialing settings
    #[serde(default)]
    pub dial: DialConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Services to intercept at startup
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tun.validate()?;
        self.tcp.validate()?;
        self.udp.validate()?;

        let mut ids = std::collections::HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !ids.insert(service.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate service id: {}",
                    service.id
                )));
            }
        }

        Ok(())
    }

    /// Create a default configuration with one example service
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            services: vec![ServiceConfig {
                id: "example".into(),
                name: "Example HTTP service".into(),
                intercept: vec![InterceptAddress::new(
                    crate::flow::Protocol::Tcp,
                    Ipv4Addr::new(100, 64, 1, 1),
                    80,
                )],
                upstream: SocketAddr::from(([127, 0, 0, 1], 8080)),
            }],
            ..Self::default()
        }
    }
}

/// TUN device configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunConfig {
    /// Interface name
    #[serde(default = "default_tun_name")]
    pub name: String,

    /// Local address assigned to the interface
    #[serde(default = "default_tun_address")]
    pub address: Ipv4Addr,

    /// Prefix length of the interface network
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// Interface MTU; bounds every emitted frame
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Number of pooled frame buffers used by the ingestion loop
    #[serde(default = "default_read_buffers")]
    pub read_buffers: usize,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            address: default_tun_address(),
            prefix_len: default_prefix_len(),
            mtu: default_mtu(),
            read_buffers: default_read_buffers(),
        }
    }
}

impl TunConfig {
    /// Validate TUN configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name.len() > 15 {
            return Err(ConfigError::ValidationError(format!(
                "TUN name '{}' must be 1-15 characters",
                self.name
            )));
        }
        if self.prefix_len > 32 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid prefix length: {}",
                self.prefix_len
            )));
        }
        if self.mtu < MIN_MTU {
            return Err(ConfigError::ValidationError(format!(
                "MTU {} is below the minimum of {MIN_MTU}",
                self.mtu
            )));
        }
        if self.read_buffers == 0 {
            return Err(ConfigError::ValidationError(
                "read_buffers must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// MSS offered to clients: MTU minus the IPv4 and TCP headers
    #[must_use]
    pub const fn mss(&self) -> u16 {
        self.mtu - (IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN) as u16
    }

    /// Interface netmask derived from the prefix length
    #[must_use]
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::MAX
            .checked_shl(32 - u32::from(self.prefix_len.min(32)))
            .unwrap_or(0);
        Ipv4Addr::from(bits)
    }
}

/// TCP termination configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpConfig {
    /// Inbound segment queue depth per flow
    #[serde(default = "default_tcp_queue_depth")]
    pub queue_depth: usize,

    /// Transmit buffers per flow
    #[serde(default = "default_tx_buffers")]
    pub tx_buffers: usize,

    /// How long a finished flow keeps processing segments to complete the
    /// close handshake, in milliseconds
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_tcp_queue_depth(),
            tx_buffers: default_tx_buffers(),
            linger_ms: default_linger_ms(),
        }
    }
}

impl TcpConfig {
    /// Validate TCP configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "tcp.queue_depth must be greater than 0".into(),
            ));
        }
        if self.tx_buffers == 0 {
            return Err(ConfigError::ValidationError(
                "tcp.tx_buffers must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Linger time as Duration
    #[must_use]
    pub const fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

/// What to do with a new UDP connection once the limit is reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitAction {
    /// Refuse the new connection
    #[default]
    Deny,
    /// Evict the least recently used connection first
    DropLru,
}

/// UDP connection management configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpConfig {
    /// Idle time after which a connection is expired, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Expiration sweep interval, in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Maximum concurrent connections (0 = unlimited)
    #[serde(default)]
    pub max_connections: usize,

    /// Action when `max_connections` is reached
    #[serde(default)]
    pub on_limit: LimitAction,

    /// Inbound datagram queue depth per connection
    #[serde(default = "default_udp_queue_depth")]
    pub queue_depth: usize,

    /// Transmit buffers shared by all UDP connections
    #[serde(default = "default_udp_tx_buffers")]
    pub tx_buffers: usize,

    /// Manager event queue depth
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            max_connections: 0,
            on_limit: LimitAction::default(),
            queue_depth: default_udp_queue_depth(),
            tx_buffers: default_udp_tx_buffers(),
            event_queue_depth: default_event_queue_depth(),
        }
    }
}

impl UdpConfig {
    /// Validate UDP configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "udp.idle_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "udp.poll_interval_secs must be greater than 0".into(),
            ));
        }
        if self.queue_depth == 0 || self.tx_buffers == 0 || self.event_queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "udp queue depths and tx_buffers must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Idle timeout as Duration
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Sweep interval as Duration
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Upstream dialing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DialConfig {
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl DialConfig {
    /// Connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

/// A service intercepted at startup
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Unique service id
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Intercept addresses, e.g. `"tcp:100.64.1.1:80"`
    pub intercept: Vec<InterceptAddress>,

    /// Upstream address dialed for every flow
    pub upstream: SocketAddr,
}

impl ServiceConfig {
    /// Validate service configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::ValidationError(
                "Service id cannot be empty".into(),
            ));
        }
        if self.intercept.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Service '{}' has no intercept addresses",
                self.id
            )));
        }
        Ok(())
    }
}

fn default_tun_name() -> String {
    "tun-icpt0".into()
}

const fn default_tun_address() -> Ipv4Addr {
    Ipv4Addr::new(100, 64, 0, 1)
}

const fn default_prefix_len() -> u8 {
    10
}

const fn default_mtu() -> u16 {
    1500
}

const fn default_read_buffers() -> usize {
    256
}

const fn default_tcp_queue_depth() -> usize {
    16
}

const fn default_tx_buffers() -> usize {
    4
}

const fn default_linger_ms() -> u64 {
    2000
}

const fn default_idle_timeout_secs() -> u64 {
    300
}

const fn default_poll_interval_secs() -> u64 {
    30
}

const fn default_udp_queue_depth() -> usize {
    64
}

const fn default_udp_tx_buffers() -> usize {
    16
}

const fn default_event_queue_depth() -> usize {
    1024
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

const fn default_true() -> bool {
    true
}
