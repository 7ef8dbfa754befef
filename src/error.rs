//! Error types for tun-interceptor
//!
//! Every failure in the packet path is scoped to one packet or one flow. The
//! ingestion loop logs the error and keeps reading; only configuration and
//! lifecycle errors reach the caller of `Interceptor`.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use thiserror::Error;

use crate::flow::Protocol;
use crate::packet::PacketError;
use crate::tcp::TcpState;

/// Top-level error type for tun-interceptor
#[derive(Debug, Error)]
pub enum InterceptError {
    /// Malformed or unsupported L3/L4 header
    #[error("Decode error: {0}")]
    Decode(#[from] PacketError),

    /// No service registered for the destination of a packet
    #[error("No {protocol} service registered for {intercept}")]
    NoServiceRegistered {
        intercept: SocketAddrV4,
        protocol: Protocol,
    },

    /// Dialing the upstream service for a new flow failed
    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    /// UDP admission policy refused a new connection
    #[error("Connection limit exceeded ({current} active)")]
    ConnectionLimitExceeded { current: usize },

    /// Write attempted in a TCP state that forbids it
    #[error("Invalid connection state for write: {state}")]
    InvalidConnectionState { state: TcpState },

    /// Raw sink accepted fewer bytes than the frame length
    #[error("Short write to device: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// Route installation or removal failed
    #[error("Route error for {prefix}: {reason}")]
    Route { prefix: String, reason: String },

    /// Intercept address resolution failed
    #[error("Failed to resolve intercept addresses for {service}: {reason}")]
    Resolve { service: String, reason: String },

    /// `start` called twice
    #[error("Interceptor already started")]
    AlreadyStarted,

    /// Operation requires a running interceptor
    #[error("Interceptor not started")]
    NotStarted,

    /// Connection or manager was shut down
    #[error("Connection closed")]
    Closed,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl InterceptError {
    /// Create a route error
    pub fn route(prefix: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Route {
            prefix: prefix.into(),
            reason: reason.into(),
        }
    }

    /// Create a resolve error
    pub fn resolve(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolve {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error only affects a single packet or flow
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Decode(_)
            | Self::NoServiceRegistered { .. }
            | Self::ConnectionLimitExceeded { .. }
            | Self::InvalidConnectionState { .. }
            | Self::ShortWrite { .. }
            | Self::Closed => true,
            Self::Dial(e) => e.is_recoverable(),
            Self::Route { .. }
            | Self::Resolve { .. }
            | Self::AlreadyStarted
            | Self::NotStarted
            | Self::Config(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Errors returned by a [`Dialer`](crate::dial::Dialer)
#[derive(Debug, Error)]
pub enum DialError {
    /// Dialer has no upstream for the service
    #[error("Unknown service: {service}")]
    UnknownService { service: String },

    /// Connection failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },

    /// Connection timeout
    #[error("Connection to {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: SocketAddr, timeout_ms: u64 },

    /// I/O error
    #[error("Dial I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DialError {
    /// Create an unknown service error
    pub fn unknown_service(service: impl Into<String>) -> Self {
        Self::UnknownService {
            service: service.into(),
        }
    }

    /// Create a connection failed error
    pub fn connect_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::UnknownService { .. } => false,
            Self::ConnectFailed { .. } | Self::Timeout { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Result alias for interceptor operations
pub type Result<T> = std::result::Result<T, InterceptError>;
