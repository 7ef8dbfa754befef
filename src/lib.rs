//! tun-interceptor: userspace TCP/UDP interception on a TUN device
//!
//! Services are given intercept addresses routed into a TUN device. Client
//! traffic to those addresses is terminated here, in userspace, and relayed
//! to a dialed upstream stream.
//!
//! # Architecture
//!
//! ```text
//! Client ──► TUN ──► ingestion loop ──┬── TCP ──► TcpVirtualConnection ──┐
//!                                     └── UDP ──► UdpVirtualConnection ──┴── relay ──► Dialer ──► Upstream
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tun_interceptor::config::load_config;
//! use tun_interceptor::{DirectDialer, Interceptor, NoopRoutes, Service, StaticResolver};
//!
//! # async fn example(device: tokio::io::DuplexStream) -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tun-interceptor/config.json")?;
//!
//! let mut dialer = DirectDialer::new();
//! dialer.add_upstream("web".into(), "127.0.0.1:8080".parse()?);
//!
//! let mut resolver = StaticResolver::new();
//! resolver.insert("web".into(), ["tcp:100.64.1.1:80".parse()?]);
//!
//! let interceptor = Interceptor::new(config, Arc::new(dialer), Arc::new(NoopRoutes));
//! interceptor.intercept(&Service::new("web", "Web"), &resolver)?;
//! interceptor.start(device)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`packet`]: IPv4/TCP/UDP header codec
//! - [`io`]: Buffer pool and relay
//! - [`tcp`]: Userspace TCP termination
//! - [`udp`]: UDP virtual connections and their manager
//! - [`interceptor`]: Ingestion loop and service interception

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod device;
pub mod dial;
pub mod error;
pub mod flow;
pub mod interceptor;
pub mod io;
pub mod packet;
pub mod registry;
pub mod route;
pub mod service;
pub mod tcp;
pub mod udp;

#[cfg(test)]
mod testutil;

// Re-export commonly used types at the crate root
pub use config::{Config, TunConfig};
pub use device::{DeviceWriter, FrameSink};
pub use dial::{BoxedStream, ClientInfo, Dialer, DirectDialer};
pub use error::{ConfigError, DialError, InterceptError};
pub use flow::{FlowKey, InterceptAddress, Protocol};
pub use interceptor::{Interceptor, InterceptorStatsSnapshot};
pub use packet::PacketError;
pub use registry::{ServiceId, ServiceRegistry};
pub use route::{IpRouteTable, NoopRoutes, RoutingTable};
pub use service::{InterceptResolver, Service, StaticResolver};
pub use tcp::{TcpFlowDispatcher, TcpState, TcpVirtualConnection};
pub use udp::{UdpManager, UdpManagerHandle, UdpVirtualConnection};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
