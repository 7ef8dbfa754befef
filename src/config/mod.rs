//! Configuration module for tun-interceptor
//!
//! # Example
//!
//! ```no_run
//! use tun_interceptor::config::load_config;
//!
//! let config = load_config("/etc/tun-interceptor/config.json").unwrap();
//! println!("TUN device: {} (mtu {})", config.tun.name, config.tun.mtu);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, DialConfig, LimitAction, LogConfig, ServiceConfig, TcpConfig, TunConfig, UdpConfig,
    MIN_MTU,
};
