//! Integration tests for tun-interceptor
//!
//! Each test drives a running [`Interceptor`](tun_interceptor::Interceptor)
//! through an in-memory TUN device against loopback upstream servers.
//!
//! # Test Organization
//!
//! - `common`: Fake device, frame builders, upstream servers
//! - `tcp_flow`: Handshake, relay, segmentation and teardown of TCP flows
//! - `udp_flow`: UDP relay, connection limits and idle expiration
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test --test integration_tests
//!
//! # Run specific test module
//! cargo test --test integration_tests udp_flow
//! ```
//!
//! # Test Requirements
//!
//! - No TUN device or elevated privileges are needed
//! - Upstreams bind to 127.0.0.1 on ephemeral ports

pub mod common;
pub mod tcp_flow;
pub mod udp_flow;
