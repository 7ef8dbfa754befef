//! Routing table access
//!
//! Intercepting a service installs a route sending its intercept prefix into
//! the TUN device. The interceptor only sees the [`RoutingTable`] trait; the
//! binary plugs in [`IpRouteTable`], tests use [`NoopRoutes`].

use std::net::Ipv4Addr;
use std::process::Command;

use ipnet::Ipv4Net;
use tracing::{debug, info};

use crate::error::{InterceptError, Result};

/// Add/remove routes towards the TUN device
pub trait RoutingTable: Send + Sync {
    /// Route `peer` via `if_name`, sourced from `local`
    fn add_route(&self, local: Ipv4Addr, peer: Ipv4Net, if_name: &str) -> Result<()>;

    /// Reverse of [`add_route`](Self::add_route)
    fn remove_route(&self, local: Ipv4Addr, peer: Ipv4Net, if_name: &str) -> Result<()>;
}

/// Routing table that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRoutes;

impl RoutingTable for NoopRoutes {
    fn add_route(&self, local: Ipv4Addr, peer: Ipv4Net, if_name: &str) -> Result<()> {
        debug!(%local, %peer, if_name, "Skipping route install");
        Ok(())
    }

    fn remove_route(&self, local: Ipv4Addr, peer: Ipv4Net, if_name: &str) -> Result<()> {
        debug!(%local, %peer, if_name, "Skipping route removal");
        Ok(())
    }
}

/// Linux routing table driven through the `ip route` command
#[derive(Debug, Clone)]
pub struct IpRouteTable {
    program: String,
}

impl Default for IpRouteTable {
    fn default() -> Self {
        Self {
            program: "ip".to_string(),
        }
    }
}

impl IpRouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different executable instead of `ip`
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(verb: &str, local: Ipv4Addr, peer: Ipv4Net, if_name: &str) -> Vec<String> {
        vec![
            "route".to_string(),
            verb.to_string(),
            peer.to_string(),
            "dev".to_string(),
            if_name.to_string(),
            "src".to_string(),
            local.to_string(),
        ]
    }

    fn run(&self, args: &[String], peer: Ipv4Net) -> Result<()> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| InterceptError::route(peer.to_string(), e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(InterceptError::route(
                peer.to_string(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

impl RoutingTable for IpRouteTable {
    fn add_route(&self, local: Ipv4Addr, peer: Ipv4Net, if_name: &str) -> Result<()> {
        // `replace` is idempotent when the route already exists
        self.run(&Self::args("replace", local, peer, if_name), peer)?;
        info!(%peer, if_name, "Route installed");
        Ok(())
    }

    fn remove_route(&self, local: Ipv4Addr, peer: Ipv4Net, if_name: &str) -> Result<()> {
        self.run(&Self::args("del", local, peer, if_name), peer)?;
        info!(%peer, if_name, "Route removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_route_args() {
        let args = IpRouteTable::args(
            "replace",
            Ipv4Addr::new(100, 64, 0, 1),
            "10.0.0.1/32".parse().unwrap(),
            "tun0",
        );
        assert_eq!(
            args.join(" "),
            "route replace 10.0.0.1/32 dev tun0 src 100.64.0.1"
        );
    }

    #[test]
    fn test_missing_program_is_route_error() {
        let table = IpRouteTable::with_program("/nonexistent/ip-binary");
        let err = table
            .add_route(
                Ipv4Addr::new(100, 64, 0, 1),
                "10.0.0.1/32".parse().unwrap(),
                "tun0",
            )
            .unwrap_err();
        assert!(matches!(err, InterceptError::Route { .. }));
    }

    #[test]
    fn test_noop_routes() {
        let routes = NoopRoutes;
        let peer: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        assert!(routes.add_route(Ipv4Addr::LOCALHOST, peer, "tun0").is_ok());
        assert!(routes.remove_route(Ipv4Addr::LOCALHOST, peer, "tun0").is_ok());
    }
}
