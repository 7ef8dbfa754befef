//! Intercept address to service mapping
//!
//! Each transport layer owns its own [`ServiceRegistry`]: the TCP dispatcher
//! and the UDP manager are handed separate instances by the interceptor, so
//! either can be exercised on its own in tests.

use std::net::SocketAddrV4;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::flow::Protocol;

/// Identifier of an upstream service
pub type ServiceId = Arc<str>;

/// Concurrent map of intercept addresses to service ids for one protocol.
///
/// Lookups happen on the first packet of every flow; registration happens on
/// `intercept` / `stop_intercepting`.
#[derive(Debug)]
pub struct ServiceRegistry {
    protocol: Protocol,
    by_addr: DashMap<SocketAddrV4, ServiceId>,
    by_service: DashMap<ServiceId, Vec<SocketAddrV4>>,
}

impl ServiceRegistry {
    /// Create an empty registry for `protocol`
    #[must_use]
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            by_addr: DashMap::new(),
            by_service: DashMap::new(),
        }
    }

    /// Protocol served by this registry
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Map `addr` to `service_id`, replacing any previous owner of the address
    pub fn register(&self, service_id: &ServiceId, addr: SocketAddrV4) {
        if let Some(previous) = self.by_addr.insert(addr, Arc::clone(service_id)) {
            if previous != *service_id {
                if let Some(mut addrs) = self.by_service.get_mut(&previous) {
                    addrs.retain(|a| *a != addr);
                }
            }
        }
        let mut addrs = self.by_service.entry(Arc::clone(service_id)).or_default();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
        debug!(protocol = %self.protocol, service = %service_id, %addr, "Registered intercept address");
    }

    /// Remove every address of `service_id`, returning them
    pub fn unregister(&self, service_id: &str) -> Vec<SocketAddrV4> {
        let addrs = self
            .by_service
            .remove(service_id)
            .map(|(_, addrs)| addrs)
            .unwrap_or_default();
        for addr in &addrs {
            self.by_addr.remove_if(addr, |_, owner| &**owner == service_id);
        }
        if !addrs.is_empty() {
            debug!(protocol = %self.protocol, service = %service_id, count = addrs.len(), "Unregistered intercept addresses");
        }
        addrs
    }

    /// Service registered for `addr`, if any
    #[must_use]
    pub fn lookup(&self, addr: &SocketAddrV4) -> Option<ServiceId> {
        self.by_addr.get(addr).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered addresses
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}
