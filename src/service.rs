//! Services and intercept address resolution

use std::collections::HashMap;

use crate::error::{InterceptError, Result};
use crate::flow::InterceptAddress;
use crate::registry::ServiceId;

/// A service made reachable through the TUN device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
}

impl Service {
    pub fn new(id: impl Into<ServiceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Allocates the intercept addresses of a service
pub trait InterceptResolver: Send + Sync {
    /// Addresses on which `service` should be intercepted
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::Resolve` if no address can be allocated.
    fn intercept_addresses(&self, service: &Service) -> Result<Vec<InterceptAddress>>;
}

/// Resolver backed by a fixed table, normally built from configuration
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    addresses: HashMap<ServiceId, Vec<InterceptAddress>>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add addresses for a service
    pub fn insert(&mut self, service_id: ServiceId, addrs: impl IntoIterator<Item = InterceptAddress>) {
        self.addresses.entry(service_id).or_default().extend(addrs);
    }
}

impl InterceptResolver for StaticResolver {
    fn intercept_addresses(&self, service: &Service) -> Result<Vec<InterceptAddress>> {
        match self.addresses.get(&service.id) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
            _ => Err(InterceptError::resolve(
                service.name.clone(),
                "no intercept addresses configured",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver() {
        let mut resolver = StaticResolver::new();
        resolver.insert(
            "web".into(),
            ["tcp:10.0.0.1:80".parse().unwrap(), "udp:10.0.0.1:443".parse().unwrap()],
        );

        let addrs = resolver
            .intercept_addresses(&Service::new("web", "Web"))
            .unwrap();
        assert_eq!(addrs.len(), 2);

        let err = resolver
            .intercept_addresses(&Service::new("db", "Database"))
            .unwrap_err();
        assert!(matches!(err, InterceptError::Resolve { .. }));
    }
}
