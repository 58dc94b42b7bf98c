//! Round-robin proxy factory

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use super::ProxyFactory;
use crate::error::{Result, RotaError};
use crate::models::{Origin, ProxyDescriptor, ProxyInput};

/// Cycles through a proxy list, keeping a separate cursor per origin
///
/// Uses atomic operations for lock-free index tracking. A cursor is kept
/// for every origin seen until it is dropped with [`forget`](Self::forget),
/// so callers reaching an unbounded set of hosts should forget the ones
/// they are done with.
pub struct RoundRobinFactory {
    proxies: Vec<ProxyDescriptor>,
    cursors: DashMap<Origin, AtomicUsize>,
}

impl RoundRobinFactory {
    pub fn new(proxies: Vec<ProxyDescriptor>) -> Result<Self> {
        if proxies.is_empty() {
            return Err(RotaError::NoProxiesAvailable);
        }

        Ok(Self {
            proxies,
            cursors: DashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Drop the cursor for an origin; its next proxy is the first in the list
    pub fn forget(&self, origin: &Origin) {
        self.cursors.remove(origin);
    }

    /// Number of origins with a live cursor
    pub fn tracked_origins(&self) -> usize {
        self.cursors.len()
    }
}

impl ProxyFactory for RoundRobinFactory {
    fn proxy_for(&self, origin: &Origin) -> ProxyInput {
        let len = self.proxies.len();
        // Atomically increment and get the previous value, then wrap around
        let idx = self
            .cursors
            .entry(origin.clone())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
            % len;

        ProxyInput::Descriptor(self.proxies[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OriginScheme;

    fn factory() -> RoundRobinFactory {
        RoundRobinFactory::new(vec![
            ProxyDescriptor::cast("http://127.0.0.1:8081").unwrap(),
            ProxyDescriptor::cast("http://127.0.0.1:8082").unwrap(),
            ProxyDescriptor::cast("http://127.0.0.1:8083").unwrap(),
        ])
        .unwrap()
    }

    fn port(input: ProxyInput) -> u16 {
        ProxyDescriptor::cast(input).unwrap().port()
    }

    #[test]
    fn test_round_robin_empty() {
        let result = RoundRobinFactory::new(Vec::new());
        assert!(matches!(result, Err(RotaError::NoProxiesAvailable)));
    }

    #[test]
    fn test_round_robin_order() {
        let factory = factory();
        let origin = Origin::new(OriginScheme::Https, "example.com", 443);

        // Should cycle through 8081, 8082, 8083, 8081...
        let ports: Vec<u16> = (0..6).map(|_| port(factory.proxy_for(&origin))).collect();
        assert_eq!(ports, vec![8081, 8082, 8083, 8081, 8082, 8083]);
    }

    #[test]
    fn test_round_robin_cursor_per_origin() {
        let factory = factory();
        let a = Origin::new(OriginScheme::Https, "a.example", 443);
        let b = Origin::new(OriginScheme::Https, "b.example", 443);

        assert_eq!(port(factory.proxy_for(&a)), 8081);
        assert_eq!(port(factory.proxy_for(&a)), 8082);
        assert_eq!(port(factory.proxy_for(&b)), 8081);
        assert_eq!(port(factory.proxy_for(&a)), 8083);
    }

    #[test]
    fn test_round_robin_forget() {
        let factory = factory();
        let a = Origin::new(OriginScheme::Https, "a.example", 443);
        let b = Origin::new(OriginScheme::Http, "b.example", 80);

        factory.proxy_for(&a);
        factory.proxy_for(&a);
        factory.proxy_for(&b);
        assert_eq!(factory.tracked_origins(), 2);

        factory.forget(&a);
        assert_eq!(factory.tracked_origins(), 1);
        assert_eq!(port(factory.proxy_for(&a)), 8081);

        // Forgetting an unknown origin is a no-op.
        factory.forget(&Origin::new(OriginScheme::Http, "c.example", 80));
        assert_eq!(factory.tracked_origins(), 2);
    }
}
