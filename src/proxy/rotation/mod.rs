//! Proxy selection
//!
//! A destination gets its proxy either from a fixed list (uniform random,
//! with replacement) or from a caller-supplied factory that sees the origin.

mod random;
mod round_robin;

pub use random::StaticProxies;
pub use round_robin::RoundRobinFactory;

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::models::{Origin, ProxyDescriptor, ProxyInput};

/// Picks the proxy for a destination
///
/// Called once per connection build. Any rotation state lives in the
/// implementation.
pub trait ProxyFactory: Send + Sync {
    fn proxy_for(&self, origin: &Origin) -> ProxyInput;
}

impl<F, T> ProxyFactory for F
where
    F: Fn(&Origin) -> T + Send + Sync,
    T: Into<ProxyInput>,
{
    fn proxy_for(&self, origin: &Origin) -> ProxyInput {
        self(origin).into()
    }
}

/// Where proxies come from
pub enum ProxySource {
    Static(StaticProxies),
    Factory(Arc<dyn ProxyFactory>),
}

impl ProxySource {
    /// Select and normalize the proxy for `origin`
    pub fn select(&self, origin: &Origin) -> Result<Arc<ProxyDescriptor>> {
        let proxy = match self {
            ProxySource::Static(list) => list.select()?,
            ProxySource::Factory(factory) => Arc::new(ProxyDescriptor::cast(factory.proxy_for(origin))?),
        };
        debug!(origin = %origin, proxy = %proxy, source = self.kind(), "Selected proxy");
        Ok(proxy)
    }

    /// Number of proxies, when known up front
    pub fn len_hint(&self) -> Option<usize> {
        match self {
            ProxySource::Static(list) => Some(list.len()),
            ProxySource::Factory(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProxySource::Static(_) => "static",
            ProxySource::Factory(_) => "factory",
        }
    }
}

impl std::fmt::Debug for ProxySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxySource::Static(list) => f.debug_tuple("Static").field(list).finish(),
            ProxySource::Factory(_) => f.write_str("Factory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::RotaError;
    use crate::models::{OriginScheme, ProxyScheme};

    fn origin(host: &str) -> Origin {
        Origin::new(OriginScheme::Https, host, 443)
    }

    #[test]
    fn test_factory_sees_origin() {
        let source = ProxySource::Factory(Arc::new(|origin: &Origin| {
            if origin.host.ends_with(".internal") {
                "socks5://10.0.0.1:1080".to_string()
            } else {
                "http://10.0.0.2:3128".to_string()
            }
        }));

        let internal = source.select(&origin("db.internal")).unwrap();
        assert_eq!(internal.scheme(), ProxyScheme::Socks5);

        let public = source.select(&origin("example.com")).unwrap();
        assert_eq!(public.scheme(), ProxyScheme::Http);
        assert_eq!(source.len_hint(), None);
        assert_eq!(source.kind(), "factory");
    }

    #[test]
    fn test_factory_called_once_per_select() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let source = ProxySource::Factory(Arc::new(move |_: &Origin| {
            counter.fetch_add(1, Ordering::SeqCst);
            "http://10.0.0.2:3128"
        }));

        for _ in 0..3 {
            source.select(&origin("example.com")).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_factory_output_is_validated() {
        let source = ProxySource::Factory(Arc::new(|_: &Origin| "ftp://10.0.0.2:21"));
        let err = source.select(&origin("example.com")).unwrap_err();
        assert!(matches!(err, RotaError::UnsupportedProtocol(_)));
    }

    #[test]
    fn test_static_source() {
        let list = StaticProxies::new(vec![ProxyDescriptor::cast("http://10.0.0.1:8080").unwrap()]).unwrap();
        let source = ProxySource::Static(list);

        assert_eq!(source.len_hint(), Some(1));
        assert_eq!(source.select(&origin("example.com")).unwrap().port(), 8080);
    }
}
