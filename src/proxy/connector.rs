//! Builds the concrete connection for a proxy descriptor
//!
//! The scheme decides the route: `http` forwards, `https` tunnels with
//! CONNECT, `socks5` goes through a SOCKS handshake.

use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tracing::debug;

use super::connection::{Connection, ForwardDialer, HttpConnection, TunnelDialer};
use crate::error::{Result, RotaError};
use crate::models::{Origin, ProxyDescriptor, ProxyScheme};
use crate::tls::with_alpn;

/// Options shared by every connection a connector builds
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Base TLS config; ALPN is derived per use
    pub tls: Arc<ClientConfig>,
    pub http1: bool,
    pub http2: bool,
    pub keepalive_expiry: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

/// Turns a selected proxy into a connection for an origin
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, origin: &Origin, proxy: Arc<ProxyDescriptor>) -> Result<Arc<dyn Connection>>;
}

pub struct ProxyConnector {
    options: ConnectionOptions,
    /// Destination TLS advertising the enabled HTTP versions
    origin_tls: Arc<ClientConfig>,
    /// TLS to an https proxy when the descriptor carries none
    proxy_tls: Arc<ClientConfig>,
    /// Whether SOCKS5 support is compiled in
    socks: bool,
}

impl ProxyConnector {
    pub fn new(options: ConnectionOptions) -> Self {
        let origin_tls = with_alpn(&options.tls, options.http1, options.http2);
        let proxy_tls = with_alpn(&options.tls, true, false);
        Self {
            options,
            origin_tls,
            proxy_tls,
            socks: cfg!(feature = "socks"),
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    #[cfg(feature = "socks")]
    fn socks5(&self, origin: &Origin, proxy: Arc<ProxyDescriptor>) -> Result<Arc<dyn Connection>> {
        use super::connection::Socks5Dialer;

        let dialer = Socks5Dialer::new(
            proxy,
            origin.clone(),
            self.origin_tls.clone(),
            self.options.http1,
            self.options.http2,
        );
        Ok(Arc::new(self.wrap(dialer, origin)))
    }

    #[cfg(not(feature = "socks"))]
    fn socks5(&self, _origin: &Origin, _proxy: Arc<ProxyDescriptor>) -> Result<Arc<dyn Connection>> {
        Err(missing_socks())
    }

    fn wrap<D: super::connection::Dial>(&self, dialer: D, origin: &Origin) -> HttpConnection<D> {
        HttpConnection::new(
            dialer,
            origin.clone(),
            self.options.keepalive_expiry,
            self.options.connect_timeout,
        )
    }
}

impl Connector for ProxyConnector {
    fn connect(&self, origin: &Origin, proxy: Arc<ProxyDescriptor>) -> Result<Arc<dyn Connection>> {
        debug!(origin = %origin, proxy = %proxy, "Building connection");

        match proxy.scheme() {
            ProxyScheme::Http => Ok(Arc::new(self.wrap(ForwardDialer::new(proxy), origin))),
            ProxyScheme::Https => {
                let proxy_tls = match proxy.proxy_tls() {
                    Some(tls) => tls.clone(),
                    None => self.proxy_tls.clone(),
                };
                let dialer = TunnelDialer::new(
                    proxy,
                    origin.clone(),
                    proxy_tls,
                    self.origin_tls.clone(),
                    self.options.http1,
                    self.options.http2,
                );
                Ok(Arc::new(self.wrap(dialer, origin)))
            }
            ProxyScheme::Socks5 if !self.socks => Err(missing_socks()),
            ProxyScheme::Socks5 => self.socks5(origin, proxy),
            other => Err(RotaError::UnsupportedProtocol(format!(
                "Proxy protocol must be either 'http', 'https', or 'socks5', but got '{}'",
                other
            ))),
        }
    }
}

fn missing_socks() -> RotaError {
    RotaError::MissingDependency("SOCKS5 proxies need the `socks` feature".into())
}
