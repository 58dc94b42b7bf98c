//! Rotating transport
//!
//! The entry point: takes a proxy list or factory plus options, and serves
//! requests through a pool of rotating proxy connections.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, Uri};
use tracing::{info, instrument};

use crate::error::{Result, RotaError};
use crate::models::{Origin, ProxyDescriptor, ProxyInput};
use crate::pool::{Limits, PoolManager, RotatingPool};
use crate::proxy::connection::{read_body, Body, ResponseBody};
use crate::proxy::connector::{ConnectionOptions, Connector, ProxyConnector};
use crate::proxy::rotation::{ProxyFactory, ProxySource, StaticProxies};
use crate::tls::TlsOptions;

/// The proxies a transport rotates through
pub enum Proxies {
    /// Fixed list, sampled uniformly per connection build
    List(Vec<ProxyInput>),
    /// Called with the destination on every connection build
    Factory(Arc<dyn ProxyFactory>),
}

impl Proxies {
    pub fn list<I, T>(proxies: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ProxyInput>,
    {
        Proxies::List(proxies.into_iter().map(Into::into).collect())
    }

    pub fn factory<F, T>(factory: F) -> Self
    where
        F: Fn(&Origin) -> T + Send + Sync + 'static,
        T: Into<ProxyInput>,
    {
        Proxies::Factory(Arc::new(factory))
    }
}

/// Transport options
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Select a new proxy before every request
    pub always_update: bool,
    pub tls: TlsOptions,
    pub http1: bool,
    pub http2: bool,
    pub limits: Limits,
    /// Extra attempts, each through a newly selected proxy, after a connect
    /// failure
    pub retries: u32,
    pub connect_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            always_update: false,
            tls: TlsOptions::default(),
            http1: true,
            http2: false,
            limits: Limits::default(),
            retries: 0,
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl TransportConfig {
    pub fn with_always_update(mut self, always_update: bool) -> Self {
        self.always_update = always_update;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_http1(mut self, enabled: bool) -> Self {
        self.http1 = enabled;
        self
    }

    pub fn with_http2(mut self, enabled: bool) -> Self {
        self.http2 = enabled;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.http1 && !self.http2 {
            return Err(RotaError::InvalidConfig(
                "at least one of http1 and http2 must be enabled".into(),
            ));
        }
        if self.limits.max_connections == Some(0) {
            return Err(RotaError::InvalidConfig(
                "max_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Serves requests through rotating upstream proxies
pub struct RotatingTransport {
    pool: PoolManager,
}

impl RotatingTransport {
    /// Build a transport. A static list is validated here; factory output is
    /// validated on each connection build.
    pub fn new(proxies: Proxies, config: TransportConfig) -> Result<Self> {
        let source = match proxies {
            Proxies::List(inputs) => {
                let descriptors = inputs
                    .into_iter()
                    .map(ProxyDescriptor::cast)
                    .collect::<Result<Vec<_>>>()?;
                ProxySource::Static(StaticProxies::new(descriptors)?)
            }
            Proxies::Factory(factory) => ProxySource::Factory(factory),
        };
        Self::from_source(source, config)
    }

    /// Build from a prepared source, e.g. a list with a seeded RNG
    pub fn from_source(source: ProxySource, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let tls = config.tls.build_client_config()?;
        let connector = ProxyConnector::new(ConnectionOptions {
            tls: Arc::new(tls),
            http1: config.http1,
            http2: config.http2,
            keepalive_expiry: config.limits.keepalive_expiry,
            connect_timeout: config.connect_timeout,
        });
        Self::with_connector(source, Arc::new(connector), config)
    }

    /// Build with a custom connector
    pub fn with_connector(
        source: ProxySource,
        connector: Arc<dyn Connector>,
        config: TransportConfig,
    ) -> Result<Self> {
        config.validate()?;
        if let ProxySource::Static(list) = &source {
            for proxy in list.proxies() {
                check_supported(proxy)?;
            }
        }

        info!(
            source = source.kind(),
            proxies = ?source.len_hint(),
            retries = config.retries,
            always_update = config.always_update,
            "Rotating transport ready"
        );

        let pool = RotatingPool::new(
            Arc::new(source),
            connector,
            config.retries,
            config.always_update,
        )
        .into_manager(config.limits);

        Ok(Self { pool })
    }

    /// Send a request; the response body streams from the connection
    pub async fn handle_request(&self, request: Request<Body>) -> Result<Response<ResponseBody>> {
        self.pool.handle_request(request).await
    }

    /// Send a request and read the whole response
    #[instrument(skip(self, headers, body))]
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Result<Response<Bytes>> {
        let uri: Uri = url
            .parse()
            .map_err(|e| RotaError::InvalidRequest(format!("Invalid URL '{}': {}", url, e)))?;

        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body.into()))?;
        *request.headers_mut() = headers;

        let response = self.handle_request(request).await?;
        read_body(response).await
    }

    pub async fn get(&self, url: &str) -> Result<Response<Bytes>> {
        self.request(Method::GET, url, HeaderMap::new(), Bytes::new()).await
    }

    /// Close all pooled connections
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }
}

fn check_supported(proxy: &ProxyDescriptor) -> Result<()> {
    if !proxy.scheme().is_supported() {
        return Err(RotaError::UnsupportedProtocol(format!(
            "Proxy protocol must be either 'http', 'https', or 'socks5', but got '{}'",
            proxy.scheme()
        )));
    }
    Ok(())
}
