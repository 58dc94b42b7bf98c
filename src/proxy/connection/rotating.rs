//! Connection that swaps its underlying proxy connection
//!
//! Wraps one concrete connection at a time. On a connect failure it selects
//! a fresh proxy and retries, up to the configured retry budget; with
//! `always_update` it reselects before every request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hyper::{Request, Response};
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use super::{rebuild_request, Body, Connection, ResponseBody};
use crate::error::{Result, RotaError};
use crate::models::Origin;
use crate::proxy::connector::Connector;
use crate::proxy::rotation::ProxySource;

pub struct RotatingConnection {
    origin: Origin,
    source: Arc<ProxySource>,
    connector: Arc<dyn Connector>,
    retries: u32,
    always_update: bool,
    active: RwLock<Arc<dyn Connection>>,
    closed: AtomicBool,
}

impl RotatingConnection {
    /// Select a proxy and build the first underlying connection
    pub fn new(
        origin: Origin,
        source: Arc<ProxySource>,
        connector: Arc<dyn Connector>,
        retries: u32,
        always_update: bool,
    ) -> Result<Self> {
        let active = Self::build(&origin, &source, connector.as_ref())?;
        Ok(Self {
            origin,
            source,
            connector,
            retries,
            always_update,
            active: RwLock::new(active),
            closed: AtomicBool::new(false),
        })
    }

    fn build(
        origin: &Origin,
        source: &ProxySource,
        connector: &dyn Connector,
    ) -> Result<Arc<dyn Connection>> {
        let proxy = source.select(origin)?;
        connector.connect(origin, proxy)
    }

    fn active(&self) -> Arc<dyn Connection> {
        self.active.read().clone()
    }

    /// Replace the underlying connection with one through a newly selected
    /// proxy. The previous connection is closed.
    #[instrument(skip(self), fields(origin = %self.origin))]
    pub async fn update(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RotaError::ConnectionNotAvailable);
        }

        let next = Self::build(&self.origin, &self.source, self.connector.as_ref())?;
        let previous = std::mem::replace(&mut *self.active.write(), next);
        debug!(previous = %previous.info(), "Rotated proxy connection");
        previous.close().await;
        Ok(())
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

#[async_trait]
impl Connection for RotatingConnection {
    #[instrument(skip(self, request), fields(origin = %self.origin, uri = %request.uri()))]
    async fn handle_request(&self, request: Request<Body>) -> Result<Response<ResponseBody>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RotaError::ConnectionNotAvailable);
        }

        let (parts, body) = request.into_parts();

        if self.always_update {
            self.update().await?;
        }

        let mut retries_left = self.retries;
        loop {
            let connection = self.active();
            let request = rebuild_request(&parts, body.clone())?;

            match connection.handle_request(request).await {
                Err(e) if e.is_connect_failure() && retries_left > 0 => {
                    retries_left -= 1;
                    warn!(
                        connection = %connection.info(),
                        error = %e,
                        retries_left,
                        "Connect through proxy failed, rotating"
                    );
                    self.update().await?;
                }
                result => return result,
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.active().close().await;
    }

    fn info(&self) -> String {
        self.active().info()
    }

    fn can_handle_request(&self, origin: &Origin) -> bool {
        self.active().can_handle_request(origin)
    }

    fn is_available(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.active().is_available()
    }

    fn has_expired(&self) -> bool {
        self.active().has_expired()
    }

    fn is_idle(&self) -> bool {
        self.active().is_idle()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.active().is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use http_body_util::Full;
    use parking_lot::Mutex;

    use crate::models::{OriginScheme, ProxyDescriptor};
    use crate::proxy::rotation::StaticProxies;

    /// What a mock connection does with its first request
    #[derive(Clone, Copy)]
    enum Outcome {
        Ok,
        ConnectFail,
        ProxyReject,
    }

    struct MockConnection {
        proxy: Arc<ProxyDescriptor>,
        origin: Origin,
        outcome: Outcome,
        requests: AtomicUsize,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn handle_request(&self, request: Request<Body>) -> Result<Response<ResponseBody>> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.headers()["x-trace"], "1");
            match self.outcome {
                Outcome::Ok => Ok(Response::new(ResponseBody::full(self.proxy.authority()))),
                Outcome::ConnectFail => Err(RotaError::ProxyConnectionFailed("refused".into())),
                Outcome::ProxyReject => Err(RotaError::ProxyError("407".into())),
            }
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn info(&self) -> String {
            format!("mock via {}", self.proxy)
        }

        fn can_handle_request(&self, origin: &Origin) -> bool {
            *origin == self.origin
        }

        fn is_available(&self) -> bool {
            !self.is_closed()
        }

        fn has_expired(&self) -> bool {
            false
        }

        fn is_idle(&self) -> bool {
            true
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    /// Hands out mock connections with scripted outcomes
    #[derive(Default)]
    struct MockConnector {
        outcomes: Mutex<VecDeque<Outcome>>,
        built: Mutex<Vec<Arc<MockConnection>>>,
    }

    impl MockConnector {
        fn scripted(outcomes: &[Outcome]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                built: Mutex::new(Vec::new()),
            })
        }

        fn builds(&self) -> usize {
            self.built.lock().len()
        }

        fn connection(&self, idx: usize) -> Arc<MockConnection> {
            self.built.lock()[idx].clone()
        }
    }

    impl Connector for MockConnector {
        fn connect(&self, origin: &Origin, proxy: Arc<ProxyDescriptor>) -> Result<Arc<dyn Connection>> {
            let outcome = self.outcomes.lock().pop_front().unwrap_or(Outcome::Ok);
            let conn = Arc::new(MockConnection {
                proxy,
                origin: origin.clone(),
                outcome,
                requests: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            });
            self.built.lock().push(conn.clone());
            Ok(conn)
        }
    }

    fn origin() -> Origin {
        Origin::new(OriginScheme::Http, "example.com", 80)
    }

    fn request() -> Request<Body> {
        Request::builder()
            .uri("http://example.com/")
            .header("x-trace", "1")
            .body(Full::new(Bytes::from("payload")))
            .unwrap()
    }

    fn static_source() -> Arc<ProxySource> {
        let proxies = vec![
            ProxyDescriptor::cast("http://10.0.0.1:8080").unwrap(),
            ProxyDescriptor::cast("http://10.0.0.2:8080").unwrap(),
        ];
        Arc::new(ProxySource::Static(StaticProxies::new(proxies).unwrap()))
    }

    fn rotating(
        connector: Arc<MockConnector>,
        retries: u32,
        always_update: bool,
    ) -> RotatingConnection {
        RotatingConnection::new(origin(), static_source(), connector, retries, always_update).unwrap()
    }

    #[tokio::test]
    async fn test_no_retry_budget_surfaces_connect_failure() {
        let connector = MockConnector::scripted(&[Outcome::ConnectFail]);
        let conn = rotating(connector.clone(), 0, false);

        let err = conn.handle_request(request()).await.unwrap_err();
        assert!(err.is_connect_failure());
        assert_eq!(connector.builds(), 1);
    }

    #[tokio::test]
    async fn test_retry_rotates_to_working_proxy() {
        let connector = MockConnector::scripted(&[Outcome::ConnectFail, Outcome::ConnectFail, Outcome::Ok]);
        let conn = rotating(connector.clone(), 2, false);

        let response = conn.handle_request(request()).await.unwrap();
        assert_eq!(response.status(), 200);

        // Initial build plus one per retry.
        assert_eq!(connector.builds(), 3);
        // Each replaced connection was closed.
        assert!(connector.connection(0).is_closed());
        assert!(connector.connection(1).is_closed());
        assert!(!connector.connection(2).is_closed());
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let connector = MockConnector::scripted(&[Outcome::ConnectFail; 5]);
        let conn = rotating(connector.clone(), 2, false);

        let err = conn.handle_request(request()).await.unwrap_err();
        assert!(matches!(err, RotaError::ProxyConnectionFailed(_)));
        // One attempt plus two retries, never more.
        assert_eq!(connector.builds(), 3);
    }

    #[tokio::test]
    async fn test_proxy_rejection_not_retried() {
        let connector = MockConnector::scripted(&[Outcome::ProxyReject, Outcome::Ok]);
        let conn = rotating(connector.clone(), 3, false);

        let err = conn.handle_request(request()).await.unwrap_err();
        assert!(matches!(err, RotaError::ProxyError(_)));
        assert_eq!(connector.builds(), 1);
    }

    #[tokio::test]
    async fn test_always_update_selects_before_every_request() {
        let connector = MockConnector::scripted(&[]);
        let conn = rotating(connector.clone(), 0, true);
        assert_eq!(connector.builds(), 1);

        for i in 0..3 {
            conn.handle_request(request()).await.unwrap();
            assert_eq!(connector.builds(), i + 2);
        }

        // Only the newest connection is still open, and each served one request.
        for idx in 0..3 {
            assert!(connector.connection(idx).is_closed());
        }
        for idx in 1..4 {
            assert_eq!(connector.connection(idx).requests.load(Ordering::SeqCst), 1);
        }
        assert!(!connector.connection(3).is_closed());
    }

    #[tokio::test]
    async fn test_sticky_without_always_update() {
        let connector = MockConnector::scripted(&[]);
        let conn = rotating(connector.clone(), 0, false);

        for _ in 0..3 {
            conn.handle_request(request()).await.unwrap();
        }
        assert_eq!(connector.builds(), 1);
        assert_eq!(connector.connection(0).requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_update_closes_previous() {
        let connector = MockConnector::scripted(&[]);
        let conn = rotating(connector.clone(), 0, false);

        conn.update().await.unwrap();
        assert_eq!(connector.builds(), 2);
        assert!(connector.connection(0).is_closed());
        assert!(conn.info().starts_with("mock via"));
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let connector = MockConnector::scripted(&[]);
        let conn = rotating(connector.clone(), 0, false);

        conn.close().await;
        assert!(conn.is_closed());
        assert!(!conn.is_available());

        let err = conn.handle_request(request()).await.unwrap_err();
        assert!(matches!(err, RotaError::ConnectionNotAvailable));
        assert!(conn.update().await.is_err());
    }

    #[tokio::test]
    async fn test_factory_invoked_once_per_build() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let source = Arc::new(ProxySource::Factory(Arc::new(move |_: &Origin| {
            counter.fetch_add(1, Ordering::SeqCst);
            "http://10.0.0.9:3128"
        })));
        let connector = MockConnector::scripted(&[Outcome::ConnectFail, Outcome::Ok]);

        let conn = RotatingConnection::new(origin(), source, connector.clone(), 1, false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        conn.handle_request(request()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(connector.builds(), 2);
    }
}
