//! Lazily-dialed HTTP/1.1 and HTTP/2 connection
//!
//! The route to the destination is supplied by a [`Dial`] implementation;
//! this module owns the hyper client handshake, request accounting and the
//! keepalive bookkeeping the pool relies on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use super::{Body, Connection, ReleaseGuard, ResponseBody};
use crate::error::{Result, RotaError};
use crate::models::{Origin, ProxyDescriptor};
use crate::proxy::dial::{with_connect_timeout, BoxedStream};

/// A stream to the destination, ready for HTTP
pub struct Dialed {
    pub stream: BoxedStream,
    /// Speak HTTP/2 on this stream
    pub http2: bool,
}

/// How a connection reaches its destination
#[async_trait]
pub trait Dial: Send + Sync + 'static {
    /// Establish the byte stream, including any proxy handshake
    async fn dial(&self) -> Result<Dialed>;

    /// Rewrite an outgoing request for this route
    fn prepare(&self, request: &mut Request<Body>, origin: &Origin, http2: bool) {
        origin_form(request, origin, http2);
    }

    /// Whether requests may be multiplexed before the first dial completes
    fn may_multiplex(&self) -> bool {
        false
    }

    fn proxy(&self) -> &ProxyDescriptor;
}

enum Sender {
    Http1(http1::SendRequest<Body>),
    Http2(http2::SendRequest<Body>),
}

impl Sender {
    /// Wait for capacity, then hand back the in-flight response future
    async fn dispatch(
        &mut self,
        request: Request<Body>,
    ) -> Result<BoxFuture<'static, hyper::Result<Response<Incoming>>>> {
        match self {
            Sender::Http1(sender) => {
                sender
                    .ready()
                    .await
                    .map_err(|_| RotaError::ConnectionNotAvailable)?;
                Ok(Box::pin(sender.send_request(request)))
            }
            Sender::Http2(sender) => {
                let mut sender = sender.clone();
                sender
                    .ready()
                    .await
                    .map_err(|_| RotaError::ConnectionNotAvailable)?;
                Ok(Box::pin(async move { sender.send_request(request).await }))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Pending,
    Connected,
    ConnectFailed,
    Closed,
}

#[derive(Debug, Default)]
struct State {
    phase: Phase,
    http2: bool,
    request_count: u64,
    in_flight: usize,
    idle_since: Option<Instant>,
}

/// Connection to one origin over a [`Dial`] route
pub struct HttpConnection<D> {
    dialer: D,
    origin: Origin,
    keepalive_expiry: Option<Duration>,
    connect_timeout: Option<Duration>,
    sender: tokio::sync::Mutex<Option<Sender>>,
    state: Arc<Mutex<State>>,
}

impl<D: Dial> HttpConnection<D> {
    /// Build a connection. No I/O happens until the first request.
    pub fn new(
        dialer: D,
        origin: Origin,
        keepalive_expiry: Option<Duration>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            dialer,
            origin,
            keepalive_expiry,
            connect_timeout,
            sender: tokio::sync::Mutex::new(None),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn proxy(&self) -> &ProxyDescriptor {
        self.dialer.proxy()
    }

    pub fn request_count(&self) -> u64 {
        self.state.lock().request_count
    }

    #[instrument(skip(self), fields(origin = %self.origin, proxy = %self.dialer.proxy()))]
    async fn connect(&self) -> Result<Sender> {
        let Dialed { stream, http2 } = self.dialer.dial().await?;
        let io = TokioIo::new(stream);

        let sender = if http2 {
            let (sender, conn) = http2::handshake(TokioExecutor::new(), io)
                .await
                .map_err(|e| RotaError::ProxyConnectionFailed(format!("HTTP/2 handshake failed: {}", e)))?;
            self.mark_connected(true);
            self.drive(conn);
            Sender::Http2(sender)
        } else {
            let (sender, conn) = http1::handshake(io)
                .await
                .map_err(|e| RotaError::ProxyConnectionFailed(format!("HTTP/1.1 handshake failed: {}", e)))?;
            self.mark_connected(false);
            self.drive(conn);
            Sender::Http1(sender)
        };

        debug!(http2, "Connection established");
        Ok(sender)
    }

    fn mark_connected(&self, http2: bool) {
        let mut state = self.state.lock();
        if state.phase == Phase::Pending {
            state.phase = Phase::Connected;
        }
        state.http2 = http2;
        state.idle_since = Some(Instant::now());
    }

    /// Run the connection task; the connection is closed once it finishes
    fn drive<F, E>(&self, conn: F)
    where
        F: std::future::Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let state = self.state.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection terminated: {}", e);
            }
            state.lock().phase = Phase::Closed;
        });
    }

    /// Count a request in flight until the returned guard drops
    fn begin_request(&self) -> Result<ReleaseGuard> {
        let mut state = self.state.lock();
        if state.phase != Phase::Connected {
            return Err(RotaError::ConnectionNotAvailable);
        }
        state.in_flight += 1;
        state.request_count += 1;
        state.idle_since = None;

        let shared = self.state.clone();
        Ok(ReleaseGuard::new(move || {
            let mut state = shared.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if state.in_flight == 0 {
                state.idle_since = Some(Instant::now());
            }
        }))
    }
}

#[async_trait]
impl<D: Dial> Connection for HttpConnection<D> {
    #[instrument(skip(self, request), fields(method = %request.method(), uri = %request.uri()))]
    async fn handle_request(&self, mut request: Request<Body>) -> Result<Response<ResponseBody>> {
        let origin = Origin::from_uri(request.uri())?;
        if !self.can_handle_request(&origin) {
            return Err(RotaError::InvalidRequest(format!(
                "Connection to {} cannot serve {}",
                self.origin, origin
            )));
        }

        let (guard, response) = {
            let mut slot = self.sender.lock().await;

            if slot.is_none() {
                if self.state.lock().phase != Phase::Pending {
                    return Err(RotaError::ConnectionNotAvailable);
                }
                match with_connect_timeout(self.connect_timeout, self.connect()).await {
                    Ok(sender) => *slot = Some(sender),
                    Err(e) => {
                        warn!(proxy = %self.dialer.proxy(), error = %e, "Connect failed");
                        self.state.lock().phase = Phase::ConnectFailed;
                        return Err(e);
                    }
                }
            }

            let sender = slot.as_mut().ok_or(RotaError::ConnectionNotAvailable)?;
            let http2 = matches!(sender, Sender::Http2(_));
            self.dialer.prepare(&mut request, &self.origin, http2);

            let guard = self.begin_request()?;
            match sender.dispatch(request).await {
                Ok(response) => (guard, response),
                Err(e) => {
                    self.state.lock().phase = Phase::Closed;
                    return Err(e);
                }
            }
        };

        let response = response.await?;
        Ok(response.map(|body| ResponseBody::incoming(body).with_guard(guard)))
    }

    async fn close(&self) {
        self.state.lock().phase = Phase::Closed;
        // A request holding the lock will see the closed phase; dropping the
        // sender lets the connection task finish.
        if let Ok(mut slot) = self.sender.try_lock() {
            slot.take();
        }
    }

    fn info(&self) -> String {
        let state = self.state.lock();
        let proxy = self.dialer.proxy().url();
        match state.phase {
            Phase::Pending => format!("CONNECTING via {}", proxy),
            Phase::ConnectFailed => format!("CONNECTION FAILED via {}", proxy),
            phase => {
                let version = if state.http2 { "HTTP/2" } else { "HTTP/1.1" };
                let label = match phase {
                    Phase::Closed => "CLOSED",
                    _ if state.in_flight > 0 => "ACTIVE",
                    _ => "IDLE",
                };
                format!(
                    "{} via {}, {}, Request Count: {}",
                    version, proxy, label, state.request_count
                )
            }
        }
    }

    fn can_handle_request(&self, origin: &Origin) -> bool {
        *origin == self.origin
    }

    fn is_available(&self) -> bool {
        let state = self.state.lock();
        match state.phase {
            Phase::Pending => self.dialer.may_multiplex(),
            Phase::Connected => state.http2 || state.in_flight == 0,
            Phase::ConnectFailed | Phase::Closed => false,
        }
    }

    fn has_expired(&self) -> bool {
        let state = self.state.lock();
        match (state.phase, state.idle_since, self.keepalive_expiry) {
            (Phase::Connected, Some(since), Some(expiry)) => {
                state.in_flight == 0 && since.elapsed() >= expiry
            }
            _ => false,
        }
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.phase == Phase::Connected && state.in_flight == 0
    }

    fn is_closed(&self) -> bool {
        matches!(self.state.lock().phase, Phase::ConnectFailed | Phase::Closed)
    }
}

/// Origin-form target with a `Host` header for HTTP/1.1; HTTP/2 keeps the
/// absolute URI so hyper can fill in `:authority`.
pub(crate) fn origin_form(request: &mut Request<Body>, origin: &Origin, http2: bool) {
    if http2 {
        *request.version_mut() = Version::HTTP_2;
        return;
    }

    *request.version_mut() = Version::HTTP_11;
    set_host(request, origin);

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    if let Ok(uri) = path.parse() {
        *request.uri_mut() = uri;
    }
}

pub(crate) fn set_host(request: &mut Request<Body>, origin: &Origin) {
    if request.headers().contains_key(HOST) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&origin.host_header()) {
        request.headers_mut().insert(HOST, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use http_body_util::Full;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::models::OriginScheme;
    use crate::proxy::dial::connect_tcp;

    /// Dials the destination directly
    struct DirectDialer {
        proxy: ProxyDescriptor,
        addr: std::net::SocketAddr,
    }

    #[async_trait]
    impl Dial for DirectDialer {
        async fn dial(&self) -> Result<Dialed> {
            let stream = connect_tcp("127.0.0.1", self.addr.port()).await?;
            Ok(Dialed {
                stream: Box::new(stream),
                http2: false,
            })
        }

        fn proxy(&self) -> &ProxyDescriptor {
            &self.proxy
        }
    }

    async fn respond_ok(stream: &mut TcpStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    fn connection(addr: std::net::SocketAddr) -> HttpConnection<DirectDialer> {
        let dialer = DirectDialer {
            proxy: ProxyDescriptor::cast("http://127.0.0.1:1").unwrap(),
            addr,
        };
        let origin = Origin::new(OriginScheme::Http, "127.0.0.1", addr.port());
        HttpConnection::new(dialer, origin, Some(Duration::from_secs(5)), None)
    }

    fn get(addr: std::net::SocketAddr, path: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("http://127.0.0.1:{}{}", addr.port(), path))
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[test]
    fn test_origin_form_rewrites_uri_and_sets_host() {
        let origin = Origin::new(OriginScheme::Http, "example.com", 80);
        let mut request = Request::builder()
            .uri("http://example.com/path?q=1")
            .body(Full::new(Bytes::new()))
            .unwrap();

        origin_form(&mut request, &origin, false);
        assert_eq!(request.uri(), "/path?q=1");
        assert_eq!(request.headers()[HOST], "example.com");
    }

    #[test]
    fn test_origin_form_keeps_absolute_uri_for_http2() {
        let origin = Origin::new(OriginScheme::Https, "example.com", 443);
        let mut request = Request::builder()
            .uri("https://example.com/path")
            .body(Full::new(Bytes::new()))
            .unwrap();

        origin_form(&mut request, &origin, true);
        assert_eq!(request.uri(), "https://example.com/path");
        assert_eq!(request.version(), Version::HTTP_2);
    }

    #[tokio::test]
    async fn test_connection_is_lazy_and_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let first = respond_ok(&mut stream).await;
            let second = respond_ok(&mut stream).await;
            (first, second)
        });

        let conn = connection(addr);
        assert!(!conn.is_available());
        assert!(!conn.is_closed());
        assert!(conn.info().starts_with("CONNECTING"));

        let response = conn.handle_request(get(addr, "/one")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(!conn.is_idle());
        let body = super::super::read_body(response).await.unwrap();
        assert_eq!(body.body(), &Bytes::from("ok"));

        assert!(conn.is_idle());
        assert!(conn.is_available());

        let uri: hyper::Uri = format!("http://127.0.0.1:{}/two", addr.port()).parse().unwrap();
        let response = conn
            .request(hyper::Method::GET, uri, hyper::HeaderMap::new(), Bytes::new())
            .await
            .unwrap();
        assert_eq!(response.body(), &Bytes::from("ok"));
        assert_eq!(conn.request_count(), 2);
        assert!(conn.info().contains("Request Count: 2"));

        let (first, second) = server.await.unwrap();
        assert!(first.starts_with("GET /one HTTP/1.1\r\n"));
        assert!(second.starts_with("GET /two HTTP/1.1\r\n"));
        assert!(first.to_lowercase().contains("host: 127.0.0.1:"));
    }

    #[tokio::test]
    async fn test_failed_dial_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = connection(addr);
        let err = conn.handle_request(get(addr, "/")).await.unwrap_err();
        assert!(err.is_connect_failure());
        assert!(conn.is_closed());
        assert!(conn.info().starts_with("CONNECTION FAILED"));

        let err = conn.handle_request(get(addr, "/")).await.unwrap_err();
        assert!(matches!(err, RotaError::ConnectionNotAvailable));
    }

    #[tokio::test]
    async fn test_rejects_other_origin() {
        let conn = connection("127.0.0.1:9".parse().unwrap());
        let request = Request::builder()
            .uri("http://other.example/")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let err = conn.handle_request(request).await.unwrap_err();
        assert!(matches!(err, RotaError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let conn = connection("127.0.0.1:9".parse().unwrap());
        conn.close().await;
        assert!(conn.is_closed());

        let err = conn
            .handle_request(get("127.0.0.1:9".parse().unwrap(), "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, RotaError::ConnectionNotAvailable));
    }

    #[tokio::test]
    async fn test_keepalive_expiry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            respond_ok(&mut stream).await;
            // Hold the socket open until the client is done.
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await;
        });

        let dialer = DirectDialer {
            proxy: ProxyDescriptor::cast("http://127.0.0.1:1").unwrap(),
            addr,
        };
        let origin = Origin::new(OriginScheme::Http, "127.0.0.1", addr.port());
        let conn = HttpConnection::new(dialer, origin, Some(Duration::from_millis(20)), None);

        let response = conn.handle_request(get(addr, "/")).await.unwrap();
        assert!(!conn.has_expired());
        super::super::read_body(response).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.has_expired());

        conn.close().await;
        server.await.unwrap();
    }
}
