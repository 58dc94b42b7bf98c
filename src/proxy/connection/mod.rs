//! Connection capability interface and its implementations
//!
//! Every way of reaching a destination (forwarding, tunneling, SOCKS5, and the
//! rotating wrapper around them) implements [`Connection`].

mod client;
mod forward;
mod rotating;
#[cfg(feature = "socks")]
mod socks;
mod tunnel;

pub use client::{Dial, Dialed, HttpConnection};
pub use forward::{ForwardConnection, ForwardDialer};
pub use rotating::RotatingConnection;
#[cfg(feature = "socks")]
pub use socks::{Socks5Connection, Socks5Dialer};
pub use tunnel::{TunnelConnection, TunnelDialer};

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, Uri};
use pin_project_lite::pin_project;

use crate::error::{Result, RotaError};
use crate::models::Origin;

/// Request body type
pub type Body = Full<Bytes>;

/// A connection to one destination, possibly through a proxy
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send a request; the response body streams from the connection
    async fn handle_request(&self, request: Request<Body>) -> Result<Response<ResponseBody>>;

    /// Close the connection, releasing the socket
    async fn close(&self);

    /// Human readable state, for logs
    fn info(&self) -> String;

    fn can_handle_request(&self, origin: &Origin) -> bool;

    /// Whether a new request can be issued right now
    fn is_available(&self) -> bool;

    /// Idle for longer than the keepalive expiry, or closed by the peer
    fn has_expired(&self) -> bool;

    fn is_idle(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Send a request and stream the response
    async fn stream(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<ResponseBody>> {
        let mut request = Request::builder().method(method).uri(uri).body(Full::new(body))?;
        *request.headers_mut() = headers;
        self.handle_request(request).await
    }

    /// Send a request and read the whole response body
    async fn request(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Bytes>> {
        let response = self.stream(method, uri, headers, body).await?;
        read_body(response).await
    }
}

/// Collect a streamed response into memory
pub async fn read_body(response: Response<ResponseBody>) -> Result<Response<Bytes>> {
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await?.to_bytes();
    Ok(Response::from_parts(parts, bytes))
}

/// Rebuild a request from its parts so it can be sent again
pub(crate) fn rebuild_request(parts: &http::request::Parts, body: Body) -> Result<Request<Body>> {
    let mut request = Request::builder()
        .method(parts.method.clone())
        .uri(parts.uri.clone())
        .version(parts.version)
        .body(body)
        .map_err(RotaError::from)?;
    *request.headers_mut() = parts.headers.clone();
    Ok(request)
}

/// Runs a callback when dropped
pub(crate) struct ReleaseGuard(Option<Box<dyn FnOnce() + Send>>);

impl ReleaseGuard {
    pub(crate) fn new(on_release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(on_release)))
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(on_release) = self.0.take() {
            on_release();
        }
    }
}

pin_project! {
    /// Streaming response body.
    ///
    /// Holds the connection's in-flight slot until dropped, so a keepalive
    /// connection only becomes reusable once the caller is done reading.
    pub struct ResponseBody {
        #[pin]
        inner: UnsyncBoxBody<Bytes, hyper::Error>,
        guards: Vec<ReleaseGuard>,
    }
}

impl ResponseBody {
    pub fn new(inner: UnsyncBoxBody<Bytes, hyper::Error>) -> Self {
        Self {
            inner,
            guards: Vec::new(),
        }
    }

    pub fn incoming(body: Incoming) -> Self {
        Self::new(body.boxed_unsync())
    }

    pub fn full(bytes: impl Into<Bytes>) -> Self {
        Self::new(
            Full::new(bytes.into())
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
    }

    pub fn empty() -> Self {
        Self::full(Bytes::new())
    }

    pub(crate) fn with_guard(mut self, guard: ReleaseGuard) -> Self {
        self.guards.push(guard);
        self
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("guards", &self.guards.len())
            .finish()
    }
}

impl HttpBody for ResponseBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
