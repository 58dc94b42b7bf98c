//! Dialing primitives for upstream proxies
//!
//! TCP connect, TLS handshakes, the HTTP CONNECT exchange and the SOCKS5
//! handshake. Everything here runs while a connection is being established,
//! so I/O failures map to connect errors.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::{HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use crate::error::{Result, RotaError};
use crate::models::Origin;
use crate::tls;

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Byte stream to a destination, whatever it went through
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Run a connect future, turning an elapsed deadline into `ConnectTimeout`
pub async fn with_connect_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| RotaError::ConnectTimeout)?,
        None => fut.await,
    }
}

/// Open a TCP connection to `host:port`
pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format_tcp_addr(host, port);
    debug!("Connecting to {}", addr);

    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| RotaError::ProxyConnectionFailed(format!("TCP connect to {} failed: {}", addr, e)))?;
    let _ = stream.set_nodelay(true);

    Ok(stream)
}

/// Wrap a stream in TLS for `host`
pub async fn tls_handshake<S>(
    stream: S,
    host: &str,
    config: Arc<rustls::ClientConfig>,
) -> Result<TlsStream<S>>
where
    S: ProxyStream,
{
    let server_name = tls::server_name(host)?;
    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| RotaError::ProxyConnectionFailed(format!("TLS handshake with {} failed: {}", host, e)))
}

/// Whether the server picked HTTP/2 over ALPN
pub fn negotiated_h2<S>(stream: &TlsStream<S>) -> bool {
    stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice())
}

/// Send `CONNECT` for `origin` and wait for a 2xx response head
#[instrument(skip(stream, headers), fields(target = %origin.authority()))]
pub async fn connect_tunnel<S>(
    stream: &mut S,
    origin: &Origin,
    headers: &[(HeaderName, HeaderValue)],
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_connect_request(origin, headers);
    stream.write_all(&request).await.map_err(|e| {
        RotaError::ProxyConnectionFailed(format!("Failed to send CONNECT: {}", e))
    })?;
    stream.flush().await.map_err(|e| {
        RotaError::ProxyConnectionFailed(format!("Failed to send CONNECT: {}", e))
    })?;

    // Byte at a time so nothing past the response head is consumed.
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(RotaError::ProxyError("CONNECT response head too large".into()));
        }
        let byte = stream.read_u8().await.map_err(|e| {
            RotaError::ProxyConnectionFailed(format!("Failed to read CONNECT response: {}", e))
        })?;
        head.push(byte);
    }

    let response = String::from_utf8_lossy(&head);
    let status_line = response.lines().next().unwrap_or_default();
    let status = parse_status(status_line)
        .ok_or_else(|| RotaError::ProxyError(format!("Malformed CONNECT response: {}", status_line)))?;

    if !(200..300).contains(&status) {
        return Err(RotaError::ProxyError(format!("CONNECT failed: {}", status_line)));
    }

    debug!("HTTP CONNECT tunnel established");
    Ok(())
}

/// Build an HTTP CONNECT request
fn build_connect_request(origin: &Origin, headers: &[(HeaderName, HeaderValue)]) -> Vec<u8> {
    let authority = origin.authority();
    let mut request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
        authority, authority
    )
    .into_bytes();

    for (name, value) in headers {
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }

    request.extend_from_slice(b"\r\n");
    request
}

fn parse_status(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// SOCKS5 handshake over an open socket to the proxy
#[cfg(feature = "socks")]
#[instrument(skip(socket, credentials), fields(target = %origin.authority()))]
pub async fn connect_socks5(
    socket: TcpStream,
    origin: &Origin,
    credentials: Option<&crate::models::Credentials>,
) -> Result<TcpStream> {
    use tokio_socks::tcp::Socks5Stream;

    let target = (origin.host.as_str(), origin.port);
    let stream = match credentials {
        Some(credentials) => {
            Socks5Stream::connect_with_password_and_socket(
                socket,
                target,
                &credentials.username,
                &credentials.password,
            )
            .await
        }
        None => Socks5Stream::connect_with_socket(socket, target).await,
    }
    .map_err(|e| match e {
        tokio_socks::Error::Io(e) => {
            RotaError::ProxyConnectionFailed(format!("SOCKS5 connect failed: {}", e))
        }
        other => RotaError::ProxyError(format!("SOCKS5 handshake failed: {}", other)),
    })?;

    debug!("SOCKS5 connection established");
    Ok(stream.into_inner())
}

fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
