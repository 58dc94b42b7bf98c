//! Tunneling through an HTTPS proxy with CONNECT

use std::sync::Arc;

use async_trait::async_trait;
use rustls::ClientConfig;

use super::client::{Dial, Dialed, HttpConnection};
use crate::error::Result;
use crate::models::{Origin, ProxyDescriptor};
use crate::proxy::dial::{connect_tcp, connect_tunnel, negotiated_h2, tls_handshake};

pub struct TunnelDialer {
    proxy: Arc<ProxyDescriptor>,
    origin: Origin,
    /// TLS to the proxy itself
    proxy_tls: Arc<ClientConfig>,
    /// TLS to the destination, ALPN already set
    origin_tls: Arc<ClientConfig>,
    http1: bool,
    http2: bool,
}

impl TunnelDialer {
    pub fn new(
        proxy: Arc<ProxyDescriptor>,
        origin: Origin,
        proxy_tls: Arc<ClientConfig>,
        origin_tls: Arc<ClientConfig>,
        http1: bool,
        http2: bool,
    ) -> Self {
        Self {
            proxy,
            origin,
            proxy_tls,
            origin_tls,
            http1,
            http2,
        }
    }
}

#[async_trait]
impl Dial for TunnelDialer {
    async fn dial(&self) -> Result<Dialed> {
        let socket = connect_tcp(self.proxy.host(), self.proxy.port()).await?;
        let mut stream = tls_handshake(socket, self.proxy.host(), self.proxy_tls.clone()).await?;

        connect_tunnel(&mut stream, &self.origin, self.proxy.headers()).await?;

        if self.origin.is_tls() {
            let stream = tls_handshake(stream, &self.origin.host, self.origin_tls.clone()).await?;
            let http2 = negotiated_h2(&stream);
            Ok(Dialed {
                stream: Box::new(stream),
                http2,
            })
        } else {
            Ok(Dialed {
                stream: Box::new(stream),
                http2: self.http2 && !self.http1,
            })
        }
    }

    fn may_multiplex(&self) -> bool {
        self.http2 && (self.origin.is_tls() || !self.http1)
    }

    fn proxy(&self) -> &ProxyDescriptor {
        &self.proxy
    }
}

/// Connection through an `https://` proxy
pub type TunnelConnection = HttpConnection<TunnelDialer>;
