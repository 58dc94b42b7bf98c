//! SOCKS5 proxy route

use std::sync::Arc;

use async_trait::async_trait;
use rustls::ClientConfig;

use super::client::{Dial, Dialed, HttpConnection};
use crate::error::Result;
use crate::models::{Origin, ProxyDescriptor};
use crate::proxy::dial::{connect_socks5, connect_tcp, negotiated_h2, tls_handshake};

pub struct Socks5Dialer {
    proxy: Arc<ProxyDescriptor>,
    origin: Origin,
    origin_tls: Arc<ClientConfig>,
    http1: bool,
    http2: bool,
}

impl Socks5Dialer {
    pub fn new(
        proxy: Arc<ProxyDescriptor>,
        origin: Origin,
        origin_tls: Arc<ClientConfig>,
        http1: bool,
        http2: bool,
    ) -> Self {
        Self {
            proxy,
            origin,
            origin_tls,
            http1,
            http2,
        }
    }
}

#[async_trait]
impl Dial for Socks5Dialer {
    async fn dial(&self) -> Result<Dialed> {
        let socket = connect_tcp(self.proxy.host(), self.proxy.port()).await?;
        let stream = connect_socks5(socket, &self.origin, self.proxy.credentials()).await?;

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

/// Connection through a `socks5://` proxy
pub type Socks5Connection = HttpConnection<Socks5Dialer>;
