//! Rota client - rotating upstream proxy connections
//!
//! An HTTP connection layer that sends each destination's traffic through
//! an upstream proxy picked from a list or by a caller-supplied factory,
//! rotating to a fresh proxy when connecting fails.
//!
//! ## Features
//!
//! - HTTP (forwarding), HTTPS (CONNECT tunnel) and SOCKS5 proxies
//! - Random selection from a static list, or per-origin factories
//! - Retry through a new proxy on connect failure, or rotate on every request
//! - Connection pooling with HTTP/1.1 keepalive and HTTP/2 over ALPN

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod proxy;
pub mod tls;
pub mod transport;

pub use config::Config;
pub use error::{Result, RotaError};
pub use models::{Origin, ProxyConfig, ProxyDescriptor, ProxyInput, ProxyScheme};
pub use pool::Limits;
pub use proxy::{Connection, ProxyFactory, ResponseBody, RoundRobinFactory};
pub use tls::{TlsOptions, Verify};
pub use transport::{Proxies, RotatingTransport, TransportConfig};
