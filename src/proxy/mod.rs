//! Upstream proxy plumbing
//!
//! This module provides:
//! - Proxy selection (static lists and per-origin factories)
//! - Dialing through HTTP, HTTPS (CONNECT) and SOCKS5 proxies
//! - Connections that speak HTTP over those routes
//! - The rotating connection that swaps proxies on connect failure

pub mod connection;
pub mod connector;
pub mod dial;
pub mod rotation;

pub use connection::{Connection, ResponseBody, RotatingConnection};
pub use connector::{ConnectionOptions, Connector, ProxyConnector};
pub use rotation::{ProxyFactory, ProxySource, RoundRobinFactory, StaticProxies};
