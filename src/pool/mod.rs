//! Connection pool
//!
//! Keeps connections per origin, reuses available ones, and bounds the total
//! count. What kind of connection gets created is up to the injected
//! [`ConnectionFactory`].

mod rotating;

pub use rotating::RotatingPool;

use std::sync::Arc;
use std::time::Duration;

use hyper::{Request, Response};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, instrument};

use crate::error::{Result, RotaError};
use crate::models::Origin;
use crate::proxy::connection::{rebuild_request, Body, Connection, ReleaseGuard, ResponseBody};

/// Pool size and keepalive limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Upper bound on open connections across all origins
    pub max_connections: Option<usize>,
    /// Idle connections kept beyond this are closed
    pub max_keepalive_connections: Option<usize>,
    pub keepalive_expiry: Option<Duration>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_connections: Some(100),
            max_keepalive_connections: Some(20),
            keepalive_expiry: Some(Duration::from_secs(5)),
        }
    }
}

/// Mints a connection for an origin the pool has no capacity for yet
pub trait ConnectionFactory: Send + Sync + 'static {
    fn create_connection(&self, origin: &Origin) -> Result<Arc<dyn Connection>>;
}

pub struct PoolManager {
    factory: Arc<dyn ConnectionFactory>,
    limits: Limits,
    connections: Mutex<Vec<Arc<dyn Connection>>>,
    released: Arc<Notify>,
}

impl PoolManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>, limits: Limits) -> Self {
        Self {
            factory,
            limits,
            connections: Mutex::new(Vec::new()),
            released: Arc::new(Notify::new()),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Send a request on a pooled connection for its origin
    #[instrument(skip(self, request), fields(method = %request.method(), uri = %request.uri()))]
    pub async fn handle_request(&self, request: Request<Body>) -> Result<Response<ResponseBody>> {
        let origin = Origin::from_uri(request.uri())?;
        let (parts, body) = request.into_parts();

        loop {
            let connection = self.acquire(&origin).await?;
            let request = rebuild_request(&parts, body.clone())?;

            match connection.handle_request(request).await {
                Ok(response) => {
                    let released = self.released.clone();
                    let guard = ReleaseGuard::new(move || released.notify_waiters());
                    return Ok(response.map(|body| body.with_guard(guard)));
                }
                Err(RotaError::ConnectionNotAvailable) => {
                    debug!(connection = %connection.info(), "Connection not available, retrying");
                    self.released.notify_waiters();
                }
                Err(e) => {
                    self.released.notify_waiters();
                    return Err(e);
                }
            }
        }
    }

    /// Find or make room for a connection to `origin`, waiting for a release
    /// when the pool is full of busy connections
    async fn acquire(&self, origin: &Origin) -> Result<Arc<dyn Connection>> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (acquired, evicted) = self.try_acquire(origin);
            for connection in evicted {
                debug!(connection = %connection.info(), "Closing pooled connection");
                connection.close().await;
            }

            if let Some(connection) = acquired? {
                return Ok(connection);
            }

            debug!(origin = %origin, "Pool exhausted, waiting for a connection");
            notified.await;
        }
    }

    fn try_acquire(
        &self,
        origin: &Origin,
    ) -> (Result<Option<Arc<dyn Connection>>>, Vec<Arc<dyn Connection>>) {
        let mut connections = self.connections.lock();
        let mut evicted = self.evict(&mut connections);

        if let Some(connection) = connections
            .iter()
            .find(|c| c.can_handle_request(origin) && c.is_available())
        {
            return (Ok(Some(connection.clone())), evicted);
        }

        let at_capacity = self
            .limits
            .max_connections
            .is_some_and(|max| connections.len() >= max);
        if at_capacity {
            match connections.iter().position(|c| c.is_idle()) {
                Some(idx) => evicted.push(connections.remove(idx)),
                None => return (Ok(None), evicted),
            }
        }

        match self.factory.create_connection(origin) {
            Ok(connection) => {
                connections.push(connection.clone());
                (Ok(Some(connection)), evicted)
            }
            Err(e) => (Err(e), evicted),
        }
    }

    /// Drop closed and expired connections, and idle ones beyond the
    /// keepalive limit, oldest first
    fn evict(&self, connections: &mut Vec<Arc<dyn Connection>>) -> Vec<Arc<dyn Connection>> {
        let mut evicted = Vec::new();

        connections.retain(|c| {
            if c.is_closed() || c.has_expired() {
                evicted.push(c.clone());
                false
            } else {
                true
            }
        });

        if let Some(max_idle) = self.limits.max_keepalive_connections {
            let idle = connections.iter().filter(|c| c.is_idle()).count();
            let mut excess = idle.saturating_sub(max_idle);
            connections.retain(|c| {
                if excess > 0 && c.is_idle() {
                    excess -= 1;
                    evicted.push(c.clone());
                    false
                } else {
                    true
                }
            });
        }

        evicted
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// `info()` of every pooled connection
    pub fn connections_info(&self) -> Vec<String> {
        self.connections.lock().iter().map(|c| c.info()).collect()
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        let connections = std::mem::take(&mut *self.connections.lock());
        for connection in connections {
            connection.close().await;
        }
        self.released.notify_waiters();
    }
}
