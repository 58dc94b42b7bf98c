//! Pool whose connections rotate proxies

use std::sync::Arc;

use super::{ConnectionFactory, Limits, PoolManager};
use crate::error::Result;
use crate::models::Origin;
use crate::proxy::connection::{Connection, RotatingConnection};
use crate::proxy::connector::Connector;
use crate::proxy::rotation::ProxySource;

/// Mints a [`RotatingConnection`] per origin; pooling itself is left to
/// [`PoolManager`]
pub struct RotatingPool {
    source: Arc<ProxySource>,
    connector: Arc<dyn Connector>,
    retries: u32,
    always_update: bool,
}

impl RotatingPool {
    pub fn new(
        source: Arc<ProxySource>,
        connector: Arc<dyn Connector>,
        retries: u32,
        always_update: bool,
    ) -> Self {
        Self {
            source,
            connector,
            retries,
            always_update,
        }
    }

    /// Wrap in a pool manager with the given limits
    pub fn into_manager(self, limits: Limits) -> PoolManager {
        PoolManager::new(Arc::new(self), limits)
    }
}

impl ConnectionFactory for RotatingPool {
    fn create_connection(&self, origin: &Origin) -> Result<Arc<dyn Connection>> {
        let connection = RotatingConnection::new(
            origin.clone(),
            self.source.clone(),
            self.connector.clone(),
            self.retries,
            self.always_update,
        )?;
        Ok(Arc::new(connection))
    }
}
