//! Uniform random selection from a fixed proxy list

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};

use crate::error::{Result, RotaError};
use crate::models::ProxyDescriptor;

/// A fixed, non-empty proxy list sampled with replacement
pub struct StaticProxies {
    proxies: Vec<Arc<ProxyDescriptor>>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl StaticProxies {
    pub fn new(proxies: Vec<ProxyDescriptor>) -> Result<Self> {
        Self::with_rng(proxies, StdRng::from_entropy())
    }

    /// Use a caller-supplied RNG, e.g. a seeded one for reproducible runs
    pub fn with_rng(proxies: Vec<ProxyDescriptor>, rng: impl RngCore + Send + 'static) -> Result<Self> {
        if proxies.is_empty() {
            return Err(RotaError::NoProxiesAvailable);
        }

        Ok(Self {
            proxies: proxies.into_iter().map(Arc::new).collect(),
            rng: Mutex::new(Box::new(rng)),
        })
    }

    pub fn select(&self) -> Result<Arc<ProxyDescriptor>> {
        let mut rng = self.rng.lock();
        self.proxies
            .choose(&mut *rng)
            .cloned()
            .ok_or(RotaError::NoProxiesAvailable)
    }

    pub fn proxies(&self) -> &[Arc<ProxyDescriptor>] {
        &self.proxies
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

impl std::fmt::Debug for StaticProxies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticProxies")
            .field("proxies", &self.proxies)
            .finish()
    }
}
