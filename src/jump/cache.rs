//! Path cache
//!
//! Remembers which hop order reached a target host, so the next chain to
//! the same host can skip probing.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::types::HopConfig;
use crate::connection::PoolKey;

/// Longer lifetimes are clamped to this
pub const MAX_PATH_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

struct CachedPath {
    order: Vec<PoolKey>,
    expires_at: Instant,
}

#[derive(Default)]
pub struct PathCache {
    paths: DashMap<String, CachedPath>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, target_host: &str, hops: &[HopConfig], ttl: Duration) {
        let order = hops.iter().map(|h| PoolKey::from(&h.ssh)).collect();
        let now = Instant::now();
        let expires_at = now.checked_add(ttl.min(MAX_PATH_TTL)).unwrap_or(now);
        self.paths.insert(
            target_host.to_ascii_lowercase(),
            CachedPath { order, expires_at },
        );
    }

    /// `hops` in the cached order, if a live entry covers exactly these hops
    pub fn lookup(&self, target_host: &str, hops: &[HopConfig]) -> Option<Vec<HopConfig>> {
        let key = target_host.to_ascii_lowercase();
        let cached = self.paths.get(&key)?;
        if cached.expires_at <= Instant::now() {
            drop(cached);
            self.paths.remove(&key);
            debug!("Cached path for {} expired", target_host);
            return None;
        }
        if cached.order.len() != hops.len() {
            return None;
        }

        let mut ordered = Vec::with_capacity(hops.len());
        for wanted in &cached.order {
            let hop = hops.iter().find(|h| &PoolKey::from(&h.ssh) == wanted)?;
            ordered.push(hop.clone());
        }
        Some(ordered)
    }

    pub fn invalidate(&self, target_host: &str) {
        self.paths.remove(&target_host.to_ascii_lowercase());
    }

    pub fn clear(&self) {
        self.paths.clear();
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
