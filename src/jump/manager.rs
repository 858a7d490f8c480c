//! Jump Host Manager
//!
//! Reaches a target through a chain of intermediate hosts. Hop 1 is
//! connected directly, hop n through hop n-1, and the target through the
//! last hop, all via the connection pool so hops are shared between chains.
//!
//! Path selection by strategy:
//! - sequential: hops in the order given
//! - optimal: with `parallel_probe`, probe every hop concurrently, drop the
//!   unreachable ones, rank by (priority desc, latency asc)
//! - failover: sequential, then once more ordered by priority

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cache::PathCache;
use super::types::{
    HopConfig, HopResult, JumpChain, JumpChainConfig, JumpChainStatus, JumpStrategy,
    ValidationResult, DEFAULT_CACHE_TTL_SECS,
};
use super::validate::{check_endpoint, validate_jump_chain};
use crate::connection::{ConnectionEntry, ConnectionManager, PoolKey};
use crate::error::BrokerError;

/// Failed and closed chains kept for inspection before the oldest go
pub const MAX_FINISHED_CHAINS: usize = 64;

/// A connected path, before it is recorded as a chain
struct PathOutcome {
    order: Vec<HopConfig>,
    hops: Vec<HopResult>,
    total_latency_ms: u64,
    target: Arc<ConnectionEntry>,
}

pub struct JumpHostManager {
    connections: Arc<ConnectionManager>,
    chains: DashMap<String, JumpChain>,
    cache: PathCache,
}

impl JumpHostManager {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            chains: DashMap::new(),
            cache: PathCache::new(),
        }
    }

    pub fn validate_jump_chain(&self, hops: &[HopConfig]) -> ValidationResult {
        validate_jump_chain(hops)
    }

    /// Validate, select a path, connect hop by hop, then the target
    ///
    /// Any hop failure aborts the attempt; the error names the hop.
    pub async fn connect_through_jumps(
        &self,
        config: JumpChainConfig,
    ) -> Result<JumpChain, BrokerError> {
        let mut validation = validate_jump_chain(&config.hops);
        check_endpoint("target", &config.target, &mut validation.errors);
        if !validation.errors.is_empty() {
            return Err(BrokerError::Config(validation.errors.join("; ")));
        }
        for warning in &validation.warnings {
            warn!("Jump chain to {}: {}", config.target.address(), warning);
        }

        let mut chain = JumpChain {
            id: uuid::Uuid::new_v4().to_string(),
            target: PoolKey::from(&config.target).to_string(),
            target_connection_id: None,
            hops: Vec::new(),
            status: JumpChainStatus::Connecting,
            strategy: config.strategy,
            total_latency_ms: 0,
            from_cache: false,
            created_at: Utc::now(),
            error: None,
        };
        self.chains.insert(chain.id.clone(), chain.clone());
        info!(
            "Connecting jump chain {} to {} through {} hops ({:?})",
            chain.id,
            chain.target,
            config.hops.len(),
            config.strategy
        );

        let cached = if config.cache_path {
            self.cache.lookup(&config.target.host, &config.hops)
        } else {
            None
        };
        let outcome = match cached {
            Some(order) => {
                debug!("Using cached path for {}", config.target.host);
                match self.connect_path(&order, &config).await {
                    Ok(path) => {
                        chain.from_cache = true;
                        Ok(path)
                    }
                    Err(e) => {
                        warn!("Cached path to {} failed ({}), selecting again", config.target.host, e);
                        self.cache.invalidate(&config.target.host);
                        self.run_strategy(&config).await
                    }
                }
            }
            None => self.run_strategy(&config).await,
        };

        match outcome {
            Ok(path) => {
                if config.cache_path && !chain.from_cache {
                    let ttl = config.cache_ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS);
                    self.cache
                        .store(&config.target.host, &path.order, Duration::from_secs(ttl));
                }
                chain.hops = path.hops;
                chain.total_latency_ms = path.total_latency_ms;
                chain.target_connection_id = Some(path.target.id.clone());
                chain.status = JumpChainStatus::Connected;
                self.chains.insert(chain.id.clone(), chain.clone());
                info!(
                    "Jump chain {} connected to {} ({}ms over {} hops)",
                    chain.id,
                    chain.target,
                    chain.total_latency_ms,
                    chain.hops.len()
                );
                Ok(chain)
            }
            Err(e) => {
                warn!("Jump chain {} to {} failed: {}", chain.id, chain.target, e);
                chain.status = JumpChainStatus::Failed;
                chain.error = Some(e.to_string());
                self.chains.insert(chain.id.clone(), chain);
                self.retire_finished();
                Err(e)
            }
        }
    }

    async fn run_strategy(&self, config: &JumpChainConfig) -> Result<PathOutcome, BrokerError> {
        match config.strategy {
            JumpStrategy::Sequential => self.connect_path(&config.hops, config).await,
            JumpStrategy::Optimal => {
                let ranked = if config.parallel_probe {
                    self.probe_order(&config.hops).await
                } else {
                    None
                };
                let order = ranked.unwrap_or_else(|| config.hops.clone());
                self.connect_path(&order, config).await
            }
            JumpStrategy::Failover => match self.connect_path(&config.hops, config).await {
                Ok(path) => Ok(path),
                Err(first) => {
                    warn!("Jump chain attempt failed ({}), retrying by priority", first);
                    let mut by_priority = config.hops.clone();
                    by_priority.sort_by_key(|h| Reverse(h.priority));
                    self.connect_path(&by_priority, config).await
                }
            },
        }
    }

    /// Probe every hop concurrently and rank the reachable ones
    ///
    /// `None` when no probe succeeded; callers fall back to the given order.
    async fn probe_order(&self, hops: &[HopConfig]) -> Option<Vec<HopConfig>> {
        if hops.is_empty() {
            return Some(Vec::new());
        }

        let probes = hops.iter().map(|hop| async move { (hop, self.probe(hop).await) });
        let mut survivors: Vec<(HopConfig, u64)> = join_all(probes)
            .await
            .into_iter()
            .filter_map(|(hop, result)| match result {
                Ok(latency) => Some((hop.clone(), latency)),
                Err(e) => {
                    debug!("Discarding hop {}: {}", hop.ssh.address(), e);
                    None
                }
            })
            .collect();

        if survivors.is_empty() {
            warn!("Every hop probe failed, falling back to sequential order");
            return None;
        }
        survivors.sort_by(|(a, a_latency), (b, b_latency)| {
            b.priority.cmp(&a.priority).then(a_latency.cmp(b_latency))
        });
        Some(survivors.into_iter().map(|(hop, _)| hop).collect())
    }

    async fn probe(&self, hop: &HopConfig) -> Result<u64, BrokerError> {
        let entry = self.connections.get_or_create(hop.ssh.clone()).await?;
        let report = self.connections.health_check(&entry.id).await?;
        report
            .latency_ms
            .ok_or_else(|| BrokerError::ProbeFailure(format!("{} did not answer", hop.ssh.address())))
    }

    /// Connect `hops` in order, then the target through the last one
    async fn connect_path(
        &self,
        hops: &[HopConfig],
        config: &JumpChainConfig,
    ) -> Result<PathOutcome, BrokerError> {
        let mut results = Vec::with_capacity(hops.len());
        let mut total_latency_ms = 0u64;
        let mut parent: Option<Arc<ConnectionEntry>> = None;

        for (i, hop) in hops.iter().enumerate() {
            let label = format!("hop {} ({})", i + 1, hop.ssh.address());

            let started = Instant::now();
            let entry = match &parent {
                None => self.connections.get_or_create(hop.ssh.clone()).await,
                Some(p) => self.connections.get_or_create_via(&p.id, hop.ssh.clone()).await,
            }
            .map_err(|e| e.context(&label))?;
            let connect_time = started.elapsed();

            let report = self
                .connections
                .health_check(&entry.id)
                .await
                .map_err(|e| e.context(&label))?;
            let latency_ms = report.latency_ms.ok_or_else(|| {
                BrokerError::ProbeFailure(format!("{}: keepalive probe failed", label))
            })?;
            if let Some(max) = hop.max_latency_ms {
                if latency_ms > max {
                    return Err(BrokerError::LatencyExceeded(format!(
                        "{}: {}ms exceeds the hop limit of {}ms",
                        label, latency_ms, max
                    )));
                }
            }

            debug!("Jump {} ready: {}ms", label, latency_ms);
            total_latency_ms += latency_ms;
            results.push(HopResult {
                host: hop.ssh.host.clone(),
                port: hop.ssh.port,
                username: hop.ssh.username.clone(),
                connection_id: entry.id.clone(),
                priority: hop.priority,
                latency_ms,
                connect_time_ms: connect_time.as_millis() as u64,
            });
            parent = Some(entry);
        }

        if let Some(max_total) = config.max_total_latency_ms {
            if total_latency_ms > max_total {
                return Err(BrokerError::LatencyExceeded(format!(
                    "chain total {}ms exceeds {}ms",
                    total_latency_ms, max_total
                )));
            }
        }

        let target_label = format!("target ({})", config.target.address());
        let target = match &parent {
            None => self.connections.get_or_create(config.target.clone()).await,
            Some(p) => {
                self.connections
                    .get_or_create_via(&p.id, config.target.clone())
                    .await
            }
        }
        .map_err(|e| e.context(&target_label))?;

        Ok(PathOutcome {
            order: hops.to_vec(),
            hops: results,
            total_latency_ms,
            target,
        })
    }

    pub fn get_jump_chain_status(&self, chain_id: &str) -> Result<JumpChain, BrokerError> {
        let mut chain = self
            .chains
            .get_mut(chain_id)
            .ok_or_else(|| BrokerError::not_found("jump chain", chain_id))?;
        self.check_target(&mut chain);
        Ok(chain.clone())
    }

    pub fn list_jump_chains(&self) -> Vec<JumpChain> {
        let mut list: Vec<JumpChain> = self
            .chains
            .iter_mut()
            .map(|mut c| {
                self.check_target(c.value_mut());
                c.value().clone()
            })
            .collect();
        list.sort_by_key(|c| c.created_at);
        list
    }

    /// A connected chain whose target is gone has failed
    fn check_target(&self, chain: &mut JumpChain) {
        if chain.status != JumpChainStatus::Connected {
            return;
        }
        let live = chain
            .target_connection_id
            .as_deref()
            .and_then(|id| self.connections.entry(id).ok())
            .is_some_and(|entry| entry.is_live());
        if !live {
            debug!("Jump chain {} lost its target {}", chain.id, chain.target);
            chain.status = JumpChainStatus::Failed;
            chain.error = Some("target connection lost".to_string());
        }
    }

    /// Drop the oldest failed or closed chains beyond the retention cap
    fn retire_finished(&self) {
        let mut finished: Vec<(chrono::DateTime<Utc>, String)> = self
            .chains
            .iter()
            .filter(|c| {
                matches!(c.value().status, JumpChainStatus::Failed | JumpChainStatus::Closed)
            })
            .map(|c| (c.value().created_at, c.key().clone()))
            .collect();
        if finished.len() <= MAX_FINISHED_CHAINS {
            return;
        }
        finished.sort();
        let excess = finished.len() - MAX_FINISHED_CHAINS;
        for (_, id) in finished.into_iter().take(excess) {
            self.chains.remove(&id);
        }
    }

    /// Disconnect the chain's target and mark it closed. Hops stay pooled.
    pub async fn close_jump_chain(&self, chain_id: &str) -> Result<(), BrokerError> {
        let target = self
            .chains
            .get(chain_id)
            .map(|c| c.target_connection_id.clone())
            .ok_or_else(|| BrokerError::not_found("jump chain", chain_id))?;

        if let Some(target_id) = target {
            if let Err(e) = self.connections.disconnect(&target_id).await {
                debug!("Target of jump chain {} already gone: {}", chain_id, e);
            }
        }
        if let Some(mut chain) = self.chains.get_mut(chain_id) {
            chain.status = JumpChainStatus::Closed;
        }
        self.retire_finished();
        info!("Jump chain {} closed", chain_id);
        Ok(())
    }

    pub fn clear_path_cache(&self) {
        self.cache.clear();
    }

    /// Close every chain, forget them, and clear the path cache
    pub async fn cleanup(&self) {
        let open: Vec<String> = self
            .chains
            .iter()
            .filter(|c| c.value().status == JumpChainStatus::Connected)
            .map(|c| c.key().clone())
            .collect();
        for id in open {
            let _ = self.close_jump_chain(&id).await;
        }
        self.chains.clear();
        self.cache.clear();
    }
}
