//! Connection Manager
//!
//! Independent SSH connection pool shared by the tunnel, jump host and
//! session managers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  ConnectionManager                                       │
//! │  ├── connections: id -> ConnectionEntry                  │
//! │  │     ├── session: Arc<dyn RemoteSession>               │
//! │  │     ├── health: latency ring + success rate           │
//! │  │     └── shutdown: CancellationToken                   │
//! │  ├── by_key: (host, port, username) -> id                │
//! │  └── key_locks: one async lock per pool key              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutation of the pool goes through `get_or_create` / `disconnect`.
//! A connection's `shutdown` token fires when it leaves the pool for any
//! reason; tunnels and tunnelled child connections hang off it.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::allowlist::HostAllowList;
use super::health::{classify, HealthTracker};
use super::types::{
    ConnectionCounters, ConnectionInfo, ConnectionStatus, HealthReport, HealthState, PoolKey,
    PoolStats,
};
use crate::config::{HealthConfig, PoolConfig};
use crate::error::BrokerError;
use crate::ssh::{PingResult, RemoteSession, SshConfig, SshConnector};

/// One pooled SSH connection
pub struct ConnectionEntry {
    pub id: String,
    pub config: SshConfig,
    pub key: PoolKey,
    /// Parent connection for SSH-over-SSH, None for direct connections
    pub via: Option<String>,
    session: Arc<dyn RemoteSession>,
    status: AtomicU8,
    created_at: DateTime<Utc>,
    /// Wall clock for reporting, monotonic for idle pruning
    last_used: Mutex<(DateTime<Utc>, Instant)>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    /// Keep-alive tunnels currently holding this connection
    keep_alive_pins: AtomicU32,
    health: HealthTracker,
    shutdown: CancellationToken,
}

impl ConnectionEntry {
    fn new(
        config: SshConfig,
        via: Option<String>,
        session: Arc<dyn RemoteSession>,
        latency_samples: usize,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: PoolKey::from(&config),
            config,
            via,
            session,
            status: AtomicU8::new(ConnectionStatus::Connected.to_u8()),
            created_at: Utc::now(),
            last_used: Mutex::new((Utc::now(), Instant::now())),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            keep_alive_pins: AtomicU32::new(0),
            health: HealthTracker::new(latency_samples),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn session(&self) -> Arc<dyn RemoteSession> {
        self.session.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status.to_u8(), Ordering::SeqCst);
    }

    /// Usable for new work
    pub fn is_live(&self) -> bool {
        self.status() != ConnectionStatus::Failed
            && !self.shutdown.is_cancelled()
            && self.session.is_connected()
    }

    pub fn touch(&self) {
        *self.last_used.lock() = (Utc::now(), Instant::now());
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().1.elapsed()
    }

    /// Fires when the connection leaves the pool
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn record_traffic(&self, sent: u64, received: u64) {
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_command(&self, ok: bool) {
        self.health.record_command(ok);
        self.touch();
    }

    pub fn pin_keep_alive(&self) {
        self.keep_alive_pins.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unpin_keep_alive(&self) {
        let _ = self
            .keep_alive_pins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn is_pinned(&self) -> bool {
        self.keep_alive_pins.load(Ordering::SeqCst) > 0
    }

    pub fn counters(&self) -> ConnectionCounters {
        ConnectionCounters {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            commands_executed: self.health.commands(),
            error_count: self.health.errors(),
        }
    }

    pub fn to_info(&self) -> ConnectionInfo {
        let counters = self.counters();
        ConnectionInfo {
            id: self.id.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            auth_method: self.config.auth.kind().to_string(),
            status: self.status(),
            via: self.via.clone(),
            created_at: self.created_at,
            last_used: self.last_used.lock().0,
            error_count: counters.error_count,
            commands_executed: counters.commands_executed,
            success_rate: self.health.success_rate(),
            bytes_sent: counters.bytes_sent,
            bytes_received: counters.bytes_received,
            last_latency_ms: self.health.last_latency_ms(),
            avg_latency_ms: self.health.avg_latency_ms(),
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn SshConnector>,
    pool: PoolConfig,
    health: HealthConfig,
    allow_list: HostAllowList,
    connections: DashMap<String, Arc<ConnectionEntry>>,
    by_key: DashMap<PoolKey, String>,
    key_locks: DashMap<PoolKey, Arc<tokio::sync::Mutex<()>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn SshConnector>,
        pool: PoolConfig,
        health: HealthConfig,
    ) -> Result<Arc<Self>, BrokerError> {
        let allow_list = HostAllowList::new(&pool.allowed_hosts)?;
        Ok(Arc::new(Self {
            connector,
            pool,
            health,
            allow_list,
            connections: DashMap::new(),
            by_key: DashMap::new(),
            key_locks: DashMap::new(),
            maintenance: Mutex::new(None),
        }))
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool
    }

    /// Authenticate and register a connection
    ///
    /// The allow-list is checked before any network activity. If the pool
    /// already holds a live connection for the same (host, port, username) it
    /// is returned instead, so the key stays unique. No internal retry.
    pub async fn connect(
        self: &Arc<Self>,
        config: SshConfig,
    ) -> Result<Arc<ConnectionEntry>, BrokerError> {
        self.establish(config, None).await
    }

    /// Pooled connection for the key if live, else `connect`
    pub async fn get_or_create(
        self: &Arc<Self>,
        config: SshConfig,
    ) -> Result<Arc<ConnectionEntry>, BrokerError> {
        if let Some(entry) = self.live_by_key(&PoolKey::from(&config)) {
            debug!("Reusing pooled connection {} for {}", entry.id, entry.key);
            entry.touch();
            return Ok(entry);
        }
        self.establish(config, None).await
    }

    /// Like `get_or_create`, but a new connection is tunnelled through `parent_id`
    pub async fn get_or_create_via(
        self: &Arc<Self>,
        parent_id: &str,
        config: SshConfig,
    ) -> Result<Arc<ConnectionEntry>, BrokerError> {
        if let Some(entry) = self.live_by_key(&PoolKey::from(&config)) {
            debug!("Reusing pooled connection {} for {}", entry.id, entry.key);
            entry.touch();
            return Ok(entry);
        }
        let parent = self.entry(parent_id)?;
        if !parent.is_live() {
            return Err(BrokerError::ConnectionFailed(format!(
                "parent connection {} is not live",
                parent_id
            )));
        }
        self.establish(config, Some(parent)).await
    }

    async fn establish(
        self: &Arc<Self>,
        config: SshConfig,
        parent: Option<Arc<ConnectionEntry>>,
    ) -> Result<Arc<ConnectionEntry>, BrokerError> {
        self.allow_list.check(&config.host)?;

        let key = PoolKey::from(&config);
        let lock = self
            .key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.establish_locked(&key, config, parent).await
        };
        drop(lock);
        if result.is_err() {
            self.release_key_lock(&key);
        }
        result
    }

    async fn establish_locked(
        self: &Arc<Self>,
        key: &PoolKey,
        config: SshConfig,
        parent: Option<Arc<ConnectionEntry>>,
    ) -> Result<Arc<ConnectionEntry>, BrokerError> {
        // Whoever held the lock before us may have created it
        if let Some(entry) = self.live_by_key(key) {
            entry.touch();
            return Ok(entry);
        }
        self.evict_stale(key).await;

        if self.pool.max_connections > 0 && self.connections.len() >= self.pool.max_connections {
            return Err(BrokerError::LimitReached {
                current: self.connections.len(),
                max: self.pool.max_connections,
            });
        }

        match &parent {
            Some(p) => info!("Creating SSH connection {} via {}", key, p.key),
            None => info!("Creating SSH connection {}", key),
        }

        let attempt = async {
            match &parent {
                Some(p) => self.connector.connect_via(p.session(), &config).await,
                None => self.connector.connect(&config).await,
            }
        };
        let session = match tokio::time::timeout(self.pool.connect_timeout(), attempt).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!("SSH connection {} failed: {}", key, e);
                return Err(e.into());
            }
            Err(_) => {
                warn!("SSH connection {} timed out", key);
                return Err(BrokerError::Timeout(format!(
                    "connecting to {} took longer than {}s",
                    config.address(),
                    self.pool.connect_timeout_secs
                )));
            }
        };

        let entry = Arc::new(ConnectionEntry::new(
            config,
            parent.map(|p| p.id.clone()),
            session,
            self.health.latency_samples,
        ));
        self.connections.insert(entry.id.clone(), entry.clone());
        self.by_key.insert(key.clone(), entry.id.clone());
        self.spawn_transport_watcher(&entry);

        info!("SSH connection {} established ({})", entry.id, entry.key);
        Ok(entry)
    }

    /// Forget the lock of a key nobody is connecting to or connected as
    fn release_key_lock(&self, key: &PoolKey) {
        self.key_locks.remove_if(key, |_, lock| {
            Arc::strong_count(lock) == 1 && !self.by_key.contains_key(key)
        });
    }

    fn live_by_key(&self, key: &PoolKey) -> Option<Arc<ConnectionEntry>> {
        let id = self.by_key.get(key)?.value().clone();
        let entry = self.connections.get(&id)?.value().clone();
        entry.is_live().then_some(entry)
    }

    /// Drop a dead or failed entry still registered under `key`
    async fn evict_stale(&self, key: &PoolKey) {
        let stale = self.by_key.get(key).map(|e| e.value().clone());
        if let Some(id) = stale {
            debug!("Evicting stale connection {} for {}", id, key);
            if self.remove_connection(&id, true).await.is_err() {
                self.by_key.remove_if(key, |_, v| *v == id);
            }
        }
    }

    /// Mark a connection failed and drop it once its transport dies
    fn spawn_transport_watcher(self: &Arc<Self>, entry: &Arc<ConnectionEntry>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let entry = entry.clone();
        let mut disconnect_rx = entry.session.subscribe_disconnect();

        tokio::spawn(async move {
            if entry.session.is_connected() {
                tokio::select! {
                    _ = disconnect_rx.recv() => {}
                    _ = entry.shutdown.cancelled() => return,
                }
            }
            if entry.shutdown.is_cancelled() {
                return;
            }

            warn!("Connection {} ({}) lost its transport", entry.id, entry.key);
            entry.set_status(ConnectionStatus::Failed);
            match manager.upgrade() {
                Some(manager) => {
                    let _ = manager.remove_connection(&entry.id, true).await;
                }
                None => entry.shutdown.cancel(),
            }
        });
    }

    /// Round-trip probe; classifies and records the result
    ///
    /// A failed probe marks the connection failed and counts an error, but
    /// does not tear it down.
    pub async fn health_check(&self, connection_id: &str) -> Result<HealthReport, BrokerError> {
        let entry = self.entry(connection_id)?;

        let started = Instant::now();
        let probe = tokio::time::timeout(
            Duration::from_millis(self.health.probe_timeout_ms),
            entry.session.ping(),
        )
        .await;
        let latency = match probe {
            Ok(PingResult::Ok) => Some(started.elapsed()),
            Ok(result) => {
                debug!("Health probe for {} failed: {:?}", connection_id, result);
                None
            }
            Err(_) => {
                debug!("Health probe for {} timed out", connection_id);
                None
            }
        };

        let state = classify(latency, &self.health);
        entry.health.record_command(latency.is_some());
        if let Some(latency) = latency {
            entry.health.record_latency(latency.as_millis() as u64);
        }
        entry.set_status(match state {
            HealthState::Healthy => ConnectionStatus::Connected,
            HealthState::Degraded => ConnectionStatus::Degraded,
            HealthState::Failed => ConnectionStatus::Failed,
        });
        if state == HealthState::Failed {
            warn!("Connection {} failed its health check", connection_id);
        }

        Ok(HealthReport {
            connection_id: connection_id.to_string(),
            state,
            latency_ms: latency.map(|l| l.as_millis() as u64),
            success_rate: entry.health.success_rate(),
            error_count: entry.health.errors(),
            checked_at: Utc::now(),
        })
    }

    /// Close connections unused for at least `max_idle`
    ///
    /// Connections pinned by keep-alive tunnels, and parents of tunnelled
    /// connections, are left alone.
    pub async fn prune_idle(&self, max_idle: Duration) -> Vec<String> {
        let entries: Vec<Arc<ConnectionEntry>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        let candidates: Vec<String> = entries
            .iter()
            .filter(|entry| {
                !entry.is_pinned()
                    && entry.idle_for() >= max_idle
                    && !entries.iter().any(|e| e.via.as_deref() == Some(entry.id.as_str()))
            })
            .map(|entry| entry.id.clone())
            .collect();

        let mut pruned = Vec::new();
        for id in candidates {
            info!("Connection {} idle for over {:?}, disconnecting", id, max_idle);
            if self.remove_connection(&id, false).await.is_ok() {
                pruned.push(id);
            }
        }
        pruned
    }

    /// Periodic idle pruning until `shutdown`
    pub fn start_maintenance(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let interval = self.pool.prune_interval();
        let max_idle = self.pool.idle_timeout();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let pruned = manager.prune_idle(max_idle).await;
                if !pruned.is_empty() {
                    debug!("Maintenance pruned {} idle connections", pruned.len());
                }
            }
        });

        if let Some(previous) = self.maintenance.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Disconnect one connection, and first every connection tunnelled through it
    pub async fn disconnect(&self, connection_id: &str) -> Result<(), BrokerError> {
        self.remove_connection(connection_id, false).await
    }

    async fn remove_connection(&self, connection_id: &str, failed: bool) -> Result<(), BrokerError> {
        let children: Vec<String> = self
            .connections
            .iter()
            .filter(|e| e.value().via.as_deref() == Some(connection_id))
            .map(|e| e.key().clone())
            .collect();
        for child_id in &children {
            info!("Disconnecting child connection {} (parent: {})", child_id, connection_id);
            if let Err(e) = Box::pin(self.remove_connection(child_id, failed)).await {
                debug!("Child connection {} already gone: {}", child_id, e);
            }
        }

        let (_, entry) = self
            .connections
            .remove(connection_id)
            .ok_or_else(|| BrokerError::not_found("connection", connection_id))?;
        self.by_key.remove_if(&entry.key, |_, v| v == connection_id);
        self.release_key_lock(&entry.key);

        if failed {
            entry.set_status(ConnectionStatus::Failed);
        }
        entry.shutdown.cancel();
        entry.session.disconnect().await;

        info!("Connection {} disconnected and removed", connection_id);
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        info!("Disconnecting all SSH connections...");
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            // Children are removed with their parent, so NotFound is expected
            if let Err(e) = self.remove_connection(&id, false).await {
                debug!("Skipping {}: {}", id, e);
            }
        }
    }

    /// Stop maintenance and close everything
    pub async fn shutdown(&self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        self.disconnect_all().await;
    }

    pub fn entry(&self, connection_id: &str) -> Result<Arc<ConnectionEntry>, BrokerError> {
        self.connections
            .get(connection_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| BrokerError::not_found("connection", connection_id))
    }

    pub fn get_connection(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections
            .get(connection_id)
            .map(|e| e.value().to_info())
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> =
            self.connections.iter().map(|e| e.value().to_info()).collect();
        list.sort_by_key(|c| c.created_at);
        list
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn pool_stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.connections.len(),
            max_connections: self.pool.max_connections,
            ..Default::default()
        };
        for e in self.connections.iter() {
            match e.value().status() {
                ConnectionStatus::Connecting => stats.connecting += 1,
                ConnectionStatus::Connected => stats.connected += 1,
                ConnectionStatus::Degraded => stats.degraded += 1,
                ConnectionStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn record_traffic(&self, connection_id: &str, sent: u64, received: u64) {
        if let Some(entry) = self.connections.get(connection_id) {
            entry.value().record_traffic(sent, received);
        }
    }

    pub fn record_command(&self, connection_id: &str, ok: bool) {
        if let Some(entry) = self.connections.get(connection_id) {
            entry.value().record_command(ok);
        }
    }
}
