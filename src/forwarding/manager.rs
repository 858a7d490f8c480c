//! Tunnel Manager
//!
//! Creates local, remote and dynamic tunnels on pooled connections and
//! supervises them.
//!
//! Every tunnel runs as two tasks: the listener loop (`local` / `remote` /
//! `dynamic`), which returns a `TunnelExit` when it stops, and a supervisor
//! that awaits it and decides what happens next:
//!
//! - `Cancelled` -> closed (explicit close)
//! - `ConnectionLost` -> closed (the owning connection left the pool)
//! - `Failed` -> restart with capped exponential backoff if `auto_restart`,
//!   otherwise failed

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::dynamic::run_dynamic;
use super::events::{TunnelEvent, TunnelEventBus};
use super::local::{bind_listener, run_local};
use super::relay::TunnelContext;
use super::remote::{request_forward, run_remote};
use super::types::{
    TunnelConfig, TunnelCounters, TunnelHealth, TunnelInfo, TunnelMetrics, TunnelOptions,
    TunnelStatus,
};
use super::TunnelExit;
use crate::config::TunnelDefaults;
use crate::connection::ConnectionManager;
use crate::error::BrokerError;

/// How long `close_tunnel` waits for the supervisor to wind down
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before restart `attempt` (1-based): base * 2^(attempt-1), capped
pub fn restart_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

struct TunnelEntry {
    id: String,
    connection_id: String,
    config: TunnelConfig,
    options: TunnelOptions,
    status: RwLock<TunnelStatus>,
    bound_address: RwLock<Option<String>>,
    last_error: RwLock<Option<String>>,
    counters: Arc<TunnelCounters>,
    restart_attempts: AtomicU32,
    created_at: DateTime<Utc>,
    started: Instant,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelEntry {
    fn status(&self) -> TunnelStatus {
        *self.status.read()
    }

    fn set_last_error(&self, error: impl Into<String>) {
        *self.last_error.write() = Some(error.into());
    }

    fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id.clone(),
            connection_id: self.connection_id.clone(),
            kind: self.config.kind(),
            config: self.config.clone(),
            status: self.status(),
            bound_address: self.bound_address.read().clone(),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            failed_connections: self.counters.failed_connections.load(Ordering::Relaxed),
            restart_attempts: self.restart_attempts.load(Ordering::Relaxed),
            created_at: self.created_at,
            last_error: self.last_error.read().clone(),
            options: self.options.clone(),
        }
    }

    fn metrics(&self) -> TunnelMetrics {
        let status = self.status();
        let uptime = self.started.elapsed();
        let bytes_sent = self.counters.bytes_sent.load(Ordering::Relaxed);
        let bytes_received = self.counters.bytes_received.load(Ordering::Relaxed);
        let throughput_bps = if uptime.as_secs_f64() > 0.0 {
            (bytes_sent + bytes_received) as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };
        let error_rate = self.counters.error_rate();

        TunnelMetrics {
            tunnel_id: self.id.clone(),
            status,
            uptime_secs: uptime.as_secs(),
            bytes_sent,
            bytes_received,
            throughput_bps,
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            failed_connections: self.counters.failed_connections.load(Ordering::Relaxed),
            error_rate,
            health: TunnelHealth::from_error_rate(status, error_rate),
        }
    }
}

/// A started listener
struct Running {
    bound_address: String,
    task: JoinHandle<TunnelExit>,
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Bind / request the listener for `config` and spawn its loop
async fn start_tunnel(config: &TunnelConfig, ctx: &TunnelContext) -> Result<Running, BrokerError> {
    match config {
        TunnelConfig::Local {
            bind_address,
            bind_port,
            remote_host,
            remote_port,
        } => {
            let listener = bind_listener(&join_host_port(bind_address, *bind_port)).await?;
            let bound = listener
                .local_addr()
                .map_err(|e| BrokerError::Bind(format!("Failed to get bound address: {}", e)))?;
            info!(
                "Started local port forward: {} -> {}:{}",
                bound, remote_host, remote_port
            );
            let task = tokio::spawn(run_local(
                listener,
                remote_host.clone(),
                *remote_port,
                ctx.clone(),
            ));
            Ok(Running {
                bound_address: bound.to_string(),
                task,
            })
        }
        TunnelConfig::Remote {
            remote_bind_address,
            remote_port,
            local_host,
            local_port,
        } => {
            let listener = request_forward(ctx, remote_bind_address, *remote_port).await?;
            let bound = join_host_port(remote_bind_address, listener.bound_port as u16);
            info!(
                "Remote forward established: {} (requested {}) -> {}:{}",
                bound, remote_port, local_host, local_port
            );
            let task = tokio::spawn(run_remote(
                listener,
                remote_bind_address.clone(),
                local_host.clone(),
                *local_port,
                ctx.clone(),
            ));
            Ok(Running {
                bound_address: bound,
                task,
            })
        }
        TunnelConfig::Dynamic {
            bind_address,
            bind_port,
        } => {
            let listener = bind_listener(&join_host_port(bind_address, *bind_port)).await?;
            let bound = listener
                .local_addr()
                .map_err(|e| BrokerError::Bind(format!("Failed to get bound address: {}", e)))?;
            info!("Started SOCKS proxy on {}", bound);
            let task = tokio::spawn(run_dynamic(listener, ctx.clone()));
            Ok(Running {
                bound_address: bound.to_string(),
                task,
            })
        }
    }
}

fn finish(tunnel: &TunnelEntry, events: &TunnelEventBus, status: TunnelStatus, error: Option<String>) {
    *tunnel.status.write() = status;
    events.emit_status_changed(&tunnel.id, &tunnel.connection_id, status, error);
}

/// Await the listener loop, restarting it on transient failure
async fn supervise(
    tunnel: Arc<TunnelEntry>,
    ctx: TunnelContext,
    mut task: JoinHandle<TunnelExit>,
    defaults: TunnelDefaults,
    events: TunnelEventBus,
) {
    loop {
        let exit = task.await.unwrap_or_else(|e| {
            TunnelExit::Failed(format!("tunnel task ended abnormally: {}", e))
        });

        match exit {
            TunnelExit::Cancelled => {
                finish(&tunnel, &events, TunnelStatus::Closed, None);
                break;
            }
            TunnelExit::ConnectionLost => {
                info!("Tunnel {} closed: SSH connection lost", tunnel.id);
                tunnel.set_last_error("SSH connection lost");
                finish(
                    &tunnel,
                    &events,
                    TunnelStatus::Closed,
                    Some("SSH connection lost".into()),
                );
                break;
            }
            TunnelExit::Failed(reason) => {
                warn!("Tunnel {} failed: {}", tunnel.id, reason);
                tunnel.set_last_error(reason.clone());
                if !tunnel.options.auto_restart {
                    finish(&tunnel, &events, TunnelStatus::Failed, Some(reason));
                    break;
                }
                match restart(&tunnel, &ctx, &defaults, &events).await {
                    Some(next) => task = next,
                    None => break,
                }
            }
        }
    }

    // Stops in-flight relays too
    tunnel.cancel.cancel();
    if tunnel.options.keep_alive {
        ctx.connection.unpin_keep_alive();
    }
    if let Some(monitor) = tunnel.monitor.lock().take() {
        monitor.abort();
    }
}

async fn restart(
    tunnel: &TunnelEntry,
    ctx: &TunnelContext,
    defaults: &TunnelDefaults,
    events: &TunnelEventBus,
) -> Option<JoinHandle<TunnelExit>> {
    let max_attempts = tunnel
        .options
        .max_restart_attempts
        .unwrap_or(defaults.max_restart_attempts);
    let connection_shutdown = ctx.connection.shutdown_token();

    for attempt in 1..=max_attempts {
        tunnel.restart_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = restart_delay(
            attempt,
            defaults.restart_base_delay_ms,
            defaults.restart_max_delay_ms,
        );
        *tunnel.status.write() = TunnelStatus::Establishing;
        info!(
            "Restarting tunnel {} in {:?} (attempt {}/{})",
            tunnel.id, delay, attempt, max_attempts
        );
        events.emit(TunnelEvent::Restarting {
            tunnel_id: tunnel.id.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tunnel.cancel.cancelled() => {
                finish(tunnel, events, TunnelStatus::Closed, None);
                return None;
            }
            _ = connection_shutdown.cancelled() => {
                tunnel.set_last_error("SSH connection lost");
                finish(tunnel, events, TunnelStatus::Closed, Some("SSH connection lost".into()));
                return None;
            }
        }

        match start_tunnel(&tunnel.config, ctx).await {
            Ok(running) => {
                *tunnel.bound_address.write() = Some(running.bound_address);
                finish(tunnel, events, TunnelStatus::Active, None);
                info!("Tunnel {} restarted", tunnel.id);
                return Some(running.task);
            }
            Err(e) => {
                warn!("Tunnel {} restart attempt {} failed: {}", tunnel.id, attempt, e);
                tunnel.set_last_error(e.to_string());
            }
        }
    }

    error!(
        "Tunnel {} gave up after {} restart attempts",
        tunnel.id, max_attempts
    );
    let last_error = tunnel.last_error.read().clone();
    finish(tunnel, events, TunnelStatus::Failed, last_error);
    None
}

/// Tunnel registry and supervisor
///
/// Tunnels are exclusively owned here; callers only ever get snapshots.
pub struct TunnelManager {
    connections: Arc<ConnectionManager>,
    defaults: TunnelDefaults,
    tunnels: DashMap<String, Arc<TunnelEntry>>,
    events: TunnelEventBus,
}

impl TunnelManager {
    pub fn new(connections: Arc<ConnectionManager>, defaults: TunnelDefaults) -> Self {
        Self {
            connections,
            defaults,
            tunnels: DashMap::new(),
            events: TunnelEventBus::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Create a tunnel of any type on `connection_id`
    ///
    /// Bind failures (port in use, permission, server refusal) fail
    /// immediately; nothing is registered in that case.
    pub async fn create_tunnel(
        &self,
        connection_id: &str,
        config: TunnelConfig,
        options: TunnelOptions,
    ) -> Result<TunnelInfo, BrokerError> {
        config.validate()?;
        let connection = self.connections.entry(connection_id)?;
        if !connection.is_live() {
            return Err(BrokerError::ConnectionFailed(format!(
                "connection {} is not live",
                connection_id
            )));
        }

        let tunnel = Arc::new(TunnelEntry {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            config,
            options,
            status: RwLock::new(TunnelStatus::Establishing),
            bound_address: RwLock::new(None),
            last_error: RwLock::new(None),
            counters: Arc::new(TunnelCounters::default()),
            restart_attempts: AtomicU32::new(0),
            created_at: Utc::now(),
            started: Instant::now(),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
            monitor: Mutex::new(None),
        });
        let ctx = TunnelContext {
            tunnel_id: tunnel.id.clone(),
            connection: connection.clone(),
            counters: tunnel.counters.clone(),
            relay_idle: self.defaults.relay_idle_timeout(),
            handshake_timeout: self.defaults.socks_handshake_timeout(),
            cancel: tunnel.cancel.clone(),
        };

        info!("Creating tunnel {} ({}) on {}", tunnel.id, tunnel.config, connection_id);
        let running = match start_tunnel(&tunnel.config, &ctx).await {
            Ok(running) => running,
            Err(e) => {
                warn!("Tunnel {} failed to start: {}", tunnel.id, e);
                return Err(e);
            }
        };

        *tunnel.bound_address.write() = Some(running.bound_address);
        *tunnel.status.write() = TunnelStatus::Active;
        if tunnel.options.keep_alive {
            connection.pin_keep_alive();
        }
        connection.touch();

        self.tunnels.insert(tunnel.id.clone(), tunnel.clone());
        self.events
            .emit_status_changed(&tunnel.id, connection_id, TunnelStatus::Active, None);

        let supervisor = tokio::spawn(supervise(
            tunnel.clone(),
            ctx,
            running.task,
            self.defaults.clone(),
            self.events.clone(),
        ));
        *tunnel.supervisor.lock() = Some(supervisor);

        info!("Tunnel created: {}", tunnel.id);
        Ok(tunnel.info())
    }

    pub async fn create_local_tunnel(
        &self,
        connection_id: &str,
        bind_address: impl Into<String>,
        bind_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
        options: TunnelOptions,
    ) -> Result<TunnelInfo, BrokerError> {
        let config = TunnelConfig::Local {
            bind_address: bind_address.into(),
            bind_port,
            remote_host: remote_host.into(),
            remote_port,
        };
        self.create_tunnel(connection_id, config, options).await
    }

    pub async fn create_remote_tunnel(
        &self,
        connection_id: &str,
        remote_bind_address: impl Into<String>,
        remote_port: u16,
        local_host: impl Into<String>,
        local_port: u16,
        options: TunnelOptions,
    ) -> Result<TunnelInfo, BrokerError> {
        let config = TunnelConfig::Remote {
            remote_bind_address: remote_bind_address.into(),
            remote_port,
            local_host: local_host.into(),
            local_port,
        };
        self.create_tunnel(connection_id, config, options).await
    }

    pub async fn create_dynamic_tunnel(
        &self,
        connection_id: &str,
        bind_address: impl Into<String>,
        bind_port: u16,
        options: TunnelOptions,
    ) -> Result<TunnelInfo, BrokerError> {
        let config = TunnelConfig::Dynamic {
            bind_address: bind_address.into(),
            bind_port,
        };
        self.create_tunnel(connection_id, config, options).await
    }

    fn entry(&self, tunnel_id: &str) -> Result<Arc<TunnelEntry>, BrokerError> {
        self.tunnels
            .get(tunnel_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| BrokerError::not_found("tunnel", tunnel_id))
    }

    pub fn list_tunnels(&self, connection_id: Option<&str>) -> Vec<TunnelInfo> {
        let mut list: Vec<TunnelInfo> = self
            .tunnels
            .iter()
            .filter(|e| connection_id.map_or(true, |id| e.value().connection_id == id))
            .map(|e| e.value().info())
            .collect();
        list.sort_by_key(|t| t.created_at);
        list
    }

    pub fn get_tunnel_status(&self, tunnel_id: &str) -> Result<TunnelInfo, BrokerError> {
        Ok(self.entry(tunnel_id)?.info())
    }

    /// Uptime, throughput and health from the recent error rate
    pub fn monitor_tunnel(&self, tunnel_id: &str) -> Result<TunnelMetrics, BrokerError> {
        Ok(self.entry(tunnel_id)?.metrics())
    }

    /// Publish `TunnelEvent::Metrics` every `interval` until the tunnel stops
    pub fn start_monitoring(&self, tunnel_id: &str, interval: Duration) -> Result<(), BrokerError> {
        let tunnel = self.entry(tunnel_id)?;
        if interval.is_zero() {
            return Err(BrokerError::Config("monitoring interval must be positive".into()));
        }
        let status = tunnel.status();
        if matches!(status, TunnelStatus::Closed | TunnelStatus::Failed) {
            return Err(BrokerError::Tunnel(format!(
                "tunnel {} is {:?}, nothing to monitor",
                tunnel_id, status
            )));
        }
        let weak = Arc::downgrade(&tunnel);
        let cancel = tunnel.cancel.clone();
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(tunnel) = weak.upgrade() else {
                    break;
                };
                if matches!(tunnel.status(), TunnelStatus::Closed | TunnelStatus::Failed) {
                    break;
                }
                events.emit(TunnelEvent::Metrics(tunnel.metrics()));
            }
        });

        if let Some(previous) = tunnel.monitor.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop the listener and every in-flight relay, and forget the tunnel
    pub async fn close_tunnel(&self, tunnel_id: &str) -> Result<(), BrokerError> {
        let (_, tunnel) = self
            .tunnels
            .remove(tunnel_id)
            .ok_or_else(|| BrokerError::not_found("tunnel", tunnel_id))?;

        info!("Closing tunnel {}", tunnel_id);
        tunnel.cancel.cancel();
        let supervisor = tunnel.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if tokio::time::timeout(CLOSE_TIMEOUT, supervisor).await.is_err() {
                warn!("Timeout waiting for tunnel {} to stop", tunnel_id);
            }
        }
        Ok(())
    }

    pub async fn close_tunnels_for_connection(&self, connection_id: &str) -> usize {
        let ids: Vec<String> = self
            .tunnels
            .iter()
            .filter(|e| e.value().connection_id == connection_id)
            .map(|e| e.key().clone())
            .collect();
        let mut closed = 0;
        for id in ids {
            if self.close_tunnel(&id).await.is_ok() {
                closed += 1;
            }
        }
        closed
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            info!("Closing {} tunnels", ids.len());
        }
        for id in ids {
            let _ = self.close_tunnel(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthConfig, PoolConfig};
    use crate::connection::ConnectionEntry;
    use crate::ssh::RemoteSession;
    use crate::test_utils::{password_config, FakeConnector};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct Fixture {
        connector: Arc<FakeConnector>,
        connections: Arc<ConnectionManager>,
        tunnels: TunnelManager,
        connection: Arc<ConnectionEntry>,
    }

    async fn fixture() -> Fixture {
        let connector = FakeConnector::new();
        let connections = ConnectionManager::new(
            connector.clone(),
            PoolConfig::default(),
            HealthConfig::default(),
        )
        .unwrap();
        let tunnels = TunnelManager::new(connections.clone(), TunnelDefaults::default());
        let connection = connections
            .connect(password_config("bastion.example"))
            .await
            .unwrap();
        Fixture {
            connector,
            connections,
            tunnels,
            connection,
        }
    }

    async fn wait_until<F: Fn(&TunnelInfo) -> bool>(tunnels: &TunnelManager, id: &str, pred: F) -> TunnelInfo {
        for _ in 0..500 {
            if let Ok(info) = tunnels.get_tunnel_status(id) {
                if pred(&info) {
                    return info;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tunnel {} never reached the expected state", id);
    }

    #[test]
    fn restart_backoff_doubles_and_caps() {
        let delays: Vec<u64> = (1..=7)
            .map(|n| restart_delay(n, 1000, 30_000).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }

    #[tokio::test]
    async fn local_tunnel_relays_through_a_channel() {
        let f = fixture().await;
        let info = f
            .tunnels
            .create_local_tunnel(&f.connection.id, "127.0.0.1", 0, "db.internal", 5432, TunnelOptions::default())
            .await
            .unwrap();
        assert_eq!(info.status, TunnelStatus::Active);
        let bound = info.bound_address.clone().unwrap();

        let mut client = TcpStream::connect(&bound).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(client);

        let info = wait_until(&f.tunnels, &info.id, |t| {
            t.total_connections == 1 && t.active_connections == 0
        })
        .await;
        assert_eq!(info.bytes_sent, 4);
        assert_eq!(info.bytes_received, 4);

        let session = f.connector.session("bastion.example").unwrap();
        assert_eq!(session.direct_tcpip_log(), vec![("db.internal".to_string(), 5432)]);
        let conn = f.connections.get_connection(&f.connection.id).unwrap();
        assert_eq!(conn.bytes_sent, 4);
    }

    #[tokio::test]
    async fn port_conflict_fails_immediately() {
        let f = fixture().await;
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = f
            .tunnels
            .create_local_tunnel(&f.connection.id, "127.0.0.1", port, "db", 5432, TunnelOptions::default())
            .await
            .err();
        assert!(matches!(err, Some(BrokerError::Bind(_))));
        assert!(f.tunnels.list_tunnels(None).is_empty());
    }

    #[tokio::test]
    async fn unknown_connection_is_rejected() {
        let f = fixture().await;
        let err = f
            .tunnels
            .create_tunnel("nope", TunnelConfig::dynamic(0), TunnelOptions::default())
            .await
            .err();
        assert!(matches!(err, Some(BrokerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn socks5_connect_opens_one_channel_and_relays() {
        let f = fixture().await;
        let info = f
            .tunnels
            .create_tunnel(&f.connection.id, TunnelConfig::dynamic(0), TunnelOptions::default())
            .await
            .unwrap();
        let mut client = TcpStream::connect(info.bound_address.unwrap()).await.unwrap();

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut echoed = [0u8; 18];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"GET / HTTP/1.1\r\n\r\n");

        let session = f.connector.session("bastion.example").unwrap();
        assert_eq!(session.direct_tcpip_log(), vec![("example.com".to_string(), 443)]);
    }

    #[tokio::test]
    async fn silent_socks_client_is_dropped_after_the_handshake_deadline() {
        let f = fixture().await;
        let defaults = TunnelDefaults {
            socks_handshake_timeout_ms: 100,
            ..TunnelDefaults::default()
        };
        let tunnels = TunnelManager::new(f.connections.clone(), defaults);
        let info = tunnels
            .create_tunnel(&f.connection.id, TunnelConfig::dynamic(0), TunnelOptions::default())
            .await
            .unwrap();

        let mut client = TcpStream::connect(info.bound_address.clone().unwrap()).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("server should close a silent client");
        assert_eq!(read.unwrap(), 0);

        let info = wait_until(&tunnels, &info.id, |t| {
            t.failed_connections == 1 && t.active_connections == 0
        })
        .await;
        assert_eq!(info.status, TunnelStatus::Active);
        let session = f.connector.session("bastion.example").unwrap();
        assert!(session.direct_tcpip_log().is_empty());
    }

    #[tokio::test]
    async fn failed_sub_connection_does_not_kill_the_tunnel() {
        let f = fixture().await;
        f.connector
            .session("bastion.example")
            .unwrap()
            .refuse_destination("db.internal");
        let info = f
            .tunnels
            .create_tunnel(
                &f.connection.id,
                TunnelConfig::local(0, "db.internal", 5432),
                TunnelOptions::default(),
            )
            .await
            .unwrap();

        let mut client = TcpStream::connect(info.bound_address.clone().unwrap()).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        let info = wait_until(&f.tunnels, &info.id, |t| {
            t.failed_connections == 1 && t.active_connections == 0
        })
        .await;
        assert_eq!(info.status, TunnelStatus::Active);
        let metrics = f.tunnels.monitor_tunnel(&info.id).unwrap();
        assert_eq!(metrics.health, TunnelHealth::Unhealthy);
    }

    #[tokio::test]
    async fn remote_tunnel_dials_local_target() {
        let f = fixture().await;
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = echo.accept().await {
                let (mut r, mut w) = stream.into_split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            }
        });

        let info = f
            .tunnels
            .create_tunnel(
                &f.connection.id,
                TunnelConfig::remote(9000, "127.0.0.1", echo_port),
                TunnelOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(info.bound_address.as_deref(), Some("localhost:9000"));

        let session = f.connector.session("bastion.example").unwrap();
        assert_eq!(session.forwarded_ports(), vec![9000]);
        let mut remote_client = session.inject_forwarded(9000).await.unwrap();
        remote_client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        remote_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        f.tunnels.close_tunnel(&info.id).await.unwrap();
        assert!(session.forwarded_ports().is_empty());
    }

    #[tokio::test]
    async fn connection_death_closes_its_tunnels_without_restart() {
        let f = fixture().await;
        let auto = TunnelOptions {
            auto_restart: true,
            ..Default::default()
        };
        let local = f
            .tunnels
            .create_tunnel(&f.connection.id, TunnelConfig::local(0, "db", 5432), auto)
            .await
            .unwrap();
        let socks = f
            .tunnels
            .create_tunnel(&f.connection.id, TunnelConfig::dynamic(0), TunnelOptions::default())
            .await
            .unwrap();

        f.connector.kill("bastion.example");

        for id in [&local.id, &socks.id] {
            let info = wait_until(&f.tunnels, id, |t| t.status == TunnelStatus::Closed).await;
            assert_eq!(info.last_error.as_deref(), Some("SSH connection lost"));
            assert_eq!(info.restart_attempts, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auto_restart_recovers_a_dropped_remote_listener() {
        let f = fixture().await;
        let options = TunnelOptions {
            auto_restart: true,
            ..Default::default()
        };
        let info = f
            .tunnels
            .create_tunnel(&f.connection.id, TunnelConfig::remote(9000, "127.0.0.1", 3000), options)
            .await
            .unwrap();
        let mut events = f.tunnels.subscribe();

        // Server side drops the listener while the connection stays up
        let session = f.connector.session("bastion.example").unwrap();
        session.cancel_tcpip_forward("localhost", 9000).await.unwrap();

        let info = wait_until(&f.tunnels, &info.id, |t| {
            t.restart_attempts == 1 && t.status == TunnelStatus::Active
        })
        .await;
        assert_eq!(info.last_error.as_deref(), Some("remote listener closed by server"));
        assert_eq!(session.forwarded_ports(), vec![9000]);

        let mut saw_restart = false;
        while let Ok(event) = events.try_recv() {
            if let TunnelEvent::Restarting { attempt, delay_ms, .. } = event {
                assert_eq!((attempt, delay_ms), (1, 1000));
                saw_restart = true;
            }
        }
        assert!(saw_restart);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_without_auto_restart_marks_failed() {
        let f = fixture().await;
        let info = f
            .tunnels
            .create_tunnel(
                &f.connection.id,
                TunnelConfig::remote(9000, "127.0.0.1", 3000),
                TunnelOptions::default(),
            )
            .await
            .unwrap();

        let session = f.connector.session("bastion.example").unwrap();
        session.cancel_tcpip_forward("localhost", 9000).await.unwrap();

        let info = wait_until(&f.tunnels, &info.id, |t| t.status == TunnelStatus::Failed).await;
        assert_eq!(info.restart_attempts, 0);
        assert!(matches!(
            f.tunnels.start_monitoring(&info.id, Duration::from_secs(10)),
            Err(BrokerError::Tunnel(_))
        ));
    }

    #[tokio::test]
    async fn keep_alive_pins_connection_until_closed() {
        let f = fixture().await;
        let options = TunnelOptions {
            keep_alive: true,
            ..Default::default()
        };
        let info = f
            .tunnels
            .create_tunnel(&f.connection.id, TunnelConfig::dynamic(0), options)
            .await
            .unwrap();
        assert!(f.connection.is_pinned());
        assert!(f.connections.prune_idle(Duration::ZERO).await.is_empty());

        f.tunnels.close_tunnel(&info.id).await.unwrap();
        assert!(!f.connection.is_pinned());
        assert!(matches!(
            f.tunnels.close_tunnel(&info.id).await,
            Err(BrokerError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_publishes_metrics() {
        let f = fixture().await;
        let info = f
            .tunnels
            .create_tunnel(&f.connection.id, TunnelConfig::dynamic(0), TunnelOptions::default())
            .await
            .unwrap();
        let mut events = f.tunnels.subscribe();
        f.tunnels
            .start_monitoring(&info.id, Duration::from_secs(10))
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if let Ok(TunnelEvent::Metrics(m)) = events.recv().await {
                    return m;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.tunnel_id, info.id);
        assert_eq!(event.health, TunnelHealth::Healthy);
        assert!(event.uptime_secs >= 10);
    }

    #[tokio::test]
    async fn close_tunnels_for_connection_only_touches_that_connection() {
        let f = fixture().await;
        let other = f
            .connections
            .connect(password_config("other.example"))
            .await
            .unwrap();
        f.tunnels
            .create_tunnel(&f.connection.id, TunnelConfig::dynamic(0), TunnelOptions::default())
            .await
            .unwrap();
        f.tunnels
            .create_tunnel(&other.id, TunnelConfig::dynamic(0), TunnelOptions::default())
            .await
            .unwrap();

        assert_eq!(f.tunnels.close_tunnels_for_connection(&f.connection.id).await, 1);
        let remaining = f.tunnels.list_tunnels(None);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].connection_id, other.id);

        f.tunnels.close_all().await;
        assert!(f.tunnels.list_tunnels(None).is_empty());
    }
}
