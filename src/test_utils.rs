//! In-process fake SSH transport for tests
//!
//! Hosts are simulated by name: per-host probe latency, connect delay,
//! rejected credentials, unreachable hosts and hosts behind a bastion. Direct-tcpip channels are echo
//! streams, and remote forwards can be fed with injected channels.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, mpsc};

use crate::ssh::{
    AuthMethod, BoxedChannel, ForwardedChannel, PingResult, RemoteListener, RemoteSession,
    SshConfig, SshConnector, SshError,
};

#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    pub latency: Duration,
    pub connect_delay: Duration,
    pub reject_auth: bool,
    pub unreachable: bool,
    /// Reachable only through another connection
    pub tunnel_only: bool,
}

impl FakeHost {
    pub fn with_latency(ms: u64) -> Self {
        Self {
            latency: Duration::from_millis(ms),
            ..Default::default()
        }
    }

    pub fn rejecting_auth() -> Self {
        Self {
            reject_auth: true,
            ..Default::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    pub fn tunnel_only() -> Self {
        Self {
            tunnel_only: true,
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct FakeConnector {
    hosts: Arc<DashMap<String, FakeHost>>,
    connects: AtomicUsize,
    connect_log: Mutex<Vec<(String, bool)>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_host(&self, name: &str, host: FakeHost) {
        self.hosts.insert(name.to_string(), host);
    }

    pub fn set_latency(&self, name: &str, ms: u64) {
        self.hosts.entry(name.to_string()).or_default().latency = Duration::from_millis(ms);
    }

    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        self.hosts.entry(name.to_string()).or_default().unreachable = unreachable;
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connect_count_for(&self, host: &str) -> usize {
        self.connect_log.lock().iter().filter(|(h, _)| h == host).count()
    }

    /// (host, tunneled) in connect order
    pub fn connect_log(&self) -> Vec<(String, bool)> {
        self.connect_log.lock().clone()
    }

    /// Most recent session established to `host`
    pub fn session(&self, host: &str) -> Option<Arc<FakeSession>> {
        self.sessions
            .lock()
            .iter()
            .rev()
            .find(|s| s.host == host)
            .cloned()
    }

    /// Kill the most recent live session to `host`, as a dropped network would
    pub fn kill(&self, host: &str) {
        if let Some(session) = self.session(host) {
            session.kill();
        }
    }

    async fn establish(&self, config: &SshConfig, tunneled: bool) -> Result<Arc<FakeSession>, SshError> {
        let host = self
            .hosts
            .get(&config.host)
            .map(|h| h.value().clone())
            .unwrap_or_default();

        if !host.connect_delay.is_zero() {
            tokio::time::sleep(host.connect_delay).await;
        }
        if host.unreachable || (host.tunnel_only && !tunneled) {
            return Err(SshError::ConnectionFailed(format!(
                "{} is unreachable",
                config.address()
            )));
        }
        if host.reject_auth || config.auth.credential().is_empty() {
            return Err(SshError::AuthenticationFailed(format!(
                "{} rejected credentials for {}",
                config.host, config.username
            )));
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connect_log.lock().push((config.host.clone(), tunneled));

        let session = Arc::new(FakeSession::new(&config.host, self.hosts.clone()));
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

#[async_trait]
impl SshConnector for FakeConnector {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteSession>, SshError> {
        let session = self.establish(config, false).await?;
        Ok(session)
    }

    async fn connect_via(
        &self,
        parent: Arc<dyn RemoteSession>,
        config: &SshConfig,
    ) -> Result<Arc<dyn RemoteSession>, SshError> {
        // Same first step as the real SSH-over-SSH path
        let _stream = parent
            .open_direct_tcpip(&config.host, config.port as u32, "127.0.0.1", 0)
            .await?;
        let session = self.establish(config, true).await?;
        Ok(session)
    }
}

pub struct FakeSession {
    pub host: String,
    hosts: Arc<DashMap<String, FakeHost>>,
    alive: AtomicBool,
    disconnect_tx: broadcast::Sender<()>,
    direct_log: Mutex<Vec<(String, u32)>>,
    refused: Mutex<HashSet<String>>,
    forwards: DashMap<u32, mpsc::Sender<ForwardedChannel>>,
    next_port: AtomicU32,
}

impl FakeSession {
    fn new(host: &str, hosts: Arc<DashMap<String, FakeHost>>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            host: host.to_string(),
            hosts,
            alive: AtomicBool::new(true),
            disconnect_tx,
            direct_log: Mutex::new(Vec::new()),
            refused: Mutex::new(HashSet::new()),
            forwards: DashMap::new(),
            next_port: AtomicU32::new(40000),
        }
    }

    pub fn kill(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.forwards.clear();
            let _ = self.disconnect_tx.send(());
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Destinations of every direct-tcpip channel opened so far
    pub fn direct_tcpip_log(&self) -> Vec<(String, u32)> {
        self.direct_log.lock().clone()
    }

    /// Make direct-tcpip to `host` fail, as a server refusing the connect would
    pub fn refuse_destination(&self, host: &str) {
        self.refused.lock().insert(host.to_string());
    }

    pub fn forwarded_ports(&self) -> Vec<u32> {
        self.forwards.iter().map(|e| *e.key()).collect()
    }

    /// Simulate a remote client connecting to a forwarded port. Returns the
    /// remote client's end of the stream.
    pub async fn inject_forwarded(&self, port: u32) -> Option<DuplexStream> {
        let tx = self.forwards.get(&port).map(|e| e.value().clone())?;
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        tx.send(ForwardedChannel {
            stream: Box::new(ours),
            originator_address: "203.0.113.7".to_string(),
            originator_port: 50000,
        })
        .await
        .ok()?;
        Some(theirs)
    }

    fn latency(&self) -> Duration {
        self.hosts
            .get(&self.host)
            .map(|h| h.latency)
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        _originator_host: &str,
        _originator_port: u32,
    ) -> Result<BoxedChannel, SshError> {
        if !self.is_alive() {
            return Err(SshError::Disconnected);
        }
        self.direct_log.lock().push((host.to_string(), port));
        if self.refused.lock().contains(host) {
            return Err(SshError::ChannelError(format!(
                "connect to {}:{} refused",
                host, port
            )));
        }

        // Echo server on the far side of the channel
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(theirs);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        Ok(Box::new(ours))
    }

    async fn tcpip_forward(&self, _address: &str, port: u32) -> Result<RemoteListener, SshError> {
        if !self.is_alive() {
            return Err(SshError::Disconnected);
        }
        let bound_port = if port == 0 {
            self.next_port.fetch_add(1, Ordering::SeqCst)
        } else {
            port
        };
        let (tx, incoming) = mpsc::channel(8);
        self.forwards.insert(bound_port, tx);
        Ok(RemoteListener {
            bound_port,
            incoming,
        })
    }

    async fn cancel_tcpip_forward(&self, _address: &str, port: u32) -> Result<(), SshError> {
        self.forwards.remove(&port);
        Ok(())
    }

    async fn ping(&self) -> PingResult {
        if !self.is_alive() {
            return PingResult::IoError;
        }
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.is_alive() {
            PingResult::Ok
        } else {
            PingResult::IoError
        }
    }

    async fn disconnect(&self) {
        self.kill();
    }

    fn is_connected(&self) -> bool {
        self.is_alive()
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }
}

pub fn password_config(host: &str) -> SshConfig {
    SshConfig::new(host, "deploy", AuthMethod::password("secret"))
}
