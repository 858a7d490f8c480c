//! Broker facade
//!
//! Wires the four managers together and answers the dispatch layer's
//! requests with uniform envelopes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{config_file, sessions_db_file, BrokerConfig, ConfigStorage};
use crate::connection::ConnectionManager;
use crate::envelope::Envelope;
use crate::error::BrokerError;
use crate::forwarding::{TunnelConfig, TunnelManager, TunnelOptions};
use crate::jump::{HopConfig, JumpChainConfig, JumpHostManager};
use crate::session::{PersistOptions, RedbSessionStore, SessionManager, SessionStore};
use crate::ssh::{RusshConnector, SshConfig, SshConnector};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConnectionRequest {
    Connect { config: SshConfig },
    GetOrCreate { config: SshConfig },
    Disconnect { connection_id: String },
    HealthCheck { connection_id: String },
    Status { connection_id: String },
    List,
    Stats,
    /// Defaults to the pool's idle timeout
    Prune { max_idle_secs: Option<u64> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TunnelRequest {
    Create {
        connection_id: String,
        config: TunnelConfig,
        #[serde(default)]
        options: TunnelOptions,
    },
    Close { tunnel_id: String },
    List { connection_id: Option<String> },
    Status { tunnel_id: String },
    Monitor { tunnel_id: String },
    StartMonitoring { tunnel_id: String, interval_secs: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum JumpRequest {
    Connect { config: JumpChainConfig },
    Validate { hops: Vec<HopConfig> },
    Status { chain_id: String },
    List,
    Close { chain_id: String },
    ClearCache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SessionRequest {
    /// Snapshot a connection into a new session
    Persist { options: PersistOptions },
    /// Refresh and store an existing session's snapshot
    Save { session_id: String },
    Load { session_id: String },
    Restore { session_id: String },
    List {
        #[serde(default)]
        active_only: bool,
    },
    Status { session_id: String },
    Delete { session_id: String },
    Cleanup { max_age_days: u64 },
}

pub struct Broker {
    config: BrokerConfig,
    connections: Arc<ConnectionManager>,
    tunnels: Arc<TunnelManager>,
    jumps: Arc<JumpHostManager>,
    sessions: Arc<SessionManager>,
}

impl Broker {
    /// Wire the managers around the given transport and session store
    pub fn new(
        config: BrokerConfig,
        connector: Arc<dyn SshConnector>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self, BrokerError> {
        let connections =
            ConnectionManager::new(connector, config.pool.clone(), config.health.clone())?;
        let tunnels = Arc::new(TunnelManager::new(
            connections.clone(),
            config.tunnels.clone(),
        ));
        let jumps = Arc::new(JumpHostManager::new(connections.clone()));
        let sessions = SessionManager::new(
            connections.clone(),
            tunnels.clone(),
            jumps.clone(),
            store,
            config.sessions.clone(),
        );
        Ok(Self {
            config,
            connections,
            tunnels,
            jumps,
            sessions,
        })
    }

    /// Production broker: russh transport, redb sessions, persisted sessions
    /// reloaded and pool maintenance running
    pub async fn start(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        let mut connector = RusshConnector::new()
            .strict(config.host_keys.strict)
            .with_handshake_timeout(config.pool.connect_timeout());
        if let Some(path) = &config.host_keys.known_hosts_path {
            connector = connector.with_known_hosts(Some(path.clone()));
        }

        let db_path = match &config.sessions.database_path {
            Some(path) => path.clone(),
            None => sessions_db_file()?,
        };
        let store = Arc::new(RedbSessionStore::open(&db_path)?);

        let broker = Self::new(config, Arc::new(connector), store)?;
        broker.connections.start_maintenance();
        match broker.sessions.load_persisted_sessions().await {
            Ok(count) => info!("Broker started with {} persisted sessions", count),
            Err(e) => warn!("Failed to load persisted sessions: {}", e),
        }
        Ok(broker)
    }

    /// `start` with the config file from the default location
    pub async fn from_config_file() -> Result<Self, BrokerError> {
        Self::from_config_path(config_file()?).await
    }

    pub async fn from_config_path(path: impl Into<PathBuf>) -> Result<Self, BrokerError> {
        let config = ConfigStorage::at(path).load().await?;
        Self::start(config).await
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    pub fn jumps(&self) -> &Arc<JumpHostManager> {
        &self.jumps
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub async fn handle_connection(&self, request: ConnectionRequest) -> Envelope {
        let connections = &self.connections;
        match request {
            ConnectionRequest::Connect { config } => Envelope::from_result(
                connections.connect(config).await.map(|entry| entry.to_info()),
            ),
            ConnectionRequest::GetOrCreate { config } => Envelope::from_result(
                connections
                    .get_or_create(config)
                    .await
                    .map(|entry| entry.to_info()),
            ),
            ConnectionRequest::Disconnect { connection_id } => {
                let closed = self.tunnels.close_tunnels_for_connection(&connection_id).await;
                Envelope::from_result(
                    connections
                        .disconnect(&connection_id)
                        .await
                        .map(|_| json!({ "connectionId": connection_id, "tunnelsClosed": closed })),
                )
            }
            ConnectionRequest::HealthCheck { connection_id } => {
                Envelope::from_result(connections.health_check(&connection_id).await)
            }
            ConnectionRequest::Status { connection_id } => Envelope::from_result(
                connections
                    .get_connection(&connection_id)
                    .ok_or_else(|| BrokerError::not_found("connection", &connection_id)),
            ),
            ConnectionRequest::List => Envelope::ok(json!(connections.list_connections())),
            ConnectionRequest::Stats => Envelope::ok(json!(connections.pool_stats())),
            ConnectionRequest::Prune { max_idle_secs } => {
                let max_idle = max_idle_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.config.pool.idle_timeout());
                let pruned = connections.prune_idle(max_idle).await;
                Envelope::ok(json!({ "pruned": pruned }))
            }
        }
    }

    pub async fn handle_tunnel(&self, request: TunnelRequest) -> Envelope {
        let tunnels = &self.tunnels;
        match request {
            TunnelRequest::Create {
                connection_id,
                config,
                options,
            } => Envelope::from_result(tunnels.create_tunnel(&connection_id, config, options).await),
            TunnelRequest::Close { tunnel_id } => Envelope::from_result(
                tunnels
                    .close_tunnel(&tunnel_id)
                    .await
                    .map(|_| json!({ "tunnelId": tunnel_id })),
            ),
            TunnelRequest::List { connection_id } => {
                Envelope::ok(json!(tunnels.list_tunnels(connection_id.as_deref())))
            }
            TunnelRequest::Status { tunnel_id } => {
                Envelope::from_result(tunnels.get_tunnel_status(&tunnel_id))
            }
            TunnelRequest::Monitor { tunnel_id } => {
                Envelope::from_result(tunnels.monitor_tunnel(&tunnel_id))
            }
            TunnelRequest::StartMonitoring {
                tunnel_id,
                interval_secs,
            } => Envelope::from_result(
                tunnels
                    .start_monitoring(&tunnel_id, Duration::from_secs(interval_secs))
                    .map(|_| json!({ "tunnelId": tunnel_id, "intervalSecs": interval_secs })),
            ),
        }
    }

    pub async fn handle_jump(&self, request: JumpRequest) -> Envelope {
        let jumps = &self.jumps;
        match request {
            JumpRequest::Connect { config } => {
                Envelope::from_result(jumps.connect_through_jumps(config).await)
            }
            JumpRequest::Validate { hops } => Envelope::ok(json!(jumps.validate_jump_chain(&hops))),
            JumpRequest::Status { chain_id } => {
                Envelope::from_result(jumps.get_jump_chain_status(&chain_id))
            }
            JumpRequest::List => Envelope::ok(json!(jumps.list_jump_chains())),
            JumpRequest::Close { chain_id } => Envelope::from_result(
                jumps
                    .close_jump_chain(&chain_id)
                    .await
                    .map(|_| json!({ "chainId": chain_id })),
            ),
            JumpRequest::ClearCache => {
                jumps.clear_path_cache();
                Envelope::ok(json!({ "cleared": true }))
            }
        }
    }

    pub async fn handle_session(&self, request: SessionRequest) -> Envelope {
        let sessions = &self.sessions;
        match request {
            SessionRequest::Persist { options } => {
                Envelope::from_result(sessions.persist_session(options).await)
            }
            SessionRequest::Save { session_id } => {
                Envelope::from_result(sessions.save_session_state(&session_id).await)
            }
            SessionRequest::Load { session_id } => {
                Envelope::from_result(sessions.load_session_state(&session_id).await)
            }
            SessionRequest::Restore { session_id } => {
                Envelope::from_result(sessions.restore_session(&session_id).await)
            }
            SessionRequest::List { active_only } => {
                Envelope::ok(json!(sessions.list_sessions(active_only)))
            }
            SessionRequest::Status { session_id } => {
                Envelope::from_result(sessions.get_session(&session_id))
            }
            SessionRequest::Delete { session_id } => Envelope::from_result(
                sessions
                    .delete_session(&session_id)
                    .await
                    .map(|_| json!({ "sessionId": session_id })),
            ),
            SessionRequest::Cleanup { max_age_days } => {
                let removed = sessions.cleanup_expired_sessions(max_age_days).await;
                Envelope::ok(json!({ "removed": removed }))
            }
        }
    }

    /// Stop recovery, close tunnels and chains, disconnect everything
    pub async fn shutdown(&self) {
        info!("Shutting down broker");
        self.sessions.shutdown();
        self.tunnels.close_all().await;
        self.jumps.cleanup().await;
        self.connections.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;
    use crate::test_utils::{password_config, FakeConnector};

    fn broker() -> (Arc<FakeConnector>, Broker) {
        let connector = FakeConnector::new();
        let broker = Broker::new(
            BrokerConfig::default(),
            connector.clone(),
            Arc::new(MemorySessionStore::new()),
        )
        .unwrap();
        (connector, broker)
    }

    #[tokio::test]
    async fn starts_from_a_config_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        let db = temp.path().join("sessions.redb");
        let config = json!({
            "pool": {"max_connections": 4, "allowed_hosts": ["*.corp.example"]},
            "sessions": {"database_path": db},
            "host_keys": {"known_hosts_path": temp.path().join("known_hosts")}
        });
        tokio::fs::write(&path, config.to_string()).await.unwrap();

        let broker = Broker::from_config_path(&path).await.unwrap();
        assert_eq!(broker.config().pool.max_connections, 4);
        assert!(db.exists());

        let request: ConnectionRequest = serde_json::from_value(json!({
            "action": "connect",
            "config": {
                "host": "evil.example",
                "username": "deploy",
                "auth": {"type": "password", "password": "secret"}
            }
        }))
        .unwrap();
        let envelope = broker.handle_connection(request).await;
        assert!(!envelope.success);
        assert!(envelope.error.unwrap().contains("evil.example"));
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_file_stops_startup() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        let db = temp.path().join("sessions.redb");
        let config = json!({
            "pool": {"allowed_hosts": ["db-[0-9"], "connect_timeout_secs": 0},
            "sessions": {"database_path": db}
        });
        tokio::fs::write(&path, config.to_string()).await.unwrap();

        let err = Broker::from_config_path(&path).await.err().unwrap();
        assert!(matches!(err, BrokerError::Config(ref m) if m.contains("db-[0-9")));
        assert!(!db.exists());

        let mut config = BrokerConfig::default();
        config.health.latency_samples = 0;
        assert!(matches!(
            Broker::start(config).await.err(),
            Some(BrokerError::Config(_))
        ));
    }

    fn data_id(envelope: &Envelope) -> String {
        envelope.data.as_ref().unwrap()["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn connection_requests_from_json() {
        let (_connector, broker) = broker();
        let request: ConnectionRequest = serde_json::from_value(json!({
            "action": "connect",
            "config": {
                "host": "app.example",
                "username": "deploy",
                "auth": {"type": "password", "password": "secret"}
            }
        }))
        .unwrap();

        let envelope = broker.handle_connection(request).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let id = data_id(&envelope);
        assert_eq!(envelope.data.as_ref().unwrap()["host"], "app.example");

        let stats = broker.handle_connection(ConnectionRequest::Stats).await;
        assert_eq!(stats.data.unwrap()["total"], 1);

        let closed = broker
            .handle_connection(ConnectionRequest::Disconnect { connection_id: id.clone() })
            .await;
        assert!(closed.success);
        let again = broker
            .handle_connection(ConnectionRequest::Disconnect { connection_id: id })
            .await;
        assert!(!again.success);
        assert!(again.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn errors_become_failed_envelopes() {
        let (_connector, broker) = broker();
        let envelope = broker
            .handle_tunnel(TunnelRequest::Create {
                connection_id: "missing".into(),
                config: TunnelConfig::dynamic(0),
                options: TunnelOptions::default(),
            })
            .await;
        assert!(!envelope.success);
        assert!(envelope.data.is_none());
        assert!(envelope.error.is_some());
    }

    #[tokio::test]
    async fn tunnel_and_session_flow() {
        let (_connector, broker) = broker();
        let connection = broker
            .handle_connection(ConnectionRequest::Connect {
                config: password_config("app.example"),
            })
            .await;
        let connection_id = data_id(&connection);

        let request: TunnelRequest = serde_json::from_value(json!({
            "action": "create",
            "connection_id": connection_id,
            "config": {"type": "local", "bind_port": 0, "remote_host": "db", "remote_port": 5432},
            "options": {"keep_alive": true}
        }))
        .unwrap();
        let tunnel = broker.handle_tunnel(request).await;
        assert!(tunnel.success, "{:?}", tunnel.error);
        assert_eq!(tunnel.data.as_ref().unwrap()["status"], "active");

        let mut options = PersistOptions::new(&connection_id);
        options.include_tunnels = true;
        let session = broker.handle_session(SessionRequest::Persist { options }).await;
        assert!(session.success, "{:?}", session.error);
        let session_id = data_id(&session);
        assert_eq!(session.data.as_ref().unwrap()["tunnels"].as_array().unwrap().len(), 1);

        let listed = broker
            .handle_session(SessionRequest::List { active_only: true })
            .await;
        assert_eq!(listed.data.unwrap().as_array().unwrap().len(), 1);

        let deleted = broker
            .handle_session(SessionRequest::Delete { session_id: session_id.clone() })
            .await;
        assert!(deleted.success);
        let status = broker.handle_session(SessionRequest::Status { session_id }).await;
        assert!(!status.success);

        broker.shutdown().await;
        assert_eq!(broker.connections().connection_count(), 0);
        assert!(broker.tunnels().list_tunnels(None).is_empty());
    }

    #[tokio::test]
    async fn jump_validation_reports_errors_without_failing() {
        let (_connector, broker) = broker();
        let mut hop = HopConfig::new(password_config("bastion.example"));
        hop.ssh.username = String::new();
        let envelope = broker
            .handle_jump(JumpRequest::Validate { hops: vec![hop] })
            .await;
        assert!(envelope.success);
        let data = envelope.data.unwrap();
        assert_eq!(data["valid"], false);
        assert_eq!(data["errors"][0], "hop 1: username is required");
    }
}
