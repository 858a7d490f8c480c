//! Connection pool types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ssh::SshConfig;

/// Pool identity of a connection. At most one live connection per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl PoolKey {
    pub fn new(host: &str, port: u16, username: &str) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
            port,
            username: username.to_string(),
        }
    }
}

impl From<&SshConfig> for PoolKey {
    fn from(config: &SshConfig) -> Self {
        PoolKey::new(&config.host, config.port, &config.username)
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// Reachable, but the last probe was slow
    Degraded,
    Failed,
}

impl ConnectionStatus {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ConnectionStatus::Connecting => 0,
            ConnectionStatus::Connected => 1,
            ConnectionStatus::Degraded => 2,
            ConnectionStatus::Failed => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionStatus::Connecting,
            1 => ConnectionStatus::Connected,
            2 => ConnectionStatus::Degraded,
            _ => ConnectionStatus::Failed,
        }
    }
}

/// Snapshot of one pooled connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: String,
    pub status: ConnectionStatus,
    /// Connection this one was tunnelled through
    pub via: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub error_count: u64,
    pub commands_executed: u64,
    pub success_rate: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_latency_ms: Option<u64>,
    pub avg_latency_ms: Option<u64>,
}

/// Outcome class of a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub connection_id: String,
    pub state: HealthState,
    /// `None` when the probe failed
    pub latency_ms: Option<u64>,
    pub success_rate: f64,
    pub error_count: u64,
    pub checked_at: DateTime<Utc>,
}

/// Counters captured when a session snapshots its connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub commands_executed: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub connecting: usize,
    pub connected: usize,
    pub degraded: usize,
    pub failed: usize,
    pub max_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::AuthMethod;

    #[test]
    fn pool_key_ignores_host_case_and_auth() {
        let a = SshConfig::new("Bastion.Example", "ops", AuthMethod::password("a"));
        let b = SshConfig::new("bastion.example", "ops", AuthMethod::key("/k", None));
        assert_eq!(PoolKey::from(&a), PoolKey::from(&b));

        let c = b.clone().with_port(2222);
        assert_ne!(PoolKey::from(&a), PoolKey::from(&c));
        assert_eq!(PoolKey::from(&c).to_string(), "ops@bastion.example:2222");
    }
}
