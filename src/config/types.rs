//! Broker configuration types
//!
//! Every field has a default, so a partial (or empty) JSON file is valid.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::HostAllowList;
use crate::error::BrokerError;

/// Current config file format version
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub tunnels: TunnelDefaults,
    #[serde(default)]
    pub sessions: SessionDefaults,
    #[serde(default)]
    pub host_keys: HostKeyConfig,
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections unused for this long are pruned
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// 0 = unlimited
    #[serde(default)]
    pub max_connections: usize,

    /// Readiness timeout for every connect attempt
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,

    /// Glob patterns (`*.corp.example`, `10.0.0.*`). Empty allows every host.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

/// Health probe thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Probe latency at or above this is degraded
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Latency samples kept per connection for the average
    #[serde(default = "default_latency_samples")]
    pub latency_samples: usize,
}

/// Defaults for tunnels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelDefaults {
    /// A relay direction with no traffic for this long is closed
    #[serde(default = "default_relay_idle_timeout_secs")]
    pub relay_idle_timeout_secs: u64,

    /// A SOCKS client that has not sent its request by then is dropped
    #[serde(default = "default_socks_handshake_timeout_ms")]
    pub socks_handshake_timeout_ms: u64,

    #[serde(default = "default_restart_base_delay_ms")]
    pub restart_base_delay_ms: u64,

    #[serde(default = "default_restart_max_delay_ms")]
    pub restart_max_delay_ms: u64,

    /// Used when a tunnel request does not set its own limit
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
}

/// Defaults for the session manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefaults {
    /// redb file. `None` uses `sessions.redb` in the config directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// How often each auto-recovering session checks its connection
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Cap for every recovery backoff schedule
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Recovery policy for sessions that do not bring their own
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,

    #[serde(default = "default_recovery_backoff_ms")]
    pub recovery_backoff_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostKeyConfig {
    /// Reject hosts missing from known_hosts instead of learning them
    #[serde(default)]
    pub strict: bool,

    /// Defaults to ~/.ssh/known_hosts
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_prune_interval_secs() -> u64 {
    60
}

fn default_degraded_latency_ms() -> u64 {
    200
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_latency_samples() -> usize {
    10
}

fn default_relay_idle_timeout_secs() -> u64 {
    300
}

fn default_socks_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_restart_base_delay_ms() -> u64 {
    1000
}

fn default_restart_max_delay_ms() -> u64 {
    30_000
}

fn default_max_restart_attempts() -> u32 {
    5
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_max_backoff_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_recovery_attempts() -> u32 {
    3
}

fn default_recovery_backoff_ms() -> u64 {
    5000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            pool: PoolConfig::default(),
            health: HealthConfig::default(),
            tunnels: TunnelDefaults::default(),
            sessions: SessionDefaults::default(),
            host_keys: HostKeyConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            max_connections: 0,
            connect_timeout_secs: default_connect_timeout_secs(),
            prune_interval_secs: default_prune_interval_secs(),
            allowed_hosts: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Reject settings the managers cannot run with; every problem is reported
    pub fn validate(&self) -> Result<(), BrokerError> {
        let mut errors = Vec::new();
        if self.version > CONFIG_VERSION {
            errors.push(format!(
                "version {} is newer than supported {}",
                self.version, CONFIG_VERSION
            ));
        }
        if let Err(BrokerError::Config(m)) = HostAllowList::new(&self.pool.allowed_hosts) {
            errors.push(m);
        }
        if self.pool.connect_timeout_secs == 0 {
            errors.push("pool.connect_timeout_secs must be positive".into());
        }
        if self.health.probe_timeout_ms == 0 {
            errors.push("health.probe_timeout_ms must be positive".into());
        }
        if self.health.latency_samples == 0 {
            errors.push("health.latency_samples must be positive".into());
        }
        if self.tunnels.restart_base_delay_ms > self.tunnels.restart_max_delay_ms {
            errors.push(format!(
                "tunnels.restart_base_delay_ms ({}) exceeds restart_max_delay_ms ({})",
                self.tunnels.restart_base_delay_ms, self.tunnels.restart_max_delay_ms
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::Config(errors.join("; ")))
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

impl TunnelDefaults {
    pub fn relay_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_idle_timeout_secs.max(1))
    }

    pub fn socks_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.socks_handshake_timeout_ms.max(1))
    }
}

impl SessionDefaults {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_latency_ms: default_degraded_latency_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            latency_samples: default_latency_samples(),
        }
    }
}

impl Default for TunnelDefaults {
    fn default() -> Self {
        Self {
            relay_idle_timeout_secs: default_relay_idle_timeout_secs(),
            socks_handshake_timeout_ms: default_socks_handshake_timeout_ms(),
            restart_base_delay_ms: default_restart_base_delay_ms(),
            restart_max_delay_ms: default_restart_max_delay_ms(),
            max_restart_attempts: default_max_restart_attempts(),
        }
    }
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            database_path: None,
            health_check_interval_secs: default_health_check_interval_secs(),
            max_backoff_ms: default_max_backoff_ms(),
            max_recovery_attempts: default_max_recovery_attempts(),
            recovery_backoff_ms: default_recovery_backoff_ms(),
        }
    }
}
