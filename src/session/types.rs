//! Session Types and Data Structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SessionDefaults;
use crate::connection::ConnectionCounters;
use crate::forwarding::{TunnelConfig, TunnelOptions};
use crate::jump::JumpChainConfig;
use crate::ssh::SshConfig;

/// Spacing between recovery attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    /// Constant delay
    Immediate,
    /// base x attempt
    Linear,
    /// base x 2^(attempt-1)
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    #[serde(default)]
    pub auto_recover: bool,
    pub max_recovery_attempts: u32,
    #[serde(default)]
    pub recovery_strategy: RecoveryStrategy,
    pub recovery_backoff_ms: u64,
}

impl RecoveryPolicy {
    pub fn from_defaults(defaults: &SessionDefaults) -> Self {
        Self {
            auto_recover: false,
            max_recovery_attempts: defaults.max_recovery_attempts,
            recovery_strategy: RecoveryStrategy::Exponential,
            recovery_backoff_ms: defaults.recovery_backoff_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryState {
    #[default]
    Stable,
    Recovering,
    /// Attempts exhausted; no further automatic recovery
    Failed,
}

/// A tunnel captured from the live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTunnel {
    pub config: TunnelConfig,
    #[serde(default)]
    pub options: TunnelOptions,
}

/// Caller-declared forward, recreated as a tunnel on every restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardRule {
    pub name: String,
    pub config: TunnelConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub keep_alive: bool,
}

fn default_true() -> bool {
    true
}

impl PortForwardRule {
    pub fn new(name: impl Into<String>, config: TunnelConfig) -> Self {
        Self {
            name: name.into(),
            config,
            enabled: true,
            auto_restart: false,
            keep_alive: false,
        }
    }

    pub(crate) fn tunnel_options(&self) -> TunnelOptions {
        TunnelOptions {
            auto_restart: self.auto_restart,
            max_restart_attempts: None,
            keep_alive: self.keep_alive,
            description: Some(self.name.clone()),
        }
    }
}

/// What to capture when persisting a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistOptions {
    pub connection_id: String,
    /// Write to durable storage
    #[serde(default = "default_true")]
    pub persist: bool,
    /// Falls back to the configured session defaults
    #[serde(default)]
    pub policy: Option<RecoveryPolicy>,
    /// Snapshot the connection's active tunnels
    #[serde(default)]
    pub include_tunnels: bool,
    #[serde(default)]
    pub port_forwards: Vec<PortForwardRule>,
    #[serde(default)]
    pub jump_chain: Option<JumpChainConfig>,
}

impl PersistOptions {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            persist: true,
            policy: None,
            include_tunnels: false,
            port_forwards: Vec::new(),
            jump_chain: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub id: String,
    pub connection_config: SshConfig,
    /// Pool connection currently backing the session
    #[serde(default)]
    pub connection_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub persist: bool,
    pub policy: RecoveryPolicy,
    #[serde(default)]
    pub recovery_count: u32,
    #[serde(default)]
    pub recovery_state: RecoveryState,
    #[serde(default)]
    pub counters: ConnectionCounters,
    /// Re-snapshot tunnels on save
    #[serde(default)]
    pub capture_tunnels: bool,
    #[serde(default)]
    pub tunnels: Vec<StoredTunnel>,
    #[serde(default)]
    pub port_forwards: Vec<PortForwardRule>,
    #[serde(default)]
    pub jump_chain: Option<JumpChainConfig>,
    /// Chain established by the last restore
    #[serde(default)]
    pub jump_chain_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Outcome of a restore. Secondary resources that could not be recreated are
/// listed in `warnings`; the session still counts as recovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub session_id: String,
    pub connection_id: String,
    pub recovery_count: u32,
    pub jump_chain_id: Option<String>,
    pub restored_tunnels: Vec<String>,
    pub warnings: Vec<String>,
}

impl RecoveryResult {
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Published on the session event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    StateChanged {
        session_id: String,
        state: RecoveryState,
        error: Option<String>,
    },
    /// Emitted as an attempt starts, after its delay
    #[serde(rename_all = "camelCase")]
    RecoveryAttempt {
        session_id: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Recovered {
        session_id: String,
        connection_id: String,
        warnings: Vec<String>,
    },
}
