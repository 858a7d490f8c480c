//! Tunnel types

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// What a tunnel forwards, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelConfig {
    /// ssh -L: local listener, each connection opens a channel to remote_host:remote_port
    Local {
        #[serde(default = "default_local_bind")]
        bind_address: String,
        bind_port: u16,
        remote_host: String,
        remote_port: u16,
    },
    /// ssh -R: the server listens, accepted connections come back to local_host:local_port
    Remote {
        #[serde(default = "default_remote_bind")]
        remote_bind_address: String,
        remote_port: u16,
        local_host: String,
        local_port: u16,
    },
    /// ssh -D: local SOCKS4/5 proxy, destination chosen per request
    Dynamic {
        #[serde(default = "default_local_bind")]
        bind_address: String,
        bind_port: u16,
    },
}

fn default_local_bind() -> String {
    "127.0.0.1".into()
}

fn default_remote_bind() -> String {
    "localhost".into()
}

impl TunnelConfig {
    pub fn local(bind_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        TunnelConfig::Local {
            bind_address: default_local_bind(),
            bind_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    pub fn remote(remote_port: u16, local_host: impl Into<String>, local_port: u16) -> Self {
        TunnelConfig::Remote {
            remote_bind_address: default_remote_bind(),
            remote_port,
            local_host: local_host.into(),
            local_port,
        }
    }

    pub fn dynamic(bind_port: u16) -> Self {
        TunnelConfig::Dynamic {
            bind_address: default_local_bind(),
            bind_port,
        }
    }

    pub fn kind(&self) -> TunnelKind {
        match self {
            TunnelConfig::Local { .. } => TunnelKind::Local,
            TunnelConfig::Remote { .. } => TunnelKind::Remote,
            TunnelConfig::Dynamic { .. } => TunnelKind::Dynamic,
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        match self {
            TunnelConfig::Local {
                bind_address,
                remote_host,
                remote_port,
                ..
            } => {
                if bind_address.trim().is_empty() {
                    return Err(BrokerError::Config("local tunnel needs a bind address".into()));
                }
                if remote_host.trim().is_empty() || *remote_port == 0 {
                    return Err(BrokerError::Config(
                        "local tunnel needs a remote host and port".into(),
                    ));
                }
            }
            TunnelConfig::Remote {
                remote_bind_address,
                local_host,
                local_port,
                ..
            } => {
                if remote_bind_address.trim().is_empty() {
                    return Err(BrokerError::Config(
                        "remote tunnel needs a remote bind address".into(),
                    ));
                }
                if local_host.trim().is_empty() || *local_port == 0 {
                    return Err(BrokerError::Config(
                        "remote tunnel needs a local host and port".into(),
                    ));
                }
            }
            TunnelConfig::Dynamic { bind_address, .. } => {
                if bind_address.trim().is_empty() {
                    return Err(BrokerError::Config(
                        "dynamic tunnel needs a bind address".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelConfig::Local {
                bind_address,
                bind_port,
                remote_host,
                remote_port,
            } => write!(
                f,
                "local {}:{} -> {}:{}",
                bind_address, bind_port, remote_host, remote_port
            ),
            TunnelConfig::Remote {
                remote_bind_address,
                remote_port,
                local_host,
                local_port,
            } => write!(
                f,
                "remote {}:{} -> {}:{}",
                remote_bind_address, remote_port, local_host, local_port
            ),
            TunnelConfig::Dynamic {
                bind_address,
                bind_port,
            } => write!(f, "socks {}:{}", bind_address, bind_port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Local,
    Remote,
    Dynamic,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOptions {
    /// Recreate the tunnel after a transient failure
    #[serde(default)]
    pub auto_restart: bool,
    /// Falls back to the configured default
    #[serde(default)]
    pub max_restart_attempts: Option<u32>,
    /// Keep the owning connection out of idle pruning while the tunnel lives
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Establishing,
    Active,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl TunnelHealth {
    /// Healthy below 10% failed sub-connections, degraded below 50%
    pub fn from_error_rate(status: TunnelStatus, error_rate: f64) -> Self {
        if status != TunnelStatus::Active {
            TunnelHealth::Unhealthy
        } else if error_rate < 0.1 {
            TunnelHealth::Healthy
        } else if error_rate < 0.5 {
            TunnelHealth::Degraded
        } else {
            TunnelHealth::Unhealthy
        }
    }
}

/// Finished sub-connections the error rate looks back over
pub const RECENT_OUTCOMES: usize = 50;

/// Live counters shared between a tunnel's listener and its relays
#[derive(Debug, Default)]
pub struct TunnelCounters {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub failed_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Outcomes of the latest finished sub-connections, `true` = failed
    recent: Mutex<VecDeque<bool>>,
}

impl TunnelCounters {
    /// Count an accepted sub-connection; it stays active until the guard drops
    pub fn begin(&self) -> ActiveGuard<'_> {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            counters: self,
            failed: AtomicBool::new(false),
        }
    }

    fn record_outcome(&self, failed: bool) {
        let mut recent = self.recent.lock();
        if recent.len() == RECENT_OUTCOMES {
            recent.pop_front();
        }
        recent.push_back(failed);
    }

    /// Failed share of the last `RECENT_OUTCOMES` finished sub-connections,
    /// 0.0 before any finished
    pub fn error_rate(&self) -> f64 {
        let recent = self.recent.lock();
        if recent.is_empty() {
            return 0.0;
        }
        recent.iter().filter(|failed| **failed).count() as f64 / recent.len() as f64
    }
}

/// One sub-connection in flight. Its outcome is recorded when it drops.
pub struct ActiveGuard<'a> {
    counters: &'a TunnelCounters,
    failed: AtomicBool,
}

impl ActiveGuard<'_> {
    /// Mark the sub-connection failed. Counted once however often called.
    pub fn fail(&self) {
        if !self.failed.swap(true, Ordering::Relaxed) {
            self.counters.failed_connections.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.counters.record_outcome(self.failed.load(Ordering::Relaxed));
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot of one tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub id: String,
    pub connection_id: String,
    pub kind: TunnelKind,
    pub config: TunnelConfig,
    pub status: TunnelStatus,
    /// Address actually listening (local listener or server side)
    pub bound_address: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub failed_connections: u64,
    pub restart_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub options: TunnelOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelMetrics {
    pub tunnel_id: String,
    pub status: TunnelStatus,
    pub uptime_secs: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Average over the tunnel's uptime, both directions
    pub throughput_bps: f64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub failed_connections: u64,
    pub error_rate: f64,
    pub health: TunnelHealth,
}
