//! Jump chain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ssh::SshConfig;

/// Default lifetime of a cached path
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// One intermediate server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopConfig {
    #[serde(flatten)]
    pub ssh: SshConfig,
    /// Higher is preferred by the optimal and failover strategies
    #[serde(default)]
    pub priority: i32,
    /// Reject the chain if this hop's probe round trip is slower
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
}

impl HopConfig {
    pub fn new(ssh: SshConfig) -> Self {
        Self {
            ssh,
            priority: 0,
            max_latency_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_latency(mut self, ms: u64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JumpStrategy {
    /// Hops in the order given
    #[default]
    Sequential,
    /// Probe hops, rank by (priority desc, latency asc)
    Optimal,
    /// Sequential, then once more ordered by priority
    Failover,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpChainConfig {
    pub target: SshConfig,
    #[serde(default)]
    pub hops: Vec<HopConfig>,
    #[serde(default)]
    pub strategy: JumpStrategy,
    /// Sum of hop latencies must not exceed this
    #[serde(default)]
    pub max_total_latency_ms: Option<u64>,
    /// Probe hops concurrently (optimal strategy)
    #[serde(default)]
    pub parallel_probe: bool,
    /// Remember the successful hop order for this target host
    #[serde(default)]
    pub cache_path: bool,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
}

impl JumpChainConfig {
    pub fn new(target: SshConfig, hops: Vec<HopConfig>) -> Self {
        Self {
            target,
            hops,
            strategy: JumpStrategy::Sequential,
            max_total_latency_ms: None,
            parallel_probe: false,
            cache_path: false,
            cache_ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JumpChainStatus {
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// A hop as actually used
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HopResult {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub connection_id: String,
    pub priority: i32,
    /// Keepalive round trip on the hop's connection
    pub latency_ms: u64,
    /// Wall time to obtain the hop's connection
    pub connect_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JumpChain {
    pub id: String,
    /// `user@host:port` of the target
    pub target: String,
    pub target_connection_id: Option<String>,
    pub hops: Vec<HopResult>,
    pub status: JumpChainStatus,
    pub strategy: JumpStrategy,
    pub total_latency_ms: u64,
    pub from_cache: bool,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}
