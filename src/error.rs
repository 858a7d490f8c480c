//! Broker error taxonomy
//!
//! Every manager returns `BrokerError`. The variants split into permanent
//! failures (bad input, bad credentials, policy) and transient ones that a
//! caller or the session recovery loop may retry.

use thiserror::Error;

use crate::ssh::SshError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Malformed or inconsistent input
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Host not allowed: {0}")]
    HostNotAllowed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Probe failed: {0}")]
    ProbeFailure(String),

    /// Network-level failure reaching a host
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Latency threshold exceeded: {0}")]
    LatencyExceeded(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Bind failed: {0}")]
    Bind(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Connection limit reached ({current}/{max})")]
    LimitReached { current: usize, max: usize },
}

impl BrokerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        BrokerError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout(_)
                | BrokerError::ConnectionFailed(_)
                | BrokerError::ProbeFailure(_)
        )
    }

    /// Prefix the message with context (used to name the failing hop of a chain)
    pub fn context(self, prefix: impl std::fmt::Display) -> Self {
        match self {
            BrokerError::Config(m) => BrokerError::Config(format!("{}: {}", prefix, m)),
            BrokerError::Auth(m) => BrokerError::Auth(format!("{}: {}", prefix, m)),
            BrokerError::HostNotAllowed(m) => {
                BrokerError::HostNotAllowed(format!("{}: {}", prefix, m))
            }
            BrokerError::Timeout(m) => BrokerError::Timeout(format!("{}: {}", prefix, m)),
            BrokerError::ProbeFailure(m) => BrokerError::ProbeFailure(format!("{}: {}", prefix, m)),
            BrokerError::ConnectionFailed(m) => {
                BrokerError::ConnectionFailed(format!("{}: {}", prefix, m))
            }
            BrokerError::LatencyExceeded(m) => {
                BrokerError::LatencyExceeded(format!("{}: {}", prefix, m))
            }
            BrokerError::Bind(m) => BrokerError::Bind(format!("{}: {}", prefix, m)),
            BrokerError::Tunnel(m) => BrokerError::Tunnel(format!("{}: {}", prefix, m)),
            BrokerError::Storage(m) => BrokerError::Storage(format!("{}: {}", prefix, m)),
            other => other,
        }
    }
}

impl From<SshError> for BrokerError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::AuthenticationFailed(m) | SshError::KeyError(m) => BrokerError::Auth(m),
            SshError::Timeout(m) => BrokerError::Timeout(m),
            SshError::HostKeyRejected(m) => BrokerError::HostNotAllowed(m),
            other => BrokerError::ConnectionFailed(other.to_string()),
        }
    }
}

impl serde::Serialize for BrokerError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
