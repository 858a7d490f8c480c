//! SSH connection pool
//!
//! Authenticated connections keyed by (host, port, username), with health
//! probing, idle pruning and cascading teardown of tunnelled children.

mod allowlist;
mod health;
mod manager;
mod types;

pub use allowlist::HostAllowList;
pub use health::{classify, HealthTracker};
pub use manager::{ConnectionEntry, ConnectionManager};
pub use types::{
    ConnectionCounters, ConnectionInfo, ConnectionStatus, HealthReport, HealthState, PoolKey,
    PoolStats,
};
