//! Port Forwarding Module
//!
//! Local (-L), remote (-R) and dynamic SOCKS (-D) tunnels over pooled
//! connections.

mod dynamic;
pub mod events;
mod local;
mod manager;
mod relay;
pub mod socks;
mod remote;
mod types;

pub use events::{TunnelEvent, TunnelEventBus};
pub use manager::{restart_delay, TunnelManager};
pub use relay::{spawn_relay, RelayOutcome};
pub use types::{
    ActiveGuard, TunnelConfig, TunnelCounters, TunnelHealth, TunnelInfo, TunnelKind, TunnelMetrics,
    TunnelOptions, TunnelStatus,
};

/// Why a tunnel's listener loop returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TunnelExit {
    /// Explicit close
    Cancelled,
    /// The owning connection left the pool
    ConnectionLost,
    /// Transient failure, eligible for restart
    Failed(String),
}
