//! ssh-broker - pooled SSH connections and the resources built on them
//!
//! Four managers share one connection pool:
//! - `ConnectionManager`: authenticated connections, one per (host, port, user)
//! - `TunnelManager`: local, remote and SOCKS tunnels with auto-restart
//! - `JumpHostManager`: multi-hop chains with latency-aware path selection
//! - `SessionManager`: durable snapshots, restore and auto-recovery
//!
//! `Broker` wires them together and answers requests with `Envelope`s.

pub mod broker;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod forwarding;
pub mod jump;
pub mod session;
pub mod ssh;

#[cfg(test)]
mod test_utils;

pub use broker::{Broker, ConnectionRequest, JumpRequest, SessionRequest, TunnelRequest};
pub use envelope::Envelope;
pub use error::BrokerError;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging (`RUST_LOG`, default `info`)
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
