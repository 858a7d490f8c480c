//! Session Management Module
//!
//! Durable snapshots of connections and the resources on them, with
//! restore and policy-driven auto-recovery:
//! - redb-backed storage with a typed resource table
//! - Per-session recovery loops with immediate, linear or exponential backoff
//! - Recovery state changes published on a broadcast channel

mod manager;
mod recovery;
mod store;
mod types;

pub use manager::SessionManager;
pub use recovery::recovery_delay;
pub use store::{MemorySessionStore, RedbSessionStore, SessionStore};
pub use types::{
    PersistOptions, PortForwardRule, RecoveryPolicy, RecoveryResult, RecoveryState,
    RecoveryStrategy, SessionData, SessionEvent, StoredTunnel,
};
