//! Jump Host Module
//!
//! Multi-hop connections to targets that are only reachable through
//! intermediate servers.

mod cache;
mod manager;
mod types;
mod validate;

pub use cache::PathCache;
pub use manager::JumpHostManager;
pub use types::{
    HopConfig, HopResult, JumpChain, JumpChainConfig, JumpChainStatus, JumpStrategy,
    ValidationResult, DEFAULT_CACHE_TTL_SECS,
};
pub use validate::validate_jump_chain;
