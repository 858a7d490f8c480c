//! Configuration Management Module
//!
//! Broker settings and their JSON file storage.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, sessions_db_file, ConfigStorage};
pub use types::{
    BrokerConfig, HealthConfig, HostKeyConfig, PoolConfig, SessionDefaults, TunnelDefaults,
    CONFIG_VERSION,
};
