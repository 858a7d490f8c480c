//! Config file on disk
//!
//! `~/.ssh-broker/config.json` (`%APPDATA%\ssh-broker` on Windows). The
//! session database lives next to it unless the config points elsewhere.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::types::BrokerConfig;
use crate::error::BrokerError;

const DIR_NAME: &str = "ssh-broker";

pub fn config_dir() -> Result<PathBuf, BrokerError> {
    #[cfg(windows)]
    let dir = dirs::config_dir().map(|d| d.join(DIR_NAME));
    #[cfg(not(windows))]
    let dir = dirs::home_dir().map(|h| h.join(format!(".{}", DIR_NAME)));

    dir.ok_or_else(|| BrokerError::Storage("cannot locate a home directory".into()))
}

pub fn config_file() -> Result<PathBuf, BrokerError> {
    Ok(config_dir()?.join("config.json"))
}

pub fn sessions_db_file() -> Result<PathBuf, BrokerError> {
    Ok(config_dir()?.join("sessions.redb"))
}

/// A broker config file; everything read or written through it is validated
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> Result<Self, BrokerError> {
        Ok(Self::at(config_file()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file means defaults; an unreadable or invalid one is an error
    pub async fn load(&self) -> Result<BrokerConfig, BrokerError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", self.path.display());
                return Ok(BrokerConfig::default());
            }
            Err(e) => {
                return Err(BrokerError::Storage(format!(
                    "reading {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let config: BrokerConfig = serde_json::from_str(&contents)
            .map_err(|e| BrokerError::Config(format!("{}: {}", self.path.display(), e)))?;
        config
            .validate()
            .map_err(|e| e.context(self.path.display()))?;
        info!("Loaded broker config from {}", self.path.display());
        Ok(config)
    }

    /// Write through a temp file and rename, so readers never see half a file
    pub async fn save(&self, config: &BrokerConfig) -> Result<(), BrokerError> {
        config.validate()?;
        let json = serde_json::to_vec_pretty(config)
            .map_err(|e| BrokerError::Config(e.to_string()))?;

        let io = |e: std::io::Error| BrokerError::Storage(format!("{}: {}", self.path.display(), e));
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(io)?;
        }
        let staging = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&staging).await.map_err(io)?;
        file.write_all(&json).await.map_err(io)?;
        file.sync_all().await.map_err(io)?;
        fs::rename(&staging, &self.path).await.map_err(io)?;
        Ok(())
    }
}
