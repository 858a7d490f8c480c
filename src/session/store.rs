//! Session Persistence
//!
//! Durable storage for sessions so they survive process restarts. Each
//! session is one record; its secondary resources (tunnels, forward rules,
//! jump chain) live in a child table keyed by (session id, resource kind), so
//! a session whose resource records are missing still loads.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use redb::ReadableTable;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::types::{PortForwardRule, SessionData, StoredTunnel};
use crate::error::BrokerError;
use crate::jump::JumpChainConfig;

/// Session storage interface
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Save or replace a session with all of its resources
    async fn save(&self, session: &SessionData) -> Result<(), BrokerError>;

    async fn load(&self, session_id: &str) -> Result<Option<SessionData>, BrokerError>;

    async fn load_all(&self) -> Result<Vec<SessionData>, BrokerError>;

    /// Delete a session and its resources. Missing sessions are not an error.
    async fn delete(&self, session_id: &str) -> Result<(), BrokerError>;
}

/// Non-durable store
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, SessionData>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &SessionData) -> Result<(), BrokerError> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionData>, BrokerError> {
        Ok(self.sessions.get(session_id).map(|s| s.value().clone()))
    }

    async fn load_all(&self) -> Result<Vec<SessionData>, BrokerError> {
        Ok(self.sessions.iter().map(|s| s.value().clone()).collect())
    }

    async fn delete(&self, session_id: &str) -> Result<(), BrokerError> {
        self.sessions.remove(session_id);
        Ok(())
    }
}

const SESSIONS_TABLE: redb::TableDefinition<&str, &[u8]> = redb::TableDefinition::new("sessions");

const RESOURCES_TABLE: redb::TableDefinition<(&str, &str), &[u8]> =
    redb::TableDefinition::new("session_resources");

const KIND_TUNNELS: &str = "tunnels";
const KIND_PORT_FORWARDS: &str = "port_forwards";
const KIND_JUMP_CHAIN: &str = "jump_chain";
const RESOURCE_KINDS: [&str; 3] = [KIND_TUNNELS, KIND_PORT_FORWARDS, KIND_JUMP_CHAIN];

fn storage_err(what: &str, e: impl std::fmt::Display) -> BrokerError {
    BrokerError::Storage(format!("{}: {}", what, e))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, BrokerError> {
    rmp_serde::to_vec_named(value)
        .map_err(|e| BrokerError::Storage(format!("Failed to serialize session: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BrokerError> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| BrokerError::Storage(format!("Failed to deserialize session: {}", e)))
}

/// redb-backed session store
pub struct RedbSessionStore {
    db: redb::Database,
}

impl RedbSessionStore {
    pub fn open(db_path: &Path) -> Result<Self, BrokerError> {
        info!("Opening session store at: {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| storage_err("Failed to create session directory", e))?;
        }
        let db = redb::Database::create(db_path)
            .map_err(|e| storage_err("Failed to create session database", e))?;

        // Ensure tables exist
        let write_txn = db
            .begin_write()
            .map_err(|e| storage_err("Failed to begin write transaction", e))?;
        {
            write_txn
                .open_table(SESSIONS_TABLE)
                .map_err(|e| storage_err("Failed to open sessions table", e))?;
            write_txn
                .open_table(RESOURCES_TABLE)
                .map_err(|e| storage_err("Failed to open resources table", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| storage_err("Failed to commit transaction", e))?;

        debug!("Session store initialized");
        Ok(Self { db })
    }

    fn read_session(
        sessions: &impl ReadableTable<&'static str, &'static [u8]>,
        resources: &impl ReadableTable<(&'static str, &'static str), &'static [u8]>,
        session_id: &str,
    ) -> Result<Option<SessionData>, BrokerError> {
        let Some(record) = sessions
            .get(session_id)
            .map_err(|e| storage_err("Failed to read session", e))?
        else {
            return Ok(None);
        };
        let mut session: SessionData = decode(record.value())?;

        for kind in RESOURCE_KINDS {
            let Some(value) = resources
                .get((session_id, kind))
                .map_err(|e| storage_err("Failed to read session resource", e))?
            else {
                continue;
            };
            // A resource that no longer decodes is dropped rather than
            // failing the whole session
            let bytes = value.value();
            let applied = match kind {
                KIND_TUNNELS => {
                    decode::<Vec<StoredTunnel>>(bytes).map(|v| session.tunnels = v)
                }
                KIND_PORT_FORWARDS => {
                    decode::<Vec<PortForwardRule>>(bytes).map(|v| session.port_forwards = v)
                }
                _ => decode::<JumpChainConfig>(bytes).map(|v| session.jump_chain = Some(v)),
            };
            if let Err(e) = applied {
                warn!("Skipping {} of session {}: {}", kind, session_id, e);
            }
        }
        Ok(Some(session))
    }
}

#[async_trait]
impl SessionStore for RedbSessionStore {
    async fn save(&self, session: &SessionData) -> Result<(), BrokerError> {
        let mut record = session.clone();
        let tunnels = std::mem::take(&mut record.tunnels);
        let port_forwards = std::mem::take(&mut record.port_forwards);
        let jump_chain = record.jump_chain.take();

        let record_bytes = encode(&record)?;
        let resources: Vec<(&str, Option<Vec<u8>>)> = vec![
            (
                KIND_TUNNELS,
                (!tunnels.is_empty()).then(|| encode(&tunnels)).transpose()?,
            ),
            (
                KIND_PORT_FORWARDS,
                (!port_forwards.is_empty()).then(|| encode(&port_forwards)).transpose()?,
            ),
            (KIND_JUMP_CHAIN, jump_chain.as_ref().map(encode).transpose()?),
        ];

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| storage_err("Failed to begin write transaction", e))?;
        {
            let mut sessions = write_txn
                .open_table(SESSIONS_TABLE)
                .map_err(|e| storage_err("Failed to open sessions table", e))?;
            sessions
                .insert(session.id.as_str(), record_bytes.as_slice())
                .map_err(|e| storage_err("Failed to insert session", e))?;

            let mut table = write_txn
                .open_table(RESOURCES_TABLE)
                .map_err(|e| storage_err("Failed to open resources table", e))?;
            for (kind, bytes) in &resources {
                let key = (session.id.as_str(), *kind);
                match bytes {
                    Some(bytes) => {
                        table
                            .insert(key, bytes.as_slice())
                            .map_err(|e| storage_err("Failed to insert resource", e))?;
                    }
                    None => {
                        table
                            .remove(key)
                            .map_err(|e| storage_err("Failed to remove resource", e))?;
                    }
                }
            }
        }
        write_txn
            .commit()
            .map_err(|e| storage_err("Failed to commit transaction", e))?;

        debug!("Session {} saved", session.id);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionData>, BrokerError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| storage_err("Failed to begin read transaction", e))?;
        let sessions = read_txn
            .open_table(SESSIONS_TABLE)
            .map_err(|e| storage_err("Failed to open sessions table", e))?;
        let resources = read_txn
            .open_table(RESOURCES_TABLE)
            .map_err(|e| storage_err("Failed to open resources table", e))?;

        Self::read_session(&sessions, &resources, session_id)
    }

    async fn load_all(&self) -> Result<Vec<SessionData>, BrokerError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| storage_err("Failed to begin read transaction", e))?;
        let sessions = read_txn
            .open_table(SESSIONS_TABLE)
            .map_err(|e| storage_err("Failed to open sessions table", e))?;
        let resources = read_txn
            .open_table(RESOURCES_TABLE)
            .map_err(|e| storage_err("Failed to open resources table", e))?;

        let mut ids = Vec::new();
        for item in sessions
            .iter()
            .map_err(|e| storage_err("Failed to iterate sessions", e))?
        {
            let (key, _) = item.map_err(|e| storage_err("Failed to read entry", e))?;
            ids.push(key.value().to_string());
        }

        let mut loaded = Vec::with_capacity(ids.len());
        for id in ids {
            match Self::read_session(&sessions, &resources, &id) {
                Ok(Some(session)) => loaded.push(session),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable session {}: {}", id, e),
            }
        }
        info!("Loaded {} stored sessions", loaded.len());
        Ok(loaded)
    }

    async fn delete(&self, session_id: &str) -> Result<(), BrokerError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| storage_err("Failed to begin write transaction", e))?;
        {
            let mut sessions = write_txn
                .open_table(SESSIONS_TABLE)
                .map_err(|e| storage_err("Failed to open sessions table", e))?;
            sessions
                .remove(session_id)
                .map_err(|e| storage_err("Failed to remove session", e))?;

            let mut resources = write_txn
                .open_table(RESOURCES_TABLE)
                .map_err(|e| storage_err("Failed to open resources table", e))?;
            for kind in RESOURCE_KINDS {
                resources
                    .remove((session_id, kind))
                    .map_err(|e| storage_err("Failed to remove resource", e))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| storage_err("Failed to commit transaction", e))?;

        debug!("Session {} deleted from store", session_id);
        Ok(())
    }
}
