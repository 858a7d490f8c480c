//! Session Manager
//!
//! A session is a durable snapshot of a connection's configuration plus the
//! resources layered on it (tunnels, forward rules, jump chain). Restoring a
//! session reconnects and recreates those resources; only the reconnect is
//! fatal, everything else degrades to a warning.
//!
//! Sessions with `auto_recover` get a recovery loop: every health-check
//! interval the session's connection is probed, and a lost or failed
//! connection moves the session to `Recovering`, where up to
//! `max_recovery_attempts` restores are tried on the policy's backoff
//! schedule. Running out of attempts moves it to `Failed` and stops the loop.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::recovery::recovery_delay;
use super::store::SessionStore;
use super::types::{
    PersistOptions, PortForwardRule, RecoveryPolicy, RecoveryResult, RecoveryState, SessionData,
    SessionEvent, StoredTunnel,
};
use crate::config::SessionDefaults;
use crate::connection::{ConnectionManager, ConnectionStatus, HealthState, PoolKey};
use crate::error::BrokerError;
use crate::forwarding::{TunnelConfig, TunnelManager, TunnelStatus};
use crate::jump::{JumpChain, JumpChainStatus, JumpHostManager};

const EVENT_BUFFER: usize = 256;

struct RecoveryLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SessionManager {
    connections: Arc<ConnectionManager>,
    tunnels: Arc<TunnelManager>,
    jumps: Arc<JumpHostManager>,
    store: Arc<dyn SessionStore>,
    defaults: SessionDefaults,
    sessions: DashMap<String, SessionData>,
    recovery: DashMap<String, RecoveryLoop>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        connections: Arc<ConnectionManager>,
        tunnels: Arc<TunnelManager>,
        jumps: Arc<JumpHostManager>,
        store: Arc<dyn SessionStore>,
        defaults: SessionDefaults,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            connections,
            tunnels,
            jumps,
            store,
            defaults,
            sessions: DashMap::new(),
            recovery: DashMap::new(),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("No session event subscribers");
        }
    }

    /// Snapshot a live connection into a new session
    pub async fn persist_session(
        self: &Arc<Self>,
        options: PersistOptions,
    ) -> Result<SessionData, BrokerError> {
        let entry = self.connections.entry(&options.connection_id)?;
        let policy = options
            .policy
            .unwrap_or_else(|| RecoveryPolicy::from_defaults(&self.defaults));
        let tunnels = if options.include_tunnels {
            self.snapshot_tunnels(&entry.id, &options.port_forwards)
        } else {
            Vec::new()
        };

        let now = Utc::now();
        let session = SessionData {
            id: uuid::Uuid::new_v4().to_string(),
            connection_config: entry.config.clone(),
            connection_id: Some(entry.id.clone()),
            created_at: now,
            last_active: now,
            persist: options.persist,
            policy,
            recovery_count: 0,
            recovery_state: RecoveryState::Stable,
            counters: entry.counters(),
            capture_tunnels: options.include_tunnels,
            tunnels,
            port_forwards: options.port_forwards,
            jump_chain: options.jump_chain,
            jump_chain_id: None,
            last_error: None,
        };

        if session.persist {
            self.store.save(&session).await?;
        }
        self.sessions.insert(session.id.clone(), session.clone());
        if session.policy.auto_recover {
            self.arm_recovery(&session.id);
        }

        info!(
            "Session {} created for {} ({} tunnels, {} forward rules, persist={})",
            session.id,
            entry.key,
            session.tunnels.len(),
            session.port_forwards.len(),
            session.persist
        );
        Ok(session)
    }

    /// Active tunnels on the connection, minus those created from forward rules
    fn snapshot_tunnels(
        &self,
        connection_id: &str,
        rules: &[PortForwardRule],
    ) -> Vec<StoredTunnel> {
        self.tunnels
            .list_tunnels(Some(connection_id))
            .into_iter()
            .filter(|t| t.status == TunnelStatus::Active)
            .filter(|t| !rules.iter().any(|r| r.config == t.config))
            .map(|t| StoredTunnel {
                config: t.config,
                options: t.options,
            })
            .collect()
    }

    /// Reconnect and recreate the session's resources
    ///
    /// Fails only if the connection cannot be obtained. Jump chain, tunnel and
    /// forward-rule failures are returned as warnings.
    pub async fn restore_session(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<RecoveryResult, BrokerError> {
        let session = self.get_session(session_id)?;
        info!(
            "Restoring session {} ({})",
            session_id,
            session.connection_config.address()
        );

        let mut warnings = Vec::new();

        // A session whose connection is the chain's target is only reachable
        // through the hops, so the chain comes first.
        let routed = session
            .jump_chain
            .as_ref()
            .is_some_and(|c| PoolKey::from(&c.target) == PoolKey::from(&session.connection_config));
        let mut chain = if routed {
            self.restore_chain(&session, &mut warnings).await
        } else {
            None
        };

        let chained_target = chain
            .as_ref()
            .filter(|_| routed)
            .and_then(|c| c.target_connection_id.as_deref())
            .and_then(|id| self.connections.entry(id).ok());
        let connection = match chained_target {
            Some(entry) => entry,
            None => self
                .connections
                .get_or_create(session.connection_config.clone())
                .await
                .map_err(|e| {
                    warn!("Session {} could not reconnect: {}", session_id, e);
                    e
                })?,
        };

        if !routed {
            chain = self.restore_chain(&session, &mut warnings).await;
        }
        let jump_chain_id = chain.map(|c| c.id);

        let active: Vec<TunnelConfig> = self
            .tunnels
            .list_tunnels(Some(&connection.id))
            .into_iter()
            .filter(|t| t.status == TunnelStatus::Active)
            .map(|t| t.config)
            .collect();
        let stored = session
            .tunnels
            .iter()
            .map(|t| (t.config.clone(), t.options.clone(), format!("tunnel {}", t.config)));
        let rules = session.port_forwards.iter().filter(|r| r.enabled).map(|r| {
            let label = format!("port forward {}", r.name);
            (r.config.clone(), r.tunnel_options(), label)
        });

        let mut restored_tunnels = Vec::new();
        for (config, options, label) in stored.chain(rules) {
            if active.contains(&config) {
                debug!("Session {}: {} already active", session_id, label);
                continue;
            }
            match self.tunnels.create_tunnel(&connection.id, config, options).await {
                Ok(info) => restored_tunnels.push(info.id),
                Err(e) => warnings.push(format!("{}: {}", label, e)),
            }
        }

        let (updated, previous_state) = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| BrokerError::not_found("session", session_id))?;
            let previous_state = entry.recovery_state;
            entry.connection_id = Some(connection.id.clone());
            entry.jump_chain_id = jump_chain_id.clone();
            entry.recovery_count += 1;
            entry.recovery_state = RecoveryState::Stable;
            entry.last_active = Utc::now();
            entry.counters = connection.counters();
            entry.last_error = None;
            (entry.clone(), previous_state)
        };
        if updated.persist {
            if let Err(e) = self.store.save(&updated).await {
                warnings.push(format!("storage: {}", e));
            }
        }

        for warning in &warnings {
            warn!("Session {} partially restored: {}", session_id, warning);
        }
        if previous_state != RecoveryState::Stable {
            self.emit(SessionEvent::StateChanged {
                session_id: session_id.to_string(),
                state: RecoveryState::Stable,
                error: None,
            });
        }
        self.emit(SessionEvent::Recovered {
            session_id: session_id.to_string(),
            connection_id: connection.id.clone(),
            warnings: warnings.clone(),
        });
        if updated.policy.auto_recover {
            self.arm_recovery(session_id);
        }

        info!(
            "Session {} restored on {} (recovery #{}, {} tunnels)",
            session_id,
            connection.id,
            updated.recovery_count,
            restored_tunnels.len()
        );
        Ok(RecoveryResult {
            session_id: session_id.to_string(),
            connection_id: connection.id.clone(),
            recovery_count: updated.recovery_count,
            jump_chain_id,
            restored_tunnels,
            warnings,
        })
    }

    /// The previous chain, if it is still connected; otherwise it is closed
    /// The session's previous chain if it is still up, else a fresh one
    async fn restore_chain(
        &self,
        session: &SessionData,
        warnings: &mut Vec<String>,
    ) -> Option<JumpChain> {
        let config = session.jump_chain.as_ref()?;
        if let Some(chain) = self.live_chain(session.jump_chain_id.as_deref()).await {
            return Some(chain);
        }
        match self.jumps.connect_through_jumps(config.clone()).await {
            Ok(chain) => Some(chain),
            Err(e) => {
                warnings.push(format!("jump chain: {}", e));
                None
            }
        }
    }

    async fn live_chain(&self, chain_id: Option<&str>) -> Option<JumpChain> {
        let chain = self.jumps.get_jump_chain_status(chain_id?).ok()?;
        let target_live = chain
            .target_connection_id
            .as_deref()
            .is_some_and(|id| self.connection_live(id));

        if chain.status == JumpChainStatus::Connected && target_live {
            return Some(chain);
        }
        if let Err(e) = self.jumps.close_jump_chain(&chain.id).await {
            debug!("Stale jump chain {}: {}", chain.id, e);
        }
        None
    }

    fn arm_recovery(self: &Arc<Self>, session_id: &str) {
        if let Some(existing) = self.recovery.get(session_id) {
            if !existing.task.is_finished() {
                return;
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(recovery_loop(
            Arc::downgrade(self),
            session_id.to_string(),
            self.defaults.health_check_interval(),
            cancel.clone(),
        ));
        self.recovery
            .insert(session_id.to_string(), RecoveryLoop { cancel, task });
        debug!("Auto-recovery armed for session {}", session_id);
    }

    async fn connection_healthy(&self, session_id: &str) -> bool {
        let Some(connection_id) = self
            .sessions
            .get(session_id)
            .and_then(|s| s.connection_id.clone())
        else {
            return false;
        };
        match self.connections.health_check(&connection_id).await {
            Ok(report) => report.state != HealthState::Failed,
            Err(_) => false,
        }
    }

    /// Retry restores on the policy's schedule. `false` stops the loop.
    async fn recover(self: &Arc<Self>, session_id: &str, cancel: &CancellationToken) -> bool {
        let Some(policy) = self.sessions.get(session_id).map(|s| s.policy.clone()) else {
            return false;
        };
        warn!("Session {} lost its connection, recovering", session_id);
        self.set_state(session_id, RecoveryState::Recovering, None).await;

        let max_attempts = policy.max_recovery_attempts;
        let mut last_error = String::from("no recovery attempts allowed");
        for attempt in 1..=max_attempts {
            let delay = recovery_delay(
                policy.recovery_strategy,
                attempt,
                policy.recovery_backoff_ms,
                self.defaults.max_backoff_ms,
            );
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            info!(
                "Session {} recovery attempt {}/{}",
                session_id, attempt, max_attempts
            );
            self.emit(SessionEvent::RecoveryAttempt {
                session_id: session_id.to_string(),
                attempt,
                max_attempts,
                delay_ms: delay.as_millis() as u64,
            });

            match self.restore_session(session_id).await {
                Ok(_) => return true,
                Err(BrokerError::NotFound { .. }) => return false,
                Err(e) => last_error = e.to_string(),
            }
        }

        error!(
            "Session {} recovery failed after {} attempts: {}",
            session_id, max_attempts, last_error
        );
        self.set_state(session_id, RecoveryState::Failed, Some(last_error))
            .await;
        false
    }

    async fn set_state(&self, session_id: &str, state: RecoveryState, error: Option<String>) {
        let updated = match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.recovery_state = state;
                if error.is_some() {
                    session.last_error = error.clone();
                }
                session.clone()
            }
            None => return,
        };
        if updated.persist {
            if let Err(e) = self.store.save(&updated).await {
                warn!("Failed to store state of session {}: {}", session_id, e);
            }
        }
        self.emit(SessionEvent::StateChanged {
            session_id: session_id.to_string(),
            state,
            error,
        });
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionData, BrokerError> {
        self.sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| BrokerError::not_found("session", session_id))
    }

    /// Sessions by creation time. Active means backed by a live connection.
    pub fn list_sessions(&self, active_only: bool) -> Vec<SessionData> {
        let mut list: Vec<SessionData> = self
            .sessions
            .iter()
            .map(|s| s.value().clone())
            .filter(|s| !active_only || self.is_active(s))
            .collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    fn is_active(&self, session: &SessionData) -> bool {
        session
            .connection_id
            .as_deref()
            .is_some_and(|id| self.connection_live(id))
    }

    fn connection_live(&self, connection_id: &str) -> bool {
        self.connections
            .get_connection(connection_id)
            .is_some_and(|c| {
                matches!(c.status, ConnectionStatus::Connected | ConnectionStatus::Degraded)
            })
    }

    /// Refresh the snapshot from the live connection and write it out
    pub async fn save_session_state(&self, session_id: &str) -> Result<SessionData, BrokerError> {
        let session = self.get_session(session_id)?;
        let live = session
            .connection_id
            .as_deref()
            .and_then(|id| self.connections.entry(id).ok())
            .filter(|entry| entry.is_live());
        let tunnels = match &live {
            Some(entry) if session.capture_tunnels => {
                Some(self.snapshot_tunnels(&entry.id, &session.port_forwards))
            }
            _ => None,
        };

        let updated = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| BrokerError::not_found("session", session_id))?;
            entry.last_active = Utc::now();
            if let Some(connection) = &live {
                entry.counters = connection.counters();
            }
            if let Some(tunnels) = tunnels {
                entry.tunnels = tunnels;
            }
            entry.clone()
        };
        if updated.persist {
            self.store.save(&updated).await?;
        }
        debug!("Session {} state saved", session_id);
        Ok(updated)
    }

    /// Replace the in-memory session with its stored copy
    pub async fn load_session_state(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<SessionData, BrokerError> {
        let mut session = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| BrokerError::not_found("session", session_id))?;

        // The stored connection id is only meaningful within this process
        session.connection_id = self
            .sessions
            .get(session_id)
            .and_then(|s| s.connection_id.clone());
        self.sessions.insert(session.id.clone(), session.clone());

        if session.policy.auto_recover && session.recovery_state != RecoveryState::Failed {
            self.arm_recovery(session_id);
        }
        Ok(session)
    }

    /// Load every stored session and re-arm auto-recovery
    pub async fn load_persisted_sessions(self: &Arc<Self>) -> Result<usize, BrokerError> {
        let stored = self.store.load_all().await?;
        let mut loaded = 0;
        for mut session in stored {
            if self.sessions.contains_key(&session.id) {
                continue;
            }
            session.connection_id = None;
            session.jump_chain_id = None;
            if session.recovery_state == RecoveryState::Recovering {
                session.recovery_state = RecoveryState::Stable;
            }
            let arm = session.policy.auto_recover && session.recovery_state != RecoveryState::Failed;
            let id = session.id.clone();
            self.sessions.insert(id.clone(), session);
            if arm {
                self.arm_recovery(&id);
            }
            loaded += 1;
        }
        info!("Loaded {} persisted sessions", loaded);
        Ok(loaded)
    }

    /// Delete non-persisted sessions inactive for more than `max_age_days`
    pub async fn cleanup_expired_sessions(&self, max_age_days: u64) -> Vec<String> {
        let cutoff = i64::try_from(max_age_days)
            .ok()
            .and_then(TimeDelta::try_days)
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            debug!("No session can be older than {} days", max_age_days);
            return Vec::new();
        };
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| !s.persist && s.last_active < cutoff)
            .map(|s| s.key().clone())
            .collect();

        for id in &expired {
            if let Err(e) = self.delete_session(id).await {
                warn!("Failed to delete expired session {}: {}", id, e);
            }
        }
        if !expired.is_empty() {
            info!("Removed {} expired sessions", expired.len());
        }
        expired
    }

    /// Stop recovery and delete the session with its stored resources
    ///
    /// The connection and its tunnels stay up.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), BrokerError> {
        if let Some((_, recovery)) = self.recovery.remove(session_id) {
            recovery.cancel.cancel();
        }
        let removed = self.sessions.remove(session_id);
        if removed.is_none() && self.store.load(session_id).await?.is_none() {
            return Err(BrokerError::not_found("session", session_id));
        }
        self.store.delete(session_id).await?;
        info!("Session {} deleted", session_id);
        Ok(())
    }

    /// Cancel every recovery loop
    pub fn shutdown(&self) {
        for entry in self.recovery.iter() {
            entry.value().cancel.cancel();
        }
        self.recovery.clear();
    }
}

async fn recovery_loop(
    manager: Weak<SessionManager>,
    session_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if manager.connection_healthy(&session_id).await {
            continue;
        }
        if !manager.recover(&session_id, &cancel).await {
            break;
        }
        ticker.reset();
    }
    debug!("Recovery loop for session {} stopped", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthConfig, PoolConfig, TunnelDefaults};
    use crate::forwarding::TunnelOptions;
    use crate::jump::{HopConfig, JumpChainConfig};
    use crate::session::store::{MemorySessionStore, RedbSessionStore};
    use crate::session::types::RecoveryStrategy;
    use crate::test_utils::{password_config, FakeConnector, FakeHost};
    use tokio::sync::broadcast::error::TryRecvError;

    struct Fixture {
        connector: Arc<FakeConnector>,
        connections: Arc<ConnectionManager>,
        tunnels: Arc<TunnelManager>,
        jumps: Arc<JumpHostManager>,
        store: Arc<dyn SessionStore>,
        sessions: Arc<SessionManager>,
    }

    fn defaults() -> SessionDefaults {
        SessionDefaults {
            health_check_interval_secs: 1,
            ..Default::default()
        }
    }

    fn fixture_with_store(store: Arc<dyn SessionStore>) -> Fixture {
        let connector = FakeConnector::new();
        let connections = ConnectionManager::new(
            connector.clone(),
            PoolConfig::default(),
            HealthConfig::default(),
        )
        .unwrap();
        let tunnels = Arc::new(TunnelManager::new(connections.clone(), TunnelDefaults::default()));
        let jumps = Arc::new(JumpHostManager::new(connections.clone()));
        let sessions = SessionManager::new(
            connections.clone(),
            tunnels.clone(),
            jumps.clone(),
            store.clone(),
            defaults(),
        );
        Fixture {
            connector,
            connections,
            tunnels,
            jumps,
            store,
            sessions,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_store(Arc::new(MemorySessionStore::new()))
    }

    fn auto_recover(max_attempts: u32) -> RecoveryPolicy {
        RecoveryPolicy {
            auto_recover: true,
            max_recovery_attempts: max_attempts,
            recovery_strategy: RecoveryStrategy::Exponential,
            recovery_backoff_ms: 5000,
        }
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<SessionEvent>, f: F) -> SessionEvent
    where
        F: Fn(&SessionEvent) -> bool,
    {
        loop {
            let event = rx.recv().await.unwrap();
            if f(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn persist_snapshots_config_and_tunnels() {
        let f = fixture();
        let conn = f.connections.connect(password_config("app.example")).await.unwrap();
        let options = TunnelOptions {
            keep_alive: true,
            ..Default::default()
        };
        f.tunnels
            .create_tunnel(&conn.id, TunnelConfig::local(0, "db", 5432), options)
            .await
            .unwrap();

        let mut request = PersistOptions::new(&conn.id);
        request.include_tunnels = true;
        request.port_forwards = vec![PortForwardRule::new("socks", TunnelConfig::dynamic(0))];
        let session = f.sessions.persist_session(request).await.unwrap();

        assert_eq!(session.connection_config, password_config("app.example"));
        assert_eq!(session.connection_id.as_deref(), Some(conn.id.as_str()));
        assert_eq!(session.tunnels.len(), 1);
        assert_eq!(session.tunnels[0].config, TunnelConfig::local(0, "db", 5432));
        assert!(session.tunnels[0].options.keep_alive);
        assert!(f.store.load(&session.id).await.unwrap().is_some());

        let mut transient = PersistOptions::new(&conn.id);
        transient.persist = false;
        let transient = f.sessions.persist_session(transient).await.unwrap();
        assert!(f.store.load(&transient.id).await.unwrap().is_none());
        assert_eq!(f.sessions.list_sessions(false).len(), 2);
    }

    #[tokio::test]
    async fn persist_requires_known_connection() {
        let f = fixture();
        let err = f.sessions.persist_session(PersistOptions::new("nope")).await.err().unwrap();
        assert!(matches!(err, BrokerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn restore_reproduces_connection_and_tunnels() {
        let f = fixture();
        let conn = f.connections.connect(password_config("app.example")).await.unwrap();
        f.tunnels
            .create_tunnel(&conn.id, TunnelConfig::local(0, "db", 5432), TunnelOptions::default())
            .await
            .unwrap();
        let mut request = PersistOptions::new(&conn.id);
        request.include_tunnels = true;
        request.port_forwards = vec![PortForwardRule::new("socks", TunnelConfig::dynamic(0))];
        let session = f.sessions.persist_session(request).await.unwrap();

        f.connections.disconnect(&conn.id).await.unwrap();
        let result = f.sessions.restore_session(&session.id).await.unwrap();

        assert_ne!(result.connection_id, conn.id);
        assert_eq!(result.recovery_count, 1);
        assert!(!result.is_partial());
        assert_eq!(result.restored_tunnels.len(), 2);
        let restored = f.connections.entry(&result.connection_id).unwrap();
        assert_eq!(restored.config, session.connection_config);
        let active = f
            .tunnels
            .list_tunnels(Some(&result.connection_id))
            .into_iter()
            .filter(|t| t.status == TunnelStatus::Active)
            .count();
        assert_eq!(active, 2);

        // A second restore on the live connection does not duplicate tunnels
        let again = f.sessions.restore_session(&session.id).await.unwrap();
        assert_eq!(again.connection_id, result.connection_id);
        assert!(again.restored_tunnels.is_empty());
        assert_eq!(again.recovery_count, 2);
    }

    #[tokio::test]
    async fn restore_reaches_chained_target_through_its_hops() {
        let f = fixture();
        f.connector.set_host("hidden.db", FakeHost::tunnel_only());
        let chain_config = JumpChainConfig::new(
            password_config("hidden.db"),
            vec![HopConfig::new(password_config("bastion.example"))],
        );
        let chain = f.jumps.connect_through_jumps(chain_config.clone()).await.unwrap();
        let target_id = chain.target_connection_id.clone().unwrap();
        assert_eq!(
            f.connector.connect_log(),
            vec![
                ("bastion.example".to_string(), false),
                ("hidden.db".to_string(), true)
            ]
        );

        let mut request = PersistOptions::new(&target_id);
        request.jump_chain = Some(chain_config);
        let session = f.sessions.persist_session(request).await.unwrap();

        f.connector.kill("hidden.db");
        f.connections.disconnect(&target_id).await.ok();

        let result = f.sessions.restore_session(&session.id).await.unwrap();
        assert!(!result.is_partial(), "{:?}", result.warnings);
        assert_ne!(result.connection_id, target_id);
        let restored = f.connections.entry(&result.connection_id).unwrap();
        assert_eq!(restored.config, password_config("hidden.db"));
        assert_eq!(restored.via.as_deref(), Some(chain.hops[0].connection_id.as_str()));
        assert_eq!(f.connector.connect_count_for("hidden.db"), 2);

        let new_chain = f
            .jumps
            .get_jump_chain_status(result.jump_chain_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(
            new_chain.target_connection_id.as_deref(),
            Some(result.connection_id.as_str())
        );
    }

    #[tokio::test]
    async fn secondary_failures_are_warnings() {
        let f = fixture();
        f.connector.set_unreachable("bastion.example", true);
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let conn = f.connections.connect(password_config("app.example")).await.unwrap();
        let mut request = PersistOptions::new(&conn.id);
        request.port_forwards = vec![
            PortForwardRule::new("taken", TunnelConfig::local(port, "db", 5432)),
            PortForwardRule::new("socks", TunnelConfig::dynamic(0)),
        ];
        request.jump_chain = Some(JumpChainConfig::new(
            password_config("db.internal"),
            vec![HopConfig::new(password_config("bastion.example"))],
        ));
        let session = f.sessions.persist_session(request).await.unwrap();

        let result = f.sessions.restore_session(&session.id).await.unwrap();
        assert!(result.is_partial());
        assert_eq!(result.warnings.len(), 2);
        assert!(result.warnings[0].starts_with("jump chain: "));
        assert!(result.warnings[1].starts_with("port forward taken: "));
        assert_eq!(result.restored_tunnels.len(), 1);
        assert_eq!(
            f.sessions.get_session(&session.id).unwrap().recovery_state,
            RecoveryState::Stable
        );
    }

    #[tokio::test]
    async fn restore_fails_when_reconnect_fails() {
        let f = fixture();
        let conn = f.connections.connect(password_config("app.example")).await.unwrap();
        let session = f.sessions.persist_session(PersistOptions::new(&conn.id)).await.unwrap();

        f.connector.set_unreachable("app.example", true);
        f.connector.kill("app.example");
        f.connections.disconnect(&conn.id).await.ok();

        let err = f.sessions.restore_session(&session.id).await.err().unwrap();
        assert!(matches!(err, BrokerError::ConnectionFailed(_)));
        assert_eq!(f.sessions.get_session(&session.id).unwrap().recovery_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_backs_off_exponentially_then_fails() {
        let f = fixture();
        let conn = f.connections.connect(password_config("app.example")).await.unwrap();
        let mut request = PersistOptions::new(&conn.id);
        request.policy = Some(auto_recover(3));
        let session = f.sessions.persist_session(request).await.unwrap();
        let mut events = f.sessions.subscribe();

        f.connector.set_unreachable("app.example", true);
        f.connector.kill("app.example");

        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::StateChanged { state: RecoveryState::Recovering, .. })
        })
        .await;
        let detected = Instant::now();

        let mut offsets = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::RecoveryAttempt { .. } => offsets.push(detected.elapsed()),
                SessionEvent::StateChanged {
                    state: RecoveryState::Failed,
                    ..
                } => break,
                _ => {}
            }
        }
        assert_eq!(
            offsets,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(35)
            ]
        );

        let failed = f.sessions.get_session(&session.id).unwrap();
        assert_eq!(failed.recovery_state, RecoveryState::Failed);
        assert!(failed.last_error.is_some());
        assert_eq!(failed.recovery_count, 0);

        // No further automatic attempts
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_reconnects_after_drop() {
        let f = fixture();
        let conn = f.connections.connect(password_config("app.example")).await.unwrap();
        let mut request = PersistOptions::new(&conn.id);
        request.policy = Some(auto_recover(3));
        let session = f.sessions.persist_session(request).await.unwrap();
        let mut events = f.sessions.subscribe();

        f.connector.kill("app.example");
        let recovered = next_matching(&mut events, |e| matches!(e, SessionEvent::Recovered { .. })).await;

        let SessionEvent::Recovered { connection_id, .. } = recovered else {
            unreachable!()
        };
        assert_ne!(connection_id, conn.id);
        let current = f.sessions.get_session(&session.id).unwrap();
        assert_eq!(current.recovery_state, RecoveryState::Stable);
        assert_eq!(current.recovery_count, 1);
        assert_eq!(current.connection_id.as_deref(), Some(connection_id.as_str()));
        assert_eq!(f.connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_cancels_recovery() {
        let f = fixture();
        let conn = f.connections.connect(password_config("app.example")).await.unwrap();
        let mut request = PersistOptions::new(&conn.id);
        request.policy = Some(auto_recover(3));
        let session = f.sessions.persist_session(request).await.unwrap();
        let mut events = f.sessions.subscribe();

        f.sessions.delete_session(&session.id).await.unwrap();
        f.connector.kill("app.example");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(f.connector.connect_count(), 1);
        assert!(f.store.load(&session.id).await.unwrap().is_none());
        assert!(matches!(
            f.sessions.delete_session(&session.id).await,
            Err(BrokerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_transient_sessions() {
        let f = fixture();
        let conn = f.connections.connect(password_config("app.example")).await.unwrap();
        let mut transient = PersistOptions::new(&conn.id);
        transient.persist = false;
        let stale = f.sessions.persist_session(transient.clone()).await.unwrap();
        let fresh = f.sessions.persist_session(transient).await.unwrap();
        let durable = f.sessions.persist_session(PersistOptions::new(&conn.id)).await.unwrap();

        let long_ago = Utc::now() - chrono::Duration::days(10);
        for id in [&stale.id, &durable.id] {
            f.sessions.sessions.get_mut(id.as_str()).unwrap().last_active = long_ago;
        }

        let removed = f.sessions.cleanup_expired_sessions(7).await;
        assert_eq!(removed, vec![stale.id.clone()]);
        assert!(f.sessions.get_session(&fresh.id).is_ok());
        assert!(f.sessions.get_session(&durable.id).is_ok());
    }

    #[tokio::test]
    async fn cleanup_with_huge_age_expires_nothing() {
        let f = fixture();
        let conn = f.connections.connect(password_config("app.example")).await.unwrap();
        let mut transient = PersistOptions::new(&conn.id);
        transient.persist = false;
        let session = f.sessions.persist_session(transient).await.unwrap();

        assert!(f.sessions.cleanup_expired_sessions(u64::MAX).await.is_empty());
        assert!(f.sessions.cleanup_expired_sessions(200_000_000_000).await.is_empty());
        assert!(f.sessions.get_session(&session.id).is_ok());
    }

    #[tokio::test]
    async fn active_only_filters_dead_connections() {
        let f = fixture();
        let a = f.connections.connect(password_config("a.example")).await.unwrap();
        let b = f.connections.connect(password_config("b.example")).await.unwrap();
        let kept = f.sessions.persist_session(PersistOptions::new(&a.id)).await.unwrap();
        f.sessions.persist_session(PersistOptions::new(&b.id)).await.unwrap();

        f.connections.disconnect(&b.id).await.unwrap();
        let active = f.sessions.list_sessions(true);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, kept.id);
        assert_eq!(f.sessions.list_sessions(false).len(), 2);
    }

    #[tokio::test]
    async fn save_and_load_state() {
        let f = fixture();
        let conn = f.connections.connect(password_config("app.example")).await.unwrap();
        let session = f.sessions.persist_session(PersistOptions::new(&conn.id)).await.unwrap();

        f.connections.record_traffic(&conn.id, 100, 200);
        let saved = f.sessions.save_session_state(&session.id).await.unwrap();
        assert_eq!(saved.counters.bytes_sent, 100);
        assert_eq!(saved.counters.bytes_received, 200);
        assert!(saved.last_active >= session.last_active);

        f.sessions.sessions.get_mut(&session.id).unwrap().recovery_count = 9;
        let loaded = f.sessions.load_session_state(&session.id).await.unwrap();
        assert_eq!(loaded.recovery_count, 0);
        assert_eq!(loaded.counters.bytes_sent, 100);
        assert_eq!(loaded.connection_id.as_deref(), Some(conn.id.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_sessions_recover_in_a_new_process() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> =
            Arc::new(RedbSessionStore::open(&dir.path().join("sessions.redb")).unwrap());

        let first = fixture_with_store(store.clone());
        let conn = first.connections.connect(password_config("app.example")).await.unwrap();
        let mut request = PersistOptions::new(&conn.id);
        request.policy = Some(auto_recover(3));
        request.port_forwards = vec![PortForwardRule::new("socks", TunnelConfig::dynamic(0))];
        let session = first.sessions.persist_session(request).await.unwrap();
        first.sessions.shutdown();

        let second = fixture_with_store(store);
        let mut events = second.sessions.subscribe();
        assert_eq!(second.sessions.load_persisted_sessions().await.unwrap(), 1);
        let loaded = second.sessions.get_session(&session.id).unwrap();
        assert!(loaded.connection_id.is_none());
        assert_eq!(loaded.connection_config, session.connection_config);

        next_matching(&mut events, |e| matches!(e, SessionEvent::Recovered { .. })).await;
        let restored = second.sessions.get_session(&session.id).unwrap();
        let connection_id = restored.connection_id.unwrap();
        assert!(second.connections.get_connection(&connection_id).is_some());
        assert_eq!(second.tunnels.list_tunnels(Some(&connection_id)).len(), 1);
    }
}
