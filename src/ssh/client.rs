//! SSH client implementation using russh

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{HashAlg, PublicKey};
use russh::*;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, ForwardTable};
use super::transport::{ForwardedChannel, RemoteSession, SshConnector};

/// Connects with russh and hands each authenticated Handle to an owner task
pub struct RusshConnector {
    /// `None` disables host key verification entirely
    known_hosts: Option<PathBuf>,
    /// Reject hosts that are not yet in known_hosts
    strict_host_key_checking: bool,
    handshake_timeout: Duration,
}

impl RusshConnector {
    /// Verify against `~/.ssh/known_hosts`, learning unknown hosts
    pub fn new() -> Self {
        Self {
            known_hosts: dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts")),
            strict_host_key_checking: false,
            handshake_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_known_hosts(mut self, path: Option<PathBuf>) -> Self {
        self.known_hosts = path;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_host_key_checking = strict;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn client_config() -> client::Config {
        client::Config {
            // Liveness is judged by the broker's own health checks
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        }
    }

    fn handler(&self, config: &SshConfig, forwards: Arc<ForwardTable>) -> ClientHandler {
        ClientHandler {
            host: config.host.clone(),
            port: config.port,
            strict: self.strict_host_key_checking,
            known_hosts: self.known_hosts.clone(),
            forwards,
        }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteSession>, SshError> {
        let addr = config.address();
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed(format!("No address found for {}", addr)))?;

        let forwards = Arc::new(ForwardTable::default());
        let handler = self.handler(config, forwards.clone());

        let mut handle = tokio::time::timeout(
            self.handshake_timeout,
            client::connect(Arc::new(Self::client_config()), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Handshake with {} timed out", addr)))??;

        debug!("SSH handshake completed with {}", addr);

        authenticate(&mut handle, config).await?;
        info!("SSH authentication successful for {}@{}", config.username, addr);

        Ok(Arc::new(spawn_handle_owner_task(
            handle,
            forwards,
            format!("{}@{}", config.username, addr),
        )))
    }

    async fn connect_via(
        &self,
        parent: Arc<dyn RemoteSession>,
        config: &SshConfig,
    ) -> Result<Arc<dyn RemoteSession>, SshError> {
        let addr = config.address();
        info!("Connecting to {} through an existing SSH connection", addr);

        let stream = parent
            .open_direct_tcpip(&config.host, config.port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                SshError::ConnectionFailed(format!("Failed to open direct-tcpip channel: {}", e))
            })?;

        let forwards = Arc::new(ForwardTable::default());
        let handler = self.handler(config, forwards.clone());

        let mut handle = tokio::time::timeout(
            self.handshake_timeout,
            client::connect_stream(Arc::new(Self::client_config()), stream, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Handshake with {} via tunnel timed out", addr)))??;

        debug!("SSH handshake via tunnel completed with {}", addr);

        authenticate(&mut handle, config).await?;
        info!("Tunneled SSH connection established to {}@{}", config.username, addr);

        Ok(Arc::new(spawn_handle_owner_task(
            handle,
            forwards,
            format!("{}@{} (tunneled)", config.username, addr),
        )))
    }
}

async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    config: &SshConfig,
) -> Result<(), SshError> {
    let result = match &config.auth {
        AuthMethod::Password { password } => handle
            .authenticate_password(&config.username, password)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
        AuthMethod::Key {
            key_path,
            passphrase,
        } => {
            let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                .map_err(|e| SshError::KeyError(format!("{}: {}", key_path, e)))?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(&config.username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
    };

    if !result.success() {
        return Err(SshError::AuthenticationFailed(format!(
            "{} authentication rejected for {}@{}",
            config.auth.kind(),
            config.username,
            config.host
        )));
    }
    Ok(())
}

/// Client handler for russh callbacks
///
/// - Host key verification against known_hosts
/// - Routing of forwarded-tcpip channels to this connection's remote forwards
pub struct ClientHandler {
    host: String,
    port: u16,
    /// true: reject unknown keys. false: learn them. Changed keys are always rejected.
    strict: bool,
    known_hosts: Option<PathBuf>,
    forwards: Arc<ForwardTable>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let Some(path) = &self.known_hosts else {
            debug!("Host key verification disabled for {}:{}", self.host, self.port);
            return Ok(true);
        };
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();

        match russh::keys::check_known_hosts_path(
            &self.host,
            self.port,
            server_public_key,
            path,
        ) {
            Ok(true) => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Ok(false) if self.strict => {
                warn!(
                    "Unknown host key for {}:{} ({}), strict mode rejects it",
                    self.host, self.port, fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "unknown host {}:{} with fingerprint {}",
                    self.host, self.port, fingerprint
                )))
            }
            Ok(false) => {
                info!(
                    "New host {}:{}, adding to known_hosts ({})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = russh::keys::known_hosts::learn_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    path,
                ) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            Err(russh::keys::Error::KeyChanged { line }) => {
                warn!(
                    "HOST KEY CHANGED for {}:{} (known_hosts line {}), got {}",
                    self.host, self.port, line, fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} does not match known_hosts line {}",
                    self.host, self.port, line
                )))
            }
            Err(e) if self.strict => Err(SshError::HostKeyRejected(format!(
                "cannot read known_hosts: {}",
                e
            ))),
            Err(e) => {
                warn!("Cannot read known_hosts ({}), accepting {}", e, fingerprint);
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Forwarded-tcpip channel for {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let Some(tx) = self.forwards.lookup(connected_address, connected_port) else {
            warn!(
                "No remote forward registered for {}:{}, dropping channel",
                connected_address, connected_port
            );
            return Ok(());
        };

        // Never block the SSH event loop on a slow consumer
        let forwarded = ForwardedChannel {
            stream: Box::new(channel.into_stream()),
            originator_address: originator_address.to_string(),
            originator_port,
        };
        if tx.try_send(forwarded).is_err() {
            warn!(
                "Remote forward {}:{} is not accepting connections, dropping channel",
                connected_address, connected_port
            );
        }
        Ok(())
    }
}
