//! Transport seam between the managers and the SSH client
//!
//! The managers only ever see `SshConnector` and `RemoteSession`. The russh
//! backed implementation lives in `client.rs` / `handle_owner.rs`; tests use an
//! in-process fake.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};

use super::config::SshConfig;
use super::error::SshError;

/// Byte stream carried by an SSH channel
pub trait ChannelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChannelStream for T {}

pub type BoxedChannel = Box<dyn ChannelStream>;

/// Ping result, distinguishing the reasons a probe can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time (may be network latency, retryable)
    Timeout,
    /// Transport is gone
    IoError,
}

/// A connection the server opened back to us for a remote forward
pub struct ForwardedChannel {
    pub stream: BoxedChannel,
    pub originator_address: String,
    pub originator_port: u32,
}

/// Server-side listener created by `tcpip-forward`
pub struct RemoteListener {
    /// Port the server actually bound (differs from the request when it was 0)
    pub bound_port: u32,
    pub incoming: mpsc::Receiver<ForwardedChannel>,
}

/// An authenticated SSH connection
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Open a direct-tcpip channel to `host:port` as seen from the server
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<BoxedChannel, SshError>;

    async fn tcpip_forward(&self, address: &str, port: u32) -> Result<RemoteListener, SshError>;

    async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError>;

    /// Cheap round trip (keepalive request with reply)
    async fn ping(&self) -> PingResult;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Receives `()` once the transport goes away. Subscribe first, then check
    /// `is_connected`, to avoid missing a disconnect that already happened.
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;
}

/// Establishes authenticated sessions
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteSession>, SshError>;

    /// SSH-over-SSH: reach `config` through a direct-tcpip channel of `parent`
    async fn connect_via(
        &self,
        parent: Arc<dyn RemoteSession>,
        config: &SshConfig,
    ) -> Result<Arc<dyn RemoteSession>, SshError>;
}
