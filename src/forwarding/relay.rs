//! Bidirectional relay between an accepted socket and an SSH channel
//!
//! Each sub-connection of a tunnel is one relay task. The task reports what
//! happened through its `JoinHandle`; the listener that spawned it folds the
//! outcome into the tunnel and connection counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::{ActiveGuard, TunnelCounters};
use crate::connection::ConnectionEntry;

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// What a finished relay moved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Local side -> channel
    pub bytes_sent: u64,
    /// Channel -> local side
    pub bytes_received: u64,
    /// First I/O error seen in either direction
    pub error: Option<String>,
}

/// Spawn a relay between `local` and `channel`
///
/// Each direction runs until EOF, an I/O error, or `idle_timeout` without
/// data, then shuts down its write half. Cancelling `cancel` ends both
/// directions at once.
pub fn spawn_relay<L, C>(
    local: L,
    channel: C,
    idle_timeout: Duration,
    counters: Arc<TunnelCounters>,
    cancel: CancellationToken,
) -> JoinHandle<RelayOutcome>
where
    L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let (mut local_read, mut local_write) = tokio::io::split(local);
        let (mut channel_read, mut channel_write) = tokio::io::split(channel);

        let local_to_remote = copy_direction(
            &mut local_read,
            &mut channel_write,
            idle_timeout,
            &counters.bytes_sent,
        );
        let remote_to_local = copy_direction(
            &mut channel_read,
            &mut local_write,
            idle_timeout,
            &counters.bytes_received,
        );

        tokio::select! {
            ((sent, sent_err), (received, received_err)) = async {
                tokio::join!(local_to_remote, remote_to_local)
            } => RelayOutcome {
                bytes_sent: sent,
                bytes_received: received,
                error: sent_err.or(received_err),
            },
            _ = cancel.cancelled() => {
                debug!("Relay cancelled");
                RelayOutcome::default()
            }
        }
    })
}

async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Duration,
    counter: &AtomicU64,
) -> (u64, Option<String>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    let mut error = None;

    loop {
        let n = match tokio::time::timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("Relay read error: {}", e);
                error = Some(format!("read failed: {}", e));
                break;
            }
            Err(_) => {
                debug!("Relay idle for {}s, closing", idle_timeout.as_secs());
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!("Relay write error: {}", e);
            error = Some(format!("write failed: {}", e));
            break;
        }
        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    let _ = writer.shutdown().await;
    (total, error)
}

/// What every listener of one tunnel shares
#[derive(Clone)]
pub(crate) struct TunnelContext {
    pub tunnel_id: String,
    pub connection: Arc<ConnectionEntry>,
    pub counters: Arc<TunnelCounters>,
    pub relay_idle: Duration,
    pub handshake_timeout: Duration,
    /// Tunnel-wide stop signal; relays get child tokens
    pub cancel: CancellationToken,
}

impl TunnelContext {
    /// Relay one sub-connection and account for it on `active`
    pub async fn relay<L, C>(
        &self,
        active: &ActiveGuard<'_>,
        local: L,
        channel: C,
    ) -> RelayOutcome
    where
        L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handle = spawn_relay(
            local,
            channel,
            self.relay_idle,
            self.counters.clone(),
            self.cancel.child_token(),
        );
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => RelayOutcome {
                error: Some(format!("relay task failed: {}", e)),
                ..Default::default()
            },
        };

        self.connection
            .record_traffic(outcome.bytes_sent, outcome.bytes_received);
        if let Some(ref error) = outcome.error {
            active.fail();
            debug!("Tunnel {} sub-connection ended with error: {}", self.tunnel_id, error);
        }
        outcome
    }
}
