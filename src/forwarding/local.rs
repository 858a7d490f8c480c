//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//! Example: Forward local:15432 -> db.internal:5432

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::relay::TunnelContext;
use super::TunnelExit;
use crate::error::BrokerError;

/// Consecutive accept failures after which the listener is considered broken
const MAX_ACCEPT_ERRORS: u32 = 5;

/// Bind a local listener, mapping the common failures to readable errors
pub(crate) async fn bind_listener(addr: &str) -> Result<TcpListener, BrokerError> {
    TcpListener::bind(addr).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => BrokerError::Bind(format!(
            "Port already in use: {}. Another application may be using this port.",
            addr
        )),
        std::io::ErrorKind::PermissionDenied => BrokerError::Bind(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        std::io::ErrorKind::AddrNotAvailable => BrokerError::Bind(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            addr
        )),
        _ => BrokerError::Bind(format!("Failed to bind to {}: {}", addr, e)),
    })
}

/// Accept loop shared by local and dynamic tunnels
///
/// `handle` runs once per accepted socket on its own task.
pub(crate) async fn accept_loop<F, Fut>(
    listener: TcpListener,
    ctx: TunnelContext,
    label: &'static str,
    handle: F,
) -> TunnelExit
where
    F: Fn(TunnelContext, TcpStream, String) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let connection_shutdown = ctx.connection.shutdown_token();
    let mut accept_errors = 0u32;

    let exit = loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                info!("{} tunnel {} stopped by request", label, ctx.tunnel_id);
                break TunnelExit::Cancelled;
            }
            _ = connection_shutdown.cancelled() => {
                info!("{} tunnel {} stopped: SSH connection gone", label, ctx.tunnel_id);
                break TunnelExit::ConnectionLost;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    accept_errors = 0;
                    // Disable Nagle's algorithm for low-latency forwarding
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    debug!("{} tunnel {}: accepted {}", label, ctx.tunnel_id, peer_addr);
                    tokio::spawn(handle(ctx.clone(), stream, peer_addr.to_string()));
                }
                Err(e) => {
                    accept_errors += 1;
                    error!("{} tunnel {} accept error: {}", label, ctx.tunnel_id, e);
                    if accept_errors >= MAX_ACCEPT_ERRORS {
                        break TunnelExit::Failed(format!("accept failed repeatedly: {}", e));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    };

    debug!("{} tunnel {} listener exited", label, ctx.tunnel_id);
    exit
}

/// Serve a local tunnel until it is cancelled or its connection goes away
pub(crate) async fn run_local(
    listener: TcpListener,
    remote_host: String,
    remote_port: u16,
    ctx: TunnelContext,
) -> TunnelExit {
    accept_loop(listener, ctx, "Local", move |ctx, stream, peer| {
        let remote_host = remote_host.clone();
        async move {
            let active = ctx.counters.begin();
            let (peer_host, peer_port) = split_peer(&peer);

            let channel = match ctx
                .connection
                .session()
                .open_direct_tcpip(&remote_host, remote_port as u32, &peer_host, peer_port)
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    active.fail();
                    warn!(
                        "Tunnel {}: failed to open channel to {}:{}: {}",
                        ctx.tunnel_id, remote_host, remote_port, e
                    );
                    return;
                }
            };

            debug!(
                "Tunnel {}: {} -> {}:{} open",
                ctx.tunnel_id, peer, remote_host, remote_port
            );
            ctx.relay(&active, stream, channel).await;
        }
    })
    .await
}

/// "1.2.3.4:5678" -> ("1.2.3.4", 5678), for the direct-tcpip originator fields
pub(crate) fn split_peer(peer: &str) -> (String, u32) {
    peer.parse::<std::net::SocketAddr>()
        .map(|a| (a.ip().to_string(), a.port() as u32))
        .unwrap_or_else(|_| ("127.0.0.1".to_string(), 0))
}
