//! Remote Port Forwarding
//!
//! Forwards connections from a remote port back to a local host:port through SSH.
//! Example: Remote server:9000 -> local:3000 (expose local service to remote)
//!
//! ## Architecture
//!
//! 1. `tcpip-forward` asks the server to listen (via the connection's session)
//! 2. The server opens a `forwarded-tcpip` channel per accepted client
//! 3. The connection's forward table routes that channel to this tunnel's
//!    `RemoteListener`, and the loop below dials the local target for it

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::relay::TunnelContext;
use super::TunnelExit;
use crate::error::BrokerError;
use crate::ssh::RemoteListener;

/// Bound on dialing the local target for one forwarded connection
const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Ask the server to listen on `address:port`
pub(crate) async fn request_forward(
    ctx: &TunnelContext,
    address: &str,
    port: u16,
) -> Result<RemoteListener, BrokerError> {
    info!("Requesting remote port forward: {}:{}", address, port);
    ctx.connection
        .session()
        .tcpip_forward(address, port as u32)
        .await
        .map_err(|e| {
            BrokerError::Bind(format!(
                "server refused to listen on {}:{}: {}",
                address, port, e
            ))
        })
}

/// Serve forwarded channels until cancelled, the connection dies, or the
/// server stops delivering
pub(crate) async fn run_remote(
    mut listener: RemoteListener,
    address: String,
    local_host: String,
    local_port: u16,
    ctx: TunnelContext,
) -> TunnelExit {
    let connection_shutdown = ctx.connection.shutdown_token();
    let bound_port = listener.bound_port;

    let exit = loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                info!("Remote tunnel {} stopped by request", ctx.tunnel_id);
                break TunnelExit::Cancelled;
            }
            _ = connection_shutdown.cancelled() => {
                info!("Remote tunnel {} stopped: SSH connection gone", ctx.tunnel_id);
                break TunnelExit::ConnectionLost;
            }
            incoming = listener.incoming.recv() => match incoming {
                Some(forwarded) => {
                    debug!(
                        "Remote tunnel {}: connection from {}:{}",
                        ctx.tunnel_id, forwarded.originator_address, forwarded.originator_port
                    );
                    let ctx = ctx.clone();
                    let local_host = local_host.clone();
                    tokio::spawn(async move {
                        let active = ctx.counters.begin();
                        let target = format!("{}:{}", local_host, local_port);
                        let local = match tokio::time::timeout(
                            LOCAL_CONNECT_TIMEOUT,
                            TcpStream::connect(&target),
                        )
                        .await
                        {
                            Ok(Ok(stream)) => stream,
                            Ok(Err(e)) => {
                                active.fail();
                                warn!("Remote tunnel {}: cannot reach {}: {}", ctx.tunnel_id, target, e);
                                return;
                            }
                            Err(_) => {
                                active.fail();
                                warn!("Remote tunnel {}: connecting to {} timed out", ctx.tunnel_id, target);
                                return;
                            }
                        };
                        if let Err(e) = local.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        ctx.relay(&active, local, forwarded.stream).await;
                    });
                }
                None => {
                    if !ctx.connection.is_live() {
                        break TunnelExit::ConnectionLost;
                    }
                    warn!("Remote tunnel {}: server stopped delivering connections", ctx.tunnel_id);
                    break TunnelExit::Failed("remote listener closed by server".into());
                }
            }
        }
    };

    if !matches!(exit, TunnelExit::ConnectionLost) {
        if let Err(e) = ctx
            .connection
            .session()
            .cancel_tcpip_forward(&address, bound_port)
            .await
        {
            debug!("Failed to cancel remote forward {}:{}: {}", address, bound_port, e);
        }
    }
    exit
}
