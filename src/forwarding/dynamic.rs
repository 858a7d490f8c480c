//! Dynamic SOCKS Proxy Forwarding
//!
//! A local SOCKS4/5 proxy that tunnels each request through SSH.
//! Example: 127.0.0.1:1080 -> SSH tunnel -> destination chosen by the client

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::local::{accept_loop, split_peer};
use super::relay::TunnelContext;
use super::socks;
use super::TunnelExit;
use crate::ssh::SshError;

pub(crate) async fn run_dynamic(listener: TcpListener, ctx: TunnelContext) -> TunnelExit {
    accept_loop(listener, ctx, "SOCKS", |ctx, stream, peer| {
        handle_socks_connection(ctx, stream, peer)
    })
    .await
}

/// One SOCKS client: parse its request, open the onward channel, relay
async fn handle_socks_connection(ctx: TunnelContext, mut stream: TcpStream, peer: String) {
    let active = ctx.counters.begin();

    let request = match timeout(ctx.handshake_timeout, socks::read_request(&mut stream)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            active.fail();
            warn!("SOCKS tunnel {}: bad request from {}: {}", ctx.tunnel_id, peer, e);
            return;
        }
        Err(_) => {
            active.fail();
            warn!(
                "SOCKS tunnel {}: {} sent no request within {:?}",
                ctx.tunnel_id, peer, ctx.handshake_timeout
            );
            return;
        }
    };
    debug!(
        "SOCKS tunnel {}: {} wants {}:{}",
        ctx.tunnel_id, peer, request.host, request.port
    );

    let (peer_host, peer_port) = split_peer(&peer);
    let channel = match ctx
        .connection
        .session()
        .open_direct_tcpip(&request.host, request.port as u32, &peer_host, peer_port)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            active.fail();
            warn!(
                "SOCKS tunnel {}: failed to open channel to {}:{}: {}",
                ctx.tunnel_id, request.host, request.port, e
            );
            let _ = match e {
                SshError::Disconnected => socks::send_failure(&mut stream, request.version).await,
                _ => socks::send_unreachable(&mut stream, request.version).await,
            };
            return;
        }
    };

    if let Err(e) = socks::send_success(&mut stream, request.version).await {
        active.fail();
        debug!("SOCKS tunnel {}: client went away: {}", ctx.tunnel_id, e);
        return;
    }

    ctx.relay(&active, stream, channel).await;
    debug!(
        "SOCKS tunnel {}: {} -> {}:{} closed",
        ctx.tunnel_id, peer, request.host, request.port
    );
}
