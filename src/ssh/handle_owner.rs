//! Handle Owner Task
//!
//! Only one task owns the russh `Handle<ClientHandler>`. Everything else talks
//! to it through a cloneable `HandleController`, which sends commands over an
//! mpsc channel. This avoids `Arc<Mutex<Handle>>` contention and never holds a
//! lock across `.await`.
//!
//! Inbound `forwarded-tcpip` channels are routed through a `ForwardTable`
//! owned by the connection, so two connections never see each other's
//! remote forwards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::transport::{
    BoxedChannel, ForwardedChannel, PingResult, RemoteListener, RemoteSession,
};

/// How long a keepalive may take before the probe counts as timed out
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the owner checks whether russh closed the transport underneath us
const TRANSPORT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Buffered inbound channels per remote forward
const FORWARD_QUEUE: usize = 32;

/// Remote forwards of one connection: (bind address, bound port) -> queue
#[derive(Default)]
pub struct ForwardTable {
    targets: DashMap<(String, u32), mpsc::Sender<ForwardedChannel>>,
}

impl ForwardTable {
    pub fn register(&self, address: &str, port: u32, tx: mpsc::Sender<ForwardedChannel>) {
        self.targets.insert((address.to_string(), port), tx);
    }

    pub fn unregister(&self, address: &str, port: u32) {
        self.targets.remove(&(address.to_string(), port));
    }

    /// Servers do not always echo the bind address verbatim, so fall back to
    /// matching on the port alone.
    pub fn lookup(&self, address: &str, port: u32) -> Option<mpsc::Sender<ForwardedChannel>> {
        if let Some(tx) = self.targets.get(&(address.to_string(), port)) {
            return Some(tx.value().clone());
        }
        self.targets
            .iter()
            .find(|e| e.key().1 == port)
            .map(|e| e.value().clone())
    }
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (local forward, dynamic forward, SSH-over-SSH)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (it copies senders). Any holder has full control of the
/// connection, so it must stay inside the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
    forwards: Arc<ForwardTable>,
}

impl HandleController {
    /// Controller with no owner task behind it. Used by tests.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
            forwards: Arc::new(ForwardTable::default()),
        }
    }

    async fn request_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    async fn request_tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))
    }
}

#[async_trait]
impl RemoteSession for HandleController {
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<BoxedChannel, SshError> {
        let channel = self
            .request_direct_tcpip(host, port, originator_host, originator_port)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn tcpip_forward(&self, address: &str, port: u32) -> Result<RemoteListener, SshError> {
        let (tx, incoming) = mpsc::channel(FORWARD_QUEUE);
        // Register under the requested port first so early channels are not lost
        if port != 0 {
            self.forwards.register(address, port, tx.clone());
        }
        let bound_port = match self.request_tcpip_forward(address, port).await {
            Ok(bound) => bound,
            Err(e) => {
                if port != 0 {
                    self.forwards.unregister(address, port);
                }
                return Err(e);
            }
        };
        if bound_port != port {
            self.forwards.unregister(address, port);
            self.forwards.register(address, bound_port, tx);
        }
        Ok(RemoteListener {
            bound_port,
            incoming,
        })
    }

    async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        self.forwards.unregister(address, port);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))
    }

    async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle. `forwards` must be the same table the handle's
/// `ClientHandler` routes forwarded-tcpip channels into.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    forwards: Arc<ForwardTable>,
    connection_label: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;
        let mut transport_check = tokio::time::interval(TRANSPORT_CHECK_INTERVAL);

        info!("Handle owner task started for {}", connection_label);

        loop {
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => cmd,
                _ = transport_check.tick() => {
                    if handle.is_closed() {
                        warn!("Transport closed underneath {}", connection_label);
                        break;
                    }
                    continue;
                }
            };

            let Some(cmd) = cmd else {
                info!("All controllers dropped for {}", connection_label);
                break;
            };

            match cmd {
                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        // Channel is dropped here and the server closes it
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(&address, port).await;
                    match result {
                        Ok(bound_port) => {
                            if reply_tx.send(Ok(bound_port)).is_err() {
                                // Nobody will ever serve this forward
                                warn!(
                                    "Caller dropped after tcpip_forward succeeded. \
                                     Cancelling orphaned forward {}:{}",
                                    address, bound_port
                                );
                                let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                            }
                        }
                        Err(e) => {
                            let _ = reply_tx.send(Err(e));
                        }
                    }
                }

                HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Ping { reply_tx } => {
                    debug!("Keepalive probe for {}", connection_label);
                    let result =
                        match tokio::time::timeout(PING_TIMEOUT, handle.send_keepalive(true)).await
                        {
                            Ok(Ok(())) => PingResult::Ok,
                            Ok(Err(russh::Error::Disconnect)) => {
                                warn!("Keepalive found {} disconnected", connection_label);
                                PingResult::IoError
                            }
                            Ok(Err(e)) => {
                                warn!("Keepalive error for {} (soft failure): {:?}", connection_label, e);
                                PingResult::Timeout
                            }
                            Err(_) => {
                                warn!("Keepalive timeout for {}", connection_label);
                                PingResult::Timeout
                            }
                        };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for {}", connection_label);
                    break;
                }
            }
        }

        // Close the command queue before notifying, so anyone who subscribes
        // afterwards already sees is_connected() == false.
        drain_pending_commands(&mut cmd_rx);
        let _ = disconnect_tx_clone.send(());

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", connection_label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
        forwards,
    }
}

/// Drain all pending commands, returning Disconnected to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
