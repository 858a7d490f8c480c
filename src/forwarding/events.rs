//! Tunnel Event System
//!
//! Tunnel status changes, restarts and periodic metrics, published on a tokio
//! broadcast channel. Publishing never blocks and nobody has to listen.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use super::types::{TunnelMetrics, TunnelStatus};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TunnelEvent {
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        tunnel_id: String,
        connection_id: String,
        status: TunnelStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A restart is scheduled after `delay_ms`
    #[serde(rename_all = "camelCase")]
    Restarting {
        tunnel_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// Periodic snapshot from `start_monitoring`
    Metrics(TunnelMetrics),
}

#[derive(Clone)]
pub struct TunnelEventBus {
    tx: broadcast::Sender<TunnelEvent>,
}

impl TunnelEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TunnelEvent) {
        if self.tx.send(event).is_err() {
            trace!("No tunnel event subscribers");
        }
    }

    pub fn emit_status_changed(
        &self,
        tunnel_id: &str,
        connection_id: &str,
        status: TunnelStatus,
        error: Option<String>,
    ) {
        self.emit(TunnelEvent::StatusChanged {
            tunnel_id: tunnel_id.to_string(),
            connection_id: connection_id.to_string(),
            status,
            error,
        });
    }
}

impl Default for TunnelEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TunnelEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
