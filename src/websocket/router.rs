use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::connection::Connection;
use super::registry::Registry;
use crate::config::OverflowPolicy;
use crate::error::WebSocketError;

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// Forwards every data frame from one connection to all other open ones.
#[derive(Debug)]
pub struct BroadcastRouter {
    registry: Arc<Registry>,
    overflow_policy: OverflowPolicy,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<Registry>, overflow_policy: OverflowPolicy) -> Self {
        Self {
            registry,
            overflow_policy,
        }
    }

    /// Fan `payload` out to every open connection except `source`.
    ///
    /// Frames are queued, not written, so a slow recipient never holds up the
    /// sender or the other recipients. A failure on one recipient runs that
    /// recipient's disconnect path and the loop carries on.
    pub async fn on_message(&self, source: &Connection, payload: Message) -> Delivery {
        let mut delivery = Delivery::default();

        if !(payload.is_text() || payload.is_binary()) {
            return delivery;
        }

        for recipient in self.registry.snapshot().await {
            if recipient.id() == source.id() || !recipient.is_open() {
                continue;
            }

            match recipient.try_send(payload.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(WebSocketError::QueueFull) if self.overflow_policy == OverflowPolicy::Drop => {
                    let total = recipient.record_dropped();
                    warn!(
                        conn = %recipient.id(),
                        dropped_total = total,
                        "Outbound queue full, dropping frame"
                    );
                    delivery.dropped += 1;
                }
                Err(e) => {
                    self.on_error(&recipient, e).await;
                    delivery.failed += 1;
                }
            }
        }

        debug!(
            conn = %source.id(),
            bytes = payload.len(),
            delivered = delivery.delivered,
            dropped = delivery.dropped,
            failed = delivery.failed,
            "Fan-out complete"
        );

        delivery
    }

    /// Stop routing to `conn`. Idempotent.
    pub async fn on_disconnect(&self, conn: &Connection) {
        conn.begin_close();
        self.registry.unregister(&conn.id()).await;
    }

    pub async fn on_error(&self, conn: &Connection, err: WebSocketError) {
        warn!(conn = %conn.id(), peer = %conn.peer_addr(), error = %err, "Connection failed");
        self.on_disconnect(conn).await;
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}
