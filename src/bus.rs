// =============================================================================
// EventBus — best-effort pub/sub for telemetry streams
// =============================================================================
//
// The bus is advisory: events may be reordered or dropped (lagging receivers
// lose the oldest messages) and publishing to zero subscribers is fine.
// Correctness never depends on bus delivery — the store is the source of
// truth.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::models::RiskEventType;
use crate::types::{OrderStatus, Tick, TradingMode};

/// Telemetry event published on the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusEvent {
    Tick(Tick),
    Signal {
        signal_id: String,
        symbol: String,
        strategy: String,
        score: f64,
    },
    OrderUpdate {
        client_order_id: String,
        status: OrderStatus,
    },
    RiskBlocked {
        event_type: RiskEventType,
        details: String,
    },
    ModeChanged {
        mode: TradingMode,
    },
    Paused {
        reason: String,
    },
    Resumed,
    Flattened {
        reason: String,
    },
    LeaderChanged {
        is_leader: bool,
    },
}

/// Cheap-to-clone handle around a broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Send errors (no subscribers) are ignored.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.publish(BusEvent::Resumed);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(BusEvent::Paused { reason: "test".to_string() });
        match rx.recv().await.unwrap() {
            BusEvent::Paused { reason } => assert_eq!(reason, "test"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(BusEvent::Resumed);
        }
        // The first recv reports the lag; the channel stays usable.
        let res = rx.recv().await;
        assert!(matches!(res, Err(broadcast::error::RecvError::Lagged(_))));
        assert!(rx.recv().await.is_ok());
    }
}
