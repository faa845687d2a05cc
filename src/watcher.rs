// =============================================================================
// OrderWatcher — reconciles broker order events against the store
// =============================================================================
//
// Consumes the broker's order event stream with a periodic poll fallback.
// Each event is applied to the order row first (one transaction, replay-safe:
// repeated terminal events are no-ops), and only then do the orchestrator
// callbacks run — the commit-before-callback ordering the rest of the engine
// depends on.
//
// The watcher never mutates positions or trades itself; every mutation goes
// through orchestrator callbacks.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broker::{BrokerPort, OrderEvent};
use crate::bus::BusEvent;
use crate::metrics;
use crate::orchestrator::Orchestrator;
use crate::types::{OrderStatus, OrderTag};

/// Poll fallback cadence. Kept under the heartbeat staleness threshold so a
/// quiet-but-healthy broker (no fills, no stream frames) does not flip
/// readiness.
const POLL_INTERVAL: Duration = Duration::from_secs(3);

pub struct OrderWatcher {
    app: Arc<AppState>,
    orchestrator: Arc<Orchestrator>,
    broker: Arc<dyn BrokerPort>,
}

impl OrderWatcher {
    pub fn new(
        app: Arc<AppState>,
        orchestrator: Arc<Orchestrator>,
        broker: Arc<dyn BrokerPort>,
    ) -> Self {
        Self { app, orchestrator, broker }
    }

    /// Consume order events until the process shuts down. Stream drops fall
    /// back to polling; a fresh subscription is taken on the next loop.
    pub async fn run(self: Arc<Self>) {
        info!("order watcher running");
        let mut events = self.broker.order_events();
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        self.app.beat_order_stream();
                        self.handle_event(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "order event stream lagged — poll will reconcile");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("order event stream closed — resubscribing");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        events = self.broker.order_events();
                    }
                },
                _ = poll.tick() => {
                    self.poll_cycle().await;
                }
            }
        }
    }

    /// One poll fallback pass; also ticks the stream heartbeat.
    pub async fn poll_cycle(&self) {
        match self.broker.poll_orders().await {
            Ok(events) => {
                self.app.beat_order_stream();
                for event in &events {
                    self.handle_event(event).await;
                }
            }
            Err(e) => warn!(error = %e, "order poll failed"),
        }
    }

    /// Map one broker event onto the store and dispatch callbacks on real
    /// transitions. Replays of terminal states are no-ops.
    pub async fn handle_event(&self, event: &OrderEvent) {
        let applied = match self.app.store.apply_order_event(
            &event.client_order_id,
            event.status,
            event.filled_qty,
            event.avg_price,
            event.ts,
        ) {
            Ok(applied) => applied,
            Err(e) => {
                warn!(client_order_id = %event.client_order_id, error = %e, "failed to apply order event");
                return;
            }
        };

        let Some((prev, order)) = applied else {
            debug!(
                client_order_id = %event.client_order_id,
                status = %event.status,
                "order event ignored (unknown id or replayed terminal)"
            );
            return;
        };

        self.app.bus.publish(BusEvent::OrderUpdate {
            client_order_id: order.client_order_id.clone(),
            status: order.status,
        });

        match order.status {
            OrderStatus::Filled if prev != OrderStatus::Filled => {
                metrics::inc_orders_filled();
                match order.tag {
                    OrderTag::Entry => self.orchestrator.on_entry_filled(&order).await,
                    OrderTag::Stop | OrderTag::Tp => {
                        self.orchestrator.on_child_filled(&order).await
                    }
                    OrderTag::Exit => self.orchestrator.on_exit_filled(&order).await,
                }
            }
            OrderStatus::Partial => {
                if order.tag == OrderTag::Stop {
                    self.orchestrator.on_stop_partial(&order).await;
                }
            }
            OrderStatus::Canceled => match order.tag {
                OrderTag::Stop | OrderTag::Tp => self.orchestrator.on_child_canceled(&order),
                OrderTag::Entry => self.orchestrator.on_entry_canceled(&order).await,
                OrderTag::Exit => {}
            },
            OrderStatus::Rejected => {
                self.orchestrator.on_order_rejected(&order).await;
            }
            _ => {}
        }
    }
}
