// =============================================================================
// PaperBroker — in-process broker simulation for PAPER mode and tests
// =============================================================================
//
// Order semantics mirror a real exchange closely enough for the control plane
// to be exercised end to end:
//   - MARKET orders fill immediately at the last traded price.
//   - LIMIT orders fill at their limit price when marketable, otherwise rest
//     until a tick crosses them.
//   - SL / SL-M orders rest until the last price trades through the trigger.
//
// Fills are emitted on the same broadcast channel shape as the live gateway,
// after a short simulated exchange delay, so the watcher path is identical in
// both modes.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::broker::{BrokerAck, BrokerError, BrokerPort, OrderEvent, OrderRequest};
use crate::types::{OrderSide, OrderStatus, OrderType, Quote};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Simulated spread applied around the last price, in fraction of price.
const SYNTHETIC_HALF_SPREAD: f64 = 0.0002;

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    status: OrderStatus,
    filled_qty: i64,
    avg_price: Option<f64>,
    broker_id: String,
}

/// Simulated broker. Quotes are driven by [`PaperBroker::on_tick`], which the
/// synthetic market data feed (and tests) call directly.
pub struct PaperBroker {
    orders: Mutex<HashMap<String, PaperOrder>>,
    quotes: Mutex<HashMap<String, Quote>>,
    events_tx: broadcast::Sender<OrderEvent>,
    next_broker_id: AtomicU64,
    /// Simulated exchange ack-to-fill delay for marketable orders.
    fill_delay: Duration,
}

impl PaperBroker {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            orders: Mutex::new(HashMap::new()),
            quotes: Mutex::new(HashMap::new()),
            events_tx,
            next_broker_id: AtomicU64::new(1),
            fill_delay: Duration::from_millis(10),
        }
    }

    /// Zero-delay variant so tests observe fills deterministically fast.
    pub fn with_fill_delay(fill_delay: Duration) -> Self {
        let mut b = Self::new();
        b.fill_delay = fill_delay;
        b
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Seed or update the quote for a symbol and trigger resting orders.
    pub fn on_tick(&self, symbol: &str, last: f64) {
        {
            let mut quotes = self.quotes.lock();
            quotes.insert(
                symbol.to_string(),
                Quote {
                    last,
                    bid: last * (1.0 - SYNTHETIC_HALF_SPREAD),
                    ask: last * (1.0 + SYNTHETIC_HALF_SPREAD),
                    ts: Self::now_ms(),
                },
            );
        }
        self.trigger_resting(symbol, last);
    }

    /// Pin an exact quote (tests exercising spread gates).
    pub fn set_quote(&self, symbol: &str, quote: Quote) {
        self.quotes.lock().insert(symbol.to_string(), quote);
        self.trigger_resting(symbol, quote.last);
    }

    /// Fill any resting order whose trigger/limit the tick traded through.
    fn trigger_resting(&self, symbol: &str, last: f64) {
        let mut fills: Vec<(String, i64, f64)> = Vec::new();
        {
            let mut orders = self.orders.lock();
            for (coid, order) in orders.iter_mut() {
                if order.request.symbol != symbol || order.status != OrderStatus::Placed {
                    continue;
                }
                let crossed = match order.request.order_type {
                    OrderType::Limit => match order.request.side {
                        OrderSide::Buy => last <= order.request.price.unwrap_or(f64::MIN),
                        OrderSide::Sell => last >= order.request.price.unwrap_or(f64::MAX),
                    },
                    OrderType::Sl | OrderType::SlM => match order.request.side {
                        // A sell stop protects a long: triggers when price
                        // trades at or below the trigger. Mirror for shorts.
                        OrderSide::Sell => last <= order.request.price.unwrap_or(f64::MIN),
                        OrderSide::Buy => last >= order.request.price.unwrap_or(f64::MAX),
                    },
                    OrderType::Market => true,
                };
                if crossed {
                    let fill_price = match order.request.order_type {
                        OrderType::Market | OrderType::SlM => last,
                        _ => order.request.price.unwrap_or(last),
                    };
                    order.status = OrderStatus::Filled;
                    order.filled_qty = order.request.qty;
                    order.avg_price = Some(fill_price);
                    fills.push((coid.clone(), order.request.qty, fill_price));
                }
            }
        }

        for (coid, qty, price) in fills {
            debug!(client_order_id = %coid, price, "paper fill (triggered)");
            let _ = self.events_tx.send(OrderEvent {
                client_order_id: coid,
                status: OrderStatus::Filled,
                filled_qty: qty,
                avg_price: Some(price),
                ts: Self::now_ms(),
            });
        }
    }

    /// Whether a freshly placed order fills immediately at current quotes.
    fn is_marketable(&self, req: &OrderRequest) -> Option<f64> {
        let quotes = self.quotes.lock();
        let quote = quotes.get(&req.symbol)?;
        match req.order_type {
            OrderType::Market => Some(quote.last),
            OrderType::Limit => {
                let price = req.price?;
                match req.side {
                    OrderSide::Buy if price >= quote.ask => Some(price.min(quote.ask)),
                    OrderSide::Sell if price <= quote.bid => Some(price.max(quote.bid)),
                    _ => None,
                }
            }
            // Stops never fill on placement; they wait for a trigger.
            OrderType::Sl | OrderType::SlM => None,
        }
    }

    fn emit_later(&self, event: OrderEvent) {
        let tx = self.events_tx.clone();
        let delay = self.fill_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerPort for PaperBroker {
    async fn place_order(&self, req: &OrderRequest) -> Result<BrokerAck, BrokerError> {
        if req.qty <= 0 {
            return Err(BrokerError::validation("qty must be positive"));
        }

        let broker_id = format!("P-{}", self.next_broker_id.fetch_add(1, Ordering::SeqCst));
        let marketable = self.is_marketable(req);

        {
            let mut orders = self.orders.lock();
            if orders.contains_key(&req.client_order_id) {
                return Err(BrokerError::business(format!(
                    "duplicate client_order_id {} at broker",
                    req.client_order_id
                )));
            }
            let (status, filled_qty, avg_price) = match marketable {
                Some(price) => (OrderStatus::Filled, req.qty, Some(price)),
                None => (OrderStatus::Placed, 0, None),
            };
            orders.insert(
                req.client_order_id.clone(),
                PaperOrder {
                    request: req.clone(),
                    status,
                    filled_qty,
                    avg_price,
                    broker_id: broker_id.clone(),
                },
            );
        }

        let ack_ts = Self::now_ms();
        self.emit_later(OrderEvent {
            client_order_id: req.client_order_id.clone(),
            status: OrderStatus::Placed,
            filled_qty: 0,
            avg_price: None,
            ts: ack_ts,
        });
        if let Some(price) = marketable {
            debug!(client_order_id = %req.client_order_id, price, "paper fill (marketable)");
            self.emit_later(OrderEvent {
                client_order_id: req.client_order_id.clone(),
                status: OrderStatus::Filled,
                filled_qty: req.qty,
                avg_price: Some(price),
                ts: ack_ts,
            });
        }

        Ok(BrokerAck { broker_id, ack_ts })
    }

    async fn cancel_order(&self, client_order_id: &str) -> Result<(), BrokerError> {
        let cancelled = {
            let mut orders = self.orders.lock();
            match orders.get_mut(client_order_id) {
                None => {
                    return Err(BrokerError::business(format!(
                        "unknown order {client_order_id}"
                    )))
                }
                Some(order) if order.status.is_terminal() => {
                    return Err(BrokerError::business(format!(
                        "order {client_order_id} already {}",
                        order.status
                    )))
                }
                Some(order) => {
                    order.status = OrderStatus::Canceled;
                    true
                }
            }
        };

        if cancelled {
            let _ = self.events_tx.send(OrderEvent {
                client_order_id: client_order_id.to_string(),
                status: OrderStatus::Canceled,
                filled_qty: 0,
                avg_price: None,
                ts: Self::now_ms(),
            });
        }
        Ok(())
    }

    async fn modify_order(
        &self,
        client_order_id: &str,
        new_price: f64,
        new_qty: i64,
    ) -> Result<(), BrokerError> {
        let mut orders = self.orders.lock();
        match orders.get_mut(client_order_id) {
            None => Err(BrokerError::business(format!("unknown order {client_order_id}"))),
            Some(order) if order.status.is_terminal() => Err(BrokerError::business(format!(
                "order {client_order_id} already {}",
                order.status
            ))),
            Some(order) => {
                order.request.price = Some(new_price);
                order.request.qty = new_qty;
                Ok(())
            }
        }
    }

    fn order_events(&self) -> broadcast::Receiver<OrderEvent> {
        self.events_tx.subscribe()
    }

    async fn poll_orders(&self) -> Result<Vec<OrderEvent>, BrokerError> {
        let orders = self.orders.lock();
        Ok(orders
            .values()
            .map(|o| OrderEvent {
                client_order_id: o.request.client_order_id.clone(),
                status: o.status,
                filled_qty: o.filled_qty,
                avg_price: o.avg_price,
                ts: Self::now_ms(),
            })
            .collect())
    }

    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        self.quotes
            .lock()
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::validation(format!("no quote for {symbol}")))
    }

    async fn refresh_token(&self) -> Result<(), BrokerError> {
        info!("paper broker token refresh (no-op)");
        Ok(())
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperBroker")
            .field("orders", &self.orders.lock().len())
            .field("quotes", &self.quotes.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn req(coid: &str, side: OrderSide, order_type: OrderType, price: Option<f64>) -> OrderRequest {
        OrderRequest {
            client_order_id: coid.to_string(),
            symbol: "NIFTY".to_string(),
            side,
            qty: 50,
            order_type,
            price,
        }
    }

    async fn next_status(
        rx: &mut broadcast::Receiver<OrderEvent>,
        coid: &str,
        status: OrderStatus,
    ) -> OrderEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for order event")
                .expect("event channel closed");
            if event.client_order_id == coid && event.status == status {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn marketable_buy_limit_fills_at_limit() {
        let broker = PaperBroker::new();
        broker.on_tick("NIFTY", 21480.0);
        let mut rx = broker.order_events();

        broker
            .place_order(&req("p:ENTRY", OrderSide::Buy, OrderType::Limit, Some(21490.0)))
            .await
            .unwrap();

        let fill = next_status(&mut rx, "p:ENTRY", OrderStatus::Filled).await;
        assert_eq!(fill.filled_qty, 50);
        assert!(fill.avg_price.unwrap() <= 21490.0);
    }

    #[tokio::test]
    async fn sell_stop_rests_until_price_trades_through() {
        let broker = PaperBroker::new();
        broker.on_tick("NIFTY", 21480.0);
        let mut rx = broker.order_events();

        broker
            .place_order(&req("p:STOP", OrderSide::Sell, OrderType::SlM, Some(21385.0)))
            .await
            .unwrap();
        next_status(&mut rx, "p:STOP", OrderStatus::Placed).await;

        // Above the trigger: still resting.
        broker.on_tick("NIFTY", 21400.0);
        // Through the trigger: fills at last.
        broker.on_tick("NIFTY", 21380.0);

        let fill = next_status(&mut rx, "p:STOP", OrderStatus::Filled).await;
        assert_eq!(fill.avg_price, Some(21380.0));
    }

    #[tokio::test]
    async fn sell_tp_limit_fills_when_crossed() {
        let broker = PaperBroker::new();
        broker.on_tick("NIFTY", 21480.0);
        let mut rx = broker.order_events();

        broker
            .place_order(&req("p:TP", OrderSide::Sell, OrderType::Limit, Some(21623.0)))
            .await
            .unwrap();
        next_status(&mut rx, "p:TP", OrderStatus::Placed).await;

        broker.on_tick("NIFTY", 21630.0);
        let fill = next_status(&mut rx, "p:TP", OrderStatus::Filled).await;
        assert_eq!(fill.avg_price, Some(21623.0));
    }

    #[tokio::test]
    async fn cancel_emits_terminal_event_and_rejects_filled() {
        let broker = PaperBroker::new();
        broker.on_tick("NIFTY", 21480.0);
        let mut rx = broker.order_events();

        broker
            .place_order(&req("p:TP", OrderSide::Sell, OrderType::Limit, Some(21623.0)))
            .await
            .unwrap();
        broker.cancel_order("p:TP").await.unwrap();
        next_status(&mut rx, "p:TP", OrderStatus::Canceled).await;

        // A market order is immediately filled; cancelling it is an error.
        broker
            .place_order(&req("p:EXIT", OrderSide::Sell, OrderType::Market, None))
            .await
            .unwrap();
        let err = broker.cancel_order("p:EXIT").await.unwrap_err();
        assert_eq!(err.class, crate::broker::ErrorClass::Business);
    }

    #[tokio::test]
    async fn quote_reflects_last_tick() {
        let broker = PaperBroker::new();
        broker.on_tick("NIFTY", 20000.0);
        let q = broker.quote("NIFTY").await.unwrap();
        assert_eq!(q.last, 20000.0);
        assert!(q.bid < 20000.0 && q.ask > 20000.0);
        assert!(broker.quote("UNKNOWN").await.is_err());
    }
}
