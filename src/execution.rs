// =============================================================================
// ExecutionEngine — deterministic client order ids and idempotent placement
// =============================================================================
//
// Identity scheme (the backbone of idempotency and crash recovery):
//
//   plan_client_id = sha1("{symbol}|{side}|{entry}|{stop}|{tp}|{qty}|{strategy}|{config_sha}")[..24]
//   order_client_id = "{plan_client_id}:{TAG}" or "{plan_client_id}:{TAG}:{suffix}"
//
// Placement protocol: short-circuit if the id is already live in the store,
// insert a NEW row, call the broker, mark PLACED on ack or REJECTED on
// failure. A duplicate insert at the storage layer (UNIQUE violation) is
// treated as idempotent success.
//
// Retries: transient errors back off exponentially (base 200 ms, cap 3 s,
// 5 attempts). Auth errors get exactly one token refresh, after which the
// call is retried once as if transient. Validation and business errors never
// retry.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::rate_limit::{EndpointClass, RateLimiter};
use crate::broker::{BrokerError, BrokerPort, ErrorClass, OrderRequest};
use crate::metrics;
use crate::store::models::OrderRecord;
use crate::store::{InsertOutcome, Store};
use crate::types::{OrderSide, OrderStatus, OrderTag, OrderType, Side};

const RETRY_BASE: Duration = Duration::from_millis(200);
const RETRY_CAP: Duration = Duration::from_secs(3);
const MAX_ATTEMPTS: u32 = 5;
const CANCEL_ATTEMPTS: u32 = 3;

// =============================================================================
// Deterministic identity
// =============================================================================

/// Canonical price/qty rendering for the plan fingerprint: integral values
/// print without a decimal point, fractional values trim trailing zeros.
pub fn canonical_number(v: f64) -> String {
    let s = format!("{v:.4}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

/// 24-char deterministic plan fingerprint.
pub fn plan_client_id(
    symbol: &str,
    side: Side,
    entry: f64,
    stop: f64,
    tp: f64,
    qty: i64,
    strategy: &str,
    config_sha: &str,
) -> String {
    let canonical = format!(
        "{symbol}|{side}|{entry}|{stop}|{tp}|{qty}|{strategy}|{config_sha}",
        side = side.as_str(),
        entry = canonical_number(entry),
        stop = canonical_number(stop),
        tp = canonical_number(tp),
    );
    let digest = Sha1::digest(canonical.as_bytes());
    hex::encode(digest)[..24].to_string()
}

/// Client order id for one leg of a plan.
pub fn order_client_id(plan_client_id: &str, tag: OrderTag, group_suffix: Option<u32>) -> String {
    match group_suffix {
        Some(suffix) => format!("{plan_client_id}:{tag}:{suffix}"),
        None => format!("{plan_client_id}:{tag}"),
    }
}

// =============================================================================
// Order specification
// =============================================================================

/// Everything needed to create and submit one order.
#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub decision_id: Option<String>,
    pub client_order_id: String,
    pub tag: OrderTag,
    pub parent_group: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    /// Kill-switch path: priority tokens, never queue-rejected.
    pub priority: bool,
}

// =============================================================================
// Engine
// =============================================================================

/// Routes order specs through the store-first idempotency check, the rate
/// limiter, and the broker, with classified retries.
pub struct ExecutionEngine {
    broker: Arc<dyn BrokerPort>,
    store: Arc<Store>,
    limiter: Arc<RateLimiter>,
}

impl ExecutionEngine {
    pub fn new(broker: Arc<dyn BrokerPort>, store: Arc<Store>, limiter: Arc<RateLimiter>) -> Self {
        Self { broker, store, limiter }
    }

    /// Place an order idempotently. Replaying the same spec any number of
    /// times yields exactly one live order row.
    pub async fn submit(&self, spec: OrderSpec) -> Result<OrderRecord, BrokerError> {
        // Short-circuit: the id is already live at the broker.
        if self
            .store
            .order_exists_live(&spec.client_order_id)
            .map_err(|e| BrokerError::fatal(format!("store read failed: {e}")))?
        {
            info!(client_order_id = %spec.client_order_id, "placement short-circuited (already live)");
            return self
                .existing_row(&spec.client_order_id)
                .ok_or_else(|| BrokerError::fatal("live order row vanished"));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let row = OrderRecord {
            id: Uuid::new_v4().to_string(),
            decision_id: spec.decision_id.clone(),
            client_order_id: spec.client_order_id.clone(),
            tag: spec.tag,
            parent_group: spec.parent_group.clone(),
            symbol: spec.symbol.clone(),
            side: spec.side,
            qty: spec.qty,
            filled_qty: 0,
            price: spec.price,
            avg_fill_price: None,
            order_type: spec.order_type,
            status: OrderStatus::New,
            broker_id: None,
            ts_created: now,
            ts_acked: None,
            ts_filled: None,
        };

        match self
            .store
            .insert_order(&row)
            .map_err(|e| BrokerError::fatal(format!("store insert failed: {e}")))?
        {
            InsertOutcome::Inserted => {}
            InsertOutcome::Duplicate => {
                // Integrity class: another path already owns this id.
                info!(client_order_id = %spec.client_order_id, "duplicate id at store — idempotent success");
                return self
                    .existing_row(&spec.client_order_id)
                    .ok_or_else(|| BrokerError::fatal("duplicate order row vanished"));
            }
        }

        self.drive_to_broker(&spec).await?;

        self.existing_row(&spec.client_order_id)
            .ok_or_else(|| BrokerError::fatal("order row vanished after ack"))
    }

    /// The broker call with classified retries; updates the row on outcome.
    async fn drive_to_broker(&self, spec: &OrderSpec) -> Result<(), BrokerError> {
        let req = OrderRequest {
            client_order_id: spec.client_order_id.clone(),
            symbol: spec.symbol.clone(),
            side: spec.side,
            qty: spec.qty,
            order_type: spec.order_type,
            price: spec.price,
        };

        let mut token_refreshed = false;
        let mut attempt: u32 = 0;

        loop {
            self.acquire_token(spec.priority).await?;

            let submit_at = std::time::Instant::now();
            match self.broker.place_order(&req).await {
                Ok(ack) => {
                    self.store
                        .mark_order_acked(&spec.client_order_id, &ack.broker_id, ack.ack_ts)
                        .map_err(|e| BrokerError::fatal(format!("store ack failed: {e}")))?;
                    metrics::inc_orders_placed();
                    metrics::observe_order_latency_ms(submit_at.elapsed().as_millis() as f64);
                    debug!(
                        client_order_id = %spec.client_order_id,
                        broker_id = %ack.broker_id,
                        tag = %spec.tag,
                        "order placed"
                    );
                    return Ok(());
                }
                Err(e) => match e.class {
                    ErrorClass::Transient => {
                        attempt += 1;
                        metrics::inc_retry("transient");
                        if attempt >= MAX_ATTEMPTS {
                            warn!(client_order_id = %spec.client_order_id, error = %e, "retries exhausted");
                            self.mark_rejected(&spec.client_order_id);
                            return Err(e);
                        }
                        let delay = retry_backoff(attempt - 1);
                        debug!(
                            client_order_id = %spec.client_order_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "transient placement failure — backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    ErrorClass::Auth if !token_refreshed => {
                        metrics::inc_retry("auth");
                        warn!(client_order_id = %spec.client_order_id, "auth failure — refreshing token once");
                        self.broker.refresh_token().await?;
                        token_refreshed = true;
                    }
                    _ => {
                        warn!(
                            client_order_id = %spec.client_order_id,
                            class = e.class.as_str(),
                            error = %e,
                            "placement failed terminally"
                        );
                        self.mark_rejected(&spec.client_order_id);
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Cancel an order; an already-terminal order at the broker counts as
    /// success (the cancel raced a fill or a prior cancel).
    pub async fn cancel(&self, client_order_id: &str, priority: bool) -> Result<(), BrokerError> {
        let mut attempt: u32 = 0;
        loop {
            self.acquire_token(priority).await?;
            match self.broker.cancel_order(client_order_id).await {
                Ok(()) => return Ok(()),
                Err(e) if e.class == ErrorClass::Business => {
                    // Already filled/cancelled at the broker: reconciliation
                    // via the order stream will settle the row.
                    debug!(client_order_id, error = %e, "cancel raced a terminal state");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    metrics::inc_retry("transient");
                    if attempt >= CANCEL_ATTEMPTS {
                        return Err(e);
                    }
                    tokio::time::sleep(retry_backoff(attempt - 1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Adjust a resting order's qty (STOP partial → TP remainder resize).
    pub async fn modify(
        &self,
        client_order_id: &str,
        new_price: f64,
        new_qty: i64,
    ) -> Result<(), BrokerError> {
        self.limiter.acquire(EndpointClass::Modify).await?;
        self.broker.modify_order(client_order_id, new_price, new_qty).await
    }

    async fn acquire_token(&self, priority: bool) -> Result<(), BrokerError> {
        if priority {
            self.limiter.acquire_priority(EndpointClass::Orders).await
        } else {
            self.limiter.acquire(EndpointClass::Orders).await
        }
    }

    fn existing_row(&self, client_order_id: &str) -> Option<OrderRecord> {
        self.store.order_by_client_id(client_order_id).ok().flatten()
    }

    fn mark_rejected(&self, client_order_id: &str) {
        if let Err(e) = self.store.mark_order_rejected(client_order_id) {
            warn!(client_order_id, error = %e, "failed to mark order rejected");
        }
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    let ms = RETRY_BASE.as_millis() as u64 * 2u64.saturating_pow(attempt.min(16));
    Duration::from_millis(ms.min(RETRY_CAP.as_millis() as u64))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::broker::{BrokerAck, OrderEvent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    #[test]
    fn canonical_numbers() {
        assert_eq!(canonical_number(21480.0), "21480");
        assert_eq!(canonical_number(21480.05), "21480.05");
        assert_eq!(canonical_number(21480.5), "21480.5");
        assert_eq!(canonical_number(0.0), "0");
    }

    #[test]
    fn plan_id_matches_sha1_prefix_exactly() {
        let id = plan_client_id("NIFTY", Side::Long, 21480.0, 21385.0, 21623.0, 50, "ORB", "abc123");
        let expected = {
            let digest = Sha1::digest("NIFTY|LONG|21480|21385|21623|50|ORB|abc123".as_bytes());
            hex::encode(digest)[..24].to_string()
        };
        assert_eq!(id, expected);
        assert_eq!(id.len(), 24);
    }

    #[test]
    fn plan_id_is_stable_and_input_sensitive() {
        let a = plan_client_id("NIFTY", Side::Long, 21480.0, 21385.0, 21623.0, 50, "ORB", "abc123");
        let b = plan_client_id("NIFTY", Side::Long, 21480.0, 21385.0, 21623.0, 50, "ORB", "abc123");
        let c = plan_client_id("NIFTY", Side::Long, 21480.0, 21385.0, 21623.0, 100, "ORB", "abc123");
        let d = plan_client_id("NIFTY", Side::Long, 21480.0, 21385.0, 21623.0, 50, "ORB", "zzz999");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn order_ids_compose_plan_tag_suffix() {
        assert_eq!(order_client_id("abc", OrderTag::Entry, None), "abc:ENTRY");
        assert_eq!(order_client_id("abc", OrderTag::Stop, None), "abc:STOP");
        assert_eq!(order_client_id("abc", OrderTag::Stop, Some(2)), "abc:STOP:2");
    }

    #[test]
    fn backoff_ladder() {
        assert_eq!(retry_backoff(0), Duration::from_millis(200));
        assert_eq!(retry_backoff(1), Duration::from_millis(400));
        assert_eq!(retry_backoff(2), Duration::from_millis(800));
        assert_eq!(retry_backoff(3), Duration::from_millis(1600));
        assert_eq!(retry_backoff(4), Duration::from_secs(3));
        assert_eq!(retry_backoff(9), Duration::from_secs(3));
    }

    fn spec(coid: &str) -> OrderSpec {
        OrderSpec {
            decision_id: None,
            client_order_id: coid.to_string(),
            tag: OrderTag::Entry,
            parent_group: "grp".to_string(),
            symbol: "NIFTY".to_string(),
            side: OrderSide::Buy,
            qty: 50,
            order_type: OrderType::Limit,
            price: Some(21480.0),
            priority: false,
        }
    }

    #[tokio::test]
    async fn replayed_submit_yields_exactly_one_row() {
        let broker = Arc::new(PaperBroker::new());
        broker.on_tick("NIFTY", 21470.0);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine =
            ExecutionEngine::new(broker.clone(), store.clone(), Arc::new(RateLimiter::new()));

        let first = engine.submit(spec("p1:ENTRY")).await.unwrap();
        assert_eq!(first.status, OrderStatus::Placed);

        let second = engine.submit(spec("p1:ENTRY")).await.unwrap();
        assert_eq!(second.client_order_id, first.client_order_id);
        assert_eq!(second.id, first.id);
    }

    /// Broker double that fails a configurable number of times per class.
    struct FlakyBroker {
        inner: PaperBroker,
        failures_left: AtomicU32,
        error: BrokerError,
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl BrokerPort for FlakyBroker {
        async fn place_order(&self, req: &OrderRequest) -> Result<BrokerAck, BrokerError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            self.inner.place_order(req).await
        }

        async fn cancel_order(&self, coid: &str) -> Result<(), BrokerError> {
            self.inner.cancel_order(coid).await
        }

        async fn modify_order(&self, coid: &str, p: f64, q: i64) -> Result<(), BrokerError> {
            self.inner.modify_order(coid, p, q).await
        }

        fn order_events(&self) -> broadcast::Receiver<OrderEvent> {
            self.inner.order_events()
        }

        async fn poll_orders(&self) -> Result<Vec<OrderEvent>, BrokerError> {
            self.inner.poll_orders().await
        }

        async fn quote(&self, symbol: &str) -> Result<crate::types::Quote, BrokerError> {
            self.inner.quote(symbol).await
        }

        async fn refresh_token(&self) -> Result<(), BrokerError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let inner = PaperBroker::new();
        inner.on_tick("NIFTY", 21470.0);
        let broker = Arc::new(FlakyBroker {
            inner,
            failures_left: AtomicU32::new(2),
            error: BrokerError::transient("503"),
            refreshes: AtomicU32::new(0),
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine =
            ExecutionEngine::new(broker.clone(), store.clone(), Arc::new(RateLimiter::new()));

        let row = engine.submit(spec("p2:ENTRY")).await.unwrap();
        assert_eq!(row.status, OrderStatus::Placed);
    }

    #[tokio::test]
    async fn validation_failure_rejects_without_retry() {
        let inner = PaperBroker::new();
        inner.on_tick("NIFTY", 21470.0);
        let broker = Arc::new(FlakyBroker {
            inner,
            failures_left: AtomicU32::new(99),
            error: BrokerError::validation("price outside band"),
            refreshes: AtomicU32::new(0),
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine =
            ExecutionEngine::new(broker.clone(), store.clone(), Arc::new(RateLimiter::new()));

        let err = engine.submit(spec("p3:ENTRY")).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Validation);
        // Exactly one broker attempt was consumed.
        assert_eq!(broker.failures_left.load(Ordering::SeqCst), 98);

        let row = store.order_by_client_id("p3:ENTRY").unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn auth_failure_refreshes_token_once_then_retries() {
        let inner = PaperBroker::new();
        inner.on_tick("NIFTY", 21470.0);
        let broker = Arc::new(FlakyBroker {
            inner,
            failures_left: AtomicU32::new(1),
            error: BrokerError::auth("401"),
            refreshes: AtomicU32::new(0),
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine =
            ExecutionEngine::new(broker.clone(), store.clone(), Arc::new(RateLimiter::new()));

        let row = engine.submit(spec("p4:ENTRY")).await.unwrap();
        assert_eq!(row.status, OrderStatus::Placed);
        assert_eq!(broker.refreshes.load(Ordering::SeqCst), 1);
    }
}
