// =============================================================================
// OCOManager — entry+stop+tp lifecycle with crash-safe recovery
// =============================================================================
//
// State machine per group:
//
//   AWAITING_ENTRY
//     ├─ entry FILLED           → ARMED (place STOP and TP concurrently)
//     ├─ entry REJECTED/CANCEL  → CLOSED (no children)
//   ARMED
//     ├─ STOP FILLED   → CHILD_FILLED (cancel TP)
//     ├─ TP FILLED     → CHILD_FILLED (cancel STOP)
//     ├─ STOP PARTIAL  → ARMED (adjust TP qty to remainder)
//   CHILD_FILLED
//     ├─ sibling ack CANCELED → CLOSED
//
// Single-flight: a per-group async mutex guarantees at most one
// child-placement attempt even when the order watcher replays the entry fill
// after a reconnect; the store's `order_exists` check and UNIQUE constraint
// back that up.
//
// Group identity is the plan fingerprint, so everything a group needs can be
// reconstructed from persisted rows: the recovery pass rebuilds groups for
// open positions, replaces missing children under their deterministic ids,
// and finishes pending sibling cancels.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::broker::BrokerError;
use crate::execution::{order_client_id, ExecutionEngine, OrderSpec};
use crate::metrics;
use crate::store::models::OrderRecord;
use crate::store::Store;
use crate::types::{OcoState, OrderStatus, OrderTag, OrderType, Side};

/// The plan behind a group: prices and size for the three legs.
#[derive(Debug, Clone)]
pub struct OcoPlan {
    /// Group id == plan fingerprint.
    pub group: String,
    pub decision_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub entry: f64,
    pub stop: f64,
    pub tp: f64,
}

/// What a recovery pass did.
#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct RecoveryReport {
    pub groups_checked: usize,
    pub children_replaced: usize,
    pub siblings_canceled: usize,
}

pub struct OcoManager {
    store: Arc<Store>,
    execution: Arc<ExecutionEngine>,
    plans: RwLock<HashMap<String, OcoPlan>>,
    states: RwLock<HashMap<String, OcoState>>,
    locks: RwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl OcoManager {
    pub fn new(store: Arc<Store>, execution: Arc<ExecutionEngine>) -> Self {
        Self {
            store,
            execution,
            plans: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a fresh group in AWAITING_ENTRY.
    pub fn register(&self, plan: OcoPlan) {
        self.states.write().insert(plan.group.clone(), OcoState::AwaitingEntry);
        self.plans.write().insert(plan.group.clone(), plan);
    }

    pub fn state(&self, group: &str) -> Option<OcoState> {
        self.states.read().get(group).copied()
    }

    fn set_state(&self, group: &str, state: OcoState) {
        self.states.write().insert(group.to_string(), state);
    }

    fn lock_for(&self, group: &str) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.locks.read().get(group) {
            return lock.clone();
        }
        self.locks
            .write()
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Entry fill → arm children
    // -------------------------------------------------------------------------

    /// Place STOP and TP for a filled entry. Idempotent: replayed entry-fill
    /// events take the group lock, see ARMED, and do nothing.
    ///
    /// Children are sized to the entry's cumulative filled quantity.
    pub async fn arm(&self, group: &str, filled_qty: i64) -> Result<(String, String), BrokerError> {
        let lock = self.lock_for(group);
        let _guard = lock.lock().await;

        let stop_coid = order_client_id(group, OrderTag::Stop, None);
        let tp_coid = order_client_id(group, OrderTag::Tp, None);

        match self.state(group) {
            Some(OcoState::AwaitingEntry) | None => {}
            _ => {
                // Replayed event after the group already armed/closed.
                return Ok((stop_coid, tp_coid));
            }
        }

        let plan = self
            .plan_for(group)
            .map_err(|e| BrokerError::fatal(format!("no plan for group {group}: {e}")))?;
        let qty = if filled_qty > 0 { filled_qty } else { plan.qty };

        let stop_spec = OrderSpec {
            decision_id: Some(plan.decision_id.clone()),
            client_order_id: stop_coid.clone(),
            tag: OrderTag::Stop,
            parent_group: group.to_string(),
            symbol: plan.symbol.clone(),
            side: plan.side.exit_order_side(),
            qty,
            order_type: OrderType::SlM,
            price: Some(plan.stop),
            priority: false,
        };
        let tp_spec = OrderSpec {
            decision_id: Some(plan.decision_id.clone()),
            client_order_id: tp_coid.clone(),
            tag: OrderTag::Tp,
            parent_group: group.to_string(),
            symbol: plan.symbol.clone(),
            side: plan.side.exit_order_side(),
            qty,
            order_type: OrderType::Limit,
            price: Some(plan.tp),
            priority: false,
        };

        let (stop_res, tp_res) =
            tokio::join!(self.execution.submit(stop_spec), self.execution.submit(tp_spec));
        stop_res?;
        tp_res?;

        self.set_state(group, OcoState::Armed);
        metrics::inc_oco_children(2);
        info!(group, qty, "OCO group armed (STOP + TP placed)");
        Ok((stop_coid, tp_coid))
    }

    /// Entry rejected or cancelled before filling: the group ends childless.
    pub async fn entry_terminated(&self, group: &str) {
        let lock = self.lock_for(group);
        let _guard = lock.lock().await;
        if matches!(self.state(group), Some(OcoState::AwaitingEntry) | None) {
            self.set_state(group, OcoState::Closed);
            info!(group, "OCO group closed without children (entry terminal)");
        }
    }

    // -------------------------------------------------------------------------
    // Child fill → cancel sibling
    // -------------------------------------------------------------------------

    /// A STOP or TP filled: transition to CHILD_FILLED and cancel the
    /// sibling. Returns the sibling's client order id when a cancel was
    /// issued.
    ///
    /// Cancel failures after retries bubble up so the orchestrator can run
    /// the kill-switch flatten for the underlying position.
    pub async fn child_filled(
        &self,
        group: &str,
        filled_tag: OrderTag,
    ) -> Result<Option<String>, BrokerError> {
        let lock = self.lock_for(group);
        let _guard = lock.lock().await;

        if self.state(group) == Some(OcoState::ChildFilled) {
            // Replayed fill event; the sibling cancel is already in flight.
            return Ok(None);
        }
        self.set_state(group, OcoState::ChildFilled);

        let sibling_tag = match filled_tag {
            OrderTag::Stop => OrderTag::Tp,
            OrderTag::Tp => OrderTag::Stop,
            other => {
                return Err(BrokerError::fatal(format!(
                    "child_filled called with non-child tag {other}"
                )))
            }
        };
        let sibling_coid = order_client_id(group, sibling_tag, None);

        let sibling = self
            .store
            .order_by_client_id(&sibling_coid)
            .map_err(|e| BrokerError::fatal(format!("store read failed: {e}")))?;

        match sibling {
            Some(ref row) if !row.status.is_terminal() => {
                // Exits outrank entries at the throttle.
                self.execution.cancel(&sibling_coid, true).await?;
                info!(group, sibling = %sibling_coid, "sibling cancel issued");
                Ok(Some(sibling_coid))
            }
            _ => {
                // Sibling never existed or is already terminal.
                self.set_state(group, OcoState::Closed);
                Ok(None)
            }
        }
    }

    /// The sibling's CANCELED ack arrived: the group is done.
    pub fn sibling_canceled(&self, group: &str) {
        if self.state(group) == Some(OcoState::ChildFilled) {
            self.set_state(group, OcoState::Closed);
            info!(group, "OCO group closed (sibling canceled)");
        }
    }

    /// STOP partially filled: shrink the TP to the position remainder so the
    /// two children keep covering exactly the open quantity.
    pub async fn stop_partial(&self, group: &str, stop_filled_qty: i64) -> Result<(), BrokerError> {
        let lock = self.lock_for(group);
        let _guard = lock.lock().await;

        if self.state(group) != Some(OcoState::Armed) {
            return Ok(());
        }

        let plan = self
            .plan_for(group)
            .map_err(|e| BrokerError::fatal(format!("no plan for group {group}: {e}")))?;
        let remainder = (plan.qty - stop_filled_qty).max(0);
        if remainder == 0 {
            return Ok(());
        }

        let tp_coid = order_client_id(group, OrderTag::Tp, None);
        self.execution.modify(&tp_coid, plan.tp, remainder).await?;
        info!(group, remainder, "TP resized after partial STOP fill");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Plan resolution
    // -------------------------------------------------------------------------

    /// The in-memory registry, or a reconstruction from persisted rows (the
    /// path recovery and post-restart callbacks take).
    fn plan_for(&self, group: &str) -> Result<OcoPlan> {
        if let Some(plan) = self.plans.read().get(group) {
            return Ok(plan.clone());
        }
        let plan = self.plan_from_store(group)?;
        self.plans.write().insert(group.to_string(), plan.clone());
        Ok(plan)
    }

    fn plan_from_store(&self, group: &str) -> Result<OcoPlan> {
        let orders = self.store.orders_by_group(group)?;
        let entry = orders
            .iter()
            .find(|o| o.tag == OrderTag::Entry)
            .with_context(|| format!("group {group} has no entry order"))?;

        let side = match entry.side {
            crate::types::OrderSide::Buy => Side::Long,
            crate::types::OrderSide::Sell => Side::Short,
        };
        let entry_price = entry.avg_fill_price.or(entry.price).unwrap_or(0.0);

        // Child rows carry their own prices; fall back to the signal's
        // feature snapshot when a child was never placed.
        let stop_row = orders.iter().find(|o| o.tag == OrderTag::Stop);
        let tp_row = orders.iter().find(|o| o.tag == OrderTag::Tp);

        let (mut stop, mut tp) = (
            stop_row.and_then(|o| o.price),
            tp_row.and_then(|o| o.price),
        );

        let decision_id = entry
            .decision_id
            .clone()
            .with_context(|| format!("entry order in group {group} has no decision"))?;

        if stop.is_none() || tp.is_none() {
            let decision = self
                .store
                .decision_by_id(&decision_id)?
                .with_context(|| format!("decision {decision_id} missing"))?;
            let features = self
                .store
                .signal_features(&decision.signal_id)?
                .with_context(|| format!("signal {} missing features", decision.signal_id))?;
            stop = stop.or_else(|| features.get("plan_stop").copied());
            tp = tp.or_else(|| features.get("plan_tp").copied());
        }

        Ok(OcoPlan {
            group: group.to_string(),
            decision_id,
            symbol: entry.symbol.clone(),
            side,
            qty: if entry.filled_qty > 0 { entry.filled_qty } else { entry.qty },
            entry: entry_price,
            stop: stop.with_context(|| format!("group {group}: stop price unrecoverable"))?,
            tp: tp.with_context(|| format!("group {group}: tp price unrecoverable"))?,
        })
    }

    // -------------------------------------------------------------------------
    // Crash-safe recovery
    // -------------------------------------------------------------------------

    /// Rebuild OCO groups for every open position in the store: replace
    /// missing children under their deterministic ids, finish pending sibling
    /// cancels, and restore in-memory state. Runs before scans resume.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let open_positions = self.store.open_positions()?;

        for position in &open_positions {
            let group = position.oco_group.clone();
            report.groups_checked += 1;

            let orders = self.store.orders_by_group(&group)?;
            let entry = orders.iter().find(|o| o.tag == OrderTag::Entry);
            let stop = orders.iter().find(|o| o.tag == OrderTag::Stop);
            let tp = orders.iter().find(|o| o.tag == OrderTag::Tp);

            let entry_filled = matches!(
                entry.map(|o| o.status),
                Some(OrderStatus::Filled) | Some(OrderStatus::Partial)
            );
            if !entry_filled {
                continue;
            }

            let filled_child =
                child_in_status(&[stop, tp], OrderStatus::Filled);

            if let Some(filled) = filled_child {
                // A child filled but the group never finished closing.
                self.set_state(&group, OcoState::ChildFilled);
                let sibling_tag = if filled.tag == OrderTag::Stop { OrderTag::Tp } else { OrderTag::Stop };
                let sibling_coid = order_client_id(&group, sibling_tag, None);
                if let Some(sibling) = self.store.order_by_client_id(&sibling_coid)? {
                    if !sibling.status.is_terminal() {
                        if let Err(e) = self.execution.cancel(&sibling_coid, true).await {
                            warn!(group = %group, error = %e, "recovery: sibling cancel failed");
                        } else {
                            report.siblings_canceled += 1;
                        }
                    }
                }
                continue;
            }

            // Entry filled, no child filled: both children must be live.
            let missing_children = [
                (stop, OrderTag::Stop),
                (tp, OrderTag::Tp),
            ]
            .iter()
            .filter(|(row, _)| {
                row.map(|o| matches!(o.status, OrderStatus::Canceled | OrderStatus::Rejected))
                    .unwrap_or(true)
            })
            .count();

            if missing_children > 0 {
                // Force a fresh arm under the deterministic child ids; the
                // store short-circuits any child that is in fact still live.
                self.set_state(&group, OcoState::AwaitingEntry);
                let filled_qty = entry.map(|o| o.filled_qty).unwrap_or(position.qty);
                match self.arm(&group, filled_qty).await {
                    Ok((stop_coid, tp_coid)) => {
                        report.children_replaced += missing_children;
                        self.store.set_position_children(&position.id, &stop_coid, &tp_coid)?;
                    }
                    Err(e) => warn!(group = %group, error = %e, "recovery: child replacement failed"),
                }
            } else {
                self.set_state(&group, OcoState::Armed);
            }
        }

        info!(
            groups = report.groups_checked,
            replaced = report.children_replaced,
            canceled = report.siblings_canceled,
            "OCO recovery pass complete"
        );
        Ok(report)
    }
}

fn child_in_status<'a>(
    children: &[Option<&'a OrderRecord>],
    status: OrderStatus,
) -> Option<&'a OrderRecord> {
    children.iter().flatten().find(|o| o.status == status).copied()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperBroker;
    use crate::broker::rate_limit::RateLimiter;
    use crate::types::{OrderSide, PositionStatus};

    fn fixture() -> (Arc<Store>, Arc<PaperBroker>, Arc<OcoManager>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let broker = Arc::new(PaperBroker::new());
        broker.on_tick("NIFTY", 21480.0);
        let execution = Arc::new(ExecutionEngine::new(
            broker.clone(),
            store.clone(),
            Arc::new(RateLimiter::new()),
        ));
        let oco = Arc::new(OcoManager::new(store.clone(), execution));
        (store, broker, oco)
    }

    fn plan(group: &str) -> OcoPlan {
        OcoPlan {
            group: group.to_string(),
            decision_id: "d-1".to_string(),
            symbol: "NIFTY".to_string(),
            side: Side::Long,
            qty: 50,
            entry: 21480.0,
            stop: 21385.0,
            tp: 21623.0,
        }
    }

    fn entry_row(store: &Store, group: &str, status: OrderStatus, filled: i64) {
        store
            .insert_order(&OrderRecord {
                id: uuid::Uuid::new_v4().to_string(),
                decision_id: Some("d-1".to_string()),
                client_order_id: format!("{group}:ENTRY"),
                tag: OrderTag::Entry,
                parent_group: group.to_string(),
                symbol: "NIFTY".to_string(),
                side: OrderSide::Buy,
                qty: 50,
                filled_qty: filled,
                price: Some(21480.0),
                avg_fill_price: if filled > 0 { Some(21480.0) } else { None },
                order_type: OrderType::Limit,
                status,
                broker_id: Some("B-1".to_string()),
                ts_created: 1,
                ts_acked: Some(2),
                ts_filled: if filled > 0 { Some(3) } else { None },
            })
            .unwrap();
    }

    #[tokio::test]
    async fn arm_places_both_children_once() {
        let (store, _broker, oco) = fixture();
        oco.register(plan("g1"));
        entry_row(&store, "g1", OrderStatus::Filled, 50);

        let (stop_coid, tp_coid) = oco.arm("g1", 50).await.unwrap();
        assert_eq!(stop_coid, "g1:STOP");
        assert_eq!(tp_coid, "g1:TP");
        assert_eq!(oco.state("g1"), Some(OcoState::Armed));

        let stop = store.order_by_client_id("g1:STOP").unwrap().unwrap();
        assert_eq!(stop.status, OrderStatus::Placed);
        assert_eq!(stop.side, OrderSide::Sell);
        assert_eq!(stop.qty, 50);

        // Replayed entry-fill event: no second placement attempt.
        let first_row_id = stop.id.clone();
        oco.arm("g1", 50).await.unwrap();
        let stop_again = store.order_by_client_id("g1:STOP").unwrap().unwrap();
        assert_eq!(stop_again.id, first_row_id);
    }

    #[tokio::test]
    async fn entry_rejection_closes_group_childless() {
        let (store, _broker, oco) = fixture();
        oco.register(plan("g2"));
        entry_row(&store, "g2", OrderStatus::Rejected, 0);

        oco.entry_terminated("g2").await;
        assert_eq!(oco.state("g2"), Some(OcoState::Closed));
        assert!(store.order_by_client_id("g2:STOP").unwrap().is_none());
    }

    #[tokio::test]
    async fn child_fill_cancels_sibling() {
        let (store, _broker, oco) = fixture();
        oco.register(plan("g3"));
        entry_row(&store, "g3", OrderStatus::Filled, 50);
        oco.arm("g3", 50).await.unwrap();

        let sibling = oco.child_filled("g3", OrderTag::Stop).await.unwrap();
        assert_eq!(sibling.as_deref(), Some("g3:TP"));
        assert_eq!(oco.state("g3"), Some(OcoState::ChildFilled));

        oco.sibling_canceled("g3");
        assert_eq!(oco.state("g3"), Some(OcoState::Closed));
    }

    #[tokio::test]
    async fn replayed_child_fill_is_single_flight() {
        let (store, _broker, oco) = fixture();
        oco.register(plan("g4"));
        entry_row(&store, "g4", OrderStatus::Filled, 50);
        oco.arm("g4", 50).await.unwrap();

        let first = oco.child_filled("g4", OrderTag::Tp).await.unwrap();
        assert!(first.is_some());
        let replay = oco.child_filled("g4", OrderTag::Tp).await.unwrap();
        assert!(replay.is_none());
    }

    #[tokio::test]
    async fn recovery_replaces_missing_children() {
        let (store, _broker, oco) = fixture();
        // Persisted world: entry filled, position open, children never placed
        // (crash between fill callback and child placement). Signal features
        // carry the plan prices.
        store
            .insert_signal(&crate::store::models::SignalRecord {
                id: "s-1".to_string(),
                ts: 1,
                symbol: "NIFTY".to_string(),
                side: Side::Long,
                strategy: "orb".to_string(),
                score: 0.5,
                features: [
                    ("plan_entry".to_string(), 21480.0),
                    ("plan_stop".to_string(), 21385.0),
                    ("plan_tp".to_string(), 21623.0),
                ]
                .into_iter()
                .collect(),
                config_sha: "sha".to_string(),
                rationale: "test".to_string(),
            })
            .unwrap();
        store
            .insert_decision(&crate::store::models::DecisionRecord {
                id: "d-1".to_string(),
                signal_id: "s-1".to_string(),
                client_plan_id: "g5".to_string(),
                mode: crate::types::TradingMode::Paper,
                approved: true,
                risk_pct: 0.5,
                risk_amount: 4750.0,
                qty: 50,
                portfolio_heat_before: 0.0,
                portfolio_heat_after: 4750.0,
                status: crate::store::models::DecisionStatus::Executed,
                config_sha: "sha".to_string(),
                ts: 1,
            })
            .unwrap();
        entry_row(&store, "g5", OrderStatus::Filled, 50);
        store
            .insert_position(&crate::store::models::PositionRecord {
                id: "pos-1".to_string(),
                symbol: "NIFTY".to_string(),
                side: Side::Long,
                qty: 50,
                avg_entry: 21480.0,
                oco_group: "g5".to_string(),
                stop_order_id: None,
                tp_order_id: None,
                status: PositionStatus::Opening,
                ts_opened: 1,
                ts_closed: None,
            })
            .unwrap();

        let report = oco.recover().await.unwrap();
        assert_eq!(report.groups_checked, 1);
        assert_eq!(report.children_replaced, 2);

        // Deterministic ids, sized to the position, resting at plan prices.
        let stop = store.order_by_client_id("g5:STOP").unwrap().unwrap();
        let tp = store.order_by_client_id("g5:TP").unwrap().unwrap();
        assert_eq!(stop.status, OrderStatus::Placed);
        assert_eq!(stop.price, Some(21385.0));
        assert_eq!(tp.price, Some(21623.0));
        assert_eq!(oco.state("g5"), Some(OcoState::Armed));

        let position = store.position_by_id("pos-1").unwrap().unwrap();
        assert_eq!(position.stop_order_id.as_deref(), Some("g5:STOP"));
        assert_eq!(position.tp_order_id.as_deref(), Some("g5:TP"));
    }

    #[tokio::test]
    async fn recovery_finishes_pending_sibling_cancel() {
        let (store, broker, oco) = fixture();
        entry_row(&store, "g6", OrderStatus::Filled, 50);

        // Stop filled; TP still live at the broker (cancel never happened).
        let exec = ExecutionEngine::new(
            broker.clone(),
            store.clone(),
            Arc::new(RateLimiter::new()),
        );
        exec.submit(OrderSpec {
            decision_id: None,
            client_order_id: "g6:TP".to_string(),
            tag: OrderTag::Tp,
            parent_group: "g6".to_string(),
            symbol: "NIFTY".to_string(),
            side: OrderSide::Sell,
            qty: 50,
            order_type: OrderType::Limit,
            price: Some(21623.0),
            priority: false,
        })
        .await
        .unwrap();
        store
            .insert_order(&OrderRecord {
                id: uuid::Uuid::new_v4().to_string(),
                decision_id: None,
                client_order_id: "g6:STOP".to_string(),
                tag: OrderTag::Stop,
                parent_group: "g6".to_string(),
                symbol: "NIFTY".to_string(),
                side: OrderSide::Sell,
                qty: 50,
                filled_qty: 50,
                price: Some(21385.0),
                avg_fill_price: Some(21385.0),
                order_type: OrderType::SlM,
                status: OrderStatus::Filled,
                broker_id: Some("B-9".to_string()),
                ts_created: 1,
                ts_acked: Some(2),
                ts_filled: Some(3),
            })
            .unwrap();
        store
            .insert_position(&crate::store::models::PositionRecord {
                id: "pos-2".to_string(),
                symbol: "NIFTY".to_string(),
                side: Side::Long,
                qty: 50,
                avg_entry: 21480.0,
                oco_group: "g6".to_string(),
                stop_order_id: Some("g6:STOP".to_string()),
                tp_order_id: Some("g6:TP".to_string()),
                status: PositionStatus::Open,
                ts_opened: 1,
                ts_closed: None,
            })
            .unwrap();

        let report = oco.recover().await.unwrap();
        assert_eq!(report.siblings_canceled, 1);
        assert_eq!(oco.state("g6"), Some(OcoState::ChildFilled));
    }
}
