// =============================================================================
// End-to-end engine scenarios through the paper broker
// =============================================================================
//
// These tests wire the real pipeline — store, execution, OCO manager,
// orchestrator, order watcher — against the paper broker and drive it with
// synthetic quotes: deterministic ids, duplicate-plan short-circuits, the
// entry → stop-fill → sibling-cancel lifecycle, bounded flatten, warm-restart
// recovery, and mode gating.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};

use meridian_bot::app_state::AppState;
use meridian_bot::broker::paper::PaperBroker;
use meridian_bot::broker::rate_limit::RateLimiter;
use meridian_bot::broker::ModalBroker;
use meridian_bot::bus::EventBus;
use meridian_bot::clock::{Clock, MarketHoursGate};
use meridian_bot::config::Config;
use meridian_bot::execution::{order_client_id, plan_client_id, ExecutionEngine};
use meridian_bot::market_data::MarketDataHub;
use meridian_bot::oco::OcoManager;
use meridian_bot::orchestrator::{ModeError, Orchestrator, LIVE_CONFIRM_PHRASE};
use meridian_bot::risk::RiskEngine;
use meridian_bot::store::models::{
    AuditAction, DecisionRecord, DecisionStatus, OrderRecord, PositionRecord, SignalRecord,
};
use meridian_bot::store::Store;
use meridian_bot::strategy::{SignalContext, SignalDraft, Strategy};
use meridian_bot::types::{
    OcoState, OrderSide, OrderStatus, OrderTag, OrderType, PositionStatus, Quote, Side, Tick,
    TradingMode,
};
use meridian_bot::watcher::OrderWatcher;

/// Pinned to a mid-session weekday instant (10:30 IST, Wed 2026-07-29).
struct FixedClock(DateTime<Utc>);

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

fn session_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 7, 29, 5, 0, 0).unwrap()))
}

/// A strategy that emits one fixed plan per scan for its symbol.
struct FixedSignal {
    symbol: String,
    side: Side,
    entry: f64,
    stop: f64,
    tp: f64,
}

impl Strategy for FixedSignal {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn generate_signals(&self, ctx: &SignalContext<'_>) -> Vec<SignalDraft> {
        if ctx.instrument.symbol != self.symbol {
            return Vec::new();
        }
        vec![SignalDraft {
            symbol: self.symbol.clone(),
            side: self.side,
            strategy: self.name(),
            entry: self.entry,
            stop: self.stop,
            tp: self.tp,
            score: 0.9,
            features: BTreeMap::new(),
            rationale: "fixed test signal".to_string(),
        }]
    }
}

struct Harness {
    app: Arc<AppState>,
    store: Arc<Store>,
    paper: Arc<PaperBroker>,
    orchestrator: Arc<Orchestrator>,
}

impl Harness {
    async fn new(strategies: Vec<Box<dyn Strategy>>) -> Self {
        let config = Arc::new(Config::default());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::default();
        let market = Arc::new(MarketDataHub::new(bus.clone()));
        let app = Arc::new(AppState::new(config.clone(), store.clone(), market.clone(), bus));

        let paper = Arc::new(PaperBroker::new());
        let modal = ModalBroker::new(paper.clone(), None);
        let limiter = Arc::new(RateLimiter::new());
        let execution = Arc::new(ExecutionEngine::new(modal.clone(), store.clone(), limiter.clone()));
        let oco = Arc::new(OcoManager::new(store.clone(), execution.clone()));

        let orchestrator = Arc::new(Orchestrator::new(
            app.clone(),
            MarketHoursGate::from_config(&config).unwrap(),
            session_clock(),
            RiskEngine::from_config(&config),
            execution,
            oco,
            modal.clone(),
            limiter,
            strategies,
        ));
        orchestrator.startup().await.unwrap();

        let watcher = Arc::new(OrderWatcher::new(app.clone(), orchestrator.clone(), modal));
        tokio::spawn(watcher.run());

        Self { app, store, paper, orchestrator }
    }

    /// Seed the broker and the hub with a pinned quote.
    fn quote(&self, symbol: &str, last: f64, bid: f64, ask: f64) {
        self.paper.set_quote(symbol, Quote { last, bid, ask, ts: 1 });
        self.app.market.apply_tick(Tick {
            token: 1,
            symbol: symbol.to_string(),
            last,
            bid,
            ask,
            ts: 1,
        });
    }

    async fn wait_until<F: Fn() -> bool>(&self, what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for: {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn nifty_strategy() -> Box<dyn Strategy> {
    Box::new(FixedSignal {
        symbol: "NIFTY".to_string(),
        side: Side::Long,
        entry: 21480.0,
        stop: 21385.0,
        tp: 21623.0,
    })
}

// =============================================================================
// Deterministic id + duplicate-plan short circuit
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_plan_injection_writes_no_second_order() {
    let h = Harness::new(vec![nifty_strategy()]).await;
    h.quote("NIFTY", 21480.0, 21479.0, 21480.0);

    h.orchestrator.scan_once().await.unwrap();

    let plan = plan_client_id(
        "NIFTY",
        Side::Long,
        21480.0,
        21385.0,
        21623.0,
        50,
        "fixed",
        &h.app.config_sha,
    );
    let entry_coid = order_client_id(&plan, OrderTag::Entry, None);
    let entry = h.store.order_by_client_id(&entry_coid).unwrap().unwrap();
    assert_eq!(entry.qty, 50);
    let first_row_id = entry.id.clone();

    // Same plan injected again within the session: the original plan id
    // stands and no new order row is written.
    h.orchestrator.scan_once().await.unwrap();

    let entry_again = h.store.order_by_client_id(&entry_coid).unwrap().unwrap();
    assert_eq!(entry_again.id, first_row_id);

    let decisions = h.store.decisions_since(0).unwrap();
    let approved: Vec<_> = decisions.iter().filter(|d| d.approved).collect();
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].client_plan_id, plan);
}

// =============================================================================
// Entry fill → children armed → stop fill → TP canceled → trade booked
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn entry_then_stop_fill_cancels_tp_and_books_trade() {
    let h = Harness::new(vec![nifty_strategy()]).await;
    h.quote("NIFTY", 21480.0, 21479.0, 21480.0);

    h.orchestrator.scan_once().await.unwrap();

    let plan = plan_client_id(
        "NIFTY",
        Side::Long,
        21480.0,
        21385.0,
        21623.0,
        50,
        "fixed",
        &h.app.config_sha,
    );
    let stop_coid = order_client_id(&plan, OrderTag::Stop, None);
    let tp_coid = order_client_id(&plan, OrderTag::Tp, None);

    // Entry fills (marketable), watcher arms the children and attaches them
    // to the position.
    h.wait_until("children placed and position open", || {
        let children_live = h
            .store
            .order_by_client_id(&stop_coid)
            .unwrap()
            .map(|o| o.status == OrderStatus::Placed)
            .unwrap_or(false)
            && h.store
                .order_by_client_id(&tp_coid)
                .unwrap()
                .map(|o| o.status == OrderStatus::Placed)
                .unwrap_or(false);
        let position_open = h
            .store
            .position_by_group(&plan)
            .unwrap()
            .map(|p| p.status == PositionStatus::Open)
            .unwrap_or(false);
        children_live && position_open
    })
    .await;

    let position = h.store.position_by_group(&plan).unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.stop_order_id.as_deref(), Some(stop_coid.as_str()));

    // Price trades through the stop: STOP fills, sibling TP must reach
    // CANCELED and the position must close with a recorded trade.
    h.paper.on_tick("NIFTY", 21380.0);

    h.wait_until("TP canceled and position closed", || {
        let tp_done = h
            .store
            .order_by_client_id(&tp_coid)
            .unwrap()
            .map(|o| o.status == OrderStatus::Canceled)
            .unwrap_or(false);
        let closed = h
            .store
            .position_by_id(&position.id)
            .unwrap()
            .map(|p| p.status == PositionStatus::Closed)
            .unwrap_or(false);
        tp_done && closed
    })
    .await;

    let pnl = h.store.realized_net_pnl_since(0).unwrap();
    assert!(pnl < 0.0, "stop-loss exit must book a loss, got {pnl}");
    assert_eq!(h.store.open_positions().unwrap().len(), 0);
}

// =============================================================================
// Flatten under load: bounded, all positions out
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn flatten_under_load_is_bounded_and_complete() {
    let strategies: Vec<Box<dyn Strategy>> = vec![
        nifty_strategy(),
        Box::new(FixedSignal {
            symbol: "BANKNIFTY".to_string(),
            side: Side::Long,
            entry: 45_000.0,
            stop: 44_700.0,
            tp: 45_600.0,
        }),
    ];
    let h = Harness::new(strategies).await;
    h.quote("NIFTY", 21480.0, 21479.0, 21480.0);
    h.quote("BANKNIFTY", 45_000.0, 44_999.0, 45_000.0);

    h.orchestrator.scan_once().await.unwrap();

    // Two open positions with four resting children between them.
    h.wait_until("two positions open", || {
        let open = h.store.open_positions().unwrap();
        open.len() == 2 && open.iter().all(|p| p.status == PositionStatus::Open)
    })
    .await;
    assert_eq!(h.store.open_child_orders().unwrap().len(), 4);

    let summary = h.orchestrator.flatten("emergency").await;

    assert!(summary.complete, "flatten did not fully drain: {summary:?}");
    assert!(
        summary.duration_ms <= 2_000,
        "flatten exceeded its bound: {} ms",
        summary.duration_ms
    );
    assert_eq!(summary.positions.len(), 2);
    assert!(summary.positions.iter().all(|p| p.outcome == "closed"));
    assert_eq!(h.store.open_positions().unwrap().len(), 0);
    assert_eq!(h.store.open_orders().unwrap().len(), 0);
    assert_eq!(h.store.audit_count(AuditAction::Flatten).unwrap(), 1);

    // Flatten pauses new entries.
    assert!(h.app.coordinator_snapshot().paused);
}

// =============================================================================
// Warm restart: children replaced under identical deterministic ids
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn warm_restart_rearms_open_position_with_identical_ids() {
    // Persisted world from a previous run that crashed between the entry
    // fill and child placement.
    let store = Arc::new(Store::open_in_memory().unwrap());
    let group = "cafe0123456789abcdef0123";

    store
        .insert_signal(&SignalRecord {
            id: "s-1".to_string(),
            ts: 1,
            symbol: "NIFTY".to_string(),
            side: Side::Long,
            strategy: "fixed".to_string(),
            score: 0.9,
            features: [
                ("plan_entry".to_string(), 21480.0),
                ("plan_stop".to_string(), 21385.0),
                ("plan_tp".to_string(), 21623.0),
            ]
            .into_iter()
            .collect(),
            config_sha: "sha".to_string(),
            rationale: "crashed run".to_string(),
        })
        .unwrap();
    store
        .insert_decision(&DecisionRecord {
            id: "d-1".to_string(),
            signal_id: "s-1".to_string(),
            client_plan_id: group.to_string(),
            mode: TradingMode::Paper,
            approved: true,
            risk_pct: 0.5,
            risk_amount: 4_750.0,
            qty: 50,
            portfolio_heat_before: 0.0,
            portfolio_heat_after: 4_750.0,
            status: DecisionStatus::Executed,
            config_sha: "sha".to_string(),
            ts: 1,
        })
        .unwrap();
    store
        .insert_order(&OrderRecord {
            id: "o-entry".to_string(),
            decision_id: Some("d-1".to_string()),
            client_order_id: format!("{group}:ENTRY"),
            tag: OrderTag::Entry,
            parent_group: group.to_string(),
            symbol: "NIFTY".to_string(),
            side: OrderSide::Buy,
            qty: 50,
            filled_qty: 50,
            price: Some(21480.0),
            avg_fill_price: Some(21480.0),
            order_type: OrderType::Limit,
            status: OrderStatus::Filled,
            broker_id: Some("B-1".to_string()),
            ts_created: 1,
            ts_acked: Some(2),
            ts_filled: Some(3),
        })
        .unwrap();
    store
        .insert_position(&PositionRecord {
            id: "pos-1".to_string(),
            symbol: "NIFTY".to_string(),
            side: Side::Long,
            qty: 50,
            avg_entry: 21480.0,
            oco_group: group.to_string(),
            stop_order_id: None,
            tp_order_id: None,
            status: PositionStatus::Opening,
            ts_opened: 1,
            ts_closed: None,
        })
        .unwrap();

    // Fresh process over the same store.
    let config = Arc::new(Config::default());
    let bus = EventBus::default();
    let market = Arc::new(MarketDataHub::new(bus.clone()));
    let app = Arc::new(AppState::new(config.clone(), store.clone(), market, bus));
    let paper = Arc::new(PaperBroker::new());
    paper.set_quote("NIFTY", Quote { last: 21480.0, bid: 21479.0, ask: 21481.0, ts: 1 });
    let modal = ModalBroker::new(paper.clone(), None);
    let limiter = Arc::new(RateLimiter::new());
    let execution = Arc::new(ExecutionEngine::new(modal.clone(), store.clone(), limiter.clone()));
    let oco = Arc::new(OcoManager::new(store.clone(), execution.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        app.clone(),
        MarketHoursGate::from_config(&config).unwrap(),
        session_clock(),
        RiskEngine::from_config(&config),
        execution,
        oco.clone(),
        modal,
        limiter,
        vec![],
    ));

    let started = Instant::now();
    orchestrator.startup().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    // Deterministic child ids, PLACED, attached to the position.
    let stop = store.order_by_client_id(&format!("{group}:STOP")).unwrap().unwrap();
    let tp = store.order_by_client_id(&format!("{group}:TP")).unwrap().unwrap();
    assert_eq!(stop.status, OrderStatus::Placed);
    assert_eq!(tp.status, OrderStatus::Placed);
    assert_eq!(stop.price, Some(21385.0));
    assert_eq!(tp.price, Some(21623.0));
    assert_eq!(stop.qty, 50);
    assert_eq!(oco.state(group), Some(OcoState::Armed));

    let position = store.position_by_id("pos-1").unwrap().unwrap();
    assert_eq!(position.stop_order_id.as_deref(), Some(format!("{group}:STOP").as_str()));
    assert_eq!(position.status, PositionStatus::Open);

    // Idempotence: a second recovery pass creates no duplicates.
    orchestrator.startup().await.unwrap();
    let stop_again = store.order_by_client_id(&format!("{group}:STOP")).unwrap().unwrap();
    assert_eq!(stop_again.id, stop.id);

    // The engine always restarts in PAPER.
    assert_eq!(app.coordinator_snapshot().mode, TradingMode::Paper);
    assert_eq!(store.audit_count(AuditAction::Recovery).unwrap(), 2);
}

// =============================================================================
// Mode gating
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn live_mode_requires_literal_confirmation() {
    let h = Harness::new(vec![]).await;

    // No confirmation.
    let err = h.orchestrator.set_mode(TradingMode::Live, None).await.unwrap_err();
    assert!(matches!(err, ModeError::ConfirmationRequired));
    assert_eq!(h.app.coordinator_snapshot().mode, TradingMode::Paper);

    // Wrong phrase.
    let err = h
        .orchestrator
        .set_mode(TradingMode::Live, Some("yes please"))
        .await
        .unwrap_err();
    assert!(matches!(err, ModeError::ConfirmationRequired));
    assert_eq!(h.app.coordinator_snapshot().mode, TradingMode::Paper);

    // Right phrase, but this harness has no live gateway configured.
    let err = h
        .orchestrator
        .set_mode(TradingMode::Live, Some(LIVE_CONFIRM_PHRASE))
        .await
        .unwrap_err();
    assert!(matches!(err, ModeError::Refused(_)));
    assert_eq!(h.app.coordinator_snapshot().mode, TradingMode::Paper);
    assert_eq!(h.store.audit_count(AuditAction::ModeChange).unwrap(), 0);

    // PAPER transitions are unconditional and audited.
    h.orchestrator.set_mode(TradingMode::Paper, None).await.unwrap();
    assert_eq!(h.store.audit_count(AuditAction::ModeChange).unwrap(), 1);
}

// =============================================================================
// Risk rejections are audited with machine-readable types
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn gate_rejection_writes_decision_risk_event_and_audit() {
    // Entry far outside the NIFTY price band.
    let h = Harness::new(vec![Box::new(FixedSignal {
        symbol: "NIFTY".to_string(),
        side: Side::Long,
        entry: 25_000.0,
        stop: 24_950.0,
        tp: 25_100.0,
    })])
    .await;
    h.quote("NIFTY", 25_000.0, 24_999.0, 25_001.0);

    h.orchestrator.scan_once().await.unwrap();

    let decisions = h.store.decisions_since(0).unwrap();
    assert_eq!(decisions.len(), 1);
    assert!(!decisions[0].approved);
    assert_eq!(decisions[0].status, DecisionStatus::Rejected);

    let events = h.store.recent_risk_events(10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].event_type,
        meridian_bot::store::models::RiskEventType::PriceBand
    );
    assert_eq!(events[0].decision_id.as_deref(), Some(decisions[0].id.as_str()));

    assert_eq!(h.store.audit_count(AuditAction::DecisionRejected).unwrap(), 1);
    // No order was ever created.
    assert_eq!(h.store.open_orders().unwrap().len(), 0);
}
