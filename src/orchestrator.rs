// =============================================================================
// Orchestrator — lifecycle owner: scan pipeline, pause/resume, flatten, mode
// =============================================================================
//
// Owns the small mutable core (mode, pause flag, heat, daily pnl) behind the
// coordinator lock on AppState, and glues every subsystem together:
//
//   scan_once:  window gate → strategies → ranker → risk gates → entry
//               placement → OCO group registration
//   callbacks:  entry fill → arm children; child fill → cancel sibling,
//               close position, record trade
//   flatten:    bounded kill-switch path (cancel children, market-exit all)
//   set_mode:   LIVE only with the literal confirmation phrase
//
// Warm-restart sequence: `startup` forces PAPER, refreshes instruments, runs
// OCO crash recovery, and only then is the engine allowed to scan or change
// mode.
//
// The callback chain OrderWatcher → Orchestrator → OCOManager is acyclic;
// nothing here calls back into the watcher.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::broker::rate_limit::RateLimiter;
use crate::broker::ModalBroker;
use crate::bus::BusEvent;
use crate::clock::{Clock, MarketHoursGate};
use crate::execution::{order_client_id, plan_client_id, ExecutionEngine, OrderSpec};
use crate::metrics;
use crate::oco::{OcoManager, OcoPlan};
use crate::risk::{round_to_tick, PortfolioView, RiskEngine};
use crate::store::models::{
    AuditAction, AuditRecord, DecisionRecord, DecisionStatus, OrderRecord, PositionRecord,
    RiskEventRecord, RiskEventType, SignalRecord,
};
use crate::strategy::{rank_signals, SignalContext, SignalDraft, Strategy};
use crate::types::{MarketWindow, OrderTag, OrderType, PositionStatus, Side, TradingMode};

/// The literal phrase required to arm LIVE trading.
pub const LIVE_CONFIRM_PHRASE: &str = "CONFIRM LIVE TRADING";

/// Sustained throttle pressure beyond this pauses new entries.
const THROTTLE_PRESSURE_LIMIT: Duration = Duration::from_secs(10);

/// Rejected mode transition.
#[derive(Debug)]
pub enum ModeError {
    /// LIVE requested without the literal confirmation phrase.
    ConfirmationRequired,
    /// The transition cannot be performed (e.g. no live gateway configured).
    Refused(String),
}

impl std::fmt::Display for ModeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfirmationRequired => {
                write!(f, "switching to LIVE requires confirm=\"{LIVE_CONFIRM_PHRASE}\"")
            }
            Self::Refused(reason) => write!(f, "{reason}"),
        }
    }
}

/// Per-position outcome of a flatten pass.
#[derive(Debug, Clone, Serialize)]
pub struct FlattenOutcome {
    pub position_id: String,
    pub symbol: String,
    pub outcome: String,
}

/// Result of `flatten`, returned verbatim by the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct FlattenSummary {
    pub reason: String,
    pub duration_ms: u64,
    pub children_canceled: usize,
    pub exits_submitted: usize,
    pub complete: bool,
    pub positions: Vec<FlattenOutcome>,
}

pub struct Orchestrator {
    app: Arc<AppState>,
    gate: MarketHoursGate,
    clock: Arc<dyn Clock>,
    risk: RiskEngine,
    execution: Arc<ExecutionEngine>,
    oco: Arc<OcoManager>,
    modal: Arc<ModalBroker>,
    limiter: Arc<RateLimiter>,
    strategies: Vec<Box<dyn Strategy>>,
    flatten_reason: RwLock<String>,
    eod_flattened: AtomicBool,
    recovered: AtomicBool,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app: Arc<AppState>,
        gate: MarketHoursGate,
        clock: Arc<dyn Clock>,
        risk: RiskEngine,
        execution: Arc<ExecutionEngine>,
        oco: Arc<OcoManager>,
        modal: Arc<ModalBroker>,
        limiter: Arc<RateLimiter>,
        strategies: Vec<Box<dyn Strategy>>,
    ) -> Self {
        Self {
            app,
            gate,
            clock,
            risk,
            execution,
            oco,
            modal,
            limiter,
            strategies,
            flatten_reason: RwLock::new("none".to_string()),
            eod_flattened: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
        }
    }

    pub fn app(&self) -> &Arc<AppState> {
        &self.app
    }

    // -------------------------------------------------------------------------
    // Warm restart
    // -------------------------------------------------------------------------

    /// Startup sequence: force PAPER, refresh instruments, run OCO recovery.
    /// Scans and mode transitions wait for this to finish.
    pub async fn startup(&self) -> Result<()> {
        {
            let mut coord = self.app.coordinator.write();
            coord.mode = TradingMode::Paper;
        }
        let _ = self.modal.set_live(false);

        self.app
            .store
            .upsert_instruments(&self.app.config.instruments, self.clock.now_millis())
            .context("instrument refresh failed")?;

        self.audit(
            AuditAction::EngineStart,
            serde_json::json!({ "instance_id": self.app.instance_id }),
        );

        let report = self.oco.recover().await.context("OCO recovery failed")?;
        self.audit(AuditAction::Recovery, serde_json::to_value(report)?);

        self.refresh_financials()?;
        self.recovered.store(true, Ordering::SeqCst);
        info!("warm restart complete — engine in PAPER, recovery done");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Scan pipeline
    // -------------------------------------------------------------------------

    /// One bounded scan tick. The supervisor wraps this in a timeout.
    pub async fn scan_once(&self) -> Result<()> {
        if !self.recovered.load(Ordering::SeqCst) {
            return Ok(());
        }

        let scan_started = Instant::now();
        let now = self.clock.now_utc();
        let now_ms = now.timestamp_millis();
        let window = self.gate.classify(now);

        let (heat, daily_pnl) = self.refresh_financials()?;
        self.check_throttle_pressure().await;

        match window {
            MarketWindow::Closed => {
                self.maybe_eod_flatten().await;
                self.finish_scan(now_ms);
                return Ok(());
            }
            MarketWindow::ExitOnly => {
                // Children stay managed through callbacks; no new parents.
                self.eod_flattened.store(false, Ordering::SeqCst);
                self.finish_scan(now_ms);
                return Ok(());
            }
            MarketWindow::Entry => {
                self.eod_flattened.store(false, Ordering::SeqCst);
            }
        }

        let snap = self.app.coordinator_snapshot();
        if snap.paused {
            self.finish_scan(now_ms);
            return Ok(());
        }

        // Gather candidates across the instrument universe.
        let session_open_ms = self.session_open_ms(now);
        let mut drafts: Vec<SignalDraft> = Vec::new();
        for instrument in &self.app.config.instruments {
            let Some(quote) = self.app.market.quote(&instrument.symbol) else {
                continue;
            };
            let bars = self.app.market.bars(&instrument.symbol, 240);
            let ctx = SignalContext {
                instrument,
                bars: &bars,
                quote,
                window,
                now: now_ms,
                session_open_ms,
            };
            for strategy in &self.strategies {
                drafts.extend(strategy.generate_signals(&ctx));
            }
        }

        let ranked = rank_signals(drafts, self.app.config.max_entries_per_scan);
        metrics::inc_signals(ranked.len() as u64);

        let mut heat_running = heat;
        for draft in ranked {
            match self
                .process_draft(&draft, window, heat_running, daily_pnl, now_ms, scan_started)
                .await
            {
                Ok(Some(reserved)) => heat_running += reserved,
                Ok(None) => {}
                Err(e) => warn!(symbol = %draft.symbol, error = %e, "draft processing failed"),
            }
        }

        metrics::set_portfolio_heat(heat_running);
        self.finish_scan(now_ms);
        Ok(())
    }

    fn finish_scan(&self, now_ms: i64) {
        self.app.coordinator.write().last_scan_at = Some(now_ms);
    }

    /// Persist signal → risk gate → decision → entry placement → OCO group.
    /// Returns the heat reserved by an executed entry.
    async fn process_draft(
        &self,
        draft: &SignalDraft,
        window: MarketWindow,
        heat: f64,
        daily_pnl: f64,
        now_ms: i64,
        scan_started: Instant,
    ) -> Result<Option<f64>> {
        let instrument = self
            .app
            .config
            .instrument(&draft.symbol)
            .with_context(|| format!("no instrument metadata for {}", draft.symbol))?;
        let Some(quote) = self.app.market.quote(&draft.symbol) else {
            return Ok(None);
        };

        // Persist the signal with the tick-clamped plan prices folded into
        // its feature snapshot; recovery reads them back from here.
        let signal_id = Uuid::new_v4().to_string();
        let mut features = draft.features.clone();
        features.insert("plan_entry".to_string(), round_to_tick(draft.entry, instrument.tick_size));
        features.insert("plan_stop".to_string(), round_to_tick(draft.stop, instrument.tick_size));
        features.insert("plan_tp".to_string(), round_to_tick(draft.tp, instrument.tick_size));

        self.app.store.insert_signal(&SignalRecord {
            id: signal_id.clone(),
            ts: now_ms,
            symbol: draft.symbol.clone(),
            side: draft.side,
            strategy: draft.strategy.to_string(),
            score: draft.score,
            features,
            config_sha: self.app.config_sha.clone(),
            rationale: draft.rationale.clone(),
        })?;
        self.app.bus.publish(BusEvent::Signal {
            signal_id: signal_id.clone(),
            symbol: draft.symbol.clone(),
            strategy: draft.strategy.to_string(),
            score: draft.score,
        });

        let snap = self.app.coordinator_snapshot();
        let view = PortfolioView {
            window,
            paused: snap.paused,
            portfolio_heat: heat,
            daily_realized_pnl: daily_pnl,
        };

        let plan = match self.risk.can_enter(
            instrument,
            draft.side,
            draft.entry,
            draft.stop,
            draft.tp,
            quote,
            view,
        ) {
            Ok(plan) => plan,
            Err(rejection) => {
                let decision_id = Uuid::new_v4().to_string();
                self.app.store.insert_decision(&DecisionRecord {
                    id: decision_id.clone(),
                    signal_id,
                    client_plan_id: String::new(),
                    mode: snap.mode,
                    approved: false,
                    risk_pct: 0.0,
                    risk_amount: 0.0,
                    qty: 0,
                    portfolio_heat_before: heat,
                    portfolio_heat_after: heat,
                    status: DecisionStatus::Rejected,
                    config_sha: self.app.config_sha.clone(),
                    ts: now_ms,
                })?;
                metrics::inc_decision("rejected");
                metrics::inc_risk_block(rejection.event_type.as_str());
                self.record_risk_event(rejection.event_type, Some(&decision_id), &rejection.details);
                self.audit(
                    AuditAction::DecisionRejected,
                    serde_json::json!({
                        "decision_id": decision_id,
                        "symbol": draft.symbol,
                        "type": rejection.event_type.as_str(),
                        "details": rejection.details,
                    }),
                );

                if rejection.event_type == RiskEventType::DailyLossStop {
                    self.pause("daily loss stop").await;
                }
                return Ok(None);
            }
        };

        let group = plan_client_id(
            &draft.symbol,
            draft.side,
            plan.entry,
            plan.stop,
            plan.tp,
            plan.qty,
            draft.strategy,
            &self.app.config_sha,
        );

        // A second identical plan within the session short-circuits: the
        // original plan id stands and no new order row is written.
        if let Some(existing) = self.app.store.decision_by_plan(&group)? {
            info!(
                plan = %group,
                original_decision = %existing.id,
                "duplicate plan fingerprint — short-circuited"
            );
            metrics::inc_decision("duplicate");
            return Ok(None);
        }

        let decision_id = Uuid::new_v4().to_string();
        self.app.store.insert_decision(&DecisionRecord {
            id: decision_id.clone(),
            signal_id,
            client_plan_id: group.clone(),
            mode: snap.mode,
            approved: true,
            risk_pct: plan.risk_pct,
            risk_amount: plan.risk_amount,
            qty: plan.qty,
            portfolio_heat_before: plan.heat_before,
            portfolio_heat_after: plan.heat_after,
            status: DecisionStatus::Planned,
            config_sha: self.app.config_sha.clone(),
            ts: now_ms,
        })?;
        metrics::observe_tick_to_decision_ms(scan_started.elapsed().as_millis() as f64);

        self.oco.register(OcoPlan {
            group: group.clone(),
            decision_id: decision_id.clone(),
            symbol: draft.symbol.clone(),
            side: draft.side,
            qty: plan.qty,
            entry: plan.entry,
            stop: plan.stop,
            tp: plan.tp,
        });

        let entry_spec = OrderSpec {
            decision_id: Some(decision_id.clone()),
            client_order_id: order_client_id(&group, OrderTag::Entry, None),
            tag: OrderTag::Entry,
            parent_group: group.clone(),
            symbol: draft.symbol.clone(),
            side: draft.side.entry_order_side(),
            qty: plan.qty,
            order_type: OrderType::Limit,
            price: Some(plan.entry),
            priority: false,
        };

        match self.execution.submit(entry_spec).await {
            Ok(_) => {
                self.app.store.update_decision_status(&decision_id, DecisionStatus::Executed)?;
                metrics::inc_decision("executed");
                info!(
                    plan = %group,
                    symbol = %draft.symbol,
                    side = %draft.side,
                    qty = plan.qty,
                    entry = plan.entry,
                    "entry placed"
                );
                Ok(Some(plan.risk_amount))
            }
            Err(e) => {
                self.app.store.update_decision_status(&decision_id, DecisionStatus::Rejected)?;
                metrics::inc_decision("failed");
                self.record_risk_event(
                    RiskEventType::OrderRejected,
                    Some(&decision_id),
                    &format!("entry placement failed: {e}"),
                );
                self.oco.entry_terminated(&group).await;

                // A second auth failure (the engine already spent its one
                // token refresh) means nothing can be placed or protected.
                if e.class == crate::broker::ErrorClass::Auth {
                    self.record_risk_event(
                        RiskEventType::AuthFailure,
                        Some(&decision_id),
                        "broker auth failed after token refresh",
                    );
                    metrics::inc_kill_switch("auth_failure");
                    self.audit(
                        AuditAction::KillSwitch,
                        serde_json::json!({ "reason": "auth_failure" }),
                    );
                    self.flatten("auth_failure").await;
                }
                Ok(None)
            }
        }
    }

    /// Entries pause under sustained throttle pressure; exits keep priority
    /// tokens and are unaffected.
    async fn check_throttle_pressure(&self) {
        if let Some((class, duration)) = self.limiter.sustained_pressure() {
            if duration > THROTTLE_PRESSURE_LIMIT && !self.app.coordinator_snapshot().paused {
                self.record_risk_event(
                    RiskEventType::ThrottlePressure,
                    None,
                    &format!("{} queue pressured for {:?}", class.as_str(), duration),
                );
                self.pause("throttle pressure").await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Order watcher callbacks
    // -------------------------------------------------------------------------

    /// ENTRY filled: open the position and arm the children.
    pub async fn on_entry_filled(&self, order: &OrderRecord) {
        let group = order.parent_group.clone();

        let position = match self.ensure_position(order) {
            Ok(p) => p,
            Err(e) => {
                error!(group = %group, error = %e, "failed to open position for entry fill");
                return;
            }
        };

        match self.oco.arm(&group, order.filled_qty).await {
            Ok((stop_coid, tp_coid)) => {
                if let Err(e) =
                    self.app.store.set_position_children(&position.id, &stop_coid, &tp_coid)
                {
                    error!(group = %group, error = %e, "failed to attach children to position");
                }
                let _ = self.refresh_financials();
            }
            Err(e) => {
                // A position without a protective stop must not stay open.
                error!(group = %group, error = %e, "child placement failed — flattening position");
                self.record_risk_event(
                    RiskEventType::OcoCancelFailed,
                    order.decision_id.as_deref(),
                    &format!("child placement failed: {e}"),
                );
                metrics::inc_kill_switch("oco_arm_failed");
                self.audit(
                    AuditAction::KillSwitch,
                    serde_json::json!({ "group": group, "reason": "oco_arm_failed" }),
                );
                self.flatten_position(&position).await;
            }
        }
    }

    /// STOP or TP filled: cancel the sibling, close the position, book the
    /// trade.
    pub async fn on_child_filled(&self, order: &OrderRecord) {
        let group = order.parent_group.clone();

        if let Err(e) = self.oco.child_filled(&group, order.tag).await {
            self.record_risk_event(
                RiskEventType::OcoCancelFailed,
                order.decision_id.as_deref(),
                &format!("sibling cancel failed after retries: {e}"),
            );
            metrics::inc_kill_switch("oco_cancel_failed");
            self.audit(
                AuditAction::KillSwitch,
                serde_json::json!({ "group": group, "reason": "oco_cancel_failed" }),
            );
            if let Ok(Some(position)) = self.app.store.position_by_group(&group) {
                self.flatten_position(&position).await;
            }
        }

        let reason = match order.tag {
            OrderTag::Stop => "STOP_LOSS",
            OrderTag::Tp => "TAKE_PROFIT",
            _ => "EXIT",
        };
        if let Err(e) = self.close_position_from_exit(order, reason).await {
            error!(group = %group, error = %e, "failed to close position after child fill");
        }
    }

    /// Flatten/kill-switch EXIT order filled.
    pub async fn on_exit_filled(&self, order: &OrderRecord) {
        let reason = format!("FLATTEN:{}", self.flatten_reason.read());
        if let Err(e) = self.close_position_from_exit(order, &reason).await {
            error!(group = %order.parent_group, error = %e, "failed to close position after exit fill");
        }
    }

    /// Sibling CANCELED ack: the group can finish closing.
    pub fn on_child_canceled(&self, order: &OrderRecord) {
        self.oco.sibling_canceled(&order.parent_group);
    }

    /// STOP partially filled: TP shrinks to the remainder.
    pub async fn on_stop_partial(&self, order: &OrderRecord) {
        if let Err(e) = self.oco.stop_partial(&order.parent_group, order.filled_qty).await {
            warn!(group = %order.parent_group, error = %e, "TP resize after partial stop failed");
        }
    }

    /// Broker rejected an order.
    pub async fn on_order_rejected(&self, order: &OrderRecord) {
        self.record_risk_event(
            RiskEventType::OrderRejected,
            order.decision_id.as_deref(),
            &format!("{} rejected by broker", order.client_order_id),
        );
        if order.tag == OrderTag::Entry {
            self.oco.entry_terminated(&order.parent_group).await;
            if let Some(decision_id) = &order.decision_id {
                let _ = self
                    .app
                    .store
                    .update_decision_status(decision_id, DecisionStatus::Rejected);
            }
        }
    }

    /// Entry cancelled before filling (EOD sweep or operator action).
    pub async fn on_entry_canceled(&self, order: &OrderRecord) {
        self.oco.entry_terminated(&order.parent_group).await;
    }

    // -------------------------------------------------------------------------
    // Position bookkeeping
    // -------------------------------------------------------------------------

    /// Create the position row on first entry fill; replays reuse it.
    fn ensure_position(&self, order: &OrderRecord) -> Result<PositionRecord> {
        if let Some(existing) = self.app.store.position_by_group(&order.parent_group)? {
            return Ok(existing);
        }

        let side = match order.side {
            crate::types::OrderSide::Buy => Side::Long,
            crate::types::OrderSide::Sell => Side::Short,
        };
        let position = PositionRecord {
            id: Uuid::new_v4().to_string(),
            symbol: order.symbol.clone(),
            side,
            qty: order.filled_qty,
            avg_entry: order.avg_fill_price.or(order.price).unwrap_or(0.0),
            oco_group: order.parent_group.clone(),
            stop_order_id: None,
            tp_order_id: None,
            status: PositionStatus::Opening,
            ts_opened: self.clock.now_millis(),
            ts_closed: None,
        };
        self.app.store.insert_position(&position)?;
        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            qty = position.qty,
            avg_entry = position.avg_entry,
            "position opened"
        );
        Ok(position)
    }

    /// Book the trade and close the position for a filled exit leg.
    async fn close_position_from_exit(&self, order: &OrderRecord, reason: &str) -> Result<()> {
        let Some(position) = self.app.store.position_by_group(&order.parent_group)? else {
            return Ok(());
        };
        if position.status == PositionStatus::Closed {
            return Ok(());
        }

        self.app.store.set_position_status(&position.id, PositionStatus::Closing)?;

        let exit_price = order
            .avg_fill_price
            .or(order.price)
            .unwrap_or(position.avg_entry);
        let qty = if order.filled_qty > 0 { order.filled_qty } else { position.qty };

        let gross = position.side.direction() * (exit_price - position.avg_entry) * qty as f64;
        let fee_rate = self.app.config.fee_bps / 10_000.0;
        let fees = fee_rate * (position.avg_entry + exit_price) / 2.0 * qty as f64;
        let net = gross - fees;

        // Adverse fills are positive slippage: intended price is the resting
        // limit/trigger; market exits have no intent to slip from.
        let slippage_bps = match order.price {
            Some(intended) if intended > 0.0 => {
                position.side.direction() * (intended - exit_price) / intended * 10_000.0
            }
            _ => 0.0,
        };
        let latency_ms = order
            .ts_acked
            .map(|acked| (acked - order.ts_created).max(0))
            .unwrap_or(0);

        let now_ms = self.clock.now_millis();
        self.app.store.insert_trade(&crate::store::models::TradeRecord {
            id: Uuid::new_v4().to_string(),
            position_id: position.id.clone(),
            qty,
            entry_price: position.avg_entry,
            exit_price,
            exit_reason: reason.to_string(),
            gross_pnl: gross,
            net_pnl: net,
            slippage_bps,
            latency_ms,
            ts: now_ms,
        })?;
        self.app.store.close_position(&position.id, now_ms)?;

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            exit_reason = reason,
            gross_pnl = gross,
            net_pnl = net,
            "position closed, trade recorded"
        );

        let _ = self.refresh_financials();
        Ok(())
    }

    /// Recompute heat and daily pnl from the store; mirror to coordinator,
    /// gauges, and return them.
    pub fn refresh_financials(&self) -> Result<(f64, f64)> {
        let heat = self.app.store.portfolio_heat()?;
        let session_start = self.session_start_ms(self.clock.now_utc());
        let daily_pnl = self.app.store.realized_net_pnl_since(session_start)?;
        let open = self.app.store.open_positions()?.len();

        {
            let mut coord = self.app.coordinator.write();
            coord.portfolio_heat = heat;
            coord.daily_realized_pnl = daily_pnl;
        }
        metrics::set_portfolio_heat(heat);
        metrics::set_daily_pnl(daily_pnl);
        metrics::set_positions_open(open as f64);
        Ok((heat, daily_pnl))
    }

    // -------------------------------------------------------------------------
    // Pause / resume
    // -------------------------------------------------------------------------

    pub async fn pause(&self, reason: &str) {
        {
            let mut coord = self.app.coordinator.write();
            if coord.paused {
                return;
            }
            coord.paused = true;
            coord.pause_reason = Some(reason.to_string());
        }
        warn!(reason, "orchestrator paused");
        self.audit(AuditAction::Pause, serde_json::json!({ "reason": reason }));
        self.app.bus.publish(BusEvent::Paused { reason: reason.to_string() });
    }

    pub async fn resume(&self) {
        {
            let mut coord = self.app.coordinator.write();
            if !coord.paused {
                return;
            }
            coord.paused = false;
            coord.pause_reason = None;
        }
        info!("orchestrator resumed");
        self.audit(AuditAction::Resume, serde_json::json!({}));
        self.app.bus.publish(BusEvent::Resumed);
    }

    /// Lift a pause only if it was created for exactly `reason` (the leader
    /// loop resumes only a pause it installed itself).
    pub async fn resume_if_paused_for(&self, reason: &str) {
        let matches = {
            let coord = self.app.coordinator.read();
            coord.paused && coord.pause_reason.as_deref() == Some(reason)
        };
        if matches {
            self.resume().await;
        }
    }

    // -------------------------------------------------------------------------
    // Mode gating
    // -------------------------------------------------------------------------

    /// Change trading mode. LIVE requires the literal confirmation phrase
    /// and a configured live gateway; every transition is audited.
    pub async fn set_mode(
        &self,
        target: TradingMode,
        confirm: Option<&str>,
    ) -> std::result::Result<TradingMode, ModeError> {
        let from = self.app.coordinator_snapshot().mode;

        match target {
            TradingMode::Live => {
                if confirm != Some(LIVE_CONFIRM_PHRASE) {
                    return Err(ModeError::ConfirmationRequired);
                }
                if !self.recovered.load(Ordering::SeqCst) {
                    return Err(ModeError::Refused(
                        "startup recovery has not completed".to_string(),
                    ));
                }
                self.modal.set_live(true).map_err(|e| ModeError::Refused(e.message))?;
            }
            TradingMode::Paper => {
                let _ = self.modal.set_live(false);
            }
        }

        self.app.coordinator.write().mode = target;
        warn!(from = %from, to = %target, "trading mode changed");
        self.audit(
            AuditAction::ModeChange,
            serde_json::json!({ "from": from.to_string(), "to": target.to_string() }),
        );
        self.app.bus.publish(BusEvent::ModeChanged { mode: target });
        Ok(target)
    }

    // -------------------------------------------------------------------------
    // Flatten / kill switch
    // -------------------------------------------------------------------------

    /// Bounded full-position exit: pause entries, cancel open children,
    /// market-exit every open position, wait for terminal states or the
    /// deadline.
    pub async fn flatten(&self, reason: &str) -> FlattenSummary {
        let started = Instant::now();
        *self.flatten_reason.write() = reason.to_string();
        metrics::inc_kill_switch(reason);
        self.pause(&format!("flatten: {reason}")).await;

        let before = self.app.store.open_positions().unwrap_or_default();
        let bound = Duration::from_millis(self.app.config.flatten_bound_ms);

        let inner = self.flatten_inner();
        let (children_canceled, exits_submitted, complete) =
            match tokio::time::timeout(bound, inner).await {
                Ok(Ok((canceled, exits))) => {
                    let complete = self.await_all_flat(started, bound).await;
                    (canceled, exits, complete)
                }
                Ok(Err(e)) => {
                    error!(error = %e, "flatten pass failed");
                    (0, 0, false)
                }
                Err(_) => {
                    warn!("flatten deadline exceeded before all submissions completed");
                    (0, 0, false)
                }
            };

        let after: std::collections::HashSet<String> = self
            .app
            .store
            .open_positions()
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.id)
            .collect();

        let positions = before
            .iter()
            .map(|p| FlattenOutcome {
                position_id: p.id.clone(),
                symbol: p.symbol.clone(),
                outcome: if after.contains(&p.id) { "pending" } else { "closed" }.to_string(),
            })
            .collect();

        let duration_ms = started.elapsed().as_millis() as u64;
        metrics::observe_flatten_duration_ms(duration_ms as f64);

        let summary = FlattenSummary {
            reason: reason.to_string(),
            duration_ms,
            children_canceled,
            exits_submitted,
            complete,
            positions,
        };
        self.audit(AuditAction::Flatten, serde_json::to_value(&summary).unwrap_or_default());
        self.app.bus.publish(BusEvent::Flattened { reason: reason.to_string() });
        let _ = self.refresh_financials();
        summary
    }

    /// Cancel all open child orders, then market-exit all open positions,
    /// both passes fully parallel on priority tokens.
    async fn flatten_inner(&self) -> Result<(usize, usize)> {
        let children = self.app.store.open_child_orders()?;
        let cancels = children
            .iter()
            .map(|c| self.execution.cancel(&c.client_order_id, true));
        let cancel_results = futures_util::future::join_all(cancels).await;
        let children_canceled = cancel_results.iter().filter(|r| r.is_ok()).count();

        // Unfilled entries must not fill after the flatten.
        let open_entries: Vec<_> = self
            .app
            .store
            .open_orders()?
            .into_iter()
            .filter(|o| o.tag == OrderTag::Entry)
            .collect();
        let entry_cancels = open_entries
            .iter()
            .map(|o| self.execution.cancel(&o.client_order_id, true));
        futures_util::future::join_all(entry_cancels).await;

        let positions = self.app.store.open_positions()?;
        let exits = positions.iter().map(|p| {
            let spec = OrderSpec {
                decision_id: None,
                client_order_id: order_client_id(&p.oco_group, OrderTag::Exit, None),
                tag: OrderTag::Exit,
                parent_group: p.oco_group.clone(),
                symbol: p.symbol.clone(),
                side: p.side.exit_order_side(),
                qty: p.qty,
                order_type: OrderType::Market,
                price: None,
                priority: true,
            };
            self.execution.submit(spec)
        });
        let exit_results = futures_util::future::join_all(exits).await;
        let exits_submitted = exit_results.iter().filter(|r| r.is_ok()).count();

        Ok((children_canceled, exits_submitted))
    }

    /// Poll the store until no open positions or orders remain, within what
    /// is left of the flatten budget.
    async fn await_all_flat(&self, started: Instant, bound: Duration) -> bool {
        loop {
            let positions_open = self.app.store.open_positions().map(|p| p.len()).unwrap_or(1);
            let orders_open = self.app.store.open_orders().map(|o| o.len()).unwrap_or(1);
            if positions_open == 0 && orders_open == 0 {
                return true;
            }
            if started.elapsed() >= bound {
                warn!(positions_open, orders_open, "flatten bound reached with work pending");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Fatal-path exit of a single position (failed sibling cancel or failed
    /// child placement).
    async fn flatten_position(&self, position: &PositionRecord) {
        for coid in [&position.stop_order_id, &position.tp_order_id].into_iter().flatten() {
            if let Err(e) = self.execution.cancel(coid, true).await {
                warn!(coid = %coid, error = %e, "child cancel during position flatten failed");
            }
        }
        let spec = OrderSpec {
            decision_id: None,
            client_order_id: order_client_id(&position.oco_group, OrderTag::Exit, None),
            tag: OrderTag::Exit,
            parent_group: position.oco_group.clone(),
            symbol: position.symbol.clone(),
            side: position.side.exit_order_side(),
            qty: position.qty,
            order_type: OrderType::Market,
            price: None,
            priority: true,
        };
        if let Err(e) = self.execution.submit(spec).await {
            error!(position_id = %position.id, error = %e, "position flatten exit failed");
        }
    }

    /// At the closed-window open, flatten anything still live (once).
    async fn maybe_eod_flatten(&self) {
        if self.eod_flattened.swap(true, Ordering::SeqCst) {
            return;
        }
        let open_positions = self.app.store.open_positions().unwrap_or_default();
        let open_orders = self.app.store.open_orders().unwrap_or_default();
        if open_positions.is_empty() && open_orders.is_empty() {
            return;
        }
        info!(
            positions = open_positions.len(),
            orders = open_orders.len(),
            "EOD window — flattening remaining exposure"
        );
        self.flatten("eod").await;
    }

    // -------------------------------------------------------------------------
    // Session time helpers
    // -------------------------------------------------------------------------

    fn session_start_ms(&self, now: DateTime<Utc>) -> i64 {
        let tz = self.gate.timezone();
        let local_date = now.with_timezone(&tz).date_naive();
        let midnight = local_date.and_hms_opt(0, 0, 0).expect("midnight exists");
        tz.from_local_datetime(&midnight)
            .earliest()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|| now.timestamp_millis())
    }

    fn session_open_ms(&self, now: DateTime<Utc>) -> i64 {
        let tz = self.gate.timezone();
        let local_date = now.with_timezone(&tz).date_naive();
        let open = local_date.and_time(self.gate.entry_open());
        tz.from_local_datetime(&open)
            .earliest()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|| now.timestamp_millis())
    }

    // -------------------------------------------------------------------------
    // Audit & risk events
    // -------------------------------------------------------------------------

    pub fn audit(&self, action: AuditAction, details: serde_json::Value) {
        let record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            ts: self.clock.now_millis(),
            action,
            session_id: self.app.session_id.clone(),
            actor: "engine".to_string(),
            details,
            config_sha: self.app.config_sha.clone(),
            git_head: self.app.git_head.clone(),
        };
        if let Err(e) = self.app.store.insert_audit(&record) {
            error!(action = %action, error = %e, "audit insert failed");
        }
    }

    pub fn record_risk_event(
        &self,
        event_type: RiskEventType,
        decision_id: Option<&str>,
        details: &str,
    ) {
        let record = RiskEventRecord {
            id: Uuid::new_v4().to_string(),
            ts: self.clock.now_millis(),
            event_type,
            decision_id: decision_id.map(|s| s.to_string()),
            details: details.to_string(),
        };
        if let Err(e) = self.app.store.insert_risk_event(&record) {
            error!(event_type = %event_type, error = %e, "risk event insert failed");
        }
        self.app.bus.publish(BusEvent::RiskBlocked {
            event_type,
            details: details.to_string(),
        });
    }

    /// Snapshot for `/state`.
    pub fn state_snapshot(&self) -> serde_json::Value {
        let coord = self.app.coordinator_snapshot();
        let positions = self.app.store.open_positions().unwrap_or_default();
        serde_json::json!({
            "mode": coord.mode.to_string(),
            "paused": coord.paused,
            "pause_reason": coord.pause_reason,
            "portfolio_heat": coord.portfolio_heat,
            "daily_realized_pnl": coord.daily_realized_pnl,
            "last_scan_at": coord.last_scan_at,
            "open_positions": positions,
            "strategies": self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "is_leader": self.app.leadership.is_leader(),
            "instance_id": self.app.instance_id,
            "config_sha": self.app.config_sha,
            "uptime_secs": self.app.start_time.elapsed().as_secs(),
        })
    }

}
