// =============================================================================
// Store row models — durable shapes for signals, decisions, orders, positions,
// trades, risk events, and audit rows
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{OrderSide, OrderStatus, OrderTag, OrderType, PositionStatus, Side, TradingMode};

/// A generated signal, persisted before it is ranked and gated. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: String,
    /// Unix millis.
    pub ts: i64,
    pub symbol: String,
    pub side: Side,
    pub strategy: String,
    pub score: f64,
    /// Feature name → value snapshot captured at signal time.
    pub features: BTreeMap<String, f64>,
    pub config_sha: String,
    pub rationale: String,
}

/// Terminal status of a trade decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionStatus {
    Planned,
    Skipped,
    Executed,
    Rejected,
}

impl DecisionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "PLANNED",
            Self::Skipped => "SKIPPED",
            Self::Executed => "EXECUTED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PLANNED" => Some(Self::Planned),
            "SKIPPED" => Some(Self::Skipped),
            "EXECUTED" => Some(Self::Executed),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// The sized, gated outcome of a signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub signal_id: String,
    /// 24-char deterministic hash of the plan shape; identical plans within a
    /// session short-circuit on this.
    pub client_plan_id: String,
    pub mode: TradingMode,
    pub approved: bool,
    pub risk_pct: f64,
    pub risk_amount: f64,
    pub qty: i64,
    pub portfolio_heat_before: f64,
    pub portfolio_heat_after: f64,
    pub status: DecisionStatus,
    pub config_sha: String,
    /// Unix millis.
    pub ts: i64,
}

/// A broker order row. `client_order_id` is globally unique in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub decision_id: Option<String>,
    pub client_order_id: String,
    pub tag: OrderTag,
    pub parent_group: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub filled_qty: i64,
    pub price: Option<f64>,
    pub avg_fill_price: Option<f64>,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub broker_id: Option<String>,
    pub ts_created: i64,
    pub ts_acked: Option<i64>,
    pub ts_filled: Option<i64>,
}

/// An open or closed position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub avg_entry: f64,
    pub oco_group: String,
    pub stop_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub status: PositionStatus,
    pub ts_opened: i64,
    pub ts_closed: Option<i64>,
}

/// Immutable record of a completed round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub position_id: String,
    pub qty: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub exit_reason: String,
    pub gross_pnl: f64,
    pub net_pnl: f64,
    pub slippage_bps: f64,
    pub latency_ms: i64,
    pub ts: i64,
}

/// Machine-readable reason for a risk rejection or operational risk alarm.
///
/// The first six variants are the entry-gate rejections; the rest are raised
/// by the supervisor, rate limiter, OCO manager, and auth path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskEventType {
    FreezeBand,
    SpreadBlowout,
    HeatCap,
    DailyLossStop,
    FreezeQty,
    PriceBand,
    MarketClosed,
    TradingPaused,
    TradeRiskCap,
    ZeroQty,
    ScanSupervisor,
    ThrottlePressure,
    OcoCancelFailed,
    AuthFailure,
    OrderRejected,
}

impl RiskEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FreezeBand => "FREEZE_BAND",
            Self::SpreadBlowout => "SPREAD_BLOWOUT",
            Self::HeatCap => "HEAT_CAP",
            Self::DailyLossStop => "DAILY_LOSS_STOP",
            Self::FreezeQty => "FREEZE_QTY",
            Self::PriceBand => "PRICE_BAND",
            Self::MarketClosed => "MARKET_CLOSED",
            Self::TradingPaused => "TRADING_PAUSED",
            Self::TradeRiskCap => "TRADE_RISK_CAP",
            Self::ZeroQty => "ZERO_QTY",
            Self::ScanSupervisor => "SCAN_SUPERVISOR",
            Self::ThrottlePressure => "THROTTLE_PRESSURE",
            Self::OcoCancelFailed => "OCO_CANCEL_FAILED",
            Self::AuthFailure => "AUTH_FAILURE",
            Self::OrderRejected => "ORDER_REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FREEZE_BAND" => Some(Self::FreezeBand),
            "SPREAD_BLOWOUT" => Some(Self::SpreadBlowout),
            "HEAT_CAP" => Some(Self::HeatCap),
            "DAILY_LOSS_STOP" => Some(Self::DailyLossStop),
            "FREEZE_QTY" => Some(Self::FreezeQty),
            "PRICE_BAND" => Some(Self::PriceBand),
            "MARKET_CLOSED" => Some(Self::MarketClosed),
            "TRADING_PAUSED" => Some(Self::TradingPaused),
            "TRADE_RISK_CAP" => Some(Self::TradeRiskCap),
            "ZERO_QTY" => Some(Self::ZeroQty),
            "SCAN_SUPERVISOR" => Some(Self::ScanSupervisor),
            "THROTTLE_PRESSURE" => Some(Self::ThrottlePressure),
            "OCO_CANCEL_FAILED" => Some(Self::OcoCancelFailed),
            "AUTH_FAILURE" => Some(Self::AuthFailure),
            "ORDER_REJECTED" => Some(Self::OrderRejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit of a gate rejection or operational risk alarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEventRecord {
    pub id: String,
    pub ts: i64,
    pub event_type: RiskEventType,
    pub decision_id: Option<String>,
    pub details: String,
}

/// Closed enum of auditable actions; persisted as a CHECK-constrained column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    EngineStart,
    EngineStop,
    ModeChange,
    Pause,
    Resume,
    Flatten,
    KillSwitch,
    DecisionRejected,
    Recovery,
    LeaderAcquired,
    LeaderLost,
    SupervisorRestart,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EngineStart => "ENGINE_START",
            Self::EngineStop => "ENGINE_STOP",
            Self::ModeChange => "MODE_CHANGE",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Flatten => "FLATTEN",
            Self::KillSwitch => "KILL_SWITCH",
            Self::DecisionRejected => "DECISION_REJECTED",
            Self::Recovery => "RECOVERY",
            Self::LeaderAcquired => "LEADER_ACQUIRED",
            Self::LeaderLost => "LEADER_LOST",
            Self::SupervisorRestart => "SUPERVISOR_RESTART",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ENGINE_START" => Some(Self::EngineStart),
            "ENGINE_STOP" => Some(Self::EngineStop),
            "MODE_CHANGE" => Some(Self::ModeChange),
            "PAUSE" => Some(Self::Pause),
            "RESUME" => Some(Self::Resume),
            "FLATTEN" => Some(Self::Flatten),
            "KILL_SWITCH" => Some(Self::KillSwitch),
            "DECISION_REJECTED" => Some(Self::DecisionRejected),
            "RECOVERY" => Some(Self::Recovery),
            "LEADER_ACQUIRED" => Some(Self::LeaderAcquired),
            "LEADER_LOST" => Some(Self::LeaderLost),
            "SUPERVISOR_RESTART" => Some(Self::SupervisorRestart),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub ts: i64,
    pub action: AuditAction,
    pub session_id: String,
    pub actor: String,
    pub details: serde_json::Value,
    pub config_sha: String,
    pub git_head: String,
}
