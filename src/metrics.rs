// =============================================================================
// MetricsRegistry — trader_* namespace on a Prometheus scrape endpoint
// =============================================================================
//
// The recorder is installed once at startup; `/metrics` renders the handle.
// Helpers below keep call sites terse and the metric names in one place.
// =============================================================================

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// ── Metric names ─────────────────────────────────────────────────────────────

pub const IS_LEADER: &str = "trader_is_leader";
pub const LEADER_CHANGES: &str = "trader_leader_changes_total";
pub const MARKETDATA_HEARTBEAT: &str = "trader_marketdata_heartbeat_seconds";
pub const ORDER_STREAM_HEARTBEAT: &str = "trader_order_stream_heartbeat_seconds";
pub const SCAN_HEARTBEAT: &str = "trader_scan_heartbeat_seconds";
pub const SCAN_TICKS: &str = "trader_scan_ticks_total";
pub const SCAN_ERRORS: &str = "trader_scan_errors_total";
pub const SCAN_SUPERVISOR_STATE: &str = "trader_scan_supervisor_state";
pub const SIGNALS: &str = "trader_signals_total";
pub const DECISIONS: &str = "trader_decisions_total";
pub const RISK_BLOCKS: &str = "trader_risk_blocks_total";
pub const ORDERS_PLACED: &str = "trader_orders_placed_total";
pub const ORDERS_FILLED: &str = "trader_orders_filled_total";
pub const OCO_CHILDREN_CREATED: &str = "trader_oco_children_created_total";
pub const ORDER_LATENCY_MS: &str = "trader_order_latency_ms";
pub const TICK_TO_DECISION_MS: &str = "trader_tick_to_decision_ms";
pub const THROTTLE_QUEUE_DEPTH: &str = "trader_throttle_queue_depth";
pub const RETRIES: &str = "trader_retries_total";
pub const POSITIONS_OPEN: &str = "trader_positions_open";
pub const PORTFOLIO_HEAT_RUPEES: &str = "trader_portfolio_heat_rupees";
pub const DAILY_PNL_RUPEES: &str = "trader_daily_pnl_rupees";
pub const KILL_SWITCH: &str = "trader_kill_switch_total";
pub const FLATTEN_DURATION_MS: &str = "trader_flatten_duration_ms";

/// Install the Prometheus recorder and describe the full namespace.
///
/// Returns the handle whose `render()` backs the `/metrics` endpoint.
pub fn install() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install prometheus recorder")?;

    describe_gauge!(IS_LEADER, "1 when this instance holds the leader lock");
    describe_counter!(LEADER_CHANGES, "Leadership transitions observed");
    describe_gauge!(MARKETDATA_HEARTBEAT, Unit::Seconds, "Age of the last market data event");
    describe_gauge!(ORDER_STREAM_HEARTBEAT, Unit::Seconds, "Age of the last order stream event");
    describe_gauge!(SCAN_HEARTBEAT, Unit::Seconds, "Age of the last successful scan tick");
    describe_counter!(SCAN_TICKS, "Completed scan ticks");
    describe_counter!(SCAN_ERRORS, "Scan ticks that raised an error");
    describe_gauge!(SCAN_SUPERVISOR_STATE, "Supervisor state (0=stopped..4=stopping)");
    describe_counter!(SIGNALS, "Signals generated");
    describe_counter!(DECISIONS, "Decisions taken, labelled by outcome");
    describe_counter!(RISK_BLOCKS, "Risk gate rejections, labelled by type");
    describe_counter!(ORDERS_PLACED, "Orders acknowledged by the broker");
    describe_counter!(ORDERS_FILLED, "Orders observed filled");
    describe_counter!(OCO_CHILDREN_CREATED, "STOP/TP children placed");
    describe_histogram!(ORDER_LATENCY_MS, Unit::Milliseconds, "Submit-to-ack latency");
    describe_histogram!(TICK_TO_DECISION_MS, Unit::Milliseconds, "Scan start to decision latency");
    describe_gauge!(THROTTLE_QUEUE_DEPTH, "Rate limiter queue depth, labelled by class");
    describe_counter!(RETRIES, "Broker call retries, labelled by error type");
    describe_gauge!(POSITIONS_OPEN, "Currently open positions");
    describe_gauge!(PORTFOLIO_HEAT_RUPEES, "Aggregate open risk in rupees");
    describe_gauge!(DAILY_PNL_RUPEES, "Realised PnL for the session in rupees");
    describe_counter!(KILL_SWITCH, "Kill-switch activations, labelled by reason");
    describe_histogram!(FLATTEN_DURATION_MS, Unit::Milliseconds, "Wall time of flatten passes");

    Ok(handle)
}

// ── Terse helpers ────────────────────────────────────────────────────────────

pub fn set_leader(is_leader: bool, instance_id: &str) {
    metrics::gauge!(IS_LEADER, if is_leader { 1.0 } else { 0.0 }, "instance_id" => instance_id.to_string());
}

pub fn inc_leader_changes() {
    metrics::counter!(LEADER_CHANGES, 1);
}

pub fn inc_signals(n: u64) {
    metrics::counter!(SIGNALS, n);
}

pub fn inc_decision(outcome: &'static str) {
    metrics::counter!(DECISIONS, 1, "outcome" => outcome);
}

pub fn inc_risk_block(event_type: &'static str) {
    metrics::counter!(RISK_BLOCKS, 1, "type" => event_type);
}

pub fn inc_retry(error_type: &'static str) {
    metrics::counter!(RETRIES, 1, "type" => error_type);
}

pub fn inc_orders_placed() {
    metrics::counter!(ORDERS_PLACED, 1);
}

pub fn inc_orders_filled() {
    metrics::counter!(ORDERS_FILLED, 1);
}

pub fn inc_oco_children(n: u64) {
    metrics::counter!(OCO_CHILDREN_CREATED, n);
}

pub fn observe_order_latency_ms(ms: f64) {
    metrics::histogram!(ORDER_LATENCY_MS, ms);
}

pub fn observe_tick_to_decision_ms(ms: f64) {
    metrics::histogram!(TICK_TO_DECISION_MS, ms);
}

pub fn observe_flatten_duration_ms(ms: f64) {
    metrics::histogram!(FLATTEN_DURATION_MS, ms);
}

pub fn set_positions_open(n: f64) {
    metrics::gauge!(POSITIONS_OPEN, n);
}

pub fn set_portfolio_heat(rupees: f64) {
    metrics::gauge!(PORTFOLIO_HEAT_RUPEES, rupees);
}

pub fn set_daily_pnl(rupees: f64) {
    metrics::gauge!(DAILY_PNL_RUPEES, rupees);
}

pub fn set_scan_supervisor_state(state: f64) {
    metrics::gauge!(SCAN_SUPERVISOR_STATE, state);
}

pub fn inc_scan_ticks() {
    metrics::counter!(SCAN_TICKS, 1);
}

pub fn inc_scan_errors() {
    metrics::counter!(SCAN_ERRORS, 1);
}

pub fn beat_scan_heartbeat() {
    metrics::gauge!(SCAN_HEARTBEAT, 0.0);
}

pub fn beat_marketdata_heartbeat() {
    metrics::gauge!(MARKETDATA_HEARTBEAT, 0.0);
}

pub fn beat_order_stream_heartbeat() {
    metrics::gauge!(ORDER_STREAM_HEARTBEAT, 0.0);
}

pub fn inc_kill_switch(reason: &str) {
    metrics::counter!(KILL_SWITCH, 1, "reason" => reason.to_string());
}

pub fn set_throttle_depth(class: &'static str, depth: f64) {
    metrics::gauge!(THROTTLE_QUEUE_DEPTH, depth, "class" => class);
}

#[cfg(test)]
mod tests {
    // The recorder is process-global, so installation is exercised by the
    // integration scenarios rather than unit tests here; the helpers are
    // no-ops without a recorder and must not panic.
    use super::*;

    #[test]
    fn helpers_are_safe_without_recorder() {
        set_leader(true, "test-instance");
        inc_leader_changes();
        inc_signals(3);
        inc_decision("approved");
        inc_risk_block("HEAT_CAP");
        inc_retry("transient");
        inc_kill_switch("manual");
        set_throttle_depth("orders", 2.0);
    }
}
