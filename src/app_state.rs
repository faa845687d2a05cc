// =============================================================================
// Central Application State — Meridian Trading Engine
// =============================================================================
//
// The single source of shared handles for the engine. All long-lived tasks
// hold `Arc<AppState>`; subsystem engines manage their own interior
// mutability and the coordinator lock guards the orchestrator's small mutable
// core (mode, pause, heat, daily pnl).
//
// Thread safety:
//   - Atomics for leadership flags.
//   - parking_lot::RwLock for the coordinator and heartbeat instants.
//   - Arc wrappers for subsystem engines.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::bus::EventBus;
use crate::config::Config;
use crate::market_data::MarketDataHub;
use crate::store::Store;
use crate::types::TradingMode;

/// Mutable orchestrator core, guarded by one coordinator lock. Readers take
/// a snapshot; writers hold the lock briefly.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorState {
    pub mode: TradingMode,
    pub paused: bool,
    pub pause_reason: Option<String>,
    /// Aggregate open risk in rupees.
    pub portfolio_heat: f64,
    /// Realised session PnL in rupees.
    pub daily_realized_pnl: f64,
    /// Unix millis of the last completed scan.
    pub last_scan_at: Option<i64>,
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self {
            // Warm restarts force PAPER; LIVE is an explicit transition.
            mode: TradingMode::Paper,
            paused: false,
            pause_reason: None,
            portfolio_heat: 0.0,
            daily_realized_pnl: 0.0,
            last_scan_at: None,
        }
    }
}

/// Leadership flags mirrored from the leader loop.
#[derive(Debug, Default)]
pub struct Leadership {
    is_leader: AtomicBool,
    changes: AtomicU64,
}

impl Leadership {
    pub fn set(&self, is_leader: bool) {
        let was = self.is_leader.swap(is_leader, Ordering::SeqCst);
        if was != is_leader {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::SeqCst)
    }
}

/// Central application state shared across all async tasks via `Arc`.
pub struct AppState {
    pub config: Arc<Config>,
    /// Content hash of the configuration snapshot.
    pub config_sha: String,
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub market: Arc<MarketDataHub>,

    pub coordinator: RwLock<CoordinatorState>,
    pub leadership: Leadership,

    // ── Heartbeats (market data lives on the hub) ───────────────────────
    order_stream_beat: RwLock<Instant>,
    scan_beat: RwLock<Instant>,

    // ── Identity ────────────────────────────────────────────────────────
    pub instance_id: String,
    pub session_id: String,
    pub git_head: String,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>, store: Arc<Store>, market: Arc<MarketDataHub>, bus: EventBus) -> Self {
        let config_sha = config.config_sha();
        Self {
            config,
            config_sha,
            store,
            bus,
            market,
            coordinator: RwLock::new(CoordinatorState::default()),
            leadership: Leadership::default(),
            order_stream_beat: RwLock::new(Instant::now()),
            scan_beat: RwLock::new(Instant::now()),
            instance_id: uuid::Uuid::new_v4().to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            git_head: option_env!("GIT_HEAD").unwrap_or("unknown").to_string(),
            start_time: Instant::now(),
        }
    }

    // ── Heartbeats ──────────────────────────────────────────────────────

    pub fn beat_order_stream(&self) {
        *self.order_stream_beat.write() = Instant::now();
        crate::metrics::beat_order_stream_heartbeat();
    }

    pub fn beat_scan(&self) {
        *self.scan_beat.write() = Instant::now();
        crate::metrics::beat_scan_heartbeat();
    }

    pub fn order_stream_age_secs(&self) -> f64 {
        self.order_stream_beat.read().elapsed().as_secs_f64()
    }

    pub fn scan_age_secs(&self) -> f64 {
        self.scan_beat.read().elapsed().as_secs_f64()
    }

    // ── Readiness ───────────────────────────────────────────────────────

    /// Ready iff we hold the leader lock and all three heartbeats are fresh.
    /// Returns the failing gauges otherwise.
    pub fn readiness(&self) -> Result<(), Vec<String>> {
        let stale = self.config.heartbeat_stale_secs as f64;
        let mut reasons = Vec::new();

        if !self.leadership.is_leader() {
            reasons.push("is_leader=0".to_string());
        }
        let md_age = self.market.heartbeat_age_secs();
        if md_age > stale {
            reasons.push(format!("marketdata_heartbeat_seconds={md_age:.1}"));
        }
        let os_age = self.order_stream_age_secs();
        if os_age > stale {
            reasons.push(format!("order_stream_heartbeat_seconds={os_age:.1}"));
        }
        let scan_age = self.scan_age_secs();
        if scan_age > stale {
            reasons.push(format!("scan_heartbeat_seconds={scan_age:.1}"));
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }

    /// Snapshot of the coordinator core (readers never hold the lock).
    pub fn coordinator_snapshot(&self) -> CoordinatorState {
        self.coordinator.read().clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tick;

    fn app() -> AppState {
        let config = Arc::new(Config::default());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::default();
        let market = Arc::new(MarketDataHub::new(bus.clone()));
        AppState::new(config, store, market, bus)
    }

    #[test]
    fn leadership_tracks_changes() {
        let l = Leadership::default();
        assert!(!l.is_leader());
        l.set(true);
        l.set(true); // no-op
        l.set(false);
        assert_eq!(l.changes(), 2);
    }

    #[test]
    fn readiness_requires_leadership() {
        let state = app();
        // Heartbeats are fresh at construction, but we are not leader.
        state.market.apply_tick(Tick {
            token: 1,
            symbol: "NIFTY".to_string(),
            last: 100.0,
            bid: 99.9,
            ask: 100.1,
            ts: 0,
        });
        state.beat_order_stream();
        state.beat_scan();

        let reasons = state.readiness().unwrap_err();
        assert_eq!(reasons, vec!["is_leader=0".to_string()]);

        state.leadership.set(true);
        assert!(state.readiness().is_ok());
    }

    #[test]
    fn default_coordinator_is_paper_and_unpaused() {
        let state = app();
        let snap = state.coordinator_snapshot();
        assert_eq!(snap.mode, TradingMode::Paper);
        assert!(!snap.paused);
        assert!(snap.last_scan_at.is_none());
    }
}
