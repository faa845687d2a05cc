// =============================================================================
// ScanSupervisor — drives the scan pipeline on a fixed cadence, self-healing
// =============================================================================
//
// State machine: STOPPED → RUNNING → (DONE | EXCEPTION | STOPPING) → STOPPED,
// exported as the `trader_scan_supervisor_state` gauge (0..4).
//
// Each tick calls `Orchestrator::scan_once` under a timeout of 80% of the
// tick interval. Exceptions back off exponentially (capped at 30 s) and the
// loop restarts itself; more than five consecutive exceptions raise a risk
// event and pause the orchestrator. Every successful tick resets the scan
// heartbeat — the engine's primary readiness signal.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::metrics;
use crate::orchestrator::Orchestrator;
use crate::store::models::RiskEventType;

/// Consecutive scan failures before the orchestrator is paused.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    Stopped = 0,
    Running = 1,
    Done = 2,
    Exception = 3,
    Stopping = 4,
}

/// Introspection payload for `/debug/supervisor/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub ticks: u64,
    pub errors: u64,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub scan_interval_secs: u64,
}

pub struct ScanSupervisor {
    app: Arc<AppState>,
    orchestrator: Arc<Orchestrator>,
    interval: Duration,

    state: RwLock<SupervisorState>,
    ticks: AtomicU64,
    errors: AtomicU64,
    consecutive_errors: AtomicU32,
    last_error: RwLock<Option<String>>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl ScanSupervisor {
    pub fn new(app: Arc<AppState>, orchestrator: Arc<Orchestrator>) -> Self {
        let interval = app.config.scan_interval();
        let (stop_tx, _) = watch::channel(false);
        Self {
            app,
            orchestrator,
            interval,
            state: RwLock::new(SupervisorState::Stopped),
            ticks: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            last_error: RwLock::new(None),
            running: AtomicBool::new(false),
            stop_tx,
        }
    }

    fn set_state(&self, state: SupervisorState) {
        *self.state.write() = state;
        metrics::set_scan_supervisor_state(state as u8 as f64);
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: *self.state.read(),
            ticks: self.ticks.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
            scan_interval_secs: self.interval.as_secs(),
        }
    }

    /// Spawn the loop if it is not already running. Used at startup and by
    /// `/debug/supervisor/start`.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.stop_tx.send(false);
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
        true
    }

    /// Signal the loop to stop. The in-flight scan gets half a tick of grace
    /// (its own timeout is tighter than that anyway), then the loop exits.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn run(self: Arc<Self>) {
        info!(interval_secs = self.interval.as_secs(), "scan supervisor started");
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
            if *stop_rx.borrow() {
                break;
            }

            self.set_state(SupervisorState::Running);
            let budget = self.interval.mul_f64(0.8);

            let outcome = tokio::select! {
                res = tokio::time::timeout(budget, self.orchestrator.scan_once()) => res,
                _ = stop_rx.changed() => {
                    // Grace for the in-flight scan, then cancel by dropping.
                    self.set_state(SupervisorState::Stopping);
                    let grace = self.interval.mul_f64(0.5);
                    let _ = tokio::time::timeout(grace, self.orchestrator.scan_once()).await;
                    break;
                }
            };

            match outcome {
                Ok(Ok(())) => {
                    self.ticks.fetch_add(1, Ordering::Relaxed);
                    self.consecutive_errors.store(0, Ordering::Relaxed);
                    metrics::inc_scan_ticks();
                    self.app.beat_scan();
                    self.set_state(SupervisorState::Done);
                }
                Ok(Err(e)) => self.handle_failure(format!("{e:#}")).await,
                Err(_) => self.handle_failure("scan_once exceeded its time budget".to_string()).await,
            }
        }

        self.set_state(SupervisorState::Stopping);
        self.running.store(false, Ordering::SeqCst);
        self.set_state(SupervisorState::Stopped);
        info!("scan supervisor stopped");
    }

    async fn handle_failure(&self, message: String) {
        error!(error = %message, "scan tick failed");
        self.set_state(SupervisorState::Exception);
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::inc_scan_errors();
        *self.last_error.write() = Some(message.clone());

        let streak = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if streak > MAX_CONSECUTIVE_ERRORS {
            self.orchestrator.record_risk_event(
                RiskEventType::ScanSupervisor,
                None,
                &format!("{streak} consecutive scan failures; last: {message}"),
            );
            self.orchestrator.pause("scan supervisor failure streak").await;
        }

        let backoff = scan_backoff(streak.saturating_sub(1));
        warn!(streak, backoff_ms = backoff.as_millis() as u64, "scan loop backing off");
        tokio::time::sleep(backoff).await;
    }
}

fn scan_backoff(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE.as_millis() as u64 * 2u64.saturating_pow(attempt.min(16));
    Duration::from_millis(ms.min(BACKOFF_CAP.as_millis() as u64))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_caps_at_thirty_seconds() {
        assert_eq!(scan_backoff(0), Duration::from_millis(250));
        assert_eq!(scan_backoff(1), Duration::from_millis(500));
        assert_eq!(scan_backoff(4), Duration::from_millis(4000));
        assert_eq!(scan_backoff(7), Duration::from_secs(30));
        assert_eq!(scan_backoff(30), Duration::from_secs(30));
    }

    #[test]
    fn state_gauge_values_match_contract() {
        assert_eq!(SupervisorState::Stopped as u8, 0);
        assert_eq!(SupervisorState::Running as u8, 1);
        assert_eq!(SupervisorState::Done as u8, 2);
        assert_eq!(SupervisorState::Exception as u8, 3);
        assert_eq!(SupervisorState::Stopping as u8, 4);
    }
}
