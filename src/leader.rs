// =============================================================================
// LeaderLock — exactly-one orchestrator per deployment, backed by redis
// =============================================================================
//
// Acquire is an atomic SET NX EX on a well-known key whose value is this
// instance's UUID. Refresh re-reads the holder and extends the TTL only if it
// is still us; release deletes the key only if it is still us.
//
// Lock values are compared as text on both sides. The redis client may hand
// back binary or text frames depending on version; decoding through `String`
// accepts either, so the comparison never depends on the wire representation.
//
// Connectivity loss to the backend is treated identically to lock loss: the
// orchestrator pauses and a reacquire loop runs with jittered exponential
// backoff until the lock comes back or the process exits.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use redis::aio::ConnectionManager;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::bus::BusEvent;
use crate::metrics;
use crate::orchestrator::Orchestrator;
use crate::store::models::AuditAction;

/// Pause reason written when leadership is lost; the reacquire path only
/// auto-resumes a pause it created itself.
pub const LEADER_LOST_REASON: &str = "leader lock lost";

const REACQUIRE_BASE: Duration = Duration::from_millis(250);
const REACQUIRE_CAP: Duration = Duration::from_secs(5);
const REACQUIRE_JITTER: f64 = 0.20;

/// Distributed mutual-exclusion handle. Clones share the underlying
/// multiplexed connection.
#[derive(Clone)]
pub struct LeaderLock {
    conn: ConnectionManager,
    key: String,
    instance_id: String,
    lease_secs: u64,
}

impl LeaderLock {
    pub async fn connect(
        redis_url: &str,
        key: impl Into<String>,
        instance_id: impl Into<String>,
        lease_secs: u64,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| format!("invalid redis url '{redis_url}'"))?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis lock backend")?;

        Ok(Self {
            conn,
            key: key.into(),
            instance_id: instance_id.into(),
            lease_secs,
        })
    }

    /// Atomic set-if-absent with TTL. True iff we acquired the lock.
    pub async fn acquire(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let res: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(self.lease_secs)
            .query_async(&mut conn)
            .await
            .context("leader acquire failed")?;
        Ok(res.is_some())
    }

    /// Compare-and-extend: re-read the current holder and extend the TTL iff
    /// it is still us. False means the lock is lost.
    pub async fn refresh(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        // Decoding as String normalises binary and text replies alike.
        let holder: Option<String> = redis::cmd("GET")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .context("leader refresh read failed")?;

        match holder {
            Some(ref v) if v == &self.instance_id => {
                let _: bool = redis::cmd("EXPIRE")
                    .arg(&self.key)
                    .arg(self.lease_secs)
                    .query_async(&mut conn)
                    .await
                    .context("leader refresh extend failed")?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Delete the key iff we still hold it.
    pub async fn release(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = redis::cmd("GET")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .context("leader release read failed")?;

        if holder.as_deref() == Some(self.instance_id.as_str()) {
            let _: i64 = redis::cmd("DEL")
                .arg(&self.key)
                .query_async(&mut conn)
                .await
                .context("leader release delete failed")?;
            info!(key = %self.key, "leader lock released");
        }
        Ok(())
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_secs((self.lease_secs / 3).max(1))
    }
}

/// Jittered exponential backoff for the reacquire loop.
fn reacquire_backoff(attempt: u32, jitter_unit: f64) -> Duration {
    let exp = REACQUIRE_BASE.as_millis() as u64 * 2u64.saturating_pow(attempt.min(16));
    let capped = exp.min(REACQUIRE_CAP.as_millis() as u64);
    let jitter = (capped as f64 * REACQUIRE_JITTER * jitter_unit) as u64;
    Duration::from_millis(capped + jitter)
}

/// Background leadership loop: refresh while leading, reacquire when not.
///
/// On loss the orchestrator is paused and readiness drops; on reacquire a
/// pause created by this loop (and only such a pause) is lifted.
pub async fn run_leader_loop(
    lock: LeaderLock,
    state: Arc<AppState>,
    orchestrator: Arc<Orchestrator>,
) {
    let mut leading = false;
    let mut attempt: u32 = 0;

    loop {
        if leading {
            tokio::time::sleep(lock.refresh_interval()).await;

            let still_leader = match lock.refresh().await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(error = %e, "leader refresh failed — treating as lock loss");
                    false
                }
            };

            if !still_leader {
                leading = false;
                attempt = 0;
                metrics::inc_leader_changes();
                metrics::set_leader(false, lock.instance_id());
                state.leadership.set(false);
                state.bus.publish(BusEvent::LeaderChanged { is_leader: false });
                orchestrator.pause(LEADER_LOST_REASON).await;
                orchestrator.audit(
                    AuditAction::LeaderLost,
                    serde_json::json!({ "instance_id": lock.instance_id() }),
                );
                warn!(instance_id = %lock.instance_id(), "leadership lost — pausing and reacquiring");
            }
        } else {
            let acquired = match lock.acquire().await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(error = %e, "leader acquire failed — backend unreachable");
                    false
                }
            };

            if acquired {
                leading = true;
                attempt = 0;
                metrics::set_leader(true, lock.instance_id());
                state.leadership.set(true);
                state.bus.publish(BusEvent::LeaderChanged { is_leader: true });
                orchestrator.audit(
                    AuditAction::LeaderAcquired,
                    serde_json::json!({ "instance_id": lock.instance_id() }),
                );
                info!(instance_id = %lock.instance_id(), "leadership acquired");

                // Only lift a pause this loop itself created.
                orchestrator.resume_if_paused_for(LEADER_LOST_REASON).await;
            } else {
                let delay = reacquire_backoff(attempt, rand::thread_rng().gen_range(0.0..1.0));
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(reacquire_backoff(0, 0.0), Duration::from_millis(250));
        assert_eq!(reacquire_backoff(1, 0.0), Duration::from_millis(500));
        assert_eq!(reacquire_backoff(2, 0.0), Duration::from_millis(1000));
        // Capped at 5 s regardless of attempt count.
        assert_eq!(reacquire_backoff(10, 0.0), Duration::from_secs(5));
        assert_eq!(reacquire_backoff(60, 0.0), Duration::from_secs(5));
    }

    #[test]
    fn backoff_jitter_is_bounded() {
        let base = reacquire_backoff(10, 0.0);
        let max = reacquire_backoff(10, 1.0);
        assert!(max >= base);
        assert!(max <= base + Duration::from_millis((base.as_millis() as f64 * 0.20) as u64 + 1));
    }
}
