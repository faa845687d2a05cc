// =============================================================================
// RateLimiter — token-bucket throttle per broker endpoint class
// =============================================================================
//
// Each endpoint class has its own bucket and a bounded waiter queue. A caller
// that finds the queue at its high-water mark fails fast with a retryable
// error instead of piling on. The kill-switch path uses priority acquisition,
// which ignores the queue bound — exits must never starve behind entries.
//
// Queue depth is exported per class; depth that stays above the pressure
// threshold is surfaced to the orchestrator, which pauses new entries.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::broker::BrokerError;
use crate::metrics;

/// Broker endpoint classes with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// Order placement and cancellation.
    Orders,
    /// Order modification.
    Modify,
    /// Quotes and other data reads.
    Data,
}

impl EndpointClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Modify => "modify",
            Self::Data => "data",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Orders => 0,
            Self::Modify => 1,
            Self::Data => 2,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// When the queue first exceeded the pressure threshold, if it still does.
    pressured_since: Option<Instant>,
}

struct Bucket {
    capacity: f64,
    refill_per_sec: f64,
    max_queue: u64,
    state: Mutex<BucketState>,
    queue_depth: AtomicU64,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64, max_queue: u64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            max_queue,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                pressured_since: None,
            }),
            queue_depth: AtomicU64::new(0),
        }
    }

    /// Take one token, or return the duration to wait before retrying.
    fn try_take(&self, pressure_threshold: u64) -> Result<(), Duration> {
        let mut s = self.state.lock();
        let elapsed = s.last_refill.elapsed().as_secs_f64();
        s.tokens = (s.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        s.last_refill = Instant::now();

        let depth = self.queue_depth.load(Ordering::Relaxed);
        if depth > pressure_threshold {
            if s.pressured_since.is_none() {
                s.pressured_since = Some(Instant::now());
            }
        } else {
            s.pressured_since = None;
        }

        if s.tokens >= 1.0 {
            s.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - s.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    fn pressured_for(&self) -> Option<Duration> {
        self.state.lock().pressured_since.map(|t| t.elapsed())
    }
}

/// Token-bucket throttle shared across the execution paths.
pub struct RateLimiter {
    buckets: [Bucket; 3],
    /// Queue depths above this count as pressure.
    pressure_threshold: u64,
}

impl RateLimiter {
    /// Budgets sized for a retail broker gateway: orders are the scarce
    /// resource, data reads are cheap.
    pub fn new() -> Self {
        Self {
            buckets: [
                Bucket::new(10.0, 10.0, 32),
                Bucket::new(10.0, 10.0, 32),
                Bucket::new(50.0, 50.0, 128),
            ],
            pressure_threshold: 8,
        }
    }

    #[cfg(test)]
    fn with_budget(capacity: f64, refill_per_sec: f64, max_queue: u64) -> Self {
        Self {
            buckets: [
                Bucket::new(capacity, refill_per_sec, max_queue),
                Bucket::new(capacity, refill_per_sec, max_queue),
                Bucket::new(capacity, refill_per_sec, max_queue),
            ],
            pressure_threshold: 2,
        }
    }

    /// Wait for a token on `class`, failing fast when the queue is saturated.
    pub async fn acquire(&self, class: EndpointClass) -> Result<(), BrokerError> {
        self.acquire_inner(class, false).await
    }

    /// Priority acquisition for the kill-switch path: never rejected on queue
    /// depth, always waits a token out.
    pub async fn acquire_priority(&self, class: EndpointClass) -> Result<(), BrokerError> {
        self.acquire_inner(class, true).await
    }

    async fn acquire_inner(&self, class: EndpointClass, priority: bool) -> Result<(), BrokerError> {
        let bucket = &self.buckets[class.index()];

        let depth = bucket.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_throttle_depth(class.as_str(), depth as f64);

        if !priority && depth > bucket.max_queue {
            bucket.queue_depth.fetch_sub(1, Ordering::SeqCst);
            metrics::set_throttle_depth(class.as_str(), (depth - 1) as f64);
            warn!(class = class.as_str(), depth, "throttle queue saturated — failing fast");
            return Err(BrokerError::transient(format!(
                "rate limiter queue full for {} endpoints",
                class.as_str()
            )));
        }

        loop {
            match bucket.try_take(self.pressure_threshold) {
                Ok(()) => {
                    let depth = bucket.queue_depth.fetch_sub(1, Ordering::SeqCst) - 1;
                    metrics::set_throttle_depth(class.as_str(), depth as f64);
                    return Ok(());
                }
                Err(wait) => {
                    debug!(class = class.as_str(), wait_ms = wait.as_millis() as u64, "throttled");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Longest-running pressure condition across classes, if any.
    pub fn sustained_pressure(&self) -> Option<(EndpointClass, Duration)> {
        for class in [EndpointClass::Orders, EndpointClass::Modify, EndpointClass::Data] {
            if let Some(d) = self.buckets[class.index()].pressured_for() {
                return Some((class, d));
            }
        }
        None
    }

    pub fn queue_depth(&self, class: EndpointClass) -> u64 {
        self.buckets[class.index()].queue_depth.load(Ordering::Relaxed)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
