//! Per-task-name token bucket rate limiting.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_sec: f64) -> Self {
        Self {
            capacity: rate_per_sec.max(1.0),
            tokens: rate_per_sec.max(1.0),
            refill_per_sec: rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Admission control applied before a task is handed to the pool.
/// `disable_rate_limits` bypasses all buckets, matching the worker-wide
/// override in configuration.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    default_rate_per_sec: Option<f64>,
    disabled: bool,
}

impl RateLimiter {
    pub fn new(default_rate_per_sec: Option<f64>, disabled: bool) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            default_rate_per_sec,
            disabled,
        }
    }

    /// Register an explicit per-task rate, overriding the default for that
    /// task name. `None` means unlimited.
    pub fn set_task_rate(&self, task_name: &str, rate_per_sec: Option<f64>) {
        let mut buckets = self.buckets.lock();
        match rate_per_sec {
            Some(rate) => {
                buckets.insert(task_name.to_string(), Bucket::new(rate));
            }
            None => {
                buckets.remove(task_name);
            }
        }
    }

    /// Whether a task named `task_name` may be admitted right now. Tasks
    /// with no configured bucket fall back to the worker default; no
    /// default means unlimited.
    pub fn try_admit(&self, task_name: &str) -> bool {
        if self.disabled {
            return true;
        }

        let mut buckets = self.buckets.lock();
        let now = Instant::now();
        if let Some(bucket) = buckets.get_mut(task_name) {
            return bucket.try_take(now);
        }

        match self.default_rate_per_sec {
            Some(rate) => {
                let bucket = buckets
                    .entry(task_name.to_string())
                    .or_insert_with(|| Bucket::new(rate));
                bucket.try_take(now)
            }
            None => true,
        }
    }

    /// How long until `task_name` would next be admitted, if currently
    /// throttled. Used by the Mediator to decide how long to defer a task
    /// it couldn't admit.
    pub fn retry_after(&self, task_name: &str) -> Duration {
        let buckets = self.buckets.lock();
        match buckets.get(task_name) {
            Some(bucket) if bucket.refill_per_sec > 0.0 => {
                Duration::from_secs_f64(1.0 / bucket.refill_per_sec)
            }
            _ => Duration::from_millis(100),
        }
    }
}
