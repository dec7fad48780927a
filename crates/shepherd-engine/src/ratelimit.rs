use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// First retry delay for a failing work item.
pub const BASE_DELAY: Duration = Duration::from_secs(15);
/// Per-item exponential backoff is capped here.
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// Overall retry throughput, shared across every item and kind.
const BUCKET_RATE: f64 = 10.0;
const BUCKET_BURST: f64 = 100.0;

/// Per-work-item retry controller: the maximum of an exponential
/// per-item failure backoff and a global token bucket.
///
/// Process-wide; construct once and share between dispatchers. Internally
/// locked, safe for concurrent use.
pub struct RateLimiter<K> {
    failures: Mutex<HashMap<K, u32>>,
    bucket: Mutex<TokenBucket>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new() -> Self {
        RateLimiter {
            failures: Mutex::new(HashMap::new()),
            bucket: Mutex::new(TokenBucket::new(BUCKET_RATE, BUCKET_BURST)),
        }
    }

    /// Delay before the next attempt for `item`. Each call counts as one more
    /// failure for the item, so callers invoke this exactly once per failed
    /// reconciliation.
    pub fn when(&self, item: &K) -> Duration {
        let exponential = {
            let mut failures = lock(&self.failures);
            let count = failures.entry(item.clone()).or_insert(0);
            let delay = exponential_delay(*count);
            *count += 1;
            delay
        };
        let global = lock(&self.bucket).reserve(Instant::now());
        exponential.max(global)
    }

    /// Reset the failure counter after a successful reconciliation.
    pub fn forget(&self, item: &K) {
        lock(&self.failures).remove(item);
    }

    pub fn retries(&self, item: &K) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

impl<K: Eq + Hash + Clone> Default for RateLimiter<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn exponential_delay(failures: u32) -> Duration {
    let secs = BASE_DELAY.as_secs_f64() * 2f64.powi(failures.min(i32::MAX as u32) as i32);
    Duration::from_secs_f64(secs.min(MAX_DELAY.as_secs_f64()))
}

struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    refilled: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        TokenBucket {
            rate,
            burst,
            tokens: burst,
            refilled: Instant::now(),
        }
    }

    /// Take one token, going negative if none is available, and return how
    /// long until the reservation is covered.
    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.refilled).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.refilled = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}
