//! Token-bucket rate limiter with lazy refill.
//!
//! Token accounting is exact: all mutation of a bucket happens under its own
//! lock, refill is computed lazily from the elapsed time, and the snapshot
//! returned by [`TokenBucketLimiter::statistics`] is point-in-time. Scoped
//! mode keeps one bucket per key in a concurrent map with approximate-LRU
//! eviction above the configured cap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

/// What happens when a bucket has too few tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitBehavior {
    /// Return `Throttled` immediately with a computed retry-after.
    Reject,
    /// Wait (bounded by `max_queue_wait`) for tokens to refill.
    Queue,
}

#[derive(Debug, Clone)]
pub struct TokenBucketOptions {
    /// Maximum tokens the bucket can hold.
    pub capacity: u64,
    /// Tokens added per `refill_period`.
    pub refill_rate: u64,
    pub refill_period: Duration,
    pub behavior: RateLimitBehavior,
    /// Upper bound on queue waits when `behavior == Queue`.
    pub max_queue_wait: Duration,
    /// Per-key buckets instead of one shared bucket.
    pub enable_scoping: bool,
    /// Eviction threshold for the scoped bucket map.
    pub max_scoped_keys: usize,
}

impl Default for TokenBucketOptions {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_rate: 100,
            refill_period: Duration::from_secs(1),
            behavior: RateLimitBehavior::Reject,
            max_queue_wait: Duration::from_secs(5),
            enable_scoping: false,
            max_scoped_keys: 10_000,
        }
    }
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitDecision {
    Allowed { remaining: u64 },
    Throttled { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// Point-in-time limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimiterStatistics {
    pub available_permits: u64,
    pub capacity: u64,
    pub refill_rate_per_second: f64,
    pub total_acquired: u64,
    pub total_throttled: u64,
    pub throttle_rate: f64,
    pub scoped_key_count: usize,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

struct Bucket {
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(capacity: u64) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: now,
                last_access: now,
            }),
        }
    }

    /// Refill lazily, then try to take `permits`. On shortfall returns the
    /// time until enough tokens will be available.
    fn try_acquire(&self, permits: u64, capacity: u64, rate_per_sec: f64) -> Result<u64, Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate_per_sec).min(capacity as f64);
        state.last_refill = now;
        state.last_access = now;

        if state.tokens >= permits as f64 {
            state.tokens -= permits as f64;
            Ok(state.tokens as u64)
        } else {
            let shortfall = permits as f64 - state.tokens;
            Err(Duration::from_secs_f64(shortfall / rate_per_sec))
        }
    }

    fn available(&self, capacity: u64, rate_per_sec: f64) -> u64 {
        let state = self.state.lock();
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        ((state.tokens + elapsed * rate_per_sec).min(capacity as f64)) as u64
    }

    fn last_access(&self) -> Instant {
        self.state.lock().last_access
    }
}

/// Token-bucket rate limiter.
pub struct TokenBucketLimiter {
    options: TokenBucketOptions,
    default_bucket: Bucket,
    scoped: DashMap<String, Arc<Bucket>>,
    acquired: AtomicU64,
    throttled: AtomicU64,
}

impl TokenBucketLimiter {
    pub fn new(options: TokenBucketOptions) -> Self {
        assert!(options.capacity > 0, "capacity must be positive");
        assert!(options.refill_rate > 0, "refill rate must be positive");
        let default_bucket = Bucket::new(options.capacity);
        Self {
            options,
            default_bucket,
            scoped: DashMap::new(),
            acquired: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    fn rate_per_second(&self) -> f64 {
        self.options.refill_rate as f64 / self.options.refill_period.as_secs_f64()
    }

    fn bucket_for(&self, key: Option<&str>) -> Option<Arc<Bucket>> {
        if !self.options.enable_scoping {
            return None;
        }
        let key = key?;
        if let Some(bucket) = self.scoped.get(key) {
            return Some(Arc::clone(&bucket));
        }

        if self.scoped.len() >= self.options.max_scoped_keys {
            self.evict_oldest();
        }
        let bucket = Arc::new(Bucket::new(self.options.capacity));
        self.scoped.insert(key.to_string(), Arc::clone(&bucket));
        Some(bucket)
    }

    /// Approximate LRU: drop the least-recently-accessed key.
    fn evict_oldest(&self) {
        let oldest = self
            .scoped
            .iter()
            .min_by_key(|entry| entry.value().last_access())
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.scoped.remove(&key);
            debug!(key = %key, "evicted scoped rate-limit bucket");
        }
    }

    fn try_once(&self, key: Option<&str>, permits: u64) -> Result<u64, Duration> {
        let rate = self.rate_per_second();
        match self.bucket_for(key) {
            Some(bucket) => bucket.try_acquire(permits, self.options.capacity, rate),
            None => self
                .default_bucket
                .try_acquire(permits, self.options.capacity, rate),
        }
    }

    /// Acquire `permits`, optionally scoped to `key`.
    pub async fn acquire(&self, key: Option<&str>, permits: u64) -> RateLimitDecision {
        match self.try_once(key, permits) {
            Ok(remaining) => {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                return RateLimitDecision::Allowed { remaining };
            }
            Err(retry_after) => {
                if self.options.behavior == RateLimitBehavior::Reject {
                    self.throttled.fetch_add(1, Ordering::Relaxed);
                    return RateLimitDecision::Throttled { retry_after };
                }
            }
        }

        // Queue behavior: wait for refills, bounded by max_queue_wait.
        let deadline = Instant::now() + self.options.max_queue_wait;
        loop {
            match self.try_once(key, permits) {
                Ok(remaining) => {
                    self.acquired.fetch_add(1, Ordering::Relaxed);
                    return RateLimitDecision::Allowed { remaining };
                }
                Err(retry_after) => {
                    let now = Instant::now();
                    if now + retry_after > deadline {
                        self.throttled.fetch_add(1, Ordering::Relaxed);
                        return RateLimitDecision::Throttled { retry_after };
                    }
                    tokio::time::sleep(retry_after).await;
                }
            }
        }
    }

    /// Non-waiting acquire regardless of the configured behavior.
    pub fn try_acquire(&self, key: Option<&str>, permits: u64) -> RateLimitDecision {
        match self.try_once(key, permits) {
            Ok(remaining) => {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                RateLimitDecision::Allowed { remaining }
            }
            Err(retry_after) => {
                self.throttled.fetch_add(1, Ordering::Relaxed);
                RateLimitDecision::Throttled { retry_after }
            }
        }
    }

    pub fn statistics(&self) -> RateLimiterStatistics {
        let acquired = self.acquired.load(Ordering::Relaxed);
        let throttled = self.throttled.load(Ordering::Relaxed);
        let total = acquired + throttled;
        RateLimiterStatistics {
            available_permits: self
                .default_bucket
                .available(self.options.capacity, self.rate_per_second()),
            capacity: self.options.capacity,
            refill_rate_per_second: self.rate_per_second(),
            total_acquired: acquired,
            total_throttled: throttled,
            throttle_rate: if total == 0 {
                0.0
            } else {
                throttled as f64 / total as f64
            },
            scoped_key_count: self.scoped.len(),
        }
    }
}
