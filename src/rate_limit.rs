//! Per-endpoint REST rate limiting
//!
//! One token bucket per endpoint path. Buckets are shared by every task that
//! issues REST calls; refill-and-take happens under the bucket's mutex so
//! concurrent callers never double-spend a token.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64, // tokens per second
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_interval: Duration) -> Self {
        let capacity = capacity.max(1) as f64;
        TokenBucket {
            tokens: capacity,
            capacity,
            refill_rate: capacity / refill_interval.as_secs_f64(),
            last_update: Instant::now(),
        }
    }

    /// Take one token, or report how long until one is available
    fn try_take(&mut self) -> std::result::Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_rate))
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_update = now;
    }
}

/// Token buckets keyed by endpoint
#[derive(Clone)]
pub struct RateLimiter {
    per_second: u32,
    buckets: Arc<DashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        Self {
            per_second,
            buckets: Arc::new(DashMap::new()),
        }
    }

    fn bucket(&self, endpoint: &str) -> Arc<Mutex<TokenBucket>> {
        self.buckets
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket::new(self.per_second, Duration::from_secs(1))))
            })
            .clone()
    }

    /// Non-blocking attempt
    pub fn try_acquire(&self, endpoint: &str) -> std::result::Result<(), Duration> {
        self.bucket(endpoint).lock().try_take()
    }

    /// Wait until a token for `endpoint` is available and take it
    pub async fn acquire(&self, endpoint: &str) {
        let bucket = self.bucket(endpoint);
        loop {
            let wait = match bucket.lock().try_take() {
                Ok(()) => return,
                Err(wait) => wait,
            };
            debug!(endpoint, wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}
