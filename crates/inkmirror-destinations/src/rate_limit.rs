//! Proactive rate limiting for destination API calls
//!
//! Destinations throttle aggressively; waiting for 429s wastes attempts and
//! burns the work queue's retry budget. Each destination client therefore
//! acquires from a token bucket before calling out, and feeds throttle
//! signals back so capacity adapts to what the destination will actually
//! accept.
//!
//! Buckets are kept per operation class: metadata-only calls are limited
//! more loosely than full content writes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Operation classes with independent budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// Container creation and page content writes
    ContentWrite,
    /// Metadata-only property updates
    MetadataWrite,
    /// Reads: duplicate checks, connection validation
    Read,
}

/// Requests-per-minute budgets per operation class
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// Content writes per minute
    pub content_writes_per_minute: u32,
    /// Metadata writes per minute (looser than content, per policy)
    pub metadata_writes_per_minute: u32,
    /// Reads per minute
    pub reads_per_minute: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            content_writes_per_minute: 30,
            metadata_writes_per_minute: 120,
            reads_per_minute: 120,
        }
    }
}

/// Mutable bucket state, guarded by the limiter's mutex
struct Bucket {
    /// Fractional tokens currently available
    tokens: f64,
    /// Capacity after adaptive reductions
    effective_capacity: f64,
    /// Capacity as configured
    configured_capacity: f64,
    /// Tokens restored per second
    refill_per_sec: f64,
    /// When tokens were last recomputed
    last_refill: Instant,
    /// Successes since the last throttle, for capacity recovery
    successes: u32,
}

impl Bucket {
    fn new(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            tokens: capacity,
            effective_capacity: capacity,
            configured_capacity: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
            successes: 0,
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.effective_capacity);
            self.last_refill = Instant::now();
        }
    }

    /// Time until one token is available; zero if one is ready now
    fn wait_for_token(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }
}

/// Consecutive successes required to step capacity back up after a throttle
const RECOVERY_SUCCESSES: u32 = 10;

/// Adaptive per-operation rate limiter for one destination
pub struct DestinationRateLimiter {
    buckets: Mutex<HashMap<OpClass, Bucket>>,
}

impl DestinationRateLimiter {
    /// Creates a limiter with the given budgets
    pub fn new(settings: RateLimitSettings) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(
            OpClass::ContentWrite,
            Bucket::new(settings.content_writes_per_minute),
        );
        buckets.insert(
            OpClass::MetadataWrite,
            Bucket::new(settings.metadata_writes_per_minute),
        );
        buckets.insert(OpClass::Read, Bucket::new(settings.reads_per_minute));
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    /// Acquires a token for `op`, sleeping until one is available
    pub async fn acquire(&self, op: OpClass) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().unwrap();
                let bucket = buckets
                    .get_mut(&op)
                    .unwrap_or_else(|| unreachable!("all op classes are registered"));
                bucket.wait_for_token()
            };
            if wait.is_zero() {
                return;
            }
            debug!(op = ?op, wait_ms = wait.as_millis() as u64, "Rate limit wait");
            tokio::time::sleep(wait).await;
        }
    }

    /// Records a successful call; restores capacity gradually after throttles
    pub fn on_success(&self, op: OpClass) {
        let mut buckets = self.buckets.lock().unwrap();
        let Some(bucket) = buckets.get_mut(&op) else {
            return;
        };
        if bucket.effective_capacity >= bucket.configured_capacity {
            return;
        }
        bucket.successes += 1;
        if bucket.successes >= RECOVERY_SUCCESSES {
            bucket.successes = 0;
            bucket.effective_capacity =
                (bucket.effective_capacity * 1.5).min(bucket.configured_capacity);
            bucket.refill_per_sec = bucket.effective_capacity / 60.0;
            debug!(
                op = ?op,
                capacity = bucket.effective_capacity,
                "Rate limit capacity restored"
            );
        }
    }

    /// Records a destination throttle; halves the effective capacity
    pub fn on_throttle(&self, op: OpClass) {
        let mut buckets = self.buckets.lock().unwrap();
        let Some(bucket) = buckets.get_mut(&op) else {
            return;
        };
        bucket.effective_capacity = (bucket.effective_capacity / 2.0).max(1.0);
        bucket.refill_per_sec = bucket.effective_capacity / 60.0;
        bucket.tokens = bucket.tokens.min(bucket.effective_capacity);
        bucket.successes = 0;
        warn!(
            op = ?op,
            capacity = bucket.effective_capacity,
            "Destination throttled, reducing call rate"
        );
    }

    #[cfg(test)]
    fn effective_capacity(&self, op: OpClass) -> f64 {
        self.buckets.lock().unwrap()[&op].effective_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_within_capacity_is_immediate() {
        let limiter = DestinationRateLimiter::new(RateLimitSettings::default());
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire(OpClass::Read).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_exhausted_bucket_waits() {
        let limiter = DestinationRateLimiter::new(RateLimitSettings {
            content_writes_per_minute: 1,
            metadata_writes_per_minute: 1,
            reads_per_minute: 1,
        });
        limiter.acquire(OpClass::ContentWrite).await;

        // Second acquire must wait for refill (1/min => ~60s); don't actually
        // wait, just verify the bucket reports a delay.
        let wait = {
            let mut buckets = limiter.buckets.lock().unwrap();
            buckets.get_mut(&OpClass::ContentWrite).unwrap().wait_for_token()
        };
        assert!(wait > Duration::from_secs(30));
    }

    #[test]
    fn test_throttle_halves_capacity() {
        let limiter = DestinationRateLimiter::new(RateLimitSettings::default());
        let before = limiter.effective_capacity(OpClass::ContentWrite);
        limiter.on_throttle(OpClass::ContentWrite);
        assert_eq!(limiter.effective_capacity(OpClass::ContentWrite), before / 2.0);

        // Repeated throttles floor at 1
        for _ in 0..20 {
            limiter.on_throttle(OpClass::ContentWrite);
        }
        assert_eq!(limiter.effective_capacity(OpClass::ContentWrite), 1.0);
    }

    #[test]
    fn test_successes_restore_capacity() {
        let limiter = DestinationRateLimiter::new(RateLimitSettings::default());
        let configured = limiter.effective_capacity(OpClass::ContentWrite);
        limiter.on_throttle(OpClass::ContentWrite);
        limiter.on_throttle(OpClass::ContentWrite);

        for _ in 0..(RECOVERY_SUCCESSES * 10) {
            limiter.on_success(OpClass::ContentWrite);
        }
        assert_eq!(limiter.effective_capacity(OpClass::ContentWrite), configured);
    }

    #[test]
    fn test_metadata_budget_is_looser_than_content() {
        let settings = RateLimitSettings::default();
        assert!(settings.metadata_writes_per_minute > settings.content_writes_per_minute);
    }
}
