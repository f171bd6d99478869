//! Per-user upload rate limiting
//!
//! Authenticated uploads are limited per user (not per IP) with a keyed
//! governor limiter. Successful checks report the remaining budget so the
//! handler can emit `X-RateLimit-*` headers; failed checks carry the
//! retry-after hint for the 429 response.

use std::num::NonZeroU32;

use governor::clock::{Clock, DefaultClock};
use governor::middleware::StateInformationMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

use inkmirror_core::domain::newtypes::UserId;

/// Rate-limit headers for a passing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateHeaders {
    /// Configured requests per minute
    pub limit: u32,
    /// Requests remaining in the current window
    pub remaining: u32,
    /// Seconds until the budget fully replenishes
    pub reset_secs: u64,
}

/// Keyed per-user limiter for the upload endpoint
pub struct UploadRateLimiter {
    limiter: RateLimiter<
        UserId,
        DefaultKeyedStateStore<UserId>,
        DefaultClock,
        StateInformationMiddleware,
    >,
    clock: DefaultClock,
    per_minute: u32,
}

impl UploadRateLimiter {
    /// Creates a limiter allowing `per_minute` uploads per user
    pub fn new(per_minute: u32) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(per_minute.max(1)).unwrap_or(NonZeroU32::MIN),
        );
        Self {
            limiter: RateLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>(),
            clock: DefaultClock::default(),
            per_minute: per_minute.max(1),
        }
    }

    /// Checks one upload for `user`
    ///
    /// `Ok` carries the headers to attach; `Err` carries the retry-after
    /// hint in seconds.
    pub fn check(&self, user: &UserId) -> Result<RateHeaders, u64> {
        match self.limiter.check_key(user) {
            Ok(snapshot) => Ok(RateHeaders {
                limit: self.per_minute,
                remaining: snapshot.remaining_burst_capacity(),
                reset_secs: 60,
            }),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Err(wait.as_secs().max(1))
            }
        }
    }
}
