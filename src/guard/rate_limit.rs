//! Per-minute request rate limiting.
//!
//! A fixed one-minute window per client identity, counted in the shared store under
//! `ratelimit:{ip}:{YYYYMMDDHHMM}`. Shared counters keep the limit consistent across
//! instances; when the store is unavailable requests are allowed.

use super::{system_clock, Clock};
use crate::kv::{bounded, KvError, KvStore};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::warn;

pub const DEFAULT_LIMIT_PER_MINUTE: u32 = 60;
const WINDOW: Duration = Duration::from_secs(60);
const DEADLINE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check_ip(&self, ip: &str) -> RateLimitDecision;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn check_ip(&self, _ip: &str) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

pub struct WindowRateLimiter {
    kv: Arc<dyn KvStore>,
    limit: u32,
    clock: Clock,
}

impl WindowRateLimiter {
    /// `limit` is clamped to at least one request per minute.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, limit: u32) -> Self {
        Self {
            kv,
            limit: limit.max(1),
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    async fn hit(&self, key: &str) -> Result<i64, KvError> {
        self.kv.increment_with_ttl(key, WINDOW).await
    }
}

#[async_trait]
impl RateLimiter for WindowRateLimiter {
    async fn check_ip(&self, ip: &str) -> RateLimitDecision {
        let key = format!("ratelimit:{ip}:{}", (self.clock)().format("%Y%m%d%H%M"));
        match bounded(DEADLINE, self.hit(&key)).await {
            Ok(count) if count > i64::from(self.limit) => RateLimitDecision::Limited,
            Ok(_) => RateLimitDecision::Allowed,
            Err(err) => {
                warn!(ip, error = %err, "rate limit check failed, allowing");
                RateLimitDecision::Allowed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{
        testing::{ExpireRefusingStore, UnavailableStore},
        MemoryStore,
    };
    use chrono::{Local, TimeZone};
    use parking_lot::Mutex;

    #[tokio::test]
    async fn noop_rate_limiter_allows() {
        assert_eq!(
            NoopRateLimiter.check_ip("203.0.113.5").await,
            RateLimitDecision::Allowed
        );
    }

    #[tokio::test]
    async fn limits_after_threshold_within_a_minute() {
        let limiter = WindowRateLimiter::new(Arc::new(MemoryStore::new()), 3);
        for _ in 0..3 {
            assert_eq!(limiter.check_ip("a").await, RateLimitDecision::Allowed);
        }
        assert_eq!(limiter.check_ip("a").await, RateLimitDecision::Limited);
        assert_eq!(limiter.check_ip("b").await, RateLimitDecision::Allowed);
    }

    #[tokio::test]
    async fn new_minute_opens_a_new_window() {
        let minute = Arc::new(Mutex::new(0u32));
        let source = Arc::clone(&minute);
        let clock: Clock = Arc::new(move || {
            Local
                .with_ymd_and_hms(2024, 5, 1, 12, *source.lock(), 0)
                .single()
                .expect("unambiguous local time")
        });
        let limiter = WindowRateLimiter::new(Arc::new(MemoryStore::new()), 1).with_clock(clock);

        assert_eq!(limiter.check_ip("a").await, RateLimitDecision::Allowed);
        assert_eq!(limiter.check_ip("a").await, RateLimitDecision::Limited);
        *minute.lock() = 1;
        assert_eq!(limiter.check_ip("a").await, RateLimitDecision::Allowed);
    }

    #[test]
    fn zero_limit_is_clamped() {
        let limiter = WindowRateLimiter::new(Arc::new(MemoryStore::new()), 0);
        assert_eq!(limiter.limit(), 1);
    }

    #[tokio::test]
    async fn unavailable_backend_fails_open() {
        let limiter = WindowRateLimiter::new(Arc::new(UnavailableStore), 1);
        for _ in 0..5 {
            assert_eq!(limiter.check_ip("a").await, RateLimitDecision::Allowed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_counter_expires_without_a_separate_expire() {
        let store = Arc::new(ExpireRefusingStore::new());
        let clock: Clock = Arc::new(|| {
            Local
                .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
                .single()
                .expect("unambiguous local time")
        });
        let limiter = WindowRateLimiter::new(store.clone(), 1).with_clock(clock);
        assert_eq!(limiter.check_ip("a").await, RateLimitDecision::Allowed);
        assert_eq!(limiter.check_ip("a").await, RateLimitDecision::Limited);

        tokio::time::advance(WINDOW + Duration::from_secs(1)).await;
        assert_eq!(
            store.get("ratelimit:a:202405011200").await.expect("memory store"),
            None
        );
    }
}
