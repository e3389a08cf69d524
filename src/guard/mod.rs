//! Registration abuse control.
//!
//! Every gate is keyed by client identity (the resolved IP) and stored in the shared
//! key-value store:
//!
//! | Gate | Key | Lifetime |
//! |---|---|---|
//! | cooldown | `reg:cooldown:{ip}` | cooldown window |
//! | daily successes | `reg:succday:{ip}:{YYYYMMDD}` | until next local midnight |
//! | hourly failures | `reg:failhour:{ip}:{YYYYMMDDHH}` | one hour |
//! | ban | `reg:ban:{ip}` | ban duration |
//!
//! All gates fail open: when the store errors or times out the request is let through.
//! [`AbuseGuard::guard_registration`] applies them in order: ban, cooldown, daily quota,
//! then the attempt itself.

pub mod rate_limit;

use crate::kv::{bounded, KvError, KvStore};
use chrono::{DateTime, Local, TimeZone};
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);
pub const DEFAULT_DAILY_MAX: u32 = 5;
pub const DEFAULT_FAILURES_PER_HOUR: u32 = 20;
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(60 * 60);
const DEFAULT_DEADLINE: Duration = Duration::from_millis(500);
const FAILURE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Source of local wall-clock time; swapped out in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

#[must_use]
pub fn system_clock() -> Clock {
    Arc::new(Local::now)
}

/// Time left until the next local midnight, never zero.
#[must_use]
pub fn until_next_midnight(now: DateTime<Local>) -> Duration {
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .and_then(|midnight| (midnight - now).to_std().ok())
        .filter(|left| !left.is_zero())
        .unwrap_or(Duration::from_secs(24 * 60 * 60))
}

/// Registration limits. Zero disables cooldown, daily quota and banning respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationPolicy {
    pub cooldown: Duration,
    pub daily_max: u32,
    pub failures_per_hour: u32,
    pub ban_duration: Duration,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            daily_max: DEFAULT_DAILY_MAX,
            failures_per_hour: DEFAULT_FAILURES_PER_HOUR,
            ban_duration: DEFAULT_BAN_DURATION,
        }
    }
}

impl RegistrationPolicy {
    /// A zero ban duration falls back to one hour.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.ban_duration.is_zero() {
            self.ban_duration = DEFAULT_BAN_DURATION;
        }
        self
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("temporarily banned, retry later")]
    Banned,
    #[error("too many attempts, retry later")]
    Cooldown,
    #[error("daily registration limit reached")]
    DailyQuotaExceeded,
}

#[derive(Debug, Error)]
pub enum RegistrationError<E> {
    #[error("{0}")]
    Rejected(Rejection),
    #[error("registration attempt failed")]
    Attempt(#[source] E),
}

pub struct AbuseGuard {
    kv: Arc<dyn KvStore>,
    policy: RegistrationPolicy,
    deadline: Duration,
    clock: Clock,
}

impl AbuseGuard {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, policy: RegistrationPolicy) -> Self {
        Self {
            kv,
            policy: policy.normalize(),
            deadline: DEFAULT_DEADLINE,
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    #[must_use]
    pub fn policy(&self) -> RegistrationPolicy {
        self.policy
    }

    fn daily_key(&self, ip: &str) -> String {
        format!("reg:succday:{ip}:{}", (self.clock)().format("%Y%m%d"))
    }

    fn failure_key(&self, ip: &str) -> String {
        format!("reg:failhour:{ip}:{}", (self.clock)().format("%Y%m%d%H"))
    }

    /// `true` if the caller may attempt now.
    pub async fn try_cooldown(&self, ip: &str) -> bool {
        if self.policy.cooldown.is_zero() {
            return true;
        }
        let key = format!("reg:cooldown:{ip}");
        match bounded(
            self.deadline,
            self.kv.set_if_absent(&key, b"1", self.policy.cooldown),
        )
        .await
        {
            Ok(acquired) => acquired,
            Err(err) => {
                warn!(ip, error = %err, "cooldown check failed, allowing");
                true
            }
        }
    }

    pub async fn under_daily_limit(&self, ip: &str) -> bool {
        if self.policy.daily_max == 0 {
            return true;
        }
        match bounded(self.deadline, self.kv.get(&self.daily_key(ip))).await {
            Ok(Some(raw)) => {
                let count = std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0);
                count < i64::from(self.policy.daily_max)
            }
            Ok(None) => true,
            Err(err) => {
                warn!(ip, error = %err, "daily quota check failed, allowing");
                true
            }
        }
    }

    /// Count one completed registration for today.
    pub async fn increment_daily_success(&self, ip: &str) {
        if self.policy.daily_max == 0 {
            return;
        }
        let key = self.daily_key(ip);
        let ttl = until_next_midnight((self.clock)());
        if let Err(err) = bounded(self.deadline, self.bump(&key, ttl)).await {
            warn!(ip, error = %err, "failed to record daily registration");
        }
    }

    /// Count a failed attempt in the current hour and return the running total.
    ///
    /// Returns zero when the store is unavailable.
    pub async fn record_failure(&self, ip: &str) -> i64 {
        let key = self.failure_key(ip);
        match bounded(self.deadline, self.bump(&key, FAILURE_WINDOW)).await {
            Ok(count) => count,
            Err(err) => {
                warn!(ip, error = %err, "failed to record registration failure");
                0
            }
        }
    }

    pub async fn is_banned(&self, ip: &str) -> bool {
        match bounded(self.deadline, self.kv.exists(&format!("reg:ban:{ip}"))).await {
            Ok(banned) => banned,
            Err(err) => {
                warn!(ip, error = %err, "ban check failed, allowing");
                false
            }
        }
    }

    pub async fn ban(&self, ip: &str) {
        let key = format!("reg:ban:{ip}");
        let value = format!("ban-{ip}");
        match bounded(
            self.deadline,
            self.kv
                .set(&key, value.as_bytes(), Some(self.policy.ban_duration)),
        )
        .await
        {
            Ok(()) => warn!(
                ip,
                minutes = self.policy.ban_duration.as_secs() / 60,
                "registration ban issued"
            ),
            Err(err) => warn!(ip, error = %err, "failed to issue registration ban"),
        }
    }

    async fn bump(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        self.kv.increment_with_ttl(key, ttl).await
    }

    /// Run `attempt` behind the registration gates.
    ///
    /// Rejections do not touch any counter. A failed attempt counts towards the hourly
    /// failure threshold and bans the identity once it is reached; a successful one counts
    /// towards today's quota.
    ///
    /// # Errors
    /// Returns `Rejected` when a gate refuses, `Attempt` when `attempt` fails.
    pub async fn guard_registration<T, E, F, Fut>(
        &self,
        ip: &str,
        attempt: F,
    ) -> Result<T, RegistrationError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.is_banned(ip).await {
            return Err(RegistrationError::Rejected(Rejection::Banned));
        }
        if !self.try_cooldown(ip).await {
            return Err(RegistrationError::Rejected(Rejection::Cooldown));
        }
        if !self.under_daily_limit(ip).await {
            return Err(RegistrationError::Rejected(Rejection::DailyQuotaExceeded));
        }

        match attempt().await {
            Ok(value) => {
                self.increment_daily_success(ip).await;
                Ok(value)
            }
            Err(err) => {
                let failures = self.record_failure(ip).await;
                let threshold = i64::from(self.policy.failures_per_hour);
                debug!(ip, failures, threshold, "registration attempt failed");
                if threshold > 0 && failures >= threshold {
                    self.ban(ip).await;
                }
                Err(RegistrationError::Attempt(err))
            }
        }
    }
}
