//! Multi-algorithm rate limiting for authentication-adjacent actions.
//!
//! `check` runs before the guarded action and `record` after it; the attempt
//! log is the source of truth, so concurrent requests may both see "below
//! limit" — the limiter is probabilistic deterrence, not hard exclusion.
//!
//! Failure policy: if the attempt-log read fails the limiter **fails open**
//! (the request is allowed) and the outage is logged as a security event.
//! Token-bucket state and adaptive factors live in bounded in-process caches
//! that are never authoritative and are safe to lose on restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{RateLimitAlgorithm, RateLimitConfig, RateLimitRule};
use crate::store::{AttemptRecord, AttemptStore, ClientMetadata};

mod adaptive;
mod algorithms;

use adaptive::AdaptiveScaling;

/// Guarded action types, each with its own configured rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Login,
    Signup,
    PasswordReset,
    Api,
    Upload,
}

impl RateLimitAction {
    pub const ALL: [Self; 5] = [
        Self::Login,
        Self::Signup,
        Self::PasswordReset,
        Self::Api,
        Self::Upload,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Signup => "signup",
            Self::PasswordReset => "password_reset",
            Self::Api => "api",
            Self::Upload => "upload",
        }
    }
}

impl std::str::FromStr for RateLimitAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "login" => Ok(Self::Login),
            "signup" => Ok(Self::Signup),
            "password_reset" => Ok(Self::PasswordReset),
            "api" => Ok(Self::Api),
            "upload" => Ok(Self::Upload),
            other => Err(format!("unknown rate limit action: {other}")),
        }
    }
}

/// Outcome of a `check` call.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub locked: bool,
    pub lockout_ends_at: Option<DateTime<Utc>>,
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitStatus {
    fn open(rule: &RateLimitRule, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining: rule.max_attempts,
            reset_at: now + Duration::minutes(rule.window_minutes),
            locked: false,
            lockout_ends_at: None,
            retry_after_seconds: None,
        }
    }
}

/// Rule after adaptive scaling has been applied.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EffectiveRule {
    pub(crate) max_attempts: u32,
    pub(crate) window: Duration,
    pub(crate) lockout: Duration,
}

#[derive(Clone, Copy, Debug)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

// Bucket cache bound; overflow drops the cache, which only costs a refill.
const MAX_BUCKETS: usize = 10_000;

pub struct RateLimiter {
    attempts: Arc<dyn AttemptStore>,
    config: RateLimitConfig,
    buckets: Mutex<HashMap<(String, RateLimitAction), Bucket>>,
    adaptive: AdaptiveScaling,
}

impl RateLimiter {
    #[must_use]
    pub fn new(attempts: Arc<dyn AttemptStore>, config: RateLimitConfig) -> Self {
        Self {
            attempts,
            config,
            buckets: Mutex::new(HashMap::new()),
            adaptive: AdaptiveScaling::new(),
        }
    }

    /// The underlying attempt log, for retention maintenance.
    #[must_use]
    pub fn attempt_store(&self) -> &dyn AttemptStore {
        self.attempts.as_ref()
    }

    /// Decide whether `identifier` may perform `action` right now.
    pub async fn check(&self, identifier: &str, action: RateLimitAction) -> RateLimitStatus {
        let rule = self.config.rule_for(action);
        let now = Utc::now();

        let history = match self.load_history(identifier, action, &rule, now).await {
            Ok(history) => history,
            Err(err) => {
                // Availability over limiting when the log is unreadable.
                warn!(
                    target: "security",
                    identifier,
                    action = action.as_str(),
                    "rate limit check failing open, attempt log unreadable: {err}"
                );
                return RateLimitStatus::open(&rule, now);
            }
        };

        let effective = self.effective_rule(identifier, &rule, &history);
        match rule.algorithm {
            RateLimitAlgorithm::FixedWindow => {
                algorithms::fixed_window(&history, &effective, now)
            }
            RateLimitAlgorithm::SlidingWindow => {
                algorithms::sliding_window(&history, &effective, now)
            }
            RateLimitAlgorithm::TokenBucket => {
                self.check_bucket(identifier, action, &rule, &effective, now)
                    .await
            }
        }
    }

    /// Record the outcome of a guarded action. Writes are best-effort; a
    /// failed write must not fail the request that already happened.
    pub async fn record(
        &self,
        identifier: &str,
        action: RateLimitAction,
        success: bool,
        principal_id: Option<uuid::Uuid>,
        metadata: ClientMetadata,
    ) {
        let now = Utc::now();
        let attempt = AttemptRecord {
            identifier: identifier.to_string(),
            action,
            success,
            principal_id,
            created_at: now,
            metadata,
        };
        if let Err(err) = self.attempts.record(attempt).await {
            warn!(
                target: "security",
                identifier,
                action = action.as_str(),
                "failed to record attempt: {err}"
            );
        }

        let rule = self.config.rule_for(action);
        if rule.adaptive_scaling {
            self.adaptive.observe(identifier, success);
        }
        if rule.algorithm == RateLimitAlgorithm::TokenBucket {
            self.consume_token(identifier, action, &rule, now).await;
        }
        debug!(
            identifier,
            action = action.as_str(),
            success,
            "attempt recorded"
        );
    }

    async fn load_history(
        &self,
        identifier: &str,
        action: RateLimitAction,
        rule: &RateLimitRule,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AttemptRecord>> {
        if rule.algorithm == RateLimitAlgorithm::TokenBucket && !rule.adaptive_scaling {
            // Bucket state is in-process; no log read needed.
            return Ok(Vec::new());
        }
        // Sliding-window lockouts escalate up to 3x, so fetch far enough back.
        let horizon = rule.window_minutes.max(rule.lockout_minutes * 3);
        self.attempts
            .attempts_since(identifier, action, now - Duration::minutes(horizon))
            .await
    }

    fn effective_rule(
        &self,
        identifier: &str,
        rule: &RateLimitRule,
        history: &[AttemptRecord],
    ) -> EffectiveRule {
        let factor = if rule.adaptive_scaling {
            self.adaptive.factor(identifier, history)
        } else {
            1.0
        };
        // Well-behaved identifiers earn more attempts and shorter lockouts;
        // repeat offenders the reverse.
        let max_attempts = scaled_max_attempts(rule, factor);
        let lockout_minutes = ((rule.lockout_minutes as f64) / factor).round() as i64;
        EffectiveRule {
            max_attempts,
            window: Duration::minutes(rule.window_minutes),
            lockout: Duration::minutes(lockout_minutes.max(1)),
        }
    }

    async fn check_bucket(
        &self,
        identifier: &str,
        action: RateLimitAction,
        rule: &RateLimitRule,
        effective: &EffectiveRule,
        now: DateTime<Utc>,
    ) -> RateLimitStatus {
        let capacity = f64::from(rule.burst_limit.unwrap_or(effective.max_attempts));
        let refill_per_minute = rule
            .refill_rate
            .unwrap_or(capacity / rule.window_minutes.max(1) as f64);
        let refill_per_second = refill_per_minute / 60.0;

        let mut buckets = self.buckets.lock().await;
        if buckets.len() >= MAX_BUCKETS {
            buckets.clear();
        }
        let bucket = buckets
            .entry((identifier.to_string(), action))
            .or_insert(Bucket {
                tokens: capacity,
                last_refill: now,
            });
        refill(bucket, capacity, refill_per_second, now);

        let allowed = bucket.tokens >= 1.0;
        let retry_after_seconds = if allowed {
            None
        } else {
            Some(((1.0 - bucket.tokens) / refill_per_second).ceil() as u64)
        };
        let seconds_to_full = ((capacity - bucket.tokens) / refill_per_second).ceil() as i64;
        RateLimitStatus {
            allowed,
            remaining: bucket.tokens.floor().max(0.0) as u32,
            reset_at: now + Duration::seconds(seconds_to_full),
            locked: false,
            lockout_ends_at: None,
            retry_after_seconds,
        }
    }

    async fn consume_token(
        &self,
        identifier: &str,
        action: RateLimitAction,
        rule: &RateLimitRule,
        now: DateTime<Utc>,
    ) {
        // Same capacity basis as `check_bucket`: the adaptive factor is
        // already cached for this identifier, so an empty replay suffices.
        let factor = if rule.adaptive_scaling {
            self.adaptive.factor(identifier, &[])
        } else {
            1.0
        };
        let capacity = f64::from(rule.burst_limit.unwrap_or(scaled_max_attempts(rule, factor)));
        let refill_per_second =
            rule.refill_rate
                .unwrap_or(capacity / rule.window_minutes.max(1) as f64)
                / 60.0;
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry((identifier.to_string(), action))
            .or_insert(Bucket {
                tokens: capacity,
                last_refill: now,
            });
        refill(bucket, capacity, refill_per_second, now);
        bucket.tokens = (bucket.tokens - 1.0).max(0.0);
    }
}

fn scaled_max_attempts(rule: &RateLimitRule, factor: f64) -> u32 {
    ((f64::from(rule.max_attempts) * factor).round() as u32).max(1)
}

fn refill(bucket: &mut Bucket, capacity: f64, refill_per_second: f64, now: DateTime<Utc>) {
    let elapsed = (now - bucket.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
    bucket.tokens = (bucket.tokens + elapsed * refill_per_second).min(capacity);
    bucket.last_refill = now;
}
