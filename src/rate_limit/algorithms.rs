//! Fixed-window and sliding-window evaluation.
//!
//! Pure functions over the attempt history (newest first) and a point in
//! time, so every edge case is testable without a store or a clock.

use chrono::{DateTime, Duration, Utc};

use super::{EffectiveRule, RateLimitStatus};
use crate::store::AttemptRecord;

/// Escalation cap for severity-scaled lockouts.
const MAX_LOCKOUT_SCALE: f64 = 3.0;

/// Count attempts inside the window; lock out once consecutive failures
/// reach the limit, until `last_failure + lockout` passes.
pub(super) fn fixed_window(
    history: &[AttemptRecord],
    rule: &EffectiveRule,
    now: DateTime<Utc>,
) -> RateLimitStatus {
    let window_start = now - rule.window;
    let in_window: Vec<&AttemptRecord> = history
        .iter()
        .filter(|attempt| attempt.created_at >= window_start)
        .collect();

    let (failures, last_failure) = consecutive_failures(history, now - rule.lockout);
    if failures >= rule.max_attempts {
        if let Some(last_failure) = last_failure {
            let lockout_ends_at = last_failure + rule.lockout;
            if now < lockout_ends_at {
                return locked_status(lockout_ends_at, reset_at(&in_window, rule, now), now);
            }
        }
    }

    let count = in_window.len() as u32;
    let reset_at = reset_at(&in_window, rule, now);
    let allowed = count < rule.max_attempts;
    RateLimitStatus {
        allowed,
        remaining: rule.max_attempts.saturating_sub(count),
        reset_at,
        locked: false,
        lockout_ends_at: None,
        retry_after_seconds: retry_hint(allowed, reset_at, now),
    }
}

/// Each attempt contributes a linearly decaying weight; the weighted sum
/// approximates a continuous rate. Lockout duration scales with how far past
/// the limit the consecutive-failure run went, capped at 3x.
pub(super) fn sliding_window(
    history: &[AttemptRecord],
    rule: &EffectiveRule,
    now: DateTime<Utc>,
) -> RateLimitStatus {
    let window_ms = rule.window.num_milliseconds() as f64;
    let window_start = now - rule.window;
    let in_window: Vec<&AttemptRecord> = history
        .iter()
        .filter(|attempt| attempt.created_at >= window_start)
        .collect();

    let weighted: f64 = in_window
        .iter()
        .map(|attempt| {
            let age_ms = (now - attempt.created_at).num_milliseconds() as f64;
            ((window_ms - age_ms) / window_ms).max(0.0)
        })
        .sum();

    let (failures, last_failure) = consecutive_failures(history, window_start);
    if failures >= rule.max_attempts {
        if let Some(last_failure) = last_failure {
            let severity =
                (f64::from(failures) / f64::from(rule.max_attempts)).min(MAX_LOCKOUT_SCALE);
            let lockout_ms = (rule.lockout.num_milliseconds() as f64 * severity) as i64;
            let lockout_ends_at = last_failure + Duration::milliseconds(lockout_ms);
            if now < lockout_ends_at {
                return locked_status(lockout_ends_at, reset_at(&in_window, rule, now), now);
            }
        }
    }

    let reset_at = reset_at(&in_window, rule, now);
    let allowed = weighted < f64::from(rule.max_attempts);
    let remaining = (f64::from(rule.max_attempts) - weighted).floor().max(0.0) as u32;
    RateLimitStatus {
        allowed,
        remaining,
        reset_at,
        locked: false,
        lockout_ends_at: None,
        retry_after_seconds: retry_hint(allowed, reset_at, now),
    }
}

/// Failures since the most recent success, newest first, restricted to
/// attempts at or after `since`. Returns the count and the newest failure.
fn consecutive_failures(
    history: &[AttemptRecord],
    since: DateTime<Utc>,
) -> (u32, Option<DateTime<Utc>>) {
    let mut count = 0;
    let mut newest = None;
    for attempt in history {
        if attempt.success {
            break;
        }
        if attempt.created_at < since {
            continue;
        }
        if newest.is_none() {
            newest = Some(attempt.created_at);
        }
        count += 1;
    }
    (count, newest)
}

fn reset_at(
    in_window: &[&AttemptRecord],
    rule: &EffectiveRule,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    in_window
        .last()
        .map_or(now + rule.window, |oldest| oldest.created_at + rule.window)
}

fn locked_status(
    lockout_ends_at: DateTime<Utc>,
    reset_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> RateLimitStatus {
    RateLimitStatus {
        allowed: false,
        remaining: 0,
        reset_at,
        locked: true,
        lockout_ends_at: Some(lockout_ends_at),
        retry_after_seconds: Some((lockout_ends_at - now).num_seconds().max(0) as u64),
    }
}

fn retry_hint(allowed: bool, reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<u64> {
    if allowed {
        None
    } else {
        Some((reset_at - now).num_seconds().max(0) as u64)
    }
}
