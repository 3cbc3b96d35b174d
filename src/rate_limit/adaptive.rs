//! Per-identifier adaptive scaling factors.
//!
//! A multiplicative factor in `[0.5, 2.0]` per identifier: successes nudge it
//! up (x1.1), failures down (x0.9). The cache is bounded and non-authoritative;
//! on a miss the factor is replayed from the attempt log, so a restart never
//! weakens a security decision.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::store::AttemptRecord;

const FACTOR_FLOOR: f64 = 0.5;
const FACTOR_CAP: f64 = 2.0;
const SUCCESS_STEP: f64 = 1.1;
const FAILURE_STEP: f64 = 0.9;
/// How many trailing attempts a cache-miss replay considers.
const REPLAY_DEPTH: usize = 20;
const MAX_ENTRIES: usize = 10_000;

pub(super) struct AdaptiveScaling {
    factors: Mutex<HashMap<String, f64>>,
}

impl AdaptiveScaling {
    pub(super) fn new() -> Self {
        Self {
            factors: Mutex::new(HashMap::new()),
        }
    }

    /// Current factor for `identifier`, rebuilding from `history` (newest
    /// first) when the cache has no entry.
    pub(super) fn factor(&self, identifier: &str, history: &[AttemptRecord]) -> f64 {
        let mut factors = self.factors.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(factor) = factors.get(identifier) {
            return *factor;
        }
        let factor = replay(history);
        if factors.len() >= MAX_ENTRIES {
            factors.clear();
        }
        factors.insert(identifier.to_string(), factor);
        factor
    }

    pub(super) fn observe(&self, identifier: &str, success: bool) {
        let step = if success { SUCCESS_STEP } else { FAILURE_STEP };
        let mut factors = self.factors.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if factors.len() >= MAX_ENTRIES && !factors.contains_key(identifier) {
            factors.clear();
        }
        let factor = factors.entry(identifier.to_string()).or_insert(1.0);
        *factor = (*factor * step).clamp(FACTOR_FLOOR, FACTOR_CAP);
    }
}

/// Fold the trailing attempts oldest-first, clamping at every step so the
/// replay matches what incremental observation would have produced.
fn replay(history: &[AttemptRecord]) -> f64 {
    history
        .iter()
        .take(REPLAY_DEPTH)
        .rev()
        .fold(1.0_f64, |factor, attempt| {
            let step = if attempt.success {
                SUCCESS_STEP
            } else {
                FAILURE_STEP
            };
            (factor * step).clamp(FACTOR_FLOOR, FACTOR_CAP)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitAction;
    use crate::store::ClientMetadata;
    use chrono::Utc;

    fn attempt(success: bool) -> AttemptRecord {
        AttemptRecord {
            identifier: "user@x.com".to_string(),
            action: RateLimitAction::Login,
            success,
            principal_id: None,
            created_at: Utc::now(),
            metadata: ClientMetadata::default(),
        }
    }

    #[test]
    fn successes_raise_factor_to_cap() {
        let scaling = AdaptiveScaling::new();
        for _ in 0..20 {
            scaling.observe("good", true);
        }
        let factor = scaling.factor("good", &[]);
        assert!((factor - FACTOR_CAP).abs() < f64::EPSILON);
    }

    #[test]
    fn failures_lower_factor_to_floor() {
        let scaling = AdaptiveScaling::new();
        for _ in 0..20 {
            scaling.observe("bad", false);
        }
        let factor = scaling.factor("bad", &[]);
        assert!((factor - FACTOR_FLOOR).abs() < f64::EPSILON);
    }

    #[test]
    fn cache_miss_replays_history() {
        let scaling = AdaptiveScaling::new();
        let history = vec![attempt(false), attempt(false), attempt(false)];
        let factor = scaling.factor("cold", &history);
        let expected = 0.9_f64.powi(3);
        assert!((factor - expected).abs() < 1e-9);
    }

    #[test]
    fn replay_and_observation_agree() {
        let scaling = AdaptiveScaling::new();
        scaling.observe("warm", false);
        scaling.observe("warm", true);
        let warm = scaling.factor("warm", &[]);
        // Newest first: success then failure.
        let replayed = replay(&[attempt(true), attempt(false)]);
        assert!((warm - replayed).abs() < 1e-9);
    }
}
