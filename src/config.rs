//! Configuration surface for the auth core.
//!
//! Every knob has a default; deployments override via environment variables
//! (`AUTH_*`) or the `with_*` builders. Configuration is read once at
//! construction and handed to the services — no runtime env lookups.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use crate::rate_limit::RateLimitAction;

const DEFAULT_PASSWORD_MIN_LENGTH: usize = 8;
const DEFAULT_PASSWORD_MAX_LENGTH: usize = 128;
const DEFAULT_PASSWORD_HISTORY_LIMIT: usize = 5;
const DEFAULT_PASSWORD_MAX_AGE_DAYS: i64 = 90;
const DEFAULT_PASSWORD_WARN_DAYS: i64 = 14;
const DEFAULT_PASSWORD_GRACE_LOGINS: u32 = 3;
const DEFAULT_HASH_MEMORY_KIB: u32 = 19_456;
const DEFAULT_HASH_ITERATIONS: u32 = 2;
const DEFAULT_SESSION_MAX_AGE_HOURS: i64 = 24;
const DEFAULT_INACTIVITY_MINUTES: i64 = 60;
const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 3;
const DEFAULT_SUSPICIOUS_THRESHOLD: usize = 2;
const DEFAULT_RECENT_EVENTS: usize = 10;
const DEFAULT_COOKIE_NAME: &str = "auth_session";
const DEFAULT_TOKEN_TTL_MINUTES: i64 = 30;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 300;
const DEFAULT_ATTEMPT_RETENTION_DAYS: i64 = 90;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitAlgorithm {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

impl FromStr for RateLimitAlgorithm {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "fixed" | "fixed_window" => Ok(Self::FixedWindow),
            "sliding" | "sliding_window" => Ok(Self::SlidingWindow),
            "bucket" | "token_bucket" => Ok(Self::TokenBucket),
            other => Err(format!("unknown rate limit algorithm: {other}")),
        }
    }
}

/// Per-action rate limiting rule.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitRule {
    pub max_attempts: u32,
    pub window_minutes: i64,
    pub lockout_minutes: i64,
    pub algorithm: RateLimitAlgorithm,
    /// Token bucket capacity; defaults to `max_attempts` when unset.
    pub burst_limit: Option<u32>,
    /// Token bucket refill, tokens per minute; defaults to capacity per window.
    pub refill_rate: Option<f64>,
    pub adaptive_scaling: bool,
}

impl RateLimitRule {
    #[must_use]
    pub const fn new(
        max_attempts: u32,
        window_minutes: i64,
        lockout_minutes: i64,
        algorithm: RateLimitAlgorithm,
    ) -> Self {
        Self {
            max_attempts,
            window_minutes,
            lockout_minutes,
            algorithm,
            burst_limit: None,
            refill_rate: None,
            adaptive_scaling: false,
        }
    }

    #[must_use]
    pub const fn with_burst_limit(mut self, capacity: u32) -> Self {
        self.burst_limit = Some(capacity);
        self
    }

    #[must_use]
    pub const fn with_refill_rate(mut self, tokens_per_minute: f64) -> Self {
        self.refill_rate = Some(tokens_per_minute);
        self
    }

    #[must_use]
    pub const fn with_adaptive_scaling(mut self, enabled: bool) -> Self {
        self.adaptive_scaling = enabled;
        self
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    rules: HashMap<RateLimitAction, RateLimitRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            RateLimitAction::Login,
            RateLimitRule::new(5, 15, 30, RateLimitAlgorithm::FixedWindow),
        );
        rules.insert(
            RateLimitAction::Signup,
            RateLimitRule::new(3, 60, 120, RateLimitAlgorithm::FixedWindow),
        );
        rules.insert(
            RateLimitAction::PasswordReset,
            RateLimitRule::new(3, 60, 60, RateLimitAlgorithm::FixedWindow),
        );
        rules.insert(
            RateLimitAction::Api,
            RateLimitRule::new(100, 1, 5, RateLimitAlgorithm::TokenBucket),
        );
        rules.insert(
            RateLimitAction::Upload,
            RateLimitRule::new(10, 60, 60, RateLimitAlgorithm::SlidingWindow),
        );
        Self { rules }
    }
}

impl RateLimitConfig {
    /// Rule for an action; unknown actions fall back to the `Api` defaults.
    #[must_use]
    pub fn rule_for(&self, action: RateLimitAction) -> RateLimitRule {
        self.rules.get(&action).copied().unwrap_or_else(|| {
            RateLimitRule::new(100, 1, 5, RateLimitAlgorithm::TokenBucket)
        })
    }

    #[must_use]
    pub fn with_rule(mut self, action: RateLimitAction, rule: RateLimitRule) -> Self {
        self.rules.insert(action, rule);
        self
    }
}

#[derive(Clone, Debug)]
pub struct PasswordPolicyConfig {
    pub min_length: usize,
    pub max_length: usize,
    pub history_limit: usize,
    pub max_age_days: i64,
    pub warn_days: i64,
    pub grace_logins: u32,
}

impl Default for PasswordPolicyConfig {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_PASSWORD_MIN_LENGTH,
            max_length: DEFAULT_PASSWORD_MAX_LENGTH,
            history_limit: DEFAULT_PASSWORD_HISTORY_LIMIT,
            max_age_days: DEFAULT_PASSWORD_MAX_AGE_DAYS,
            warn_days: DEFAULT_PASSWORD_WARN_DAYS,
            grace_logins: DEFAULT_PASSWORD_GRACE_LOGINS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub max_age_hours: i64,
    pub inactivity_minutes: i64,
    pub max_concurrent: usize,
    pub suspicious_threshold: usize,
    /// How many trailing activity events anomaly detection inspects.
    pub recent_events: usize,
    pub cookie_name: String,
    /// Production toggles `Secure` and `SameSite=Strict` on the cookie.
    pub production: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age_hours: DEFAULT_SESSION_MAX_AGE_HOURS,
            inactivity_minutes: DEFAULT_INACTIVITY_MINUTES,
            max_concurrent: DEFAULT_MAX_CONCURRENT_SESSIONS,
            suspicious_threshold: DEFAULT_SUSPICIOUS_THRESHOLD,
            recent_events: DEFAULT_RECENT_EVENTS,
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            production: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TokenConfig {
    pub ttl_minutes: i64,
    pub sweep_interval_seconds: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: DEFAULT_TOKEN_TTL_MINUTES,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
        }
    }
}

/// Top-level configuration handed to [`crate::auth::Authenticator`].
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    password: PasswordPolicyConfig,
    session: SessionConfig,
    token: TokenConfig,
    rate_limit: RateLimitConfig,
    hash: HashConfig,
    attempt_retention_days_override: Option<i64>,
}

#[derive(Clone, Copy, Debug)]
pub struct HashConfig {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            memory_kib: DEFAULT_HASH_MEMORY_KIB,
            iterations: DEFAULT_HASH_ITERATIONS,
        }
    }
}

impl AuthConfig {
    /// Read the `AUTH_*` environment surface, falling back to defaults for
    /// anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let password = PasswordPolicyConfig {
            min_length: env_or("AUTH_PASSWORD_MIN_LENGTH", DEFAULT_PASSWORD_MIN_LENGTH),
            max_length: env_or("AUTH_PASSWORD_MAX_LENGTH", DEFAULT_PASSWORD_MAX_LENGTH),
            history_limit: env_or("AUTH_PASSWORD_HISTORY_LIMIT", DEFAULT_PASSWORD_HISTORY_LIMIT),
            max_age_days: env_or("AUTH_PASSWORD_MAX_AGE_DAYS", DEFAULT_PASSWORD_MAX_AGE_DAYS),
            warn_days: env_or("AUTH_PASSWORD_WARN_DAYS", DEFAULT_PASSWORD_WARN_DAYS),
            grace_logins: env_or("AUTH_PASSWORD_GRACE_LOGINS", DEFAULT_PASSWORD_GRACE_LOGINS),
        };
        let session = SessionConfig {
            max_age_hours: env_or("AUTH_SESSION_MAX_AGE_HOURS", DEFAULT_SESSION_MAX_AGE_HOURS),
            inactivity_minutes: env_or(
                "AUTH_SESSION_INACTIVITY_MINUTES",
                DEFAULT_INACTIVITY_MINUTES,
            ),
            max_concurrent: env_or(
                "AUTH_MAX_CONCURRENT_SESSIONS",
                DEFAULT_MAX_CONCURRENT_SESSIONS,
            ),
            suspicious_threshold: env_or("AUTH_SUSPICIOUS_THRESHOLD", DEFAULT_SUSPICIOUS_THRESHOLD),
            recent_events: env_or("AUTH_RECENT_EVENTS", DEFAULT_RECENT_EVENTS),
            cookie_name: env::var("AUTH_COOKIE_NAME")
                .unwrap_or_else(|_| DEFAULT_COOKIE_NAME.to_string()),
            production: env_or("AUTH_PRODUCTION", false),
        };
        let token = TokenConfig {
            ttl_minutes: env_or("AUTH_TOKEN_TTL_MINUTES", DEFAULT_TOKEN_TTL_MINUTES),
            sweep_interval_seconds: env_or(
                "AUTH_TOKEN_SWEEP_INTERVAL_SECONDS",
                DEFAULT_SWEEP_INTERVAL_SECONDS,
            ),
        };
        let hash = HashConfig {
            memory_kib: env_or("AUTH_HASH_MEMORY_KIB", DEFAULT_HASH_MEMORY_KIB),
            iterations: env_or("AUTH_HASH_ITERATIONS", DEFAULT_HASH_ITERATIONS),
        };

        let mut rate_limit = RateLimitConfig::default();
        for action in RateLimitAction::ALL {
            let rule = rule_from_env(action, &rate_limit);
            rate_limit = rate_limit.with_rule(action, rule);
        }

        Self {
            password,
            session,
            token,
            rate_limit,
            hash,
            attempt_retention_days_override: env::var("AUTH_ATTEMPT_RETENTION_DAYS")
                .ok()
                .and_then(|value| value.parse().ok()),
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: PasswordPolicyConfig) -> Self {
        self.password = password;
        self
    }

    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: TokenConfig) -> Self {
        self.token = token;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    #[must_use]
    pub fn with_hash(mut self, hash: HashConfig) -> Self {
        self.hash = hash;
        self
    }

    #[must_use]
    pub fn with_attempt_retention_days(mut self, days: i64) -> Self {
        self.attempt_retention_days_override = Some(days);
        self
    }

    #[must_use]
    pub fn password(&self) -> &PasswordPolicyConfig {
        &self.password
    }

    #[must_use]
    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    #[must_use]
    pub fn token(&self) -> TokenConfig {
        self.token
    }

    #[must_use]
    pub fn rate_limit(&self) -> &RateLimitConfig {
        &self.rate_limit
    }

    #[must_use]
    pub fn hash(&self) -> HashConfig {
        self.hash
    }

    #[must_use]
    pub fn attempt_retention_days(&self) -> i64 {
        self.attempt_retention_days_override
            .unwrap_or(DEFAULT_ATTEMPT_RETENTION_DAYS)
    }
}

/// Per-action overrides like `AUTH_RATE_LOGIN_MAX` / `_WINDOW` / `_LOCKOUT` /
/// `_ALGORITHM`.
fn rule_from_env(action: RateLimitAction, config: &RateLimitConfig) -> RateLimitRule {
    let prefix = format!("AUTH_RATE_{}", action.as_str().to_uppercase());
    let mut rule = config.rule_for(action);
    rule.max_attempts = env_or(&format!("{prefix}_MAX"), rule.max_attempts);
    rule.window_minutes = env_or(&format!("{prefix}_WINDOW"), rule.window_minutes);
    rule.lockout_minutes = env_or(&format!("{prefix}_LOCKOUT"), rule.lockout_minutes);
    if let Ok(value) = env::var(format!("{prefix}_ALGORITHM")) {
        if let Ok(algorithm) = value.parse() {
            rule.algorithm = algorithm;
        }
    }
    rule
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}
