//! Password policy: complexity validation, reuse prevention, expiration.
//!
//! Validation reports every violated rule at once so callers can show
//! complete guidance. Reuse checks go through the slow hash's verify
//! function, never a direct hash comparison. Expiration is pure arithmetic;
//! whether an expired password blocks sign-in is the orchestrator's call.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::PasswordPolicyConfig;
use crate::hasher::PasswordHasher;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum PolicyViolation {
    TooShort { min: usize },
    TooLong { max: usize },
    MissingUppercase,
    MissingLowercase,
    MissingDigit,
    MissingSymbol,
    ContainsPersonalInfo,
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort { min } => write!(f, "must be at least {min} characters"),
            Self::TooLong { max } => write!(f, "must be at most {max} characters"),
            Self::MissingUppercase => write!(f, "must contain an uppercase letter"),
            Self::MissingLowercase => write!(f, "must contain a lowercase letter"),
            Self::MissingDigit => write!(f, "must contain a digit"),
            Self::MissingSymbol => write!(f, "must contain a symbol"),
            Self::ContainsPersonalInfo => {
                write!(f, "must not contain your email or name")
            }
        }
    }
}

/// Who the password is for; used by the personal-info rule.
#[derive(Clone, Copy, Debug, Default)]
pub struct PasswordContext<'a> {
    pub email: Option<&'a str>,
    pub name: Option<&'a str>,
}

#[derive(Clone, Debug)]
pub struct PasswordCheck {
    pub valid: bool,
    pub violations: Vec<PolicyViolation>,
}

#[derive(Clone, Copy, Debug)]
pub struct ExpirationStatus {
    pub expired: bool,
    pub near_expiration: bool,
    pub days_remaining: i64,
    pub must_change_password: bool,
    pub grace_logins_remaining: u32,
}

/// Personal-info fragments shorter than this are ignored; initials and
/// two-letter names would otherwise reject almost everything.
const MIN_FRAGMENT_LEN: usize = 3;

pub struct PasswordPolicy {
    config: PasswordPolicyConfig,
}

impl PasswordPolicy {
    #[must_use]
    pub fn new(config: PasswordPolicyConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn history_limit(&self) -> usize {
        self.config.history_limit
    }

    /// Check complexity rules, returning all violations together.
    #[must_use]
    pub fn validate(&self, password: &str, context: PasswordContext<'_>) -> PasswordCheck {
        let mut violations = Vec::new();
        let length = password.chars().count();
        if length < self.config.min_length {
            violations.push(PolicyViolation::TooShort {
                min: self.config.min_length,
            });
        }
        if length > self.config.max_length {
            violations.push(PolicyViolation::TooLong {
                max: self.config.max_length,
            });
        }
        if !password.chars().any(char::is_uppercase) {
            violations.push(PolicyViolation::MissingUppercase);
        }
        if !password.chars().any(char::is_lowercase) {
            violations.push(PolicyViolation::MissingLowercase);
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            violations.push(PolicyViolation::MissingDigit);
        }
        if !password.chars().any(|c| !c.is_alphanumeric()) {
            violations.push(PolicyViolation::MissingSymbol);
        }
        if contains_personal_info(password, context) {
            violations.push(PolicyViolation::ContainsPersonalInfo);
        }
        PasswordCheck {
            valid: violations.is_empty(),
            violations,
        }
    }

    /// Whether `candidate` matches any of the supplied prior hashes.
    ///
    /// Callers pass the current hash plus the most recent history entries;
    /// each is checked via the hasher's verify function.
    ///
    /// # Errors
    /// Propagates hasher failures (malformed stored hashes).
    pub fn is_reused<'a>(
        &self,
        candidate: &str,
        prior_hashes: impl IntoIterator<Item = &'a str>,
        hasher: &dyn PasswordHasher,
    ) -> anyhow::Result<bool> {
        for hash in prior_hashes {
            if hasher.verify(candidate, hash)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Expiration advisory for a password set at `password_set_at`.
    ///
    /// Principals without a password credential are never expired.
    #[must_use]
    pub fn check_expiration(
        &self,
        password_set_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> ExpirationStatus {
        let Some(set_at) = password_set_at else {
            return ExpirationStatus {
                expired: false,
                near_expiration: false,
                days_remaining: self.config.max_age_days,
                must_change_password: false,
                grace_logins_remaining: self.config.grace_logins,
            };
        };

        let age_days = (now - set_at).num_days();
        let days_remaining = (self.config.max_age_days - age_days).max(0);
        let expired = age_days >= self.config.max_age_days;
        let near_expiration = !expired && days_remaining <= self.config.warn_days;
        // One grace login burns per day overdue; past the budget the
        // orchestrator forces a change.
        let grace_logins_remaining = if expired {
            let overdue = (age_days - self.config.max_age_days).max(0);
            self.config
                .grace_logins
                .saturating_sub(u32::try_from(overdue).unwrap_or(u32::MAX))
        } else {
            self.config.grace_logins
        };
        ExpirationStatus {
            expired,
            near_expiration,
            days_remaining,
            must_change_password: expired && grace_logins_remaining == 0,
            grace_logins_remaining,
        }
    }
}

fn contains_personal_info(password: &str, context: PasswordContext<'_>) -> bool {
    let lowered = password.to_lowercase();
    let mut fragments = Vec::new();
    if let Some(email) = context.email {
        if let Some(local) = email.split('@').next() {
            fragments.push(local.to_lowercase());
        }
    }
    if let Some(name) = context.name {
        fragments.push(name.to_lowercase());
    }
    fragments
        .iter()
        .any(|fragment| fragment.len() >= MIN_FRAGMENT_LEN && lowered.contains(fragment))
}
