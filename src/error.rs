//! Error taxonomy for the auth core.
//!
//! Subsystem store failures are caught at the subsystem boundary and mapped
//! to [`AuthError::Server`]; they never crash the orchestrator. User-facing
//! variants deliberately avoid distinguishing "unknown email" from "bad
//! password" so callers cannot probe for accounts.

use chrono::{DateTime, Utc};

use crate::password::PolicyViolation;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Bad email or password; never says which.
    #[error("Invalid email or password")]
    InvalidCredentials,

    /// Too many attempts inside the window, not yet locked out.
    #[error("Too many attempts, retry in {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    /// A failure-triggered lockout window is active.
    #[error("Account locked until {lockout_ends_at}")]
    AccountLocked { lockout_ends_at: DateTime<Utc> },

    #[error("Email already registered")]
    EmailAlreadyExists,

    /// Password failed policy validation; all violated rules are listed.
    #[error("Password does not meet policy requirements")]
    WeakPassword { violations: Vec<PolicyViolation> },

    #[error("Password was used recently and cannot be reused")]
    PasswordReuse,

    /// The password exceeded its maximum age and the grace-login budget.
    #[error("Password expired and must be changed")]
    PasswordExpired,

    #[error("Invalid or already-used token")]
    InvalidToken,

    /// The core burns expired tokens as [`AuthError::InvalidToken`]; this
    /// variant exists for API layers that distinguish the two on the wire.
    #[error("Token has expired")]
    ExpiredToken,

    /// Expired sessions surface as an invalid validation result, not an
    /// error; API layers can map that outcome onto this variant.
    #[error("Session has expired")]
    SessionExpired,

    #[error("Input validation failed: {0}")]
    Validation(String),

    #[error("Failed to send email")]
    EmailSendFailed(#[source] anyhow::Error),

    /// Catch-all for store or infrastructure failure.
    #[error("Internal server error")]
    Server(#[from] anyhow::Error),
}

impl AuthError {
    /// Stable machine-readable code for API layers and audit logs.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::AccountLocked { .. } => "ACCOUNT_LOCKED",
            Self::EmailAlreadyExists => "EMAIL_ALREADY_EXISTS",
            Self::WeakPassword { .. } => "WEAK_PASSWORD",
            Self::PasswordReuse => "PASSWORD_REUSE",
            Self::PasswordExpired => "PASSWORD_EXPIRED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::ExpiredToken => "EXPIRED_TOKEN",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::EmailSendFailed(_) => "EMAIL_SEND_FAILED",
            Self::Server(_) => "SERVER_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AuthError;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AuthError::InvalidCredentials.code(), "INVALID_CREDENTIALS");
        assert_eq!(
            AuthError::RateLimited {
                retry_after_seconds: 30
            }
            .code(),
            "RATE_LIMITED"
        );
        assert_eq!(AuthError::PasswordReuse.code(), "PASSWORD_REUSE");
        assert_eq!(AuthError::ExpiredToken.code(), "EXPIRED_TOKEN");
        assert_eq!(AuthError::SessionExpired.code(), "SESSION_EXPIRED");
        assert_eq!(
            AuthError::Server(anyhow::anyhow!("boom")).code(),
            "SERVER_ERROR"
        );
    }

    #[test]
    fn invalid_credentials_message_never_names_the_field() {
        let message = AuthError::InvalidCredentials.to_string();
        assert!(!message.to_lowercase().contains("unknown"));
        assert_eq!(message, "Invalid email or password");
    }
}
