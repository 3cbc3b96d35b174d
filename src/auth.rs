//! Orchestration of sign-in, sign-up, password change, email verification,
//! and password reset.
//!
//! The ordering here is security-relevant: every flow clears the rate
//! limiter before touching credentials, and every denial after that point
//! still records an attempt — a silent early return would let an attacker
//! bypass limiting. Sign-in and password-reset requests never reveal whether
//! an email exists; the precise cause goes to the logs, not the caller.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::hasher::PasswordHasher;
use crate::password::{ExpirationStatus, PasswordContext, PasswordPolicy};
use crate::rate_limit::{RateLimitAction, RateLimiter};
use crate::session::{NewSession, SessionManager};
use crate::store::{
    AttemptStore, ClientMetadata, PasswordHistoryEntry, PasswordHistoryStore, Principal,
    PrincipalStore, SessionStore, TokenStore,
};
use crate::token::{TokenKind, TokenService};
use crate::util::{normalize_email, valid_email};

/// Outbound email collaborator. Production implementations live outside the
/// core; [`LogMailSender`] is enough for development and tests.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send_token(&self, email: &str, kind: TokenKind, token: &str) -> anyhow::Result<()>;
}

/// Logs the token instead of delivering it.
pub struct LogMailSender;

#[async_trait]
impl MailSender for LogMailSender {
    async fn send_token(&self, email: &str, kind: TokenKind, token: &str) -> anyhow::Result<()> {
        info!(email, kind = kind.as_str(), token, "email delivery (log only)");
        Ok(())
    }
}

/// Store handles for the orchestrator. Each subsystem only ever sees its own
/// narrow trait.
#[derive(Clone)]
pub struct Stores {
    pub principals: Arc<dyn PrincipalStore>,
    pub history: Arc<dyn PasswordHistoryStore>,
    pub attempts: Arc<dyn AttemptStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub tokens: Arc<dyn TokenStore>,
}

impl Stores {
    /// Wire every capability to one backing store, e.g. a
    /// [`crate::store::memory::MemoryStore`] or [`crate::store::postgres::PgStore`].
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: PrincipalStore
            + PasswordHistoryStore
            + AttemptStore
            + SessionStore
            + TokenStore
            + 'static,
    {
        Self {
            principals: store.clone(),
            history: store.clone(),
            attempts: store.clone(),
            sessions: store.clone(),
            tokens: store,
        }
    }
}

/// Successful sign-in: the session plus the password-age advisory the API
/// layer can surface as a warning banner.
#[derive(Clone, Debug)]
pub struct SignIn {
    pub principal_id: Uuid,
    pub session: NewSession,
    pub password_expiration: ExpirationStatus,
}

#[derive(Clone, Copy, Debug)]
pub struct SignUp {
    pub principal_id: Uuid,
}

pub struct Authenticator {
    config: AuthConfig,
    principals: Arc<dyn PrincipalStore>,
    history: Arc<dyn PasswordHistoryStore>,
    rate_limiter: RateLimiter,
    sessions: SessionManager,
    tokens: Arc<TokenService>,
    policy: PasswordPolicy,
    hasher: Arc<dyn PasswordHasher>,
    mailer: Arc<dyn MailSender>,
}

impl Authenticator {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        stores: Stores,
        hasher: Arc<dyn PasswordHasher>,
        mailer: Arc<dyn MailSender>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(stores.attempts.clone(), config.rate_limit().clone());
        let sessions = SessionManager::new(stores.sessions.clone(), config.session().clone());
        let tokens = Arc::new(TokenService::new(stores.tokens.clone(), config.token()));
        let policy = PasswordPolicy::new(config.password().clone());
        Self {
            config,
            principals: stores.principals,
            history: stores.history,
            rate_limiter,
            sessions,
            tokens,
            policy,
            hasher,
            mailer,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    #[must_use]
    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    /// Authenticate an email/password pair and mint a session.
    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
        metadata: ClientMetadata,
    ) -> Result<SignIn, AuthError> {
        let email = normalize_email(email);
        self.require_allowed(&email, RateLimitAction::Login).await?;

        let Some(principal) = self.principals.find_by_email(&email).await? else {
            self.record(&email, RateLimitAction::Login, false, None, &metadata)
                .await;
            return Err(AuthError::InvalidCredentials);
        };
        let Some(hash) = principal.password_hash.as_deref() else {
            // Passwordless principal (e.g. pending external identity setup).
            self.record(&email, RateLimitAction::Login, false, Some(principal.id), &metadata)
                .await;
            return Err(AuthError::InvalidCredentials);
        };
        if !self.hasher.verify(password, hash)? {
            self.record(&email, RateLimitAction::Login, false, Some(principal.id), &metadata)
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        self.record(&email, RateLimitAction::Login, true, Some(principal.id), &metadata)
            .await;

        let password_expiration = self
            .policy
            .check_expiration(principal.password_set_at, Utc::now());
        if password_expiration.must_change_password {
            warn!(
                target: "security",
                principal = %principal.id,
                "sign-in blocked, password expired past grace"
            );
            return Err(AuthError::PasswordExpired);
        }

        let session = self.sessions.create_session(principal.id, metadata).await?;
        Ok(SignIn {
            principal_id: principal.id,
            session,
            password_expiration,
        })
    }

    /// Create a principal and queue an email-verification token.
    pub async fn sign_up(
        &self,
        email: &str,
        display_name: Option<&str>,
        password: &str,
        metadata: ClientMetadata,
    ) -> Result<SignUp, AuthError> {
        let email = normalize_email(email);
        self.require_allowed(&email, RateLimitAction::Signup).await?;

        if !valid_email(&email) {
            self.record(&email, RateLimitAction::Signup, false, None, &metadata)
                .await;
            return Err(AuthError::Validation("invalid email format".to_string()));
        }
        if self.principals.find_by_email(&email).await?.is_some() {
            self.record(&email, RateLimitAction::Signup, false, None, &metadata)
                .await;
            return Err(AuthError::EmailAlreadyExists);
        }

        let check = self.policy.validate(
            password,
            PasswordContext {
                email: Some(&email),
                name: display_name,
            },
        );
        if !check.valid {
            self.record(&email, RateLimitAction::Signup, false, None, &metadata)
                .await;
            return Err(AuthError::WeakPassword {
                violations: check.violations,
            });
        }

        let now = Utc::now();
        let password_hash = self.hasher.hash(password)?;
        let principal = Principal {
            id: Uuid::new_v4(),
            email: email.clone(),
            display_name: display_name.map(str::to_string),
            verified_at: None,
            password_hash: Some(password_hash.clone()),
            password_set_at: Some(now),
            created_at: now,
        };
        let principal_id = principal.id;
        if !self.principals.insert(principal).await? {
            // Lost a signup race for the same email.
            self.record(&email, RateLimitAction::Signup, false, None, &metadata)
                .await;
            return Err(AuthError::EmailAlreadyExists);
        }

        // History always holds the current hash as its newest entry.
        self.history
            .push(PasswordHistoryEntry {
                principal_id,
                password_hash,
                created_at: now,
            })
            .await?;

        self.record(&email, RateLimitAction::Signup, true, Some(principal_id), &metadata)
            .await;

        // Verification email is best-effort; the account exists either way
        // and the token can be re-requested.
        if let Err(err) = self.issue_token(&email, TokenKind::EmailVerification).await {
            error!(email, "failed to queue verification email: {err}");
        }

        Ok(SignUp { principal_id })
    }

    /// Change a password with current-password proof.
    pub async fn change_password(
        &self,
        principal_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let Some(principal) = self.principals.find_by_id(principal_id).await? else {
            return Err(AuthError::InvalidCredentials);
        };
        let Some(current_hash) = principal.password_hash.as_deref() else {
            return Err(AuthError::InvalidCredentials);
        };
        if !self.hasher.verify(current_password, current_hash)? {
            return Err(AuthError::InvalidCredentials);
        }

        self.apply_new_password(&principal, new_password).await
    }

    /// Issue (or reissue) an email-verification token.
    pub async fn request_email_verification(&self, email: &str) -> Result<(), AuthError> {
        let email = normalize_email(email);
        let Some(principal) = self.principals.find_by_email(&email).await? else {
            // Opaque to the caller; the miss is only interesting internally.
            info!(email, "verification requested for unknown email");
            return Ok(());
        };
        if principal.verified_at.is_some() {
            return Ok(());
        }
        self.issue_token(&email, TokenKind::EmailVerification)
            .await
            .map_err(AuthError::EmailSendFailed)
    }

    /// Consume a verification token and mark the principal verified.
    pub async fn verify_email(&self, raw_token: &str) -> Result<(), AuthError> {
        let verification = self.tokens.verify_token(raw_token).await?;
        if !verification.valid || verification.kind != Some(TokenKind::EmailVerification) {
            return Err(AuthError::InvalidToken);
        }
        let email = verification.identifier.unwrap_or_default();
        let Some(principal) = self.principals.find_by_email(&email).await? else {
            warn!(email, "verification token for missing principal");
            return Err(AuthError::InvalidToken);
        };
        self.principals.set_verified(principal.id, Utc::now()).await?;
        Ok(())
    }

    /// Request a password reset. Always succeeds from the caller's point of
    /// view so the response cannot be used to enumerate accounts.
    pub async fn request_password_reset(
        &self,
        email: &str,
        metadata: ClientMetadata,
    ) -> Result<(), AuthError> {
        let email = normalize_email(email);
        let status = self
            .rate_limiter
            .check(&email, RateLimitAction::PasswordReset)
            .await;
        if !status.allowed {
            // Still opaque; the limit denial is logged, not surfaced.
            warn!(
                target: "security",
                email,
                "password reset request rate limited"
            );
            return Ok(());
        }

        let principal = self.principals.find_by_email(&email).await?;
        let found = principal.is_some();
        self.record(
            &email,
            RateLimitAction::PasswordReset,
            found,
            principal.as_ref().map(|p| p.id),
            &metadata,
        )
        .await;

        if !found {
            info!(email, "password reset requested for unknown email");
            return Ok(());
        }
        if let Err(err) = self.issue_token(&email, TokenKind::PasswordReset).await {
            // Swallowed for enumeration resistance: an error here would only
            // fire for existing accounts.
            error!(email, "failed to queue password reset email: {err}");
        }
        Ok(())
    }

    /// Consume a reset token and set a new password.
    pub async fn reset_password(
        &self,
        raw_token: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let verification = self.tokens.verify_token(raw_token).await?;
        if !verification.valid || verification.kind != Some(TokenKind::PasswordReset) {
            return Err(AuthError::InvalidToken);
        }
        let email = verification.identifier.unwrap_or_default();
        let Some(principal) = self.principals.find_by_email(&email).await? else {
            warn!(email, "reset token for missing principal");
            return Err(AuthError::InvalidToken);
        };
        self.apply_new_password(&principal, new_password).await
    }

    /// Apply the attempt-log retention policy.
    pub async fn prune_attempt_log(&self) -> Result<u64, AuthError> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.attempt_retention_days());
        Ok(self.rate_limiter_store().prune_before(cutoff).await?)
    }

    /// Validate, reuse-check, store, and fan out a new password; shared by
    /// change and reset.
    async fn apply_new_password(
        &self,
        principal: &Principal,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let check = self.policy.validate(
            new_password,
            PasswordContext {
                email: Some(&principal.email),
                name: principal.display_name.as_deref(),
            },
        );
        if !check.valid {
            return Err(AuthError::WeakPassword {
                violations: check.violations,
            });
        }

        let recent = self
            .history
            .recent(principal.id, self.policy.history_limit())
            .await?;
        let mut prior: Vec<&str> = recent.iter().map(|entry| entry.password_hash.as_str()).collect();
        if let Some(current) = principal.password_hash.as_deref() {
            prior.push(current);
        }
        if self.policy.is_reused(new_password, prior, self.hasher.as_ref())? {
            warn!(
                target: "security",
                principal = %principal.id,
                "password change rejected, hash found in history"
            );
            return Err(AuthError::PasswordReuse);
        }

        let now = Utc::now();
        let new_hash = self.hasher.hash(new_password)?;
        self.principals
            .set_password(principal.id, &new_hash, now)
            .await?;
        self.history
            .push(PasswordHistoryEntry {
                principal_id: principal.id,
                password_hash: new_hash,
                created_at: now,
            })
            .await?;
        self.history
            .prune(principal.id, self.policy.history_limit())
            .await?;

        // A changed credential orphans every live session.
        self.sessions
            .invalidate_all_sessions(principal.id, "password_change")
            .await?;
        Ok(())
    }

    async fn issue_token(&self, email: &str, kind: TokenKind) -> anyhow::Result<()> {
        let token = self.tokens.create_token(email, kind, None).await?;
        self.mailer.send_token(email, kind, &token).await
    }

    async fn require_allowed(
        &self,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<(), AuthError> {
        let status = self.rate_limiter.check(identifier, action).await;
        if status.locked {
            let lockout_ends_at = status.lockout_ends_at.unwrap_or_else(Utc::now);
            warn!(
                target: "security",
                identifier,
                action = action.as_str(),
                %lockout_ends_at,
                "denied, lockout active"
            );
            return Err(AuthError::AccountLocked { lockout_ends_at });
        }
        if !status.allowed {
            return Err(AuthError::RateLimited {
                retry_after_seconds: status.retry_after_seconds.unwrap_or(60),
            });
        }
        Ok(())
    }

    async fn record(
        &self,
        identifier: &str,
        action: RateLimitAction,
        success: bool,
        principal_id: Option<Uuid>,
        metadata: &ClientMetadata,
    ) {
        self.rate_limiter
            .record(identifier, action, success, principal_id, metadata.clone())
            .await;
    }

    fn rate_limiter_store(&self) -> &dyn AttemptStore {
        self.rate_limiter.attempt_store()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::error::AuthError;
    use crate::hasher::fast_hasher;
    use crate::store::memory::MemoryStore;

    fn authenticator() -> Authenticator {
        let store = Arc::new(MemoryStore::new());
        Authenticator::new(
            AuthConfig::default(),
            Stores::shared(store),
            Arc::new(fast_hasher()),
            Arc::new(LogMailSender),
        )
    }

    fn meta() -> ClientMetadata {
        ClientMetadata::new(Some("10.0.0.1"), Some("firefox"))
    }

    #[tokio::test]
    async fn sign_up_then_sign_in() {
        let auth = authenticator();
        let signup = auth
            .sign_up("a@b.com", Some("Ada"), "Str0ng!Pass", meta())
            .await
            .unwrap();

        let signin = auth.sign_in("a@b.com", "Str0ng!Pass", meta()).await.unwrap();
        assert_eq!(signin.principal_id, signup.principal_id);
        assert!(!signin.password_expiration.expired);
        assert!(!signin.session.token.is_empty());
    }

    #[tokio::test]
    async fn weak_signup_lists_length_violation() {
        let auth = authenticator();
        let err = auth
            .sign_up("a@b.com", None, "Weak1!", meta())
            .await
            .unwrap_err();
        match err {
            AuthError::WeakPassword { violations } => {
                assert!(violations
                    .iter()
                    .any(|v| matches!(v, crate::password::PolicyViolation::TooShort { .. })));
            }
            other => panic!("expected WeakPassword, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let auth = authenticator();
        auth.sign_up("a@b.com", None, "Str0ng!Pass", meta())
            .await
            .unwrap();
        let err = auth
            .sign_up("A@B.com", None, "Other!Pass1", meta())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::EmailAlreadyExists));
    }

    #[tokio::test]
    async fn wrong_password_is_indistinguishable_from_unknown_email() {
        let auth = authenticator();
        auth.sign_up("a@b.com", None, "Str0ng!Pass", meta())
            .await
            .unwrap();

        let wrong = auth.sign_in("a@b.com", "Wrong!Pass1", meta()).await.unwrap_err();
        let unknown = auth.sign_in("ghost@b.com", "Wrong!Pass1", meta()).await.unwrap_err();
        assert_eq!(wrong.code(), unknown.code());
        assert_eq!(wrong.code(), "INVALID_CREDENTIALS");
    }

    #[tokio::test]
    async fn sixth_failed_login_hits_lockout() {
        let auth = authenticator();
        auth.sign_up("user@x.com", None, "Str0ng!Pass", meta())
            .await
            .unwrap();

        for _ in 0..5 {
            let err = auth
                .sign_in("user@x.com", "Wrong!Pass1", meta())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "INVALID_CREDENTIALS");
        }

        let err = auth
            .sign_in("user@x.com", "Str0ng!Pass", meta())
            .await
            .unwrap_err();
        match err {
            AuthError::AccountLocked { lockout_ends_at } => {
                assert!(lockout_ends_at > Utc::now());
            }
            other => panic!("expected AccountLocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn change_password_rejects_reuse_and_kills_sessions() {
        let auth = authenticator();
        let signup = auth
            .sign_up("a@b.com", None, "Str0ng!Pass", meta())
            .await
            .unwrap();
        let signin = auth.sign_in("a@b.com", "Str0ng!Pass", meta()).await.unwrap();

        let err = auth
            .change_password(signup.principal_id, "Str0ng!Pass", "Str0ng!Pass")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::PasswordReuse));

        auth.change_password(signup.principal_id, "Str0ng!Pass", "N3w!Password")
            .await
            .unwrap();

        // Old session died with the old credential.
        let validation = auth
            .sessions()
            .validate_session(&signin.session.token, meta())
            .await;
        assert!(!validation.valid);

        // Old password no longer signs in.
        let err = auth.sign_in("a@b.com", "Str0ng!Pass", meta()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_CREDENTIALS");
        auth.sign_in("a@b.com", "N3w!Password", meta()).await.unwrap();
    }

    #[tokio::test]
    async fn verify_email_consumes_the_token() {
        let store = Arc::new(MemoryStore::new());
        let auth = Authenticator::new(
            AuthConfig::default(),
            Stores::shared(store.clone()),
            Arc::new(fast_hasher()),
            Arc::new(LogMailSender),
        );
        auth.sign_up("a@b.com", None, "Str0ng!Pass", meta())
            .await
            .unwrap();

        // Reissue to get the raw token in hand.
        let token = auth
            .tokens()
            .create_token("a@b.com", TokenKind::EmailVerification, None)
            .await
            .unwrap();
        auth.verify_email(&token).await.unwrap();

        let principal = store.find_by_email("a@b.com").await.unwrap().unwrap();
        assert!(principal.verified_at.is_some());

        let err = auth.verify_email(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn reset_request_is_opaque_for_unknown_emails() {
        let auth = authenticator();
        auth.request_password_reset("ghost@b.com", meta())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reset_token_kind_cannot_verify_email() {
        let auth = authenticator();
        auth.sign_up("a@b.com", None, "Str0ng!Pass", meta())
            .await
            .unwrap();
        let token = auth
            .tokens()
            .create_token("a@b.com", TokenKind::PasswordReset, None)
            .await
            .unwrap();
        let err = auth.verify_email(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }
}
