//! End-to-end account lifecycle flows over the in-memory store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use portcullis::config::{
    AuthConfig, HashConfig, RateLimitAlgorithm, RateLimitConfig, RateLimitRule, SessionConfig,
};
use portcullis::error::AuthError;
use portcullis::hasher::{Argon2Hasher, PasswordHasher};
use portcullis::rate_limit::RateLimitAction;
use portcullis::store::memory::MemoryStore;
use portcullis::store::{ClientMetadata, PasswordHistoryStore, PrincipalStore};
use portcullis::token::TokenKind;
use portcullis::{Authenticator, MailSender, Stores};

/// Captures outbound tokens so tests can click the "email link".
#[derive(Default)]
struct RecordingMailSender {
    sent: Mutex<Vec<(String, TokenKind, String)>>,
}

#[async_trait]
impl MailSender for RecordingMailSender {
    async fn send_token(&self, email: &str, kind: TokenKind, token: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((email.to_string(), kind, token.to_string()));
        Ok(())
    }
}

impl RecordingMailSender {
    fn last_token(&self, kind: TokenKind) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, k, _)| *k == kind)
            .map(|(_, _, token)| token.clone())
    }
}

struct Harness {
    auth: Authenticator,
    store: Arc<MemoryStore>,
    mailer: Arc<RecordingMailSender>,
    hasher: Arc<Argon2Hasher>,
}

fn cheap_hasher() -> Arc<Argon2Hasher> {
    // Minimum argon2 cost; fine for tests, never for production.
    Arc::new(
        Argon2Hasher::new(HashConfig {
            memory_kib: 8,
            iterations: 1,
        })
        .unwrap(),
    )
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        // RUST_LOG=debug cargo test -- --nocapture to watch the flows.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn harness(config: AuthConfig) -> Harness {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(RecordingMailSender::default());
    let hasher = cheap_hasher();
    let auth = Authenticator::new(
        config,
        Stores::shared(store.clone()),
        hasher.clone(),
        mailer.clone(),
    );
    Harness {
        auth,
        store,
        mailer,
        hasher,
    }
}

fn meta(ip: &str) -> ClientMetadata {
    ClientMetadata::new(Some(ip), Some("integration-test"))
}

#[tokio::test]
async fn signup_and_email_verification() {
    let h = harness(AuthConfig::default());
    let signup = h
        .auth
        .sign_up("new@user.dev", Some("New User"), "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap();

    // Sign-up seeds exactly one history row holding the live credential.
    let seeded = h.store.recent(signup.principal_id, 10).await.unwrap();
    assert_eq!(seeded.len(), 1);

    let token = h
        .mailer
        .last_token(TokenKind::EmailVerification)
        .expect("verification email sent on sign-up");
    h.auth.verify_email(&token).await.unwrap();

    let principal = h
        .store
        .find_by_email("new@user.dev")
        .await
        .unwrap()
        .unwrap();
    assert!(principal.verified_at.is_some());

    // Single use: replaying the link fails.
    let err = h.auth.verify_email(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken));
}

#[tokio::test]
async fn password_reset_rotates_credential_and_kills_sessions() {
    let h = harness(AuthConfig::default());
    h.auth
        .sign_up("reset@user.dev", None, "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap();
    let signin = h
        .auth
        .sign_in("reset@user.dev", "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap();

    h.auth
        .request_password_reset("reset@user.dev", meta("10.0.0.1"))
        .await
        .unwrap();
    let token = h
        .mailer
        .last_token(TokenKind::PasswordReset)
        .expect("reset email sent");

    h.auth.reset_password(&token, "Fresh!Pass9").await.unwrap();

    // Token is spent.
    let err = h.auth.reset_password(&token, "Other!Pass9").await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken));

    // The pre-reset session died with the old credential.
    let validation = h
        .auth
        .sessions()
        .validate_session(&signin.session.token, meta("10.0.0.1"))
        .await;
    assert!(!validation.valid);

    let err = h
        .auth
        .sign_in("reset@user.dev", "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_CREDENTIALS");
    h.auth
        .sign_in("reset@user.dev", "Fresh!Pass9", meta("10.0.0.1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn reset_request_for_unknown_email_is_silent() {
    let h = harness(AuthConfig::default());
    h.auth
        .request_password_reset("nobody@user.dev", meta("10.0.0.1"))
        .await
        .unwrap();
    assert!(h.mailer.last_token(TokenKind::PasswordReset).is_none());
}

#[tokio::test]
async fn reset_still_enforces_password_policy() {
    let h = harness(AuthConfig::default());
    h.auth
        .sign_up("weak@user.dev", None, "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap();
    h.auth
        .request_password_reset("weak@user.dev", meta("10.0.0.1"))
        .await
        .unwrap();
    let token = h.mailer.last_token(TokenKind::PasswordReset).unwrap();

    let err = h.auth.reset_password(&token, "weak").await.unwrap_err();
    assert!(matches!(err, AuthError::WeakPassword { .. }));
}

#[tokio::test]
async fn history_is_pruned_to_the_configured_limit() {
    let h = harness(AuthConfig::default());
    let signup = h
        .auth
        .sign_up("hist@user.dev", None, "Rotat3!Pass0", meta("10.0.0.1"))
        .await
        .unwrap();

    let passwords = [
        "Rotat3!Pass1",
        "Rotat3!Pass2",
        "Rotat3!Pass3",
        "Rotat3!Pass4",
        "Rotat3!Pass5",
    ];
    let mut current = "Rotat3!Pass0".to_string();
    for next in passwords {
        h.auth
            .change_password(signup.principal_id, &current, next)
            .await
            .unwrap();
        current = next.to_string();
    }

    // Seed entry plus five changes, pruned back to the default limit of 5.
    let entries = h.store.recent(signup.principal_id, 100).await.unwrap();
    assert_eq!(entries.len(), 5);
    // Newest entry is the live credential.
    assert!(h
        .hasher
        .verify(&current, &entries[0].password_hash)
        .unwrap());
}

#[tokio::test]
async fn oldest_password_becomes_reusable_after_falling_out_of_history() {
    let h = harness(AuthConfig::default());
    let signup = h
        .auth
        .sign_up("cycle@user.dev", None, "Rotat3!Pass0", meta("10.0.0.1"))
        .await
        .unwrap();

    // Still inside the history window: immediate reuse is rejected.
    let err = h
        .auth
        .change_password(signup.principal_id, "Rotat3!Pass0", "Rotat3!Pass0")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::PasswordReuse));

    // Push the original hash out of the 5-entry window.
    let mut current = "Rotat3!Pass0".to_string();
    for next in [
        "Rotat3!Pass1",
        "Rotat3!Pass2",
        "Rotat3!Pass3",
        "Rotat3!Pass4",
        "Rotat3!Pass5",
    ] {
        h.auth
            .change_password(signup.principal_id, &current, next)
            .await
            .unwrap();
        current = next.to_string();
    }

    h.auth
        .change_password(signup.principal_id, &current, "Rotat3!Pass0")
        .await
        .unwrap();
}

#[tokio::test]
async fn lockout_engages_after_the_configured_failures() {
    let config = AuthConfig::default().with_rate_limit(RateLimitConfig::default().with_rule(
        RateLimitAction::Login,
        RateLimitRule::new(3, 15, 30, RateLimitAlgorithm::FixedWindow),
    ));
    let h = harness(config);
    h.auth
        .sign_up("locked@user.dev", None, "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap();

    for _ in 0..3 {
        let err = h
            .auth
            .sign_in("locked@user.dev", "Wrong!Pass1", meta("10.0.0.1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CREDENTIALS");
    }

    // Even the correct password is refused while the lockout holds.
    let err = h
        .auth
        .sign_in("locked@user.dev", "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap_err();
    match err {
        AuthError::AccountLocked { lockout_ends_at } => assert!(lockout_ends_at > Utc::now()),
        other => panic!("expected AccountLocked, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_sessions_are_capped_oldest_first() {
    let config = AuthConfig::default().with_session(SessionConfig {
        max_concurrent: 2,
        ..SessionConfig::default()
    });
    let h = harness(config);
    h.auth
        .sign_up("multi@user.dev", None, "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap();

    let mut tokens = Vec::new();
    for _ in 0..3 {
        let signin = h
            .auth
            .sign_in("multi@user.dev", "Str0ng!Pass", meta("10.0.0.1"))
            .await
            .unwrap();
        tokens.push(signin.session.token);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let first = h
        .auth
        .sessions()
        .validate_session(&tokens[0], meta("10.0.0.1"))
        .await;
    assert!(!first.valid, "oldest session should have been evicted");
    for token in &tokens[1..] {
        let validation = h
            .auth
            .sessions()
            .validate_session(token, meta("10.0.0.1"))
            .await;
        assert!(validation.valid);
    }
}

#[tokio::test]
async fn aged_password_warns_then_blocks() {
    let h = harness(AuthConfig::default());
    let signup = h
        .auth
        .sign_up("aging@user.dev", None, "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap();
    let hash = h.hasher.hash("Str0ng!Pass").unwrap();

    // Two days past the 90-day maximum: grace logins remain.
    h.store
        .set_password(signup.principal_id, &hash, Utc::now() - Duration::days(92))
        .await
        .unwrap();
    let signin = h
        .auth
        .sign_in("aging@user.dev", "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap();
    assert!(signin.password_expiration.expired);
    assert!(!signin.password_expiration.must_change_password);
    assert!(signin.password_expiration.grace_logins_remaining > 0);

    // Far past the grace budget: sign-in is refused outright.
    h.store
        .set_password(signup.principal_id, &hash, Utc::now() - Duration::days(100))
        .await
        .unwrap();
    let err = h
        .auth
        .sign_in("aging@user.dev", "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::PasswordExpired));
}

#[tokio::test]
async fn attempt_log_pruning_honors_retention() {
    let h = harness(AuthConfig::default().with_attempt_retention_days(90));
    h.auth
        .sign_up("prune@user.dev", None, "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap();
    h.auth
        .sign_in("prune@user.dev", "Str0ng!Pass", meta("10.0.0.1"))
        .await
        .unwrap();

    // Everything on record is recent, so nothing is eligible yet.
    assert_eq!(h.auth.prune_attempt_log().await.unwrap(), 0);
}
