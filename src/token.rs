//! Single-use, typed, expiring tokens for email verification and password
//! reset links.
//!
//! Wire format is `"<kind>:<random>"` so verification can route on the kind
//! prefix without a store lookup. At most one live token exists per
//! `(identifier, kind)` pair: creating a new one deletes any prior token of
//! the same kind, so a stale link dies the moment a fresh one is requested.
//! Consumption is a single atomic read+delete — a token verifies at most once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::TokenConfig;
use crate::error::AuthError;
use crate::store::{TokenRow, TokenStore};
use crate::util::{generate_opaque_token, hash_token};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    EmailVerification,
    PasswordReset,
}

impl TokenKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmailVerification => "email_verification",
            Self::PasswordReset => "password_reset",
        }
    }

    #[must_use]
    pub fn from_prefix(value: &str) -> Option<Self> {
        match value {
            "email_verification" => Some(Self::EmailVerification),
            "password_reset" => Some(Self::PasswordReset),
            _ => None,
        }
    }
}

/// Result of a verification call. `valid` is false for unknown, expired, or
/// already-consumed tokens; callers cannot tell those cases apart.
#[derive(Clone, Debug)]
pub struct TokenVerification {
    pub valid: bool,
    pub kind: Option<TokenKind>,
    pub identifier: Option<String>,
}

impl TokenVerification {
    const fn invalid() -> Self {
        Self {
            valid: false,
            kind: None,
            identifier: None,
        }
    }
}

pub struct TokenService {
    store: Arc<dyn TokenStore>,
    config: TokenConfig,
}

impl TokenService {
    #[must_use]
    pub fn new(store: Arc<dyn TokenStore>, config: TokenConfig) -> Self {
        Self { store, config }
    }

    /// Mint a token for `identifier`, superseding any live token of the same
    /// kind. Returns the raw value for the email link; only a hash is stored.
    pub async fn create_token(
        &self,
        identifier: &str,
        kind: TokenKind,
        ttl_minutes: Option<i64>,
    ) -> Result<String, AuthError> {
        let superseded = self.store.delete_for(identifier, kind).await?;
        if superseded > 0 {
            info!(
                identifier,
                kind = kind.as_str(),
                superseded,
                "superseded live token"
            );
        }

        let raw = format!("{}:{}", kind.as_str(), generate_opaque_token()?);
        let now = Utc::now();
        let ttl = ttl_minutes.unwrap_or(self.config.ttl_minutes);
        self.store
            .insert(TokenRow {
                token_hash: hash_token(&raw),
                identifier: identifier.to_string(),
                kind,
                expires_at: now + chrono::Duration::minutes(ttl),
                created_at: now,
            })
            .await?;
        Ok(raw)
    }

    /// Consume a token. The row is removed whether it turns out valid or
    /// expired, enforcing single-use either way.
    pub async fn verify_token(&self, raw: &str) -> Result<TokenVerification, AuthError> {
        let Some((prefix, _)) = raw.split_once(':') else {
            return Ok(TokenVerification::invalid());
        };
        if TokenKind::from_prefix(prefix).is_none() {
            return Ok(TokenVerification::invalid());
        }

        let Some(row) = self.store.take(&hash_token(raw)).await? else {
            return Ok(TokenVerification::invalid());
        };
        if row.expires_at <= Utc::now() {
            // Already deleted by take(); just report it unusable.
            return Ok(TokenVerification::invalid());
        }
        Ok(TokenVerification {
            valid: true,
            kind: Some(row.kind),
            identifier: Some(row.identifier),
        })
    }

    /// Delete expired rows that were never consumed.
    pub async fn sweep(&self) -> Result<u64, AuthError> {
        Ok(self.store.delete_expired(Utc::now()).await?)
    }

    /// Periodic sweep on a tokio interval; errors are logged, never fatal.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let period = Duration::from_secs(service.config.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match service.sweep().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "swept expired tokens"),
                    Err(err) => error!("token sweep failed: {err}"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn service() -> TokenService {
        TokenService::new(Arc::new(MemoryStore::new()), TokenConfig::default())
    }

    #[tokio::test]
    async fn token_carries_its_kind_prefix() {
        let service = service();
        let raw = service
            .create_token("a@b.com", TokenKind::EmailVerification, None)
            .await
            .unwrap();
        assert!(raw.starts_with("email_verification:"));
    }

    #[tokio::test]
    async fn verify_is_single_use() {
        let service = service();
        let raw = service
            .create_token("a@b.com", TokenKind::PasswordReset, None)
            .await
            .unwrap();

        let first = service.verify_token(&raw).await.unwrap();
        assert!(first.valid);
        assert_eq!(first.kind, Some(TokenKind::PasswordReset));
        assert_eq!(first.identifier.as_deref(), Some("a@b.com"));

        let second = service.verify_token(&raw).await.unwrap();
        assert!(!second.valid);
    }

    #[tokio::test]
    async fn new_token_supersedes_the_old_one() {
        let service = service();
        let old = service
            .create_token("a@b.com", TokenKind::EmailVerification, None)
            .await
            .unwrap();
        let new = service
            .create_token("a@b.com", TokenKind::EmailVerification, None)
            .await
            .unwrap();

        assert!(!service.verify_token(&old).await.unwrap().valid);
        assert!(service.verify_token(&new).await.unwrap().valid);
    }

    #[tokio::test]
    async fn kinds_do_not_supersede_each_other() {
        let service = service();
        let verify = service
            .create_token("a@b.com", TokenKind::EmailVerification, None)
            .await
            .unwrap();
        let reset = service
            .create_token("a@b.com", TokenKind::PasswordReset, None)
            .await
            .unwrap();

        assert!(service.verify_token(&verify).await.unwrap().valid);
        assert!(service.verify_token(&reset).await.unwrap().valid);
    }

    #[tokio::test]
    async fn expired_token_is_invalid_and_gone() {
        let service = service();
        let raw = service
            .create_token("a@b.com", TokenKind::PasswordReset, Some(-1))
            .await
            .unwrap();
        assert!(!service.verify_token(&raw).await.unwrap().valid);
        // take() already removed it; a sweep finds nothing left.
        assert_eq!(service.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn garbage_tokens_are_rejected_without_store_access() {
        let service = service();
        assert!(!service.verify_token("no-colon").await.unwrap().valid);
        assert!(!service.verify_token("bogus:abc").await.unwrap().valid);
    }

    #[tokio::test]
    async fn sweep_removes_unconsumed_expired_rows() {
        let service = service();
        let _ = service
            .create_token("a@b.com", TokenKind::PasswordReset, Some(-1))
            .await
            .unwrap();
        assert_eq!(service.sweep().await.unwrap(), 1);
    }
}
