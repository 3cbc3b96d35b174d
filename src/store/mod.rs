//! Store records and the narrow capability traits each subsystem uses.
//!
//! Every subsystem reaches its tables through its own trait; no subsystem
//! touches another's rows. Two adapters exist: [`postgres::PgStore`] for
//! production and [`memory::MemoryStore`] for tests and embedded use. The
//! adapter is chosen once at construction and injected, never selected at
//! runtime via environment checks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rate_limit::RateLimitAction;
use crate::token::TokenKind;

pub mod memory;
pub mod postgres;

/// Client context attached to attempts, sessions, and activity events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientMetadata {
    #[must_use]
    pub fn new(ip_address: Option<&str>, user_agent: Option<&str>) -> Self {
        Self {
            ip_address: ip_address.map(str::to_string),
            user_agent: user_agent.map(str::to_string),
        }
    }
}

/// An authenticated identity. The current credential is folded in: one
/// credential per principal, replaced (not versioned) on change.
#[derive(Clone, Debug)]
pub struct Principal {
    pub id: Uuid,
    /// Stored lowercase; the unique lookup key.
    pub email: String,
    pub display_name: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub password_hash: Option<String>,
    pub password_set_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of a prior password hash.
#[derive(Clone, Debug)]
pub struct PasswordHistoryEntry {
    pub principal_id: Uuid,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// One row per authentication-adjacent attempt. Append-only.
#[derive(Clone, Debug)]
pub struct AttemptRecord {
    pub identifier: String,
    pub action: RateLimitAction,
    pub success: bool,
    pub principal_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub metadata: ClientMetadata,
}

/// A server-tracked session. Deactivated, never deleted, so the activity
/// trail stays intact.
#[derive(Clone, Debug)]
pub struct SessionRow {
    pub id: Uuid,
    pub token_hash: Vec<u8>,
    pub principal_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub active: bool,
    pub metadata: ClientMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    Login,
    Activity,
    Logout,
    Timeout,
    Suspicious,
    ConcurrentLimit,
    Invalidated,
}

impl SessionAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Activity => "activity",
            Self::Logout => "logout",
            Self::Timeout => "timeout",
            Self::Suspicious => "suspicious",
            Self::ConcurrentLimit => "concurrent_limit",
            Self::Invalidated => "invalidated",
        }
    }
}

impl std::str::FromStr for SessionAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "login" => Ok(Self::Login),
            "activity" => Ok(Self::Activity),
            "logout" => Ok(Self::Logout),
            "timeout" => Ok(Self::Timeout),
            "suspicious" => Ok(Self::Suspicious),
            "concurrent_limit" => Ok(Self::ConcurrentLimit),
            "invalidated" => Ok(Self::Invalidated),
            other => Err(format!("unknown session action: {other}")),
        }
    }
}

/// Append-only audit entry tied to a session.
#[derive(Clone, Debug)]
pub struct SessionActivityEvent {
    pub session_id: Uuid,
    pub action: SessionAction,
    pub created_at: DateTime<Utc>,
    pub metadata: ClientMetadata,
    /// Free-form structured detail (e.g. the distinct IP set that tripped
    /// anomaly detection).
    pub detail: Option<serde_json::Value>,
}

/// A single-use verification token at rest. Only the hash is stored.
#[derive(Clone, Debug)]
pub struct TokenRow {
    pub token_hash: Vec<u8>,
    pub identifier: String,
    pub kind: TokenKind,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Append-only log of attempts, read in time-windowed range queries.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn record(&self, attempt: AttemptRecord) -> anyhow::Result<()>;

    /// Attempts for `(identifier, action)` since `since`, newest first.
    async fn attempts_since(
        &self,
        identifier: &str,
        action: RateLimitAction,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AttemptRecord>>;

    /// Retention pruning; returns the number of rows removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session; `Ok(false)` on a token-hash collision so the
    /// caller can regenerate and retry.
    async fn insert(&self, session: SessionRow) -> anyhow::Result<bool>;
    async fn find_by_token_hash(&self, token_hash: &[u8]) -> anyhow::Result<Option<SessionRow>>;

    /// Refresh `last_activity` and `expires_at` on a validated session.
    async fn touch(
        &self,
        id: Uuid,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn deactivate(&self, id: Uuid) -> anyhow::Result<()>;
    async fn deactivate_all_for(&self, principal_id: Uuid) -> anyhow::Result<u64>;

    /// Active sessions for a principal, oldest `last_activity` first.
    async fn active_for_principal(&self, principal_id: Uuid) -> anyhow::Result<Vec<SessionRow>>;

    async fn append_event(&self, event: SessionActivityEvent) -> anyhow::Result<()>;

    /// The most recent events for a session, newest first, up to `limit`.
    async fn recent_events(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> anyhow::Result<Vec<SessionActivityEvent>>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert(&self, token: TokenRow) -> anyhow::Result<()>;

    /// Drop live tokens for `(identifier, kind)`; enforces the at-most-one
    /// live token invariant before a new insert.
    async fn delete_for(&self, identifier: &str, kind: TokenKind) -> anyhow::Result<u64>;

    /// Atomic read+delete by hash. The row is gone whether or not it turns
    /// out to be expired; single-use is enforced here.
    async fn take(&self, token_hash: &[u8]) -> anyhow::Result<Option<TokenRow>>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait PrincipalStore: Send + Sync {
    /// Lookup by normalized (lowercased, trimmed) email.
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<Principal>>;
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Principal>>;

    /// Insert a new principal; `Ok(false)` on a unique-email conflict.
    async fn insert(&self, principal: Principal) -> anyhow::Result<bool>;

    async fn set_verified(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<()>;
    async fn set_password(
        &self,
        id: Uuid,
        password_hash: &str,
        set_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PasswordHistoryStore: Send + Sync {
    /// The most recent entries for a principal, newest first, up to `limit`.
    async fn recent(
        &self,
        principal_id: Uuid,
        limit: usize,
    ) -> anyhow::Result<Vec<PasswordHistoryEntry>>;

    async fn push(&self, entry: PasswordHistoryEntry) -> anyhow::Result<()>;

    /// Keep only the `keep` most recent entries; returns rows removed.
    async fn prune(&self, principal_id: Uuid, keep: usize) -> anyhow::Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::SessionAction;

    #[test]
    fn session_action_strings_match_audit_vocabulary() {
        assert_eq!(SessionAction::Login.as_str(), "login");
        assert_eq!(SessionAction::Timeout.as_str(), "timeout");
        assert_eq!(SessionAction::ConcurrentLimit.as_str(), "concurrent_limit");
        assert_eq!(SessionAction::Suspicious.as_str(), "suspicious");
    }
}
