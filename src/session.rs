//! Session lifecycle, concurrency enforcement, and anomaly detection.
//!
//! A session moves `created -> active -> {expired | logged_out | evicted |
//! invalidated}`. Terminal states flip the active flag and append an
//! activity event; rows are never deleted, so the audit trail survives the
//! session. Raw tokens exist only in the cookie — the store holds a sha256
//! hash.
//!
//! Concurrency enforcement makes room before inserting: a new login always
//! succeeds and the oldest idle sessions pay for it. Under concurrent logins
//! for one principal the limit can be exceeded by one transiently; the
//! deterrent is bounding stale sessions, not hard exclusion.
//!
//! Anomaly detection is a best-effort heuristic over the recent activity
//! trail, not a guarantee: enough distinct IPs or user agents force the
//! session dead and flag it suspicious.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::AuthError;
use crate::store::{ClientMetadata, SessionAction, SessionActivityEvent, SessionRow, SessionStore};
use crate::util::{generate_opaque_token, hash_token};

const TOKEN_INSERT_RETRIES: usize = 3;

/// A freshly minted session: raw token for the cookie plus its expiry.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug)]
pub struct SessionValidation {
    pub valid: bool,
    pub principal_id: Option<Uuid>,
    pub suspicious: bool,
}

impl SessionValidation {
    const fn invalid() -> Self {
        Self {
            valid: false,
            principal_id: None,
            suspicious: false,
        }
    }
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    /// Mint a session for `principal_id`, evicting the oldest sessions first
    /// if the principal is at the concurrency limit.
    pub async fn create_session(
        &self,
        principal_id: Uuid,
        metadata: ClientMetadata,
    ) -> Result<NewSession, AuthError> {
        let now = Utc::now();
        let active = self.store.active_for_principal(principal_id).await?;

        // Rows already past expiry or idle timeout are dead weight; retire
        // them before they count against the concurrency limit.
        let mut live = Vec::new();
        for session in active {
            if self.timed_out(&session, now) {
                self.retire(&session, SessionAction::Timeout, &metadata, None)
                    .await;
            } else {
                live.push(session);
            }
        }

        // Make room, then insert: evict oldest-by-last-activity down to
        // max_concurrent - 1 so the new login always fits.
        if live.len() >= self.config.max_concurrent {
            let evict = live.len() + 1 - self.config.max_concurrent;
            for session in live.iter().take(evict) {
                self.retire(
                    session,
                    SessionAction::ConcurrentLimit,
                    &metadata,
                    Some(json!({ "evicted_for": principal_id.to_string() })),
                )
                .await;
                info!(
                    session = %session.id,
                    principal = %principal_id,
                    "evicted oldest session at concurrency limit"
                );
            }
        }

        let expires_at = now + Duration::hours(self.config.max_age_hours);
        for _ in 0..TOKEN_INSERT_RETRIES {
            let token = generate_opaque_token()?;
            let session = SessionRow {
                id: Uuid::new_v4(),
                token_hash: hash_token(&token),
                principal_id,
                expires_at,
                last_activity: now,
                active: true,
                metadata: metadata.clone(),
                created_at: now,
            };
            let session_id = session.id;
            if self.store.insert(session).await? {
                self.append_event(session_id, SessionAction::Login, &metadata, None)
                    .await;
                return Ok(NewSession { token, expires_at });
            }
        }
        Err(AuthError::Server(anyhow!(
            "failed to generate unique session token"
        )))
    }

    /// Validate a presented token, refreshing activity on success.
    ///
    /// Store failures are treated as "invalid session" — failing closed is
    /// the safer default when we cannot tell whether a session is real.
    pub async fn validate_session(
        &self,
        token: &str,
        metadata: ClientMetadata,
    ) -> SessionValidation {
        match self.try_validate(token, metadata).await {
            Ok(validation) => validation,
            Err(err) => {
                error!("session validation failing closed: {err}");
                SessionValidation::invalid()
            }
        }
    }

    async fn try_validate(
        &self,
        token: &str,
        metadata: ClientMetadata,
    ) -> anyhow::Result<SessionValidation> {
        let token_hash = hash_token(token);
        let Some(session) = self.store.find_by_token_hash(&token_hash).await? else {
            return Ok(SessionValidation::invalid());
        };
        if !session.active {
            return Ok(SessionValidation::invalid());
        }

        let now = Utc::now();
        if self.timed_out(&session, now) {
            self.retire(&session, SessionAction::Timeout, &metadata, None)
                .await;
            return Ok(SessionValidation::invalid());
        }

        let expires_at = now + Duration::hours(self.config.max_age_hours);
        self.store.touch(session.id, now, expires_at).await?;
        self.append_event(session.id, SessionAction::Activity, &metadata, None)
            .await;

        if self.looks_suspicious(&session).await? {
            return Ok(SessionValidation {
                valid: false,
                principal_id: Some(session.principal_id),
                suspicious: true,
            });
        }

        Ok(SessionValidation {
            valid: true,
            principal_id: Some(session.principal_id),
            suspicious: false,
        })
    }

    /// Logout. Idempotent: an unknown or already-dead token is a no-op.
    pub async fn destroy_session(&self, token: &str) -> Result<(), AuthError> {
        let token_hash = hash_token(token);
        let Some(session) = self.store.find_by_token_hash(&token_hash).await? else {
            return Ok(());
        };
        if session.active {
            self.retire(&session, SessionAction::Logout, &session.metadata, None)
                .await;
        }
        Ok(())
    }

    /// Kill every active session for a principal — password change, detected
    /// compromise, or an operator action.
    pub async fn invalidate_all_sessions(
        &self,
        principal_id: Uuid,
        reason: &str,
    ) -> Result<u64, AuthError> {
        let active = self.store.active_for_principal(principal_id).await?;
        let count = active.len() as u64;
        for session in &active {
            self.append_event(
                session.id,
                SessionAction::Invalidated,
                &session.metadata,
                Some(json!({ "reason": reason })),
            )
            .await;
        }
        self.store.deactivate_all_for(principal_id).await?;
        if count > 0 {
            warn!(
                target: "security",
                principal = %principal_id,
                reason,
                count,
                "invalidated all sessions"
            );
        }
        Ok(count)
    }

    /// Render the session cookie. `Secure` and `SameSite=Strict` only in
    /// production so local development over plain HTTP keeps working.
    #[must_use]
    pub fn cookie_for(&self, token: &str) -> String {
        let name = &self.config.cookie_name;
        let max_age = self.config.max_age_hours * 3600;
        let same_site = if self.config.production { "Strict" } else { "Lax" };
        let mut cookie = format!(
            "{name}={token}; Path=/; HttpOnly; SameSite={same_site}; Max-Age={max_age}"
        );
        if self.config.production {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// Cookie that clears the session on the client.
    #[must_use]
    pub fn clear_cookie(&self) -> String {
        let name = &self.config.cookie_name;
        let same_site = if self.config.production { "Strict" } else { "Lax" };
        let mut cookie =
            format!("{name}=; Path=/; HttpOnly; SameSite={same_site}; Max-Age=0");
        if self.config.production {
            cookie.push_str("; Secure");
        }
        cookie
    }

    fn timed_out(&self, session: &SessionRow, now: DateTime<Utc>) -> bool {
        now > session.expires_at
            || now - session.last_activity > Duration::minutes(self.config.inactivity_minutes)
    }

    /// Distinct IPs or user agents across the recent activity trail at or
    /// above the threshold flag the session and force it dead.
    async fn looks_suspicious(&self, session: &SessionRow) -> anyhow::Result<bool> {
        let events = self
            .store
            .recent_events(session.id, self.config.recent_events)
            .await?;
        let ips: HashSet<&str> = events
            .iter()
            .filter_map(|event| event.metadata.ip_address.as_deref())
            .collect();
        let agents: HashSet<&str> = events
            .iter()
            .filter_map(|event| event.metadata.user_agent.as_deref())
            .collect();
        if ips.len() < self.config.suspicious_threshold
            && agents.len() < self.config.suspicious_threshold
        {
            return Ok(false);
        }

        warn!(
            target: "security",
            session = %session.id,
            principal = %session.principal_id,
            distinct_ips = ips.len(),
            distinct_user_agents = agents.len(),
            "suspicious session activity, invalidating"
        );
        self.retire(
            session,
            SessionAction::Suspicious,
            &session.metadata,
            Some(json!({
                "distinct_ips": ips.iter().collect::<Vec<_>>(),
                "distinct_user_agents": agents.iter().collect::<Vec<_>>(),
            })),
        )
        .await;
        Ok(true)
    }

    /// Flip a session inactive and record why. Event-append failures are
    /// logged, not surfaced — the deactivation itself must not be lost over
    /// an audit hiccup.
    async fn retire(
        &self,
        session: &SessionRow,
        action: SessionAction,
        metadata: &ClientMetadata,
        detail: Option<serde_json::Value>,
    ) {
        if let Err(err) = self.store.deactivate(session.id).await {
            error!(session = %session.id, "failed to deactivate session: {err}");
            return;
        }
        self.append_event(session.id, action, metadata, detail).await;
    }

    async fn append_event(
        &self,
        session_id: Uuid,
        action: SessionAction,
        metadata: &ClientMetadata,
        detail: Option<serde_json::Value>,
    ) {
        let event = SessionActivityEvent {
            session_id,
            action,
            created_at: Utc::now(),
            metadata: metadata.clone(),
            detail,
        };
        if let Err(err) = self.store.append_event(event).await {
            error!(
                session = %session_id,
                action = action.as_str(),
                "failed to append session event: {err}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn manager() -> (SessionManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(store.clone(), SessionConfig::default());
        (manager, store)
    }

    fn meta(ip: &str, agent: &str) -> ClientMetadata {
        ClientMetadata::new(Some(ip), Some(agent))
    }

    #[tokio::test]
    async fn create_then_validate_round_trips() {
        let (manager, _store) = manager();
        let principal = Uuid::new_v4();
        let session = manager
            .create_session(principal, meta("10.0.0.1", "firefox"))
            .await
            .unwrap();

        let validation = manager
            .validate_session(&session.token, meta("10.0.0.1", "firefox"))
            .await;
        assert!(validation.valid);
        assert_eq!(validation.principal_id, Some(principal));
        assert!(!validation.suspicious);
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let (manager, _store) = manager();
        let validation = manager
            .validate_session("not-a-token", ClientMetadata::default())
            .await;
        assert!(!validation.valid);
    }

    #[tokio::test]
    async fn fourth_session_evicts_exactly_the_oldest() {
        let (manager, store) = manager();
        let principal = Uuid::new_v4();

        let mut tokens = Vec::new();
        for _ in 0..3 {
            let session = manager
                .create_session(principal, meta("10.0.0.1", "firefox"))
                .await
                .unwrap();
            tokens.push(session.token);
            // Keep last_activity strictly ordered.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let fourth = manager
            .create_session(principal, meta("10.0.0.1", "firefox"))
            .await
            .unwrap();

        let active = store.active_for_principal(principal).await.unwrap();
        assert_eq!(active.len(), 3);

        // The first-created session is gone; the rest plus the new one live.
        assert!(!manager
            .validate_session(&tokens[0], meta("10.0.0.1", "firefox"))
            .await
            .valid);
        assert!(manager
            .validate_session(&tokens[1], meta("10.0.0.1", "firefox"))
            .await
            .valid);
        assert!(manager
            .validate_session(&fourth.token, meta("10.0.0.1", "firefox"))
            .await
            .valid);
    }

    #[tokio::test]
    async fn logout_is_idempotent_and_final() {
        let (manager, _store) = manager();
        let principal = Uuid::new_v4();
        let session = manager
            .create_session(principal, ClientMetadata::default())
            .await
            .unwrap();

        manager.destroy_session(&session.token).await.unwrap();
        manager.destroy_session(&session.token).await.unwrap();

        let validation = manager
            .validate_session(&session.token, ClientMetadata::default())
            .await;
        assert!(!validation.valid);
    }

    #[tokio::test]
    async fn invalidate_all_kills_every_session() {
        let (manager, _store) = manager();
        let principal = Uuid::new_v4();
        let a = manager
            .create_session(principal, ClientMetadata::default())
            .await
            .unwrap();
        let b = manager
            .create_session(principal, ClientMetadata::default())
            .await
            .unwrap();

        let count = manager
            .invalidate_all_sessions(principal, "password_change")
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert!(!manager.validate_session(&a.token, ClientMetadata::default()).await.valid);
        assert!(!manager.validate_session(&b.token, ClientMetadata::default()).await.valid);
    }

    #[tokio::test]
    async fn roaming_client_trips_anomaly_detection() {
        let (manager, store) = manager();
        let principal = Uuid::new_v4();
        let session = manager
            .create_session(principal, meta("10.0.0.1", "firefox"))
            .await
            .unwrap();

        // Second distinct IP reaches the default threshold of 2.
        let validation = manager
            .validate_session(&session.token, meta("172.16.0.9", "firefox"))
            .await;
        assert!(validation.suspicious);
        assert!(!validation.valid);

        // The session was force-killed, with a suspicious event on record.
        assert!(!manager
            .validate_session(&session.token, meta("10.0.0.1", "firefox"))
            .await
            .valid);
        let rows = store.active_for_principal(principal).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn inactivity_timeout_flips_session_inactive() {
        let store = Arc::new(MemoryStore::new());
        let config = SessionConfig {
            inactivity_minutes: 0,
            ..SessionConfig::default()
        };
        let manager = SessionManager::new(store.clone(), config);
        let principal = Uuid::new_v4();
        let session = manager
            .create_session(principal, ClientMetadata::default())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let validation = manager
            .validate_session(&session.token, ClientMetadata::default())
            .await;
        assert!(!validation.valid);
        assert!(store.active_for_principal(principal).await.unwrap().is_empty());
    }

    struct UnreachableSessionStore;

    #[async_trait::async_trait]
    impl SessionStore for UnreachableSessionStore {
        async fn insert(&self, _session: SessionRow) -> anyhow::Result<bool> {
            Err(anyhow!("connection refused"))
        }

        async fn find_by_token_hash(
            &self,
            _token_hash: &[u8],
        ) -> anyhow::Result<Option<SessionRow>> {
            Err(anyhow!("connection refused"))
        }

        async fn touch(
            &self,
            _id: Uuid,
            _last_activity: DateTime<Utc>,
            _expires_at: DateTime<Utc>,
        ) -> anyhow::Result<()> {
            Err(anyhow!("connection refused"))
        }

        async fn deactivate(&self, _id: Uuid) -> anyhow::Result<()> {
            Err(anyhow!("connection refused"))
        }

        async fn deactivate_all_for(&self, _principal_id: Uuid) -> anyhow::Result<u64> {
            Err(anyhow!("connection refused"))
        }

        async fn active_for_principal(
            &self,
            _principal_id: Uuid,
        ) -> anyhow::Result<Vec<SessionRow>> {
            Err(anyhow!("connection refused"))
        }

        async fn append_event(&self, _event: SessionActivityEvent) -> anyhow::Result<()> {
            Err(anyhow!("connection refused"))
        }

        async fn recent_events(
            &self,
            _session_id: Uuid,
            _limit: usize,
        ) -> anyhow::Result<Vec<SessionActivityEvent>> {
            Err(anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn unreachable_store_fails_validation_closed() {
        let manager = SessionManager::new(
            Arc::new(UnreachableSessionStore),
            SessionConfig::default(),
        );
        let validation = manager
            .validate_session("some-token", ClientMetadata::default())
            .await;
        assert!(!validation.valid);
        assert!(!validation.suspicious);
        assert_eq!(validation.principal_id, None);
    }

    #[test]
    fn cookie_attributes_differ_by_environment() {
        let store = Arc::new(MemoryStore::new());
        let dev = SessionManager::new(store.clone(), SessionConfig::default());
        let cookie = dev.cookie_for("tok");
        assert!(cookie.starts_with("auth_session=tok; "));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("HttpOnly"));
        assert!(!cookie.contains("Secure"));

        let prod = SessionManager::new(
            store,
            SessionConfig {
                production: true,
                ..SessionConfig::default()
            },
        );
        let cookie = prod.cookie_for("tok");
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.ends_with("; Secure"));
        assert!(prod.clear_cookie().contains("Max-Age=0"));
    }
}
