//! In-memory store adapter.
//!
//! Backs the unit and integration tests and small embedded deployments.
//! Mirrors the Postgres adapter's contract exactly: same ordering, same
//! collision signalling, same retention semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AttemptRecord, AttemptStore, PasswordHistoryEntry, PasswordHistoryStore, Principal,
    PrincipalStore, SessionActivityEvent, SessionRow, SessionStore, TokenRow, TokenStore,
};
use crate::rate_limit::RateLimitAction;
use crate::token::TokenKind;

#[derive(Default)]
pub struct MemoryStore {
    attempts: Mutex<Vec<AttemptRecord>>,
    sessions: Mutex<Vec<SessionRow>>,
    events: Mutex<Vec<SessionActivityEvent>>,
    tokens: Mutex<Vec<TokenRow>>,
    principals: Mutex<Vec<Principal>>,
    history: Mutex<Vec<PasswordHistoryEntry>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn record(&self, attempt: AttemptRecord) -> anyhow::Result<()> {
        self.attempts.lock().await.push(attempt);
        Ok(())
    }

    async fn attempts_since(
        &self,
        identifier: &str,
        action: RateLimitAction,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AttemptRecord>> {
        let attempts = self.attempts.lock().await;
        let mut matching: Vec<AttemptRecord> = attempts
            .iter()
            .filter(|attempt| {
                attempt.identifier == identifier
                    && attempt.action == action
                    && attempt.created_at >= since
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut attempts = self.attempts.lock().await;
        let before = attempts.len();
        attempts.retain(|attempt| attempt.created_at >= cutoff);
        Ok((before - attempts.len()) as u64)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(&self, session: SessionRow) -> anyhow::Result<bool> {
        let mut sessions = self.sessions.lock().await;
        if sessions.iter().any(|s| s.token_hash == session.token_hash) {
            return Ok(false);
        }
        sessions.push(session);
        Ok(true)
    }

    async fn find_by_token_hash(&self, token_hash: &[u8]) -> anyhow::Result<Option<SessionRow>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .iter()
            .find(|s| s.token_hash == token_hash)
            .cloned())
    }

    async fn touch(
        &self,
        id: Uuid,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.iter_mut().find(|s| s.id == id) {
            session.last_activity = last_activity;
            session.expires_at = expires_at;
        }
        Ok(())
    }

    async fn deactivate(&self, id: Uuid) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.iter_mut().find(|s| s.id == id) {
            session.active = false;
        }
        Ok(())
    }

    async fn deactivate_all_for(&self, principal_id: Uuid) -> anyhow::Result<u64> {
        let mut sessions = self.sessions.lock().await;
        let mut count = 0;
        for session in sessions
            .iter_mut()
            .filter(|s| s.principal_id == principal_id && s.active)
        {
            session.active = false;
            count += 1;
        }
        Ok(count)
    }

    async fn active_for_principal(&self, principal_id: Uuid) -> anyhow::Result<Vec<SessionRow>> {
        let sessions = self.sessions.lock().await;
        let mut active: Vec<SessionRow> = sessions
            .iter()
            .filter(|s| s.principal_id == principal_id && s.active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.last_activity.cmp(&b.last_activity));
        Ok(active)
    }

    async fn append_event(&self, event: SessionActivityEvent) -> anyhow::Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn recent_events(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> anyhow::Result<Vec<SessionActivityEvent>> {
        let events = self.events.lock().await;
        let mut matching: Vec<SessionActivityEvent> = events
            .iter()
            .filter(|event| event.session_id == session_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert(&self, token: TokenRow) -> anyhow::Result<()> {
        self.tokens.lock().await.push(token);
        Ok(())
    }

    async fn delete_for(&self, identifier: &str, kind: TokenKind) -> anyhow::Result<u64> {
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|token| !(token.identifier == identifier && token.kind == kind));
        Ok((before - tokens.len()) as u64)
    }

    async fn take(&self, token_hash: &[u8]) -> anyhow::Result<Option<TokenRow>> {
        let mut tokens = self.tokens.lock().await;
        let position = tokens.iter().position(|t| t.token_hash == token_hash);
        Ok(position.map(|index| tokens.remove(index)))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|token| token.expires_at > now);
        Ok((before - tokens.len()) as u64)
    }
}

#[async_trait]
impl PrincipalStore for MemoryStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<Principal>> {
        let principals = self.principals.lock().await;
        Ok(principals.iter().find(|p| p.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Principal>> {
        let principals = self.principals.lock().await;
        Ok(principals.iter().find(|p| p.id == id).cloned())
    }

    async fn insert(&self, principal: Principal) -> anyhow::Result<bool> {
        let mut principals = self.principals.lock().await;
        if principals.iter().any(|p| p.email == principal.email) {
            return Ok(false);
        }
        principals.push(principal);
        Ok(true)
    }

    async fn set_verified(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut principals = self.principals.lock().await;
        if let Some(principal) = principals.iter_mut().find(|p| p.id == id) {
            principal.verified_at = Some(at);
        }
        Ok(())
    }

    async fn set_password(
        &self,
        id: Uuid,
        password_hash: &str,
        set_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut principals = self.principals.lock().await;
        if let Some(principal) = principals.iter_mut().find(|p| p.id == id) {
            principal.password_hash = Some(password_hash.to_string());
            principal.password_set_at = Some(set_at);
        }
        Ok(())
    }
}

#[async_trait]
impl PasswordHistoryStore for MemoryStore {
    async fn recent(
        &self,
        principal_id: Uuid,
        limit: usize,
    ) -> anyhow::Result<Vec<PasswordHistoryEntry>> {
        let history = self.history.lock().await;
        let mut matching: Vec<PasswordHistoryEntry> = history
            .iter()
            .filter(|entry| entry.principal_id == principal_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn push(&self, entry: PasswordHistoryEntry) -> anyhow::Result<()> {
        self.history.lock().await.push(entry);
        Ok(())
    }

    async fn prune(&self, principal_id: Uuid, keep: usize) -> anyhow::Result<u64> {
        let mut history = self.history.lock().await;
        let mut owned: Vec<usize> = history
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.principal_id == principal_id)
            .map(|(index, _)| index)
            .collect();
        // Newest first by timestamp; drop indices past `keep`.
        owned.sort_by(|a, b| history[*b].created_at.cmp(&history[*a].created_at));
        let doomed: Vec<usize> = owned.into_iter().skip(keep).collect();
        let removed = doomed.len() as u64;
        let mut doomed = doomed;
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        for index in doomed {
            history.remove(index);
        }
        Ok(removed)
    }
}
