//! Postgres store adapter.
//!
//! Implements every capability trait over one `PgPool`. Each query is
//! wrapped in a `db.query` span and every await carries context, so store
//! failures surface with the statement that caused them. The schema lives in
//! `db/schema.sql`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    AttemptRecord, AttemptStore, ClientMetadata, PasswordHistoryEntry, PasswordHistoryStore,
    Principal, PrincipalStore, SessionAction, SessionActivityEvent, SessionRow, SessionStore,
    TokenRow, TokenStore,
};
use crate::rate_limit::RateLimitAction;
use crate::token::TokenKind;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with bounded pool and acquire timeouts so a store outage
    /// degrades into the documented fail-open/fail-closed paths instead of
    /// hanging requests.
    ///
    /// # Errors
    /// Fails when the database is unreachable.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn query_span(operation: &str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn attempt_from_row(row: &PgRow) -> Result<AttemptRecord> {
    let action: String = row.get("action");
    Ok(AttemptRecord {
        identifier: row.get("identifier"),
        action: RateLimitAction::from_str(&action).map_err(anyhow::Error::msg)?,
        success: row.get("success"),
        principal_id: row.get("principal_id"),
        created_at: row.get("created_at"),
        metadata: ClientMetadata {
            ip_address: row.get("ip_address"),
            user_agent: row.get("user_agent"),
        },
    })
}

fn session_from_row(row: &PgRow) -> SessionRow {
    SessionRow {
        id: row.get("id"),
        token_hash: row.get("token_hash"),
        principal_id: row.get("principal_id"),
        expires_at: row.get("expires_at"),
        last_activity: row.get("last_activity"),
        active: row.get("active"),
        metadata: ClientMetadata {
            ip_address: row.get("ip_address"),
            user_agent: row.get("user_agent"),
        },
        created_at: row.get("created_at"),
    }
}

fn principal_from_row(row: &PgRow) -> Principal {
    Principal {
        id: row.get("id"),
        email: row.get("email"),
        display_name: row.get("display_name"),
        verified_at: row.get("verified_at"),
        password_hash: row.get("password_hash"),
        password_set_at: row.get("password_set_at"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl AttemptStore for PgStore {
    async fn record(&self, attempt: AttemptRecord) -> Result<()> {
        let query = r"
            INSERT INTO auth_attempts
                (identifier, action, success, principal_id, ip_address, user_agent, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        sqlx::query(query)
            .bind(&attempt.identifier)
            .bind(attempt.action.as_str())
            .bind(attempt.success)
            .bind(attempt.principal_id)
            .bind(&attempt.metadata.ip_address)
            .bind(&attempt.metadata.user_agent)
            .bind(attempt.created_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to record attempt")?;
        Ok(())
    }

    async fn attempts_since(
        &self,
        identifier: &str,
        action: RateLimitAction,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>> {
        let query = r"
            SELECT identifier, action, success, principal_id, ip_address, user_agent, created_at
            FROM auth_attempts
            WHERE identifier = $1 AND action = $2 AND created_at >= $3
            ORDER BY created_at DESC
        ";
        let rows = sqlx::query(query)
            .bind(identifier)
            .bind(action.as_str())
            .bind(since)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to load attempts")?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM auth_attempts WHERE created_at < $1";
        let result = sqlx::query(query)
            .bind(cutoff)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to prune attempts")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert(&self, session: SessionRow) -> Result<bool> {
        let query = r"
            INSERT INTO sessions
                (id, token_hash, principal_id, expires_at, last_activity, active,
                 ip_address, user_agent, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";
        let result = sqlx::query(query)
            .bind(session.id)
            .bind(&session.token_hash)
            .bind(session.principal_id)
            .bind(session.expires_at)
            .bind(session.last_activity)
            .bind(session.active)
            .bind(&session.metadata.ip_address)
            .bind(&session.metadata.user_agent)
            .bind(session.created_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err).context("failed to insert session"),
        }
    }

    async fn find_by_token_hash(&self, token_hash: &[u8]) -> Result<Option<SessionRow>> {
        let query = "SELECT * FROM sessions WHERE token_hash = $1 LIMIT 1";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup session")?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn touch(
        &self,
        id: Uuid,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let query = "UPDATE sessions SET last_activity = $2, expires_at = $3 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(last_activity)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to touch session")?;
        Ok(())
    }

    async fn deactivate(&self, id: Uuid) -> Result<()> {
        let query = "UPDATE sessions SET active = FALSE WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to deactivate session")?;
        Ok(())
    }

    async fn deactivate_all_for(&self, principal_id: Uuid) -> Result<u64> {
        let query = "UPDATE sessions SET active = FALSE WHERE principal_id = $1 AND active";
        let result = sqlx::query(query)
            .bind(principal_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to deactivate sessions")?;
        Ok(result.rows_affected())
    }

    async fn active_for_principal(&self, principal_id: Uuid) -> Result<Vec<SessionRow>> {
        let query = r"
            SELECT * FROM sessions
            WHERE principal_id = $1 AND active
            ORDER BY last_activity ASC
        ";
        let rows = sqlx::query(query)
            .bind(principal_id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to list active sessions")?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    async fn append_event(&self, event: SessionActivityEvent) -> Result<()> {
        let detail = event
            .detail
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize event detail")?;
        let query = r"
            INSERT INTO session_events
                (session_id, action, ip_address, user_agent, detail, created_at)
            VALUES ($1, $2, $3, $4, $5::jsonb, $6)
        ";
        sqlx::query(query)
            .bind(event.session_id)
            .bind(event.action.as_str())
            .bind(&event.metadata.ip_address)
            .bind(&event.metadata.user_agent)
            .bind(detail)
            .bind(event.created_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to append session event")?;
        Ok(())
    }

    async fn recent_events(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> Result<Vec<SessionActivityEvent>> {
        let query = r"
            SELECT session_id, action, ip_address, user_agent, detail::text AS detail, created_at
            FROM session_events
            WHERE session_id = $1
            ORDER BY created_at DESC
            LIMIT $2
        ";
        let rows = sqlx::query(query)
            .bind(session_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to load session events")?;
        rows.iter()
            .map(|row| {
                let action: String = row.get("action");
                let detail: Option<String> = row.get("detail");
                Ok(SessionActivityEvent {
                    session_id: row.get("session_id"),
                    action: SessionAction::from_str(&action).map_err(anyhow::Error::msg)?,
                    created_at: row.get("created_at"),
                    metadata: ClientMetadata {
                        ip_address: row.get("ip_address"),
                        user_agent: row.get("user_agent"),
                    },
                    detail: detail
                        .map(|text| serde_json::from_str(&text))
                        .transpose()
                        .context("failed to parse event detail")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert(&self, token: TokenRow) -> Result<()> {
        let query = r"
            INSERT INTO verification_tokens
                (token_hash, identifier, kind, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
        ";
        sqlx::query(query)
            .bind(&token.token_hash)
            .bind(&token.identifier)
            .bind(token.kind.as_str())
            .bind(token.expires_at)
            .bind(token.created_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert verification token")?;
        Ok(())
    }

    async fn delete_for(&self, identifier: &str, kind: TokenKind) -> Result<u64> {
        let query = "DELETE FROM verification_tokens WHERE identifier = $1 AND kind = $2";
        let result = sqlx::query(query)
            .bind(identifier)
            .bind(kind.as_str())
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete verification tokens")?;
        Ok(result.rows_affected())
    }

    async fn take(&self, token_hash: &[u8]) -> Result<Option<TokenRow>> {
        // Single-statement delete+return keeps consumption atomic.
        let query = r"
            DELETE FROM verification_tokens
            WHERE token_hash = $1
            RETURNING token_hash, identifier, kind, expires_at, created_at
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to consume verification token")?;
        row.map(|row| {
            let kind: String = row.get("kind");
            Ok(TokenRow {
                token_hash: row.get("token_hash"),
                identifier: row.get("identifier"),
                kind: TokenKind::from_prefix(&kind)
                    .with_context(|| format!("unknown token kind: {kind}"))?,
                expires_at: row.get("expires_at"),
                created_at: row.get("created_at"),
            })
        })
        .transpose()
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM verification_tokens WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to sweep verification tokens")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PrincipalStore for PgStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>> {
        let query = "SELECT * FROM principals WHERE email = $1 LIMIT 1";
        let row = sqlx::query(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup principal by email")?;
        Ok(row.as_ref().map(principal_from_row))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>> {
        let query = "SELECT * FROM principals WHERE id = $1 LIMIT 1";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to lookup principal by id")?;
        Ok(row.as_ref().map(principal_from_row))
    }

    async fn insert(&self, principal: Principal) -> Result<bool> {
        let query = r"
            INSERT INTO principals
                (id, email, display_name, verified_at, password_hash, password_set_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        let result = sqlx::query(query)
            .bind(principal.id)
            .bind(&principal.email)
            .bind(&principal.display_name)
            .bind(principal.verified_at)
            .bind(&principal.password_hash)
            .bind(principal.password_set_at)
            .bind(principal.created_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err).context("failed to insert principal"),
        }
    }

    async fn set_verified(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let query = "UPDATE principals SET verified_at = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to set principal verified")?;
        Ok(())
    }

    async fn set_password(
        &self,
        id: Uuid,
        password_hash: &str,
        set_at: DateTime<Utc>,
    ) -> Result<()> {
        let query =
            "UPDATE principals SET password_hash = $2, password_set_at = $3 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(password_hash)
            .bind(set_at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to set principal password")?;
        Ok(())
    }
}

#[async_trait]
impl PasswordHistoryStore for PgStore {
    async fn recent(&self, principal_id: Uuid, limit: usize) -> Result<Vec<PasswordHistoryEntry>> {
        let query = r"
            SELECT principal_id, password_hash, created_at
            FROM password_history
            WHERE principal_id = $1
            ORDER BY created_at DESC
            LIMIT $2
        ";
        let rows = sqlx::query(query)
            .bind(principal_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to load password history")?;
        Ok(rows
            .iter()
            .map(|row| PasswordHistoryEntry {
                principal_id: row.get("principal_id"),
                password_hash: row.get("password_hash"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn push(&self, entry: PasswordHistoryEntry) -> Result<()> {
        let query = r"
            INSERT INTO password_history (principal_id, password_hash, created_at)
            VALUES ($1, $2, $3)
        ";
        sqlx::query(query)
            .bind(entry.principal_id)
            .bind(&entry.password_hash)
            .bind(entry.created_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to push password history entry")?;
        Ok(())
    }

    async fn prune(&self, principal_id: Uuid, keep: usize) -> Result<u64> {
        let query = r"
            DELETE FROM password_history
            WHERE principal_id = $1
              AND id NOT IN (
                  SELECT id FROM password_history
                  WHERE principal_id = $1
                  ORDER BY created_at DESC
                  LIMIT $2
              )
        ";
        let result = sqlx::query(query)
            .bind(principal_id)
            .bind(i64::try_from(keep).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to prune password history")?;
        Ok(result.rows_affected())
    }
}
