//! Credential store backends
//!
//! - Postgres: durable storage for principals, issued tokens and the rate-event log
//! - Memory: process-local store with the same semantics (tests, store-less embedding)

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PostgresConfig, PostgresStore};

use crate::auth::Role;
pub use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store operation timed out")]
    Timeout,
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// A persisted principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub role: Role,
    pub is_authenticated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A token row to insert
#[derive(Debug, Clone)]
pub struct NewToken {
    pub token: String,
    pub role: Role,
    pub expires_at: Option<DateTime<Utc>>,
    pub issued_by: i64,
}

/// A persisted token (never deleted, doubles as audit trail)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenRecord {
    pub token: String,
    pub role: Role,
    pub expires_at: Option<DateTime<Utc>>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub issued_by: i64,
    pub issued_to: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }
}

/// Operations the engine issues against the credential store
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert the principal, or refresh its role and authentication flag
    async fn upsert_user(
        &self,
        id: i64,
        role: Role,
        is_authenticated: bool,
    ) -> Result<(), StorageError>;

    async fn get_user(&self, id: i64) -> Result<User, StorageError>;

    /// Persist a new unconsumed token. A duplicate token value is a `Conflict`.
    async fn create_token(&self, token: &NewToken) -> Result<(), StorageError>;

    async fn get_token(&self, token: &str) -> Result<TokenRecord, StorageError>;

    /// Atomically consume a token on behalf of `by`, returning its role.
    ///
    /// Unknown, already consumed and expired (relative to `at`) tokens are all
    /// `NotFound`. Of any number of concurrent calls for one token at most one
    /// succeeds.
    async fn consume_token(
        &self,
        token: &str,
        by: i64,
        at: DateTime<Utc>,
    ) -> Result<Role, StorageError>;

    /// Number of rate events for the principal with `created_at >= since`
    async fn count_events_since(&self, id: i64, since: DateTime<Utc>)
        -> Result<u64, StorageError>;

    async fn insert_rate_event(
        &self,
        id: i64,
        kind: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Count events since `since` and, if fewer than `limit`, append one.
    ///
    /// Returns whether the event was recorded. This default runs the two steps
    /// separately, so concurrent bursts from one principal may overshoot the
    /// limit; backends override it to make the pair atomic.
    async fn record_event_within_limit(
        &self,
        id: i64,
        kind: &str,
        since: DateTime<Utc>,
        limit: u64,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let count = self.count_events_since(id, since).await?;
        if count >= limit {
            return Ok(false);
        }
        self.insert_rate_event(id, kind, at).await?;
        Ok(true)
    }
}
