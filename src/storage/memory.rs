//! In-memory credential store

use crate::auth::Role;
use crate::clock::{Clock, SystemClock};
use crate::storage::{CredentialStore, NewToken, StorageError, TokenRecord, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct RateEvent {
    principal_id: i64,
    kind: String,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<i64, User>,
    tokens: HashMap<String, TokenRecord>,
    events: Vec<RateEvent>,
}

/// Store that keeps everything behind one mutex.
///
/// Every operation runs under the lock, so token consumption and
/// count-then-insert admission are trivially atomic.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` for row timestamps (`created_at`, `updated_at`)
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    /// Number of rate events recorded for a principal, regardless of age
    pub fn event_count(&self, id: i64) -> usize {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|e| e.principal_id == id)
            .count()
    }

    /// Action kinds of the principal's recorded events, oldest first
    pub fn event_kinds(&self, id: i64) -> Vec<String> {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|e| e.principal_id == id)
            .map(|e| e.kind.clone())
            .collect()
    }

    fn count_locked(inner: &Inner, id: i64, since: DateTime<Utc>) -> u64 {
        inner
            .events
            .iter()
            .filter(|e| e.principal_id == id && e.created_at >= since)
            .count() as u64
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn upsert_user(
        &self,
        id: i64,
        role: Role,
        is_authenticated: bool,
    ) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner
            .users
            .entry(id)
            .and_modify(|u| {
                u.role = role;
                u.is_authenticated = is_authenticated;
                u.updated_at = now;
            })
            .or_insert(User {
                id,
                role,
                is_authenticated,
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn get_user(&self, id: i64) -> Result<User, StorageError> {
        self.inner
            .lock()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("user {}", id)))
    }

    async fn create_token(&self, token: &NewToken) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.tokens.contains_key(&token.token) {
            return Err(StorageError::Conflict("token already exists".to_string()));
        }
        inner.tokens.insert(
            token.token.clone(),
            TokenRecord {
                token: token.token.clone(),
                role: token.role,
                expires_at: token.expires_at,
                consumed_at: None,
                issued_by: token.issued_by,
                issued_to: None,
                created_at: now,
            },
        );
        Ok(())
    }

    async fn get_token(&self, token: &str) -> Result<TokenRecord, StorageError> {
        self.inner
            .lock()
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| StorageError::NotFound("token".to_string()))
    }

    async fn consume_token(
        &self,
        token: &str,
        by: i64,
        at: DateTime<Utc>,
    ) -> Result<Role, StorageError> {
        let mut inner = self.inner.lock();
        let record = inner
            .tokens
            .get_mut(token)
            .ok_or_else(|| StorageError::NotFound("token".to_string()))?;

        if record.is_consumed() {
            return Err(StorageError::NotFound("token already consumed".to_string()));
        }
        if record.is_expired(at) {
            return Err(StorageError::NotFound("token expired".to_string()));
        }

        record.consumed_at = Some(at);
        record.issued_to = Some(by);
        debug!(principal = by, role = %record.role, "Consumed token");
        Ok(record.role)
    }

    async fn count_events_since(
        &self,
        id: i64,
        since: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        Ok(Self::count_locked(&self.inner.lock(), id, since))
    }

    async fn insert_rate_event(
        &self,
        id: i64,
        kind: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.inner.lock().events.push(RateEvent {
            principal_id: id,
            kind: kind.to_string(),
            created_at: at,
        });
        Ok(())
    }

    async fn record_event_within_limit(
        &self,
        id: i64,
        kind: &str,
        since: DateTime<Utc>,
        limit: u64,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        if Self::count_locked(&inner, id, since) >= limit {
            return Ok(false);
        }
        inner.events.push(RateEvent {
            principal_id: id,
            kind: kind.to_string(),
            created_at: at,
        });
        Ok(true)
    }
}
