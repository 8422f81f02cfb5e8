//! Access-control engine
//!
//! One `Engine` is constructed at startup and shared (behind an `Arc`) by
//! every request handler. It owns the authorization state, the token
//! lifecycle and the rate limiter, and is the only way the transport layer
//! touches them.

use crate::auth::{AccessMode, AuthError, AuthService, IssuedToken, Role, StaticTokens};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::ratelimit::{FailureMode, RateLimiter, Verdict};
use crate::storage::{CredentialStore, StorageError, TokenRecord, User};
use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Action kind recorded for proxy access requests
pub const PROXY_ACTION: &str = "proxy";

/// Outcome of a gated access request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Principal may not act at all
    Denied,
    /// Principal exceeded its quota
    Throttled,
    /// The store could not answer and the failure policy is closed
    Unavailable,
}

/// What the engine knows about a principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrincipalStatus {
    pub principal: i64,
    pub authorized: bool,
    pub role: Role,
    pub is_authenticated: bool,
}

pub struct Engine {
    auth: AuthService,
    limiter: Option<RateLimiter>,
    store: Option<Arc<dyn CredentialStore>>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Build the engine. Without a store only static credentials work and no
    /// rate limiting is applied.
    pub fn new(config: &EngineConfig, store: Option<Arc<dyn CredentialStore>>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &EngineConfig,
        store: Option<Arc<dyn CredentialStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut auth = AuthService::new(
            config.allowed_ids.iter().copied(),
            StaticTokens::new(config.static_tokens.iter().cloned()),
            config.default_role,
        );
        let mut limiter = None;

        if let Some(store) = &store {
            auth = auth.with_store(store.clone(), clock.clone());
            limiter = Some(RateLimiter::with_clock(
                store.clone(),
                config.rate_limit.clone(),
                clock.clone(),
            ));
        }

        info!(
            mode = ?auth.mode(),
            allow_listed = config.allowed_ids.len(),
            static_tokens = config.static_tokens.len(),
            store = store.is_some(),
            "Access engine ready"
        );

        Self {
            auth,
            limiter,
            store,
            clock,
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.auth.mode()
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn authorize_by_id(&self, id: i64) -> bool {
        self.auth.authorize_by_id(id)
    }

    /// Authenticate `id` with a static or issued token
    pub async fn authenticate(&self, token: &str, id: i64) -> Result<Role, AuthError> {
        self.auth.authenticate(token, id).await
    }

    /// Mint a single-use token on behalf of `issued_by`.
    ///
    /// The issuer must itself pass `authorize_by_id`.
    pub async fn issue(
        &self,
        role: Role,
        ttl: Option<Duration>,
        issued_by: i64,
    ) -> Result<IssuedToken, AuthError> {
        if !self.auth.authorize_by_id(issued_by) {
            warn!(principal = issued_by, "Token issuance denied");
            return Err(AuthError::AccessDenied);
        }
        let tokens = self.auth.token_lifecycle().ok_or(AuthError::StoreUnavailable)?;
        tokens.issue(role, ttl, issued_by).await
    }

    /// Rate-check one action of `kind` for `user`.
    ///
    /// Always admits when no store is attached.
    pub async fn allow(&self, user: &User, kind: &str) -> Result<bool, StorageError> {
        match &self.limiter {
            Some(limiter) => limiter.allow(user, kind).await,
            None => Ok(true),
        }
    }

    /// Full gate for a proxy access request: authorization, then quota.
    ///
    /// A principal with no stored record is created with the default role on
    /// its first request.
    pub async fn request_access(&self, id: i64) -> Admission {
        if !self.auth.authorize_by_id(id) {
            warn!(principal = id, "Access denied");
            return Admission::Denied;
        }

        let (Some(store), Some(limiter)) = (&self.store, &self.limiter) else {
            return Admission::Granted;
        };

        let role = self.auth.default_role();
        let user = match store.get_user(id).await {
            Ok(user) => user,
            Err(e) if e.is_not_found() => {
                if let Err(e) = store.upsert_user(id, role, true).await {
                    warn!(principal = id, error = %e, "Failed to create user record");
                }
                self.new_user(id, role)
            }
            Err(e) => match limiter.config().failure_mode {
                FailureMode::Open => {
                    // Quota falls back to the default role's
                    warn!(principal = id, error = %e, "Failed to load user");
                    self.new_user(id, role)
                }
                FailureMode::Closed => {
                    error!(principal = id, error = %e, "Failed to load user, refusing");
                    return Admission::Unavailable;
                }
            },
        };

        match limiter.admit(&user, PROXY_ACTION).await {
            Verdict::Admitted => {
                info!(principal = id, "Access granted");
                Admission::Granted
            }
            Verdict::Limited => Admission::Throttled,
            Verdict::Unavailable => Admission::Unavailable,
        }
    }

    /// Snapshot of a principal's authorization and stored role
    pub async fn status(&self, id: i64) -> PrincipalStatus {
        let authorized = self.auth.authorize_by_id(id);
        let mut status = PrincipalStatus {
            principal: id,
            authorized,
            role: self.auth.default_role(),
            is_authenticated: self.auth.is_authenticated(id),
        };

        if let Some(store) = &self.store {
            match store.get_user(id).await {
                Ok(user) => {
                    status.role = user.role;
                    status.is_authenticated = user.is_authenticated;
                }
                Err(e) if e.is_not_found() => status.is_authenticated = false,
                Err(e) => warn!(principal = id, error = %e, "Failed to load user"),
            }
        }

        status
    }

    fn new_user(&self, id: i64, role: Role) -> User {
        let now = self.clock.now();
        User {
            id,
            role,
            is_authenticated: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up an issued token for auditing
    pub async fn token(&self, token: &str) -> Result<TokenRecord, AuthError> {
        let store = self.store.as_ref().ok_or(AuthError::StoreUnavailable)?;
        store.get_token(token).await.map_err(|e| match e {
            StorageError::NotFound(_) => AuthError::NotFound,
            e => AuthError::Store(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{RateLimitConfig, RoleLimits};
    use crate::storage::{async_trait, MemoryStore, NewToken};
    use chrono::{DateTime, Utc};

    /// Store that is unreachable, optionally still serving user lookups
    struct DownStore {
        users_ok: bool,
    }

    fn down<T>() -> Result<T, StorageError> {
        Err(StorageError::Database("down".to_string()))
    }

    #[async_trait]
    impl CredentialStore for DownStore {
        async fn upsert_user(&self, _: i64, _: Role, _: bool) -> Result<(), StorageError> {
            down()
        }

        async fn get_user(&self, id: i64) -> Result<User, StorageError> {
            if !self.users_ok {
                return down();
            }
            let now = Utc::now();
            Ok(User {
                id,
                role: Role::Admin,
                is_authenticated: true,
                created_at: now,
                updated_at: now,
            })
        }

        async fn create_token(&self, _: &NewToken) -> Result<(), StorageError> {
            down()
        }

        async fn get_token(&self, _: &str) -> Result<TokenRecord, StorageError> {
            down()
        }

        async fn consume_token(&self, _: &str, _: i64, _: DateTime<Utc>) -> Result<Role, StorageError> {
            down()
        }

        async fn count_events_since(&self, _: i64, _: DateTime<Utc>) -> Result<u64, StorageError> {
            down()
        }

        async fn insert_rate_event(&self, _: i64, _: &str, _: DateTime<Utc>) -> Result<(), StorageError> {
            down()
        }
    }

    fn down_engine(users_ok: bool, failure_mode: FailureMode) -> Engine {
        let mut cfg = config(&[1], &[]);
        cfg.rate_limit.failure_mode = failure_mode;
        Engine::new(&cfg, Some(Arc::new(DownStore { users_ok }) as Arc<dyn CredentialStore>))
    }

    fn config(allowed: &[i64], tokens: &[&str]) -> EngineConfig {
        EngineConfig {
            allowed_ids: allowed.to_vec(),
            static_tokens: tokens.iter().map(|t| t.to_string()).collect(),
            default_role: Role::Free,
            rate_limit: RateLimitConfig {
                limits: RoleLimits {
                    free: 2,
                    premium: 4,
                    admin: 8,
                },
                throttle: std::time::Duration::ZERO,
                ..Default::default()
            },
        }
    }

    fn engine(allowed: &[i64], tokens: &[&str]) -> (Engine, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let engine = Engine::with_clock(
            &config(allowed, tokens),
            Some(store.clone() as Arc<dyn CredentialStore>),
            clock.clone(),
        );
        (engine, store, clock)
    }

    #[tokio::test]
    async fn test_storeless_engine() {
        let engine = Engine::new(&config(&[1], &["secret"]), None);
        assert!(!engine.has_store());
        assert_eq!(engine.mode(), AccessMode::AllowList);

        assert_eq!(engine.request_access(1).await, Admission::Granted);
        assert_eq!(engine.request_access(2).await, Admission::Denied);

        assert!(matches!(
            engine.issue(Role::Premium, None, 1).await,
            Err(AuthError::StoreUnavailable)
        ));

        engine.authenticate("secret", 2).await.unwrap();
        assert_eq!(engine.request_access(2).await, Admission::Granted);
    }

    #[tokio::test]
    async fn test_issue_requires_authorized_issuer() {
        let (engine, _, _) = engine(&[1], &[]);
        assert!(matches!(
            engine.issue(Role::Admin, None, 2).await,
            Err(AuthError::AccessDenied)
        ));
        assert!(engine.issue(Role::Admin, None, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_issue_then_authenticate() {
        let (engine, store, _) = engine(&[1], &[]);
        let issued = engine
            .issue(Role::Premium, Some(Duration::hours(1)), 1)
            .await
            .unwrap();

        assert_eq!(engine.authenticate(&issued.token, 42).await.unwrap(), Role::Premium);
        assert!(engine.authorize_by_id(42));
        assert_eq!(store.get_user(42).await.unwrap().role, Role::Premium);

        let record = engine.token(&issued.token).await.unwrap();
        assert_eq!(record.issued_by, 1);
        assert_eq!(record.issued_to, Some(42));
        assert!(matches!(engine.token("missing").await, Err(AuthError::NotFound)));
    }

    #[tokio::test]
    async fn test_request_access_creates_user_and_limits() {
        let (engine, store, clock) = engine(&[1], &[]);

        assert_eq!(engine.request_access(1).await, Admission::Granted);
        let user = store.get_user(1).await.unwrap();
        assert_eq!(user.role, Role::Free);
        assert!(user.is_authenticated);

        assert_eq!(engine.request_access(1).await, Admission::Granted);
        assert_eq!(engine.request_access(1).await, Admission::Throttled);

        clock.advance(Duration::seconds(61));
        assert_eq!(engine.request_access(1).await, Admission::Granted);
        assert_eq!(store.event_kinds(1)[0], PROXY_ACTION);
    }

    #[tokio::test]
    async fn test_request_access_uses_stored_role() {
        let (engine, store, _) = engine(&[], &[]);
        store.upsert_user(5, Role::Premium, true).await.unwrap();

        for _ in 0..4 {
            assert_eq!(engine.request_access(5).await, Admission::Granted);
        }
        assert_eq!(engine.request_access(5).await, Admission::Throttled);
    }

    #[tokio::test]
    async fn test_request_access_denied_records_nothing() {
        let (engine, store, _) = engine(&[1], &[]);
        assert_eq!(engine.request_access(9).await, Admission::Denied);
        assert_eq!(store.event_count(9), 0);
        assert!(store.get_user(9).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_status() {
        let (engine, _, _) = engine(&[1], &["secret"]);

        let status = engine.status(7).await;
        assert_eq!(
            status,
            PrincipalStatus {
                principal: 7,
                authorized: false,
                role: Role::Free,
                is_authenticated: false,
            }
        );

        engine.authenticate("secret", 7).await.unwrap();
        let status = engine.status(7).await;
        assert!(status.authorized);
        assert!(status.is_authenticated);
    }

    #[tokio::test]
    async fn test_allow_without_store_admits() {
        let engine = Engine::new(&config(&[], &[]), None);
        assert!(engine.allow(&engine.new_user(1, Role::Free), PROXY_ACTION).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_down_fail_closed_is_unavailable() {
        let engine = down_engine(false, FailureMode::Closed);
        assert_eq!(engine.request_access(1).await, Admission::Unavailable);

        // Authorization is still decided before the store is touched
        assert_eq!(engine.request_access(2).await, Admission::Denied);
    }

    #[tokio::test]
    async fn test_rate_check_down_fail_closed_is_unavailable() {
        let engine = down_engine(true, FailureMode::Closed);
        assert_eq!(engine.request_access(1).await, Admission::Unavailable);
    }

    #[tokio::test]
    async fn test_store_down_fail_open_grants() {
        let engine = down_engine(false, FailureMode::Open);
        assert_eq!(engine.request_access(1).await, Admission::Granted);

        let engine = down_engine(true, FailureMode::Open);
        assert_eq!(engine.request_access(1).await, Admission::Granted);
    }

    #[tokio::test]
    async fn test_new_user_takes_injected_time() {
        let (engine, _, clock) = engine(&[], &[]);
        clock.advance(Duration::days(3));
        let user = engine.new_user(4, Role::Premium);
        assert_eq!(user.created_at, clock.now());
        assert_eq!(user.updated_at, clock.now());
    }
}
