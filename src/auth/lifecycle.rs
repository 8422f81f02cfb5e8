//! Single-use token issuance and consumption

use crate::auth::tokens::{generate_token, redact};
use crate::auth::{AuthError, Role};
use crate::clock::Clock;
use crate::storage::{CredentialStore, NewToken, StorageError};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A freshly minted token
#[derive(Clone)]
pub struct IssuedToken {
    pub token: String,
    pub role: Role,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Display for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &redact(&self.token))
            .field("role", &self.role)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Mints and consumes store-backed tokens
#[derive(Clone)]
pub struct TokenLifecycle {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
}

impl TokenLifecycle {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Mint and persist a new token.
    ///
    /// `ttl` of `None` never expires; a non-positive `ttl` yields a token that
    /// is already expired. A collision with an existing token surfaces as
    /// `StorageError::Conflict`.
    pub async fn issue(
        &self,
        role: Role,
        ttl: Option<Duration>,
        issued_by: i64,
    ) -> Result<IssuedToken, AuthError> {
        let expires_at = ttl.map(|ttl| self.clock.now() + ttl);
        let token = generate_token();

        self.store
            .create_token(&NewToken {
                token: token.clone(),
                role,
                expires_at,
                issued_by,
            })
            .await
            .map_err(|e| {
                warn!(issued_by, error = %e, "Token issuance failed");
                AuthError::Store(e)
            })?;

        info!(issued_by, role = %role, expires_at = ?expires_at, token = %redact(&token), "Issued token");
        Ok(IssuedToken {
            token,
            role,
            expires_at,
        })
    }

    /// Spend a token on behalf of `by`, returning the role it grants.
    ///
    /// Unknown, spent and expired tokens are `NotFound`; store failures are
    /// `Store`. Either way nothing was consumed.
    pub async fn consume(&self, token: &str, by: i64) -> Result<Role, AuthError> {
        match self.store.consume_token(token, by, self.clock.now()).await {
            Ok(role) => Ok(role),
            Err(StorageError::NotFound(reason)) => {
                debug!(principal = by, token = %redact(token), reason = %reason, "Token rejected");
                Err(AuthError::NotFound)
            }
            Err(e) => Err(AuthError::Store(e)),
        }
    }
}
