//! Authorization service
//!
//! Decides whether a principal may act and authenticates presented tokens.
//! Holds the static allow-list, the static token set and the principals
//! authenticated during this process lifetime, all behind one RwLock.

use crate::auth::lifecycle::TokenLifecycle;
use crate::auth::tokens::{redact, StaticTokens};
use crate::auth::{AuthError, Role};
use crate::clock::Clock;
use crate::storage::CredentialStore;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How `authorize_by_id` gates principals, fixed by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Allow-listed or authenticated principals only
    AllowList,
    /// Authenticated principals only
    TokenGated,
    /// Anyone
    Open,
}

struct AccessSets {
    allowed_ids: HashSet<i64>,
    static_tokens: StaticTokens,
    /// Cache of principals authenticated since process start. Never holds a
    /// principal that did not authenticate in this process.
    authenticated: HashSet<i64>,
}

pub struct AuthService {
    sets: RwLock<AccessSets>,
    default_role: Role,
    store: Option<Arc<dyn CredentialStore>>,
    tokens: Option<TokenLifecycle>,
}

impl AuthService {
    pub fn new(
        allowed_ids: impl IntoIterator<Item = i64>,
        static_tokens: StaticTokens,
        default_role: Role,
    ) -> Self {
        Self {
            sets: RwLock::new(AccessSets {
                allowed_ids: allowed_ids.into_iter().collect(),
                static_tokens,
                authenticated: HashSet::new(),
            }),
            default_role,
            store: None,
            tokens: None,
        }
    }

    /// Attach a credential store, enabling dynamic tokens and user persistence
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        self.tokens = Some(TokenLifecycle::new(store.clone(), clock));
        self.store = Some(store);
        self
    }

    pub fn default_role(&self) -> Role {
        self.default_role
    }

    pub fn token_lifecycle(&self) -> Option<&TokenLifecycle> {
        self.tokens.as_ref()
    }

    pub fn mode(&self) -> AccessMode {
        let sets = self.sets.read();
        if !sets.allowed_ids.is_empty() {
            AccessMode::AllowList
        } else if !sets.static_tokens.is_empty() {
            AccessMode::TokenGated
        } else {
            AccessMode::Open
        }
    }

    /// Decide whether `id` may act.
    ///
    /// A non-empty allow-list admits its members plus authenticated
    /// principals. Without one, configured static tokens require
    /// authentication. With neither, access is open.
    pub fn authorize_by_id(&self, id: i64) -> bool {
        let sets = self.sets.read();

        if !sets.allowed_ids.is_empty() {
            return sets.allowed_ids.contains(&id) || sets.authenticated.contains(&id);
        }

        if !sets.static_tokens.is_empty() {
            return sets.authenticated.contains(&id);
        }

        true
    }

    /// Whether `id` authenticated during this process lifetime
    pub fn is_authenticated(&self, id: i64) -> bool {
        self.sets.read().authenticated.contains(&id)
    }

    /// Authenticate `id` with a static or dynamic token, returning the role granted.
    ///
    /// Static tokens grant the default role. Dynamic tokens are consumed and
    /// grant their stored role. Every failure is `InvalidCredential` and leaves
    /// state untouched.
    pub async fn authenticate(&self, token: &str, id: i64) -> Result<Role, AuthError> {
        let static_hit = self.sets.read().static_tokens.matches(token);

        if static_hit {
            self.mark_authenticated(id);
            self.persist_user(id, self.default_role).await;
            info!(principal = id, role = %self.default_role, "Authenticated with static token");
            return Ok(self.default_role);
        }

        if let Some(tokens) = &self.tokens {
            match tokens.consume(token, id).await {
                Ok(role) => {
                    self.mark_authenticated(id);
                    self.persist_user(id, role).await;
                    info!(principal = id, role = %role, "Authenticated with issued token");
                    return Ok(role);
                }
                Err(AuthError::NotFound) => {}
                Err(e) => {
                    warn!(principal = id, error = %e, "Token consumption failed");
                }
            }
        }

        debug!(principal = id, token = %redact(token), "Authentication failed");
        Err(AuthError::InvalidCredential)
    }

    fn mark_authenticated(&self, id: i64) {
        self.sets.write().authenticated.insert(id);
    }

    // Best effort: authentication already succeeded in memory
    async fn persist_user(&self, id: i64, role: Role) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_user(id, role, true).await {
                warn!(principal = id, error = %e, "Failed to persist authenticated user");
            }
        }
    }
}
