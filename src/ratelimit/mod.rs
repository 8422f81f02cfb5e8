//! Role-tiered rate limiting
//!
//! Each admission pays a fixed throttle delay, then counts the principal's
//! rate events in the trailing one-minute window. Below the role's quota an
//! event is appended and the action admitted; at or above it the action is
//! refused and nothing is recorded.

use crate::auth::Role;
use crate::clock::{Clock, SystemClock};
use crate::storage::{CredentialStore, StorageError, User};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Length of the sliding window
pub const WINDOW: Duration = Duration::from_secs(60);

/// Per-minute quotas by role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleLimits {
    pub free: u32,
    pub premium: u32,
    pub admin: u32,
}

impl RoleLimits {
    pub fn for_role(&self, role: Role) -> u32 {
        match role {
            Role::Free => self.free,
            Role::Premium => self.premium,
            Role::Admin => self.admin,
        }
    }
}

impl Default for RoleLimits {
    fn default() -> Self {
        Self {
            free: 10,
            premium: 60,
            admin: 500,
        }
    }
}

/// Outcome of a rate check with the failure policy applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admitted,
    /// Quota exhausted
    Limited,
    /// The store failed and the policy is closed
    Unavailable,
}

/// What to do when the store cannot answer an admission check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Admit the action
    #[default]
    Open,
    /// Refuse the action
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid failure mode: '{0}' (expected open or closed)")]
pub struct InvalidFailureMode(pub String);

impl FromStr for FailureMode {
    type Err = InvalidFailureMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(FailureMode::Open),
            "closed" => Ok(FailureMode::Closed),
            _ => Err(InvalidFailureMode(s.to_string())),
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureMode::Open => write!(f, "open"),
            FailureMode::Closed => write!(f, "closed"),
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub limits: RoleLimits,
    /// Delay every check pays before counting
    pub throttle: Duration,
    pub failure_mode: FailureMode,
    /// Bound on the store round trip of one check; the throttle delay is not included
    pub store_timeout: Option<Duration>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limits: RoleLimits::default(),
            throttle: Duration::from_secs(2),
            failure_mode: FailureMode::Open,
            store_timeout: Some(Duration::from_secs(10)),
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn CredentialStore>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CredentialStore>, config: RateLimitConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CredentialStore>,
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether `user` may perform one action of `kind`.
    ///
    /// Store failures are returned as-is; see [`RateLimiter::admit`] for the
    /// policy-applied variant.
    pub async fn allow(&self, user: &User, kind: &str) -> Result<bool, StorageError> {
        let limit = u64::from(self.config.limits.for_role(user.role));

        if !self.config.throttle.is_zero() {
            tokio::time::sleep(self.config.throttle).await;
        }

        let now = self.clock.now();
        let since = now - chrono::Duration::seconds(WINDOW.as_secs() as i64);
        let check = self
            .store
            .record_event_within_limit(user.id, kind, since, limit, now);

        let allowed = match self.config.store_timeout {
            Some(bound) => tokio::time::timeout(bound, check)
                .await
                .map_err(|_| StorageError::Timeout)??,
            None => check.await?,
        };

        if !allowed {
            debug!(principal = user.id, role = %user.role, kind, limit, "Rate limit reached");
        }
        Ok(allowed)
    }

    /// Like [`RateLimiter::allow`], resolving store failures with the
    /// configured [`FailureMode`].
    pub async fn admit(&self, user: &User, kind: &str) -> Verdict {
        match self.allow(user, kind).await {
            Ok(true) => Verdict::Admitted,
            Ok(false) => Verdict::Limited,
            Err(e) => match self.config.failure_mode {
                FailureMode::Open => {
                    warn!(principal = user.id, kind, error = %e, "Rate check failed, admitting");
                    Verdict::Admitted
                }
                FailureMode::Closed => {
                    error!(principal = user.id, kind, error = %e, "Rate check failed, refusing");
                    Verdict::Unavailable
                }
            },
        }
    }
}
