//! Engine configuration from environment variables

use crate::auth::Role;
use crate::ratelimit::{FailureMode, RateLimitConfig, RoleLimits};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
}

/// Everything the access-control engine needs besides the store
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Principals granted access regardless of tokens
    pub allowed_ids: Vec<i64>,
    /// Tokens valid for the whole process lifetime
    pub static_tokens: Vec<String>,
    /// Role for principals authenticated by static token or first seen on access
    pub default_role: Role,
    pub rate_limit: RateLimitConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allowed_ids: Vec::new(),
            static_tokens: Vec::new(),
            default_role: Role::Free,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = RateLimitConfig::default();

        let default_role = match get("DEFAULT_ROLE") {
            Some(v) => Role::parse(&v).ok_or_else(|| invalid("DEFAULT_ROLE", &v))?,
            None => Role::Free,
        };

        let failure_mode = match get("RATE_LIMIT_ON_STORE_ERROR") {
            Some(v) => v
                .parse::<FailureMode>()
                .map_err(|_| invalid("RATE_LIMIT_ON_STORE_ERROR", &v))?,
            None => defaults.failure_mode,
        };

        let limits = RoleLimits {
            free: parse_or(get("RATE_LIMIT_FREE_PER_MIN"), "RATE_LIMIT_FREE_PER_MIN", defaults.limits.free)?,
            premium: parse_or(
                get("RATE_LIMIT_PREMIUM_PER_MIN"),
                "RATE_LIMIT_PREMIUM_PER_MIN",
                defaults.limits.premium,
            )?,
            admin: parse_or(get("RATE_LIMIT_ADMIN_PER_MIN"), "RATE_LIMIT_ADMIN_PER_MIN", defaults.limits.admin)?,
        };

        let throttle_secs = parse_or(
            get("THROTTLE_SECONDS"),
            "THROTTLE_SECONDS",
            defaults.throttle.as_secs(),
        )?;

        let default_timeout = defaults.store_timeout.map(|d| d.as_secs()).unwrap_or(0);
        let timeout_secs = parse_or(get("STORE_TIMEOUT_SECONDS"), "STORE_TIMEOUT_SECONDS", default_timeout)?;

        let mut static_tokens = Vec::new();
        for key in ["AUTH_TOKENS", "AUTH_TOKEN"] {
            if let Some(v) = get(key) {
                static_tokens.extend(parse_list(&v));
            }
        }

        Ok(Self {
            allowed_ids: get("ALLOWED_USER_IDS")
                .map(|v| parse_id_list(&v))
                .unwrap_or_default(),
            static_tokens,
            default_role,
            rate_limit: RateLimitConfig {
                limits,
                throttle: Duration::from_secs(throttle_secs),
                failure_mode,
                store_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            },
        })
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) => v.parse().map_err(|_| invalid(key, &v)),
        None => Ok(default),
    }
}

/// Split a comma-separated list, dropping blank entries
fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// Comma-separated principal IDs; entries that aren't integers are skipped
fn parse_id_list(s: &str) -> Vec<i64> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| match p.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(value = p, "Ignoring invalid ALLOWED_USER_IDS entry");
                None
            }
        })
        .collect()
}
