//! Proxygate - access control and rate limiting for a gated proxy endpoint
//!
//! Decides, per numeric principal, whether it may act at all (allow-list and
//! token authentication), mints and consumes single-use tokens exactly once,
//! and enforces role-tiered per-minute quotas over a sliding window.

pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod ratelimit;
pub mod storage;

pub use auth::{AccessMode, AuthError, AuthService, IssuedToken, Role, TokenLifecycle};
pub use config::EngineConfig;
pub use engine::{Admission, Engine, PrincipalStatus};
pub use ratelimit::{FailureMode, RateLimiter, Verdict};
pub use storage::{CredentialStore, MemoryStore, PostgresStore, StorageError};
