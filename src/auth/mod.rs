//! Authentication and authorization
//!
//! Credential kinds:
//! - Static tokens: configured at startup, shared, valid for the process lifetime
//! - Issued tokens: minted at runtime, persisted, consumable exactly once
//!
//! Roles:
//! - `free`, `premium`, `admin`: select the principal's rate quota

mod error;
mod lifecycle;
mod roles;
mod service;
mod tokens;

pub use error::AuthError;
pub use lifecycle::{IssuedToken, TokenLifecycle};
pub use roles::{InvalidRole, Role};
pub use service::{AccessMode, AuthService};
pub use tokens::{generate_token, redact, StaticTokens, TOKEN_ALPHABET, TOKEN_LEN};
