//! Opaque access tokens
//!
//! Tokens are 24 characters drawn from `[0-9a-zA-Z]`. Dynamic tokens are
//! minted at runtime and persisted; static tokens come from configuration
//! and stay valid for the process lifetime.

use rand::rngs::OsRng;
use rand::TryRngCore;
use std::collections::HashSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Token alphabet (base62)
pub const TOKEN_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Length of a generated token
pub const TOKEN_LEN: usize = 24;

// Largest multiple of the alphabet size that fits in a byte. Bytes at or
// above it are rejected so every symbol is equally likely.
const REJECT_FROM: u8 = (256 / TOKEN_ALPHABET.len() * TOKEN_ALPHABET.len()) as u8;

/// Generate a fresh random token.
///
/// Draws from the operating system's entropy source. If that source fails,
/// falls back to a time-derived token and logs a warning.
pub fn generate_token() -> String {
    match try_generate(&mut OsRng) {
        Some(token) => token,
        None => {
            warn!("OS entropy source unavailable, using time-derived token");
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default();
            fallback_token(nanos)
        }
    }
}

fn try_generate<R: TryRngCore>(rng: &mut R) -> Option<String> {
    let mut out = String::with_capacity(TOKEN_LEN);
    let mut buf = [0u8; 32];

    while out.len() < TOKEN_LEN {
        rng.try_fill_bytes(&mut buf).ok()?;
        for &b in buf.iter().filter(|&&b| b < REJECT_FROM) {
            if out.len() == TOKEN_LEN {
                break;
            }
            out.push(TOKEN_ALPHABET[b as usize % TOKEN_ALPHABET.len()] as char);
        }
    }

    Some(out)
}

/// Deterministic, non-cryptographic token derived from a seed
fn fallback_token(seed: u64) -> String {
    (0..TOKEN_LEN as u64)
        .map(|i| {
            let idx = seed.wrapping_add(i) % TOKEN_ALPHABET.len() as u64;
            TOKEN_ALPHABET[idx as usize] as char
        })
        .collect()
}

/// Shortened form safe to put in logs
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}…", prefix)
}

/// Constant-time string comparison
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Statically configured tokens, shared by all holders
#[derive(Clone, Default)]
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    /// Build from configured values; blank entries are ignored
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens = tokens
            .into_iter()
            .map(Into::into)
            .filter(|t| !t.trim().is_empty())
            .collect();
        Self { tokens }
    }

    /// Exact, case-sensitive match against every configured token
    pub fn matches(&self, token: &str) -> bool {
        // Compare against all entries so timing doesn't reveal which one hit
        self.tokens
            .iter()
            .fold(false, |hit, t| constant_time_eq(t, token) | hit)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}

impl fmt::Debug for StaticTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StaticTokens([REDACTED; {}])", self.tokens.len())
    }
}
