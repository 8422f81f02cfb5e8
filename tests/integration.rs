//! Integration tests for the access engine
//!
//! These tests drive the public API against the in-memory store and verify
//! behavior under concurrent use.

use chrono::Duration;
use proxygate::clock::ManualClock;
use proxygate::ratelimit::{RateLimitConfig, RateLimiter, RoleLimits};
use proxygate::storage::{CredentialStore, MemoryStore, User};
use proxygate::{Admission, AuthError, Engine, EngineConfig, Role};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn config(allowed: &[i64], tokens: &[&str]) -> EngineConfig {
    EngineConfig {
        allowed_ids: allowed.to_vec(),
        static_tokens: tokens.iter().map(|t| t.to_string()).collect(),
        default_role: Role::Free,
        rate_limit: RateLimitConfig {
            limits: RoleLimits {
                free: 3,
                premium: 6,
                admin: 12,
            },
            throttle: std::time::Duration::ZERO,
            ..Default::default()
        },
    }
}

fn engine_with_store(allowed: &[i64], tokens: &[&str]) -> (Arc<Engine>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(
        &config(allowed, tokens),
        Some(store.clone() as Arc<dyn CredentialStore>),
    );
    (Arc::new(engine), store)
}

fn user(id: i64, role: Role) -> User {
    let now = chrono::Utc::now();
    User {
        id,
        role,
        is_authenticated: true,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumption_succeeds_once() {
    let (engine, store) = engine_with_store(&[1], &[]);
    let issued = engine.issue(Role::Premium, None, 1).await.unwrap();

    let winners = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    // 100 principals race for the same token
    for principal in 100..200 {
        let engine = engine.clone();
        let token = issued.token.clone();
        let winners = winners.clone();
        handles.push(tokio::spawn(async move {
            match engine.authenticate(&token, principal).await {
                Ok(role) => {
                    assert_eq!(role, Role::Premium);
                    winners.fetch_add(1, Ordering::SeqCst);
                    Some(principal)
                }
                Err(AuthError::InvalidCredential) => None,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }));
    }

    let mut winner = None;
    for handle in handles {
        if let Some(p) = handle.await.unwrap() {
            winner = Some(p);
        }
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    let winner = winner.unwrap();

    // Only the winner gained access or a user record
    let record = store.get_token(&issued.token).await.unwrap();
    assert_eq!(record.issued_to, Some(winner));
    for principal in 100..200 {
        assert_eq!(engine.authorize_by_id(principal), principal == winner);
        assert_eq!(store.get_user(principal).await.is_ok(), principal == winner);
    }

    // Later attempts keep failing
    assert!(matches!(
        engine.authenticate(&issued.token, winner).await,
        Err(AuthError::InvalidCredential)
    ));
}

#[tokio::test]
async fn test_issued_token_scenario() {
    let (engine, store) = engine_with_store(&[1], &[]);

    // Admin issues a premium token with no expiry
    let issued = engine.issue(Role::Premium, None, 1).await.unwrap();
    assert!(issued.expires_at.is_none());

    assert_eq!(engine.authenticate(&issued.token, 42).await.unwrap(), Role::Premium);
    let user = store.get_user(42).await.unwrap();
    assert_eq!(user.role, Role::Premium);
    assert!(user.is_authenticated);

    assert!(matches!(
        engine.authenticate(&issued.token, 99).await,
        Err(AuthError::InvalidCredential)
    ));
    assert!(!engine.authorize_by_id(99));
}

#[tokio::test]
async fn test_already_expired_token() {
    let (engine, _) = engine_with_store(&[1], &[]);
    let issued = engine
        .issue(Role::Admin, Some(Duration::seconds(-1)), 1)
        .await
        .unwrap();

    for principal in [42, 43, 44] {
        assert!(matches!(
            engine.authenticate(&issued.token, principal).await,
            Err(AuthError::InvalidCredential)
        ));
    }
}

#[tokio::test]
async fn test_allow_list_scenario() {
    let engine = Engine::new(&config(&[1, 2], &[]), None);

    assert!(engine.authorize_by_id(1));
    assert!(engine.authorize_by_id(2));
    assert!(!engine.authorize_by_id(3));
    assert!(!engine.authorize_by_id(3));
    assert_eq!(engine.request_access(3).await, Admission::Denied);
}

#[tokio::test]
async fn test_static_token_supplements_allow_list() {
    let engine = Engine::new(&config(&[1, 2], &["open-sesame"]), None);

    assert!(!engine.authorize_by_id(77));
    assert!(matches!(
        engine.authenticate("wrong", 77).await,
        Err(AuthError::InvalidCredential)
    ));
    assert!(!engine.authorize_by_id(77));

    engine.authenticate("open-sesame", 77).await.unwrap();
    assert!(engine.authorize_by_id(77));
}

#[tokio::test]
async fn test_denial_and_bad_credential_look_alike() {
    let (engine, _) = engine_with_store(&[1], &[]);
    let issued = engine.issue(Role::Free, None, 1).await.unwrap();
    engine.authenticate(&issued.token, 10).await.unwrap();

    let unknown = engine.authenticate("no-such-token", 11).await.unwrap_err();
    let spent = engine.authenticate(&issued.token, 11).await.unwrap_err();
    assert_eq!(unknown.to_string(), spent.to_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_authorize_while_authenticating() {
    let engine = Arc::new(Engine::new(&config(&[], &["shared"]), None));
    let mut handles = vec![];

    for principal in 0..50 {
        let authing = engine.clone();
        handles.push(tokio::spawn(async move {
            // Never a false positive before authenticating
            assert!(!authing.authorize_by_id(principal));
            authing.authenticate("shared", principal).await.unwrap();
            assert!(authing.authorize_by_id(principal));
        }));

        let reader = engine.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..100 {
                let _ = reader.authorize_by_id(principal + 1_000);
            }
            assert!(!reader.authorize_by_id(principal + 1_000));
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_burst_respects_quota() {
    let store = Arc::new(MemoryStore::new());
    let limiter = Arc::new(RateLimiter::new(
        store.clone(),
        config(&[], &[]).rate_limit,
    ));

    let admitted = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];
    for _ in 0..50 {
        let limiter = limiter.clone();
        let admitted = admitted.clone();
        handles.push(tokio::spawn(async move {
            if limiter.allow(&user(5, Role::Premium), "proxy").await.unwrap() {
                admitted.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 6);
    assert_eq!(store.event_count(5), 6);
}

#[tokio::test]
async fn test_rate_limit_sliding_window_scenario() {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let engine = Engine::with_clock(
        &config(&[], &[]),
        Some(store.clone() as Arc<dyn CredentialStore>),
        clock.clone(),
    );
    let u = user(8, Role::Free);

    let mut results = vec![];
    for _ in 0..4 {
        results.push(engine.allow(&u, "proxy").await.unwrap());
        clock.advance(Duration::seconds(1));
    }
    assert_eq!(results, vec![true, true, true, false]);

    // 61s after the first call
    clock.advance(Duration::seconds(57));
    assert!(engine.allow(&u, "proxy").await.unwrap());
}
