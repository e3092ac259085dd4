use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use starberry_as::oauth_core::crypto::pkce_code_challenge;
use starberry_as::{
    Algorithm, CodeExchange, GrantFault, GrantMachine, GrantPolicy, GrantState, InMemorySessionStore, KeySet,
    OAuthError, RefreshPolicy, SigningKey, TokenCodec, TokenKind,
};

const REDIRECT: &str = "https://client.example/cb";
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

fn machine(policy: GrantPolicy) -> (GrantMachine, Arc<InMemorySessionStore>) {
    let keys = KeySet::new(SigningKey::generate("op0", Algorithm::HS256).unwrap()).unwrap();
    let codec = TokenCodec::new(Arc::new(keys), "https://as.example.com");
    let store = Arc::new(InMemorySessionStore::new());
    (GrantMachine::new(store.clone(), codec, policy), store)
}

fn scope() -> BTreeSet<String> {
    ["openid".to_string(), "profile".to_string()].into()
}

/// Starts a grant for `C1` and returns `(grant_id, code)`.
async fn authorized(machine: &GrantMachine, challenge: Option<String>) -> (String, String) {
    let grant = machine.start("C1", scope(), "alice", REDIRECT, challenge).await.unwrap();
    let code = machine.issue_code(&grant.id).await.unwrap();
    assert_eq!(code.kind, TokenKind::Code);
    (grant.id, code.value)
}

fn exchange(code: &str) -> CodeExchange {
    CodeExchange {
        code: code.to_string(),
        client_id: "C1".into(),
        redirect_uri: Some(REDIRECT.into()),
        code_verifier: None,
        with_refresh: true,
    }
}

#[tokio::test]
async fn test_code_exchange_moves_grant_to_token_issued() {
    let (machine, _) = machine(GrantPolicy::default());
    let (grant_id, code) = authorized(&machine, None).await;
    assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::CodeIssued);

    let tokens = machine.exchange_code(exchange(&code)).await.unwrap();
    assert_eq!(tokens.grant_id, grant_id);
    assert_eq!(tokens.scope, scope());
    assert!(tokens.refresh.is_some());
    assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::TokenIssued);

    let info = machine.introspect(&tokens.access.value).await;
    assert!(info.active);
    assert_eq!(info.sub.as_deref(), Some("alice"));
    assert_eq!(info.scope.as_deref(), Some("openid profile"));

    // The spent code no longer introspects as active.
    assert!(!machine.introspect(&code).await.active);
}

#[tokio::test]
async fn test_issue_code_only_once() {
    let (machine, _) = machine(GrantPolicy::default());
    let (grant_id, _) = authorized(&machine, None).await;
    let err = machine.issue_code(&grant_id).await.unwrap_err();
    assert_eq!(err, OAuthError::InvalidGrant(GrantFault::WrongState));
}

#[tokio::test]
async fn test_code_replay_is_rejected() {
    let (machine, _) = machine(GrantPolicy::default());
    let (grant_id, code) = authorized(&machine, None).await;
    let tokens = machine.exchange_code(exchange(&code)).await.unwrap();

    let err = machine.exchange_code(exchange(&code)).await.unwrap_err();
    assert_eq!(err, OAuthError::InvalidGrant(GrantFault::CodeReused));
    assert_eq!(err.error_code(), "invalid_grant");

    // Without the revoke-on-reuse policy the first exchange stays valid.
    assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::TokenIssued);
    assert!(machine.introspect(&tokens.access.value).await.active);
}

#[tokio::test]
async fn test_code_replay_revokes_when_configured() {
    let (machine, _) = machine(GrantPolicy { revoke_on_code_reuse: true, ..GrantPolicy::default() });
    let (grant_id, code) = authorized(&machine, None).await;
    let tokens = machine.exchange_code(exchange(&code)).await.unwrap();

    let err = machine.exchange_code(exchange(&code)).await.unwrap_err();
    assert_eq!(err, OAuthError::InvalidGrant(GrantFault::CodeReused));
    assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::Revoked);
    assert!(!machine.introspect(&tokens.access.value).await.active);

    let again = machine.exchange_code(exchange(&code)).await.unwrap_err();
    assert_eq!(again, OAuthError::Revoked);
}

#[tokio::test]
async fn test_concurrent_exchange_succeeds_once() {
    let (machine, store) = machine(GrantPolicy::default());
    let (grant_id, code) = authorized(&machine, None).await;

    let tasks = (0..16).map(|_| {
        let machine = machine.clone();
        let request = exchange(&code);
        tokio::spawn(async move { machine.exchange_code(request).await })
    });
    let results = futures::future::join_all(tasks).await;

    let (ok, failed): (Vec<_>, Vec<_>) = results.into_iter().map(|r| r.unwrap()).partition(|r| r.is_ok());
    assert_eq!(ok.len(), 1);
    assert_eq!(failed.len(), 15);
    for err in failed {
        assert_eq!(err.unwrap_err(), OAuthError::InvalidGrant(GrantFault::CodeReused));
    }

    // Code plus exactly one access and one refresh token are resolvable.
    assert_eq!(store.indexed_tokens(), 3);
    assert_eq!(machine.grant(&grant_id).await.unwrap().tokens.len(), 3);
}

#[tokio::test]
async fn test_pkce_is_enforced() {
    let (machine, _) = machine(GrantPolicy::default());
    let (_, code) = authorized(&machine, Some(pkce_code_challenge(VERIFIER))).await;

    let missing = machine.exchange_code(exchange(&code)).await.unwrap_err();
    assert_eq!(missing, OAuthError::InvalidGrant(GrantFault::PkceMismatch));

    let wrong = CodeExchange {
        code_verifier: Some("x".repeat(43)),
        ..exchange(&code)
    };
    let err = machine.exchange_code(wrong).await.unwrap_err();
    assert_eq!(err, OAuthError::InvalidGrant(GrantFault::PkceMismatch));

    // Failed attempts do not consume the code.
    let right = CodeExchange {
        code_verifier: Some(VERIFIER.into()),
        ..exchange(&code)
    };
    assert!(machine.exchange_code(right).await.is_ok());
}

#[tokio::test]
async fn test_redirect_uri_must_match() {
    let (machine, _) = machine(GrantPolicy::default());
    let (_, code) = authorized(&machine, None).await;
    let request = CodeExchange {
        redirect_uri: Some("https://client.example/other".into()),
        ..exchange(&code)
    };
    let err = machine.exchange_code(request).await.unwrap_err();
    assert_eq!(err, OAuthError::InvalidGrant(GrantFault::RedirectMismatch));
}

#[tokio::test]
async fn test_code_bound_to_client() {
    let (machine, _) = machine(GrantPolicy::default());
    let (_, code) = authorized(&machine, None).await;
    let request = CodeExchange {
        client_id: "C2".into(),
        ..exchange(&code)
    };
    let err = machine.exchange_code(request).await.unwrap_err();
    assert_eq!(err, OAuthError::ClientMismatch);
    assert_eq!(err.error_code(), "invalid_grant");

    assert!(machine.exchange_code(exchange(&code)).await.is_ok());
}

#[tokio::test]
async fn test_expired_code_expires_grant() {
    let (machine, _) = machine(GrantPolicy { code_ttl: Duration::ZERO, ..GrantPolicy::default() });
    let (grant_id, code) = authorized(&machine, None).await;

    let err = machine.exchange_code(exchange(&code)).await.unwrap_err();
    assert_eq!(err, OAuthError::Expired);
    assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::Expired);
}

#[tokio::test]
async fn test_expired_code_from_other_client() {
    let (machine, _) = machine(GrantPolicy { code_ttl: Duration::ZERO, ..GrantPolicy::default() });
    let (grant_id, code) = authorized(&machine, None).await;
    let request = CodeExchange {
        client_id: "C2".into(),
        ..exchange(&code)
    };
    assert_eq!(machine.exchange_code(request).await.unwrap_err(), OAuthError::ClientMismatch);
    assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::CodeIssued);
}

#[tokio::test]
async fn test_refresh_rotation_and_reuse_detection() {
    let (machine, _) = machine(GrantPolicy::default());
    let (grant_id, code) = authorized(&machine, None).await;
    let first = machine.exchange_code(exchange(&code)).await.unwrap();
    let r1 = first.refresh.unwrap().value;

    let second = machine.refresh(&r1, "C1").await.unwrap();
    let r2 = second.refresh.unwrap().value;
    assert_ne!(r1, r2);
    assert_ne!(first.access.value, second.access.value);
    assert!(!machine.introspect(&r1).await.active);
    assert!(machine.introspect(&r2).await.active);

    // Replaying the superseded token revokes everything.
    assert_eq!(machine.refresh(&r1, "C1").await.unwrap_err(), OAuthError::Revoked);
    assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::Revoked);
    assert_eq!(machine.refresh(&r2, "C1").await.unwrap_err(), OAuthError::Revoked);
    assert!(!machine.introspect(&second.access.value).await.active);
    assert!(!machine.introspect(&first.access.value).await.active);
}

#[tokio::test]
async fn test_refresh_reuse_policy_keeps_token() {
    let (machine, _) = machine(GrantPolicy { refresh: RefreshPolicy::Reuse, ..GrantPolicy::default() });
    let (_, code) = authorized(&machine, None).await;
    let first = machine.exchange_code(exchange(&code)).await.unwrap();
    let refresh = first.refresh.unwrap().value;

    let a = machine.refresh(&refresh, "C1").await.unwrap();
    let b = machine.refresh(&refresh, "C1").await.unwrap();
    assert!(a.refresh.is_none() && b.refresh.is_none());
    assert!(machine.introspect(&refresh).await.active);
    assert!(machine.introspect(&a.access.value).await.active);
}

#[tokio::test]
async fn test_refresh_rejects_other_client_and_wrong_kind() {
    let (machine, _) = machine(GrantPolicy::default());
    let (_, code) = authorized(&machine, None).await;
    let tokens = machine.exchange_code(exchange(&code)).await.unwrap();
    let refresh = tokens.refresh.unwrap().value;

    assert_eq!(machine.refresh(&refresh, "C2").await.unwrap_err(), OAuthError::ClientMismatch);
    assert_eq!(
        machine.refresh(&tokens.access.value, "C1").await.unwrap_err(),
        OAuthError::InvalidGrant(GrantFault::Malformed)
    );
    assert!(machine.refresh(&refresh, "C1").await.is_ok());
}

#[tokio::test]
async fn test_expired_refresh_token() {
    let (machine, _) = machine(GrantPolicy {
        refresh_ttl: Duration::ZERO,
        access_ttl: Duration::ZERO,
        ..GrantPolicy::default()
    });
    let (grant_id, code) = authorized(&machine, None).await;
    let tokens = machine.exchange_code(exchange(&code)).await.unwrap();

    let err = machine.refresh(&tokens.refresh.unwrap().value, "C1").await.unwrap_err();
    assert_eq!(err, OAuthError::Expired);
    assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::Expired);
    assert!(!machine.introspect(&tokens.access.value).await.active);
}

#[tokio::test]
async fn test_revoke_by_token_and_by_grant_id() {
    let (machine, _) = machine(GrantPolicy::default());
    let (grant_id, code) = authorized(&machine, None).await;
    let tokens = machine.exchange_code(exchange(&code)).await.unwrap();

    machine.revoke(&tokens.access.value).await.unwrap();
    assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::Revoked);
    assert!(!machine.introspect(&tokens.access.value).await.active);
    let refresh = tokens.refresh.unwrap().value;
    assert_eq!(machine.refresh(&refresh, "C1").await.unwrap_err(), OAuthError::Revoked);

    let (other_id, other_code) = authorized(&machine, None).await;
    machine.revoke(&other_id).await.unwrap();
    assert_eq!(machine.exchange_code(exchange(&other_code)).await.unwrap_err(), OAuthError::Revoked);

    // Unknown values and repeats are acknowledged.
    machine.revoke("no-such-token").await.unwrap();
    machine.revoke(&grant_id).await.unwrap();
}

#[tokio::test]
async fn test_sweep_drops_finished_grants() {
    let (machine, store) = machine(GrantPolicy {
        code_ttl: Duration::ZERO,
        retention: Duration::ZERO,
        ..GrantPolicy::default()
    });
    let (finished, _) = authorized(&machine, None).await;
    machine.revoke(&finished).await.unwrap();

    assert_eq!(machine.sweep().await.unwrap(), 1);
    assert!(matches!(machine.grant(&finished).await, Err(OAuthError::GrantNotFound(_))));
    assert_eq!(store.grant_count(), 0);
}

#[tokio::test]
async fn test_concurrent_refresh_leaves_no_live_tokens() {
    let (machine, store) = machine(GrantPolicy::default());
    let (grant_id, code) = authorized(&machine, None).await;
    let first = machine.exchange_code(exchange(&code)).await.unwrap();
    let r1 = first.refresh.unwrap().value;

    let tasks = (0..8).map(|_| {
        let machine = machine.clone();
        let r1 = r1.clone();
        tokio::spawn(async move { machine.refresh(&r1, "C1").await })
    });
    let results = futures::future::join_all(tasks).await;

    let (ok, failed): (Vec<_>, Vec<_>) = results.into_iter().map(|r| r.unwrap()).partition(|r| r.is_ok());
    assert_eq!(ok.len(), 1);
    for err in failed {
        assert_eq!(err.unwrap_err(), OAuthError::Revoked);
    }

    // The losing replays revoked the grant, taking the winner's tokens with it.
    assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::Revoked);
    for tokens in ok {
        let tokens = tokens.unwrap();
        assert!(!machine.introspect(&tokens.access.value).await.active);
        assert!(!machine.introspect(&tokens.refresh.unwrap().value).await.active);
    }
    assert_eq!(store.indexed_tokens(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_revoke_racing_exchange_leaves_no_usable_token() {
    for _ in 0..32 {
        let (machine, store) = machine(GrantPolicy::default());
        let (grant_id, code) = authorized(&machine, None).await;

        let exchanging = {
            let machine = machine.clone();
            let request = exchange(&code);
            tokio::spawn(async move { machine.exchange_code(request).await })
        };
        let revoking = {
            let machine = machine.clone();
            let grant_id = grant_id.clone();
            tokio::spawn(async move { machine.revoke(&grant_id).await })
        };
        let (exchanged, revoked) = tokio::join!(exchanging, revoking);
        revoked.unwrap().unwrap();

        if let Ok(tokens) = exchanged.unwrap() {
            assert!(!machine.introspect(&tokens.access.value).await.active);
            let refresh = tokens.refresh.unwrap().value;
            assert_eq!(machine.refresh(&refresh, "C1").await.unwrap_err(), OAuthError::Revoked);
        }
        assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::Revoked);
        assert_eq!(store.indexed_tokens(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_revoke_racing_refresh_leaves_no_usable_token() {
    for _ in 0..32 {
        let (machine, store) = machine(GrantPolicy::default());
        let (grant_id, code) = authorized(&machine, None).await;
        let first = machine.exchange_code(exchange(&code)).await.unwrap();
        let r1 = first.refresh.unwrap().value;

        let refreshing = {
            let machine = machine.clone();
            let r1 = r1.clone();
            tokio::spawn(async move { machine.refresh(&r1, "C1").await })
        };
        let revoking = {
            let machine = machine.clone();
            let access = first.access.value.clone();
            tokio::spawn(async move { machine.revoke(&access).await })
        };
        let (refreshed, revoked) = tokio::join!(refreshing, revoking);
        revoked.unwrap().unwrap();

        if let Ok(tokens) = refreshed.unwrap() {
            assert!(!machine.introspect(&tokens.access.value).await.active);
            let next = tokens.refresh.unwrap().value;
            assert_eq!(machine.refresh(&next, "C1").await.unwrap_err(), OAuthError::Revoked);
        }
        assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::Revoked);
        assert!(!machine.introspect(&r1).await.active);
        assert_eq!(store.indexed_tokens(), 0);
    }
}

#[tokio::test]
async fn test_refresh_prunes_expired_token_records() {
    let (machine, store) = machine(GrantPolicy { access_ttl: Duration::ZERO, ..GrantPolicy::default() });
    let (grant_id, code) = authorized(&machine, None).await;
    let first = machine.exchange_code(exchange(&code)).await.unwrap();
    let r1 = first.refresh.unwrap().value;

    let mut refresh = r1.clone();
    for _ in 0..10 {
        refresh = machine.refresh(&refresh, "C1").await.unwrap().refresh.unwrap().value;
    }

    let grant = machine.grant(&grant_id).await.unwrap();
    let access = grant.tokens.values().filter(|t| t.kind == TokenKind::Access).count();
    assert_eq!(access, 1);
    // Code, r1 plus ten rotations, and the latest access token.
    assert_eq!(grant.tokens.len(), 13);
    assert_eq!(store.indexed_tokens(), 13);

    // Superseded refresh tokens are still tracked until they expire.
    assert_eq!(machine.refresh(&r1, "C1").await.unwrap_err(), OAuthError::Revoked);
}

#[tokio::test]
async fn test_reused_refresh_token_keeps_grant_bounded() {
    let (machine, store) = machine(GrantPolicy {
        refresh: RefreshPolicy::Reuse,
        access_ttl: Duration::ZERO,
        ..GrantPolicy::default()
    });
    let (grant_id, code) = authorized(&machine, None).await;
    let refresh = machine.exchange_code(exchange(&code)).await.unwrap().refresh.unwrap().value;

    for _ in 0..50 {
        machine.refresh(&refresh, "C1").await.unwrap();
    }
    assert_eq!(machine.grant(&grant_id).await.unwrap().tokens.len(), 3);
    assert_eq!(store.indexed_tokens(), 3);
}

#[tokio::test]
async fn test_introspecting_last_expired_access_token_expires_grant() {
    let (machine, _) = machine(GrantPolicy { access_ttl: Duration::ZERO, ..GrantPolicy::default() });

    let (grant_id, code) = authorized(&machine, None).await;
    let tokens = machine
        .exchange_code(CodeExchange { with_refresh: false, ..exchange(&code) })
        .await
        .unwrap();
    assert!(tokens.refresh.is_none());
    assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::TokenIssued);
    assert!(!machine.introspect(&tokens.access.value).await.active);
    assert_eq!(machine.grant(&grant_id).await.unwrap().state, GrantState::Expired);

    // A live refresh token keeps the grant going.
    let (refreshable, code) = authorized(&machine, None).await;
    let tokens = machine.exchange_code(exchange(&code)).await.unwrap();
    assert!(!machine.introspect(&tokens.access.value).await.active);
    assert_eq!(machine.grant(&refreshable).await.unwrap().state, GrantState::TokenIssued);
}
