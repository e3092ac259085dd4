use chrono::{Duration, Utc};
use starberry_as::oauth_core::keyset::algorithm_name;
use starberry_as::{Algorithm, KeySet, OAuthError, SigningKey};

#[tokio::test]
async fn test_rotation_makes_new_key_current() {
    let keys = KeySet::new(SigningKey::generate("op0", Algorithm::ES256).unwrap()).unwrap();
    assert_eq!(keys.current_key().await.kid(), "op0");

    keys.rotate(SigningKey::generate("op1", Algorithm::EdDSA).unwrap()).await.unwrap();
    assert_eq!(keys.current_key().await.kid(), "op1");
    assert_eq!(keys.kids().await, vec!["op0".to_string(), "op1".to_string()]);

    // The previous key still resolves for verification.
    let old = keys.key_by_id("op0").await.unwrap();
    assert_eq!(old.algorithm(), Algorithm::ES256);
}

#[tokio::test]
async fn test_rotation_rejects_disallowed_algorithm() {
    let keys = KeySet::with_allowed(
        SigningKey::generate("op0", Algorithm::ES256).unwrap(),
        vec![Algorithm::ES256],
    )
    .unwrap();
    let err = keys
        .rotate(SigningKey::generate("op1", Algorithm::HS256).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err, OAuthError::UnsupportedAlgorithm("HS256".into()));
    assert_eq!(keys.current_key().await.kid(), "op0");
}

#[tokio::test]
async fn test_rotation_rejects_duplicate_kid() {
    let keys = KeySet::new(SigningKey::generate("op0", Algorithm::HS256).unwrap()).unwrap();
    let err = keys
        .rotate(SigningKey::generate("op0", Algorithm::HS512).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, OAuthError::ServerError(_)));
    assert_eq!(keys.kids().await.len(), 1);
}

#[tokio::test]
async fn test_initial_key_must_be_allowed() {
    let err = KeySet::with_allowed(
        SigningKey::generate("op0", Algorithm::HS256).unwrap(),
        vec![Algorithm::EdDSA],
    )
    .err()
    .unwrap();
    assert!(matches!(err, OAuthError::UnsupportedAlgorithm(_)));
}

#[test]
fn test_hmac_secret_constraints() {
    assert!(SigningKey::from_secret("short", Algorithm::HS256, b"too short").is_err());
    assert!(SigningKey::from_secret("ec", Algorithm::ES256, &[7u8; 32]).is_err());
    let key = SigningKey::from_secret("ok", Algorithm::HS384, &[7u8; 48]).unwrap();
    assert!(key.public_jwk().is_none());
}

#[test]
fn test_unsupported_algorithms_cannot_be_generated() {
    let err = SigningKey::generate("rsa", Algorithm::RS256).unwrap_err();
    assert_eq!(err, OAuthError::UnsupportedAlgorithm(algorithm_name(Algorithm::RS256)));
}

#[tokio::test]
async fn test_retired_key_is_unavailable_and_pruned() {
    let retired = SigningKey::generate("op0", Algorithm::ES256)
        .unwrap()
        .valid_until(Utc::now() - Duration::seconds(1));
    let keys = KeySet::new(retired).unwrap();
    keys.rotate(SigningKey::generate("op1", Algorithm::ES256).unwrap()).await.unwrap();

    let err = keys.key_by_id("op0").await.unwrap_err();
    assert_eq!(err, OAuthError::KeyUnavailable("op0".into()));

    assert_eq!(keys.prune_retired().await, 1);
    assert_eq!(keys.kids().await, vec!["op1".to_string()]);
    assert_eq!(keys.current_key().await.kid(), "op1");
    assert_eq!(keys.prune_retired().await, 0);
}

#[tokio::test]
async fn test_expired_current_key_is_kept_but_not_live() {
    let keys = KeySet::new(
        SigningKey::generate("op0", Algorithm::HS256)
            .unwrap()
            .valid_until(Utc::now() - Duration::seconds(1)),
    )
    .unwrap();
    assert_eq!(keys.prune_retired().await, 0);
    let current = keys.current_key().await;
    assert_eq!(current.kid(), "op0");
    assert!(!current.is_live_at(Utc::now()));
}

#[tokio::test]
async fn test_rotation_rejects_key_outside_its_window() {
    let keys = KeySet::new(SigningKey::generate("op0", Algorithm::ES256).unwrap()).unwrap();

    let retired = SigningKey::generate("old", Algorithm::ES256)
        .unwrap()
        .valid_until(Utc::now() - Duration::seconds(1));
    assert_eq!(keys.rotate(retired).await.unwrap_err(), OAuthError::KeyUnavailable("old".into()));

    let scheduled = SigningKey::generate("next", Algorithm::ES256)
        .unwrap()
        .valid_from(Utc::now() + Duration::days(30));
    assert_eq!(keys.rotate(scheduled).await.unwrap_err(), OAuthError::KeyUnavailable("next".into()));

    assert_eq!(keys.current_key().await.kid(), "op0");
    assert_eq!(keys.kids().await, vec!["op0".to_string()]);
}

#[test]
fn test_validity_window_bounds() {
    let now = Utc::now();
    let key = SigningKey::generate("op0", Algorithm::EdDSA)
        .unwrap()
        .valid_from(now + Duration::days(1))
        .valid_until(now + Duration::days(2));
    assert_eq!(key.not_before(), Some(now + Duration::days(1)));
    assert_eq!(key.not_after(), Some(now + Duration::days(2)));

    assert!(!key.is_live_at(now));
    assert!(!key.is_retired_at(now));
    assert!(key.is_live_at(now + Duration::days(1)));
    assert!(!key.is_live_at(now + Duration::days(2)));
    assert!(key.is_retired_at(now + Duration::days(2)));

    let open = SigningKey::generate("op1", Algorithm::EdDSA).unwrap();
    assert_eq!(open.not_before(), None);
    assert!(open.is_live_at(now));
}

#[tokio::test]
async fn test_scheduled_key_is_unavailable_until_its_start() {
    let scheduled = SigningKey::generate("op0", Algorithm::ES256)
        .unwrap()
        .valid_from(Utc::now() + Duration::days(30));
    let keys = KeySet::new(scheduled).unwrap();

    assert_eq!(keys.key_by_id("op0").await.unwrap_err(), OAuthError::KeyUnavailable("op0".into()));
    assert!(keys.public_jwks().await.keys.is_empty());
    // Not yet valid is not retired.
    assert_eq!(keys.prune_retired().await, 0);
}

#[tokio::test]
async fn test_public_jwks_lists_asymmetric_keys_only() {
    let keys = KeySet::new(SigningKey::generate("op0", Algorithm::HS256).unwrap()).unwrap();
    keys.rotate(SigningKey::generate("op1", Algorithm::ES256).unwrap()).await.unwrap();
    keys.rotate(SigningKey::generate("op2", Algorithm::EdDSA).unwrap()).await.unwrap();

    let jwks = keys.public_jwks().await;
    assert_eq!(jwks.keys.len(), 2);

    let ec = jwks.keys.iter().find(|k| k.kid == "op1").unwrap();
    assert_eq!(ec.kty, "EC");
    assert_eq!(ec.alg, "ES256");
    assert_eq!(ec.crv.as_deref(), Some("P-256"));
    assert!(ec.x.is_some() && ec.y.is_some());

    let ed = jwks.keys.iter().find(|k| k.kid == "op2").unwrap();
    assert_eq!(ed.kty, "OKP");
    assert_eq!(ed.crv.as_deref(), Some("Ed25519"));
    assert!(ed.y.is_none());

    let json = serde_json::to_value(&jwks).unwrap();
    assert_eq!(json["keys"][0]["use"], "sig");
}
