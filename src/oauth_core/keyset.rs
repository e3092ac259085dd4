//! Signing key management: one current key, older keys kept for verification.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use super::crypto::random_bytes;
use super::types::OAuthError;

/// Algorithms this server knows how to build keys for.
pub const SUPPORTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::HS256,
    Algorithm::HS384,
    Algorithm::HS512,
    Algorithm::ES256,
    Algorithm::EdDSA,
];

/// Canonical JOSE name of an algorithm.
pub fn algorithm_name(alg: Algorithm) -> String {
    format!("{alg:?}")
}

/// Public half of an asymmetric key in JWK form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

/// A JWKS document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// A signing key with its validity window.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
    public_jwk: Option<Jwk>,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

fn is_hmac(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

fn rejected(alg: Algorithm) -> OAuthError {
    OAuthError::UnsupportedAlgorithm(algorithm_name(alg))
}

fn bad_material(kid: &str) -> OAuthError {
    OAuthError::ServerError(format!("invalid key material for `{kid}`"))
}

impl SigningKey {
    /// Builds an HMAC key from a shared secret.
    pub fn from_secret(kid: impl Into<String>, alg: Algorithm, secret: &[u8]) -> Result<Self, OAuthError> {
        let kid = kid.into();
        if !is_hmac(alg) {
            return Err(rejected(alg));
        }
        if secret.len() < 32 {
            return Err(OAuthError::ServerError(format!(
                "secret for `{kid}` must be at least 32 bytes"
            )));
        }
        Ok(Self::assemble(
            kid,
            alg,
            EncodingKey::from_secret(secret),
            DecodingKey::from_secret(secret),
            None,
        ))
    }

    /// Builds an ES256 or EdDSA key from a PKCS#8 document.
    pub fn from_pkcs8(kid: impl Into<String>, alg: Algorithm, pkcs8: &[u8]) -> Result<Self, OAuthError> {
        let kid = kid.into();
        match alg {
            Algorithm::ES256 => {
                let rng = SystemRandom::new();
                let pair = EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
                    .map_err(|_| bad_material(&kid))?;
                // uncompressed point: 0x04 || x || y
                let point = pair.public_key().as_ref();
                let jwk = Jwk {
                    kty: "EC".into(),
                    kid: kid.clone(),
                    use_: "sig".into(),
                    alg: algorithm_name(alg),
                    crv: Some("P-256".into()),
                    x: Some(URL_SAFE_NO_PAD.encode(&point[1..33])),
                    y: Some(URL_SAFE_NO_PAD.encode(&point[33..65])),
                };
                Ok(Self::assemble(
                    kid,
                    alg,
                    EncodingKey::from_ec_der(pkcs8),
                    DecodingKey::from_ec_der(point),
                    Some(jwk),
                ))
            }
            Algorithm::EdDSA => {
                let pair = Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8).map_err(|_| bad_material(&kid))?;
                let public = pair.public_key().as_ref();
                let jwk = Jwk {
                    kty: "OKP".into(),
                    kid: kid.clone(),
                    use_: "sig".into(),
                    alg: algorithm_name(alg),
                    crv: Some("Ed25519".into()),
                    x: Some(URL_SAFE_NO_PAD.encode(public)),
                    y: None,
                };
                Ok(Self::assemble(
                    kid,
                    alg,
                    EncodingKey::from_ed_der(pkcs8),
                    DecodingKey::from_ed_der(public),
                    Some(jwk),
                ))
            }
            other => Err(rejected(other)),
        }
    }

    /// Generates fresh key material for `alg`.
    pub fn generate(kid: impl Into<String>, alg: Algorithm) -> Result<Self, OAuthError> {
        let kid = kid.into();
        let rng = SystemRandom::new();
        match alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                Self::from_secret(kid, alg, &random_bytes(64)?)
            }
            Algorithm::ES256 => {
                let doc = EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                    .map_err(|_| OAuthError::ServerError("ECDSA key generation failed".into()))?;
                Self::from_pkcs8(kid, alg, doc.as_ref())
            }
            Algorithm::EdDSA => {
                let doc = Ed25519KeyPair::generate_pkcs8(&rng)
                    .map_err(|_| OAuthError::ServerError("Ed25519 key generation failed".into()))?;
                Self::from_pkcs8(kid, alg, doc.as_ref())
            }
            other => Err(rejected(other)),
        }
    }

    fn assemble(
        kid: String,
        algorithm: Algorithm,
        encoding: EncodingKey,
        decoding: DecodingKey,
        public_jwk: Option<Jwk>,
    ) -> Self {
        SigningKey {
            kid,
            algorithm,
            encoding,
            decoding,
            public_jwk,
            not_before: None,
            not_after: None,
        }
    }

    /// Sets the start of the validity window.
    pub fn valid_from(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    /// Sets the end of the validity window.
    pub fn valid_until(mut self, at: DateTime<Utc>) -> Self {
        self.not_after = Some(at);
        self
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    pub fn public_jwk(&self) -> Option<&Jwk> {
        self.public_jwk.as_ref()
    }

    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }

    /// Whether `now` falls inside the key's validity window.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|start| now >= start) && !self.is_retired_at(now)
    }

    /// Whether the window has ended by `now`. A key that is not yet valid is not retired.
    pub fn is_retired_at(&self, now: DateTime<Utc>) -> bool {
        self.not_after.is_some_and(|end| now >= end)
    }
}

struct KeyRing {
    keys: Vec<Arc<SigningKey>>,
    current: usize,
}

/// Ordered set of signing keys; exactly one is current.
pub struct KeySet {
    ring: RwLock<KeyRing>,
    allowed: Vec<Algorithm>,
}

impl KeySet {
    /// Creates a key set whose current key is `initial`.
    pub fn new(initial: SigningKey) -> Result<Self, OAuthError> {
        Self::with_allowed(initial, SUPPORTED_ALGORITHMS.to_vec())
    }

    /// Creates a key set restricted to `allowed` algorithms.
    pub fn with_allowed(initial: SigningKey, allowed: Vec<Algorithm>) -> Result<Self, OAuthError> {
        if !allowed.contains(&initial.algorithm) {
            return Err(rejected(initial.algorithm));
        }
        Ok(KeySet {
            ring: RwLock::new(KeyRing {
                keys: vec![Arc::new(initial)],
                current: 0,
            }),
            allowed,
        })
    }

    pub fn allowed_algorithms(&self) -> &[Algorithm] {
        &self.allowed
    }

    /// The key used for new signatures. It may sit outside its window; the
    /// codec refuses to sign with it in that case.
    pub async fn current_key(&self) -> Arc<SigningKey> {
        let ring = self.ring.read().await;
        ring.keys[ring.current].clone()
    }

    /// Looks a key up by id; keys past their validity window are unavailable.
    pub async fn key_by_id(&self, kid: &str) -> Result<Arc<SigningKey>, OAuthError> {
        let now = Utc::now();
        let ring = self.ring.read().await;
        ring.keys
            .iter()
            .find(|k| k.kid == kid && k.is_live_at(now))
            .cloned()
            .ok_or_else(|| OAuthError::KeyUnavailable(kid.to_string()))
    }

    /// Appends `key` and makes it current. Earlier keys keep verifying until their window ends.
    /// The new key must be inside its validity window.
    #[instrument(skip(self, key), fields(kid = %key.kid, alg = ?key.algorithm), level = "debug")]
    pub async fn rotate(&self, key: SigningKey) -> Result<(), OAuthError> {
        if !self.allowed.contains(&key.algorithm) {
            return Err(rejected(key.algorithm));
        }
        if !key.is_live_at(Utc::now()) {
            warn!(
                kid = %key.kid,
                not_before = ?key.not_before(),
                not_after = ?key.not_after(),
                "refusing to rotate to a key outside its window"
            );
            return Err(OAuthError::KeyUnavailable(key.kid));
        }
        let mut ring = self.ring.write().await;
        if ring.keys.iter().any(|k| k.kid == key.kid) {
            return Err(OAuthError::ServerError(format!("duplicate key id `{}`", key.kid)));
        }
        ring.keys.push(Arc::new(key));
        ring.current = ring.keys.len() - 1;
        info!(kid = %ring.keys[ring.current].kid, "signing key rotated");
        Ok(())
    }

    /// Drops non-current keys whose validity window has ended. Returns how many were removed.
    pub async fn prune_retired(&self) -> usize {
        let now = Utc::now();
        let mut ring = self.ring.write().await;
        let current_kid = ring.keys[ring.current].kid.clone();
        let before = ring.keys.len();
        ring.keys.retain(|k| k.kid == current_kid || !k.is_retired_at(now));
        ring.current = ring
            .keys
            .iter()
            .position(|k| k.kid == current_kid)
            .unwrap_or(ring.keys.len() - 1);
        before - ring.keys.len()
    }

    /// Key ids in insertion order.
    pub async fn kids(&self) -> Vec<String> {
        self.ring.read().await.keys.iter().map(|k| k.kid.clone()).collect()
    }

    /// Public keys of every live asymmetric key.
    pub async fn public_jwks(&self) -> JwkSet {
        let now = Utc::now();
        let ring = self.ring.read().await;
        JwkSet {
            keys: ring
                .keys
                .iter()
                .filter(|k| k.is_live_at(now))
                .filter_map(|k| k.public_jwk.clone())
                .collect(),
        }
    }
}
