//! Signed, time-bounded tokens (codes, access and refresh tokens) as JWTs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::keyset::KeySet;
use super::types::{GrantFault, IssuedToken, OAuthError, TokenKind};

/// Reasons a token fails verification. Callers need all three apart.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Malformed, tampered, wrong issuer or wrong kind.
    #[error("token is invalid")]
    Invalid,
    #[error("token has expired")]
    Expired,
    /// The `kid` does not name a live key.
    #[error("unknown signing key `{0}`")]
    UnknownKey(String),
}

impl From<CodecError> for OAuthError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Invalid => OAuthError::InvalidGrant(GrantFault::Malformed),
            CodecError::Expired => OAuthError::Expired,
            CodecError::UnknownKey(kid) => OAuthError::KeyUnavailable(kid),
        }
    }
}

/// Claims embedded in every token.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    jti: String,
    kind: TokenKind,
    gid: String,
    iat: i64,
    exp: i64,
}

/// What a verified token says about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub kind: TokenKind,
    pub grant_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Issues and verifies tokens against a shared [`KeySet`].
#[derive(Clone)]
pub struct TokenCodec {
    keys: Arc<KeySet>,
    issuer: String,
}

impl TokenCodec {
    pub fn new(keys: Arc<KeySet>, issuer: impl Into<String>) -> Self {
        TokenCodec { keys, issuer: issuer.into() }
    }

    pub fn keys(&self) -> &Arc<KeySet> {
        &self.keys
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Signs a token of `kind` for `grant_id` with the current key.
    ///
    /// Fails with `KeyUnavailable` when the current key is outside its
    /// validity window, since nothing it signs would verify.
    #[instrument(skip(self), level = "debug")]
    pub async fn issue(&self, kind: TokenKind, grant_id: &str, ttl: Duration) -> Result<IssuedToken, OAuthError> {
        let key = self.keys.current_key().await;
        let issued = Utc::now();
        if !key.is_live_at(issued) {
            warn!(kid = %key.kid(), "current signing key is outside its validity window");
            return Err(OAuthError::KeyUnavailable(key.kid().to_string()));
        }
        let now = issued.timestamp();
        let exp = now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));
        let claims = Claims {
            iss: self.issuer.clone(),
            jti: uuid::Uuid::new_v4().to_string(),
            kind,
            gid: grant_id.to_string(),
            iat: now,
            exp,
        };
        let mut header = Header::new(key.algorithm());
        header.kid = Some(key.kid().to_string());
        let value = encode(&header, &claims, key.encoding_key())
            .map_err(|e| OAuthError::ServerError(format!("token signing failed: {e}")))?;
        Ok(IssuedToken {
            value,
            kind,
            grant_id: grant_id.to_string(),
            issued_at: from_unix(now),
            expires_at: from_unix(exp),
        })
    }

    /// Verifies signature, issuer and expiry. Does not consult any store.
    ///
    /// Expiry is judged before the signature: a token past its `exp` is
    /// `Expired` whether or not its signature would verify.
    #[instrument(skip(self, value), level = "debug")]
    pub async fn verify(&self, value: &str) -> Result<VerifiedToken, CodecError> {
        let header = decode_header(value).map_err(|_| CodecError::Invalid)?;
        let unverified = Self::peek(value)?;
        if Utc::now().timestamp() >= unverified.exp {
            return Err(CodecError::Expired);
        }

        let kid = header.kid.ok_or(CodecError::Invalid)?;
        let key = self
            .keys
            .key_by_id(&kid)
            .await
            .map_err(|_| CodecError::UnknownKey(kid.clone()))?;
        if key.algorithm() != header.alg {
            debug!(%kid, "token algorithm does not match its key");
            return Err(CodecError::Invalid);
        }

        let mut validation = Validation::new(key.algorithm());
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        let data = decode::<Claims>(value, key.decoding_key(), &validation).map_err(|_| CodecError::Invalid)?;
        let claims = data.claims;
        Ok(VerifiedToken {
            kind: claims.kind,
            grant_id: claims.gid,
            issued_at: from_unix(claims.iat),
            expires_at: from_unix(claims.exp),
        })
    }

    /// [`verify`](Self::verify) plus a check that the token is of `expected` kind.
    pub async fn verify_kind(&self, value: &str, expected: TokenKind) -> Result<VerifiedToken, CodecError> {
        let token = self.verify(value).await?;
        if token.kind != expected {
            return Err(CodecError::Invalid);
        }
        Ok(token)
    }

    /// Reads claims without checking the signature. Used only to route
    /// expired tokens to their grant; never trusted on its own.
    pub(crate) fn peek_grant(value: &str) -> Option<(TokenKind, String)> {
        Self::peek(value).ok().map(|c| (c.kind, c.gid))
    }

    fn peek(value: &str) -> Result<Claims, CodecError> {
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();
        decode::<Claims>(value, &DecodingKey::from_secret(&[]), &validation)
            .map(|data| data.claims)
            .map_err(|_| CodecError::Invalid)
    }
}
