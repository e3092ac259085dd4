//! Cryptographic helpers for client authentication and PKCE using `ring`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::digest;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

use super::types::OAuthError;

/// Generate a PKCE code challenge from the given verifier using SHA-256 and base64url (no padding).
pub fn pkce_code_challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// Checks a PKCE verifier against the S256 challenge recorded at authorization.
pub fn pkce_verify(challenge: &str, verifier: &str) -> bool {
    // RFC 7636 section 4.1
    if !(43..=128).contains(&verifier.len()) {
        return false;
    }
    secrets_match(challenge, &pkce_code_challenge(verifier))
}

/// Create an HMAC tag for the given data using the provided secret key.
pub fn hmac_sign(key: &[u8], data: &[u8]) -> Vec<u8> {
    let s_key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&s_key, data).as_ref().to_vec()
}

/// Verify an HMAC tag for the given data and key.
pub fn hmac_verify(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let s_key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&s_key, data, tag).is_ok()
}

/// Constant-time comparison of a stored secret with a presented one.
///
/// Both sides are bound into an HMAC under the stored value so the comparison
/// goes through `ring`'s constant-time tag verification.
pub fn secrets_match(expected: &str, provided: &str) -> bool {
    const LABEL: &[u8] = b"starberry-as client secret";
    let tag = hmac_sign(expected.as_bytes(), LABEL);
    hmac_verify(provided.as_bytes(), LABEL, &tag)
}

/// Fill `len` random bytes from the system RNG.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, OAuthError> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf)
        .map_err(|_| OAuthError::ServerError("system random generator failed".into()))?;
    Ok(buf)
}

/// Random base64url string backed by `len` bytes of entropy.
pub fn random_secret(len: usize) -> Result<String, OAuthError> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes(len)?))
}
