//! `/.well-known/openid-configuration` document.

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use super::jwks::JWKS_PATH;
use crate::oauth_core::keyset::algorithm_name;
use crate::oauth_core::types::{ClientAuthMethod, GrantType};

pub const AUTHORIZATION_PATH: &str = "authorization";
pub const TOKEN_PATH: &str = "token";
pub const REGISTRATION_PATH: &str = "registration";
pub const INTROSPECTION_PATH: &str = "introspect";
pub const REVOCATION_PATH: &str = "revoke";

/// Provider configuration as published to relying parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: String,
    pub introspection_endpoint: String,
    pub revocation_endpoint: String,
    pub jwks_uri: String,
    pub scopes_supported: Vec<String>,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Builds the document for `issuer`, resolving endpoint paths against it.
    pub fn new<'a>(
        issuer: &str,
        scopes: impl IntoIterator<Item = &'a String>,
        algorithms: &[Algorithm],
    ) -> Self {
        let base = issuer.trim_end_matches('/');
        let endpoint = |path: &str| format!("{base}/{path}");
        ProviderMetadata {
            issuer: issuer.to_string(),
            authorization_endpoint: endpoint(AUTHORIZATION_PATH),
            token_endpoint: endpoint(TOKEN_PATH),
            registration_endpoint: endpoint(REGISTRATION_PATH),
            introspection_endpoint: endpoint(INTROSPECTION_PATH),
            revocation_endpoint: endpoint(REVOCATION_PATH),
            jwks_uri: endpoint(JWKS_PATH),
            scopes_supported: scopes.into_iter().cloned().collect(),
            response_types_supported: vec!["code".into()],
            grant_types_supported: [GrantType::AuthorizationCode, GrantType::RefreshToken]
                .iter()
                .map(|g| g.as_str().to_string())
                .collect(),
            token_endpoint_auth_methods_supported: [
                ClientAuthMethod::ClientSecretBasic,
                ClientAuthMethod::ClientSecretPost,
                ClientAuthMethod::None,
            ]
            .iter()
            .map(|m| m.as_str().to_string())
            .collect(),
            code_challenge_methods_supported: vec!["S256".into()],
            id_token_signing_alg_values_supported: algorithms.iter().map(|a| algorithm_name(*a)).collect(),
        }
    }
}
