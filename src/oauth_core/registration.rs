//! Dynamic client registration (RFC 7591 subset).

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;
use uuid::Uuid;

use super::crypto::random_secret;
use super::types::{Client, ClientAuthMethod, GrantType, OAuthError};

/// Bytes of entropy in a generated client secret.
pub const CLIENT_SECRET_BYTES: usize = 32;

/// Registration request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistrationRequest {
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_method: Option<String>,
    #[serde(default)]
    pub grant_types: Option<Vec<String>>,
    #[serde(default)]
    pub response_types: Option<Vec<String>>,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Registration response body. `client_secret` is only ever returned here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistrationResponse {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub client_id_issued_at: i64,
    /// `0` means the secret never expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<i64>,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

/// Checks a redirect URI: absolute, no fragment or wildcard, and https unless
/// it points at the loopback interface.
pub fn validate_redirect_uri(uri: &str) -> Result<(), OAuthError> {
    let reject = |why: &str| -> Result<(), OAuthError> {
        warn!(redirect_uri = %uri, "rejected redirect uri: {why}");
        Err(OAuthError::InvalidClientMetadata(format!("redirect uri `{uri}` {why}")))
    };
    if uri.trim().is_empty() || uri.contains('*') {
        return reject("is empty or contains a wildcard");
    }
    let Ok(parsed) = Url::parse(uri) else {
        return reject("is not an absolute uri");
    };
    if parsed.fragment().is_some() {
        return reject("must not contain a fragment");
    }
    let loopback = matches!(parsed.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if loopback => Ok(()),
        _ => reject("must use https outside of loopback"),
    }
}

fn parse_auth_method(value: Option<&str>) -> Result<ClientAuthMethod, OAuthError> {
    match value {
        None | Some("client_secret_basic") => Ok(ClientAuthMethod::ClientSecretBasic),
        Some("client_secret_post") => Ok(ClientAuthMethod::ClientSecretPost),
        Some("none") => Ok(ClientAuthMethod::None),
        Some(other) => Err(OAuthError::InvalidClientMetadata(format!(
            "unsupported token_endpoint_auth_method `{other}`"
        ))),
    }
}

impl ClientRegistrationRequest {
    /// Validates the request and builds the client record together with the
    /// response to hand back to the registering party.
    pub fn into_client(self) -> Result<(Client, ClientRegistrationResponse), OAuthError> {
        if self.redirect_uris.is_empty() {
            return Err(OAuthError::InvalidClientMetadata("at least one redirect uri is required".into()));
        }
        for uri in &self.redirect_uris {
            validate_redirect_uri(uri)?;
        }

        let grant_types = match &self.grant_types {
            None => vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            Some(names) => names
                .iter()
                .map(|name| {
                    GrantType::parse(name)
                        .map_err(|_| OAuthError::InvalidClientMetadata(format!("unsupported grant type `{name}`")))
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        if !grant_types.contains(&GrantType::AuthorizationCode) {
            return Err(OAuthError::InvalidClientMetadata(
                "authorization_code is required in grant_types".into(),
            ));
        }

        let response_types = self.response_types.clone().unwrap_or_else(|| vec!["code".to_string()]);
        if let Some(bad) = response_types.iter().find(|t| t.as_str() != "code") {
            return Err(OAuthError::InvalidClientMetadata(format!("unsupported response type `{bad}`")));
        }

        let auth_method = parse_auth_method(self.token_endpoint_auth_method.as_deref())?;
        let secret = match auth_method {
            ClientAuthMethod::None => None,
            _ => Some(random_secret(CLIENT_SECRET_BYTES)?),
        };

        let client = Client {
            id: Uuid::new_v4().to_string(),
            secret: secret.clone(),
            redirect_uris: self.redirect_uris.iter().cloned().collect::<BTreeSet<_>>(),
            grant_types: grant_types.clone(),
            auth_method,
            name: self.client_name.clone(),
        };
        let response = ClientRegistrationResponse {
            client_id: client.id.clone(),
            client_secret_expires_at: secret.as_ref().map(|_| 0),
            client_secret: secret,
            client_id_issued_at: Utc::now().timestamp(),
            redirect_uris: self.redirect_uris,
            grant_types: grant_types.iter().map(|g| g.as_str().to_string()).collect(),
            response_types,
            token_endpoint_auth_method: auth_method.as_str().to_string(),
            client_name: self.client_name,
        };
        Ok((client, response))
    }
}
