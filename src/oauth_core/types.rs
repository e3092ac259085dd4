//! OAuth2 core primitives: Client, Grant, Token and errors.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

/// Client authentication method at the token endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// Secret sent in the `Authorization: Basic` header.
    #[default]
    ClientSecretBasic,
    /// Secret sent in the request body.
    ClientSecretPost,
    /// Public client, no secret. Must use PKCE.
    None,
}

impl ClientAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientAuthMethod::ClientSecretBasic => "client_secret_basic",
            ClientAuthMethod::ClientSecretPost => "client_secret_post",
            ClientAuthMethod::None => "none",
        }
    }
}

/// OAuth2 grant types understood by the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
        }
    }

    /// Parses the `grant_type` form parameter.
    pub fn parse(value: &str) -> Result<Self, OAuthError> {
        match value {
            "authorization_code" => Ok(GrantType::AuthorizationCode),
            "refresh_token" => Ok(GrantType::RefreshToken),
            other => Err(OAuthError::UnsupportedGrantType(other.to_string())),
        }
    }
}

fn default_grant_types() -> Vec<GrantType> {
    vec![GrantType::AuthorizationCode, GrantType::RefreshToken]
}

/// Represents an OAuth 2.0 client application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Client identifier.
    pub id: String,
    /// Optional client secret. Absent for public clients.
    #[serde(default)]
    pub secret: Option<String>,
    /// Allowed redirect URIs.
    pub redirect_uris: BTreeSet<String>,
    /// Grant types this client may use.
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<GrantType>,
    /// How the client authenticates at the token endpoint.
    #[serde(default)]
    pub auth_method: ClientAuthMethod,
    /// Human readable name.
    #[serde(default)]
    pub name: Option<String>,
}

impl Client {
    pub fn allows(&self, grant_type: GrantType) -> bool {
        self.grant_types.contains(&grant_type)
    }

    pub fn is_public(&self) -> bool {
        self.auth_method == ClientAuthMethod::None
    }
}

/// Lifecycle of a single authorization grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantState {
    Pending,
    CodeIssued,
    TokenIssued,
    Revoked,
    Expired,
}

impl GrantState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GrantState::Revoked | GrantState::Expired)
    }
}

/// Kind of a signed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Code,
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Code => "code",
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-side status of an issued token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Active,
    /// Authorization code already exchanged.
    Used,
    /// Refresh token replaced by a newer one.
    Superseded,
    Revoked,
}

/// A freshly signed token as returned by the codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub value: String,
    pub kind: TokenKind,
    pub grant_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    pub fn record(&self) -> TokenRecord {
        TokenRecord {
            kind: self.kind,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            status: TokenStatus::Active,
        }
    }

    /// Remaining lifetime in whole seconds.
    pub fn expires_in(&self) -> u64 {
        (self.expires_at - Utc::now()).num_seconds().max(0) as u64
    }
}

/// Per-token bookkeeping kept inside its grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub kind: TokenKind,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TokenStatus,
}

impl TokenRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Server-side record of one authorization decision and its tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRecord {
    pub id: String,
    pub client_id: String,
    pub scope: BTreeSet<String>,
    pub subject: String,
    pub redirect_uri: String,
    /// PKCE S256 challenge recorded at authorization time.
    pub code_challenge: Option<String>,
    pub state: GrantState,
    /// Every token issued for this grant, keyed by token value.
    pub tokens: HashMap<String, TokenRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl GrantRecord {
    pub fn new(
        client_id: impl Into<String>,
        scope: BTreeSet<String>,
        subject: impl Into<String>,
        redirect_uri: impl Into<String>,
        code_challenge: Option<String>,
    ) -> Self {
        let now = Utc::now();
        GrantRecord {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.into(),
            scope,
            subject: subject.into(),
            redirect_uri: redirect_uri.into(),
            code_challenge,
            state: GrantState::Pending,
            tokens: HashMap::new(),
            created_at: now,
            updated_at: now,
            revoked_at: None,
        }
    }

    /// Space-delimited scope string.
    pub fn scope_string(&self) -> String {
        self.scope.iter().cloned().collect::<Vec<_>>().join(" ")
    }

    /// Records a newly issued token as active.
    pub fn attach(&mut self, token: &IssuedToken) {
        self.tokens.insert(token.value.clone(), token.record());
    }

    /// Tokens of the given kind that are still active.
    pub fn active(&self, kind: TokenKind) -> impl Iterator<Item = (&String, &TokenRecord)> {
        self.tokens
            .iter()
            .filter(move |(_, t)| t.kind == kind && t.status == TokenStatus::Active)
    }

    /// Forgets tokens that expired by `now`. Returns how many were dropped.
    ///
    /// Expired tokens fail verification on their own, so their records are
    /// no longer needed for reuse detection.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, t| !t.is_expired_at(now));
        before - self.tokens.len()
    }

    /// Moves the grant to `REVOKED` and marks every token revoked.
    pub fn revoke(&mut self, now: DateTime<Utc>) {
        if self.state == GrantState::Revoked {
            return;
        }
        self.state = GrantState::Revoked;
        self.revoked_at = Some(now);
        self.updated_at = now;
        for token in self.tokens.values_mut() {
            token.status = TokenStatus::Revoked;
        }
    }

    /// Moment after which nothing in this grant can verify anymore.
    pub fn horizon(&self) -> DateTime<Utc> {
        let latest_token = self.tokens.values().map(|t| t.expires_at).max();
        [Some(self.updated_at), latest_token, self.revoked_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.created_at)
    }
}

/// Successful token endpoint response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Introspection result. Inactive tokens only carry `active: false`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Introspection {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<TokenKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

impl Introspection {
    pub fn inactive() -> Self {
        Introspection::default()
    }
}

/// Why a grant was rejected. Only surfaces internally; the wire sees `invalid_grant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GrantFault {
    #[error("token is malformed or its signature does not verify")]
    Malformed,
    #[error("token is not known to the session store")]
    UnknownToken,
    #[error("authorization code already used")]
    CodeReused,
    #[error("PKCE code verifier does not match")]
    PkceMismatch,
    #[error("redirect uri does not match the authorization request")]
    RedirectMismatch,
    #[error("grant is not in a state that allows this operation")]
    WrongState,
}

/// Core OAuth2 error kinds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OAuthError {
    /// The client authentication failed.
    #[error("client authentication failed")]
    InvalidClient,
    /// The provided grant is invalid.
    #[error("invalid grant: {0}")]
    InvalidGrant(GrantFault),
    /// Requested scope is unknown.
    #[error("invalid scope `{0}`")]
    InvalidScope(String),
    /// The token has expired.
    #[error("token has expired")]
    Expired,
    /// The grant was revoked.
    #[error("grant has been revoked")]
    Revoked,
    /// The grant belongs to another client.
    #[error("grant is owned by another client")]
    ClientMismatch,
    #[error("unsupported grant type `{0}`")]
    UnsupportedGrantType(String),
    /// Signing key missing or rotated out.
    #[error("signing key `{0}` is unavailable")]
    KeyUnavailable(String),
    #[error("unsupported signing algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    /// Client is not allowed to use this grant type.
    #[error("client is not authorized for `{0}`")]
    UnauthorizedClient(String),
    #[error("redirect uri is not registered for this client")]
    InvalidRedirectUri,
    /// The resource owner refused consent.
    #[error("resource owner denied access")]
    AccessDenied,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid client metadata: {0}")]
    InvalidClientMetadata(String),
    #[error("grant `{0}` not found")]
    GrantNotFound(String),
    #[error("token not found")]
    TokenNotFound,
    /// Generic server-side error.
    #[error("server error: {0}")]
    ServerError(String),
}

/// Protocol-visible error, ready to be serialized by the HTTP front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl OAuthError {
    /// RFC 6749 error code. Grant failures all collapse to `invalid_grant`.
    pub fn error_code(&self) -> &'static str {
        match self {
            OAuthError::InvalidClient => "invalid_client",
            OAuthError::InvalidGrant(_)
            | OAuthError::Expired
            | OAuthError::Revoked
            | OAuthError::ClientMismatch
            | OAuthError::KeyUnavailable(_)
            | OAuthError::GrantNotFound(_)
            | OAuthError::TokenNotFound => "invalid_grant",
            OAuthError::InvalidScope(_) => "invalid_scope",
            OAuthError::UnsupportedGrantType(_) => "unsupported_grant_type",
            OAuthError::UnauthorizedClient(_) => "unauthorized_client",
            OAuthError::InvalidRedirectUri | OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::AccessDenied => "access_denied",
            OAuthError::InvalidClientMetadata(_) => "invalid_client_metadata",
            OAuthError::UnsupportedAlgorithm(_) | OAuthError::ServerError(_) => "server_error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            OAuthError::InvalidClient => 401,
            OAuthError::AccessDenied => 403,
            OAuthError::UnsupportedAlgorithm(_) | OAuthError::ServerError(_) => 500,
            _ => 400,
        }
    }

    fn description(&self) -> &'static str {
        match self.error_code() {
            "invalid_client" => "Client authentication failed",
            "invalid_grant" => "The provided authorization grant is invalid, expired, or revoked",
            "invalid_scope" => "The requested scope is invalid or unknown",
            "unsupported_grant_type" => "The grant type is not supported",
            "unauthorized_client" => "Client not authorized for this grant type",
            "invalid_request" => "The request is missing or has an invalid parameter",
            "access_denied" => "The resource owner denied the request",
            "invalid_client_metadata" => "Client metadata is invalid",
            _ => "Internal server error",
        }
    }

    /// Convert this error into a status code and JSON body without leaking internal detail.
    pub fn into_response(&self) -> ErrorResponse {
        let code = self.error_code();
        let status = self.status();
        warn!(error = %self, error_code = code, http_status = status, "OAuth error occurred");
        ErrorResponse {
            status,
            body: json!({ "error": code, "error_description": self.description() }),
        }
    }
}
