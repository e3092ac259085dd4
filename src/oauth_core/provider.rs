//! Authorization server facade: the operations an HTTP front-end calls.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use url::Url;

use super::client_store::ClientStore;
use super::codec::TokenCodec;
use super::crypto::{random_secret, secrets_match};
use super::grant::{CodeExchange, GrantMachine, GrantPolicy, TokenSet};
use super::keyset::{JwkSet, KeySet, SigningKey};
use super::memory::{InMemoryClientStore, InMemorySessionStore};
use super::registration::{CLIENT_SECRET_BYTES, ClientRegistrationRequest, ClientRegistrationResponse};
use super::session_store::SessionStore;
use super::types::{Client, ClientAuthMethod, GrantType, Introspection, OAuthError, TokenResponse};
use crate::config::{ConfigError, CookiePolicy, ServerConfig};

/// The end-user's decision on the consent screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consent {
    Granted,
    Denied,
}

/// Authorization endpoint input, after the user has logged in and decided.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub client_id: String,
    pub redirect_uri: String,
    /// Space-delimited scope string.
    pub scope: String,
    /// Authenticated end-user identifier.
    pub subject: String,
    pub consent: Consent,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    /// Opaque client state echoed back on the redirect.
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationResponse {
    pub code: String,
    pub redirect_uri: String,
    pub grant_id: String,
    pub state: Option<String>,
}

impl AuthorizationResponse {
    /// Redirect target carrying `code` and `state` as query parameters.
    pub fn redirect_url(&self) -> Result<Url, OAuthError> {
        let mut url = Url::parse(&self.redirect_uri).map_err(|_| OAuthError::InvalidRedirectUri)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("code", &self.code);
            if let Some(state) = &self.state {
                query.append_pair("state", state);
            }
        }
        Ok(url)
    }
}

/// Token endpoint input.
#[derive(Debug, Clone, Default)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code_or_refresh_token: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub grants: usize,
    pub keys: usize,
}

/// Splits a space-delimited scope string.
pub fn parse_scope(scope: &str) -> BTreeSet<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// The authorization server. Cheap to clone; all state sits behind `Arc`s.
#[derive(Clone)]
pub struct AuthorizationServer {
    issuer: String,
    keys: Arc<KeySet>,
    clients: Arc<dyn ClientStore>,
    sessions: Arc<dyn SessionStore>,
    policy: GrantPolicy,
    grants: GrantMachine,
    scopes_supported: BTreeSet<String>,
    cookie: CookiePolicy,
}

impl AuthorizationServer {
    /// Creates a server with in-memory stores and default policies.
    pub fn new(issuer: impl Into<String>, keys: KeySet) -> Self {
        let issuer = issuer.into();
        let keys = Arc::new(keys);
        let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let policy = GrantPolicy::default();
        let grants = GrantMachine::new(sessions.clone(), TokenCodec::new(keys.clone(), issuer.clone()), policy.clone());
        AuthorizationServer {
            issuer,
            keys,
            clients: Arc::new(InMemoryClientStore::new(Vec::new())),
            sessions,
            policy,
            grants,
            scopes_supported: ["openid", "profile", "email", "offline_access"].map(String::from).into(),
            cookie: CookiePolicy::default(),
        }
    }

    /// Builds the server described by a validated config.
    pub async fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let keys = config.build_keyset().await?;
        let server = AuthorizationServer::new(config.issuer.clone(), keys)
            .client_store(Arc::new(InMemoryClientStore::new(config.clients.clone())))
            .policy(config.grant_policy())
            .scopes_supported(config.scopes_supported.iter().cloned())
            .cookie(config.cookie.clone());
        info!(
            issuer = %server.issuer,
            clients = config.clients.len(),
            keys = config.keys.len(),
            "authorization server configured"
        );
        Ok(server)
    }

    /// Sets a custom client store.
    pub fn client_store(mut self, store: Arc<dyn ClientStore>) -> Self {
        self.clients = store;
        self
    }

    /// Sets a custom session store.
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = store;
        self.rewire()
    }

    /// Overrides lifetimes and refresh policy.
    pub fn policy(mut self, policy: GrantPolicy) -> Self {
        self.policy = policy;
        self.rewire()
    }

    pub fn scopes_supported<I: IntoIterator<Item = String>>(mut self, scopes: I) -> Self {
        self.scopes_supported = scopes.into_iter().collect();
        self
    }

    pub fn cookie(mut self, cookie: CookiePolicy) -> Self {
        self.cookie = cookie;
        self
    }

    fn rewire(mut self) -> Self {
        let codec = TokenCodec::new(self.keys.clone(), self.issuer.clone());
        self.grants = GrantMachine::new(self.sessions.clone(), codec, self.policy.clone());
        self
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn keys(&self) -> &Arc<KeySet> {
        &self.keys
    }

    pub fn grants(&self) -> &GrantMachine {
        &self.grants
    }

    /// Settings for the login session cookie.
    pub fn cookie_policy(&self) -> &CookiePolicy {
        &self.cookie
    }

    /// Records the user's decision and issues an authorization code.
    #[instrument(skip(self, request), fields(client_id = %request.client_id))]
    pub async fn authorize(&self, request: AuthorizationRequest) -> Result<AuthorizationResponse, OAuthError> {
        let client = self.clients.get_client(&request.client_id).await?;
        if !client.redirect_uris.contains(&request.redirect_uri) {
            return Err(OAuthError::InvalidRedirectUri);
        }
        if !client.allows(GrantType::AuthorizationCode) {
            return Err(OAuthError::UnauthorizedClient(GrantType::AuthorizationCode.as_str().into()));
        }
        let scope = parse_scope(&request.scope);
        if let Some(unknown) = scope.iter().find(|s| !self.scopes_supported.contains(*s)) {
            return Err(OAuthError::InvalidScope(unknown.clone()));
        }
        if request.consent == Consent::Denied {
            debug!("consent denied");
            return Err(OAuthError::AccessDenied);
        }
        let code_challenge = match (request.code_challenge, request.code_challenge_method.as_deref()) {
            (Some(challenge), Some("S256")) => Some(challenge),
            (Some(_), _) => return Err(OAuthError::InvalidRequest("only S256 code challenges are supported".into())),
            (None, Some(_)) => return Err(OAuthError::InvalidRequest("code_challenge_method without code_challenge".into())),
            (None, None) if client.is_public() => {
                return Err(OAuthError::InvalidRequest("public clients must use PKCE".into()));
            }
            (None, None) => None,
        };

        let grant = self
            .grants
            .start(&client.id, scope, &request.subject, &request.redirect_uri, code_challenge)
            .await?;
        let code = self.grants.issue_code(&grant.id).await?;
        info!(grant_id = %grant.id, "authorization code issued");
        Ok(AuthorizationResponse {
            code: code.value,
            redirect_uri: request.redirect_uri,
            grant_id: grant.id,
            state: request.state,
        })
    }

    /// Token endpoint: code exchange or refresh.
    #[instrument(skip(self, request), fields(client_id = %request.client_id, grant_type = %request.grant_type))]
    pub async fn issue_token(&self, request: TokenRequest) -> Result<TokenResponse, OAuthError> {
        let grant_type = GrantType::parse(&request.grant_type)?;
        let client = self.authenticate(&request.client_id, request.client_secret.as_deref()).await?;
        if !client.allows(grant_type) {
            return Err(OAuthError::UnauthorizedClient(grant_type.as_str().into()));
        }

        let outcome = match grant_type {
            GrantType::AuthorizationCode => {
                self.grants
                    .exchange_code(CodeExchange {
                        code: request.code_or_refresh_token,
                        client_id: client.id.clone(),
                        redirect_uri: request.redirect_uri,
                        code_verifier: request.code_verifier,
                        with_refresh: client.allows(GrantType::RefreshToken),
                    })
                    .await
            }
            GrantType::RefreshToken => self.grants.refresh(&request.code_or_refresh_token, &client.id).await,
        };
        match outcome {
            Ok(tokens) => Ok(token_response(tokens)),
            Err(err) => {
                warn!(error = %err, "token request rejected");
                Err(err)
            }
        }
    }

    /// Token introspection (RFC 7662). Never fails; unknown tokens are inactive.
    pub async fn introspect(&self, token: &str) -> Introspection {
        self.grants.introspect(token).await
    }

    /// Revokes the grant behind a token, or a grant by id.
    pub async fn revoke(&self, token_or_grant_id: &str) -> Result<(), OAuthError> {
        self.grants.revoke(token_or_grant_id).await
    }

    /// Dynamic client registration.
    #[instrument(skip(self, request))]
    pub async fn register_client(
        &self,
        request: ClientRegistrationRequest,
    ) -> Result<ClientRegistrationResponse, OAuthError> {
        let (client, response) = request.into_client()?;
        let client_id = client.id.clone();
        self.clients.insert_client(client).await?;
        info!(%client_id, auth_method = %response.token_endpoint_auth_method, "client registered");
        Ok(response)
    }

    /// Issues a new secret for a confidential client; the old one stops working.
    #[instrument(skip(self))]
    pub async fn rotate_client_secret(&self, client_id: &str) -> Result<String, OAuthError> {
        let client = self.clients.get_client(client_id).await?;
        if client.is_public() {
            return Err(OAuthError::InvalidRequest("public clients have no secret".into()));
        }
        let secret = random_secret(CLIENT_SECRET_BYTES)?;
        self.clients.update_secret(client_id, secret.clone()).await?;
        info!("client secret rotated");
        Ok(secret)
    }

    /// Makes `key` the current signing key. Tokens signed with earlier keys keep verifying.
    pub async fn rotate_signing_key(&self, key: SigningKey) -> Result<(), OAuthError> {
        self.keys.rotate(key).await
    }

    /// Drops grants past retention and keys past their validity window.
    pub async fn sweep(&self) -> Result<SweepReport, OAuthError> {
        let grants = self.grants.sweep().await?;
        let keys = self.keys.prune_retired().await;
        if grants > 0 || keys > 0 {
            debug!(grants, keys, "sweep finished");
        }
        Ok(SweepReport { grants, keys })
    }

    /// Public signing keys.
    pub async fn jwks(&self) -> JwkSet {
        self.keys.public_jwks().await
    }

    /// Discovery document.
    #[cfg(feature = "openid")]
    pub fn provider_info(&self) -> crate::openid::ProviderMetadata {
        crate::openid::ProviderMetadata::new(&self.issuer, &self.scopes_supported, self.keys.allowed_algorithms())
    }

    async fn authenticate(&self, client_id: &str, secret: Option<&str>) -> Result<Client, OAuthError> {
        let client = self.clients.get_client(client_id).await.map_err(|_| OAuthError::InvalidClient)?;
        let authenticated = match (client.auth_method, client.secret.as_deref(), secret) {
            (ClientAuthMethod::None, _, None) => true,
            (ClientAuthMethod::None, _, Some(_)) => false,
            (_, Some(expected), Some(provided)) => secrets_match(expected, provided),
            _ => false,
        };
        if !authenticated {
            warn!(%client_id, "client authentication failed");
            return Err(OAuthError::InvalidClient);
        }
        Ok(client)
    }
}

fn token_response(tokens: TokenSet) -> TokenResponse {
    let scope = (!tokens.scope.is_empty()).then(|| tokens.scope.iter().cloned().collect::<Vec<_>>().join(" "));
    TokenResponse {
        expires_in: tokens.access.expires_in(),
        access_token: tokens.access.value,
        token_type: "Bearer".into(),
        refresh_token: tokens.refresh.map(|t| t.value),
        scope,
    }
}
