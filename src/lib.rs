pub mod config;
pub mod logging;
pub mod oauth_core;

#[cfg(feature = "openid")]
pub mod openid;

pub use jsonwebtoken::Algorithm;
pub use config::{ConfigError, CookiePolicy, KeyConfig, ServerConfig, TokenLifetimes};
pub use oauth_core::client_store::ClientStore;
pub use oauth_core::codec::{CodecError, TokenCodec, VerifiedToken};
pub use oauth_core::grant::{CodeExchange, GrantMachine, GrantPolicy, RefreshPolicy, TokenSet};
pub use oauth_core::keyset::{Jwk, JwkSet, KeySet, SigningKey};
pub use oauth_core::memory::{InMemoryClientStore, InMemorySessionStore};
pub use oauth_core::provider::{
    AuthorizationRequest, AuthorizationResponse, AuthorizationServer, Consent, SweepReport, TokenRequest,
};
pub use oauth_core::registration::{ClientRegistrationRequest, ClientRegistrationResponse};
pub use oauth_core::session_store::SessionStore;
pub use oauth_core::types::{
    Client, ClientAuthMethod, GrantFault, GrantRecord, GrantState, GrantType, Introspection, IssuedToken,
    OAuthError, TokenKind, TokenResponse,
};
