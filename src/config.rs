//! Server configuration, loaded from JSON and validated once at startup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::logging::LogConfig;
use crate::oauth_core::grant::{GrantPolicy, RefreshPolicy};
use crate::oauth_core::keyset::{KeySet, SUPPORTED_ALGORITHMS, SigningKey};
use crate::oauth_core::registration::validate_redirect_uri;
use crate::oauth_core::types::{Client, ClientAuthMethod, OAuthError};

/// Environment variable naming the configuration file for the binary.
pub const CONFIG_ENV: &str = "STARBERRY_AS_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("key setup failed: {0}")]
    Key(#[from] OAuthError),
}

/// Token lifetimes in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenLifetimes {
    pub code: u64,
    pub access: u64,
    pub refresh: u64,
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        TokenLifetimes { code: 3600, access: 900, refresh: 86400 }
    }
}

/// Session cookie settings handed to the login front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookiePolicy {
    pub name: String,
    pub ttl_secs: u64,
    pub secure: bool,
}

impl Default for CookiePolicy {
    fn default() -> Self {
        CookiePolicy { name: "starberry_as".into(), ttl_secs: 4 * 3600, secure: true }
    }
}

/// One signing key. Material is generated when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Defaults to `op{n}` with `n` the position in the list.
    #[serde(default)]
    pub kid: Option<String>,
    pub alg: String,
    /// Base64url HMAC secret for HS* keys.
    #[serde(default)]
    pub secret: Option<String>,
    /// Base64 PKCS#8 document for ES256 / EdDSA keys.
    #[serde(default)]
    pub pkcs8: Option<String>,
}

impl KeyConfig {
    pub fn algorithm(&self) -> Result<Algorithm, ConfigError> {
        Algorithm::from_str(&self.alg)
            .map_err(|_| ConfigError::Invalid(format!("unknown key algorithm `{}`", self.alg)))
    }

    fn build(&self, index: usize) -> Result<SigningKey, ConfigError> {
        let kid = self.kid.clone().unwrap_or_else(|| format!("op{index}"));
        let alg = self.algorithm()?;
        let key = match (&self.secret, &self.pkcs8) {
            (Some(secret), _) => {
                let bytes = URL_SAFE_NO_PAD
                    .decode(secret.trim_end_matches('='))
                    .map_err(|_| ConfigError::Invalid(format!("secret of `{kid}` is not base64url")))?;
                SigningKey::from_secret(kid, alg, &bytes)?
            }
            (None, Some(der)) => {
                let bytes = STANDARD
                    .decode(der)
                    .map_err(|_| ConfigError::Invalid(format!("pkcs8 of `{kid}` is not base64")))?;
                SigningKey::from_pkcs8(kid, alg, &bytes)?
            }
            (None, None) => SigningKey::generate(kid, alg)?,
        };
        Ok(key)
    }
}

/// Upper bound on any configured lifetime (ten years).
pub const MAX_LIFETIME_SECS: u64 = 10 * 365 * 24 * 3600;

fn default_keys() -> Vec<KeyConfig> {
    vec![KeyConfig { kid: None, alg: "ES256".into(), secret: None, pkcs8: None }]
}

fn default_scopes() -> Vec<String> {
    ["openid", "profile", "email", "offline_access"].map(String::from).to_vec()
}

fn default_retention() -> u64 {
    86400
}

fn default_sweep_interval() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Absolute issuer URL, also the base for endpoint URLs.
    pub issuer: String,
    #[serde(default)]
    pub ttl: TokenLifetimes,
    #[serde(default)]
    pub refresh_policy: RefreshPolicy,
    #[serde(default)]
    pub revoke_on_code_reuse: bool,
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub cookie: CookiePolicy,
    /// First key is current at startup; later keys are rotated in, in order.
    #[serde(default = "default_keys")]
    pub keys: Vec<KeyConfig>,
    #[serde(default = "default_scopes")]
    pub scopes_supported: Vec<String>,
    /// Statically registered clients.
    #[serde(default)]
    pub clients: Vec<Client>,
    /// Where to write the public JWKS at startup.
    #[serde(default)]
    pub jwks_path: Option<PathBuf>,
    #[serde(default)]
    pub logging: LogConfig,
}

impl ServerConfig {
    /// A config with defaults for everything but the issuer.
    pub fn new(issuer: impl Into<String>) -> Self {
        ServerConfig {
            issuer: issuer.into(),
            ttl: TokenLifetimes::default(),
            refresh_policy: RefreshPolicy::default(),
            revoke_on_code_reuse: false,
            retention_secs: default_retention(),
            sweep_interval_secs: default_sweep_interval(),
            cookie: CookiePolicy::default(),
            keys: default_keys(),
            scopes_supported: default_scopes(),
            clients: Vec::new(),
            jwks_path: None,
            logging: LogConfig::default(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let issuer = Url::parse(&self.issuer)
            .map_err(|e| ConfigError::Invalid(format!("issuer `{}` is not a URL: {e}", self.issuer)))?;
        if !matches!(issuer.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid("issuer must be an http(s) URL".into()));
        }
        if issuer.query().is_some() || issuer.fragment().is_some() {
            return Err(ConfigError::Invalid("issuer must not carry a query or fragment".into()));
        }
        if self.ttl.code == 0 || self.ttl.access == 0 || self.ttl.refresh == 0 {
            return Err(ConfigError::Invalid("token lifetimes must be positive".into()));
        }
        for (name, secs) in [
            ("code", self.ttl.code),
            ("access", self.ttl.access),
            ("refresh", self.ttl.refresh),
            ("retention", self.retention_secs),
        ] {
            if secs > MAX_LIFETIME_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{name} lifetime of {secs}s exceeds the {MAX_LIFETIME_SECS}s limit"
                )));
            }
        }
        if self.cookie.name.trim().is_empty() {
            return Err(ConfigError::Invalid("cookie name must not be empty".into()));
        }
        if self.keys.is_empty() {
            return Err(ConfigError::Invalid("at least one signing key is required".into()));
        }
        let mut kids = HashSet::new();
        for (index, key) in self.keys.iter().enumerate() {
            let alg = key.algorithm()?;
            if !SUPPORTED_ALGORITHMS.contains(&alg) {
                return Err(ConfigError::Invalid(format!("unsupported key algorithm `{}`", key.alg)));
            }
            let kid = key.kid.clone().unwrap_or_else(|| format!("op{index}"));
            if !kids.insert(kid.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate key id `{kid}`")));
            }
        }
        let mut client_ids = HashSet::new();
        for client in &self.clients {
            if !client_ids.insert(client.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate client id `{}`", client.id)));
            }
            if client.redirect_uris.is_empty() {
                return Err(ConfigError::Invalid(format!("client `{}` has no redirect uri", client.id)));
            }
            for uri in &client.redirect_uris {
                validate_redirect_uri(uri).map_err(|e| ConfigError::Invalid(format!("client `{}`: {e}", client.id)))?;
            }
            if client.auth_method != ClientAuthMethod::None && client.secret.is_none() {
                return Err(ConfigError::Invalid(format!("confidential client `{}` has no secret", client.id)));
            }
        }
        Ok(())
    }

    pub fn grant_policy(&self) -> GrantPolicy {
        GrantPolicy {
            code_ttl: Duration::from_secs(self.ttl.code),
            access_ttl: Duration::from_secs(self.ttl.access),
            refresh_ttl: Duration::from_secs(self.ttl.refresh),
            refresh: self.refresh_policy,
            revoke_on_code_reuse: self.revoke_on_code_reuse,
            retention: Duration::from_secs(self.retention_secs),
        }
    }

    /// Builds the key set: the first configured key becomes current, the
    /// rest are rotated in so the last one ends up current.
    pub async fn build_keyset(&self) -> Result<KeySet, ConfigError> {
        let mut keys = self.keys.iter().enumerate().map(|(i, k)| k.build(i));
        let first = keys
            .next()
            .ok_or_else(|| ConfigError::Invalid("at least one signing key is required".into()))??;
        let set = KeySet::new(first)?;
        for key in keys {
            set.rotate(key?).await?;
        }
        Ok(set)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
