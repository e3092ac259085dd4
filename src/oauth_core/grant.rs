//! Grant lifecycle: `PENDING → CODE_ISSUED → TOKEN_ISSUED`, with `REVOKED` and
//! `EXPIRED` as terminal states.
//!
//! New tokens are always signed *before* the grant is touched and only indexed
//! after the atomic update has committed. A request that loses a race, fails
//! validation or is cancelled mid-way therefore never leaves a resolvable token
//! behind.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::codec::{CodecError, TokenCodec};
use super::crypto::pkce_verify;
use super::session_store::SessionStore;
use super::types::{
    GrantFault, GrantRecord, GrantState, Introspection, IssuedToken, OAuthError, TokenKind, TokenStatus,
};

/// What happens to a refresh token when it is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Issue a new refresh token on every use; replaying an old one revokes the grant.
    #[default]
    Rotate,
    /// Keep the same refresh token until it expires.
    Reuse,
}

/// Lifetimes and policies applied by the [`GrantMachine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantPolicy {
    pub code_ttl: Duration,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub refresh: RefreshPolicy,
    /// Replaying an authorization code also revokes the grant it produced.
    pub revoke_on_code_reuse: bool,
    /// How long finished grants are kept before `sweep` drops them.
    pub retention: Duration,
}

impl Default for GrantPolicy {
    fn default() -> Self {
        GrantPolicy {
            code_ttl: Duration::from_secs(3600),
            access_ttl: Duration::from_secs(900),
            refresh_ttl: Duration::from_secs(86400),
            refresh: RefreshPolicy::Rotate,
            revoke_on_code_reuse: false,
            retention: Duration::from_secs(86400),
        }
    }
}

/// Tokens produced by a successful exchange or refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub grant_id: String,
    pub access: IssuedToken,
    pub refresh: Option<IssuedToken>,
    pub scope: BTreeSet<String>,
}

/// Parameters of an authorization code exchange.
#[derive(Debug, Clone, Default)]
pub struct CodeExchange {
    pub code: String,
    pub client_id: String,
    /// Must match the one used at authorization when present.
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    /// Issue a refresh token alongside the access token.
    pub with_refresh: bool,
}

/// Drives grants through their lifecycle on top of a [`SessionStore`] and a [`TokenCodec`].
#[derive(Clone)]
pub struct GrantMachine {
    store: Arc<dyn SessionStore>,
    codec: TokenCodec,
    policy: GrantPolicy,
}

impl GrantMachine {
    pub fn new(store: Arc<dyn SessionStore>, codec: TokenCodec, policy: GrantPolicy) -> Self {
        GrantMachine { store, codec, policy }
    }

    pub fn policy(&self) -> &GrantPolicy {
        &self.policy
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Snapshot of a grant.
    pub async fn grant(&self, grant_id: &str) -> Result<GrantRecord, OAuthError> {
        self.store.get(grant_id).await
    }

    /// Records a new authorization decision in `PENDING`.
    #[instrument(skip(self, scope, code_challenge), level = "debug")]
    pub async fn start(
        &self,
        client_id: &str,
        scope: BTreeSet<String>,
        subject: &str,
        redirect_uri: &str,
        code_challenge: Option<String>,
    ) -> Result<GrantRecord, OAuthError> {
        let grant = GrantRecord::new(client_id, scope, subject, redirect_uri, code_challenge);
        self.store.create(grant.clone()).await?;
        debug!(grant_id = %grant.id, "grant created");
        Ok(grant)
    }

    /// `PENDING → CODE_ISSUED`: emits the single authorization code of the grant.
    #[instrument(skip(self), level = "debug")]
    pub async fn issue_code(&self, grant_id: &str) -> Result<IssuedToken, OAuthError> {
        let code = self.codec.issue(TokenKind::Code, grant_id, self.policy.code_ttl).await?;
        let minted = code.clone();
        self.store
            .update(
                grant_id,
                Box::new(move |g: &mut GrantRecord| {
                    match g.state {
                        GrantState::Pending => {}
                        GrantState::Revoked => return Err(OAuthError::Revoked),
                        _ => return Err(OAuthError::InvalidGrant(GrantFault::WrongState)),
                    }
                    g.attach(&minted);
                    g.state = GrantState::CodeIssued;
                    Ok(())
                }),
            )
            .await?;
        self.store.index_token(&code.value, grant_id).await?;
        Ok(code)
    }

    /// `CODE_ISSUED → TOKEN_ISSUED`. A code can be exchanged exactly once.
    #[instrument(skip(self, request), fields(client_id = %request.client_id), level = "debug")]
    pub async fn exchange_code(&self, request: CodeExchange) -> Result<TokenSet, OAuthError> {
        let verified = match self.codec.verify_kind(&request.code, TokenKind::Code).await {
            Ok(token) => token,
            Err(CodecError::Expired) => return Err(self.settle_expired(&request.code, Some(&request.client_id)).await),
            Err(err) => return Err(err.into()),
        };
        let grant_id = self
            .locate(&request.code, &verified.grant_id, Some(&request.client_id))
            .await?;

        let access = self.codec.issue(TokenKind::Access, &grant_id, self.policy.access_ttl).await?;
        let refresh = if request.with_refresh {
            Some(self.codec.issue(TokenKind::Refresh, &grant_id, self.policy.refresh_ttl).await?)
        } else {
            None
        };

        let (new_access, new_refresh) = (access.clone(), refresh.clone());
        let CodeExchange { code, client_id, redirect_uri, code_verifier, .. } = request;
        let result = self
            .store
            .update(
                &grant_id,
                Box::new(move |g: &mut GrantRecord| {
                    if g.client_id != client_id {
                        return Err(OAuthError::ClientMismatch);
                    }
                    match g.state {
                        GrantState::Revoked => return Err(OAuthError::Revoked),
                        GrantState::Expired => return Err(OAuthError::Expired),
                        _ => {}
                    }
                    let status = g
                        .tokens
                        .get(&code)
                        .map(|t| t.status)
                        .ok_or(OAuthError::InvalidGrant(GrantFault::UnknownToken))?;
                    if status == TokenStatus::Used {
                        return Err(OAuthError::InvalidGrant(GrantFault::CodeReused));
                    }
                    if status != TokenStatus::Active || g.state != GrantState::CodeIssued {
                        return Err(OAuthError::InvalidGrant(GrantFault::WrongState));
                    }
                    if redirect_uri.is_some_and(|uri| uri != g.redirect_uri) {
                        return Err(OAuthError::InvalidGrant(GrantFault::RedirectMismatch));
                    }
                    let pkce_ok = match (&g.code_challenge, &code_verifier) {
                        (Some(challenge), Some(verifier)) => pkce_verify(challenge, verifier),
                        (None, None) => true,
                        _ => false,
                    };
                    if !pkce_ok {
                        return Err(OAuthError::InvalidGrant(GrantFault::PkceMismatch));
                    }

                    if let Some(record) = g.tokens.get_mut(&code) {
                        record.status = TokenStatus::Used;
                    }
                    g.attach(&new_access);
                    if let Some(refresh) = &new_refresh {
                        g.attach(refresh);
                    }
                    g.state = GrantState::TokenIssued;
                    Ok(())
                }),
            )
            .await;

        let grant = match result {
            Ok(grant) => grant,
            Err(OAuthError::InvalidGrant(GrantFault::CodeReused)) => {
                warn!(%grant_id, "authorization code replayed");
                if self.policy.revoke_on_code_reuse {
                    self.store.revoke(&grant_id).await?;
                }
                return Err(OAuthError::InvalidGrant(GrantFault::CodeReused));
            }
            Err(err) => return Err(err),
        };

        self.index(&grant_id, &access, refresh.as_ref()).await?;
        info!(%grant_id, "authorization code exchanged");
        Ok(TokenSet { grant_id, access, refresh, scope: grant.scope })
    }

    /// `TOKEN_ISSUED → TOKEN_ISSUED` on a refresh token. Replaying a superseded
    /// refresh token revokes the whole grant.
    #[instrument(skip(self, refresh_token), level = "debug")]
    pub async fn refresh(&self, refresh_token: &str, client_id: &str) -> Result<TokenSet, OAuthError> {
        let verified = match self.codec.verify_kind(refresh_token, TokenKind::Refresh).await {
            Ok(token) => token,
            Err(CodecError::Expired) => return Err(self.settle_expired(refresh_token, Some(client_id)).await),
            Err(err) => return Err(err.into()),
        };
        let grant_id = self.locate(refresh_token, &verified.grant_id, Some(client_id)).await?;

        let access = self.codec.issue(TokenKind::Access, &grant_id, self.policy.access_ttl).await?;
        let next_refresh = match self.policy.refresh {
            RefreshPolicy::Rotate => {
                Some(self.codec.issue(TokenKind::Refresh, &grant_id, self.policy.refresh_ttl).await?)
            }
            RefreshPolicy::Reuse => None,
        };

        let (new_access, new_refresh) = (access.clone(), next_refresh.clone());
        let (presented, owner) = (refresh_token.to_string(), client_id.to_string());
        let grant = self
            .store
            .update(
                &grant_id,
                Box::new(move |g: &mut GrantRecord| {
                    if g.client_id != owner {
                        return Err(OAuthError::ClientMismatch);
                    }
                    match g.state {
                        GrantState::TokenIssued => {}
                        GrantState::Revoked => return Err(OAuthError::Revoked),
                        GrantState::Expired => return Err(OAuthError::Expired),
                        _ => return Err(OAuthError::InvalidGrant(GrantFault::WrongState)),
                    }
                    let status = g
                        .tokens
                        .get(&presented)
                        .map(|t| t.status)
                        .ok_or(OAuthError::InvalidGrant(GrantFault::UnknownToken))?;
                    match status {
                        TokenStatus::Active => {}
                        TokenStatus::Superseded => {
                            // Reuse after rotation: commit the revocation, report it below.
                            g.revoke(Utc::now());
                            return Ok(());
                        }
                        TokenStatus::Revoked => return Err(OAuthError::Revoked),
                        TokenStatus::Used => return Err(OAuthError::InvalidGrant(GrantFault::WrongState)),
                    }
                    // Expired records can no longer be presented.
                    g.prune_expired(Utc::now());
                    if let Some(next) = &new_refresh {
                        if let Some(record) = g.tokens.get_mut(&presented) {
                            record.status = TokenStatus::Superseded;
                        }
                        g.attach(next);
                    }
                    g.attach(&new_access);
                    Ok(())
                }),
            )
            .await?;

        if grant.state == GrantState::Revoked {
            warn!(%grant_id, %client_id, "superseded refresh token replayed, grant revoked");
            self.store.revoke(&grant_id).await?;
            return Err(OAuthError::Revoked);
        }

        self.index(&grant_id, &access, next_refresh.as_ref()).await?;
        debug!(%grant_id, rotated = next_refresh.is_some(), "grant refreshed");
        Ok(TokenSet { grant_id, access, refresh: next_refresh, scope: grant.scope })
    }

    /// Reports whether `value` is a live token of a live grant.
    ///
    /// An expired token that was its grant's last live credential moves the
    /// grant to `EXPIRED`, the same as presenting it at the token endpoint.
    #[instrument(skip(self, value), level = "debug")]
    pub async fn introspect(&self, value: &str) -> Introspection {
        let verified = match self.codec.verify(value).await {
            Ok(token) => token,
            Err(CodecError::Expired) => {
                self.settle_expired(value, None).await;
                return Introspection::inactive();
            }
            Err(_) => return Introspection::inactive(),
        };
        let Ok(grant_id) = self.store.resolve(value).await else {
            return Introspection::inactive();
        };
        if grant_id != verified.grant_id {
            return Introspection::inactive();
        }
        let Ok(grant) = self.store.get(&grant_id).await else {
            return Introspection::inactive();
        };
        let live_token = grant
            .tokens
            .get(value)
            .is_some_and(|t| t.status == TokenStatus::Active && !t.is_expired_at(Utc::now()));
        let live_grant = matches!(grant.state, GrantState::CodeIssued | GrantState::TokenIssued);
        if !(live_token && live_grant) {
            return Introspection::inactive();
        }
        Introspection {
            active: true,
            kind: Some(verified.kind),
            expires_at: Some(verified.expires_at),
            scope: Some(grant.scope_string()),
            client_id: Some(grant.client_id),
            sub: Some(grant.subject),
            grant_id: Some(grant_id),
        }
    }

    /// Revokes the grant behind a token value, or the grant with that id.
    /// Unknown values are acknowledged without effect.
    #[instrument(skip(self, value), level = "debug")]
    pub async fn revoke(&self, value: &str) -> Result<(), OAuthError> {
        let grant_id = match self.store.resolve(value).await {
            Ok(grant_id) => grant_id,
            Err(OAuthError::TokenNotFound) => value.to_string(),
            Err(err) => return Err(err),
        };
        match self.store.revoke(&grant_id).await {
            Ok(()) => {
                info!(%grant_id, "grant revoked");
                Ok(())
            }
            Err(OAuthError::GrantNotFound(_)) => {
                debug!("revocation of unknown token acknowledged");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Drops grants past their retention window.
    pub async fn sweep(&self) -> Result<usize, OAuthError> {
        self.store.sweep_expired(self.policy.retention).await
    }

    /// Maps a verified token to its grant through the store, which stays
    /// authoritative for revocation.
    async fn locate(&self, value: &str, claimed: &str, client_id: Option<&str>) -> Result<String, OAuthError> {
        match self.store.resolve(value).await {
            Ok(grant_id) if grant_id == claimed => Ok(grant_id),
            Ok(_) => Err(OAuthError::InvalidGrant(GrantFault::Malformed)),
            Err(OAuthError::TokenNotFound) => {
                let Ok(grant) = self.store.get(claimed).await else {
                    return Err(OAuthError::InvalidGrant(GrantFault::UnknownToken));
                };
                if client_id.is_some_and(|id| id != grant.client_id) {
                    return Err(OAuthError::ClientMismatch);
                }
                match grant.state {
                    GrantState::Revoked => Err(OAuthError::Revoked),
                    GrantState::Expired => Err(OAuthError::Expired),
                    _ => Err(OAuthError::InvalidGrant(GrantFault::UnknownToken)),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Handles a token past its expiry: enforces client ownership when a
    /// client is presenting it and moves the grant to `EXPIRED` when the token
    /// was its last live credential.
    async fn settle_expired(&self, value: &str, client_id: Option<&str>) -> OAuthError {
        let Some((kind, claimed)) = TokenCodec::peek_grant(value) else {
            return OAuthError::Expired;
        };
        // The unverified claim is only trusted once the store confirms it.
        match self.store.resolve(value).await {
            Ok(grant_id) if grant_id == claimed => {}
            _ => return OAuthError::Expired,
        }
        let (presented, owner) = (value.to_string(), client_id.map(str::to_string));
        let outcome = self
            .store
            .update(
                &claimed,
                Box::new(move |g: &mut GrantRecord| {
                    if owner.is_some_and(|id| id != g.client_id) {
                        return Err(OAuthError::ClientMismatch);
                    }
                    if g.state.is_terminal() {
                        return Ok(());
                    }
                    let now = Utc::now();
                    let live = g
                        .tokens
                        .get(&presented)
                        .is_some_and(|t| t.status == TokenStatus::Active);
                    let successor = g
                        .active(TokenKind::Access)
                        .chain(g.active(TokenKind::Refresh))
                        .any(|(_, t)| !t.is_expired_at(now));
                    let lapses = match (kind, g.state) {
                        (TokenKind::Code, GrantState::CodeIssued) => live,
                        (TokenKind::Access | TokenKind::Refresh, GrantState::TokenIssued) => live && !successor,
                        _ => false,
                    };
                    if lapses {
                        g.state = GrantState::Expired;
                    }
                    Ok(())
                }),
            )
            .await;
        match outcome {
            Err(OAuthError::ClientMismatch) => OAuthError::ClientMismatch,
            Ok(grant) if grant.state == GrantState::Expired => {
                debug!(grant_id = %grant.id, "grant expired");
                OAuthError::Expired
            }
            _ => OAuthError::Expired,
        }
    }

    async fn index(&self, grant_id: &str, access: &IssuedToken, refresh: Option<&IssuedToken>) -> Result<(), OAuthError> {
        self.store.index_token(&access.value, grant_id).await?;
        if let Some(refresh) = refresh {
            self.store.index_token(&refresh.value, grant_id).await?;
        }
        Ok(())
    }
}
