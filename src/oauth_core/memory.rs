//! In-memory default implementations for the OAuth core stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, instrument};

use super::client_store::ClientStore;
use super::session_store::{GrantMutator, SessionStore};
use super::types::{Client, GrantRecord, GrantState, OAuthError};

#[derive(Clone, Default)]
pub struct InMemoryClientStore {
    clients: Arc<DashMap<String, Client>>,
}

impl InMemoryClientStore {
    /// Creates a new in-memory client store with an initial set of clients.
    pub fn new(initial_clients: Vec<Client>) -> Self {
        let map = DashMap::new();
        for client in initial_clients {
            map.insert(client.id.clone(), client);
        }
        Self { clients: Arc::new(map) }
    }
}

#[async_trait]
impl ClientStore for InMemoryClientStore {
    async fn get_client(&self, id: &str) -> Result<Client, OAuthError> {
        self.clients
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(OAuthError::InvalidClient)
    }

    async fn insert_client(&self, client: Client) -> Result<(), OAuthError> {
        match self.clients.entry(client.id.clone()) {
            Entry::Occupied(_) => Err(OAuthError::InvalidClientMetadata(format!(
                "client id `{}` already registered",
                client.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(client);
                Ok(())
            }
        }
    }

    async fn update_secret(&self, id: &str, secret: String) -> Result<(), OAuthError> {
        let mut entry = self.clients.get_mut(id).ok_or(OAuthError::InvalidClient)?;
        entry.secret = Some(secret);
        Ok(())
    }
}

/// Session store backed by two concurrent maps: grants by id and token value to grant id.
///
/// Lock order is always grant entry first, then token index.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    grants: Arc<DashMap<String, GrantRecord>>,
    index: Arc<DashMap<String, String>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of grants currently held.
    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }

    /// Number of resolvable token values.
    pub fn indexed_tokens(&self) -> usize {
        self.index.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, grant: GrantRecord) -> Result<(), OAuthError> {
        match self.grants.entry(grant.id.clone()) {
            Entry::Occupied(_) => Err(OAuthError::ServerError(format!("grant `{}` already exists", grant.id))),
            Entry::Vacant(slot) => {
                slot.insert(grant);
                Ok(())
            }
        }
    }

    async fn get(&self, grant_id: &str) -> Result<GrantRecord, OAuthError> {
        self.grants
            .get(grant_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OAuthError::GrantNotFound(grant_id.to_string()))
    }

    async fn update(&self, grant_id: &str, mutator: GrantMutator) -> Result<GrantRecord, OAuthError> {
        let mut entry = self
            .grants
            .get_mut(grant_id)
            .ok_or_else(|| OAuthError::GrantNotFound(grant_id.to_string()))?;
        // Work on a copy so a failing mutator leaves the stored grant untouched.
        let mut draft = entry.value().clone();
        mutator(&mut draft)?;
        draft.updated_at = Utc::now();
        let dropped: Vec<String> = entry
            .tokens
            .keys()
            .filter(|token| !draft.tokens.contains_key(*token))
            .cloned()
            .collect();
        *entry.value_mut() = draft.clone();
        for token in &dropped {
            self.index.remove(token);
        }
        if !dropped.is_empty() {
            debug!(%grant_id, dropped = dropped.len(), "pruned token records unindexed");
        }
        Ok(draft)
    }

    async fn index_token(&self, token: &str, grant_id: &str) -> Result<(), OAuthError> {
        let grant = self
            .grants
            .get(grant_id)
            .ok_or_else(|| OAuthError::GrantNotFound(grant_id.to_string()))?;
        if grant.state == GrantState::Revoked {
            return Err(OAuthError::Revoked);
        }
        self.index.insert(token.to_string(), grant_id.to_string());
        Ok(())
    }

    async fn resolve(&self, token: &str) -> Result<String, OAuthError> {
        self.index
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or(OAuthError::TokenNotFound)
    }

    #[instrument(skip(self), level = "debug")]
    async fn revoke(&self, grant_id: &str) -> Result<(), OAuthError> {
        let mut entry = self
            .grants
            .get_mut(grant_id)
            .ok_or_else(|| OAuthError::GrantNotFound(grant_id.to_string()))?;
        entry.revoke(Utc::now());
        for token in entry.tokens.keys() {
            self.index.remove(token);
        }
        debug!(tokens = entry.tokens.len(), "grant revoked");
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn sweep_expired(&self, retention: Duration) -> Result<usize, OAuthError> {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(retention)
            .map_err(|_| OAuthError::ServerError("retention window out of range".into()))?;
        let candidates: Vec<String> = self
            .grants
            .iter()
            .filter(|g| now >= g.horizon() + retention)
            .map(|g| g.key().clone())
            .collect();

        let mut removed = 0;
        for id in candidates {
            // Re-check under the entry lock; the grant may have moved on since the scan.
            if let Some((_, grant)) = self.grants.remove_if(&id, |_, g| now >= g.horizon() + retention) {
                for token in grant.tokens.keys() {
                    self.index.remove(token);
                }
                removed += 1;
            }
        }
        debug!(removed, "expired grants swept");
        Ok(removed)
    }
}
