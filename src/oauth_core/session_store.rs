//! Grant persistence contract.
//!
//! A session store keeps one [`GrantRecord`] per authorization grant and an
//! index from every issued token value to its grant. Writes to a single grant
//! are linearized through [`SessionStore::update`]; different grants never
//! contend with each other.

use std::time::Duration;

use async_trait::async_trait;

use super::types::{GrantRecord, OAuthError};

/// Read-modify-write step applied to a grant. Returning `Err` commits nothing.
pub type GrantMutator = Box<dyn FnOnce(&mut GrantRecord) -> Result<(), OAuthError> + Send>;

#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Stores a new grant. Fails if the id is already taken.
    async fn create(&self, grant: GrantRecord) -> Result<(), OAuthError>;

    /// Fetches a snapshot of a grant.
    async fn get(&self, grant_id: &str) -> Result<GrantRecord, OAuthError>;

    /// Atomically applies `mutator` to the grant and returns the committed record.
    /// Tokens the mutator removes from `GrantRecord::tokens` stop resolving.
    async fn update(&self, grant_id: &str, mutator: GrantMutator) -> Result<GrantRecord, OAuthError>;

    /// Makes `token` resolvable to `grant_id`.
    async fn index_token(&self, token: &str, grant_id: &str) -> Result<(), OAuthError>;

    /// Grant id an indexed token belongs to.
    async fn resolve(&self, token: &str) -> Result<String, OAuthError>;

    /// Marks the grant revoked and makes all of its tokens unresolvable.
    async fn revoke(&self, grant_id: &str) -> Result<(), OAuthError>;

    /// Removes grants whose horizon plus `retention` has passed. Returns the number removed.
    async fn sweep_expired(&self, retention: Duration) -> Result<usize, OAuthError>;
}
