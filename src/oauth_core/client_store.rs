//! Client registry contract.

use async_trait::async_trait;

use super::types::{Client, OAuthError};

/// Trait for retrieving and registering OAuth2 clients.
#[async_trait]
pub trait ClientStore: Send + Sync + 'static {
    /// Retrieves a client by its identifier.
    async fn get_client(&self, id: &str) -> Result<Client, OAuthError>;

    /// Adds a client. Fails if the identifier is taken.
    async fn insert_client(&self, client: Client) -> Result<(), OAuthError>;

    /// Replaces the secret of an existing client.
    async fn update_secret(&self, id: &str, secret: String) -> Result<(), OAuthError>;
}
