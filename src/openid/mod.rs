//! OpenID Connect provider surface: discovery metadata and the published key set.

pub mod discovery;
pub mod jwks;

pub use discovery::ProviderMetadata;
pub use jwks::{JWKS_PATH, publish_jwks};
