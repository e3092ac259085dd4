//! Publishing the public half of the key set.

use std::path::Path;

use tracing::info;

use crate::oauth_core::keyset::KeySet;

/// Path of the key set relative to the issuer.
pub const JWKS_PATH: &str = "static/jwks.json";

/// Writes the current public JWKS to `path`, creating parent directories.
pub async fn publish_jwks(keys: &KeySet, path: &Path) -> std::io::Result<()> {
    let jwks = keys.public_jwks().await;
    let body = serde_json::to_vec_pretty(&jwks)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body).await?;
    info!(path = %path.display(), keys = jwks.keys.len(), "published JWKS");
    Ok(())
}
