//! OAuth2 authorization server core.

pub mod client_store;
pub mod codec;
pub mod crypto;
pub mod grant;
pub mod keyset;
pub mod memory;
pub mod provider;
pub mod registration;
pub mod session_store;
pub mod types;
