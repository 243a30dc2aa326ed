//! Token persistence trait abstraction.
//!
//! Secure on-disk storage is an external collaborator; the token store only
//! talks to it through [`CredentialsProvider`].

use async_trait::async_trait;

use crate::auth::TokenPair;

/// Credentials storage errors.
#[derive(Debug, Clone)]
pub enum CredentialsError {
    LoadFailed(String),
    SaveFailed(String),
    ClearFailed(String),
    Io(String),
    Serialization(String),
    Other(String),
}

impl std::fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialsError::LoadFailed(msg) => write!(f, "Failed to load credentials: {}", msg),
            CredentialsError::SaveFailed(msg) => write!(f, "Failed to save credentials: {}", msg),
            CredentialsError::ClearFailed(msg) => {
                write!(f, "Failed to clear credentials: {}", msg)
            }
            CredentialsError::Io(msg) => write!(f, "IO error: {}", msg),
            CredentialsError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            CredentialsError::Other(msg) => write!(f, "Credentials error: {}", msg),
        }
    }
}

impl std::error::Error for CredentialsError {}

/// Storage for the access/refresh token pair.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Load the stored pair.
    ///
    /// # Returns
    /// - `Ok(Some(pair))` if a pair with at least one token is stored
    /// - `Ok(None)` if nothing is stored
    /// - `Err(error)` if loading failed
    async fn load(&self) -> Result<Option<TokenPair>, CredentialsError>;

    async fn save(&self, tokens: &TokenPair) -> Result<(), CredentialsError>;

    /// Remove whatever is stored. Succeeds if nothing was stored.
    async fn clear(&self) -> Result<(), CredentialsError>;
}
