//! File-based token persistence.
//!
//! Tokens are stored as pretty JSON in `~/.baymax/credentials.json` unless a
//! path is given explicitly.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::auth::TokenPair;
use crate::traits::{CredentialsError, CredentialsProvider};

const CREDENTIALS_DIR: &str = ".baymax";
const CREDENTIALS_FILE: &str = "credentials.json";

/// [`CredentialsProvider`] writing the token pair to a JSON file.
#[derive(Debug, Clone)]
pub struct FileCredentialsProvider {
    path: PathBuf,
}

impl FileCredentialsProvider {
    /// Provider at the default location under the home directory.
    pub fn new() -> Result<Self, CredentialsError> {
        let home = dirs::home_dir().ok_or_else(|| {
            CredentialsError::Other("Failed to determine home directory".to_string())
        })?;
        Ok(Self {
            path: home.join(CREDENTIALS_DIR).join(CREDENTIALS_FILE),
        })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn credentials_path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialsProvider for FileCredentialsProvider {
    async fn load(&self) -> Result<Option<TokenPair>, CredentialsError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CredentialsError::LoadFailed(e.to_string())),
        };

        let tokens: TokenPair = serde_json::from_slice(&raw)
            .map_err(|e| CredentialsError::Serialization(e.to_string()))?;

        if tokens.is_empty() {
            Ok(None)
        } else {
            Ok(Some(tokens))
        }
    }

    async fn save(&self, tokens: &TokenPair) -> Result<(), CredentialsError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CredentialsError::Io(e.to_string()))?;
        }

        let json = serde_json::to_vec_pretty(tokens)
            .map_err(|e| CredentialsError::Serialization(e.to_string()))?;

        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| CredentialsError::SaveFailed(e.to_string()))
    }

    async fn clear(&self) -> Result<(), CredentialsError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CredentialsError::ClearFailed(e.to_string())),
        }
    }
}
