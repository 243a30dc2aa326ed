//! In-memory token storage for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::auth::TokenPair;
use crate::traits::{CredentialsError, CredentialsProvider};

/// [`CredentialsProvider`] keeping the pair in memory.
///
/// Clones share state, so a test can hand one clone to a `TokenStore` and
/// inspect what it persisted through the other.
///
/// # Example
///
/// ```ignore
/// use baymax::adapters::mock::InMemoryCredentials;
/// use baymax::auth::TokenPair;
///
/// let storage = InMemoryCredentials::with_tokens(TokenPair::new("A1", Some("R1".into())));
/// assert_eq!(storage.stored().unwrap().access.as_deref(), Some("A1"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentials {
    tokens: Arc<Mutex<Option<TokenPair>>>,
    save_should_fail: Arc<AtomicBool>,
    load_should_fail: Arc<AtomicBool>,
    save_count: Arc<AtomicUsize>,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that already holds a pair.
    pub fn with_tokens(tokens: TokenPair) -> Self {
        let provider = Self::default();
        *provider.tokens.lock().unwrap() = Some(tokens);
        provider
    }

    pub fn set_save_should_fail(&self, should_fail: bool) {
        self.save_should_fail.store(should_fail, Ordering::SeqCst);
    }

    pub fn set_load_should_fail(&self, should_fail: bool) {
        self.load_should_fail.store(should_fail, Ordering::SeqCst);
    }

    /// What is currently stored.
    pub fn stored(&self) -> Option<TokenPair> {
        self.tokens.lock().unwrap().clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialsProvider for InMemoryCredentials {
    async fn load(&self) -> Result<Option<TokenPair>, CredentialsError> {
        if self.load_should_fail.load(Ordering::SeqCst) {
            return Err(CredentialsError::LoadFailed("Mock load failure".to_string()));
        }
        Ok(self.tokens.lock().unwrap().clone())
    }

    async fn save(&self, tokens: &TokenPair) -> Result<(), CredentialsError> {
        if self.save_should_fail.load(Ordering::SeqCst) {
            return Err(CredentialsError::SaveFailed("Mock save failure".to_string()));
        }
        *self.tokens.lock().unwrap() = Some(tokens.clone());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CredentialsError> {
        *self.tokens.lock().unwrap() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_clear() {
        let provider = InMemoryCredentials::new();
        assert!(provider.load().await.unwrap().is_none());

        let tokens = TokenPair::new("A1", Some("R1".to_string()));
        provider.save(&tokens).await.unwrap();
        assert_eq!(provider.load().await.unwrap(), Some(tokens));
        assert_eq!(provider.save_count(), 1);

        provider.clear().await.unwrap();
        assert!(provider.stored().is_none());
    }

    #[tokio::test]
    async fn test_failures() {
        let provider = InMemoryCredentials::with_tokens(TokenPair::new("A1", None));
        provider.set_load_should_fail(true);
        provider.set_save_should_fail(true);

        assert!(matches!(
            provider.load().await,
            Err(CredentialsError::LoadFailed(_))
        ));
        assert!(matches!(
            provider.save(&TokenPair::default()).await,
            Err(CredentialsError::SaveFailed(_))
        ));
        // Failed save leaves the old pair in place
        assert_eq!(provider.stored(), Some(TokenPair::new("A1", None)));
        assert_eq!(provider.save_count(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let provider = InMemoryCredentials::new();
        let cloned = provider.clone();
        *provider.tokens.lock().unwrap() = Some(TokenPair::new("shared", None));
        assert_eq!(cloned.stored().unwrap().access.as_deref(), Some("shared"));
    }
}
