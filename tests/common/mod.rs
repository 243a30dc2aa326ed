//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use baymax::adapters::{InMemoryCredentials, ReqwestHttpClient};
use baymax::auth::{TokenPair, TokenStore};
use wiremock::MockServer;

/// REST base of a wiremock server, matching the real `/api` prefix.
pub fn api_base(server: &MockServer) -> String {
    format!("{}/api", server.uri())
}

/// Logged-out token store talking to `server`.
pub fn store_for(server: &MockServer) -> TokenStore {
    TokenStore::new(Arc::new(ReqwestHttpClient::new()), api_base(server))
}

/// Token store talking to `server` that already holds `access`/`refresh`.
pub async fn store_with_tokens(server: &MockServer, access: &str, refresh: &str) -> TokenStore {
    let saved = InMemoryCredentials::with_tokens(TokenPair::new(access, Some(refresh.to_string())));
    let store = store_for(server).with_credentials(Arc::new(saved));
    assert!(store.restore().await);
    store
}
