//! Token store: login, registration, refresh and auth header derivation.
//!
//! The store is the only owner of the [`TokenPair`]. It is meant to be shared
//! behind an `Arc` by the report client and stream sessions, so every method
//! takes `&self`.
//!
//! Refresh is single-flight: a `tokio::sync::Mutex` gate serializes refresh
//! requests, and callers that queued behind an in-flight refresh take its
//! outcome instead of issuing their own. Against a rotating refresh token a
//! second request would invalidate the first.
//!
//! Login, registration and logout do not wait for the gate. Each of them
//! starts a new epoch, and a refresh that completes in a later epoch than it
//! started in leaves the tokens alone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::models::{AuthResult, Identity, RefreshResponse, RegisterRequest, TokenPair, TokenResponse};
use crate::config::ClientConfig;
use crate::error::{ApiError, CONNECTION_ERROR};
use crate::traits::{CredentialsProvider, Headers, HttpClient};

const REGISTERED_MESSAGE: &str = "registered";

/// Holds and refreshes the bearer credential used by every authenticated call.
pub struct TokenStore {
    http: Arc<dyn HttpClient>,
    api_base: String,
    tokens: RwLock<TokenPair>,
    /// Serializes refreshes; holds the outcome of the last one.
    refresh_gate: Mutex<bool>,
    /// Bumped every time a refresh completes.
    refresh_generation: AtomicU64,
    /// Bumped whenever the pair is replaced other than by a refresh.
    epoch: AtomicU64,
    credentials: Option<Arc<dyn CredentialsProvider>>,
}

impl TokenStore {
    /// Store talking to `api_base` (e.g. `http://127.0.0.1:8000/api`).
    pub fn new(http: Arc<dyn HttpClient>, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens: RwLock::new(TokenPair::default()),
            refresh_gate: Mutex::new(false),
            refresh_generation: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            credentials: None,
        }
    }

    pub fn from_config(config: &ClientConfig, http: Arc<dyn HttpClient>) -> Self {
        Self::new(http, config.api_url.clone())
    }

    /// Persist every token change through `provider`.
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Load a previously saved pair from the credentials provider.
    ///
    /// Returns true if a pair was loaded. Storage failures are logged and
    /// leave the store logged out.
    pub async fn restore(&self) -> bool {
        let Some(provider) = &self.credentials else {
            return false;
        };

        match provider.load().await {
            Ok(Some(pair)) => {
                debug!("Restored saved tokens");
                self.set_tokens(pair);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to load saved tokens: {}", e);
                false
            }
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Absolute URL for an API path such as `/auth/login/`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Snapshot of the current pair.
    pub fn tokens(&self) -> TokenPair {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.tokens().access
    }

    fn refresh_token(&self) -> Option<String> {
        self.tokens().refresh
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens().is_authenticated()
    }

    /// Headers for an API call, computed from the pair as it is right now.
    pub fn auth_headers(&self) -> Headers {
        let mut headers = json_headers();
        if let Some(access) = self.access_token() {
            headers.insert("Authorization".to_string(), format!("Bearer {}", access));
        }
        headers
    }

    /// Create an account. Success is a 201 carrying a token pair.
    pub async fn register(&self, request: &RegisterRequest) -> AuthResult {
        info!("Registering user {}", request.username);
        self.authenticate("/auth/register/", request.to_body(), 201, REGISTERED_MESSAGE)
            .await
    }

    /// Log in with username and password. Success is a 200 carrying a token pair.
    pub async fn login(&self, username: &str, password: &str) -> AuthResult {
        info!("Logging in as {}", username);
        let body = json!({ "username": username, "password": password });
        self.authenticate("/auth/login/", body, 200, "").await
    }

    async fn authenticate(
        &self,
        path: &str,
        body: serde_json::Value,
        success_status: u16,
        fallback_message: &str,
    ) -> AuthResult {
        let url = self.url(path);
        let response = match self.http.post(&url, &body.to_string(), &json_headers()).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Request to {} failed: {}", path, e);
                return AuthResult::failed(CONNECTION_ERROR);
            }
        };

        if response.status != success_status {
            let err = ApiError::from_response(response.status, &response.body);
            debug!("{} rejected: {}", path, err);
            return AuthResult::failed(err.user_message());
        }

        let parsed: TokenResponse = match response.json() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Unreadable {} response: {}", path, e);
                return AuthResult::failed(CONNECTION_ERROR);
            }
        };

        let Some(access) = parsed.access else {
            warn!("{} response carried no access token", path);
            return AuthResult::failed(CONNECTION_ERROR);
        };

        self.set_tokens(TokenPair {
            access: Some(access),
            refresh: parsed.refresh,
        });
        self.persist().await;

        info!("Authenticated");
        AuthResult::ok(
            parsed.user,
            parsed.message.unwrap_or_else(|| fallback_message.to_string()),
        )
    }

    /// Notify the server (best effort) and drop both tokens. Idempotent.
    pub async fn logout(&self) {
        if let Some(refresh) = self.refresh_token() {
            let body = json!({ "refresh": refresh }).to_string();
            match self
                .http
                .post(&self.url("/auth/logout/"), &body, &self.auth_headers())
                .await
            {
                Ok(response) if !response.is_success() => {
                    debug!("Logout notification returned {}", response.status);
                }
                Ok(_) => {}
                Err(e) => debug!("Logout notification failed: {}", e),
            }
        }

        self.clear_tokens().await;
        info!("Logged out");
    }

    /// Mint a new access token from the refresh token.
    ///
    /// Returns false without a request when no refresh token is held. Any
    /// other failure clears both tokens. Callers that arrive while a refresh
    /// is in flight wait for it and return its outcome.
    pub async fn refresh(&self) -> bool {
        let seen = self.refresh_generation.load(Ordering::SeqCst);
        let mut last_outcome = self.refresh_gate.lock().await;

        if self.refresh_generation.load(Ordering::SeqCst) != seen {
            debug!("Joined a refresh that completed while waiting");
            return *last_outcome;
        }

        let outcome = self.refresh_locked().await;
        *last_outcome = outcome;
        self.refresh_generation.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    /// Refresh after the server rejected `rejected_access` with a 401.
    ///
    /// Only refreshes if that token is still the current one; if another
    /// caller already replaced it, returns whether a token is held now.
    pub async fn refresh_rejected(&self, rejected_access: &str) -> bool {
        let mut last_outcome = self.refresh_gate.lock().await;

        let current = self.access_token();
        if current.as_deref() != Some(rejected_access) {
            debug!("Rejected token already replaced, skipping refresh");
            return current.is_some();
        }

        let outcome = self.refresh_locked().await;
        *last_outcome = outcome;
        self.refresh_generation.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    /// The refresh request itself. Caller must hold the gate.
    async fn refresh_locked(&self) -> bool {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let Some(refresh) = self.refresh_token() else {
            debug!("No refresh token held");
            return false;
        };

        let body = json!({ "refresh": refresh }).to_string();
        let response = match self
            .http
            .post(&self.url("/auth/refresh/"), &body, &json_headers())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                self.drop_refreshed(epoch).await;
                return false;
            }
        };

        if response.status != 200 {
            warn!("Token refresh rejected with status {}", response.status);
            self.drop_refreshed(epoch).await;
            return false;
        }

        match response.json::<RefreshResponse>() {
            Ok(RefreshResponse {
                access: Some(access),
                refresh: rotated,
            }) => {
                if rotated.is_some() {
                    debug!("Server rotated the refresh token");
                }
                let refreshed = TokenPair {
                    access: Some(access),
                    refresh: rotated.or(Some(refresh)),
                };
                if !self.replace_in_epoch(epoch, refreshed) {
                    info!("Tokens changed while refreshing, discarding the result");
                    return false;
                }
                self.persist().await;
                info!("Access token refreshed");
                true
            }
            Ok(_) => {
                warn!("Refresh response carried no access token");
                self.drop_refreshed(epoch).await;
                false
            }
            Err(e) => {
                warn!("Unreadable refresh response: {}", e);
                self.drop_refreshed(epoch).await;
                false
            }
        }
    }

    /// Fetch the authenticated user's profile.
    pub async fn fetch_profile(&self) -> Result<Identity, ApiError> {
        if !self.is_authenticated() {
            return Err(ApiError::Unauthenticated);
        }

        let response = self
            .http
            .get(&self.url("/auth/profile/"), &self.auth_headers())
            .await?;

        if response.status != 200 {
            return Err(ApiError::from_response(response.status, &response.body));
        }

        Ok(response.json()?)
    }

    /// Profile, or `None` if not authenticated or the fetch failed.
    pub async fn profile(&self) -> Option<Identity> {
        match self.fetch_profile().await {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!("Profile unavailable: {}", e);
                None
            }
        }
    }

    /// Change the password. True iff the server answered 200.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> bool {
        let body = json!({
            "old_password": old_password,
            "new_password": new_password,
            "new_password_confirm": new_password,
        })
        .to_string();

        match self
            .http
            .post(&self.url("/auth/change-password/"), &body, &self.auth_headers())
            .await
        {
            Ok(response) => response.status == 200,
            Err(e) => {
                warn!("Password change failed: {}", e);
                false
            }
        }
    }

    /// Replace the pair and start a new epoch.
    pub(crate) fn set_tokens(&self, pair: TokenPair) {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        *tokens = pair;
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Replace the pair only if no login, registration or logout happened
    /// since `epoch`.
    fn replace_in_epoch(&self, epoch: u64, pair: TokenPair) -> bool {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        *tokens = pair;
        true
    }

    /// Clear after a failed refresh, unless the pair it used is already gone.
    async fn drop_refreshed(&self, epoch: u64) {
        if self.replace_in_epoch(epoch, TokenPair::default()) {
            self.persist().await;
        } else {
            debug!("Tokens changed while refreshing, keeping them");
        }
    }

    async fn clear_tokens(&self) {
        self.set_tokens(TokenPair::default());
        self.persist().await;
    }

    /// Mirror the current pair into the credentials provider, if any.
    async fn persist(&self) {
        let Some(provider) = &self.credentials else {
            return;
        };

        let tokens = self.tokens();
        let result = if tokens.is_empty() {
            provider.clear().await
        } else {
            provider.save(&tokens).await
        };

        if let Err(e) = result {
            warn!("Failed to persist tokens: {}", e);
        }
    }
}

fn json_headers() -> Headers {
    let mut headers = Headers::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers
}
