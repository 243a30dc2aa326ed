//! Token and identity models for the auth endpoints.

use serde::{Deserialize, Serialize};

use crate::wire::null_as_default;

/// The access/refresh credential pair.
///
/// `access.is_some()` means authenticated; both `None` means logged out.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenPair {
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub refresh: Option<String>,
}

impl TokenPair {
    pub fn new(access: &str, refresh: Option<String>) -> Self {
        Self {
            access: Some(access.to_string()),
            refresh,
        }
    }

    /// True when neither token is held.
    pub fn is_empty(&self) -> bool {
        self.access.is_none() && self.refresh.is_none()
    }

    pub fn is_authenticated(&self) -> bool {
        self.access.is_some()
    }
}

/// Snapshot of the authenticated user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    #[serde(default)]
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub username: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub email: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub first_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub last_name: String,
    #[serde(default)]
    pub date_joined: Option<String>,
}

/// Outcome of `login`/`register`. Failures carry a displayable message.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthResult {
    pub success: bool,
    pub identity: Option<Identity>,
    pub message: String,
}

impl AuthResult {
    pub fn ok(identity: Option<Identity>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            identity,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            identity: None,
            message: message.into(),
        }
    }
}

/// Sign-up form.
#[derive(Debug, Clone, Default)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

impl RegisterRequest {
    /// Wire body; the server wants the password twice.
    pub(crate) fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "username": self.username,
            "email": self.email,
            "password": self.password,
            "password_confirm": self.password,
            "first_name": self.first_name,
            "last_name": self.last_name,
        })
    }
}

/// Body of a successful login/register.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access: Option<String>,
    #[serde(default)]
    pub refresh: Option<String>,
    #[serde(default)]
    pub user: Option<Identity>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a successful refresh. `refresh` is present only when the server
/// rotates refresh tokens.
#[derive(Debug, Deserialize)]
pub(crate) struct RefreshResponse {
    pub access: Option<String>,
    #[serde(default)]
    pub refresh: Option<String>,
}
