//! Error types shared by the REST and streaming halves of the client.
//!
//! The REST side reports failures as [`ApiError`]; the streaming side reports
//! usage and handshake failures as [`SessionError`]. Transport-level errors
//! ([`HttpError`], [`WsError`]) live next to the traits that produce them and
//! convert into these.
//!
//! | Variant | Meaning |
//! |---------|---------|
//! | `ApiError::Network` | connector/transport failure, no response |
//! | `ApiError::Api` | non-2xx response with a decodable error body |
//! | `ApiError::Decode` | response body could not be parsed |
//! | `ApiError::Unauthenticated` | operation needs a token and none is held |

use serde_json::Value;
use thiserror::Error;

use crate::traits::{HttpError, WsError};
use crate::websocket::ChannelState;

/// Fallback detail when an error body is JSON but carries nothing usable.
pub const UNKNOWN_ERROR: &str = "unknown error";

/// Fallback detail when the response could not be read as JSON at all.
pub const CONNECTION_ERROR: &str = "connection error";

/// Failure of a REST call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error ({status}): {detail}")]
    Api { status: u16, detail: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Not authenticated")]
    Unauthenticated,
}

impl ApiError {
    /// Build the error for a non-success response from its status and raw body.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        match read_error_body(body) {
            ErrorBody::Detail(detail) => ApiError::Api { status, detail },
            ErrorBody::Unknown => ApiError::Api {
                status,
                detail: UNKNOWN_ERROR.to_string(),
            },
            ErrorBody::NotJson => {
                ApiError::Decode(format!("non-JSON error body (status {})", status))
            }
        }
    }

    /// True for a 401 from the server.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Api { status: 401, .. })
    }

    /// Message suitable for showing to an end user.
    ///
    /// Transport and decode failures collapse into a generic "connection error".
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Api { detail, .. } => detail.clone(),
            ApiError::Network(_) | ApiError::Decode(_) => CONNECTION_ERROR.to_string(),
            ApiError::Unauthenticated => "not authenticated".to_string(),
        }
    }
}

impl From<HttpError> for ApiError {
    fn from(err: HttpError) -> Self {
        ApiError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Failure of a [`StreamSession`](crate::websocket::StreamSession) operation.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// `connect` was called a second time on the same instance.
    #[error("connect called more than once on the same session")]
    AlreadyConnected,

    /// `connect` was called after the session left `Idle`.
    #[error("cannot connect from state {0:?}")]
    InvalidState(ChannelState),

    /// The handshake failed.
    #[error("transport error: {0}")]
    Transport(#[from] WsError),

    /// `disconnect` was called while the handshake was in flight.
    #[error("connect cancelled by disconnect")]
    Cancelled,
}

/// What an error response body turned out to contain.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ErrorBody {
    Detail(String),
    Unknown,
    NotJson,
}

/// Pull a human readable detail out of an error body.
///
/// Preference order: `detail`, then `error`, then the first value of the
/// object (first element if that value is a list, as DRF field errors are).
pub(crate) fn read_error_body(body: &[u8]) -> ErrorBody {
    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return ErrorBody::NotJson,
    };

    let Some(object) = value.as_object() else {
        return ErrorBody::Unknown;
    };

    for key in ["detail", "error"] {
        if let Some(text) = object.get(key).and_then(value_as_text) {
            return ErrorBody::Detail(text);
        }
    }

    object
        .values()
        .next()
        .and_then(|first| match first {
            Value::Array(items) => items.first().and_then(value_as_text),
            other => value_as_text(other),
        })
        .map(ErrorBody::Detail)
        .unwrap_or(ErrorBody::Unknown)
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        Value::Array(_) | Value::Object(_) => None,
        other => Some(other.to_string()),
    }
}
