//! Envelopes exchanged over the analysis channel.
//!
//! Inbound text is decoded by its `type` discriminator into an
//! [`AnalysisEvent`]. Discriminators this client does not know are ignored so
//! that a newer server never breaks the stream.

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::traits::WsError;
use crate::wire::{null_as_default, sparse_scores};

/// Server-defined overall state of the subject in one frame.
///
/// Anything unrecognized, including a missing value, reads as `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallState {
    #[default]
    Normal,
    Anxious,
    Stressed,
    Nervous,
}

impl OverallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallState::Normal => "normal",
            OverallState::Anxious => "anxious",
            OverallState::Stressed => "stressed",
            OverallState::Nervous => "nervous",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "anxious" => OverallState::Anxious,
            "stressed" => OverallState::Stressed,
            "nervous" => OverallState::Nervous,
            _ => OverallState::Normal,
        }
    }
}

impl fmt::Display for OverallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OverallState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<Value>::deserialize(deserializer)?;
        Ok(match raw {
            Some(Value::String(s)) => OverallState::parse(&s),
            _ => OverallState::Normal,
        })
    }
}

/// Per-frame inference result.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub emotion: Option<String>,
    /// Confidence per emotion label; keys are not guaranteed exhaustive
    #[serde(default, deserialize_with = "sparse_scores")]
    pub emotion_scores: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub head_down: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hunched: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hands_on_face: bool,
    #[serde(default)]
    pub overall_state: OverallState,
    /// Passed through unparsed
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
}

impl AnalysisResult {
    /// True if any posture flag is raised.
    pub fn has_posture_flag(&self) -> bool {
        self.head_down || self.hunched || self.hands_on_face
    }
}

/// Accumulated metrics, forwarded as the server sent them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MetricsUpdate {
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl MetricsUpdate {
    /// Best-effort typed view of the payload.
    pub fn typed(&self) -> Option<SessionMetrics> {
        serde_json::from_value(Value::Object(self.payload.clone())).ok()
    }
}

/// Typed shape of the server's session metrics.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionMetrics {
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_frames: u64,
    #[serde(default, deserialize_with = "sparse_scores")]
    pub emotion_percentages: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub posture_counts: PostureCounts,
    #[serde(default, deserialize_with = "null_as_default")]
    pub alerts: Vec<MetricAlert>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PostureCounts {
    #[serde(default)]
    pub head_down: u64,
    #[serde(default)]
    pub hunched: u64,
    #[serde(default)]
    pub hands_on_face: u64,
}

/// Alert raised while a session runs.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MetricAlert {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub severity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorEvent {
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
}

/// Sent by the server once a subject-bound session is created.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionStarted {
    #[serde(default)]
    pub session_id: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
}

/// Sent by the server after a `stop`, right before it closes the channel.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionEnded {
    #[serde(default)]
    pub metrics: Option<SessionMetrics>,
}

/// A decoded server event.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisEvent {
    AnalysisResult(AnalysisResult),
    MetricsUpdate(MetricsUpdate),
    /// Server-reported error, or a local transport failure
    ErrorEvent(ErrorEvent),
    SessionStarted(SessionStarted),
    SessionEnded(SessionEnded),
}

impl AnalysisEvent {
    pub fn error(message: impl Into<String>) -> Self {
        AnalysisEvent::ErrorEvent(ErrorEvent {
            message: message.into(),
        })
    }

    /// The event published when the transport fails.
    pub fn transport_error(err: &WsError) -> Self {
        Self::error(err.to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, AnalysisEvent::ErrorEvent(_))
    }
}

/// Wire form of server envelopes, with a catch-all for unknown types.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEnvelope {
    #[serde(rename = "analysis_result")]
    AnalysisResult(AnalysisResult),
    #[serde(rename = "metrics")]
    Metrics(MetricsUpdate),
    #[serde(rename = "error")]
    Error(ErrorEvent),
    #[serde(rename = "session_started")]
    SessionStarted(SessionStarted),
    #[serde(rename = "session_ended")]
    SessionEnded(SessionEnded),
    #[serde(other)]
    Unknown,
}

/// Decode one inbound text frame.
///
/// Returns `None` for unknown discriminators, envelopes without a `type`, and
/// malformed JSON; the caller drops those and keeps the channel going.
pub fn decode_event(text: &str) -> Option<AnalysisEvent> {
    match serde_json::from_str::<ServerEnvelope>(text) {
        Ok(ServerEnvelope::AnalysisResult(result)) => Some(AnalysisEvent::AnalysisResult(result)),
        Ok(ServerEnvelope::Metrics(metrics)) => Some(AnalysisEvent::MetricsUpdate(metrics)),
        Ok(ServerEnvelope::Error(error)) => Some(AnalysisEvent::ErrorEvent(error)),
        Ok(ServerEnvelope::SessionStarted(started)) => Some(AnalysisEvent::SessionStarted(started)),
        Ok(ServerEnvelope::SessionEnded(ended)) => Some(AnalysisEvent::SessionEnded(ended)),
        Ok(ServerEnvelope::Unknown) => {
            debug!("Ignoring envelope with unknown type");
            None
        }
        Err(e) => {
            warn!("Dropping undecodable envelope: {} - {}", e, text);
            None
        }
    }
}

/// Something the caller may push onto an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    /// Encoded image bytes (JPEG, PNG, ...)
    Frame(Bytes),
    GetMetrics,
    Stop,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientEnvelope {
    Frame { image: String },
    GetMetrics,
    Stop,
}

impl OutboundCommand {
    pub fn is_frame(&self) -> bool {
        matches!(self, OutboundCommand::Frame(_))
    }

    /// Serialize to the JSON envelope the server expects.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let envelope = match self {
            OutboundCommand::Frame(bytes) => ClientEnvelope::Frame {
                image: STANDARD.encode(bytes),
            },
            OutboundCommand::GetMetrics => ClientEnvelope::GetMetrics,
            OutboundCommand::Stop => ClientEnvelope::Stop,
        };
        serde_json::to_string(&envelope)
    }
}
