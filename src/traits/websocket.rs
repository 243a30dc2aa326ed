//! WebSocket connector trait abstraction.
//!
//! A [`WsConnector`] performs the handshake and hands back the two halves of
//! the channel: a sink for outbound text envelopes and a stream of inbound
//! frames. The stream session owns both halves after that; nothing else in
//! the crate touches the transport.

use async_trait::async_trait;
use futures::{Sink, Stream};
use std::pin::Pin;

use super::http::Headers;

/// WebSocket transport errors.
#[derive(Debug, Clone, PartialEq)]
pub enum WsError {
    /// Handshake failed (refused, DNS, TLS, HTTP upgrade rejected)
    ConnectionFailed(String),
    /// The peer went away without a close frame
    Disconnected,
    SendFailed(String),
    /// Read side failed after the channel was open
    ReceiveFailed(String),
    InvalidUrl(String),
}

impl std::fmt::Display for WsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WsError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WsError::Disconnected => write!(f, "Disconnected from server"),
            WsError::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            WsError::ReceiveFailed(msg) => write!(f, "Receive failed: {}", msg),
            WsError::InvalidUrl(msg) => write!(f, "Invalid URL: {}", msg),
        }
    }
}

impl std::error::Error for WsError {}

/// One inbound unit from the transport, after control frames are handled.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    /// The peer sent a close frame.
    Close,
}

/// Outbound half: accepts serialized JSON envelopes.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = WsError> + Send>>;

/// Inbound half: yields frames until the transport ends.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<InboundFrame, WsError>> + Send>>;

/// Opens WebSocket channels.
///
/// # Example
///
/// ```ignore
/// use baymax::traits::{WsConnector, Headers};
///
/// async fn open<C: WsConnector>(connector: &C) {
///     let (sink, stream) = connector
///         .connect("ws://127.0.0.1:8000/ws/analysis/7/", &Headers::new())
///         .await?;
/// }
/// ```
#[async_trait]
pub trait WsConnector: Send + Sync {
    /// Perform the handshake against `url`, sending `headers` with the upgrade
    /// request.
    async fn connect(&self, url: &str, headers: &Headers)
        -> Result<(FrameSink, FrameStream), WsError>;
}
