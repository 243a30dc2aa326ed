//! Tungstenite-based WebSocket connector.
//!
//! Performs the upgrade with `tokio-tungstenite`, splits the socket and maps
//! both halves onto the crate's text-envelope types. Ping/pong is handled by
//! tungstenite itself and never reaches the session.

use async_trait::async_trait;
use futures_util::{future, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::traits::{FrameSink, FrameStream, Headers, InboundFrame, WsConnector, WsError};

/// [`WsConnector`] over `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Map one tungstenite message to an inbound frame, dropping control frames.
fn map_message(
    msg: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<InboundFrame, WsError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text))),
        Ok(Message::Binary(data)) => match String::from_utf8(data) {
            Ok(text) => Some(Ok(InboundFrame::Text(text))),
            Err(_) => {
                debug!("Dropping non-UTF-8 binary frame");
                None
            }
        },
        Ok(Message::Close(_)) => Some(Ok(InboundFrame::Close)),
        Ok(_) => None,
        Err(e) => Some(Err(WsError::ReceiveFailed(e.to_string()))),
    }
}

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
        headers: &Headers,
    ) -> Result<(FrameSink, FrameStream), WsError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| WsError::InvalidUrl(e.to_string()))?;

        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| WsError::ConnectionFailed(format!("bad header {}: {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| WsError::ConnectionFailed(format!("bad header {}: {}", key, e)))?;
            request.headers_mut().insert(name, value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;

        debug!("WebSocket handshake completed for {}", url);

        let (ws_sink, ws_stream) = ws_stream.split();

        let sink = ws_sink
            .sink_map_err(|e| WsError::SendFailed(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, WsError>(Message::Text(text))));
        let stream = ws_stream.filter_map(|msg| future::ready(map_message(msg)));

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_message_text() {
        let frame = map_message(Ok(Message::Text("{\"type\":\"metrics\"}".to_string())));
        assert_eq!(
            frame,
            Some(Ok(InboundFrame::Text("{\"type\":\"metrics\"}".to_string())))
        );
    }

    #[test]
    fn test_map_message_close_and_control() {
        assert_eq!(map_message(Ok(Message::Close(None))), Some(Ok(InboundFrame::Close)));
        assert_eq!(map_message(Ok(Message::Ping(vec![1]))), None);
        assert_eq!(map_message(Ok(Message::Pong(vec![1]))), None);
    }

    #[test]
    fn test_map_message_binary() {
        assert_eq!(
            map_message(Ok(Message::Binary(b"{}".to_vec()))),
            Some(Ok(InboundFrame::Text("{}".to_string())))
        );
        assert_eq!(map_message(Ok(Message::Binary(vec![0xff, 0xfe]))), None);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let connector = TungsteniteConnector::new();
        let result = connector
            .connect("ws://127.0.0.1:59999/ws/analysis/", &Headers::new())
            .await;
        assert!(matches!(result, Err(WsError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_connect_invalid_url() {
        let connector = TungsteniteConnector::new();
        let result = connector.connect("not a url", &Headers::new()).await;
        assert!(matches!(result, Err(WsError::InvalidUrl(_))));
    }
}
