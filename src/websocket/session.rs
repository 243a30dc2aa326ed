//! One logical real-time analysis channel.
//!
//! `StreamSession` runs the `Idle -> Connecting -> Open -> Closing -> Closed`
//! state machine. Once open, a background task multiplexes inbound frames and
//! outbound commands with `tokio::select!` and publishes decoded events to the
//! session's [`EventHub`]. `Closed` is terminal; reconnecting means a new
//! session, which is what [`SupervisedSession`](super::SupervisedSession) does.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use super::hub::{EventHub, EventStream};
use super::messages::{decode_event, AnalysisEvent, OutboundCommand};
use crate::auth::TokenStore;
use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::traits::{FrameSink, FrameStream, Headers, InboundFrame, WsConnector, WsError};

/// Longest wait for the transport to finish a local close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Which subject a session analyses; determines the channel address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionHandle {
    pub subject_id: Option<i64>,
}

impl SessionHandle {
    pub fn for_subject(subject_id: i64) -> Self {
        Self {
            subject_id: Some(subject_id),
        }
    }

    /// A session not bound to any subject.
    pub fn anonymous() -> Self {
        Self { subject_id: None }
    }

    /// `<ws_base>/ws/analysis/{id}/`, or `<ws_base>/ws/analysis/` without one.
    pub fn url(&self, ws_base: &str) -> String {
        let base = ws_base.trim_end_matches('/');
        match self.subject_id {
            Some(id) => format!("{}/ws/analysis/{}/", base, id),
            None => format!("{}/ws/analysis/", base),
        }
    }
}

/// Builds fresh sessions sharing one connector, address and token store.
#[derive(Clone)]
pub struct SessionFactory {
    connector: Arc<dyn WsConnector>,
    ws_base: String,
    tokens: Option<Arc<TokenStore>>,
}

impl SessionFactory {
    pub fn new(connector: Arc<dyn WsConnector>, ws_base: impl Into<String>) -> Self {
        Self {
            connector,
            ws_base: ws_base.into(),
            tokens: None,
        }
    }

    pub fn from_config(config: &ClientConfig, connector: Arc<dyn WsConnector>) -> Self {
        Self::new(connector, config.ws_url.clone())
    }

    /// Send the store's bearer token with each handshake.
    pub fn with_tokens(mut self, tokens: Arc<TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn create(&self) -> StreamSession {
        let session = StreamSession::new(self.connector.clone(), self.ws_base.clone());
        match &self.tokens {
            Some(tokens) => session.with_tokens(tokens.clone()),
            None => session,
        }
    }
}

/// Manages one analysis channel: open, push, receive, close.
pub struct StreamSession {
    connector: Arc<dyn WsConnector>,
    ws_base: String,
    tokens: Option<Arc<TokenStore>>,
    hub: Arc<EventHub>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    state_rx: watch::Receiver<ChannelState>,
    connect_called: AtomicBool,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<OutboundCommand>>>,
    /// Commands queued for the channel task and not yet written
    backlog: Arc<AtomicUsize>,
    /// Signalled after each write
    written: Arc<Notify>,
    /// Wakes the handshake or the channel task on `disconnect`.
    cancel: Arc<Notify>,
}

impl StreamSession {
    pub fn new(connector: Arc<dyn WsConnector>, ws_base: impl Into<String>) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Idle);
        Self {
            connector,
            ws_base: ws_base.into(),
            tokens: None,
            hub: Arc::new(EventHub::new()),
            state_tx: Arc::new(state_tx),
            state_rx,
            connect_called: AtomicBool::new(false),
            outbound_tx: Mutex::new(None),
            backlog: Arc::new(AtomicUsize::new(0)),
            written: Arc::new(Notify::new()),
            cancel: Arc::new(Notify::new()),
        }
    }

    pub fn with_tokens(mut self, tokens: Arc<TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Subscribe to state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Subscribe to events from now on. Completes when the session closes.
    pub fn events(&self) -> EventStream {
        self.hub.subscribe()
    }

    /// Move `from -> to` atomically. False if the state was not `from`.
    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        transition(&self.state_tx, from, to)
    }

    fn handshake_headers(&self) -> Headers {
        let mut headers = Headers::new();
        if let Some(access) = self.tokens.as_ref().and_then(|t| t.access_token()) {
            headers.insert("Authorization".to_string(), format!("Bearer {}", access));
        }
        headers
    }

    /// Open the channel for `handle`.
    ///
    /// May be called once per instance. A failed handshake publishes one
    /// `ErrorEvent` and closes the session; a `disconnect` while the handshake
    /// is in flight aborts it with [`SessionError::Cancelled`].
    pub async fn connect(&self, handle: SessionHandle) -> Result<(), SessionError> {
        if self.connect_called.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyConnected);
        }

        if !self.transition(ChannelState::Idle, ChannelState::Connecting) {
            return Err(SessionError::InvalidState(self.state()));
        }

        let url = handle.url(&self.ws_base);
        let headers = self.handshake_headers();
        info!("Connecting to {}", url);

        let handshake = tokio::select! {
            result = self.connector.connect(&url, &headers) => Some(result),
            _ = self.cancel.notified() => None,
        };

        let (sink, stream) = match handshake {
            None => {
                debug!("Handshake cancelled by disconnect");
                return Err(SessionError::Cancelled);
            }
            Some(Err(e)) => {
                error!("Handshake with {} failed: {}", url, e);
                if self.transition(ChannelState::Connecting, ChannelState::Closed) {
                    self.hub.publish(AnalysisEvent::transport_error(&e));
                    self.hub.close();
                }
                return Err(SessionError::Transport(e));
            }
            Some(Ok(halves)) => halves,
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self
            .outbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outbound_tx);

        if !self.transition(ChannelState::Connecting, ChannelState::Open) {
            debug!("Disconnected during handshake, dropping channel");
            self.outbound_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let mut sink = sink;
            let _ = sink.close().await;
            return Err(SessionError::Cancelled);
        }

        info!("Channel open at {}", url);

        tokio::spawn(run_channel(
            sink,
            stream,
            Outbound {
                rx: outbound_rx,
                backlog: self.backlog.clone(),
                written: self.written.clone(),
            },
            self.hub.clone(),
            self.state_tx.clone(),
            self.cancel.clone(),
        ));

        Ok(())
    }

    fn enqueue(&self, command: OutboundCommand) {
        if !self.is_open() {
            debug!("Channel not open, dropping {}", command_name(&command));
            return;
        }

        let outbound = self
            .outbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = outbound.as_ref() {
            self.backlog.fetch_add(1, Ordering::SeqCst);
            if tx.send(command).is_err() {
                self.backlog.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Commands accepted while open that the transport has not written yet.
    ///
    /// Stays put while the peer stops reading; callers that produce frames
    /// faster than the transport drains them should hold back while it is
    /// non-zero.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    /// Wait for the channel task to write a command. A write that happened
    /// since the last call counts.
    pub async fn written(&self) {
        self.written.notified().await
    }

    /// Upload one encoded frame. No-op unless the channel is open.
    pub fn send_frame(&self, image: impl Into<Bytes>) {
        self.enqueue(OutboundCommand::Frame(image.into()));
    }

    /// Ask the server for accumulated metrics. No-op unless open.
    pub fn request_metrics(&self) {
        self.enqueue(OutboundCommand::GetMetrics);
    }

    /// Ask the server to end the analysis session. No-op unless open.
    pub fn stop(&self) {
        self.enqueue(OutboundCommand::Stop);
    }

    /// Tear the session down from any state. Idempotent.
    ///
    /// No event is published after this returns; the event streams complete
    /// once the channel task has closed the transport.
    pub fn disconnect(&self) {
        let mut previous = ChannelState::Closed;
        self.state_tx.send_if_modified(|state| {
            previous = *state;
            match *state {
                ChannelState::Idle | ChannelState::Connecting => {
                    *state = ChannelState::Closed;
                    true
                }
                ChannelState::Open => {
                    *state = ChannelState::Closing;
                    true
                }
                ChannelState::Closing | ChannelState::Closed => false,
            }
        });

        self.hub.mute();

        match previous {
            ChannelState::Idle => {
                debug!("Disconnect before connect");
                self.hub.close();
            }
            ChannelState::Connecting => {
                info!("Disconnect during handshake");
                self.cancel.notify_one();
                self.hub.close();
            }
            ChannelState::Open => {
                info!("Disconnecting");
                self.outbound_tx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                self.cancel.notify_one();
            }
            ChannelState::Closing | ChannelState::Closed => {}
        }
    }

    /// Wait until the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|state| *state == ChannelState::Closed).await;
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn transition(
    state_tx: &watch::Sender<ChannelState>,
    from: ChannelState,
    to: ChannelState,
) -> bool {
    state_tx.send_if_modified(|state| {
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    })
}

fn command_name(command: &OutboundCommand) -> &'static str {
    match command {
        OutboundCommand::Frame(_) => "frame",
        OutboundCommand::GetMetrics => "get_metrics",
        OutboundCommand::Stop => "stop",
    }
}

/// Why the channel task stopped.
enum ChannelEnd {
    Local,
    RemoteClose,
    Failed(WsError),
}

/// Receiving half of a session's outbound commands.
struct Outbound {
    rx: mpsc::UnboundedReceiver<OutboundCommand>,
    backlog: Arc<AtomicUsize>,
    written: Arc<Notify>,
}

impl Outbound {
    fn done(&self) {
        self.backlog.fetch_sub(1, Ordering::SeqCst);
        self.written.notify_one();
    }
}

/// Background loop for an open channel.
async fn run_channel(
    mut sink: FrameSink,
    mut stream: FrameStream,
    mut outbound: Outbound,
    hub: Arc<EventHub>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    cancel: Arc<Notify>,
) {
    let end = loop {
        tokio::select! {
            biased;

            _ = cancel.notified() => {
                debug!("Disconnect requested, closing channel");
                break ChannelEnd::Local;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(InboundFrame::Text(text))) => {
                        if let Some(event) = decode_event(&text) {
                            hub.publish(event);
                        }
                    }
                    Some(Ok(InboundFrame::Close)) => {
                        info!("Received close frame from server");
                        break ChannelEnd::RemoteClose;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break ChannelEnd::Failed(e);
                    }
                    None => {
                        warn!("WebSocket stream ended without a close frame");
                        break ChannelEnd::Failed(WsError::Disconnected);
                    }
                }
            }

            command = outbound.rx.recv() => {
                let Some(command) = command else {
                    debug!("Session dropped its sender, closing channel");
                    break ChannelEnd::Local;
                };
                let json = match command.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize {}: {}", command_name(&command), e);
                        outbound.done();
                        continue;
                    }
                };
                debug!("Sending {}", command_name(&command));
                // A peer that stops reading must not block disconnect
                let sent = tokio::select! {
                    result = sink.send(json) => result,
                    _ = cancel.notified() => {
                        debug!("Disconnect requested during a pending send");
                        break ChannelEnd::Local;
                    }
                };
                if let Err(e) = sent {
                    error!("Failed to send {}: {}", command_name(&command), e);
                    break ChannelEnd::Failed(e);
                }
                outbound.done();
            }
        }
    };

    transition(&state_tx, ChannelState::Open, ChannelState::Closing);

    if let ChannelEnd::Failed(e) = &end {
        hub.publish(AnalysisEvent::transport_error(e));
    }

    if !matches!(end, ChannelEnd::RemoteClose)
        && tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err()
    {
        warn!("Transport did not close within {:?}", CLOSE_TIMEOUT);
    }

    state_tx.send_replace(ChannelState::Closed);
    hub.close();
    info!("Channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{HandshakeOutcome, MockConnector};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn session_with(connector: &MockConnector) -> StreamSession {
        StreamSession::new(Arc::new(connector.clone()), "ws://test")
    }

    #[test]
    fn test_handle_urls() {
        assert_eq!(
            SessionHandle::for_subject(7).url("ws://h:8000"),
            "ws://h:8000/ws/analysis/7/"
        );
        assert_eq!(
            SessionHandle::anonymous().url("ws://h:8000/"),
            "ws://h:8000/ws/analysis/"
        );
    }

    #[tokio::test]
    async fn test_connect_opens_and_targets_subject() {
        let connector = MockConnector::new();
        let session = session_with(&connector);
        assert_eq!(session.state(), ChannelState::Idle);

        session.connect(SessionHandle::for_subject(7)).await.unwrap();
        assert_eq!(session.state(), ChannelState::Open);
        assert!(connector.attempts()[0].url.ends_with("/ws/analysis/7/"));
        assert!(connector.attempts()[0].headers.is_empty());
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let connector = MockConnector::new();
        let session = session_with(&connector);
        session.connect(SessionHandle::anonymous()).await.unwrap();

        let again = session.connect(SessionHandle::anonymous()).await;
        assert!(matches!(again, Err(SessionError::AlreadyConnected)));
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_after_disconnect_from_idle() {
        let connector = MockConnector::new();
        let session = session_with(&connector);
        session.disconnect();
        assert_eq!(session.state(), ChannelState::Closed);

        let result = session.connect(SessionHandle::anonymous()).await;
        assert!(matches!(
            result,
            Err(SessionError::InvalidState(ChannelState::Closed))
        ));
        assert!(connector.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_failed_handshake_publishes_one_error() {
        let connector = MockConnector::new();
        connector.push_outcome(HandshakeOutcome::Fail(WsError::ConnectionFailed(
            "refused".to_string(),
        )));
        let session = session_with(&connector);
        let mut events = session.events();

        let result = session.connect(SessionHandle::anonymous()).await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
        assert_eq!(session.state(), ChannelState::Closed);

        let event = events.recv().await.unwrap();
        assert!(event.is_error());
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_events_in_receive_order() {
        let connector = MockConnector::new();
        let session = session_with(&connector);
        let mut events = session.events();
        session.connect(SessionHandle::for_subject(1)).await.unwrap();

        let peer = connector.peer(0).unwrap();
        peer.inject_text(r#"{"type": "session_started", "session_id": 3}"#);
        peer.inject_text(r#"{"type": "heartbeat"}"#);
        peer.inject_text("garbage");
        peer.inject_text(r#"{"type": "analysis_result", "emotion": "happy"}"#);
        peer.inject_text(r#"{"type": "error", "message": "bad frame"}"#);

        let first = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(first, AnalysisEvent::SessionStarted(_)));

        let second = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        let AnalysisEvent::AnalysisResult(result) = second else {
            panic!("Expected AnalysisResult");
        };
        assert_eq!(result.emotion.as_deref(), Some("happy"));

        let third = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(third, AnalysisEvent::error("bad frame"));

        // Unknown and malformed envelopes left the channel open
        assert_eq!(session.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn test_sends_preserve_order() {
        let connector = MockConnector::new();
        let session = session_with(&connector);
        session.connect(SessionHandle::anonymous()).await.unwrap();

        session.send_frame(Bytes::from_static(b"abc"));
        session.request_metrics();
        session.stop();

        let peer = connector.peer(0).unwrap();
        timeout(WAIT, peer.wait_for_sent(3)).await.unwrap();
        let sent = peer.sent_json();
        assert_eq!(sent[0]["type"], "frame");
        assert_eq!(sent[0]["image"], "YWJj");
        assert_eq!(sent[1]["type"], "get_metrics");
        assert_eq!(sent[2]["type"], "stop");
    }

    #[tokio::test]
    async fn test_sends_before_open_are_noops() {
        let connector = MockConnector::new();
        let session = session_with(&connector);

        session.send_frame(Bytes::from_static(b"early"));
        session.request_metrics();
        session.connect(SessionHandle::anonymous()).await.unwrap();
        session.stop();

        let peer = connector.peer(0).unwrap();
        let sent = timeout(WAIT, peer.wait_for_sent(1)).await.unwrap();
        assert_eq!(sent, vec![r#"{"type":"stop"}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_completes_stream_and_silences() {
        let connector = MockConnector::new();
        let session = session_with(&connector);
        let mut events = session.events();
        session.connect(SessionHandle::anonymous()).await.unwrap();
        let peer = connector.peer(0).unwrap();

        session.disconnect();
        peer.inject_text(r#"{"type": "analysis_result"}"#);
        session.send_frame(Bytes::from_static(b"late"));
        session.disconnect();

        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), None);
        timeout(WAIT, session.closed()).await.unwrap();
        assert_eq!(session.state(), ChannelState::Closed);
        assert!(peer.sent().is_empty());
        assert!(peer.closed_by_client());

        let mut late = session.events();
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn test_remote_close() {
        let connector = MockConnector::new();
        let session = session_with(&connector);
        let mut events = session.events();
        session.connect(SessionHandle::anonymous()).await.unwrap();

        let peer = connector.peer(0).unwrap();
        peer.inject_text(r#"{"type": "session_ended", "metrics": {"total_frames": 2}}"#);
        peer.inject_close();

        let ended = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(ended, AnalysisEvent::SessionEnded(_)));
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), None);
        assert_eq!(session.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_transport_error_publishes_once_then_completes() {
        let connector = MockConnector::new();
        let session = session_with(&connector);
        let mut events = session.events();
        session.connect(SessionHandle::anonymous()).await.unwrap();

        connector
            .peer(0)
            .unwrap()
            .inject_error(WsError::ReceiveFailed("reset".to_string()));

        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event, AnalysisEvent::error("Receive failed: reset"));
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), None);
        assert_eq!(session.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_send_failure_closes_channel() {
        let connector = MockConnector::new();
        let session = session_with(&connector);
        let mut events = session.events();
        session.connect(SessionHandle::anonymous()).await.unwrap();

        connector.peer(0).unwrap().fail_sends();
        session.request_metrics();

        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert!(event.is_error());
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_backlog_tracks_unwritten_commands() {
        let connector = MockConnector::new();
        let session = session_with(&connector);
        session.connect(SessionHandle::anonymous()).await.unwrap();
        let peer = connector.peer(0).unwrap();
        assert_eq!(session.backlog(), 0);

        peer.stall_sends();
        session.send_frame(Bytes::from_static(b"a"));
        session.request_metrics();
        tokio::task::yield_now().await;
        assert_eq!(session.backlog(), 2);

        peer.release_sends();
        timeout(WAIT, peer.wait_for_sent(2)).await.unwrap();
        timeout(WAIT, async {
            while session.backlog() > 0 {
                session.written().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_with_pending_send() {
        let connector = MockConnector::new();
        let session = session_with(&connector);
        let mut events = session.events();
        session.connect(SessionHandle::anonymous()).await.unwrap();
        let peer = connector.peer(0).unwrap();

        peer.stall_sends();
        session.send_frame(Bytes::from_static(b"a"));
        tokio::task::yield_now().await;

        session.disconnect();
        timeout(WAIT, session.closed()).await.unwrap();
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), None);
        assert!(peer.closed_by_client());
        assert!(peer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake() {
        let connector = MockConnector::new();
        connector.push_outcome(HandshakeOutcome::Hang);
        let session = Arc::new(session_with(&connector));
        let mut events = session.events();

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect(SessionHandle::anonymous()).await })
        };

        let mut state = session.state_receiver();
        timeout(WAIT, state.wait_for(|s| *s == ChannelState::Connecting))
            .await
            .unwrap()
            .unwrap();

        session.disconnect();
        let result = timeout(WAIT, connecting).await.unwrap().unwrap();
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert_eq!(session.state(), ChannelState::Closed);
        // No event at all: the handshake neither opened nor failed
        assert_eq!(events.recv().await, None);
    }
}
