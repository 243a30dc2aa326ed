//! Mock WebSocket connector for testing.
//!
//! Every successful `connect` creates a [`MockPeer`]: the test-side handle of
//! the channel. Through it a test injects inbound frames, closes or breaks the
//! channel, and reads what the session sent.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::Sink;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::sync::Notify;

use crate::traits::{FrameSink, FrameStream, Headers, InboundFrame, WsConnector, WsError};

/// A handshake attempt recorded by the connector.
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub url: String,
    pub headers: Headers,
}

/// What the next handshake should do.
#[derive(Debug, Clone)]
pub enum HandshakeOutcome {
    Accept,
    Fail(WsError),
    /// Never complete; only a cancelled connect gets out of this.
    Hang,
}

/// Test-side handle of one mock channel.
#[derive(Clone)]
pub struct MockPeer {
    inbound_tx: mpsc::UnboundedSender<Result<InboundFrame, WsError>>,
    sent: Arc<Mutex<Vec<String>>>,
    sent_notify: Arc<Notify>,
    closed_by_client: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
    stall: Arc<Stall>,
}

/// Holds the sink not-ready until released, like a peer that stopped reading.
#[derive(Default)]
struct Stall {
    active: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl MockPeer {
    /// Deliver a text frame to the client.
    pub fn inject_text(&self, text: impl Into<String>) {
        let _ = self.inbound_tx.unbounded_send(Ok(InboundFrame::Text(text.into())));
    }

    /// Deliver a JSON value as a text frame.
    pub fn inject_json(&self, value: serde_json::Value) {
        self.inject_text(value.to_string());
    }

    /// Send a close frame to the client.
    pub fn inject_close(&self) {
        let _ = self.inbound_tx.unbounded_send(Ok(InboundFrame::Close));
    }

    /// Break the read side with a transport error.
    pub fn inject_error(&self, err: WsError) {
        let _ = self.inbound_tx.unbounded_send(Err(err));
    }

    /// End the inbound stream without a close frame.
    pub fn hang_up(&self) {
        self.inbound_tx.close_channel();
    }

    /// Make every further send on this channel fail.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Stop accepting sends; the client's writes stay pending.
    pub fn stall_sends(&self) {
        self.stall.active.store(true, Ordering::SeqCst);
    }

    /// Accept sends again and wake a pending writer.
    pub fn release_sends(&self) {
        self.stall.active.store(false, Ordering::SeqCst);
        if let Some(waker) = self.stall.waker.lock().unwrap().take() {
            waker.wake();
        }
    }

    /// Envelopes the client sent so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent envelopes parsed as JSON.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    /// Wait until at least `count` envelopes were sent, then return them all.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<String> {
        loop {
            let notified = self.sent_notify.notified();
            {
                let sent = self.sent.lock().unwrap();
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            notified.await;
        }
    }

    /// Whether the client closed its sink.
    pub fn closed_by_client(&self) -> bool {
        self.closed_by_client.load(Ordering::SeqCst)
    }
}

/// Sink half handed to the session; records every envelope on the peer.
struct RecordingSink {
    sent: Arc<Mutex<Vec<String>>>,
    sent_notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    fail: Arc<AtomicBool>,
    stall: Arc<Stall>,
}

impl Sink<String> for RecordingSink {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        if self.fail.load(Ordering::SeqCst) {
            return Poll::Ready(Err(WsError::SendFailed("mock send failure".to_string())));
        }
        if self.stall.active.load(Ordering::SeqCst) {
            *self.stall.waker.lock().unwrap() = Some(cx.waker().clone());
            // Re-check in case release ran before the waker was stored
            if self.stall.active.load(Ordering::SeqCst) {
                return Poll::Pending;
            }
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: String) -> Result<(), WsError> {
        self.sent.lock().unwrap().push(item);
        self.sent_notify.notify_waiters();
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        self.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Mock [`WsConnector`].
///
/// # Example
///
/// ```ignore
/// use baymax::adapters::mock::MockConnector;
///
/// let connector = MockConnector::new();
/// // ... session.connect(...) ...
/// let peer = connector.peer(0).unwrap();
/// peer.inject_json(serde_json::json!({"type": "metrics"}));
/// ```
#[derive(Clone, Default)]
pub struct MockConnector {
    outcomes: Arc<Mutex<VecDeque<HandshakeOutcome>>>,
    attempts: Arc<Mutex<Vec<ConnectAttempt>>>,
    peers: Arc<Mutex<Vec<MockPeer>>>,
    peer_notify: Arc<Notify>,
}

impl MockConnector {
    /// Connector that accepts every handshake unless told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next handshake. Unqueued handshakes succeed.
    pub fn push_outcome(&self, outcome: HandshakeOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.attempts.lock().unwrap().clone()
    }

    /// Peer of the `index`-th accepted connection.
    pub fn peer(&self, index: usize) -> Option<MockPeer> {
        self.peers.lock().unwrap().get(index).cloned()
    }

    /// Wait until the `index`-th connection is accepted.
    pub async fn wait_for_peer(&self, index: usize) -> MockPeer {
        loop {
            let notified = self.peer_notify.notified();
            if let Some(peer) = self.peer(index) {
                return peer;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl WsConnector for MockConnector {
    async fn connect(
        &self,
        url: &str,
        headers: &Headers,
    ) -> Result<(FrameSink, FrameStream), WsError> {
        self.attempts.lock().unwrap().push(ConnectAttempt {
            url: url.to_string(),
            headers: headers.clone(),
        });

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(HandshakeOutcome::Accept);

        match outcome {
            HandshakeOutcome::Accept => {}
            HandshakeOutcome::Fail(err) => return Err(err),
            HandshakeOutcome::Hang => futures::future::pending::<()>().await,
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded();
        let peer = MockPeer {
            inbound_tx,
            sent: Arc::new(Mutex::new(Vec::new())),
            sent_notify: Arc::new(Notify::new()),
            closed_by_client: Arc::new(AtomicBool::new(false)),
            fail_sends: Arc::new(AtomicBool::new(false)),
            stall: Arc::new(Stall::default()),
        };

        let sink = RecordingSink {
            sent: peer.sent.clone(),
            sent_notify: peer.sent_notify.clone(),
            closed: peer.closed_by_client.clone(),
            fail: peer.fail_sends.clone(),
            stall: peer.stall.clone(),
        };

        self.peers.lock().unwrap().push(peer);
        self.peer_notify.notify_waiters();

        Ok((Box::pin(sink), Box::pin(inbound_rx)))
    }
}
