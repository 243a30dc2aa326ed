//! Reconnecting wrapper around [`StreamSession`].
//!
//! A supervisor task owns the current session. When the channel drops for any
//! reason other than the caller's `stop` or `shutdown`, it opens a fresh
//! session for the same subject with exponential backoff (1s, 2s, 4s, ...
//! capped). Outbound commands go through a [`FrameQueue`]: frames are bounded
//! and the oldest is dropped on overflow, control commands are always kept.
//! Commands leave the queue only once the open session has written the
//! previous one, so a slow peer backs frames up here, where the bound holds.
//!
//! A channel that closes sooner than `min_uptime` after opening counts as a
//! failed attempt, so a server that accepts and hangs up at once still runs
//! into `max_retries`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use super::hub::{EventHub, EventStream};
use super::messages::OutboundCommand;
use super::session::{SessionFactory, SessionHandle, StreamSession};
use crate::config::ReconnectPolicy;

/// Commands handed to the session before its transport has written them.
const MAX_IN_FLIGHT: usize = 1;

/// Supervisor lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorState {
    Connecting,
    Open,
    Reconnecting { attempt: u8 },
    Stopped,
}

#[derive(Debug)]
struct QueueState {
    commands: VecDeque<OutboundCommand>,
    frames: usize,
    dropped: u64,
}

/// Outbound buffer with a frame bound and drop-oldest overflow.
#[derive(Debug)]
pub struct FrameQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl FrameQueue {
    /// Queue holding at most `capacity` frames (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                commands: VecDeque::new(),
                frames: 0,
                dropped: 0,
            }),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a command. Returns true if an older frame was dropped to make
    /// room.
    pub fn push(&self, command: OutboundCommand) -> bool {
        let mut dropped = false;
        {
            let mut state = self.lock();
            if command.is_frame() {
                if state.frames >= self.capacity {
                    if let Some(oldest) = state.commands.iter().position(OutboundCommand::is_frame) {
                        state.commands.remove(oldest);
                        state.frames -= 1;
                        state.dropped += 1;
                        dropped = true;
                    }
                }
                state.frames += 1;
            }
            state.commands.push_back(command);
        }
        self.notify.notify_one();
        dropped
    }

    pub fn pop(&self) -> Option<OutboundCommand> {
        let mut state = self.lock();
        let command = state.commands.pop_front()?;
        if command.is_frame() {
            state.frames -= 1;
        }
        Some(command)
    }

    pub fn len(&self) -> usize {
        self.lock().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames dropped on overflow so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Wait until something is pushed. A push made before the call counts.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Flags and wakeup shared between the caller handle and the task.
#[derive(Debug, Default)]
struct Control {
    /// Caller sent `stop`; finish after the server closes.
    stopping: AtomicBool,
    /// Caller called `shutdown`; close now.
    shutdown: AtomicBool,
    wake: Notify,
}

impl Control {
    fn finished(&self) -> bool {
        self.stopping.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst)
    }
}

/// A stream session that survives transient network loss.
///
/// # Example
///
/// ```ignore
/// let factory = SessionFactory::from_config(&config, Arc::new(TungsteniteConnector::new()));
/// let supervised = SupervisedSession::spawn(factory, SessionHandle::for_subject(7), config.reconnect);
/// let mut events = supervised.events();
/// supervised.send_frame(jpeg_bytes);
/// ```
pub struct SupervisedSession {
    queue: Arc<FrameQueue>,
    hub: Arc<EventHub>,
    control: Arc<Control>,
    state_rx: watch::Receiver<SupervisorState>,
}

impl SupervisedSession {
    /// Start supervising a session for `handle`. Must be called within a
    /// tokio runtime.
    pub fn spawn(factory: SessionFactory, handle: SessionHandle, policy: ReconnectPolicy) -> Self {
        let queue = Arc::new(FrameQueue::new(policy.queue_capacity));
        let hub = Arc::new(EventHub::new());
        let control = Arc::new(Control::default());
        let (state_tx, state_rx) = watch::channel(SupervisorState::Connecting);

        let task = Supervisor {
            factory,
            handle,
            policy,
            queue: queue.clone(),
            hub: hub.clone(),
            control: control.clone(),
            state_tx,
        };
        tokio::spawn(task.run());

        Self {
            queue,
            hub,
            control,
            state_rx,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state_rx.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<SupervisorState> {
        self.state_rx.clone()
    }

    /// Events of every underlying session, in order. Completes once the
    /// supervisor stops.
    pub fn events(&self) -> EventStream {
        self.hub.subscribe()
    }

    /// Queue a frame. While the channel is down, at most the configured number
    /// of frames is kept and the oldest goes first.
    pub fn send_frame(&self, image: impl Into<Bytes>) {
        if self.control.finished() {
            return;
        }
        if self.queue.push(OutboundCommand::Frame(image.into())) {
            debug!("Frame queue full, dropped oldest frame");
        }
    }

    pub fn request_metrics(&self) {
        if self.control.finished() {
            return;
        }
        self.queue.push(OutboundCommand::GetMetrics);
    }

    /// End the analysis session. The server's close is final: no reconnect.
    pub fn stop(&self) {
        if self.control.finished() {
            return;
        }
        self.control.stopping.store(true, Ordering::SeqCst);
        self.queue.push(OutboundCommand::Stop);
        self.control.wake.notify_one();
    }

    /// Close the channel now and stop supervising. Idempotent.
    pub fn shutdown(&self) {
        if !self.control.shutdown.swap(true, Ordering::SeqCst) {
            info!("Shutting down supervised session");
        }
        self.control.wake.notify_one();
    }

    /// Frames dropped because the queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped()
    }

    /// Wait until the supervisor has stopped.
    pub async fn stopped(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|state| *state == SupervisorState::Stopped).await;
    }
}

impl Drop for SupervisedSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The background half.
struct Supervisor {
    factory: SessionFactory,
    handle: SessionHandle,
    policy: ReconnectPolicy,
    queue: Arc<FrameQueue>,
    hub: Arc<EventHub>,
    control: Arc<Control>,
    state_tx: watch::Sender<SupervisorState>,
}

/// How one open channel ended.
enum Lost {
    /// Caller asked for it
    ByCaller,
    /// Remote close or transport failure
    Channel,
}

impl Supervisor {
    async fn run(self) {
        let mut failures: u8 = 0;

        loop {
            if self.control.finished() {
                break;
            }

            let _ = self.state_tx.send(if failures == 0 {
                SupervisorState::Connecting
            } else {
                SupervisorState::Reconnecting { attempt: failures }
            });

            let session = self.factory.create();
            let mut inner = session.events();

            let connected = tokio::select! {
                result = session.connect(self.handle) => Some(result),
                _ = self.control.wake.notified() => None,
            };

            let Some(connected) = connected else {
                debug!("Stopped while connecting");
                session.disconnect();
                break;
            };

            if let Err(e) = connected {
                // Forward the handshake's ErrorEvent
                while let Some(event) = inner.recv().await {
                    self.hub.publish(event);
                }

                failures = failures.saturating_add(1);
                warn!("Connect attempt failed: {}", e);
                if failures > self.policy.max_retries {
                    error!(
                        "Failed to reconnect after {} attempts, giving up",
                        self.policy.max_retries
                    );
                    break;
                }
                if !self.backoff(failures).await {
                    break;
                }
                continue;
            }

            if failures > 0 {
                info!("Reconnected on attempt {}", failures);
            }
            let opened = Instant::now();
            let _ = self.state_tx.send(SupervisorState::Open);

            match self.pump(&session, &mut inner).await {
                Lost::ByCaller => break,
                Lost::Channel if self.control.finished() => break,
                Lost::Channel => {
                    if opened.elapsed() >= self.policy.min_uptime {
                        failures = 0;
                    }
                    failures = failures.saturating_add(1);
                    if failures > self.policy.max_retries {
                        error!(
                            "Channel keeps closing right after opening, giving up after {} attempts",
                            failures
                        );
                        break;
                    }
                    warn!("Channel lost, reconnecting");
                    if !self.backoff(failures).await {
                        break;
                    }
                }
            }
        }

        let _ = self.state_tx.send(SupervisorState::Stopped);
        self.hub.close();
        info!("Supervisor stopped");
    }

    /// Drive an open session until its channel ends or the caller shuts down.
    async fn pump(&self, session: &StreamSession, inner: &mut EventStream) -> Lost {
        loop {
            while session.backlog() < MAX_IN_FLIGHT {
                let Some(command) = self.queue.pop() else {
                    break;
                };
                match command {
                    OutboundCommand::Frame(bytes) => session.send_frame(bytes),
                    OutboundCommand::GetMetrics => session.request_metrics(),
                    OutboundCommand::Stop => session.stop(),
                }
            }

            tokio::select! {
                event = inner.recv() => match event {
                    Some(event) => {
                        self.hub.publish(event);
                    }
                    None => return Lost::Channel,
                },
                _ = self.queue.notified() => {}
                _ = session.written() => {}
                _ = self.control.wake.notified() => {
                    if self.control.shutdown.load(Ordering::SeqCst) {
                        session.disconnect();
                        session.closed().await;
                        return Lost::ByCaller;
                    }
                }
            }
        }
    }

    /// Sleep before attempt `attempt`. False if the caller stopped meanwhile.
    async fn backoff(&self, attempt: u8) -> bool {
        let _ = self
            .state_tx
            .send(SupervisorState::Reconnecting { attempt });

        let delay = self.policy.backoff(attempt);
        info!(
            "Reconnection attempt {} of {}, waiting {:?}",
            attempt, self.policy.max_retries, delay
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.control.finished(),
            _ = self.control.wake.notified() => {
                debug!("Stopped during backoff");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{HandshakeOutcome, MockConnector};
    use crate::traits::WsError;
    use crate::websocket::messages::AnalysisEvent;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn frame(tag: &'static [u8]) -> OutboundCommand {
        OutboundCommand::Frame(Bytes::from_static(tag))
    }

    #[test]
    fn test_queue_drops_oldest_frame() {
        let queue = FrameQueue::new(2);
        assert!(!queue.push(frame(b"1")));
        assert!(!queue.push(OutboundCommand::GetMetrics));
        assert!(!queue.push(frame(b"2")));
        assert!(queue.push(frame(b"3")));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop(), Some(OutboundCommand::GetMetrics));
        assert_eq!(queue.pop(), Some(frame(b"2")));
        assert_eq!(queue.pop(), Some(frame(b"3")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_never_drops_control() {
        let queue = FrameQueue::new(1);
        queue.push(OutboundCommand::Stop);
        queue.push(frame(b"a"));
        queue.push(OutboundCommand::GetMetrics);
        queue.push(frame(b"b"));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(OutboundCommand::Stop));
        assert_eq!(queue.pop(), Some(OutboundCommand::GetMetrics));
        assert_eq!(queue.pop(), Some(frame(b"b")));
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let queue = FrameQueue::new(0);
        queue.push(frame(b"a"));
        queue.push(frame(b"b"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(frame(b"b")));
    }

    fn fast_policy(max_retries: u8, queue_capacity: usize) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries,
            max_backoff: Duration::from_millis(10),
            queue_capacity,
            min_uptime: Duration::from_secs(5),
        }
    }

    async fn wait_open(supervised: &SupervisedSession) {
        let mut state = supervised.state_receiver();
        timeout(WAIT, state.wait_for(|s| *s == SupervisorState::Open))
            .await
            .unwrap()
            .unwrap();
    }

    fn factory(connector: &MockConnector) -> SessionFactory {
        SessionFactory::new(Arc::new(connector.clone()), "ws://test")
    }

    #[tokio::test]
    async fn test_reconnects_after_remote_close() {
        let connector = MockConnector::new();
        let supervised = SupervisedSession::spawn(
            factory(&connector),
            SessionHandle::for_subject(4),
            fast_policy(3, 8),
        );

        let first = timeout(WAIT, connector.wait_for_peer(0)).await.unwrap();
        first.inject_close();

        let second = timeout(WAIT, connector.wait_for_peer(1)).await.unwrap();
        wait_open(&supervised).await;

        supervised.send_frame(Bytes::from_static(b"2"));
        let sent = timeout(WAIT, second.wait_for_sent(1)).await.unwrap();
        assert!(sent[0].contains("Mg=="));

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.url.ends_with("/ws/analysis/4/")));
    }

    #[tokio::test]
    async fn test_queued_frames_drop_oldest_until_open() {
        let connector = MockConnector::new();
        connector.push_outcome(HandshakeOutcome::Fail(WsError::ConnectionFailed(
            "refused".to_string(),
        )));
        let supervised = SupervisedSession::spawn(
            factory(&connector),
            SessionHandle::anonymous(),
            fast_policy(3, 2),
        );

        supervised.send_frame(Bytes::from_static(b"1"));
        supervised.send_frame(Bytes::from_static(b"2"));
        supervised.send_frame(Bytes::from_static(b"3"));
        assert_eq!(supervised.dropped_frames(), 1);

        let peer = timeout(WAIT, connector.wait_for_peer(0)).await.unwrap();
        timeout(WAIT, peer.wait_for_sent(2)).await.unwrap();
        let images: Vec<_> = peer
            .sent_json()
            .iter()
            .map(|v| v["image"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(images, vec!["Mg==", "Mw=="]);
    }

    #[tokio::test]
    async fn test_stop_is_final() {
        let connector = MockConnector::new();
        let supervised = SupervisedSession::spawn(
            factory(&connector),
            SessionHandle::for_subject(1),
            fast_policy(3, 8),
        );
        let mut events = supervised.events();

        let peer = timeout(WAIT, connector.wait_for_peer(0)).await.unwrap();
        wait_open(&supervised).await;
        supervised.stop();
        let sent = timeout(WAIT, peer.wait_for_sent(1)).await.unwrap();
        assert_eq!(sent[0], r#"{"type":"stop"}"#);

        peer.inject_text(r#"{"type": "session_ended"}"#);
        peer.inject_close();

        let ended = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(ended, AnalysisEvent::SessionEnded(_)));
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), None);

        timeout(WAIT, supervised.stopped()).await.unwrap();
        assert_eq!(supervised.state(), SupervisorState::Stopped);
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let connector = MockConnector::new();
        for _ in 0..3 {
            connector.push_outcome(HandshakeOutcome::Fail(WsError::ConnectionFailed(
                "refused".to_string(),
            )));
        }
        let supervised = SupervisedSession::spawn(
            factory(&connector),
            SessionHandle::anonymous(),
            fast_policy(2, 8),
        );
        let mut events = supervised.events();

        let mut errors = 0;
        while let Some(event) = timeout(WAIT, events.recv()).await.unwrap() {
            assert!(event.is_error());
            errors += 1;
        }
        assert_eq!(errors, 3);
        assert_eq!(connector.attempts().len(), 3);
        assert_eq!(supervised.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_slow_peer_keeps_frames_bounded() {
        let connector = MockConnector::new();
        let supervised = SupervisedSession::spawn(
            factory(&connector),
            SessionHandle::anonymous(),
            fast_policy(3, 2),
        );
        let peer = timeout(WAIT, connector.wait_for_peer(0)).await.unwrap();
        wait_open(&supervised).await;
        peer.stall_sends();

        supervised.send_frame(Bytes::from_static(b"1"));
        timeout(WAIT, async {
            while !supervised.queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        for i in 2..=200 {
            supervised.send_frame(Bytes::from(i.to_string()));
            tokio::task::yield_now().await;
        }

        // "1" waits on the transport, "199" and "200" in the queue
        assert_eq!(supervised.queue.len(), 2);
        assert_eq!(supervised.dropped_frames(), 197);
        assert!(peer.sent().is_empty());

        peer.release_sends();
        timeout(WAIT, peer.wait_for_sent(3)).await.unwrap();
        let images: Vec<_> = peer
            .sent_json()
            .iter()
            .map(|v| v["image"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(images, vec!["MQ==", "MTk5", "MjAw"]);
    }

    #[tokio::test]
    async fn test_shutdown_with_stalled_peer() {
        let connector = MockConnector::new();
        let supervised = SupervisedSession::spawn(
            factory(&connector),
            SessionHandle::anonymous(),
            fast_policy(3, 2),
        );
        let peer = timeout(WAIT, connector.wait_for_peer(0)).await.unwrap();
        wait_open(&supervised).await;
        peer.stall_sends();

        supervised.send_frame(Bytes::from_static(b"1"));
        supervised.shutdown();
        timeout(WAIT, supervised.stopped()).await.unwrap();
        assert!(peer.closed_by_client());
    }

    #[tokio::test]
    async fn test_channel_closing_right_away_counts_as_failure() {
        let connector = MockConnector::new();
        let supervised = SupervisedSession::spawn(
            factory(&connector),
            SessionHandle::anonymous(),
            fast_policy(2, 8),
        );

        for index in 0..3 {
            let peer = timeout(WAIT, connector.wait_for_peer(index)).await.unwrap();
            peer.inject_close();
        }

        timeout(WAIT, supervised.stopped()).await.unwrap();
        assert_eq!(connector.attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_channel_up_long_enough_resets_failures() {
        let connector = MockConnector::new();
        let policy = ReconnectPolicy {
            min_uptime: Duration::ZERO,
            ..fast_policy(1, 8)
        };
        let supervised =
            SupervisedSession::spawn(factory(&connector), SessionHandle::anonymous(), policy);

        for index in 0..3 {
            let peer = timeout(WAIT, connector.wait_for_peer(index)).await.unwrap();
            peer.inject_close();
        }

        timeout(WAIT, connector.wait_for_peer(3)).await.unwrap();
        assert_ne!(supervised.state(), SupervisorState::Stopped);
        supervised.shutdown();
        timeout(WAIT, supervised.stopped()).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let connector = MockConnector::new();
        let supervised = SupervisedSession::spawn(
            factory(&connector),
            SessionHandle::anonymous(),
            fast_policy(3, 8),
        );
        let peer = timeout(WAIT, connector.wait_for_peer(0)).await.unwrap();
        wait_open(&supervised).await;

        supervised.shutdown();
        supervised.shutdown();
        timeout(WAIT, supervised.stopped()).await.unwrap();
        assert!(peer.closed_by_client());

        supervised.send_frame(Bytes::from_static(b"late"));
        assert!(supervised.queue.is_empty());
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_connecting() {
        let connector = MockConnector::new();
        connector.push_outcome(HandshakeOutcome::Hang);
        let supervised = SupervisedSession::spawn(
            factory(&connector),
            SessionHandle::anonymous(),
            fast_policy(3, 8),
        );
        let mut events = supervised.events();
        tokio::task::yield_now().await;

        supervised.shutdown();
        timeout(WAIT, supervised.stopped()).await.unwrap();
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), None);
    }

    #[test]
    fn test_supervisor_state_equality() {
        assert_eq!(
            SupervisorState::Reconnecting { attempt: 1 },
            SupervisorState::Reconnecting { attempt: 1 }
        );
        assert_ne!(
            SupervisorState::Reconnecting { attempt: 1 },
            SupervisorState::Reconnecting { attempt: 2 }
        );
        assert_ne!(SupervisorState::Open, SupervisorState::Stopped);
    }
}
