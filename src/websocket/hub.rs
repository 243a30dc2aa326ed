//! Publish/subscribe registry for channel events.
//!
//! Each subscriber owns an unbounded queue; publishing appends the event to
//! every live queue in order. Nothing is replayed to late subscribers. Closing
//! the hub drops every sender, which completes all streams exactly once.

use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::messages::AnalysisEvent;

#[derive(Debug)]
struct HubState {
    subscribers: Vec<mpsc::UnboundedSender<AnalysisEvent>>,
    /// Cleared by `mute`; publishes are discarded from then on.
    accepting: bool,
    closed: bool,
}

/// Subscriber registry shared by a session and its background task.
#[derive(Debug)]
pub struct EventHub {
    state: Mutex<HubState>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                subscribers: Vec::new(),
                accepting: true,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber. After `close` the returned stream is already
    /// complete.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if !state.closed {
            state.subscribers.push(tx);
        }
        EventStream { rx }
    }

    /// Deliver `event` to every live subscriber. Returns how many got it.
    pub fn publish(&self, event: AnalysisEvent) -> usize {
        let mut state = self.lock();
        if !state.accepting || state.closed {
            return 0;
        }
        state
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        state.subscribers.len()
    }

    /// Stop accepting events without completing the streams yet.
    pub fn mute(&self) {
        self.lock().accepting = false;
    }

    /// Complete every stream. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        state.accepting = false;
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Subscribers whose stream has not been dropped, as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|subscriber| !subscriber.is_closed());
        state.subscribers.len()
    }
}

/// One subscriber's view of the event sequence.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<AnalysisEvent>,
}

impl EventStream {
    /// Next event, or `None` once the channel has closed.
    pub async fn recv(&mut self) -> Option<AnalysisEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<AnalysisEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = AnalysisEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
