//! Real-time analysis channel.
//!
//! [`StreamSession`] owns one WebSocket connection to the analysis service and
//! fans decoded server events out through an [`EventHub`]. [`SupervisedSession`]
//! wraps it with reconnection and a bounded outbound queue.

pub mod hub;
pub mod messages;
pub mod session;
pub mod supervisor;

pub use hub::{EventHub, EventStream};
pub use messages::{
    decode_event, AnalysisEvent, AnalysisResult, ErrorEvent, MetricAlert, MetricsUpdate,
    OutboundCommand, OverallState, PostureCounts, SessionEnded, SessionMetrics, SessionStarted,
};
pub use session::{ChannelState, SessionFactory, SessionHandle, StreamSession};
pub use supervisor::{FrameQueue, SupervisedSession, SupervisorState};
