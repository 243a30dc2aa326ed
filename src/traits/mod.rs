//! Trait seams between the session core and the outside world.
//!
//! - [`HttpClient`] - REST transport
//! - [`WsConnector`] - WebSocket handshake, yielding the channel halves
//! - [`CredentialsProvider`] - token persistence

pub mod credentials;
pub mod http;
pub mod websocket;

pub use credentials::{CredentialsError, CredentialsProvider};
pub use http::{Headers, HttpClient, HttpError, Response};
pub use websocket::{FrameSink, FrameStream, InboundFrame, WsConnector, WsError};
