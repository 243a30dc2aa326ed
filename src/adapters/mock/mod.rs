//! Mock implementations for testing.
//!
//! Test doubles for every trait seam, so the token store, stream session and
//! report client can be exercised without a network or a home directory.
//!
//! # Available Mocks
//!
//! - [`MockHttpClient`] - HTTP client with configurable responses
//! - [`MockConnector`] - WebSocket connector with frame injection
//! - [`InMemoryCredentials`] - In-memory token storage

pub mod credentials;
pub mod http;
pub mod websocket;

pub use credentials::InMemoryCredentials;
pub use http::{MockHttpClient, MockResponse, RecordedRequest};
pub use websocket::{ConnectAttempt, HandshakeOutcome, MockConnector, MockPeer};
