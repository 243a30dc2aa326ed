//! Concrete implementations of trait abstractions.
//!
//! # Adapters
//!
//! - [`ReqwestHttpClient`] - HTTP client using reqwest
//! - [`TungsteniteConnector`] - WebSocket handshake using tokio-tungstenite
//! - [`FileCredentialsProvider`] - JSON file token storage
//!
//! # Mock Implementations
//!
//! The [`mock`] submodule provides test doubles for all adapters:
//! - [`mock::MockHttpClient`] - Configurable HTTP responses
//! - [`mock::MockConnector`] - Frame injection for testing
//! - [`mock::InMemoryCredentials`] - In-memory token storage

pub mod file_credentials;
pub mod mock;
pub mod reqwest_http;
pub mod tungstenite_ws;

pub use file_credentials::FileCredentialsProvider;
pub use mock::{InMemoryCredentials, MockConnector, MockHttpClient};
pub use reqwest_http::ReqwestHttpClient;
pub use tungstenite_ws::TungsteniteConnector;
