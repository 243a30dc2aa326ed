//! Baymax - client session manager for a remote emotion and posture analysis
//! service.
//!
//! [`auth::TokenStore`] holds the access/refresh pair for the REST API,
//! [`websocket::StreamSession`] drives the real-time analysis channel and
//! [`reports::ReportClient`] reads aggregated history. Transports sit behind
//! the traits in [`traits`] so everything can run against the mocks in
//! [`adapters::mock`].

pub mod adapters;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod reports;
pub mod traits;
pub mod websocket;

mod wire;
