//! Authentication against the analysis API.
//!
//! [`TokenStore`] owns the access/refresh pair; [`models`] holds the wire and
//! result types it exchanges.

pub mod models;
pub mod token_store;

pub use models::{AuthResult, Identity, RegisterRequest, TokenPair};
pub use token_store::TokenStore;
