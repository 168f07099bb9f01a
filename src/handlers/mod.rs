//! HTTP handlers for the client and peer endpoints.

pub mod client;
pub mod peer;
