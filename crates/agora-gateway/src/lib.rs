//! HTTP gateway for Agora.
//!
//! Serves the chat stream endpoint as Server-Sent Events, a health probe,
//! and, with the `metrics` feature, a Prometheus scrape endpoint.

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use server::{router, serve, start_gateway};
pub use state::GatewayState;
