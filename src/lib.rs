//! Real-time chat update client.
//!
//! The crate is organized by transport surface:
//! - `realtime`: websocket transport, channel registry, connection state
//!   machine, polling fallback and the per-user session that ties them
//!   together.
//! - `rest`: HTTP client with bounded retries used for polling and channel
//!   authorization.
//! - `model`: chat and message payloads shared by both paths.
//! - `retry`: shared retry, backoff and timeout utilities.

/// Chat resource and event payload types.
pub mod model;
/// Live updates, polling fallback and session lifecycle.
pub mod realtime;
/// Retrying REST client and request/response types.
pub mod rest;
/// Retry and timeout helpers used across the crate.
pub mod retry;

pub use realtime::{LiveUpdates, SessionLifecycle, SessionOptions, TransportConfig, UpdateMode};
pub use rest::{RequestError, RetryingRequestClient};
