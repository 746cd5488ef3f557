//! Transport seam between the connection manager and a concrete realtime
//! protocol.
//!
//! A [`Transport`] opens a [`TransportLink`]: a command sender and an event
//! receiver. Opening never blocks; connection progress arrives as
//! [`TransportEvent`]s. Dropping the command sender asks the transport to close
//! its socket.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::realtime::config::TransportConfig;
use crate::rest::{RequestError, RetryingRequestClient};

pub const DEFAULT_AUTH_PATH: &str = "/broadcasting/auth";

/// Application event received on a channel.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundEvent {
    /// Wire name of the channel.
    pub channel: String,
    /// Event name.
    pub event: String,
    /// Decoded payload.
    pub data: Value,
}

impl InboundEvent {
    pub fn new(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            data,
        }
    }
}

/// Commands accepted by an open link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCommand {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
}

/// Lifecycle and data events produced by an open link.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The server acknowledged the connection.
    Connected { socket_id: String },
    /// An application event on a subscribed channel.
    Message(InboundEvent),
    /// A single channel could not be subscribed; the link stays up.
    SubscriptionFailed { channel: String, reason: String },
    /// The link dropped for a transient reason. Terminal for this link.
    Disconnected { reason: String },
    /// The server refused the credentials. Terminal for this link.
    Rejected { reason: String },
}

/// Manager-side half of an open link.
#[derive(Debug)]
pub struct TransportLink {
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Transport-side half of an open link.
#[derive(Debug)]
pub struct LinkEndpoint {
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportLink {
    /// Creates a connected pair of link halves.
    pub fn pair() -> (TransportLink, LinkEndpoint) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            TransportLink {
                commands: commands_tx,
                events: events_rx,
            },
            LinkEndpoint {
                commands: commands_rx,
                events: events_tx,
            },
        )
    }
}

/// A realtime transport implementation.
pub trait Transport: Send + Sync {
    /// Starts opening a connection and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    fn open(&self, config: &TransportConfig) -> TransportLink;
}

/// Grants access to resource-scoped (private) channels.
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    /// Returns the signature the server expects in the subscribe frame.
    async fn authorize(&self, socket_id: &str, channel: &str) -> Result<String, RequestError>;
}

/// Authorizer backed by the platform's broadcasting auth endpoint.
///
/// The bearer token is attached by the underlying [`RetryingRequestClient`].
#[derive(Clone)]
pub struct HttpChannelAuthorizer {
    client: RetryingRequestClient,
    path: String,
}

impl HttpChannelAuthorizer {
    pub fn new(client: RetryingRequestClient) -> Self {
        Self {
            client,
            path: DEFAULT_AUTH_PATH.to_string(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    auth: String,
}

#[async_trait]
impl ChannelAuthorizer for HttpChannelAuthorizer {
    async fn authorize(&self, socket_id: &str, channel: &str) -> Result<String, RequestError> {
        let response: AuthResponse = self
            .client
            .post_json(
                &self.path,
                &json!({ "socket_id": socket_id, "channel_name": channel }),
            )
            .await?;
        Ok(response.auth)
    }
}
