//! Pusher protocol (version 7) frames.
//!
//! Every frame is a JSON object with an `event` name, an optional `channel`
//! and a `data` field. Servers usually send `data` as a JSON-encoded string;
//! [`Frame::payload`] undoes that second layer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: u8 = 7;

pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const ERROR: &str = "pusher:error";
pub const PING: &str = "pusher:ping";
pub const PONG: &str = "pusher:pong";
pub const SUBSCRIBE: &str = "pusher:subscribe";
pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn subscribe(channel: &str, auth: Option<String>) -> Self {
        let data = match auth {
            Some(auth) => json!({ "channel": channel, "auth": auth }),
            None => json!({ "channel": channel }),
        };
        Self {
            event: SUBSCRIBE.to_string(),
            channel: None,
            data,
        }
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self {
            event: UNSUBSCRIBE.to_string(),
            channel: None,
            data: json!({ "channel": channel }),
        }
    }

    pub fn ping() -> Self {
        Self {
            event: PING.to_string(),
            channel: None,
            data: json!({}),
        }
    }

    pub fn pong() -> Self {
        Self {
            event: PONG.to_string(),
            channel: None,
            data: json!({}),
        }
    }

    /// `data` with string-encoded JSON decoded. Non-JSON strings are kept.
    pub fn payload(&self) -> Value {
        match &self.data {
            Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| self.data.clone()),
            other => other.clone(),
        }
    }

    /// Classifies an inbound frame.
    pub fn into_server_event(self) -> ServerEvent {
        let payload = self.payload();
        let Frame { event, channel, .. } = self;
        match event.as_str() {
            CONNECTION_ESTABLISHED => {
                match serde_json::from_value::<ConnectionEstablished>(payload) {
                    Ok(established) => ServerEvent::ConnectionEstablished(established),
                    Err(err) => ServerEvent::Malformed(format!("connection_established: {err}")),
                }
            }
            ERROR => ServerEvent::Error(serde_json::from_value(payload).unwrap_or_default()),
            PING => ServerEvent::Ping,
            PONG => ServerEvent::Pong,
            SUBSCRIPTION_SUCCEEDED => ServerEvent::SubscriptionSucceeded {
                channel: channel.unwrap_or_default(),
            },
            SUBSCRIPTION_ERROR => ServerEvent::SubscriptionError {
                channel: channel.unwrap_or_default(),
                detail: serde_json::from_value(payload).unwrap_or_default(),
            },
            name if name.starts_with("pusher:") || name.starts_with("pusher_internal:") => {
                ServerEvent::Ignored(event.clone())
            }
            _ => match channel {
                Some(channel) => ServerEvent::App {
                    channel,
                    event: event.clone(),
                    data: payload,
                },
                None => ServerEvent::Ignored(event.clone()),
            },
        }
    }
}

/// Inbound frame after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ConnectionEstablished(ConnectionEstablished),
    Error(ErrorData),
    Ping,
    Pong,
    SubscriptionSucceeded {
        channel: String,
    },
    SubscriptionError {
        channel: String,
        detail: SubscriptionErrorData,
    },
    App {
        channel: String,
        event: String,
        data: Value,
    },
    Ignored(String),
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionEstablished {
    pub socket_id: String,
    /// Seconds of silence after which the client should ping.
    #[serde(default)]
    pub activity_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ErrorData {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<u16>,
}

impl ErrorData {
    /// 4000-4099 close codes mean the server will refuse this client until
    /// its configuration or credentials change.
    pub fn is_fatal(&self) -> bool {
        matches!(self.code, Some(4000..=4099))
    }

    pub fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (Some(code), None) => code.to_string(),
            (None, Some(message)) => message.clone(),
            (None, None) => "unspecified error".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionErrorData {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}
