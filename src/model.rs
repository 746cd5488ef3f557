//! Chat resources shared by the realtime channels and the REST fallback.
//!
//! Only the fields the update client reads are typed; everything else the
//! platform sends is preserved in `extra` so callers see the full payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Numeric chat identifier.
pub type ChatId = u64;

/// Numeric message identifier. Ids grow monotonically within a chat.
pub type MessageId = u64;

/// A conversation as listed by the platform.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    pub id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<ChatMessage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Chat {
    /// Newest message id known for this chat, if any.
    pub fn last_message_id(&self) -> Option<MessageId> {
        self.last_message.as_ref().map(|message| message.id)
    }
}

/// A single chat message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of `new-message` on a user channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NewMessagePayload {
    pub message: ChatMessage,
    pub chat: Chat,
}

/// Payload of `new-message` on a chat channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatMessagePayload {
    pub message: ChatMessage,
}

/// Payload of `chat-updated`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatUpdatedPayload {
    pub chat: Chat,
}

/// Collection responses accept both a bare array and a `{"data": [...]}`
/// envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ListEnvelope<T> {
    Bare(Vec<T>),
    Wrapped { data: Vec<T> },
}

impl<T> ListEnvelope<T> {
    pub(crate) fn into_items(self) -> Vec<T> {
        match self {
            Self::Bare(items) => items,
            Self::Wrapped { data } => data,
        }
    }
}
