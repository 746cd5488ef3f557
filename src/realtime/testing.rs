//! In-process fakes for the transport and the poll source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::model::{Chat, ChatId, ChatMessage, MessageId};
use crate::realtime::config::TransportConfig;
use crate::realtime::polling::PollSource;
use crate::realtime::session::LiveUpdates;
use crate::realtime::transport::{
    InboundEvent, Transport, TransportCommand, TransportEvent, TransportLink,
};
use crate::rest::RequestError;

/// Lets every spawned task run until it blocks.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub(crate) fn chat(id: ChatId, last_message_id: Option<MessageId>) -> Chat {
    Chat {
        id,
        title: Some(format!("chat {id}")),
        updated_at: last_message_id.map(|message_id| format!("t{message_id}")),
        unread_count: None,
        last_message: last_message_id.map(|message_id| message(message_id, id)),
        extra: Map::new(),
    }
}

pub(crate) fn message(id: MessageId, chat_id: ChatId) -> ChatMessage {
    ChatMessage {
        id,
        chat_id,
        user_id: Some(1),
        body: Some(format!("message {id}")),
        created_at: None,
        extra: Map::new(),
    }
}

#[derive(Clone)]
pub(crate) struct FakeLink {
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: Arc<Mutex<mpsc::UnboundedReceiver<TransportCommand>>>,
    history: Arc<Mutex<Vec<TransportCommand>>>,
}

impl FakeLink {
    pub(crate) fn connected(&self) {
        let _ = self.events.send(TransportEvent::Connected {
            socket_id: "1234.5678".to_string(),
        });
    }

    pub(crate) fn emit(&self, channel: &str, event: &str, data: Value) {
        let _ = self
            .events
            .send(TransportEvent::Message(InboundEvent::new(channel, event, data)));
    }

    pub(crate) fn drop_connection(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub(crate) fn reject(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::Rejected {
            reason: reason.to_string(),
        });
    }

    pub(crate) fn refuse(&self, channel: &str, reason: &str) {
        let _ = self.events.send(TransportEvent::SubscriptionFailed {
            channel: channel.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Every command the manager has sent on this link so far.
    pub(crate) fn commands(&self) -> Vec<TransportCommand> {
        let mut receiver = self.commands.lock();
        let mut history = self.history.lock();
        while let Ok(command) = receiver.try_recv() {
            history.push(command);
        }
        history.clone()
    }

    /// True once the manager has stopped reading this link.
    pub(crate) fn is_released(&self) -> bool {
        self.events.is_closed()
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    links: Arc<Mutex<Vec<FakeLink>>>,
}

impl FakeTransport {
    pub(crate) fn opened(&self) -> usize {
        self.links.lock().len()
    }

    pub(crate) fn link(&self, index: usize) -> FakeLink {
        self.links.lock()[index].clone()
    }

    pub(crate) fn last(&self) -> FakeLink {
        let links = self.links.lock();
        links[links.len() - 1].clone()
    }

    pub(crate) fn config(&self) -> TransportConfig {
        TransportConfig::new("a1b2c3d4", "eu").with_transport(Arc::new(self.clone()))
    }
}

impl Transport for FakeTransport {
    fn open(&self, _config: &TransportConfig) -> TransportLink {
        let (link, endpoint) = TransportLink::pair();
        self.links.lock().push(FakeLink {
            events: endpoint.events,
            commands: Arc::new(Mutex::new(endpoint.commands)),
            history: Arc::new(Mutex::new(Vec::new())),
        });
        link
    }
}

#[derive(Default)]
pub(crate) struct FakePollSource {
    chats: Mutex<Vec<Chat>>,
    messages: Mutex<HashMap<ChatId, Vec<ChatMessage>>>,
    delay: Mutex<Duration>,
    chat_fetches: Mutex<Vec<Instant>>,
    message_fetches: Mutex<Vec<(ChatId, Option<MessageId>)>>,
}

impl FakePollSource {
    pub(crate) fn set_chats(&self, chats: Vec<Chat>) {
        *self.chats.lock() = chats;
    }

    pub(crate) fn push_message(&self, message: ChatMessage) {
        self.messages
            .lock()
            .entry(message.chat_id)
            .or_default()
            .push(message);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub(crate) fn chat_fetches(&self) -> Vec<Instant> {
        self.chat_fetches.lock().clone()
    }

    pub(crate) fn message_fetches(&self) -> Vec<(ChatId, Option<MessageId>)> {
        self.message_fetches.lock().clone()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PollSource for FakePollSource {
    async fn fetch_chats(&self) -> Result<Vec<Chat>, RequestError> {
        self.chat_fetches.lock().push(Instant::now());
        self.pause().await;
        Ok(self.chats.lock().clone())
    }

    async fn fetch_messages(
        &self,
        chat_id: ChatId,
        after: Option<MessageId>,
    ) -> Result<Vec<ChatMessage>, RequestError> {
        self.message_fetches.lock().push((chat_id, after));
        self.pause().await;
        let messages = self.messages.lock().get(&chat_id).cloned().unwrap_or_default();
        Ok(messages
            .into_iter()
            .filter(|message| after.map_or(true, |after| message.id > after))
            .collect())
    }
}

/// Records callbacks as short strings.
#[derive(Default)]
pub(crate) struct RecordingUpdates {
    seen: Mutex<Vec<String>>,
}

impl RecordingUpdates {
    pub(crate) fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

impl LiveUpdates for RecordingUpdates {
    fn on_new_message(&self, message: ChatMessage, chat: Chat) {
        self.seen
            .lock()
            .push(format!("new_message:{}:{}", chat.id, message.id));
    }

    fn on_chat_updated(&self, chat: Chat) {
        self.seen.lock().push(format!("chat_updated:{}", chat.id));
    }

    fn on_chat_list_updated(&self) {
        self.seen.lock().push("chat_list_updated".to_string());
    }
}
