//! REST polling used when the live transport is unavailable or has failed.
//!
//! Each tick fetches the chat list and the messages of every chat channel
//! currently bound in the registry, diffs them against what the previous tick
//! saw, and dispatches the differences through the registry as if they had
//! arrived on the socket. The first observation of anything only records a
//! baseline.
//!
//! Cursors outlive a stop so a later start resumes where polling left off.
//! Events delivered by the live connection advance them too (see
//! [`PollingFallback::delivery_tracker`]), so a hand-off from live to
//! polling neither replays nor skips messages.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::model::{Chat, ChatId, ChatMessage, ChatUpdatedPayload, ListEnvelope, MessageId};
use crate::realtime::registry::{
    Channel, ChannelRegistry, ChatTopic, EventHandler, CHAT_LIST_UPDATED, CHAT_UPDATED,
    NEW_MESSAGE,
};
use crate::realtime::transport::InboundEvent;
use crate::realtime::UpdateSource;
use crate::rest::{RequestError, RetryingRequestClient};

pub struct PollingDefaults;

impl PollingDefaults {
    pub const INTERVAL: Duration = Duration::from_secs(10);
    pub const MIN_INTERVAL: Duration = Duration::from_millis(100);
}

/// Read side of the platform API used while polling.
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn fetch_chats(&self) -> Result<Vec<Chat>, RequestError>;

    /// Messages of `chat_id`, newer than `after` when given.
    async fn fetch_messages(
        &self,
        chat_id: ChatId,
        after: Option<MessageId>,
    ) -> Result<Vec<ChatMessage>, RequestError>;
}

/// [`PollSource`] over the platform REST API.
#[derive(Clone)]
pub struct RestPollSource {
    client: RetryingRequestClient,
}

impl RestPollSource {
    pub fn new(client: RetryingRequestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PollSource for RestPollSource {
    async fn fetch_chats(&self) -> Result<Vec<Chat>, RequestError> {
        let chats: ListEnvelope<Chat> = self.client.get_json("/chats").await?;
        Ok(chats.into_items())
    }

    async fn fetch_messages(
        &self,
        chat_id: ChatId,
        after: Option<MessageId>,
    ) -> Result<Vec<ChatMessage>, RequestError> {
        let path = match after {
            Some(after) => format!("/chats/{chat_id}/messages?after_id={after}"),
            None => format!("/chats/{chat_id}/messages"),
        };
        let messages: ListEnvelope<ChatMessage> = self.client.get_json(&path).await?;
        Ok(messages.into_items())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ChatMark {
    updated_at: Option<String>,
    last_message_id: Option<MessageId>,
}

impl ChatMark {
    fn of(chat: &Chat) -> Self {
        Self {
            updated_at: chat.updated_at.clone(),
            last_message_id: chat.last_message_id(),
        }
    }
}

/// What the previous ticks have seen.
#[derive(Debug, Default)]
pub(crate) struct PollCursors {
    chats: Option<HashMap<ChatId, ChatMark>>,
    last_seen: HashMap<ChatId, Option<MessageId>>,
}

impl PollCursors {
    /// Diffs a chat list against the previous one.
    pub(crate) fn observe_chats(&mut self, feed: &Channel, chats: Vec<Chat>) -> Vec<InboundEvent> {
        let next: HashMap<ChatId, ChatMark> =
            chats.iter().map(|chat| (chat.id, ChatMark::of(chat))).collect();
        let Some(previous) = self.chats.replace(next) else {
            return Vec::new();
        };

        let wire = feed.wire_name();
        let membership_changed = previous.len() != chats.len()
            || chats.iter().any(|chat| !previous.contains_key(&chat.id));
        let mut events = Vec::new();

        for chat in chats {
            let Some(before) = previous.get(&chat.id) else {
                continue;
            };
            if *before == ChatMark::of(&chat) {
                continue;
            }
            if chat.last_message_id() > before.last_message_id {
                if let Some(message) = chat.last_message.clone() {
                    events.push(InboundEvent::new(
                        wire.clone(),
                        NEW_MESSAGE,
                        json!({ "message": message, "chat": chat }),
                    ));
                }
            }
            events.push(InboundEvent::new(
                wire.clone(),
                CHAT_UPDATED,
                json!({ "chat": chat }),
            ));
        }

        if membership_changed {
            events.push(InboundEvent::new(wire, CHAT_LIST_UPDATED, json!({})));
        }
        events
    }

    pub(crate) fn after(&self, chat_id: ChatId) -> Option<MessageId> {
        self.last_seen.get(&chat_id).copied().flatten()
    }

    /// New messages of one chat, oldest first.
    pub(crate) fn observe_messages(
        &mut self,
        chat_id: ChatId,
        mut messages: Vec<ChatMessage>,
    ) -> Vec<InboundEvent> {
        messages.sort_by_key(|message| message.id);
        let Some(cursor) = self.last_seen.get(&chat_id).copied() else {
            self.last_seen
                .insert(chat_id, messages.last().map(|message| message.id));
            return Vec::new();
        };

        let fresh: Vec<ChatMessage> = messages
            .into_iter()
            .filter(|message| cursor.map_or(true, |seen| message.id > seen))
            .collect();
        if let Some(newest) = fresh.last() {
            self.last_seen.insert(chat_id, Some(newest.id));
        }

        let wire = ChatTopic(chat_id).channel().wire_name();
        fresh
            .into_iter()
            .map(|message| InboundEvent::new(wire.clone(), NEW_MESSAGE, json!({ "message": message })))
            .collect()
    }

    /// Forgets chats that are no longer watched.
    pub(crate) fn retain_chats(&mut self, watched: &HashSet<ChatId>) {
        self.last_seen.retain(|chat_id, _| watched.contains(chat_id));
    }

    /// Advances the cursors past an event that was already delivered.
    ///
    /// Message cursors only move forward. Chats not in the snapshot are left
    /// alone so membership changes are still reported.
    pub(crate) fn record_delivery(&mut self, feed: &str, event: &InboundEvent) {
        if event.event != NEW_MESSAGE && event.event != CHAT_UPDATED {
            return;
        }

        if event.channel == feed {
            let Some(chats) = self.chats.as_mut() else {
                return;
            };
            let Ok(payload) = serde_json::from_value::<ChatUpdatedPayload>(event.data.clone())
            else {
                return;
            };
            let Some(mark) = chats.get_mut(&payload.chat.id) else {
                return;
            };
            if event.event == CHAT_UPDATED {
                *mark = ChatMark::of(&payload.chat);
            } else {
                let delivered = event.data["message"]["id"].as_u64();
                mark.last_message_id = mark.last_message_id.max(delivered);
            }
            return;
        }

        if event.event != NEW_MESSAGE {
            return;
        }
        let Some(ChatTopic(chat_id)) = ChatTopic::from_wire_name(&event.channel) else {
            return;
        };
        let Some(id) = event.data["message"]["id"].as_u64() else {
            return;
        };
        let seen = self.last_seen.entry(chat_id).or_insert(None);
        if seen.map_or(true, |seen| id > seen) {
            *seen = Some(id);
        }
    }
}

/// Registry tap that keeps poll cursors in step with delivered events.
struct DeliveryTracker {
    cursors: Arc<Mutex<PollCursors>>,
    feed: String,
}

impl EventHandler for DeliveryTracker {
    fn handle(&self, event: &InboundEvent) {
        self.cursors.lock().record_delivery(&self.feed, event);
    }
}

struct PollingState {
    task: JoinHandle<()>,
    live: Arc<AtomicBool>,
}

/// Periodic REST poller that feeds the channel registry.
pub struct PollingFallback {
    source: Arc<dyn PollSource>,
    registry: Arc<ChannelRegistry>,
    feed: Channel,
    interval: Duration,
    cursors: Arc<Mutex<PollCursors>>,
    state: Mutex<Option<PollingState>>,
}

impl PollingFallback {
    /// `feed` is the channel chat-list changes are dispatched on.
    pub fn new(
        source: Arc<dyn PollSource>,
        registry: Arc<ChannelRegistry>,
        feed: Channel,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            registry,
            feed,
            interval,
            cursors: Arc::new(Mutex::new(PollCursors::default())),
            state: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts polling every `interval`. Returns `false` if already running.
    pub fn start(&self, interval: Duration) -> bool {
        let mut state = self.state.lock();
        if state.is_some() {
            return false;
        }

        let interval = interval.max(PollingDefaults::MIN_INTERVAL);
        let live = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_polling(
            Arc::clone(&self.source),
            Arc::clone(&self.registry),
            self.feed.clone(),
            interval,
            Arc::clone(&self.cursors),
            Arc::clone(&live),
        ));
        *state = Some(PollingState { task, live });
        info!(event = "polling_started", interval_ms = interval.as_millis() as u64);
        true
    }

    /// Stops polling. No callback runs after this returns, even if a tick
    /// is mid-request or a handler is running on another thread. Returns
    /// `false` if not running.
    ///
    /// Cursors are kept; the next start picks up where this one stopped.
    pub fn stop(&self) -> bool {
        let stopped = self.halt();
        self.registry.quiesce();
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Forgets everything earlier ticks and deliveries recorded. The next
    /// tick is a fresh baseline.
    pub fn reset_cursors(&self) {
        *self.cursors.lock() = PollCursors::default();
    }

    /// Handler to install as the registry tap so events delivered by other
    /// sources advance the poll cursors.
    pub fn delivery_tracker(&self) -> Arc<dyn EventHandler> {
        Arc::new(DeliveryTracker {
            cursors: Arc::clone(&self.cursors),
            feed: self.feed.wire_name(),
        })
    }

    fn halt(&self) -> bool {
        let Some(state) = self.state.lock().take() else {
            return false;
        };
        state.live.store(false, Ordering::Release);
        state.task.abort();
        info!(event = "polling_stopped");
        true
    }
}

impl UpdateSource for PollingFallback {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn activate(&self) -> bool {
        self.start(self.interval)
    }

    // The session waits for handlers itself, after releasing its own lock.
    fn suspend(&self) {
        self.halt();
    }

    fn shutdown(&self) {
        self.halt();
        self.reset_cursors();
    }

    fn is_active(&self) -> bool {
        self.is_running()
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_polling(
    source: Arc<dyn PollSource>,
    registry: Arc<ChannelRegistry>,
    feed: Channel,
    interval: Duration,
    cursors: Arc<Mutex<PollCursors>>,
    live: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut finished_at: Option<Instant> = None;

    loop {
        let scheduled = ticker.tick().await;
        if !live.load(Ordering::Acquire) {
            return;
        }
        // A timer that fired while the previous tick was still running is
        // dropped rather than run late.
        if finished_at.is_some_and(|finished| scheduled < finished) {
            debug!(event = "poll_tick_skipped");
            continue;
        }

        poll_once(source.as_ref(), &registry, &feed, &cursors, &live).await;
        finished_at = Some(Instant::now());
    }
}

async fn poll_once(
    source: &dyn PollSource,
    registry: &ChannelRegistry,
    feed: &Channel,
    cursors: &Mutex<PollCursors>,
    live: &AtomicBool,
) {
    let still_live = || live.load(Ordering::Acquire);

    // The cursor lock is never held across an await or a dispatch; the
    // registry tap takes it again while handlers run.
    match source.fetch_chats().await {
        Ok(chats) => {
            let events = cursors.lock().observe_chats(feed, chats);
            for event in events {
                if !still_live() {
                    return;
                }
                registry.dispatch_while(&event, still_live);
            }
        }
        Err(err) => warn!(event = "poll_chats_failed", error = %err),
    }

    let watched: HashSet<ChatId> = registry
        .channels()
        .iter()
        .filter_map(ChatTopic::from_channel)
        .map(|topic| topic.0)
        .collect();
    cursors.lock().retain_chats(&watched);

    let mut watched: Vec<ChatId> = watched.into_iter().collect();
    watched.sort_unstable();
    for chat_id in watched {
        if !still_live() {
            return;
        }
        let after = cursors.lock().after(chat_id);
        match source.fetch_messages(chat_id, after).await {
            Ok(messages) => {
                let events = cursors.lock().observe_messages(chat_id, messages);
                for event in events {
                    if !still_live() {
                        return;
                    }
                    registry.dispatch_while(&event, still_live);
                }
            }
            Err(err) => warn!(event = "poll_messages_failed", chat_id, error = %err),
        }
    }
}
