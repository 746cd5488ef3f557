//! Per-user update session: live when possible, polling otherwise.
//!
//! The session owns one [`ConnectionManager`] and one [`PollingFallback`] that
//! share a [`ChannelRegistry`]. Its mutex is the only writer of the current
//! [`UpdateMode`], and both sources are started and stopped while holding it,
//! so live delivery and polling never run at the same time.
//!
//! Poll cursors follow everything either source delivers, so switching from
//! live to polling resumes after the last message the application saw.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::model::{
    Chat, ChatId, ChatMessage, ChatMessagePayload, ChatUpdatedPayload, NewMessagePayload,
};
use crate::realtime::config::TransportConfig;
use crate::realtime::connection::{ConnectionManager, ConnectionOptions, ConnectionState, FailureCause};
use crate::realtime::polling::{PollSource, PollingDefaults, PollingFallback};
use crate::realtime::registry::{
    typed, Channel, ChannelRegistry, ChatTopic, EventHandler, CHATS_CHANNEL, CHAT_CREATED,
    CHAT_DELETED, CHAT_LIST_UPDATED, CHAT_UPDATED, NEW_MESSAGE,
};
use crate::realtime::transport::InboundEvent;
use crate::realtime::UpdateSource;

pub const POLL_INTERVAL_ENV: &str = "CHAT_POLL_INTERVAL_MS";

/// Callbacks for account-wide chat activity.
pub trait LiveUpdates: Send + Sync {
    /// A message arrived in any of the user's chats.
    fn on_new_message(&self, message: ChatMessage, chat: Chat);
    fn on_chat_updated(&self, chat: Chat);
    /// The set of chats changed; refetch the list.
    fn on_chat_list_updated(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    Idle,
    Live,
    Polling,
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub user_id: u64,
    pub poll_interval: Duration,
    pub connection: ConnectionOptions,
}

impl SessionOptions {
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            poll_interval: PollingDefaults::INTERVAL,
            connection: ConnectionOptions::default(),
        }
    }

    /// Like [`SessionOptions::new`], with the poll interval read from
    /// `CHAT_POLL_INTERVAL_MS` when set.
    pub fn from_env(user_id: u64) -> Self {
        let mut options = Self::new(user_id);
        if let Ok(raw) = std::env::var(POLL_INTERVAL_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(millis) => options.poll_interval = Duration::from_millis(millis),
                Err(err) => warn!(
                    event = "poll_interval_env_ignored",
                    value = %raw,
                    error = %err
                ),
            }
        }
        options
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionOptions) -> Self {
        self.connection = connection;
        self
    }
}

/// Chat update session for one authenticated user.
///
/// Dropping the session ends it.
pub struct SessionLifecycle {
    shared: Arc<SessionShared>,
}

struct SessionShared {
    config: TransportConfig,
    registry: Arc<ChannelRegistry>,
    connection: ConnectionManager,
    polling: PollingFallback,
    user_channel: Channel,
    state: Mutex<SessionState>,
}

struct SessionState {
    mode: UpdateMode,
}

impl SessionLifecycle {
    pub fn new(
        options: SessionOptions,
        config: TransportConfig,
        source: Arc<dyn PollSource>,
    ) -> Self {
        let registry = Arc::new(ChannelRegistry::new());
        let user_channel = Channel::user(options.user_id);
        let connection =
            ConnectionManager::new(config.clone(), Arc::clone(&registry), options.connection);
        let polling = PollingFallback::new(
            source,
            Arc::clone(&registry),
            user_channel.clone(),
            options.poll_interval,
        );

        let shared = Arc::new(SessionShared {
            config,
            registry,
            connection,
            polling,
            user_channel,
            state: Mutex::new(SessionState {
                mode: UpdateMode::Idle,
            }),
        });

        let weak: Weak<SessionShared> = Arc::downgrade(&shared);
        shared
            .connection
            .set_failure_hook(Arc::new(move |epoch: u64, cause: FailureCause| {
                if let Some(shared) = weak.upgrade() {
                    shared.fall_back(epoch, cause);
                }
            }));

        Self { shared }
    }

    /// Binds the account-wide channels and starts delivering updates, live
    /// if the transport is available and by polling otherwise.
    ///
    /// Returns `false` without changing anything if a session is already
    /// active.
    pub fn start_session(&self, callbacks: Arc<dyn LiveUpdates>) -> bool {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.mode != UpdateMode::Idle {
            warn!(event = "session_already_active", mode = ?state.mode);
            return false;
        }

        shared.bind_feed(&callbacks);

        if shared.config.is_available() && shared.enter(&mut state, UpdateMode::Live) {
            return true;
        }
        info!(event = "session_live_unavailable");
        shared.enter(&mut state, UpdateMode::Polling);
        true
    }

    /// Delivers new messages of `chat_id` to `on_message`, replacing any
    /// previous callback for that chat.
    pub fn subscribe_to_chat<F>(&self, chat_id: ChatId, on_message: F)
    where
        F: Fn(ChatMessage) + Send + Sync + 'static,
    {
        let handler = typed(move |payload: ChatMessagePayload| on_message(payload.message));
        self.shared
            .registry
            .replace(&ChatTopic(chat_id).channel(), NEW_MESSAGE, handler);
        debug!(event = "chat_subscribed", chat_id);
    }

    /// Stops delivering messages of `chat_id`. Unknown chats are ignored.
    pub fn unsubscribe_from_chat(&self, chat_id: ChatId) {
        if self.shared.registry.unbind(&ChatTopic(chat_id).channel()) {
            debug!(event = "chat_unsubscribed", chat_id);
        }
    }

    /// True while the live transport is connected.
    pub fn is_live(&self) -> bool {
        self.shared.connection.state() == ConnectionState::Connected
    }

    pub fn mode(&self) -> UpdateMode {
        self.shared.state.lock().mode
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    pub fn is_polling(&self) -> bool {
        self.shared.polling.is_running()
    }

    /// Leaves polling and makes a fresh live attempt. Returns `false` when
    /// not polling or when the transport is unavailable; polling continues in
    /// that case.
    pub fn retry_live(&self) -> bool {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.mode != UpdateMode::Polling || !shared.config.is_available() {
            return false;
        }
        if shared.enter(&mut state, UpdateMode::Live) {
            return true;
        }
        shared.enter(&mut state, UpdateMode::Polling);
        false
    }

    /// Stops both sources, cancels every timer and drops every callback.
    /// Idempotent.
    ///
    /// No callback runs after this returns, including one that was already
    /// running on another runtime thread. A callback may end its own session.
    pub fn end_session(&self) {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            let previous = state.mode;
            shared.enter(&mut state, UpdateMode::Idle);
            shared.registry.unbind_all();
            if previous != UpdateMode::Idle {
                info!(event = "session_ended", previous = ?previous);
            }
        }
        // Outside the session lock: a running callback may be waiting on it.
        shared.registry.quiesce();
    }
}

impl Drop for SessionLifecycle {
    fn drop(&mut self) {
        self.shared.connection.clear_failure_hook();
        self.end_session();
    }
}

impl SessionShared {
    fn bind_feed(&self, callbacks: &Arc<dyn LiveUpdates>) {
        let user = &self.user_channel;
        self.registry.set_tap(self.polling.delivery_tracker());

        let target = Arc::clone(callbacks);
        self.registry.bind(
            user,
            NEW_MESSAGE,
            typed(move |payload: NewMessagePayload| {
                target.on_new_message(payload.message, payload.chat)
            }),
        );

        let target = Arc::clone(callbacks);
        self.registry.bind(
            user,
            CHAT_UPDATED,
            typed(move |payload: ChatUpdatedPayload| target.on_chat_updated(payload.chat)),
        );

        let target = Arc::clone(callbacks);
        let list_updated: Arc<dyn EventHandler> =
            Arc::new(move |_: &InboundEvent| target.on_chat_list_updated());
        let chats = Channel::broadcast(CHATS_CHANNEL);
        self.registry
            .bind(user, CHAT_LIST_UPDATED, Arc::clone(&list_updated));
        self.registry
            .bind(&chats, CHAT_CREATED, Arc::clone(&list_updated));
        self.registry.bind(&chats, CHAT_DELETED, list_updated);
    }

    /// Switches to `mode`, suspending the other source first. Returns whether
    /// the target source started.
    fn enter(&self, state: &mut SessionState, mode: UpdateMode) -> bool {
        let (target, other) = match mode {
            UpdateMode::Live => (
                &self.connection as &dyn UpdateSource,
                &self.polling as &dyn UpdateSource,
            ),
            UpdateMode::Polling => (
                &self.polling as &dyn UpdateSource,
                &self.connection as &dyn UpdateSource,
            ),
            UpdateMode::Idle => {
                self.connection.shutdown();
                self.polling.shutdown();
                state.mode = UpdateMode::Idle;
                return true;
            }
        };

        other.suspend();
        debug_assert!(!other.is_active(), "{} still active", other.name());
        state.mode = mode;
        let started = target.activate();
        info!(
            event = "session_mode_changed",
            mode = ?mode,
            source = target.name(),
            started
        );
        started
    }

    /// Runs from the connection's failure hook. Failures of a link that is
    /// no longer current (the session was restarted or retried since) are
    /// ignored.
    fn fall_back(&self, epoch: u64, cause: FailureCause) {
        let mut state = self.state.lock();
        if state.mode != UpdateMode::Live || !self.connection.failed_at(epoch) {
            debug!(event = "fallback_ignored", mode = ?state.mode, epoch);
            return;
        }
        warn!(event = "session_fallback_to_polling", cause = ?cause);
        self.enter(&mut state, UpdateMode::Polling);
    }
}
