//! Subscription intent shared by the live connection and the polling
//! fallback.
//!
//! The registry records which channels the application wants and which
//! handlers are bound to which events, independent of whether a socket is
//! open. While a [`ChannelSink`] is attached, subscription changes are
//! forwarded to it; attaching a new sink replays every channel.
//!
//! Dispatch is tracked per thread so a source that stops can wait for
//! handlers still running elsewhere ([`ChannelRegistry::quiesce`]).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::model::ChatId;
use crate::realtime::transport::InboundEvent;

/// Wire prefix of resource-scoped channels.
pub const PRIVATE_PREFIX: &str = "private-";

/// Broadcast channel carrying chat-list membership changes.
pub const CHATS_CHANNEL: &str = "chats";

pub const NEW_MESSAGE: &str = "new-message";
pub const CHAT_UPDATED: &str = "chat-updated";
pub const CHAT_LIST_UPDATED: &str = "chat-list-updated";
pub const CHAT_CREATED: &str = "chat-created";
pub const CHAT_DELETED: &str = "chat-deleted";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Visible to every client.
    Broadcast,
    /// Scoped to a user or resource; requires authorization.
    Resource,
}

/// A named channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Channel {
    name: String,
    kind: ChannelKind,
}

impl Channel {
    pub fn broadcast(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Broadcast,
        }
    }

    pub fn resource(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Resource,
        }
    }

    /// Per-user feed channel.
    pub fn user(user_id: u64) -> Self {
        Self::resource(format!("user-{user_id}"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Name used on the wire and as the registry key.
    pub fn wire_name(&self) -> String {
        match self.kind {
            ChannelKind::Broadcast => self.name.clone(),
            ChannelKind::Resource => format!("{PRIVATE_PREFIX}{}", self.name),
        }
    }
}

/// The message channel of a single chat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatTopic(pub ChatId);

impl ChatTopic {
    const NAME_PREFIX: &'static str = "chat-";

    pub fn channel(&self) -> Channel {
        Channel::resource(format!("{}{}", Self::NAME_PREFIX, self.0))
    }

    /// Recovers the topic from a chat channel.
    pub fn from_channel(channel: &Channel) -> Option<Self> {
        if channel.kind() != ChannelKind::Resource {
            return None;
        }
        channel
            .name()
            .strip_prefix(Self::NAME_PREFIX)?
            .parse()
            .ok()
            .map(Self)
    }

    /// Recovers the topic from a wire name such as `private-chat-4`.
    pub fn from_wire_name(wire_name: &str) -> Option<Self> {
        let name = wire_name.strip_prefix(PRIVATE_PREFIX)?;
        Self::from_channel(&Channel::resource(name))
    }
}

/// Receives events dispatched on a bound channel.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &InboundEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&InboundEvent) + Send + Sync,
{
    fn handle(&self, event: &InboundEvent) {
        self(event)
    }
}

struct TypedHandler<T, F> {
    callback: F,
    _payload: PhantomData<fn(T)>,
}

impl<T, F> EventHandler for TypedHandler<T, F>
where
    T: DeserializeOwned,
    F: Fn(T) + Send + Sync,
{
    fn handle(&self, event: &InboundEvent) {
        match serde_json::from_value::<T>(event.data.clone()) {
            Ok(payload) => (self.callback)(payload),
            Err(err) => warn!(
                event = "handler_payload_rejected",
                channel = %event.channel,
                event_name = %event.event,
                error = %err
            ),
        }
    }
}

/// Wraps a callback that takes a decoded payload.
///
/// Payloads that do not decode into `T` are logged and dropped; the callback
/// never sees them.
pub fn typed<T, F>(callback: F) -> Arc<dyn EventHandler>
where
    T: DeserializeOwned + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    Arc::new(TypedHandler {
        callback,
        _payload: PhantomData,
    })
}

/// Destination for subscription changes, usually an open transport link.
pub trait ChannelSink: Send + Sync {
    fn subscribe(&self, wire_name: &str);
    fn unsubscribe(&self, wire_name: &str);
}

struct Binding {
    event: String,
    handler: Arc<dyn EventHandler>,
}

struct Subscription {
    channel: Channel,
    bindings: Vec<Binding>,
}

#[derive(Default)]
struct RegistryInner {
    subscriptions: BTreeMap<String, Subscription>,
    sink: Option<Arc<dyn ChannelSink>>,
    tap: Option<Arc<dyn EventHandler>>,
}

#[derive(Default)]
struct InFlightState {
    running: HashMap<ThreadId, usize>,
    draining: HashSet<ThreadId>,
}

/// Handlers currently running, counted per thread.
#[derive(Default)]
struct InFlight {
    state: Mutex<InFlightState>,
    changed: Condvar,
}

impl InFlight {
    fn enter(&self) -> Running<'_> {
        let thread = thread::current().id();
        *self.state.lock().running.entry(thread).or_default() += 1;
        Running {
            in_flight: self,
            thread,
        }
    }

    fn wait_idle(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        state.draining.insert(me);
        self.changed.notify_all();
        // Threads that are themselves waiting here cannot make progress
        // until we return, so they do not count.
        while state
            .running
            .keys()
            .any(|thread| *thread != me && !state.draining.contains(thread))
        {
            self.changed.wait(&mut state);
        }
        state.draining.remove(&me);
    }
}

struct Running<'a> {
    in_flight: &'a InFlight,
    thread: ThreadId,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let mut state = self.in_flight.state.lock();
        if let Some(count) = state.running.get_mut(&self.thread) {
            *count -= 1;
            if *count == 0 {
                state.running.remove(&self.thread);
            }
        }
        drop(state);
        self.in_flight.changed.notify_all();
    }
}

/// Channel bindings keyed by wire name.
#[derive(Default)]
pub struct ChannelRegistry {
    inner: Mutex<RegistryInner>,
    in_flight: InFlight,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `event` on `channel`.
    ///
    /// Binding the same handler (by pointer) to the same event twice is a
    /// no-op and returns `false`.
    pub fn bind(&self, channel: &Channel, event: &str, handler: Arc<dyn EventHandler>) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let wire = channel.wire_name();
        let is_new = !inner.subscriptions.contains_key(&wire);
        let subscription = inner
            .subscriptions
            .entry(wire.clone())
            .or_insert_with(|| Subscription {
                channel: channel.clone(),
                bindings: Vec::new(),
            });

        if subscription
            .bindings
            .iter()
            .any(|binding| binding.event == event && same_handler(&binding.handler, &handler))
        {
            debug!(event = "binding_duplicate_ignored", channel = %wire, event_name = %event);
            return false;
        }

        subscription.bindings.push(Binding {
            event: event.to_string(),
            handler,
        });
        if is_new {
            if let Some(sink) = &inner.sink {
                sink.subscribe(&wire);
            }
        }
        true
    }

    /// Binds `handler` as the only handler of `event` on `channel`.
    pub fn replace(&self, channel: &Channel, event: &str, handler: Arc<dyn EventHandler>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let wire = channel.wire_name();
        let is_new = !inner.subscriptions.contains_key(&wire);
        let subscription = inner
            .subscriptions
            .entry(wire.clone())
            .or_insert_with(|| Subscription {
                channel: channel.clone(),
                bindings: Vec::new(),
            });

        subscription.bindings.retain(|binding| binding.event != event);
        subscription.bindings.push(Binding {
            event: event.to_string(),
            handler,
        });
        if is_new {
            if let Some(sink) = &inner.sink {
                sink.subscribe(&wire);
            }
        }
    }

    /// Drops every binding on `channel`. Returns `false` if it was not bound.
    pub fn unbind(&self, channel: &Channel) -> bool {
        let mut inner = self.inner.lock();
        let wire = channel.wire_name();
        if inner.subscriptions.remove(&wire).is_none() {
            return false;
        }
        if let Some(sink) = &inner.sink {
            sink.unsubscribe(&wire);
        }
        debug!(event = "channel_unbound", channel = %wire);
        true
    }

    /// Drops all bindings and the tap, and detaches the sink.
    pub fn unbind_all(&self) {
        let mut inner = self.inner.lock();
        inner.tap = None;
        let subscriptions = std::mem::take(&mut inner.subscriptions);
        if let Some(sink) = inner.sink.take() {
            for wire in subscriptions.keys() {
                sink.unsubscribe(wire);
            }
        }
        if !subscriptions.is_empty() {
            debug!(event = "channels_cleared", count = subscriptions.len());
        }
    }

    /// Attaches `sink` and subscribes it to every bound channel. Returns the
    /// number of channels replayed.
    pub fn attach(&self, sink: Arc<dyn ChannelSink>) -> usize {
        let mut inner = self.inner.lock();
        for wire in inner.subscriptions.keys() {
            sink.subscribe(wire);
        }
        inner.sink = Some(sink);
        inner.subscriptions.len()
    }

    /// Stops forwarding subscription changes. Bindings are kept.
    pub fn detach(&self) {
        self.inner.lock().sink = None;
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().sink.is_some()
    }

    pub fn is_bound(&self, channel: &Channel) -> bool {
        self.contains(&channel.wire_name())
    }

    pub fn contains(&self, wire_name: &str) -> bool {
        self.inner.lock().subscriptions.contains_key(wire_name)
    }

    /// Installs a handler that sees every dispatched event, bound or not,
    /// before the bound handlers run. Cleared by [`Self::unbind_all`].
    pub fn set_tap(&self, tap: Arc<dyn EventHandler>) {
        self.inner.lock().tap = Some(tap);
    }

    pub fn handler_count(&self, channel: &Channel) -> usize {
        self.inner
            .lock()
            .subscriptions
            .get(&channel.wire_name())
            .map_or(0, |subscription| subscription.bindings.len())
    }

    /// Bound channels ordered by wire name.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner
            .lock()
            .subscriptions
            .values()
            .map(|subscription| subscription.channel.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().subscriptions.is_empty()
    }

    /// Delivers `event` to its handlers. Returns how many ran.
    pub fn dispatch(&self, event: &InboundEvent) -> usize {
        self.dispatch_while(event, || true)
    }

    /// Delivers `event` to its handlers, checking `still_live` before each
    /// one. Handlers run without the registry lock held, so they may bind
    /// and unbind freely.
    ///
    /// `still_live` is checked after the handler is registered as running,
    /// so a source that flips its liveness and then calls [`Self::quiesce`]
    /// never sees a handler start afterwards.
    pub fn dispatch_while(&self, event: &InboundEvent, still_live: impl Fn() -> bool) -> usize {
        let (tap, handlers) = {
            let inner = self.inner.lock();
            let handlers: Vec<Arc<dyn EventHandler>> = match inner.subscriptions.get(&event.channel)
            {
                Some(subscription) => subscription
                    .bindings
                    .iter()
                    .filter(|binding| binding.event == event.event)
                    .map(|binding| Arc::clone(&binding.handler))
                    .collect(),
                None => Vec::new(),
            };
            (inner.tap.clone(), handlers)
        };

        if let Some(tap) = tap {
            let _running = self.in_flight.enter();
            if !still_live() {
                return 0;
            }
            tap.handle(event);
        }

        let mut delivered = 0;
        for handler in handlers {
            let _running = self.in_flight.enter();
            if !still_live() {
                break;
            }
            handler.handle(event);
            delivered += 1;
        }
        delivered
    }

    /// Blocks until no handler is running on another thread.
    ///
    /// Handlers on the calling thread are not waited for, so a handler may
    /// stop the source that is dispatching it.
    pub fn quiesce(&self) {
        self.in_flight.wait_idle();
    }
}

fn same_handler(left: &Arc<dyn EventHandler>, right: &Arc<dyn EventHandler>) -> bool {
    Arc::as_ptr(left) as *const () == Arc::as_ptr(right) as *const ()
}
