//! Live connection state machine with bounded reconnect backoff.
//!
//! ```text
//! Idle --connect--> Connecting --Connected--> Connected
//!                      |  ^                      |
//!      timeout/dropped |  | timer                | dropped
//!                      v  |                      v
//!                   Disconnected <---------------+
//!                      |
//!     attempts exhausted or credentials rejected
//!                      v
//!                    Failed
//! ```
//!
//! Every link is tagged with an epoch. Events from a link whose epoch is no
//! longer current are ignored, so a link torn down by `disconnect` can never
//! deliver to a handler.
//!
//! A bound channel the server refuses to subscribe also ends in `Failed`:
//! the socket is still up, but events for that channel will never arrive.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::realtime::config::TransportConfig;
use crate::realtime::registry::{ChannelRegistry, ChannelSink};
use crate::realtime::transport::{InboundEvent, TransportCommand, TransportEvent, TransportLink};
use crate::realtime::UpdateSource;
use crate::retry::RetryPolicy;

pub struct ConnectionDefaults;

impl ConnectionDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_RECONNECT_ATTEMPTS: usize = 5;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Why the manager gave up on the live transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureCause {
    /// The server refused the credentials.
    Rejected(String),
    /// Every reconnect attempt failed.
    Exhausted { attempts: usize, last_error: String },
    /// The server refused a bound channel.
    SubscriptionRefused { channel: String, reason: String },
}

/// Counts reconnect attempts and produces their delays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempt: usize,
    max_attempts: usize,
    backoff: RetryPolicy,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: usize, backoff: RetryPolicy) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            backoff,
        }
    }

    /// Reconnects already scheduled since the last successful connect.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay before zero-based reconnect `attempt`.
    pub fn delay(&self, attempt: usize) -> Duration {
        self.backoff.delay_for_attempt(attempt + 1)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Delay for the next reconnect, advancing the counter. `None` once the
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            ConnectionDefaults::MAX_RECONNECT_ATTEMPTS,
            RetryPolicy::reconnect(),
        )
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// How long a link may stay in `Connecting` before it counts as dropped.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ConnectionDefaults::CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Called once each time the manager enters `Failed`, with the epoch of
/// the link that failed.
pub type FailureHook = Arc<dyn Fn(u64, FailureCause) + Send + Sync>;

/// Owns the live transport link and its reconnect timer.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: TransportConfig,
    registry: Arc<ChannelRegistry>,
    connect_timeout: Duration,
    inner: Mutex<Inner>,
    on_failed: Mutex<Option<FailureHook>>,
}

struct Inner {
    state: ConnectionState,
    policy: ReconnectPolicy,
    epoch: u64,
    link: Option<mpsc::UnboundedSender<TransportCommand>>,
    driver: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

struct LinkSink(mpsc::UnboundedSender<TransportCommand>);

impl ChannelSink for LinkSink {
    fn subscribe(&self, wire_name: &str) {
        let _ = self.0.send(TransportCommand::Subscribe {
            channel: wire_name.to_string(),
        });
    }

    fn unsubscribe(&self, wire_name: &str) {
        let _ = self.0.send(TransportCommand::Unsubscribe {
            channel: wire_name.to_string(),
        });
    }
}

impl ConnectionManager {
    pub fn new(
        config: TransportConfig,
        registry: Arc<ChannelRegistry>,
        options: ConnectionOptions,
    ) -> Self {
        let mut policy = options.reconnect;
        policy.reset();
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                connect_timeout: options.connect_timeout,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    policy,
                    epoch: 0,
                    link: None,
                    driver: None,
                    reconnect_timer: None,
                    last_error: None,
                }),
                on_failed: Mutex::new(None),
            }),
        }
    }

    /// Installs the hook run when the manager gives up. It runs outside the
    /// manager's lock and may call back into the manager.
    pub fn set_failure_hook(&self, hook: FailureHook) {
        *self.shared.on_failed.lock() = Some(hook);
    }

    pub fn clear_failure_hook(&self) {
        self.shared.on_failed.lock().take();
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnects scheduled since the last successful connect.
    pub fn attempt(&self) -> usize {
        self.shared.inner.lock().policy.attempt()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.inner.lock().last_error.clone()
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.shared.registry
    }

    /// Epoch of the current (or last) link.
    pub fn epoch(&self) -> u64 {
        self.shared.inner.lock().epoch
    }

    /// True while the manager is still in the failure reported for `epoch`.
    pub fn failed_at(&self, epoch: u64) -> bool {
        let inner = self.shared.inner.lock();
        inner.epoch == epoch && inner.state == ConnectionState::Failed
    }

    /// Opens a link. Returns `false` when already connecting or connected,
    /// or when the transport is unavailable.
    ///
    /// From `Failed` the attempt budget starts over. From `Disconnected` the
    /// pending reconnect timer is cancelled and the link opens now.
    pub fn connect(&self) -> bool {
        if !self.shared.config.is_available() {
            warn!(event = "connect_skipped", reason = "transport unavailable");
            return false;
        }

        let mut inner = self.shared.inner.lock();
        match inner.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!(event = "connect_ignored", state = ?inner.state);
                return false;
            }
            ConnectionState::Failed => inner.policy.reset(),
            ConnectionState::Idle | ConnectionState::Disconnected => {}
        }

        abort(inner.reconnect_timer.take());
        self.shared.open_link(&mut inner)
    }

    /// Tears down the link, cancels any pending reconnect and drops every
    /// channel binding. Valid from any state; ends in `Idle`.
    ///
    /// Returns once no handler dispatched by this manager is still running
    /// on another thread.
    pub fn disconnect(&self) {
        self.release_all();
        self.shared.registry.quiesce();
    }

    /// Releases the link and timers but keeps channel bindings. A `Failed`
    /// manager stays `Failed`; every other state becomes `Idle`.
    ///
    /// Waits for running handlers like [`Self::disconnect`].
    pub fn suspend(&self) {
        self.release_link();
        self.shared.registry.quiesce();
    }

    fn release_all(&self) {
        let mut inner = self.shared.inner.lock();
        inner.epoch += 1;
        abort(inner.reconnect_timer.take());
        self.shared.registry.unbind_all();
        inner.link = None;
        abort(inner.driver.take());
        inner.policy.reset();

        let previous = std::mem::replace(&mut inner.state, ConnectionState::Idle);
        if previous != ConnectionState::Idle {
            info!(event = "realtime_disconnected_by_client", previous = ?previous);
        }
    }

    fn release_link(&self) {
        let mut inner = self.shared.inner.lock();
        inner.epoch += 1;
        abort(inner.reconnect_timer.take());
        self.shared.registry.detach();
        inner.link = None;
        abort(inner.driver.take());
        if inner.state != ConnectionState::Failed {
            inner.state = ConnectionState::Idle;
        }
    }
}

impl UpdateSource for ConnectionManager {
    fn name(&self) -> &'static str {
        "live"
    }

    fn activate(&self) -> bool {
        self.connect()
    }

    // The session waits for handlers itself, after releasing its own lock.
    fn suspend(&self) {
        self.release_link();
    }

    fn shutdown(&self) {
        self.release_all();
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnected
        )
    }
}

impl Shared {
    fn open_link(self: &Arc<Self>, inner: &mut Inner) -> bool {
        let Some(transport) = self.config.transport().cloned() else {
            return false;
        };

        inner.epoch += 1;
        let epoch = inner.epoch;
        self.registry.detach();
        inner.link = None;
        abort(inner.driver.take());

        let TransportLink { commands, events } = transport.open(&self.config);
        inner.link = Some(commands);
        inner.state = ConnectionState::Connecting;
        inner.driver = Some(tokio::spawn(drive_link(
            Arc::downgrade(self),
            epoch,
            events,
            self.connect_timeout,
        )));

        info!(
            event = "realtime_connecting",
            attempt = inner.policy.attempt(),
            epoch
        );
        true
    }

    fn is_current(&self, epoch: u64) -> bool {
        let inner = self.inner.lock();
        inner.epoch == epoch && inner.state == ConnectionState::Connected
    }

    fn on_connected(&self, epoch: u64, socket_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.state = ConnectionState::Connected;
        inner.policy.reset();
        inner.last_error = None;
        abort(inner.reconnect_timer.take());

        let replayed = match &inner.link {
            Some(link) => self.registry.attach(Arc::new(LinkSink(link.clone()))),
            None => 0,
        };
        info!(
            event = "realtime_connected",
            socket_id = %socket_id,
            replayed_channels = replayed
        );
        true
    }

    fn dispatch(&self, epoch: u64, event: &InboundEvent) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        self.registry
            .dispatch_while(event, || self.is_current(epoch));
        true
    }

    fn on_link_lost(self: &Arc<Self>, epoch: u64, reason: String) {
        let failure = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            self.registry.detach();
            inner.link = None;
            inner.driver = None;
            inner.last_error = Some(reason.clone());

            match inner.policy.next_delay() {
                Some(delay) => {
                    inner.state = ConnectionState::Disconnected;
                    warn!(
                        event = "realtime_disconnected",
                        reason = %reason,
                        attempt = inner.policy.attempt(),
                        max_attempts = inner.policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64
                    );
                    let weak = Arc::downgrade(self);
                    inner.reconnect_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(shared) = weak.upgrade() {
                            shared.reconnect(epoch);
                        }
                    }));
                    None
                }
                None => {
                    inner.state = ConnectionState::Failed;
                    error!(
                        event = "realtime_failed",
                        reason = %reason,
                        attempts = inner.policy.attempt()
                    );
                    Some(FailureCause::Exhausted {
                        attempts: inner.policy.attempt(),
                        last_error: reason,
                    })
                }
            }
        };

        if let Some(cause) = failure {
            self.notify_failed(epoch, cause);
        }
    }

    fn on_rejected(&self, epoch: u64, reason: String) {
        {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            self.registry.detach();
            inner.link = None;
            inner.driver = None;
            abort(inner.reconnect_timer.take());
            inner.state = ConnectionState::Failed;
            inner.last_error = Some(reason.clone());
            error!(event = "realtime_rejected", reason = %reason);
        }
        self.notify_failed(epoch, FailureCause::Rejected(reason));
    }

    /// Returns `true` when the link is finished with: either it is stale or
    /// the refusal failed the manager.
    fn on_subscription_failed(&self, epoch: u64, channel: String, reason: String) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return true;
            }
            if !self.registry.contains(&channel) {
                debug!(
                    event = "unbound_subscription_failed",
                    channel = %channel,
                    reason = %reason
                );
                return false;
            }
            self.registry.detach();
            inner.link = None;
            inner.driver = None;
            abort(inner.reconnect_timer.take());
            inner.state = ConnectionState::Failed;
            inner.last_error = Some(format!("{channel}: {reason}"));
            error!(
                event = "realtime_subscription_refused",
                channel = %channel,
                reason = %reason
            );
        }
        self.notify_failed(epoch, FailureCause::SubscriptionRefused { channel, reason });
        true
    }

    fn reconnect(self: &Arc<Self>, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || inner.state != ConnectionState::Disconnected {
            return;
        }
        // Running inside the timer task; dropping its handle detaches it.
        inner.reconnect_timer = None;
        self.open_link(&mut inner);
    }

    fn notify_failed(&self, epoch: u64, cause: FailureCause) {
        let hook = self.on_failed.lock().clone();
        if let Some(hook) = hook {
            hook(epoch, cause);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        abort(inner.reconnect_timer.take());
        abort(inner.driver.take());
    }
}

enum LinkEnd {
    Closed,
    TimedOut,
}

async fn drive_link(
    shared: Weak<Shared>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    connect_timeout: Duration,
) {
    let connect_deadline = Instant::now() + connect_timeout;
    let mut connected = false;

    loop {
        let next = if connected {
            events.recv().await.ok_or(LinkEnd::Closed)
        } else {
            match tokio::time::timeout_at(connect_deadline, events.recv()).await {
                Ok(Some(event)) => Ok(event),
                Ok(None) => Err(LinkEnd::Closed),
                Err(_) => Err(LinkEnd::TimedOut),
            }
        };

        let Some(manager) = shared.upgrade() else {
            return;
        };

        match next {
            Ok(TransportEvent::Connected { socket_id }) => {
                if !manager.on_connected(epoch, &socket_id) {
                    return;
                }
                connected = true;
            }
            Ok(TransportEvent::Message(event)) => {
                if !manager.dispatch(epoch, &event) {
                    debug!(event = "stale_link_event_dropped", epoch);
                    if !connected {
                        continue;
                    }
                    return;
                }
            }
            Ok(TransportEvent::SubscriptionFailed { channel, reason }) => {
                if manager.on_subscription_failed(epoch, channel, reason) {
                    return;
                }
            }
            Ok(TransportEvent::Disconnected { reason }) => {
                manager.on_link_lost(epoch, reason);
                return;
            }
            Ok(TransportEvent::Rejected { reason }) => {
                manager.on_rejected(epoch, reason);
                return;
            }
            Err(LinkEnd::Closed) => {
                manager.on_link_lost(epoch, "transport closed the link".to_string());
                return;
            }
            Err(LinkEnd::TimedOut) => {
                manager.on_link_lost(
                    epoch,
                    format!("no connection within {}ms", connect_timeout.as_millis()),
                );
                return;
            }
        }
    }
}

fn abort(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}
