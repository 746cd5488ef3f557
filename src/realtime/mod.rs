//! Live chat updates over a realtime transport, with REST polling as the
//! fallback.

pub mod config;
pub mod connection;
pub mod polling;
pub mod proto;
#[cfg(feature = "pusher")]
pub mod pusher;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::TransportConfig;
pub use connection::{
    ConnectionManager, ConnectionOptions, ConnectionState, FailureCause, ReconnectPolicy,
};
pub use polling::{PollSource, PollingFallback, RestPollSource};
#[cfg(feature = "pusher")]
pub use pusher::PusherTransport;
pub use registry::{Channel, ChannelKind, ChannelRegistry, ChatTopic, EventHandler};
pub use session::{LiveUpdates, SessionLifecycle, SessionOptions, UpdateMode};
pub use transport::{
    ChannelAuthorizer, HttpChannelAuthorizer, InboundEvent, Transport, TransportCommand,
    TransportEvent, TransportLink,
};

/// A producer of chat updates the session can switch between.
///
/// At most one source is active at a time; the session suspends the other
/// before activating one.
pub trait UpdateSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts producing updates. Returns `false` if nothing was started.
    fn activate(&self) -> bool;

    /// Stops producing updates but keeps channel bindings.
    fn suspend(&self);

    /// Stops producing updates and releases everything.
    fn shutdown(&self);

    /// True while producing updates or about to, e.g. between reconnects.
    /// Always `false` right after `suspend` or `shutdown`.
    fn is_active(&self) -> bool;
}
