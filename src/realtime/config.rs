//! Realtime transport capability and credentials.

use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::realtime::transport::{ChannelAuthorizer, Transport};

pub const APP_KEY_ENV: &str = "PUSHER_APP_KEY";
pub const CLUSTER_ENV: &str = "PUSHER_APP_CLUSTER";
pub const HOST_ENV: &str = "PUSHER_HOST";

const PLACEHOLDER_VALUES: &[&str] = &[
    "changeme",
    "change-me",
    "placeholder",
    "xxx",
    "todo",
    "none",
    "null",
    "undefined",
    "key",
    "cluster",
];
const PLACEHOLDER_PREFIXES: &[&str] = &["your", "replace_with", "replace-with", "<"];

/// Static description of the realtime transport available to a session.
///
/// Configuration does not change within a session, so [`is_available`] is a
/// pure check that can run on every subscribe attempt.
///
/// [`is_available`]: TransportConfig::is_available
#[derive(Clone)]
pub struct TransportConfig {
    app_key: Option<SecretString>,
    cluster: Option<String>,
    host: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    authorizer: Option<Arc<dyn ChannelAuthorizer>>,
}

impl TransportConfig {
    /// Credentials for the built-in transport, when compiled in.
    pub fn new(app_key: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            app_key: Some(SecretString::new(app_key.into())),
            cluster: Some(cluster.into()),
            host: None,
            transport: default_transport(),
            authorizer: None,
        }
    }

    /// A config that never allows a live connection.
    pub fn unconfigured() -> Self {
        Self {
            app_key: None,
            cluster: None,
            host: None,
            transport: None,
            authorizer: None,
        }
    }

    /// Reads `PUSHER_APP_KEY`, `PUSHER_APP_CLUSTER` and `PUSHER_HOST`.
    ///
    /// Missing variables are not an error; they make the config unavailable.
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().map(|value| value.trim().to_string());
        Self {
            app_key: read(APP_KEY_ENV).map(SecretString::new),
            cluster: read(CLUSTER_ENV),
            host: read(HOST_ENV).filter(|host| !host.is_empty()),
            transport: default_transport(),
            authorizer: None,
        }
    }

    /// Replaces the transport implementation.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Removes the transport, as if no realtime library were present.
    pub fn without_transport(mut self) -> Self {
        self.transport = None;
        self
    }

    /// Points the transport at a self-hosted server instead of the cluster
    /// endpoint. Trailing whitespace and slashes are trimmed.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        let host: String = host.into();
        self.host = Some(host.trim_end().trim_end_matches('/').to_string());
        self
    }

    /// Sets the authorizer used for resource-scoped (private) channels.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn ChannelAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// True when a transport is present and key and cluster look real.
    pub fn is_available(&self) -> bool {
        if self.transport.is_none() {
            return false;
        }
        let key_ok = self
            .app_key
            .as_ref()
            .is_some_and(|key| !is_placeholder(key.expose_secret()));
        let cluster_ok = self
            .cluster
            .as_deref()
            .is_some_and(|cluster| !is_placeholder(cluster));
        key_ok && cluster_ok
    }

    pub fn app_key(&self) -> Option<&SecretString> {
        self.app_key.as_ref()
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }

    pub fn authorizer(&self) -> Option<&Arc<dyn ChannelAuthorizer>> {
        self.authorizer.as_ref()
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("app_key", &self.app_key.as_ref().map(|_| "[REDACTED]"))
            .field("cluster", &self.cluster)
            .field("host", &self.host)
            .field("transport", &self.transport.is_some())
            .field("authorizer", &self.authorizer.is_some())
            .finish()
    }
}

fn default_transport() -> Option<Arc<dyn Transport>> {
    #[cfg(feature = "pusher")]
    {
        Some(Arc::new(crate::realtime::pusher::PusherTransport::new()))
    }
    #[cfg(not(feature = "pusher"))]
    {
        None
    }
}

pub(crate) fn is_placeholder(value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    if value.is_empty() {
        return true;
    }
    PLACEHOLDER_VALUES.contains(&value.as_str())
        || PLACEHOLDER_PREFIXES
            .iter()
            .any(|prefix| value.starts_with(prefix))
}
