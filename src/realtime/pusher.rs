//! Pusher websocket transport.
//!
//! Each [`Transport::open`] spawns one worker that owns the socket for the
//! lifetime of the link. The worker never reconnects; it reports a terminal
//! [`TransportEvent`] and exits, and the connection manager decides what
//! happens next.
//!
//! The worker also exits, closing the socket, as soon as the manager drops
//! its half of the link, including mid-handshake. Private channel
//! authorizations run concurrently with the socket loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::FuturesUnordered;
use futures_util::{SinkExt, Stream, StreamExt};
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::realtime::config::TransportConfig;
use crate::realtime::proto::{ConnectionEstablished, Frame, ServerEvent, PROTOCOL_VERSION};
use crate::realtime::registry::PRIVATE_PREFIX;
use crate::realtime::transport::{
    ChannelAuthorizer, InboundEvent, LinkEndpoint, Transport, TransportCommand, TransportEvent,
    TransportLink,
};

const CLIENT_NAME: &str = "discuss-realtime";
const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
const PONG_TIMEOUT: Duration = Duration::from_secs(30);

/// Websocket transport speaking the Pusher channels protocol.
#[derive(Clone, Debug)]
pub struct PusherTransport {
    activity_timeout: Duration,
    pong_timeout: Duration,
}

impl Default for PusherTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PusherTransport {
    pub fn new() -> Self {
        Self {
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            pong_timeout: PONG_TIMEOUT,
        }
    }

    /// Upper bound on silence before the client pings. The server may ask
    /// for a shorter interval in `connection_established`.
    pub fn with_activity_timeout(mut self, activity_timeout: Duration) -> Self {
        self.activity_timeout = activity_timeout;
        self
    }

    pub fn with_pong_timeout(mut self, pong_timeout: Duration) -> Self {
        self.pong_timeout = pong_timeout;
        self
    }

    /// Websocket URL for `config`, or `None` when key or endpoint is missing.
    pub fn endpoint(config: &TransportConfig) -> Option<String> {
        let key = config.app_key()?.expose_secret().trim().to_string();
        if key.is_empty() {
            return None;
        }
        let base = match config.host() {
            Some(host) => host.to_string(),
            None => format!("wss://ws-{}.pusher.com", config.cluster()?.trim()),
        };
        Some(format!(
            "{base}/app/{key}?protocol={PROTOCOL_VERSION}&client={CLIENT_NAME}&version={}&flash=false",
            env!("CARGO_PKG_VERSION")
        ))
    }
}

impl Transport for PusherTransport {
    fn open(&self, config: &TransportConfig) -> TransportLink {
        let (link, endpoint) = TransportLink::pair();
        let url = Self::endpoint(config);
        let authorizer = config.authorizer().cloned();
        let timers = LinkTimers {
            activity_timeout: self.activity_timeout,
            pong_timeout: self.pong_timeout,
        };

        tokio::spawn(async move {
            pusher_link_worker(url, authorizer, timers, endpoint).await;
        });

        link
    }
}

/// Errors raised while driving a Pusher socket.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server refused this client.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Protocol or handshake contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Clone, Copy, Debug)]
struct LinkTimers {
    activity_timeout: Duration,
    pong_timeout: Duration,
}

enum LinkOutcome {
    Closed,
    Lost(String),
    Rejected(String),
}

async fn pusher_link_worker(
    url: Option<String>,
    authorizer: Option<Arc<dyn ChannelAuthorizer>>,
    timers: LinkTimers,
    mut endpoint: LinkEndpoint,
) {
    let Some(url) = url else {
        let _ = endpoint.events.send(TransportEvent::Rejected {
            reason: "app key or cluster missing".to_string(),
        });
        return;
    };

    let outcome = match run_link(&url, authorizer.as_deref(), timers, &mut endpoint).await {
        Ok(outcome) => outcome,
        Err(err) => classify_error(err),
    };

    match outcome {
        LinkOutcome::Closed => debug!(event = "pusher_link_closed"),
        LinkOutcome::Lost(reason) => {
            debug!(event = "pusher_link_lost", reason = %reason);
            let _ = endpoint.events.send(TransportEvent::Disconnected { reason });
        }
        LinkOutcome::Rejected(reason) => {
            warn!(event = "pusher_link_rejected", reason = %reason);
            let _ = endpoint.events.send(TransportEvent::Rejected { reason });
        }
    }
}

fn classify_error(err: TransportError) -> LinkOutcome {
    match err {
        TransportError::WebSocket(WsError::Http(response))
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            LinkOutcome::Rejected(format!("handshake refused with http {}", response.status()))
        }
        TransportError::Rejected(reason) => LinkOutcome::Rejected(reason),
        other => LinkOutcome::Lost(other.to_string()),
    }
}

async fn run_link(
    url: &str,
    authorizer: Option<&dyn ChannelAuthorizer>,
    timers: LinkTimers,
    endpoint: &mut LinkEndpoint,
) -> Result<LinkOutcome, TransportError> {
    let handshake = async {
        let (mut socket, _) = connect_async(url).await?;
        let established = recv_connection_established(&mut socket).await?;
        Ok::<_, TransportError>((socket, established))
    };
    // Dropping the handshake future drops the half-open socket with it.
    let (mut socket, established) = tokio::select! {
        result = handshake => result?,
        _ = endpoint.events.closed() => return Ok(LinkOutcome::Closed),
    };

    let socket_id = established.socket_id.clone();
    let activity_timeout = established
        .activity_timeout
        .map(Duration::from_secs)
        .map_or(timers.activity_timeout, |server| server.min(timers.activity_timeout));

    if endpoint
        .events
        .send(TransportEvent::Connected {
            socket_id: socket_id.clone(),
        })
        .is_err()
    {
        let _ = socket.close(None).await;
        return Ok(LinkOutcome::Closed);
    }

    let mut last_activity = Instant::now();
    let mut ping_sent_at: Option<Instant> = None;
    let mut authorizing: FuturesUnordered<BoxFuture<'_, (String, Result<Frame, String>)>> =
        FuturesUnordered::new();
    // Channels with an authorization in flight, and those of them that were
    // unsubscribed before it finished.
    let mut pending: HashSet<String> = HashSet::new();
    let mut cancelled: HashSet<String> = HashSet::new();

    loop {
        let deadline = match ping_sent_at {
            Some(sent) => sent + timers.pong_timeout,
            None => last_activity + activity_timeout,
        };

        tokio::select! {
            maybe_command = endpoint.commands.recv() => {
                match maybe_command {
                    Some(TransportCommand::Subscribe { channel }) => {
                        if !channel.starts_with(PRIVATE_PREFIX) {
                            send_frame(&mut socket, &Frame::subscribe(&channel, None)).await?;
                        } else if let Some(authorizer) = authorizer {
                            if pending.contains(&channel) {
                                cancelled.remove(&channel);
                            } else {
                                pending.insert(channel.clone());
                                authorizing.push(
                                    authorize_subscribe(channel, &socket_id, authorizer).boxed(),
                                );
                            }
                        } else {
                            let _ = endpoint.events.send(TransportEvent::SubscriptionFailed {
                                channel,
                                reason: "no authorizer configured for private channel".to_string(),
                            });
                        }
                    }
                    Some(TransportCommand::Unsubscribe { channel }) => {
                        if pending.contains(&channel) {
                            cancelled.insert(channel);
                        } else {
                            send_frame(&mut socket, &Frame::unsubscribe(&channel)).await?;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return Ok(LinkOutcome::Closed);
                    }
                }
            }
            Some((channel, result)) = authorizing.next(), if !authorizing.is_empty() => {
                pending.remove(&channel);
                if cancelled.remove(&channel) {
                    debug!(event = "pusher_authorization_discarded", channel = %channel);
                    continue;
                }
                match result {
                    Ok(frame) => send_frame(&mut socket, &frame).await?,
                    Err(reason) => {
                        let _ = endpoint
                            .events
                            .send(TransportEvent::SubscriptionFailed { channel, reason });
                    }
                }
            }
            maybe_inbound = socket.next() => {
                last_activity = Instant::now();
                ping_sent_at = None;
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => match Frame::from_text(text.as_str()) {
                        Ok(frame) => {
                            if let Some(outcome) = handle_frame(frame, &mut socket, endpoint).await? {
                                let _ = socket.close(None).await;
                                return Ok(outcome);
                            }
                        }
                        Err(err) => warn!(event = "pusher_frame_malformed", error = %err),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        socket.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => return Ok(close_outcome(frame)),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(TransportError::WebSocket(err)),
                    None => return Ok(LinkOutcome::Lost("socket ended".to_string())),
                }
            }
            _ = endpoint.events.closed() => {
                let _ = socket.close(None).await;
                return Ok(LinkOutcome::Closed);
            }
            _ = tokio::time::sleep_until(deadline) => {
                if ping_sent_at.is_some() {
                    return Ok(LinkOutcome::Lost("pong not received".to_string()));
                }
                send_frame(&mut socket, &Frame::ping()).await?;
                ping_sent_at = Some(Instant::now());
            }
        }
    }
}

/// Handles one decoded frame. `Some` ends the link.
async fn handle_frame<S>(
    frame: Frame,
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    endpoint: &LinkEndpoint,
) -> Result<Option<LinkOutcome>, TransportError>
where
    tokio_tungstenite::WebSocketStream<S>: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    match frame.into_server_event() {
        ServerEvent::App {
            channel,
            event,
            data,
        } => {
            let message = TransportEvent::Message(InboundEvent {
                channel,
                event,
                data,
            });
            if endpoint.events.send(message).is_err() {
                return Ok(Some(LinkOutcome::Closed));
            }
        }
        ServerEvent::Ping => send_frame(socket, &Frame::pong()).await?,
        ServerEvent::Pong => {}
        ServerEvent::Error(error) => {
            if error.is_fatal() {
                return Ok(Some(LinkOutcome::Rejected(error.describe())));
            }
            if matches!(error.code, Some(4100..=4299)) {
                return Ok(Some(LinkOutcome::Lost(error.describe())));
            }
            warn!(event = "pusher_error", error = %error.describe());
        }
        ServerEvent::SubscriptionSucceeded { channel } => {
            debug!(event = "pusher_subscribed", channel = %channel);
        }
        ServerEvent::SubscriptionError { channel, detail } => {
            let reason = detail
                .error
                .or(detail.kind)
                .unwrap_or_else(|| "subscription refused".to_string());
            let reason = match detail.status {
                Some(status) => format!("{reason} (status {status})"),
                None => reason,
            };
            let _ = endpoint
                .events
                .send(TransportEvent::SubscriptionFailed { channel, reason });
        }
        ServerEvent::ConnectionEstablished(_) => {
            debug!(event = "pusher_duplicate_connection_established");
        }
        ServerEvent::Ignored(name) => debug!(event = "pusher_frame_ignored", frame = %name),
        ServerEvent::Malformed(reason) => warn!(event = "pusher_frame_malformed", error = %reason),
    }
    Ok(None)
}

fn close_outcome(frame: Option<CloseFrame>) -> LinkOutcome {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            let reason = format!("closed with {code}: {}", frame.reason.as_str());
            if (4000..4100).contains(&code) {
                LinkOutcome::Rejected(reason)
            } else {
                LinkOutcome::Lost(reason)
            }
        }
        None => LinkOutcome::Lost("closed by server".to_string()),
    }
}

async fn authorize_subscribe(
    channel: String,
    socket_id: &str,
    authorizer: &dyn ChannelAuthorizer,
) -> (String, Result<Frame, String>) {
    let frame = match authorizer.authorize(socket_id, &channel).await {
        Ok(auth) => Ok(Frame::subscribe(&channel, Some(auth))),
        Err(err) => Err(format!("authorization failed: {err}")),
    };
    (channel, frame)
}

async fn recv_connection_established<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
) -> Result<ConnectionEstablished, TransportError>
where
    tokio_tungstenite::WebSocketStream<S>: futures_util::Sink<Message, Error = WsError>
        + Stream<Item = Result<Message, WsError>>
        + Unpin,
{
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => match Frame::from_text(text.as_str())?.into_server_event()
            {
                ServerEvent::ConnectionEstablished(established) => return Ok(established),
                ServerEvent::Error(error) if error.is_fatal() => {
                    return Err(TransportError::Rejected(error.describe()));
                }
                ServerEvent::Error(error) => {
                    return Err(TransportError::Protocol(error.describe()));
                }
                other => {
                    return Err(TransportError::Protocol(format!(
                        "expected connection_established, got {other:?}"
                    )));
                }
            },
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                return match close_outcome(frame) {
                    LinkOutcome::Rejected(reason) => Err(TransportError::Rejected(reason)),
                    _ => Err(TransportError::Protocol(
                        "socket closed before connection_established".to_string(),
                    )),
                };
            }
            Some(Ok(_)) => {
                return Err(TransportError::Protocol(
                    "received non-text frame before connection_established".to_string(),
                ));
            }
            Some(Err(err)) => return Err(TransportError::WebSocket(err)),
            None => {
                return Err(TransportError::Protocol(
                    "socket ended before connection_established".to_string(),
                ));
            }
        }
    }
}

async fn send_frame<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    frame: &Frame,
) -> Result<(), TransportError>
where
    tokio_tungstenite::WebSocketStream<S>: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let text = frame.to_text()?;
    socket.send(Message::Text(text.into())).await?;
    Ok(())
}
