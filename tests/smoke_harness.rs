use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use async_trait::async_trait;
use axum::{Json, Router};
use discuss_realtime::model::{Chat, ChatMessage};
use discuss_realtime::realtime::{
    ChannelAuthorizer, HttpChannelAuthorizer, LiveUpdates, RestPollSource, SessionLifecycle,
    SessionOptions, TransportConfig, UpdateMode,
};
use discuss_realtime::rest::{
    NoToken, RequestError, RequestOptions, RestClientOptions, RetryingRequestClient, StaticToken,
};
use discuss_realtime::retry::RetryPolicy;
use futures_util::{SinkExt, StreamExt};
use reqwest::Method;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

const TEST_APP_KEY: &str = "test-app-key";
const TEST_TOKEN: &str = "session-token";
const TEST_USER_ID: u64 = 7;
const TEST_CHAT_ID: u64 = 42;

struct NoopUpdates;

impl LiveUpdates for NoopUpdates {
    fn on_new_message(&self, _message: ChatMessage, _chat: Chat) {}
    fn on_chat_updated(&self, _chat: Chat) {}
    fn on_chat_list_updated(&self) {}
}

fn fast_retries() -> RestClientOptions {
    RestClientOptions {
        retry_policy: RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            jitter: Duration::ZERO,
        },
        ..RestClientOptions::default()
    }
}

fn rest_client(addr: SocketAddr) -> RetryingRequestClient {
    RetryingRequestClient::with_options(
        format!("http://{addr}"),
        Arc::new(StaticToken::new(TEST_TOKEN)),
        fast_retries(),
    )
    .expect("build rest client")
}

struct ForwardUpdates(mpsc::UnboundedSender<u64>);

impl LiveUpdates for ForwardUpdates {
    fn on_new_message(&self, message: ChatMessage, _chat: Chat) {
        let _ = self.0.send(message.id);
    }
    fn on_chat_updated(&self, _chat: Chat) {}
    fn on_chat_list_updated(&self) {}
}

/// Signs everything except chat channels, which never get an answer.
struct StallingAuthorizer;

#[async_trait]
impl ChannelAuthorizer for StallingAuthorizer {
    async fn authorize(&self, _socket_id: &str, channel: &str) -> Result<String, RequestError> {
        if channel.starts_with("private-chat-") {
            return std::future::pending().await;
        }
        Ok(format!("{TEST_APP_KEY}:sig-{channel}"))
    }
}

#[derive(Clone)]
struct PusherState {
    subscribed_tx: Arc<Mutex<Option<oneshot::Sender<Result<Vec<String>, String>>>>>,
    /// Channels the client must subscribe before `push` is sent.
    expected: Arc<Vec<String>>,
    push: Arc<Value>,
}

impl PusherState {
    fn new(
        expected: Vec<String>,
        push: Value,
    ) -> (Self, oneshot::Receiver<Result<Vec<String>, String>>) {
        let (subscribed_tx, subscribed_rx) = oneshot::channel();
        let state = Self {
            subscribed_tx: Arc::new(Mutex::new(Some(subscribed_tx))),
            expected: Arc::new(expected),
            push: Arc::new(push),
        };
        (state, subscribed_rx)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_goes_live_against_mock_pusher_and_delivers_chat_message() {
    let chat_channel = format!("private-chat-{TEST_CHAT_ID}");
    let payload = json!({"message": {"id": 900, "chat_id": TEST_CHAT_ID, "body": "hello"}});
    let (state, subscribed_rx) = PusherState::new(
        vec![
            "chats".to_string(),
            format!("private-user-{TEST_USER_ID}"),
            chat_channel.clone(),
        ],
        json!({"event": "new-message", "channel": chat_channel, "data": payload.to_string()}),
    );
    let app = Router::new()
        .route("/app/{key}", get(pusher_handler))
        .route("/broadcasting/auth", post(auth_handler))
        .with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let rest = rest_client(addr);
    let config = TransportConfig::new(TEST_APP_KEY, "mt1")
        .with_host(format!("ws://{addr}"))
        .with_authorizer(Arc::new(HttpChannelAuthorizer::new(rest.clone())));
    let session = SessionLifecycle::new(
        SessionOptions::new(TEST_USER_ID),
        config,
        Arc::new(RestPollSource::new(rest)),
    );

    let (message_tx, mut message_rx) = mpsc::unbounded_channel();
    assert!(session.start_session(Arc::new(NoopUpdates)));
    session.subscribe_to_chat(TEST_CHAT_ID, move |message| {
        let _ = message_tx.send(message);
    });

    let message = timeout(Duration::from_secs(5), message_rx.recv())
        .await
        .expect("timed out waiting for chat message")
        .expect("message channel closed");
    assert_eq!(message.id, 900);
    assert_eq!(message.chat_id, TEST_CHAT_ID);
    assert!(session.is_live());
    assert_eq!(session.mode(), UpdateMode::Live);

    let subscribed = timeout(Duration::from_secs(2), subscribed_rx)
        .await
        .expect("timed out waiting for ws observations")
        .expect("ws observation channel closed")
        .expect("ws protocol assertions failed");
    assert!(subscribed.contains(&"chats".to_string()));
    assert!(subscribed.contains(&format!("private-user-{TEST_USER_ID}")));
    assert!(subscribed.contains(&format!("private-chat-{TEST_CHAT_ID}")));

    session.end_session();
    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

async fn pusher_handler(
    State(state): State<PusherState>,
    Path(key): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if key != TEST_APP_KEY {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |mut socket| async move {
        let result = run_pusher_protocol(&mut socket, &state.expected, &state.push).await;
        let subscribed_tx = state.subscribed_tx.clone();
        if let Some(tx) = subscribed_tx.lock().await.take() {
            let _ = tx.send(result);
        }
        // Keep the socket open until the client leaves.
        while let Some(Ok(message)) = socket.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    })
    .into_response()
}

async fn run_pusher_protocol(
    socket: &mut WebSocket,
    expected: &[String],
    push: &Value,
) -> Result<Vec<String>, String> {
    let established = json!({"socket_id": "123.456", "activity_timeout": 30}).to_string();
    send_frame(
        socket,
        json!({"event": "pusher:connection_established", "data": established}),
    )
    .await?;

    let mut subscribed = Vec::new();
    while !expected.iter().all(|channel| subscribed.contains(channel)) {
        let frame = recv_frame(socket).await?;
        if frame["event"] != "pusher:subscribe" {
            continue;
        }
        let channel = frame["data"]["channel"]
            .as_str()
            .ok_or("subscribe frame without channel")?
            .to_string();
        if channel.starts_with("private-") {
            let auth = format!("{TEST_APP_KEY}:sig-{channel}");
            if frame["data"]["auth"].as_str() != Some(auth.as_str()) {
                return Err(format!("missing or wrong auth for {channel}"));
            }
        }
        send_frame(
            socket,
            json!({"event": "pusher_internal:subscription_succeeded", "channel": channel, "data": "{}"}),
        )
        .await?;
        subscribed.push(channel);
    }

    send_frame(socket, push.clone()).await?;
    Ok(subscribed)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_chat_authorization_does_not_hold_up_other_channels() {
    let user_channel = format!("private-user-{TEST_USER_ID}");
    let payload = json!({
        "message": {"id": 901, "chat_id": TEST_CHAT_ID, "body": "hi"},
        "chat": {"id": TEST_CHAT_ID, "title": "general"},
    });
    let (state, subscribed_rx) = PusherState::new(
        vec!["chats".to_string(), user_channel.clone()],
        json!({"event": "new-message", "channel": user_channel, "data": payload.to_string()}),
    );
    let app = Router::new()
        .route("/app/{key}", get(pusher_handler))
        .with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let config = TransportConfig::new(TEST_APP_KEY, "mt1")
        .with_host(format!("ws://{addr}"))
        .with_authorizer(Arc::new(StallingAuthorizer));
    let session = SessionLifecycle::new(
        SessionOptions::new(TEST_USER_ID),
        config,
        Arc::new(RestPollSource::new(rest_client(addr))),
    );

    // The chat channel sorts before the user feed, so it is authorized first.
    let (feed_tx, mut feed_rx) = mpsc::unbounded_channel();
    session.subscribe_to_chat(TEST_CHAT_ID, |_| {});
    assert!(session.start_session(Arc::new(ForwardUpdates(feed_tx))));

    let delivered = timeout(Duration::from_secs(5), feed_rx.recv())
        .await
        .expect("feed message blocked behind a pending authorization")
        .expect("feed channel closed");
    assert_eq!(delivered, 901);
    assert!(session.is_live());

    let subscribed = timeout(Duration::from_secs(2), subscribed_rx)
        .await
        .expect("timed out waiting for ws observations")
        .expect("ws observation channel closed")
        .expect("ws protocol assertions failed");
    assert!(!subscribed.contains(&format!("private-chat-{TEST_CHAT_ID}")));

    session.end_session();
    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

async fn auth_handler(headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok());
    if bearer != Some(format!("Bearer {TEST_TOKEN}").as_str()) {
        return (StatusCode::FORBIDDEN, Json(json!({"message": "forbidden"})));
    }
    let channel = body["channel_name"].as_str().unwrap_or_default();
    if body["socket_id"] != "123.456" {
        return (StatusCode::BAD_REQUEST, Json(json!({"message": "bad socket"})));
    }
    (
        StatusCode::OK,
        Json(json!({"auth": format!("{TEST_APP_KEY}:sig-{channel}")})),
    )
}

async fn recv_frame(socket: &mut WebSocket) -> Result<Value, String> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|err| format!("failed to decode client frame: {err}"));
            }
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err("websocket closed before expected client frame".to_string());
            }
            Some(Ok(_)) => return Err("received unexpected non-text websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
            None => return Err("websocket stream ended unexpectedly".to_string()),
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: Value) -> Result<(), String> {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .map_err(|err| format!("failed to send server frame: {err}"))
}

#[derive(Clone, Default)]
struct RestState {
    hits: Arc<AtomicUsize>,
    failures_before_success: usize,
    failure_status: u16,
    authorization: Arc<Mutex<Vec<Option<String>>>>,
}

async fn flaky_handler(State(state): State<RestState>, headers: HeaderMap) -> impl IntoResponse {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    state.authorization.lock().await.push(
        headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    );
    if hit < state.failures_before_success {
        let status =
            StatusCode::from_u16(state.failure_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, Json(json!({"message": "try later"})));
    }
    (StatusCode::OK, Json(json!([{"id": 1, "title": "general"}])))
}

async fn rest_server(state: RestState) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/chats", get(flaky_handler))
        .with_state(state);
    spawn_server(app).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rest_client_retries_server_errors_until_success() {
    let state = RestState {
        failures_before_success: 3,
        failure_status: 500,
        ..RestState::default()
    };
    let (addr, shutdown_tx, server_task) = rest_server(state.clone()).await;

    let chats: Vec<Chat> = rest_client(addr)
        .get_json("/chats")
        .await
        .expect("fourth attempt should succeed");

    assert_eq!(chats.len(), 1);
    assert_eq!(state.hits.load(Ordering::SeqCst), 4);
    let expected = Some(format!("Bearer {TEST_TOKEN}"));
    assert!(state
        .authorization
        .lock()
        .await
        .iter()
        .all(|header| *header == expected));

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rest_client_gives_up_after_the_retry_budget() {
    let state = RestState {
        failures_before_success: usize::MAX,
        failure_status: 503,
        ..RestState::default()
    };
    let (addr, shutdown_tx, server_task) = rest_server(state.clone()).await;

    let err = rest_client(addr)
        .get_json::<Vec<Chat>>("/chats")
        .await
        .expect_err("every attempt fails");

    assert_eq!(err.attempts(), 4);
    assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(state.hits.load(Ordering::SeqCst), 4);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rest_client_does_not_retry_client_errors() {
    let state = RestState {
        failures_before_success: usize::MAX,
        failure_status: 404,
        ..RestState::default()
    };
    let (addr, shutdown_tx, server_task) = rest_server(state.clone()).await;

    let err = rest_client(addr)
        .get_json::<Vec<Chat>>("/chats")
        .await
        .expect_err("404 fails immediately");

    assert_eq!(err.attempts(), 1);
    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_authorization_header_wins_over_token() {
    let state = RestState::default();
    let (addr, shutdown_tx, server_task) = rest_server(state.clone()).await;

    let mut options = RequestOptions::default();
    options
        .headers
        .insert("authorization", HeaderValue::from_static("Bearer caller"));
    options.retries = Some(0);
    rest_client(addr)
        .request(Method::GET, "/chats", None, options)
        .await
        .expect("request succeeds");

    let anonymous = RetryingRequestClient::new(format!("http://{addr}"), Arc::new(NoToken))
        .expect("build client");
    anonymous
        .get_json::<Vec<Chat>>("/chats")
        .await
        .expect("request succeeds");

    assert_eq!(
        *state.authorization.lock().await,
        vec![Some("Bearer caller".to_string()), None]
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[derive(Clone, Default)]
struct FeedState {
    messages: Arc<Mutex<HashMap<u64, Vec<Value>>>>,
}

async fn chats_handler() -> impl IntoResponse {
    Json(json!({"data": [{"id": TEST_CHAT_ID, "title": "general"}]}))
}

async fn messages_handler(
    State(state): State<FeedState>,
    Path(chat_id): Path<u64>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let after: u64 = query
        .get("after_id")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    let messages: Vec<Value> = state
        .messages
        .lock()
        .await
        .get(&chat_id)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|message| message["id"].as_u64().unwrap_or(0) > after)
        .collect();
    Json(Value::Array(messages))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unconfigured_transport_polls_rest_for_new_messages() {
    let state = FeedState::default();
    state.messages.lock().await.insert(
        TEST_CHAT_ID,
        vec![json!({"id": 1, "chat_id": TEST_CHAT_ID, "body": "old"})],
    );
    let app = Router::new()
        .route("/chats", get(chats_handler))
        .route("/chats/{chat_id}/messages", get(messages_handler))
        .with_state(state.clone());
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let session = SessionLifecycle::new(
        SessionOptions::new(TEST_USER_ID).with_poll_interval(Duration::from_millis(200)),
        TransportConfig::unconfigured(),
        Arc::new(RestPollSource::new(rest_client(addr))),
    );
    let (message_tx, mut message_rx) = mpsc::unbounded_channel();
    session.subscribe_to_chat(TEST_CHAT_ID, move |message| {
        let _ = message_tx.send(message.id);
    });
    assert!(session.start_session(Arc::new(NoopUpdates)));
    assert_eq!(session.mode(), UpdateMode::Polling);

    tokio::time::sleep(Duration::from_millis(500)).await;
    state.messages.lock().await.entry(TEST_CHAT_ID).or_default().push(json!({
        "id": 2, "chat_id": TEST_CHAT_ID, "body": "new"
    }));

    let received = timeout(Duration::from_secs(5), message_rx.recv())
        .await
        .expect("timed out waiting for polled message")
        .expect("message channel closed");
    assert_eq!(received, 2);
    assert!(!session.is_live());

    session.end_session();
    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
