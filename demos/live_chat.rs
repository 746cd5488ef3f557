use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use discuss_realtime::model::{Chat, ChatMessage};
use discuss_realtime::realtime::{
    HttpChannelAuthorizer, LiveUpdates, RestPollSource, SessionLifecycle, SessionOptions,
    TransportConfig,
};
use discuss_realtime::rest::{NoToken, RetryingRequestClient, StaticToken, TokenProvider};

struct PrintUpdates;

impl LiveUpdates for PrintUpdates {
    fn on_new_message(&self, message: ChatMessage, chat: Chat) {
        println!(
            "new message chat={} id={} body={}",
            chat.id,
            message.id,
            message.body.as_deref().unwrap_or_default()
        );
    }

    fn on_chat_updated(&self, chat: Chat) {
        println!("chat updated id={} title={:?}", chat.id, chat.title);
    }

    fn on_chat_list_updated(&self) {
        println!("chat list updated");
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let user_id = env_u64("CHAT_USER_ID").unwrap_or(1);
    let chat_id = env_u64("CHAT_ID");
    let run_for = Duration::from_secs(env_u64("DEMO_SECONDS").unwrap_or(60));

    let tokens: Arc<dyn TokenProvider> = match std::env::var("CHAT_API_TOKEN") {
        Ok(token) if !token.trim().is_empty() => Arc::new(StaticToken::new(token)),
        _ => Arc::new(NoToken),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let rest = RetryingRequestClient::from_env(tokens)?;
        let config = TransportConfig::from_env()
            .with_authorizer(Arc::new(HttpChannelAuthorizer::new(rest.clone())));
        let session = SessionLifecycle::new(
            SessionOptions::from_env(user_id),
            config,
            Arc::new(RestPollSource::new(rest)),
        );

        session.start_session(Arc::new(PrintUpdates));
        if let Some(chat_id) = chat_id {
            session.subscribe_to_chat(chat_id, move |message| {
                println!("chat {chat_id} message id={}", message.id);
            });
        }
        println!("session mode={:?}", session.mode());

        tokio::time::sleep(run_for).await;
        println!("ending session mode={:?}", session.mode());
        session.end_session();

        Ok::<(), Box<dyn Error>>(())
    })
}
