#![allow(dead_code)]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use chat_relay::config::{RelayConfig, UpstreamConfig};
use chat_relay::error::UpstreamError;
use chat_relay::io_struct::{ChatChunk, ChatRequest};
use chat_relay::relay_state::RelayState;
use chat_relay::upstream::{ChatUpstream, ChunkStream};

pub const SECRET: &str = "s3cret";
pub const MODEL: &str = "mock-model";

/// Builds the full relay app (CORS + both mounts) around a `RelayState`.
macro_rules! init_relay_app {
    ($state:expr) => {
        actix_web::test::init_service(
            actix_web::App::new()
                .wrap(chat_relay::middleware::Cors)
                .app_data(actix_web::web::Data::new($state))
                .configure(chat_relay::server::configure),
        )
        .await
    };
}
pub(crate) use init_relay_app;

#[derive(Debug, Clone)]
pub enum Step {
    Chunk(ChatChunk),
    Fail(String),
}

/// In-process upstream that replays a fixed script on every call.
pub struct ScriptedUpstream {
    steps: Vec<Step>,
    calls: AtomicUsize,
    last_request: Mutex<Option<ChatRequest>>,
}

impl ScriptedUpstream {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(ScriptedUpstream {
            steps,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

impl ChatUpstream for ScriptedUpstream {
    fn model(&self) -> &str {
        MODEL
    }

    fn stream_reply(&self, request: ChatRequest) -> ChunkStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request);
        let items: Vec<Result<ChatChunk, UpstreamError>> = self
            .steps
            .iter()
            .map(|step| match step {
                Step::Chunk(chunk) => Ok(chunk.clone()),
                Step::Fail(message) => Err(UpstreamError::Api {
                    message: message.clone(),
                }),
            })
            .collect();
        Box::pin(futures::stream::iter(items))
    }
}

pub fn chunk(id: &str, text: &str) -> ChatChunk {
    let mut chunk = ChatChunk::assistant(id, text);
    chunk.delta = Some(text.chars().last().map(String::from).unwrap_or_default());
    chunk.parent_message_id = Some("user-1".to_string());
    chunk
}

pub fn base_config() -> RelayConfig {
    RelayConfig::new(UpstreamConfig::new("sk-test"))
}

pub fn open_state(upstream: Arc<ScriptedUpstream>) -> RelayState {
    RelayState::with_upstream(base_config(), upstream)
}

pub fn secured_state(upstream: Arc<ScriptedUpstream>) -> RelayState {
    RelayState::with_upstream(base_config().with_auth_secret_key(SECRET), upstream)
}

pub fn limited_state(upstream: Arc<ScriptedUpstream>, max_requests: u32) -> RelayState {
    RelayState::with_upstream(
        base_config().with_rate_limit(max_requests, Duration::from_secs(3600)),
        upstream,
    )
}

pub fn bearer() -> (&'static str, String) {
    ("Authorization", format!("Bearer {}", SECRET))
}
