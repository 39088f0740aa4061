//! Upstream chat-completion client.
//!
//! [`ChatUpstream`] is the seam between the relay and whatever produces the
//! reply. [`OpenAiUpstream`] talks to an OpenAI compatible
//! `/v1/chat/completions` endpoint and turns its server-sent events into
//! [`ChatChunk`]s.

use async_stream::try_stream;
use futures::{Stream, stream::BoxStream};
use futures_util::StreamExt;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{Secret, UpstreamConfig};
use crate::error::{UpstreamError, extract_message};
use crate::io_struct::{ChatChunk, ChatRequest};

/// Lazy, finite, non-restartable sequence of reply chunks.
pub type ChunkStream = BoxStream<'static, Result<ChatChunk, UpstreamError>>;

pub trait ChatUpstream: Send + Sync {
    /// Model name requests are sent to.
    fn model(&self) -> &str;

    /// Starts one upstream call. Nothing is sent until the stream is polled.
    fn stream_reply(&self, request: ChatRequest) -> ChunkStream;
}

#[derive(Debug, Clone)]
pub struct OpenAiUpstream {
    client: reqwest::Client,
    api_key: Secret,
    base_url: String,
    model: String,
}

#[derive(Debug, Clone, Serialize)]
struct CompletionMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<CompletionMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    id: String,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    delta: CompletionDelta,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(proxy) = &config.https_proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        if let Some(socks) = &config.socks_proxy {
            builder = builder.proxy(reqwest::Proxy::all(socks.url())?);
        }
        Ok(OpenAiUpstream {
            client: builder.build()?,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn completion_request(&self, request: &ChatRequest) -> CompletionRequest {
        let system = request
            .system_message
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(default_system_message);
        CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                CompletionMessage {
                    role: "system",
                    content: system,
                },
                CompletionMessage {
                    role: "user",
                    content: request.prompt.clone(),
                },
            ],
            stream: true,
            temperature: request.temperature,
            top_p: request.top_p,
        }
    }
}

fn default_system_message() -> String {
    format!(
        "You are a helpful assistant. Answer as concisely as possible.\nCurrent date: {}",
        chrono::Local::now().format("%Y-%m-%d")
    )
}

impl ChatUpstream for OpenAiUpstream {
    fn model(&self) -> &str {
        &self.model
    }

    fn stream_reply(&self, request: ChatRequest) -> ChunkStream {
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let url = self.completions_url();
        let body = self.completion_request(&request);
        // id of the user turn this reply answers
        let mut reply = ReplyBuilder::new(
            Uuid::new_v4().to_string(),
            request.options.conversation_id.clone(),
        );

        boxed(try_stream! {
            debug!("POST {} model={}", url, body.model);
            let response = client
                .post(&url)
                .bearer_auth(api_key.expose())
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let bytes = response.bytes().await?;
                Err::<(), _>(UpstreamError::from_status(status, &bytes))?;
                return;
            }

            let mut lines = LineBuffer::default();
            let mut byte_stream = response.bytes_stream();
            while let Some(bytes) = byte_stream.next().await {
                lines.extend(&bytes?);
                while let Some(line) = lines.next_line()? {
                    match parse_event(&line)? {
                        SseEvent::Done => return,
                        SseEvent::Data(raw) => {
                            if let Some(chunk) = reply.apply(raw)? {
                                yield chunk;
                            }
                        }
                        SseEvent::Ignored => {}
                    }
                }
            }

            // body ended without [DONE]; flush a trailing unterminated line
            if let Some(line) = lines.finish()? {
                if let SseEvent::Data(raw) = parse_event(&line)? {
                    if let Some(chunk) = reply.apply(raw)? {
                        yield chunk;
                    }
                }
            }
        })
    }
}

fn boxed<S>(stream: S) -> ChunkStream
where
    S: Stream<Item = Result<ChatChunk, UpstreamError>> + Send + 'static,
{
    Box::pin(stream)
}

/// Accumulates the reply text across chunks.
struct ReplyBuilder {
    parent_message_id: String,
    conversation_id: Option<String>,
    text: String,
}

impl ReplyBuilder {
    fn new(parent_message_id: String, conversation_id: Option<String>) -> Self {
        ReplyBuilder {
            parent_message_id,
            conversation_id,
            text: String::new(),
        }
    }

    fn apply(&mut self, raw: Value) -> Result<Option<ChatChunk>, UpstreamError> {
        if raw.get("error").is_some() {
            let message = extract_message(raw.to_string().as_bytes())
                .unwrap_or_else(|| "Upstream reported an error".to_string());
            return Err(UpstreamError::Api { message });
        }

        let parsed: CompletionChunk = serde_json::from_value(raw.clone())?;
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Ok(None);
        };

        let delta = choice.delta.content.filter(|c| !c.is_empty());
        if let Some(delta) = &delta {
            self.text.push_str(delta);
        }

        let mut chunk = ChatChunk::assistant(parsed.id, self.text.clone());
        chunk.delta = delta;
        chunk.detail = Some(raw);
        chunk.parent_message_id = Some(self.parent_message_id.clone());
        chunk.conversation_id = self.conversation_id.clone();
        Ok(Some(chunk))
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(Value),
    Done,
    Ignored,
}

/// Interprets one server-sent-event line. Only `data:` fields matter.
fn parse_event(line: &str) -> Result<SseEvent, UpstreamError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Ignored);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseEvent::Ignored);
    }
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    Ok(SseEvent::Data(serde_json::from_str(data)?))
}

/// Reassembles lines from a byte stream whose chunk boundaries are
/// arbitrary.
#[derive(Debug, Default)]
struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Result<Option<String>, UpstreamError> {
        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|e| UpstreamError::InvalidEvent(format!("UTF-8 decode error: {e}")))
    }

    fn finish(&mut self) -> Result<Option<String>, UpstreamError> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            return Ok(None);
        }
        let line = std::mem::take(&mut self.buffer);
        String::from_utf8(line)
            .map(|l| Some(l.trim_end().to_string()))
            .map_err(|e| UpstreamError::InvalidEvent(format!("UTF-8 decode error: {e}")))
    }
}
