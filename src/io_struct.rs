use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body-level outcome carried by every JSON envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Fail,
    Unauthorized,
}

/// `{status, message, data}` envelope shared by all non-streaming endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: Status,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        ApiResponse {
            status: Status::Success,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        ApiResponse {
            status: Status::Fail,
            message: message.into(),
            data: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiResponse {
            status: Status::Unauthorized,
            message: message.into(),
            data: None,
        }
    }

    /// Folds a handler result into the envelope. Errors never escape as HTTP
    /// failures from here; the caller always answers 200.
    pub fn from_result<E: std::fmt::Display>(
        result: Result<T, E>,
        message: impl Into<String>,
    ) -> Self {
        match result {
            Ok(data) => ApiResponse::success(message, data),
            Err(e) => ApiResponse::fail(e.to_string()),
        }
    }
}

/// Context the browser echoes back from the previous reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
}

/// Body of `POST /chat-process`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(default)]
    pub options: ChatOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, rename = "top_p", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

/// One incremental piece of the assistant reply, forwarded verbatim to the
/// browser. `id` is the continuation token the client sends back as
/// `options.parentMessageId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatChunk {
    pub id: String,
    pub role: String,
    /// Reply text accumulated so far, not just this chunk.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl ChatChunk {
    pub fn assistant(id: impl Into<String>, text: impl Into<String>) -> Self {
        ChatChunk {
            id: id.into(),
            role: "assistant".to_string(),
            text: text.into(),
            delta: None,
            detail: None,
            parent_message_id: None,
            conversation_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub auth: bool,
    pub model: String,
}

/// Capability payload returned by `POST /config`. Absent settings are
/// reported as `"-"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigData {
    pub api_model: String,
    pub model: String,
    pub reverse_proxy: String,
    pub timeout_ms: u64,
    pub socks_proxy: String,
    pub https_proxy: String,
}
