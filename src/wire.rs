//! OpenAI-Compatible Wire Format
//!
//! Serde types for the public HTTP surface. Clients see exactly these shapes
//! regardless of which provider transport produced the result:
//!
//! - `GET /v1/models` — [`ModelList`]
//! - `POST /v1/chat/completions` — [`ChatCompletionRequest`] in,
//!   [`ChatCompletionResponse`] (or a sequence of [`ChatCompletionChunk`]s
//!   terminated by a sentinel) out
//! - `POST /v1/embeddings` — [`EmbeddingsRequest`] in, [`EmbeddingsResponse`] out
//! - errors — [`ErrorBody`]

use serde::{Deserialize, Serialize};

// ============================================================================
// Models
// ============================================================================

/// `GET /v1/models` response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelList {
    /// Always `"list"`
    pub object: String,
    /// Available models
    pub data: Vec<ModelEntry>,
}

/// One model in the `/v1/models` listing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Public model identifier
    pub id: String,
    /// Always `"model"`
    pub object: String,
    /// Unix timestamp the model was registered
    pub created: i64,
    /// Owning provider id
    pub owned_by: String,
    /// Max-token ceiling from the model mapping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Context window size, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    /// Whether streaming completions are supported
    pub supports_streaming: bool,
    /// Whether embeddings are supported
    pub supports_embeddings: bool,
}

// ============================================================================
// Chat
// ============================================================================

/// A chat message (request and response side)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user`, `assistant`, or `tool`
    pub role: String,
    /// Message content
    pub content: String,
}

impl ChatMessage {
    /// Build a message with the given role
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Convenience constructor for a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// Convenience constructor for a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    /// Convenience constructor for an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// `POST /v1/chat/completions` request body
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Public model identifier
    pub model: String,
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
    /// Response token ceiling; unset inherits the model mapping's ceiling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Stop sequences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Whether to stream the response as chunks
    #[serde(default)]
    pub stream: bool,
    /// End-user identifier (passed through, never interpreted)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Non-streaming chat completion response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    /// Request correlation id (`chatcmpl-...`)
    pub id: String,
    /// Always `"chat.completion"`
    pub object: String,
    /// Unix timestamp of completion
    pub created: i64,
    /// Public model id that served the request
    pub model: String,
    /// Completion choices (always exactly one from this gateway)
    pub choices: Vec<ChatChoice>,
    /// Token accounting
    pub usage: Usage,
}

/// One completion choice
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    /// Choice index
    pub index: u32,
    /// The assistant message
    pub message: ChatMessage,
    /// `stop`, `length`, or `error`
    pub finish_reason: Option<String>,
}

/// Streaming chat completion chunk
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Request correlation id (stable across chunks of one response)
    pub id: String,
    /// Always `"chat.completion.chunk"`
    pub object: String,
    /// Unix timestamp of the chunk
    pub created: i64,
    /// Public model id that served the request
    pub model: String,
    /// Delta choices
    pub choices: Vec<ChunkChoice>,
}

/// One delta choice inside a chunk
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index
    pub index: u32,
    /// Incremental content
    pub delta: ChunkDelta,
    /// Set only on the final chunk
    pub finish_reason: Option<String>,
}

/// Incremental message content
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Role, present on the first chunk only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content fragment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Token accounting for a completed request
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens in the completion
    pub completion_tokens: u32,
    /// Sum of the above
    pub total_tokens: u32,
}

impl Usage {
    /// Build usage from prompt/completion counts
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

// ============================================================================
// Embeddings
// ============================================================================

/// `POST /v1/embeddings` request body
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    /// Public model identifier
    pub model: String,
    /// One or more inputs to embed
    pub input: EmbeddingsInput,
    /// End-user identifier (passed through)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Embeddings input: single string or batch
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingsInput {
    /// A single input
    Single(String),
    /// A batch of inputs
    Batch(Vec<String>),
}

impl EmbeddingsInput {
    /// Flatten into a list of input strings
    #[must_use]
    pub fn into_texts(self) -> Vec<String> {
        match self {
            Self::Single(s) => vec![s],
            Self::Batch(v) => v,
        }
    }
}

/// `POST /v1/embeddings` response body
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    /// Always `"list"`
    pub object: String,
    /// One vector per input, in input order
    pub data: Vec<EmbeddingEntry>,
    /// Public model id that served the request
    pub model: String,
    /// Token accounting (completion tokens are always 0)
    pub usage: Usage,
}

/// One embedding vector
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingEntry {
    /// Always `"embedding"`
    pub object: String,
    /// The vector
    pub embedding: Vec<f64>,
    /// Input index this vector corresponds to
    pub index: u32,
}

// ============================================================================
// Errors
// ============================================================================

/// Wire error body: `{"error": {"message", "type", "code"}}`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// The error payload
    pub error: ErrorDetail,
}

/// Error payload fields
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Human-readable message
    pub message: String,
    /// Error class (e.g. `rate_limit_error`)
    #[serde(rename = "type")]
    pub error_type: String,
    /// Stable machine code (e.g. `rate_limit_exceeded`)
    pub code: String,
}

impl ErrorBody {
    /// Build an error body
    pub fn new(
        message: impl Into<String>,
        error_type: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: error_type.into(),
                code: code.into(),
            },
        }
    }
}

/// Current Unix timestamp for wire `created` fields
#[must_use]
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_stream_defaults_false() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert!(!req.stream);
        assert!(req.max_tokens.is_none());
    }

    #[test]
    fn test_embeddings_input_untagged() {
        let single: EmbeddingsRequest =
            serde_json::from_str(r#"{"model":"embed-1","input":"hello"}"#).unwrap();
        assert_eq!(single.input.into_texts(), vec!["hello".to_string()]);

        let batch: EmbeddingsRequest =
            serde_json::from_str(r#"{"model":"embed-1","input":["a","b"]}"#).unwrap();
        assert_eq!(batch.input.into_texts().len(), 2);
    }

    #[test]
    fn test_error_body_shape() {
        let body = ErrorBody::new("too fast", "rate_limit_error", "rate_limit_exceeded");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["type"], "rate_limit_error");
        assert_eq!(json["error"]["code"], "rate_limit_exceeded");
        assert_eq!(json["error"]["message"], "too fast");
    }

    #[test]
    fn test_usage_totals() {
        let usage = Usage::new(10, 32);
        assert_eq!(usage.total_tokens, 42);
    }

    #[test]
    fn test_chunk_delta_skips_empty_fields() {
        let chunk = ChunkDelta {
            role: None,
            content: Some("tok".into()),
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(!json.contains("role"));
        assert!(json.contains("tok"));
    }
}
