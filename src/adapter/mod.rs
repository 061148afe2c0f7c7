//! Provider Adapter Layer
//!
//! One transport-agnostic execution contract, four implementations, selected
//! by a factory keyed on [`ProviderType`]. Adapters hide how a provider is
//! reached (subprocess-in-sandbox, vendor HTTP API, OpenAI-compatible proxy,
//! local inference daemon) behind the same chat/embeddings surface,
//! including streaming.
//!
//! The factory is closed over the four known transports; adding a fifth is
//! a compile-time visible change, not a runtime registration.

pub mod http;
pub mod local;
pub mod proxy;
pub mod sandbox;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::watch;

use crate::error::GatewayError;
use crate::provider::{Provider, ProviderType, SharedCredentials};
use crate::routing::pool::PoolManager;
use crate::wire::{ChatMessage, Usage};

// ============================================================================
// Cancellation
// ============================================================================

/// Sender half of a cancellation pair
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation to every [`CancelSignal`] clone
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver half of a cancellation pair, threaded into adapter calls
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is requested (or the handle is dropped)
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Create a connected cancel handle/signal pair
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

// ============================================================================
// Request / Response Contract
// ============================================================================

/// Generation options carried on every chat request
#[derive(Clone, Debug, Default)]
pub struct GenerationOptions {
    /// Response token ceiling
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter
    pub top_p: Option<f32>,
    /// Stop sequences
    pub stop: Option<Vec<String>>,
}

/// Transport-agnostic chat request
#[derive(Clone)]
pub struct AdapterRequest {
    /// Correlation id tagged on every attempt
    pub request_id: String,
    /// Provider the request targets
    pub provider_id: String,
    /// Provider-native model id (already mapped from the public id)
    pub model: String,
    /// Conversation messages
    pub messages: Vec<ChatMessage>,
    /// Generation options
    pub options: GenerationOptions,
    /// Whether the caller wants a chunk stream
    pub stream: bool,
    /// Optional cancellation signal from the orchestrator
    pub cancel: Option<CancelSignal>,
}

/// Transport-agnostic chat response
#[derive(Clone, Debug)]
pub struct AdapterResponse {
    /// Assistant content
    pub content: String,
    /// Model that produced the response (provider-native id)
    pub model: String,
    /// `stop`, `length`, or `None` when the provider did not say
    pub finish_reason: Option<String>,
    /// Token accounting, when the provider reports it
    pub usage: Option<Usage>,
}

/// One streamed response fragment
#[derive(Clone, Debug)]
pub struct AdapterChunk {
    /// Content fragment (may be empty on the final chunk)
    pub content: String,
    /// Set on the final chunk only
    pub finish_reason: Option<String>,
}

/// Finite, non-restartable stream of response chunks
pub type ChunkStream = BoxStream<'static, Result<AdapterChunk, GatewayError>>;

/// Transport-agnostic embeddings request
#[derive(Clone, Debug)]
pub struct EmbeddingsRequest {
    /// Correlation id
    pub request_id: String,
    /// Provider the request targets
    pub provider_id: String,
    /// Provider-native model id
    pub model: String,
    /// Inputs to embed, in order
    pub inputs: Vec<String>,
}

/// Transport-agnostic embeddings response
#[derive(Clone, Debug)]
pub struct EmbeddingsResponse {
    /// One vector per input, in input order
    pub vectors: Vec<Vec<f64>>,
    /// Token accounting, when the provider reports it
    pub usage: Option<Usage>,
}

/// One structured configuration problem from [`ProviderAdapter::validate_config`]
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ConfigIssue {
    /// Configuration field the issue concerns
    pub field: String,
    /// What is wrong
    pub message: String,
}

impl ConfigIssue {
    /// Build an issue for a field
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Adapter Contract
// ============================================================================

/// The execution contract every transport implements
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Transport this adapter speaks
    fn provider_type(&self) -> ProviderType;

    /// Execute a chat completion
    async fn handle_chat(&self, request: AdapterRequest) -> Result<AdapterResponse, GatewayError>;

    /// Execute a streaming chat completion.
    ///
    /// Transports without native streaming fall back to running the request
    /// buffered and yielding the whole response as a single chunk.
    async fn handle_chat_stream(
        &self,
        request: AdapterRequest,
    ) -> Result<ChunkStream, GatewayError> {
        let response = self.handle_chat(request).await?;
        let chunk = AdapterChunk {
            content: response.content,
            finish_reason: response.finish_reason.or_else(|| Some("stop".to_string())),
        };
        Ok(futures::stream::iter(vec![Ok(chunk)]).boxed())
    }

    /// Execute an embeddings request. Chat-only transports reject this as
    /// unsupported; the rejection is never retried.
    async fn handle_embeddings(
        &self,
        request: EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, GatewayError> {
        Err(GatewayError::Unsupported {
            provider: request.provider_id,
            operation: "embeddings".to_string(),
        })
    }

    /// Probe whether the provider is reachable
    async fn test_connection(&self) -> Result<(), GatewayError>;

    /// List the models the provider reports as available
    async fn get_models(&self) -> Result<Vec<String>, GatewayError>;

    /// Inspect the adapter's configuration. Returns every problem found;
    /// an empty list means the configuration is usable. Never fails.
    fn validate_config(&self) -> Vec<ConfigIssue>;

    /// Release held resources (processes, cached probes)
    async fn cleanup(&self) {}
}

// ============================================================================
// Factory
// ============================================================================

/// Build the adapter for a provider's transport.
///
/// Fails fast with a configuration error when the provider's settings do
/// not match its transport; per-call issues (unreachable host, bad
/// credential) surface later from the adapter itself.
pub fn build_adapter(
    provider: &Provider,
    credentials: SharedCredentials,
    pool: Arc<PoolManager>,
) -> Result<Arc<dyn ProviderAdapter>, GatewayError> {
    let adapter: Arc<dyn ProviderAdapter> = match provider.provider_type() {
        ProviderType::SandboxedSubprocess => {
            Arc::new(sandbox::SandboxAdapter::new(provider.clone())?)
        }
        ProviderType::HttpSdk => {
            Arc::new(http::HttpAdapter::new(provider.clone(), credentials, pool)?)
        }
        ProviderType::Proxy => {
            Arc::new(proxy::ProxyAdapter::new(provider.clone(), credentials, pool)?)
        }
        ProviderType::LocalDaemon => {
            Arc::new(local::LocalDaemonAdapter::new(provider.clone(), pool)?)
        }
    };
    Ok(adapter)
}

// ============================================================================
// Shared Body-Stream Helpers
// ============================================================================

/// Decode a server-sent-events body into its `data:` payloads.
///
/// Ends at the `[DONE]` sentinel or the end of the body; transport errors
/// surface once and terminate the stream.
pub(crate) fn sse_data_events(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String, GatewayError>> {
    let (tx, rx) = futures::channel::mpsc::unbounded();
    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim().to_string();
                        buffer.drain(..=pos);
                        if let Some(data) = line.strip_prefix("data:") {
                            let data = data.trim();
                            if data == "[DONE]" {
                                return;
                            }
                            if !data.is_empty()
                                && tx.unbounded_send(Ok(data.to_string())).is_err()
                            {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.unbounded_send(Err(GatewayError::from(e)));
                    return;
                }
            }
        }
    });
    rx.boxed()
}

/// Decode a newline-delimited-JSON body into its non-empty lines
pub(crate) fn ndjson_lines(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String, GatewayError>> {
    let (tx, rx) = futures::channel::mpsc::unbounded();
    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim().to_string();
                        buffer.drain(..=pos);
                        if !line.is_empty() && tx.unbounded_send(Ok(line)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.unbounded_send(Err(GatewayError::from(e)));
                    return;
                }
            }
        }
        // Trailing line without a newline terminator
        let rest = buffer.trim();
        if !rest.is_empty() {
            let _ = tx.unbounded_send(Ok(rest.to_string()));
        }
    });
    rx.boxed()
}

/// Cache of built adapters keyed by provider id.
///
/// The health monitor and the orchestrator share one cache so a provider's
/// adapter state (reachability caches, pooled clients) is reused. An entry
/// is rebuilt when the provider record it was built from changes transport.
pub struct AdapterCache {
    credentials: SharedCredentials,
    pool: Arc<PoolManager>,
    adapters: dashmap::DashMap<String, (ProviderType, Arc<dyn ProviderAdapter>)>,
}

impl AdapterCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(credentials: SharedCredentials, pool: Arc<PoolManager>) -> Self {
        Self {
            credentials,
            pool,
            adapters: dashmap::DashMap::new(),
        }
    }

    /// Get the adapter for a provider, building it on first use
    pub fn get_or_build(
        &self,
        provider: &Provider,
    ) -> Result<Arc<dyn ProviderAdapter>, GatewayError> {
        if let Some(entry) = self.adapters.get(&provider.id) {
            let (built_type, adapter) = entry.value();
            if *built_type == provider.provider_type() {
                return Ok(Arc::clone(adapter));
            }
        }
        let adapter = build_adapter(
            provider,
            Arc::clone(&self.credentials),
            Arc::clone(&self.pool),
        )?;
        self.adapters.insert(
            provider.id.clone(),
            (provider.provider_type(), Arc::clone(&adapter)),
        );
        Ok(adapter)
    }

    /// Drop a provider's adapter after running its cleanup hook
    pub async fn remove(&self, provider_id: &str) {
        if let Some((_, (_, adapter))) = self.adapters.remove(provider_id) {
            adapter.cleanup().await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct BufferedOnly;

    #[async_trait]
    impl ProviderAdapter for BufferedOnly {
        fn provider_type(&self) -> ProviderType {
            ProviderType::SandboxedSubprocess
        }

        async fn handle_chat(
            &self,
            _request: AdapterRequest,
        ) -> Result<AdapterResponse, GatewayError> {
            Ok(AdapterResponse {
                content: "whole response".to_string(),
                model: "m".to_string(),
                finish_reason: None,
                usage: None,
            })
        }

        async fn test_connection(&self) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn get_models(&self) -> Result<Vec<String>, GatewayError> {
            Ok(vec![])
        }

        fn validate_config(&self) -> Vec<ConfigIssue> {
            Vec::new()
        }
    }

    fn request() -> AdapterRequest {
        AdapterRequest {
            request_id: "req-1".to_string(),
            provider_id: "p".to_string(),
            model: "m".to_string(),
            messages: vec![ChatMessage::user("hi")],
            options: GenerationOptions::default(),
            stream: true,
            cancel: None,
        }
    }

    #[tokio::test]
    async fn test_default_stream_buffers_single_chunk() {
        let adapter = BufferedOnly;
        let mut stream = adapter.handle_chat_stream(request()).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.content, "whole response");
        assert_eq!(first.finish_reason.as_deref(), Some("stop"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_default_embeddings_unsupported() {
        let adapter = BufferedOnly;
        let err = adapter
            .handle_embeddings(EmbeddingsRequest {
                request_id: "req-1".to_string(),
                provider_id: "p".to_string(),
                model: "m".to_string(),
                inputs: vec!["x".to_string()],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_cancel_pair() {
        let (handle, mut signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }
}
