//! Gateway Orchestrator
//!
//! Composition root tying the routing core together. A [`Gateway`] owns the
//! breaker registry, fallback engine, performance facade, adapter cache, and
//! health monitor, and exposes the three OpenAI-surface operations:
//! chat completions (buffered and streaming), embeddings, and model listing.
//!
//! Request flow for a buffered completion: cache lookup, queue admission,
//! fallback ordering, breaker-guarded adapter call, normalization to the
//! wire shape. Streaming requests skip the cache, enter the queue at
//! elevated priority, and hold no queue slot once the stream is handed over.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapter::{
    AdapterCache, AdapterRequest, CancelSignal, ConfigIssue, GenerationOptions,
};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::events::{EventSink, NullSink};
use crate::provider::{ModelMapping, Provider, SharedCredentials, SharedDirectory};
use crate::routing::{
    spawn_sweeper, BreakerRegistry, ExecuteOptions, FallbackConfig, FallbackEngine, FacadeHealth,
    FacadeStats, HealthMonitor, PerformanceFacade, PoolManager, TtlCache, WorkQueue,
};
use crate::wire::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    ChunkChoice, ChunkDelta, EmbeddingEntry, EmbeddingsResponse, ModelEntry, ModelList, Usage,
    unix_now,
};

// Queue priorities by operation (0 = highest)
const STREAM_PRIORITY: usize = 0;
const CHAT_PRIORITY: usize = 1;
const EMBEDDINGS_PRIORITY: usize = 2;

/// One streamed chunk result
pub type WireChunkStream = BoxStream<'static, Result<ChatCompletionChunk, GatewayError>>;

// ============================================================================
// Gateway
// ============================================================================

/// The assembled routing core
pub struct Gateway {
    directory: SharedDirectory,
    breakers: Arc<BreakerRegistry>,
    fallback: Arc<FallbackEngine>,
    facade: Arc<PerformanceFacade>,
    adapters: Arc<AdapterCache>,
    monitor: Arc<HealthMonitor>,
    cache: Arc<TtlCache<serde_json::Value>>,
}

impl Gateway {
    /// Assemble a gateway from configuration and the two collaborator seams
    #[must_use]
    pub fn new(
        config: &GatewayConfig,
        directory: SharedDirectory,
        credentials: SharedCredentials,
    ) -> Self {
        Self::with_events(config, directory, credentials, Arc::new(NullSink))
    }

    /// Assemble a gateway that emits lifecycle events
    #[must_use]
    pub fn with_events(
        config: &GatewayConfig,
        directory: SharedDirectory,
        credentials: SharedCredentials,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let pool = Arc::new(PoolManager::new(config.pool.to_config()));
        let breakers = Arc::new(BreakerRegistry::with_events(
            config.breaker.to_config(),
            Arc::clone(&events),
        ));
        let adapters = Arc::new(AdapterCache::new(credentials, Arc::clone(&pool)));
        let cache = Arc::new(TtlCache::with_events(
            config.cache.to_config(),
            Arc::clone(&events),
        ));
        let queue = WorkQueue::with_events(config.queue.to_config(), Arc::clone(&events));
        let facade = Arc::new(PerformanceFacade::new(
            queue,
            Arc::clone(&cache),
            Arc::clone(&pool),
        ));
        let fallback = Arc::new(FallbackEngine::new(
            Arc::clone(&directory),
            Arc::clone(&breakers),
        ));
        let monitor = Arc::new(HealthMonitor::with_events(
            config.health.to_config(),
            Arc::clone(&directory),
            Arc::clone(&breakers),
            Arc::clone(&adapters),
            events,
        ));

        Self {
            directory,
            breakers,
            fallback,
            facade,
            adapters,
            monitor,
            cache,
        }
    }

    /// Spawn the health monitor and cache sweeper.
    ///
    /// The returned handles run until aborted; dropping them detaches the
    /// tasks.
    #[must_use]
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        info!("starting gateway background tasks");
        vec![
            Arc::clone(&self.monitor).spawn(),
            spawn_sweeper(Arc::clone(&self.cache)),
        ]
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    /// Serve a buffered chat completion with a generated request id
    pub async fn chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        self.chat_completion_with_id(request, new_request_id()).await
    }

    /// Serve a buffered chat completion under a caller-supplied request id.
    ///
    /// The id tags every provider attempt and the wire response, so a
    /// serving layer can correlate gateway work with its own tracing.
    pub async fn chat_completion_with_id(
        &self,
        request: ChatCompletionRequest,
        request_id: impl Into<String>,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        self.chat_completion_with_cancel(request, request_id, None)
            .await
    }

    /// Buffered chat completion carrying an optional cancellation signal.
    ///
    /// The signal reaches the selected adapter, which stops its upstream
    /// work once cancellation is requested. An already-cancelled request
    /// fails without contacting a provider.
    pub async fn chat_completion_with_cancel(
        &self,
        request: ChatCompletionRequest,
        request_id: impl Into<String>,
        cancel: Option<CancelSignal>,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        Self::validate_chat(&request)?;
        let request_id = request_id.into();
        let cache_key = chat_cache_key(&request);
        let model = request.model.clone();

        let fallback = Arc::clone(&self.fallback);
        let adapters = Arc::clone(&self.adapters);
        let work = move || async move {
            let attempt = |provider: Provider| {
                let adapters = Arc::clone(&adapters);
                let request = request.clone();
                let request_id = request_id.clone();
                let cancel = cancel.clone();
                async move {
                    let adapter = adapters.get_or_build(&provider)?;
                    let adapter_request =
                        to_adapter_request(&request, &provider, &request_id, cancel)?;
                    let response = adapter.handle_chat(adapter_request).await?;
                    Ok(normalize_chat(&request_id, &request.model, response))
                }
            };
            fallback.execute_with_fallback(&model, attempt).await
        };

        self.facade
            .execute_request(
                work,
                ExecuteOptions {
                    priority: CHAT_PRIORITY,
                    cache_key: Some(cache_key),
                    cache_ttl: None,
                    timeout: None,
                },
            )
            .await
    }

    /// Serve a streaming chat completion.
    ///
    /// The queue slot is held only while the stream is acquired; chunks then
    /// flow outside admission control. Streamed responses are never cached.
    pub async fn chat_completion_stream(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<WireChunkStream, GatewayError> {
        self.chat_completion_stream_with_id(request, new_request_id())
            .await
    }

    /// Streaming variant of [`Gateway::chat_completion_with_id`]
    pub async fn chat_completion_stream_with_id(
        &self,
        request: ChatCompletionRequest,
        request_id: impl Into<String>,
    ) -> Result<WireChunkStream, GatewayError> {
        self.chat_completion_stream_with_cancel(request, request_id, None)
            .await
    }

    /// Streaming chat completion carrying an optional cancellation signal.
    ///
    /// A cancelled signal ends the chunk stream at the adapter; chunks
    /// already in flight may still be delivered.
    pub async fn chat_completion_stream_with_cancel(
        &self,
        request: ChatCompletionRequest,
        request_id: impl Into<String>,
        cancel: Option<CancelSignal>,
    ) -> Result<WireChunkStream, GatewayError> {
        Self::validate_chat(&request)?;
        let request_id = request_id.into();
        let public_model = request.model.clone();
        let model = request.model.clone();

        let fallback = Arc::clone(&self.fallback);
        let adapters = Arc::clone(&self.adapters);
        let id_for_chunks = request_id.clone();
        let work = move || async move {
            let attempt = |provider: Provider| {
                let adapters = Arc::clone(&adapters);
                let request = request.clone();
                let request_id = request_id.clone();
                let cancel = cancel.clone();
                async move {
                    let adapter = adapters.get_or_build(&provider)?;
                    let mut adapter_request =
                        to_adapter_request(&request, &provider, &request_id, cancel)?;
                    adapter_request.stream = true;
                    adapter.handle_chat_stream(adapter_request).await
                }
            };
            fallback.execute_with_fallback(&model, attempt).await
        };

        let chunks = self
            .facade
            .queue()
            .submit(work, STREAM_PRIORITY, None)
            .await?;

        let created = unix_now();
        let mut first = true;
        let wire = chunks.map(move |chunk| {
            let chunk = chunk?;
            let role = first.then(|| "assistant".to_string());
            first = false;
            Ok(ChatCompletionChunk {
                id: id_for_chunks.clone(),
                object: "chat.completion.chunk".to_string(),
                created,
                model: public_model.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta: ChunkDelta {
                        role,
                        content: (!chunk.content.is_empty()).then_some(chunk.content),
                    },
                    finish_reason: chunk.finish_reason,
                }],
            })
        });
        Ok(wire.boxed())
    }

    // ------------------------------------------------------------------
    // Embeddings
    // ------------------------------------------------------------------

    /// Serve an embeddings request
    pub async fn embeddings(
        &self,
        request: crate::wire::EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, GatewayError> {
        let model = request.model.clone();
        let texts = request.input.into_texts();
        if texts.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "embeddings input is empty".to_string(),
            ));
        }

        let cache_key = embeddings_cache_key(&model, &texts);
        let request_id = new_request_id();
        let fallback = Arc::clone(&self.fallback);
        let adapters = Arc::clone(&self.adapters);
        let public_model = model.clone();

        let work = move || async move {
            let attempt = |provider: Provider| {
                let adapters = Arc::clone(&adapters);
                let model = public_model.clone();
                let texts = texts.clone();
                let request_id = request_id.clone();
                async move {
                    let mapping = mapping_or_invalid(&provider, &model)?;
                    if !mapping.supports_embeddings {
                        return Err(GatewayError::Unsupported {
                            provider: provider.id.clone(),
                            operation: "embeddings".to_string(),
                        });
                    }
                    let provider_model = mapping.provider_id.clone();
                    let adapter = adapters.get_or_build(&provider)?;
                    let response = adapter
                        .handle_embeddings(crate::adapter::EmbeddingsRequest {
                            request_id,
                            provider_id: provider.id.clone(),
                            model: provider_model,
                            inputs: texts,
                        })
                        .await?;
                    Ok(normalize_embeddings(&model, response))
                }
            };
            fallback.execute_with_fallback(&model, attempt).await
        };

        self.facade
            .execute_request(
                work,
                ExecuteOptions {
                    priority: EMBEDDINGS_PRIORITY,
                    cache_key: Some(cache_key),
                    cache_ttl: None,
                    timeout: None,
                },
            )
            .await
    }

    // ------------------------------------------------------------------
    // Models
    // ------------------------------------------------------------------

    /// List every model served by an enabled provider.
    ///
    /// When several providers serve the same public id, the entry comes
    /// from the preferred (lowest-priority-value) provider.
    pub async fn list_models(&self) -> ModelList {
        let mut providers = self.directory.enabled_providers().await;
        providers.sort_by_key(|p| p.priority.unwrap_or(u32::MAX));

        let created = unix_now();
        let mut seen = std::collections::HashSet::new();
        let mut data = Vec::new();
        for provider in &providers {
            for mapping in &provider.models {
                if seen.insert(mapping.public_id.clone()) {
                    data.push(ModelEntry {
                        id: mapping.public_id.clone(),
                        object: "model".to_string(),
                        created,
                        owned_by: provider.id.clone(),
                        max_tokens: mapping.max_tokens,
                        context_window: mapping.context_window,
                        supports_streaming: mapping.supports_streaming,
                        supports_embeddings: mapping.supports_embeddings,
                    });
                }
            }
        }
        ModelList {
            object: "list".to_string(),
            data,
        }
    }

    // ------------------------------------------------------------------
    // Management surface
    // ------------------------------------------------------------------

    /// Set or replace a model's fallback policy
    pub fn set_fallback(&self, model: impl Into<String>, config: FallbackConfig) {
        self.fallback.set_config(model, config);
    }

    /// Rolling performance statistics
    #[must_use]
    pub fn stats(&self) -> FacadeStats {
        self.facade.stats()
    }

    /// Composite health signal
    #[must_use]
    pub fn health(&self) -> FacadeHealth {
        self.facade.health()
    }

    /// The breaker registry, for operator inspection and overrides
    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// The health monitor, for manual probes
    #[must_use]
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Build every enabled provider's adapter and collect configuration
    /// issues. Providers whose settings cannot even produce an adapter are
    /// reported under a single `settings` issue.
    pub async fn validate_providers(&self) -> Vec<(String, Vec<ConfigIssue>)> {
        let mut report = Vec::new();
        for provider in self.directory.enabled_providers().await {
            match self.adapters.get_or_build(&provider) {
                Ok(adapter) => {
                    let issues = adapter.validate_config();
                    if !issues.is_empty() {
                        report.push((provider.id, issues));
                    }
                }
                Err(e) => report.push((
                    provider.id,
                    vec![ConfigIssue::new("settings", e.to_string())],
                )),
            }
        }
        report
    }

    /// Drop a provider's cached adapter (e.g. after a settings change)
    pub async fn invalidate_adapter(&self, provider_id: &str) {
        debug!(provider = provider_id, "invalidating cached adapter");
        self.adapters.remove(provider_id).await;
    }

    fn validate_chat(request: &ChatCompletionRequest) -> Result<(), GatewayError> {
        if request.model.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("model is required".to_string()));
        }
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Request normalization
// ============================================================================

fn new_request_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

/// Deterministic memoization key over everything that affects the response
fn chat_cache_key(request: &ChatCompletionRequest) -> String {
    let canonical = serde_json::json!([
        request.model,
        request.messages,
        request.max_tokens,
        request.temperature,
        request.top_p,
        request.stop,
    ]);
    format!("chat:{canonical}")
}

fn embeddings_cache_key(model: &str, texts: &[String]) -> String {
    let canonical = serde_json::json!([model, texts]);
    format!("embed:{canonical}")
}

fn mapping_or_invalid<'a>(
    provider: &'a Provider,
    public_model: &str,
) -> Result<&'a ModelMapping, GatewayError> {
    provider.mapping_for(public_model).ok_or_else(|| {
        GatewayError::Internal(format!(
            "provider {} was selected for model {public_model} it does not map",
            provider.id
        ))
    })
}

/// Build the adapter request, translating the public model id and applying
/// the mapping's token ceiling to requests that leave `max_tokens` unset
/// (explicit values are still capped by the ceiling).
fn to_adapter_request(
    request: &ChatCompletionRequest,
    provider: &Provider,
    request_id: &str,
    cancel: Option<CancelSignal>,
) -> Result<AdapterRequest, GatewayError> {
    let mapping = mapping_or_invalid(provider, &request.model)?;
    let max_tokens = match (request.max_tokens, mapping.max_tokens) {
        (Some(requested), Some(ceiling)) => Some(requested.min(ceiling)),
        (Some(requested), None) => Some(requested),
        (None, ceiling) => ceiling,
    };
    Ok(AdapterRequest {
        request_id: request_id.to_string(),
        provider_id: provider.id.clone(),
        model: mapping.provider_id.clone(),
        messages: request.messages.clone(),
        options: GenerationOptions {
            max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop: request.stop.clone(),
        },
        stream: request.stream,
        cancel,
    })
}

fn normalize_chat(
    request_id: &str,
    public_model: &str,
    response: crate::adapter::AdapterResponse,
) -> ChatCompletionResponse {
    let usage = response.usage.unwrap_or_else(|| {
        // Providers without token accounting get a rough 4-chars-per-token
        // estimate so usage is never absent from the wire.
        Usage::new(0, (response.content.len() / 4) as u32)
    });
    ChatCompletionResponse {
        id: request_id.to_string(),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: public_model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::assistant(response.content),
            finish_reason: response.finish_reason.or_else(|| Some("stop".to_string())),
        }],
        usage,
    }
}

fn normalize_embeddings(
    public_model: &str,
    response: crate::adapter::EmbeddingsResponse,
) -> EmbeddingsResponse {
    let data = response
        .vectors
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| EmbeddingEntry {
            object: "embedding".to_string(),
            embedding,
            index: index as u32,
        })
        .collect();
    let usage = response.usage.unwrap_or_default();
    EmbeddingsResponse {
        object: "list".to_string(),
        data,
        model: public_model.to_string(),
        usage: Usage::new(usage.prompt_tokens, 0),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::cancel_pair;
    use crate::provider::{
        AdapterSettings, InMemoryDirectory, ProviderHealth, StaticCredentials,
    };
    use std::collections::HashMap;

    fn echo_provider(id: &str, priority: Option<u32>) -> Provider {
        Provider {
            id: id.to_string(),
            name: id.to_string(),
            settings: AdapterSettings::Sandbox {
                command: "cat".to_string(),
                args: Vec::new(),
                image: None,
                memory_limit_mb: None,
                timeout: None,
                streaming: false,
            },
            credential_ref: None,
            models: vec![ModelMapping {
                public_id: "test-model".to_string(),
                provider_id: "native-model".to_string(),
                max_tokens: Some(256),
                context_window: Some(4_096),
                supports_embeddings: false,
                supports_streaming: true,
            }],
            enabled: true,
            priority,
            health: ProviderHealth::default(),
        }
    }

    fn gateway(providers: Vec<Provider>) -> Gateway {
        let config = GatewayConfig::default();
        Gateway::new(
            &config,
            Arc::new(InMemoryDirectory::new(providers)),
            Arc::new(StaticCredentials::new(HashMap::new())),
        )
    }

    fn chat_request(model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::user("hello")],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            stream: false,
            user: None,
        }
    }

    #[tokio::test]
    async fn test_chat_completion_end_to_end() {
        let gw = gateway(vec![echo_provider("echo", None)]);
        let response = gw.chat_completion(chat_request("test-model")).await.unwrap();

        assert!(response.id.starts_with("chatcmpl-"));
        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.model, "test-model");
        assert_eq!(response.choices.len(), 1);
        // The echo provider reflects the translated request, so the body
        // must reference the provider-native model id.
        assert!(response.choices[0].message.content.contains("native-model"));
    }

    #[tokio::test]
    async fn test_identical_requests_served_from_cache() {
        let gw = gateway(vec![echo_provider("echo", None)]);
        let first = gw.chat_completion(chat_request("test-model")).await.unwrap();
        let second = gw.chat_completion(chat_request("test-model")).await.unwrap();

        // A cache hit replays the memoized response, id included
        assert_eq!(first.id, second.id);
        assert_eq!(gw.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let gw = gateway(vec![echo_provider("echo", None)]);
        let err = gw.chat_completion(chat_request("ghost-model")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotFound(_)));
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn test_empty_messages_rejected() {
        let gw = gateway(vec![echo_provider("echo", None)]);
        let mut request = chat_request("test-model");
        request.messages.clear();
        let err = gw.chat_completion(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_streaming_chunks_carry_stable_id() {
        let gw = gateway(vec![echo_provider("echo", None)]);
        let mut request = chat_request("test-model");
        request.stream = true;

        let mut stream = gw.chat_completion_stream(request).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.id.starts_with("chatcmpl-"));
        assert_eq!(first.object, "chat.completion.chunk");
        assert_eq!(
            first.choices[0].delta.role.as_deref(),
            Some("assistant")
        );
    }

    #[tokio::test]
    async fn test_cancelled_chat_never_reaches_provider() {
        let gw = gateway(vec![echo_provider("echo", None)]);
        let (handle, signal) = cancel_pair();
        handle.cancel();

        // The echo provider would otherwise answer; the only failure path
        // here is the adapter observing the cancelled signal.
        let result = gw
            .chat_completion_with_cancel(chat_request("test-model"), "chatcmpl-c1", Some(signal))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_stream_yields_no_chunks() {
        let mut provider = echo_provider("echo", None);
        if let AdapterSettings::Sandbox { streaming, .. } = &mut provider.settings {
            *streaming = true;
        }
        let gw = gateway(vec![provider]);
        let mut request = chat_request("test-model");
        request.stream = true;

        let (handle, signal) = cancel_pair();
        handle.cancel();
        let mut stream = gw
            .chat_completion_stream_with_cancel(request, "chatcmpl-c2", Some(signal))
            .await
            .unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_embeddings_unsupported_by_mapping() {
        let gw = gateway(vec![echo_provider("echo", None)]);
        let request = crate::wire::EmbeddingsRequest {
            model: "test-model".to_string(),
            input: crate::wire::EmbeddingsInput::Single("vectorize this".to_string()),
            user: None,
        };
        let err = gw.embeddings(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_empty_embeddings_input_rejected() {
        let gw = gateway(vec![echo_provider("echo", None)]);
        let request = crate::wire::EmbeddingsRequest {
            model: "test-model".to_string(),
            input: crate::wire::EmbeddingsInput::Batch(Vec::new()),
            user: None,
        };
        let err = gw.embeddings(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_list_models_dedupes_by_preference() {
        let mut preferred = echo_provider("preferred", Some(1));
        preferred.models[0].max_tokens = Some(512);
        let backup = echo_provider("backup", Some(9));

        let gw = gateway(vec![backup, preferred]);
        let list = gw.list_models().await;

        assert_eq!(list.object, "list");
        assert_eq!(list.data.len(), 1);
        assert_eq!(list.data[0].owned_by, "preferred");
        assert_eq!(list.data[0].max_tokens, Some(512));
    }

    #[test]
    fn test_max_tokens_inheritance() {
        let provider = echo_provider("echo", None);

        // Unset inherits the mapping ceiling
        let inherited =
            to_adapter_request(&chat_request("test-model"), &provider, "id", None).unwrap();
        assert_eq!(inherited.options.max_tokens, Some(256));

        // Explicit values are capped by the ceiling
        let mut request = chat_request("test-model");
        request.max_tokens = Some(10_000);
        let capped = to_adapter_request(&request, &provider, "id", None).unwrap();
        assert_eq!(capped.options.max_tokens, Some(256));

        let mut request = chat_request("test-model");
        request.max_tokens = Some(32);
        let under = to_adapter_request(&request, &provider, "id", None).unwrap();
        assert_eq!(under.options.max_tokens, Some(32));
    }

    #[test]
    fn test_cache_key_is_canonical() {
        let a = chat_cache_key(&chat_request("test-model"));
        let b = chat_cache_key(&chat_request("test-model"));
        assert_eq!(a, b);

        let mut different = chat_request("test-model");
        different.temperature = Some(0.7);
        assert_ne!(a, chat_cache_key(&different));
    }
}
