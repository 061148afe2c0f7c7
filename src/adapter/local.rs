//! Local Inference Daemon Adapter
//!
//! Targets a local inference server. Two service families are supported:
//! the Ollama NDJSON API (`/api/chat`, `/api/tags`, `/api/embeddings`) and
//! generic OpenAI-compatible local servers. The family is autodetected from
//! configuration when not set explicitly, bare model names are rewritten to
//! the daemon's tag convention, and every call is gated behind a short-TTL
//! cached reachability probe with bounded retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use super::{
    ndjson_lines, sse_data_events, AdapterChunk, AdapterRequest, AdapterResponse, ChunkStream,
    ConfigIssue, EmbeddingsRequest, EmbeddingsResponse, ProviderAdapter,
};
use crate::error::GatewayError;
use crate::provider::{AdapterSettings, DaemonFamily, Provider, ProviderType};
use crate::routing::pool::PoolManager;
use crate::wire::Usage;

// Reachability probe cache TTL and retry bound
const REACHABILITY_TTL: Duration = Duration::from_secs(5);
const PROBE_ATTEMPTS: u32 = 2;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Adapter for Ollama-style and generic local inference daemons
pub struct LocalDaemonAdapter {
    provider_id: String,
    base_url: String,
    family: DaemonFamily,
    default_tag: String,
    timeout: Duration,
    pool: Arc<PoolManager>,
    // (checked_at, reachable) probe cache
    reachability: Mutex<Option<(Instant, bool)>>,
}

impl LocalDaemonAdapter {
    /// Build from a provider record with local-daemon settings
    pub fn new(provider: Provider, pool: Arc<PoolManager>) -> Result<Self, GatewayError> {
        let AdapterSettings::Local {
            base_url,
            family,
            default_tag,
            timeout,
        } = provider.settings
        else {
            return Err(GatewayError::Configuration {
                provider: Some(provider.id),
                message: "local-daemon provider requires local settings".to_string(),
            });
        };

        let base_url = base_url.trim_end_matches('/').to_string();
        let family = family.unwrap_or_else(|| Self::detect_family(&base_url));
        Ok(Self {
            provider_id: provider.id,
            base_url,
            family,
            default_tag: default_tag.unwrap_or_else(|| "latest".to_string()),
            timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
            pool,
            reachability: Mutex::new(None),
        })
    }

    /// Guess the service family from the configured URL. Port 11434 is the
    /// Ollama convention; anything else is assumed OpenAI-compatible.
    fn detect_family(base_url: &str) -> DaemonFamily {
        if base_url.contains(":11434") {
            DaemonFamily::Ollama
        } else {
            DaemonFamily::OpenAiCompatible
        }
    }

    /// Rewrite a bare model name to the daemon's tag convention
    fn rewrite_model(&self, model: &str) -> String {
        match self.family {
            DaemonFamily::Ollama if !model.contains(':') => {
                format!("{model}:{}", self.default_tag)
            }
            _ => model.to_string(),
        }
    }

    fn probe_url(&self) -> String {
        match self.family {
            DaemonFamily::Ollama => format!("{}/api/tags", self.base_url),
            DaemonFamily::OpenAiCompatible => format!("{}/v1/models", self.base_url),
        }
    }

    /// Probe the daemon, caching the result for a short window. Any HTTP
    /// status below 500 counts as reachable.
    async fn ensure_reachable(&self) -> Result<(), GatewayError> {
        if let Some((at, reachable)) = *self.reachability.lock() {
            if at.elapsed() < REACHABILITY_TTL {
                return if reachable {
                    Ok(())
                } else {
                    Err(GatewayError::Connection(format!(
                        "daemon at {} is unreachable (cached probe)",
                        self.base_url
                    )))
                };
            }
        }

        let lease = self.pool.lease(&self.base_url)?;
        let mut last_err = String::new();
        for attempt in 0..PROBE_ATTEMPTS {
            match lease
                .client()
                .get(self.probe_url())
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                Ok(resp) if resp.status().as_u16() < 500 => {
                    *self.reachability.lock() = Some((Instant::now(), true));
                    return Ok(());
                }
                Ok(resp) => last_err = format!("daemon returned {}", resp.status()),
                Err(e) => last_err = e.to_string(),
            }
            if attempt + 1 < PROBE_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }

        *self.reachability.lock() = Some((Instant::now(), false));
        Err(GatewayError::Connection(format!(
            "daemon at {} is unreachable: {last_err}",
            self.base_url
        )))
    }

    fn ollama_options(request: &AdapterRequest) -> serde_json::Value {
        let mut options = serde_json::Map::new();
        if let Some(max_tokens) = request.options.max_tokens {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = request.options.temperature {
            options.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.options.top_p {
            options.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(stop) = &request.options.stop {
            options.insert("stop".to_string(), json!(stop));
        }
        serde_json::Value::Object(options)
    }

    fn openai_body(&self, request: &AdapterRequest, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": self.rewrite_model(&request.model),
            "messages": request.messages,
            "stream": stream,
        });
        if let Some(max_tokens) = request.options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.options.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.options.stop {
            body["stop"] = json!(stop);
        }
        body
    }

    async fn error_from_response(response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .or_else(|| v.get("error"))
                    .and_then(|m| m.as_str().map(String::from))
            })
            .unwrap_or(body);
        match status {
            401 => GatewayError::Auth(message),
            _ => GatewayError::Upstream { status, message },
        }
    }
}

#[async_trait]
impl ProviderAdapter for LocalDaemonAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::LocalDaemon
    }

    async fn handle_chat(&self, request: AdapterRequest) -> Result<AdapterResponse, GatewayError> {
        self.ensure_reachable().await?;
        let lease = self.pool.lease(&self.base_url)?;
        let model = self.rewrite_model(&request.model);

        match self.family {
            DaemonFamily::Ollama => {
                let body = json!({
                    "model": model,
                    "messages": request.messages,
                    "stream": false,
                    "options": Self::ollama_options(&request),
                });
                let response = lease
                    .client()
                    .post(format!("{}/api/chat", self.base_url))
                    .timeout(self.timeout)
                    .json(&body)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(Self::error_from_response(response).await);
                }
                let data: serde_json::Value = response.json().await?;
                let content = data
                    .pointer("/message/content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
                let usage = match (
                    data.get("prompt_eval_count").and_then(serde_json::Value::as_u64),
                    data.get("eval_count").and_then(serde_json::Value::as_u64),
                ) {
                    (Some(p), Some(c)) => Some(Usage::new(p as u32, c as u32)),
                    _ => None,
                };
                Ok(AdapterResponse {
                    content,
                    model,
                    finish_reason: Some("stop".to_string()),
                    usage,
                })
            }
            DaemonFamily::OpenAiCompatible => {
                let body = self.openai_body(&request, false);
                let response = lease
                    .client()
                    .post(format!("{}/v1/chat/completions", self.base_url))
                    .timeout(self.timeout)
                    .json(&body)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(Self::error_from_response(response).await);
                }
                let data: serde_json::Value = response.json().await?;
                let content = data
                    .pointer("/choices/0/message/content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
                let finish_reason = data
                    .pointer("/choices/0/finish_reason")
                    .and_then(|f| f.as_str())
                    .map(String::from);
                let usage = data
                    .get("usage")
                    .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());
                Ok(AdapterResponse {
                    content,
                    model,
                    finish_reason,
                    usage,
                })
            }
        }
    }

    async fn handle_chat_stream(
        &self,
        request: AdapterRequest,
    ) -> Result<ChunkStream, GatewayError> {
        self.ensure_reachable().await?;
        let lease = self.pool.lease(&self.base_url)?;
        let model = self.rewrite_model(&request.model);
        let cancel = request.cancel.clone();

        let lines = match self.family {
            DaemonFamily::Ollama => {
                let body = json!({
                    "model": model,
                    "messages": request.messages,
                    "stream": true,
                    "options": Self::ollama_options(&request),
                });
                let response = lease
                    .client()
                    .post(format!("{}/api/chat", self.base_url))
                    .timeout(self.timeout)
                    .json(&body)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(Self::error_from_response(response).await);
                }
                ndjson_lines(response)
            }
            DaemonFamily::OpenAiCompatible => {
                let body = self.openai_body(&request, true);
                let response = lease
                    .client()
                    .post(format!("{}/v1/chat/completions", self.base_url))
                    .timeout(self.timeout)
                    .json(&body)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(Self::error_from_response(response).await);
                }
                sse_data_events(response)
            }
        };

        let family = self.family;
        let chunks = lines
            .map(move |line| {
                let payload = line?;
                let data: serde_json::Value = serde_json::from_str(&payload)
                    .map_err(|e| GatewayError::Upstream {
                        status: 502,
                        message: format!("malformed stream payload: {e}"),
                    })?;
                let chunk = match family {
                    DaemonFamily::Ollama => {
                        let done = data
                            .get("done")
                            .and_then(serde_json::Value::as_bool)
                            .unwrap_or(false);
                        AdapterChunk {
                            content: data
                                .pointer("/message/content")
                                .and_then(|c| c.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            finish_reason: done.then(|| "stop".to_string()),
                        }
                    }
                    DaemonFamily::OpenAiCompatible => AdapterChunk {
                        content: data
                            .pointer("/choices/0/delta/content")
                            .and_then(|c| c.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        finish_reason: data
                            .pointer("/choices/0/finish_reason")
                            .and_then(|f| f.as_str())
                            .map(String::from),
                    },
                };
                Ok(chunk)
            })
            .take_while(move |_chunk: &Result<AdapterChunk, GatewayError>| {
                // A cancelled caller ends the stream at the next chunk
                // boundary instead of erroring.
                let cancelled = cancel.as_ref().is_some_and(super::CancelSignal::is_cancelled);
                futures::future::ready(!cancelled)
            });

        Ok(chunks.boxed())
    }

    async fn handle_embeddings(
        &self,
        request: EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, GatewayError> {
        self.ensure_reachable().await?;
        let lease = self.pool.lease(&self.base_url)?;
        let model = self.rewrite_model(&request.model);

        match self.family {
            DaemonFamily::Ollama => {
                // The Ollama embeddings endpoint takes one prompt per call
                let mut vectors = Vec::with_capacity(request.inputs.len());
                for input in &request.inputs {
                    let response = lease
                        .client()
                        .post(format!("{}/api/embeddings", self.base_url))
                        .timeout(self.timeout)
                        .json(&json!({ "model": model, "prompt": input }))
                        .send()
                        .await?;
                    if !response.status().is_success() {
                        return Err(Self::error_from_response(response).await);
                    }
                    let data: serde_json::Value = response.json().await?;
                    let vector = data
                        .get("embedding")
                        .and_then(|e| serde_json::from_value::<Vec<f64>>(e.clone()).ok())
                        .ok_or_else(|| GatewayError::Upstream {
                            status: 502,
                            message: "embeddings response missing vector".to_string(),
                        })?;
                    vectors.push(vector);
                }
                Ok(EmbeddingsResponse {
                    vectors,
                    usage: None,
                })
            }
            DaemonFamily::OpenAiCompatible => {
                let response = lease
                    .client()
                    .post(format!("{}/v1/embeddings", self.base_url))
                    .timeout(self.timeout)
                    .json(&json!({ "model": model, "input": request.inputs }))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(Self::error_from_response(response).await);
                }
                let data: serde_json::Value = response.json().await?;
                let vectors = data
                    .get("data")
                    .and_then(|d| d.as_array())
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|e| {
                                e.get("embedding")
                                    .and_then(|v| serde_json::from_value::<Vec<f64>>(v.clone()).ok())
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                let usage = data
                    .get("usage")
                    .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());
                Ok(EmbeddingsResponse { vectors, usage })
            }
        }
    }

    async fn test_connection(&self) -> Result<(), GatewayError> {
        // Bypass the probe cache so operator checks see the live state
        *self.reachability.lock() = None;
        self.ensure_reachable().await
    }

    async fn get_models(&self) -> Result<Vec<String>, GatewayError> {
        self.ensure_reachable().await?;
        let lease = self.pool.lease(&self.base_url)?;

        match self.family {
            DaemonFamily::Ollama => {
                let response = lease
                    .client()
                    .get(format!("{}/api/tags", self.base_url))
                    .timeout(Duration::from_secs(10))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(Self::error_from_response(response).await);
                }
                let data: serde_json::Value = response.json().await?;
                Ok(data
                    .get("models")
                    .and_then(|m| m.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default())
            }
            DaemonFamily::OpenAiCompatible => {
                let response = lease
                    .client()
                    .get(format!("{}/v1/models", self.base_url))
                    .timeout(Duration::from_secs(10))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(Self::error_from_response(response).await);
                }
                let data: serde_json::Value = response.json().await?;
                Ok(data
                    .get("data")
                    .and_then(|d| d.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|m| m.get("id").and_then(|i| i.as_str()))
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default())
            }
        }
    }

    fn validate_config(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        match self.base_url.parse::<reqwest::Url>() {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => issues.push(ConfigIssue::new(
                "base_url",
                format!("unsupported scheme '{}'", url.scheme()),
            )),
            Err(e) => issues.push(ConfigIssue::new("base_url", format!("not a valid URL: {e}"))),
        }
        issues
    }

    async fn cleanup(&self) {
        *self.reachability.lock() = None;
        debug!(provider = %self.provider_id, "local daemon adapter cleaned up");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderHealth;
    use crate::routing::pool::PoolConfig;

    fn local_provider(base_url: &str, family: Option<DaemonFamily>) -> Provider {
        Provider {
            id: "local".to_string(),
            name: "local".to_string(),
            settings: AdapterSettings::Local {
                base_url: base_url.to_string(),
                family,
                default_tag: None,
                timeout: None,
            },
            credential_ref: None,
            models: Vec::new(),
            enabled: true,
            priority: None,
            health: ProviderHealth::default(),
        }
    }

    fn adapter(base_url: &str, family: Option<DaemonFamily>) -> LocalDaemonAdapter {
        LocalDaemonAdapter::new(
            local_provider(base_url, family),
            Arc::new(PoolManager::new(PoolConfig::default())),
        )
        .unwrap()
    }

    #[test]
    fn test_family_autodetection() {
        let a = adapter("http://localhost:11434", None);
        assert_eq!(a.family, DaemonFamily::Ollama);

        let a = adapter("http://localhost:8080", None);
        assert_eq!(a.family, DaemonFamily::OpenAiCompatible);

        // Explicit family wins over autodetection
        let a = adapter("http://localhost:8080", Some(DaemonFamily::Ollama));
        assert_eq!(a.family, DaemonFamily::Ollama);
    }

    #[test]
    fn test_bare_model_tag_rewrite() {
        let a = adapter("http://localhost:11434", None);
        assert_eq!(a.rewrite_model("llama3"), "llama3:latest");
        assert_eq!(a.rewrite_model("llama3:8b"), "llama3:8b");

        // OpenAI-compatible daemons get the name untouched
        let a = adapter("http://localhost:8080", None);
        assert_eq!(a.rewrite_model("llama3"), "llama3");
    }

    #[test]
    fn test_validate_config() {
        assert!(adapter("http://localhost:11434", None)
            .validate_config()
            .is_empty());
        assert_eq!(adapter("ftp://nope", None).validate_config().len(), 1);
        assert_eq!(adapter("not a url", None).validate_config().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_connection_error() {
        // Port 9 (discard) refuses connections on loopback
        let a = adapter("http://127.0.0.1:9", Some(DaemonFamily::Ollama));
        let err = a.test_connection().await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection(_)));

        // A second check inside the TTL hits the cached probe
        let err = a.ensure_reachable().await.unwrap_err();
        assert!(err.to_string().contains("cached probe"));
    }
}
