//! Transparent Proxy Adapter
//!
//! Forwards OpenAI-surface requests to an upstream that already speaks the
//! same wire format, rewriting only headers: `set_headers` are attached to
//! every forwarded request and `strip_headers` names headers that must never
//! be forwarded (they win over `set_headers` on conflict). A resolved
//! credential, when present, is attached as a bearer token.
//!
//! The upstream is not retried; a proxy is transparent, and retry policy
//! belongs to whichever party owns the request. Reachability is checked
//! through a short-TTL cached probe so back-to-back calls against a dead
//! upstream fail fast.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use super::{
    sse_data_events, AdapterChunk, AdapterRequest, AdapterResponse, ChunkStream, ConfigIssue,
    EmbeddingsRequest, EmbeddingsResponse, ProviderAdapter,
};
use crate::error::GatewayError;
use crate::provider::{AdapterSettings, Provider, ProviderType, SharedCredentials};
use crate::routing::pool::PoolManager;
use crate::wire::Usage;

const REACHABILITY_TTL: Duration = Duration::from_secs(5);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Adapter that forwards to an OpenAI-compatible upstream
pub struct ProxyAdapter {
    provider: Provider,
    base_url: String,
    set_headers: HashMap<String, String>,
    strip_headers: Vec<String>,
    timeout: Duration,
    credentials: SharedCredentials,
    pool: Arc<PoolManager>,
    reachability: Mutex<Option<(Instant, bool)>>,
}

impl ProxyAdapter {
    /// Build from a provider record with proxy settings
    pub fn new(
        provider: Provider,
        credentials: SharedCredentials,
        pool: Arc<PoolManager>,
    ) -> Result<Self, GatewayError> {
        let AdapterSettings::Proxy {
            base_url,
            set_headers,
            strip_headers,
            timeout,
        } = provider.settings.clone()
        else {
            return Err(GatewayError::Configuration {
                provider: Some(provider.id),
                message: "proxy provider requires proxy settings".to_string(),
            });
        };

        Ok(Self {
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            set_headers,
            strip_headers: strip_headers
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
            credentials,
            pool,
            reachability: Mutex::new(None),
        })
    }

    fn stripped(&self, name: &str) -> bool {
        self.strip_headers.iter().any(|h| h == &name.to_ascii_lowercase())
    }

    fn forward(
        &self,
        client: &reqwest::Client,
        path: &str,
        body: &serde_json::Value,
        secret: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut builder = client
            .post(format!("{}{path}", self.base_url))
            .timeout(self.timeout)
            .json(body);
        for (name, value) in &self.set_headers {
            if !self.stripped(name) {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if let Some(secret) = secret {
            if !self.stripped("authorization") {
                builder = builder.bearer_auth(secret);
            }
        }
        builder
    }

    async fn ensure_reachable(&self) -> Result<(), GatewayError> {
        if let Some((at, reachable)) = *self.reachability.lock() {
            if at.elapsed() < REACHABILITY_TTL {
                return if reachable {
                    Ok(())
                } else {
                    Err(GatewayError::Connection(format!(
                        "upstream at {} is unreachable (cached probe)",
                        self.base_url
                    )))
                };
            }
        }

        let lease = self.pool.lease(&self.base_url)?;
        let result = lease
            .client()
            .get(format!("{}/v1/models", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        // Any response at all, including auth rejections, proves the
        // upstream is up; only transport failures mark it unreachable.
        match result {
            Ok(resp) if resp.status().as_u16() < 500 => {
                *self.reachability.lock() = Some((Instant::now(), true));
                Ok(())
            }
            Ok(resp) => {
                *self.reachability.lock() = Some((Instant::now(), false));
                Err(GatewayError::Upstream {
                    status: resp.status().as_u16(),
                    message: "upstream health probe failed".to_string(),
                })
            }
            Err(e) => {
                *self.reachability.lock() = Some((Instant::now(), false));
                Err(GatewayError::Connection(format!(
                    "upstream at {} is unreachable: {e}",
                    self.base_url
                )))
            }
        }
    }

    async fn error_from_response(response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(|m| m.as_str().map(String::from))
            })
            .unwrap_or(body);
        match status {
            401 => GatewayError::Auth(message),
            _ => GatewayError::Upstream { status, message },
        }
    }

    fn chat_body(request: &AdapterRequest, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": request.model,
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
}

#[async_trait]
impl ProviderAdapter for ProxyAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Proxy
    }

    async fn handle_chat(&self, request: AdapterRequest) -> Result<AdapterResponse, GatewayError> {
        self.ensure_reachable().await?;
        let lease = self.pool.lease(&self.base_url)?;
        let secret = self.credentials.resolve(&self.provider).await?;
        let body = Self::chat_body(&request, false);

        let response = self
            .forward(lease.client(), "/v1/chat/completions", &body, secret.as_deref())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let data: serde_json::Value = response.json().await?;
        Ok(AdapterResponse {
            content: data
                .pointer("/choices/0/message/content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string(),
            model: data
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or(&request.model)
                .to_string(),
            finish_reason: data
                .pointer("/choices/0/finish_reason")
                .and_then(|f| f.as_str())
                .map(String::from),
            usage: data
                .get("usage")
                .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok()),
        })
    }

    async fn handle_chat_stream(
        &self,
        request: AdapterRequest,
    ) -> Result<ChunkStream, GatewayError> {
        self.ensure_reachable().await?;
        let lease = self.pool.lease(&self.base_url)?;
        let secret = self.credentials.resolve(&self.provider).await?;
        let body = Self::chat_body(&request, true);
        let cancel = request.cancel.clone();

        let response = self
            .forward(lease.client(), "/v1/chat/completions", &body, secret.as_deref())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let chunks = sse_data_events(response)
            .map(|event| {
                let payload = event?;
                let data: serde_json::Value =
                    serde_json::from_str(&payload).map_err(|e| GatewayError::Upstream {
                        status: 502,
                        message: format!("malformed stream payload: {e}"),
                    })?;
                Ok(AdapterChunk {
                    content: data
                        .pointer("/choices/0/delta/content")
                        .and_then(|c| c.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    finish_reason: data
                        .pointer("/choices/0/finish_reason")
                        .and_then(|f| f.as_str())
                        .map(String::from),
                })
            })
            .take_while(move |_chunk: &Result<AdapterChunk, GatewayError>| {
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
        let secret = self.credentials.resolve(&self.provider).await?;
        let body = json!({ "model": request.model, "input": request.inputs });

        let response = self
            .forward(lease.client(), "/v1/embeddings", &body, secret.as_deref())
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
        Ok(EmbeddingsResponse {
            vectors,
            usage: data
                .get("usage")
                .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok()),
        })
    }

    async fn test_connection(&self) -> Result<(), GatewayError> {
        *self.reachability.lock() = None;
        self.ensure_reachable().await
    }

    async fn get_models(&self) -> Result<Vec<String>, GatewayError> {
        self.ensure_reachable().await?;
        let lease = self.pool.lease(&self.base_url)?;
        let secret = self.credentials.resolve(&self.provider).await?;

        let mut builder = lease
            .client()
            .get(format!("{}/v1/models", self.base_url))
            .timeout(Duration::from_secs(10));
        if let Some(secret) = &secret {
            if !self.stripped("authorization") {
                builder = builder.bearer_auth(secret);
            }
        }
        let response = builder.send().await?;
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
        for name in self.set_headers.keys() {
            if self.stripped(name) {
                issues.push(ConfigIssue::new(
                    "set_headers",
                    format!("header '{name}' is both set and stripped"),
                ));
            }
        }
        issues
    }

    async fn cleanup(&self) {
        *self.reachability.lock() = None;
        debug!(provider = %self.provider.id, "proxy adapter cleaned up");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderHealth, StaticCredentials};
    use crate::routing::pool::PoolConfig;

    fn proxy(
        set_headers: HashMap<String, String>,
        strip_headers: Vec<String>,
    ) -> ProxyAdapter {
        ProxyAdapter::new(
            Provider {
                id: "px".to_string(),
                name: "px".to_string(),
                settings: AdapterSettings::Proxy {
                    base_url: "https://upstream.example.com/".to_string(),
                    set_headers,
                    strip_headers,
                    timeout: None,
                },
                credential_ref: None,
                models: Vec::new(),
                enabled: true,
                priority: None,
                health: ProviderHealth::default(),
            },
            Arc::new(StaticCredentials::new(HashMap::new())),
            Arc::new(PoolManager::new(PoolConfig::default())),
        )
        .unwrap()
    }

    #[test]
    fn test_strip_is_case_insensitive() {
        let p = proxy(HashMap::new(), vec!["X-Forwarded-For".to_string()]);
        assert!(p.stripped("x-forwarded-for"));
        assert!(p.stripped("X-FORWARDED-FOR"));
        assert!(!p.stripped("x-request-id"));
    }

    #[test]
    fn test_conflicting_headers_flagged() {
        let mut set = HashMap::new();
        set.insert("x-team".to_string(), "routing".to_string());
        let p = proxy(set, vec!["x-team".to_string()]);
        let issues = p.validate_config();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].to_string().contains("x-team"));
    }

    #[test]
    fn test_valid_config() {
        assert!(proxy(HashMap::new(), Vec::new()).validate_config().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_cached() {
        let p = ProxyAdapter::new(
            Provider {
                id: "px".to_string(),
                name: "px".to_string(),
                settings: AdapterSettings::Proxy {
                    base_url: "http://127.0.0.1:9".to_string(),
                    set_headers: HashMap::new(),
                    strip_headers: Vec::new(),
                    timeout: None,
                },
                credential_ref: None,
                models: Vec::new(),
                enabled: true,
                priority: None,
                health: ProviderHealth::default(),
            },
            Arc::new(StaticCredentials::new(HashMap::new())),
            Arc::new(PoolManager::new(PoolConfig::default())),
        )
        .unwrap();

        assert!(p.test_connection().await.is_err());
        let err = p.ensure_reachable().await.unwrap_err();
        assert!(err.to_string().contains("cached probe"));
    }
}
