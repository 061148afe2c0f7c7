//! HTTP SDK Adapter
//!
//! Talks to a remote OpenAI-style HTTP API. Credentials are resolved through
//! the credential resolver at call time and attached per the provider's auth
//! style. Transient transport failures (network errors, timeouts, 429 and
//! 5xx statuses) are retried with capped exponential backoff and jitter;
//! other client errors surface immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    sse_data_events, AdapterChunk, AdapterRequest, AdapterResponse, ChunkStream, ConfigIssue,
    EmbeddingsRequest, EmbeddingsResponse, ProviderAdapter,
};
use crate::error::GatewayError;
use crate::provider::{AdapterSettings, AuthStyle, Provider, ProviderType, SharedCredentials};
use crate::routing::pool::PoolManager;
use crate::wire::Usage;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Retry Policy
// ============================================================================

/// Backoff schedule for transient transport failures
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// First backoff delay, in milliseconds
    pub initial_backoff_ms: u64,
    /// Growth factor per attempt
    pub backoff_multiplier: f64,
    /// Backoff ceiling, in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), with up to 25% jitter
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);
        let jitter = rand::random::<f64>() * 0.25;
        Duration::from_millis((capped * (1.0 + jitter)) as u64)
    }
}

// ============================================================================
// HTTP Adapter
// ============================================================================

/// Adapter for remote OpenAI-compatible HTTP APIs
pub struct HttpAdapter {
    provider: Provider,
    base_url: String,
    auth: AuthStyle,
    extra_headers: HashMap<String, String>,
    timeout: Duration,
    health_path: String,
    retry: RetryPolicy,
    credentials: SharedCredentials,
    pool: Arc<PoolManager>,
}

impl HttpAdapter {
    /// Build from a provider record with HTTP settings
    pub fn new(
        provider: Provider,
        credentials: SharedCredentials,
        pool: Arc<PoolManager>,
    ) -> Result<Self, GatewayError> {
        let AdapterSettings::Http {
            base_url,
            auth,
            headers,
            timeout,
            health_path,
        } = provider.settings.clone()
        else {
            return Err(GatewayError::Configuration {
                provider: Some(provider.id),
                message: "http-sdk provider requires http settings".to_string(),
            });
        };

        Ok(Self {
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            extra_headers: headers,
            timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
            health_path: health_path.unwrap_or_else(|| "/v1/models".to_string()),
            retry: RetryPolicy::default(),
            credentials,
            pool,
        })
    }

    fn apply_auth(
        &self,
        builder: reqwest::RequestBuilder,
        secret: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let Some(secret) = secret else {
            return builder;
        };
        match &self.auth {
            AuthStyle::Bearer => builder.bearer_auth(secret),
            AuthStyle::ApiKey => builder.header("x-api-key", secret),
            AuthStyle::CustomHeader(name) => builder.header(name.as_str(), secret),
            AuthStyle::None => builder,
        }
    }

    fn build_post(
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
        for (name, value) in &self.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        self.apply_auth(builder, secret)
    }

    /// Send a request, retrying transient transport failures with backoff.
    /// The builder is recreated per attempt via `make`.
    async fn send_with_retry<F>(&self, make: F) -> Result<reqwest::Response, GatewayError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let result: Result<reqwest::Response, GatewayError> = async {
                let response = make().send().await?;
                let status = response.status().as_u16();
                if status == 429 || status >= 500 {
                    return Err(Self::error_from_response(response).await);
                }
                Ok(response)
            }
            .await;

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable_transport() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff_for_attempt(attempt);
                    debug!(
                        provider = %self.provider.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
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

    async fn secret(&self) -> Result<Option<String>, GatewayError> {
        self.credentials.resolve(&self.provider).await
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
impl ProviderAdapter for HttpAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::HttpSdk
    }

    async fn handle_chat(&self, request: AdapterRequest) -> Result<AdapterResponse, GatewayError> {
        let lease = self.pool.lease(&self.base_url)?;
        let secret = self.secret().await?;
        let body = Self::chat_body(&request, false);

        let response = self
            .send_with_retry(|| {
                self.build_post(lease.client(), "/v1/chat/completions", &body, secret.as_deref())
            })
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
        Ok(AdapterResponse {
            content,
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
        let lease = self.pool.lease(&self.base_url)?;
        let secret = self.secret().await?;
        let body = Self::chat_body(&request, true);
        let cancel = request.cancel.clone();

        let response = self
            .send_with_retry(|| {
                self.build_post(lease.client(), "/v1/chat/completions", &body, secret.as_deref())
            })
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
        let lease = self.pool.lease(&self.base_url)?;
        let secret = self.secret().await?;
        let body = json!({ "model": request.model, "input": request.inputs });

        let response = self
            .send_with_retry(|| {
                self.build_post(lease.client(), "/v1/embeddings", &body, secret.as_deref())
            })
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
        let lease = self.pool.lease(&self.base_url)?;
        let secret = self.secret().await?;

        let mut builder = lease
            .client()
            .get(format!("{}{}", self.base_url, self.health_path))
            .timeout(Duration::from_secs(10));
        for (name, value) in &self.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = self.apply_auth(builder, secret.as_deref()).send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            warn!(provider = %self.provider.id, %status, "health probe rejected credential");
            Err(Self::error_from_response(response).await)
        } else {
            Err(Self::error_from_response(response).await)
        }
    }

    async fn get_models(&self) -> Result<Vec<String>, GatewayError> {
        let lease = self.pool.lease(&self.base_url)?;
        let secret = self.secret().await?;

        let builder = lease
            .client()
            .get(format!("{}/v1/models", self.base_url))
            .timeout(Duration::from_secs(10));
        let response = self.apply_auth(builder, secret.as_deref()).send().await?;
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
        if !self.health_path.starts_with('/') {
            issues.push(ConfigIssue::new(
                "health_path",
                "health path must start with '/'",
            ));
        }
        if matches!(self.auth, AuthStyle::CustomHeader(ref name) if name.trim().is_empty()) {
            issues.push(ConfigIssue::new("auth", "custom header name is empty"));
        }
        if self.provider.credential_ref.is_none() && self.auth != AuthStyle::None {
            issues.push(ConfigIssue::new(
                "credential_ref",
                "auth style requires a credential reference",
            ));
        }
        issues
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

    fn http_provider(auth: AuthStyle, credential_ref: Option<&str>) -> Provider {
        Provider {
            id: "api".to_string(),
            name: "api".to_string(),
            settings: AdapterSettings::Http {
                base_url: "https://api.example.com/".to_string(),
                auth,
                headers: HashMap::new(),
                timeout: None,
                health_path: None,
            },
            credential_ref: credential_ref.map(String::from),
            models: Vec::new(),
            enabled: true,
            priority: None,
            health: ProviderHealth::default(),
        }
    }

    fn adapter(auth: AuthStyle, credential_ref: Option<&str>) -> HttpAdapter {
        let mut secrets = HashMap::new();
        secrets.insert("api-key".to_string(), "s3cret".to_string());
        HttpAdapter::new(
            http_provider(auth, credential_ref),
            Arc::new(StaticCredentials::new(secrets)),
            Arc::new(PoolManager::new(PoolConfig::default())),
        )
        .unwrap()
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let a = adapter(AuthStyle::Bearer, Some("api-key"));
        assert_eq!(a.base_url, "https://api.example.com");
        assert_eq!(a.health_path, "/v1/models");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 400,
        };
        // Jitter adds at most 25%
        let b0 = policy.backoff_for_attempt(0).as_millis();
        assert!((100..=125).contains(&b0));
        let b1 = policy.backoff_for_attempt(1).as_millis();
        assert!((200..=250).contains(&b1));
        // Capped at 400 before jitter
        let b4 = policy.backoff_for_attempt(4).as_millis();
        assert!((400..=500).contains(&b4));
    }

    #[test]
    fn test_validate_config() {
        assert!(adapter(AuthStyle::Bearer, Some("api-key"))
            .validate_config()
            .is_empty());

        // Auth without a credential reference is flagged
        let issues = adapter(AuthStyle::Bearer, None).validate_config();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].to_string().contains("credential_ref"));

        // Anonymous access needs no credential
        assert!(adapter(AuthStyle::None, None).validate_config().is_empty());

        let issues = adapter(AuthStyle::CustomHeader(String::new()), Some("api-key"))
            .validate_config();
        assert_eq!(issues.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_credential_is_configuration_error() {
        let a = adapter(AuthStyle::Bearer, Some("nonexistent-ref"));
        let err = a.secret().await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }

    #[test]
    fn test_chat_body_includes_options() {
        let request = AdapterRequest {
            request_id: "r".to_string(),
            provider_id: "api".to_string(),
            model: "gpt-4".to_string(),
            messages: vec![crate::wire::ChatMessage::user("hi")],
            options: crate::adapter::GenerationOptions {
                max_tokens: Some(64),
                temperature: Some(0.2),
                top_p: None,
                stop: None,
            },
            stream: false,
            cancel: None,
        };
        let body = HttpAdapter::chat_body(&request, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 64);
        assert!(body.get("top_p").is_none());
    }
}
