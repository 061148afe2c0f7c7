//! Sandboxed Subprocess Adapter
//!
//! Runs inference through a short-lived subprocess, typically a CLI wrapped
//! in a container or seccomp sandbox. The request is written to the child's
//! stdin as one JSON document; the reply is read from stdout and parsed as
//! JSON when possible, falling back to treating the raw text as the
//! completion. Each request is its own process with `kill_on_drop`, so an
//! abandoned call cannot leak a child.
//!
//! Connection testing for this adapter is configuration validation only: no
//! process is spawned, because launching arbitrary commands on a probe
//! timer is not acceptable.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    AdapterChunk, AdapterRequest, AdapterResponse, ChunkStream, ConfigIssue, ProviderAdapter,
};
use crate::error::GatewayError;
use crate::provider::{AdapterSettings, Provider, ProviderType};
use crate::wire::Usage;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Adapter that shells out to a sandboxed model CLI per request
pub struct SandboxAdapter {
    provider_id: String,
    command: String,
    args: Vec<String>,
    image: Option<String>,
    memory_limit_mb: Option<u64>,
    timeout: Duration,
    streaming: bool,
}

impl SandboxAdapter {
    /// Build from a provider record with sandbox settings
    pub fn new(provider: Provider) -> Result<Self, GatewayError> {
        let AdapterSettings::Sandbox {
            command,
            args,
            image,
            memory_limit_mb,
            timeout,
            streaming,
        } = provider.settings
        else {
            return Err(GatewayError::Configuration {
                provider: Some(provider.id),
                message: "sandboxed-subprocess provider requires sandbox settings".to_string(),
            });
        };

        Ok(Self {
            provider_id: provider.id,
            command,
            args,
            image,
            memory_limit_mb,
            timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
            streaming,
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(image) = &self.image {
            cmd.env("SANDBOX_IMAGE", image);
        }
        if let Some(limit) = self.memory_limit_mb {
            cmd.env("SANDBOX_MEMORY_LIMIT_MB", limit.to_string());
        }
        cmd
    }

    fn request_payload(request: &AdapterRequest) -> serde_json::Value {
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages,
        });
        if let Some(max_tokens) = request.options.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.options.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.options.top_p {
            payload["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.options.stop {
            payload["stop"] = json!(stop);
        }
        payload
    }

    /// Parse a child's stdout. JSON replies may carry `content`, an
    /// OpenAI-shaped `choices` array, and token counts; anything that
    /// fails to parse is taken as plain-text output.
    fn parse_output(stdout: &str, model: &str) -> AdapterResponse {
        if let Ok(data) = serde_json::from_str::<serde_json::Value>(stdout.trim()) {
            let content = data
                .get("content")
                .and_then(|c| c.as_str())
                .or_else(|| data.pointer("/choices/0/message/content").and_then(|c| c.as_str()))
                .map(String::from);
            if let Some(content) = content {
                let usage = match (
                    data.get("prompt_tokens").and_then(serde_json::Value::as_u64),
                    data.get("completion_tokens").and_then(serde_json::Value::as_u64),
                ) {
                    (Some(p), Some(c)) => Some(Usage::new(p as u32, c as u32)),
                    _ => data
                        .get("usage")
                        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok()),
                };
                return AdapterResponse {
                    content,
                    model: model.to_string(),
                    finish_reason: data
                        .get("finish_reason")
                        .and_then(|f| f.as_str())
                        .map(String::from)
                        .or_else(|| Some("stop".to_string())),
                    usage,
                };
            }
        }
        AdapterResponse {
            content: stdout.trim_end().to_string(),
            model: model.to_string(),
            finish_reason: Some("stop".to_string()),
            usage: None,
        }
    }

    async fn run_once(&self, request: &AdapterRequest) -> Result<String, GatewayError> {
        let mut child = self.command().spawn().map_err(|e| GatewayError::Connection(
            format!("failed to spawn '{}': {e}", self.command),
        ))?;

        let payload = serde_json::to_vec(&Self::request_payload(request)).map_err(|e| {
            GatewayError::Internal(format!("request serialization failed: {e}"))
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.map_err(|e| {
                GatewayError::Connection(format!("failed to write to subprocess: {e}"))
            })?;
            // Dropping stdin closes the pipe and lets the child finish
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| GatewayError::Timeout {
                operation: format!("subprocess chat ({})", self.provider_id),
            })?
            .map_err(|e| GatewayError::Connection(format!("subprocess wait failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GatewayError::Upstream {
                status: 502,
                message: format!(
                    "subprocess exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ProviderAdapter for SandboxAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::SandboxedSubprocess
    }

    async fn handle_chat(&self, request: AdapterRequest) -> Result<AdapterResponse, GatewayError> {
        if self.command.trim().is_empty() {
            return Err(GatewayError::Configuration {
                provider: Some(self.provider_id.clone()),
                message: "sandbox command is empty".to_string(),
            });
        }
        if let Some(cancel) = &request.cancel {
            if cancel.is_cancelled() {
                return Err(GatewayError::Connection("request cancelled".to_string()));
            }
        }
        let stdout = self.run_once(&request).await?;
        Ok(Self::parse_output(&stdout, &request.model))
    }

    async fn handle_chat_stream(
        &self,
        request: AdapterRequest,
    ) -> Result<ChunkStream, GatewayError> {
        if !self.streaming {
            // Provider opted out; buffer the full reply into one chunk
            let response = self.handle_chat(request).await?;
            let chunk = AdapterChunk {
                content: response.content,
                finish_reason: response.finish_reason.or_else(|| Some("stop".to_string())),
            };
            return Ok(futures::stream::iter(vec![Ok(chunk)]).boxed());
        }

        if self.command.trim().is_empty() {
            return Err(GatewayError::Configuration {
                provider: Some(self.provider_id.clone()),
                message: "sandbox command is empty".to_string(),
            });
        }

        let mut child = self.command().spawn().map_err(|e| GatewayError::Connection(
            format!("failed to spawn '{}': {e}", self.command),
        ))?;
        let payload = serde_json::to_vec(&Self::request_payload(&request)).map_err(|e| {
            GatewayError::Internal(format!("request serialization failed: {e}"))
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.map_err(|e| {
                GatewayError::Connection(format!("failed to write to subprocess: {e}"))
            })?;
        }
        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayError::Internal("subprocess stdout was not captured".to_string())
        })?;

        let provider_id = self.provider_id.clone();
        let cancel = request.cancel.clone();
        let (tx, rx) = futures::channel::mpsc::unbounded();
        tokio::spawn(async move {
            // child is moved in so kill_on_drop fires when the stream ends
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            loop {
                if cancel.as_ref().is_some_and(super::CancelSignal::is_cancelled) {
                    debug!(provider = %provider_id, "streaming subprocess cancelled");
                    break;
                }
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        // Streaming children emit one JSON chunk per line;
                        // plain text lines pass through as content.
                        let chunk = serde_json::from_str::<serde_json::Value>(line)
                            .ok()
                            .map_or_else(
                                || AdapterChunk {
                                    content: line.to_string(),
                                    finish_reason: None,
                                },
                                |data| AdapterChunk {
                                    content: data
                                        .get("content")
                                        .and_then(|c| c.as_str())
                                        .unwrap_or_default()
                                        .to_string(),
                                    finish_reason: data
                                        .get("finish_reason")
                                        .and_then(|f| f.as_str())
                                        .map(String::from),
                                },
                            );
                        if tx.unbounded_send(Ok(chunk)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.unbounded_send(Err(GatewayError::Connection(format!(
                            "subprocess stream read failed: {e}"
                        ))));
                        break;
                    }
                }
            }
        });

        Ok(rx.boxed())
    }

    async fn test_connection(&self) -> Result<(), GatewayError> {
        // Validation only: probing must not launch sandboxed processes
        let issues = self.validate_config();
        if let Some(issue) = issues.first() {
            warn!(provider = %self.provider_id, %issue, "sandbox configuration invalid");
            return Err(GatewayError::Configuration {
                provider: Some(self.provider_id.clone()),
                message: issue.to_string(),
            });
        }
        Ok(())
    }

    async fn get_models(&self) -> Result<Vec<String>, GatewayError> {
        // Subprocess providers have no discovery endpoint; the model list
        // comes from the provider's configured mappings.
        Ok(Vec::new())
    }

    fn validate_config(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.command.trim().is_empty() {
            issues.push(ConfigIssue::new("command", "sandbox command is empty"));
        }
        if let Some(image) = &self.image {
            if image.trim().is_empty() {
                issues.push(ConfigIssue::new("image", "sandbox image is empty"));
            }
        }
        if self.memory_limit_mb == Some(0) {
            issues.push(ConfigIssue::new(
                "memory_limit_mb",
                "memory limit must be nonzero",
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
    use crate::adapter::GenerationOptions;
    use crate::provider::ProviderHealth;
    use crate::wire::ChatMessage;

    fn sandbox(command: &str, args: Vec<String>, streaming: bool) -> SandboxAdapter {
        SandboxAdapter::new(Provider {
            id: "sb".to_string(),
            name: "sb".to_string(),
            settings: AdapterSettings::Sandbox {
                command: command.to_string(),
                args,
                image: None,
                memory_limit_mb: None,
                timeout: Some(Duration::from_secs(10)),
                streaming,
            },
            credential_ref: None,
            models: Vec::new(),
            enabled: true,
            priority: None,
            health: ProviderHealth::default(),
        })
        .unwrap()
    }

    fn chat_request(model: &str) -> AdapterRequest {
        AdapterRequest {
            request_id: "req-1".to_string(),
            provider_id: "sb".to_string(),
            model: model.to_string(),
            messages: vec![ChatMessage::user("hi")],
            options: GenerationOptions::default(),
            stream: false,
            cancel: None,
        }
    }

    #[test]
    fn test_parse_json_output() {
        let out = r#"{"content": "hello", "prompt_tokens": 3, "completion_tokens": 5}"#;
        let resp = SandboxAdapter::parse_output(out, "m");
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.usage.unwrap().total_tokens, 8);
    }

    #[test]
    fn test_parse_openai_shaped_output() {
        let out = r#"{"choices": [{"message": {"content": "reply"}}], "finish_reason": "length"}"#;
        let resp = SandboxAdapter::parse_output(out, "m");
        assert_eq!(resp.content, "reply");
        assert_eq!(resp.finish_reason.as_deref(), Some("length"));
    }

    #[test]
    fn test_parse_plain_text_output() {
        let resp = SandboxAdapter::parse_output("just words\n", "m");
        assert_eq!(resp.content, "just words");
        assert!(resp.usage.is_none());
    }

    #[tokio::test]
    async fn test_connection_is_validation_only() {
        // Nonexistent binary still passes: nothing is spawned
        assert!(sandbox("/no/such/model-cli", Vec::new(), false)
            .test_connection()
            .await
            .is_ok());
        assert!(sandbox("", Vec::new(), false).test_connection().await.is_err());
    }

    #[tokio::test]
    async fn test_chat_through_cat() {
        // `cat` echoes the JSON request back, which parses as plain content
        let adapter = sandbox("cat", Vec::new(), false);
        let resp = adapter.handle_chat(chat_request("m")).await.unwrap();
        assert!(resp.content.contains("\"model\""));
    }

    #[tokio::test]
    async fn test_failed_exit_is_upstream_error() {
        let adapter = sandbox("false", Vec::new(), false);
        let err = adapter.handle_chat(chat_request("m")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_non_streaming_provider_buffers_stream() {
        let adapter = sandbox("cat", Vec::new(), false);
        let mut stream = adapter.handle_chat_stream(chat_request("m")).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.finish_reason.is_some());
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_validate_config() {
        assert!(sandbox("cli", Vec::new(), false).validate_config().is_empty());
        let issues = sandbox("", Vec::new(), false).validate_config();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].to_string().contains("command"));
    }
}
