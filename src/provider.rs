//! Provider Data Model
//!
//! Providers are configured backends capable of serving one or more public
//! models through one transport type. The routing core only ever *reads*
//! provider records and writes back health status; creation and mutation
//! belong to an external management layer consumed through the
//! [`ProviderDirectory`] trait.
//!
//! Credentials are referenced by name and resolved at call time through a
//! [`CredentialResolver`]; a provider record never embeds a secret.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

// ============================================================================
// Transport Types
// ============================================================================

/// The four supported provider transports.
///
/// This enum is closed on purpose: adding a transport is a compile-time
/// visible change, not a runtime registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    /// CLI process executed inside a resource-limited sandbox
    SandboxedSubprocess,
    /// Vendor HTTP API (bearer / api-key / custom-header auth)
    HttpSdk,
    /// Generic OpenAI-compatible HTTP surface
    Proxy,
    /// Local inference daemon (Ollama-style or generic)
    LocalDaemon,
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SandboxedSubprocess => "sandboxed-subprocess",
            Self::HttpSdk => "http-sdk",
            Self::Proxy => "proxy",
            Self::LocalDaemon => "local-daemon",
        };
        write!(f, "{s}")
    }
}

/// Transport-specific adapter configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterSettings {
    /// Settings for [`ProviderType::SandboxedSubprocess`]
    Sandbox {
        /// Executable to run
        command: String,
        /// Arguments passed to the command
        #[serde(default)]
        args: Vec<String>,
        /// Optional sandbox image identifier
        #[serde(default)]
        image: Option<String>,
        /// Memory limit in megabytes
        #[serde(default)]
        memory_limit_mb: Option<u64>,
        /// Wall-clock limit per execution
        #[serde(default)]
        timeout: Option<Duration>,
        /// Whether streaming output is enabled for this provider
        #[serde(default)]
        streaming: bool,
    },

    /// Settings for [`ProviderType::HttpSdk`]
    Http {
        /// API base URL (no trailing slash)
        base_url: String,
        /// How the resolved credential is attached
        #[serde(default)]
        auth: AuthStyle,
        /// Extra headers sent on every request
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Per-request timeout
        #[serde(default)]
        timeout: Option<Duration>,
        /// Override of the health probe path (default `/v1/models`)
        #[serde(default)]
        health_path: Option<String>,
    },

    /// Settings for [`ProviderType::Proxy`]
    Proxy {
        /// Upstream OpenAI-compatible base URL
        base_url: String,
        /// Headers to set (overwriting) on forwarded requests
        #[serde(default)]
        set_headers: HashMap<String, String>,
        /// Headers to strip from forwarded requests
        #[serde(default)]
        strip_headers: Vec<String>,
        /// Per-request timeout
        #[serde(default)]
        timeout: Option<Duration>,
    },

    /// Settings for [`ProviderType::LocalDaemon`]
    Local {
        /// Daemon base URL (e.g. `http://localhost:11434`)
        base_url: String,
        /// Daemon family; `None` autodetects from the URL
        #[serde(default)]
        family: Option<DaemonFamily>,
        /// Default tag appended to bare model names (Ollama convention)
        #[serde(default)]
        default_tag: Option<String>,
        /// Per-request timeout
        #[serde(default)]
        timeout: Option<Duration>,
    },
}

impl AdapterSettings {
    /// The transport this settings variant belongs to
    #[must_use]
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::Sandbox { .. } => ProviderType::SandboxedSubprocess,
            Self::Http { .. } => ProviderType::HttpSdk,
            Self::Proxy { .. } => ProviderType::Proxy,
            Self::Local { .. } => ProviderType::LocalDaemon,
        }
    }
}

/// How an HTTP credential is attached to outbound requests
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthStyle {
    /// `Authorization: Bearer <secret>`
    #[default]
    Bearer,
    /// `x-api-key: <secret>`
    ApiKey,
    /// Custom header name carrying the secret
    CustomHeader(String),
    /// No credential attached
    None,
}

/// Local daemon service family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonFamily {
    /// Ollama NDJSON API (`/api/chat`, `/api/tags`)
    Ollama,
    /// Generic OpenAI-compatible local server
    OpenAiCompatible,
}

// ============================================================================
// Provider Record
// ============================================================================

/// Maps a public model id to a provider-native model id
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelMapping {
    /// Model id clients request
    pub public_id: String,
    /// Model id the provider understands
    pub provider_id: String,
    /// Response token ceiling; inherited by requests that leave
    /// `max_tokens` unset
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Context window size, when known
    #[serde(default)]
    pub context_window: Option<u32>,
    /// Whether the provider can embed with this model
    #[serde(default)]
    pub supports_embeddings: bool,
    /// Whether the provider can stream this model
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
}

fn default_true() -> bool {
    true
}

/// Provider health status, written back by the health monitor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Last probe succeeded
    Healthy,
    /// Last probe failed
    Unhealthy,
    /// Provider is administratively disabled
    Disabled,
}

/// A provider's last observed health
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderHealth {
    /// Current status
    pub status: HealthStatus,
    /// Unix timestamp (ms) of the last check, 0 if never checked
    pub last_checked_ms: u64,
    /// Error message from the last failed check
    pub last_error: Option<String>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            last_checked_ms: 0,
            last_error: None,
        }
    }
}

/// A configured backend provider
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Provider {
    /// Stable provider identity (breaker and health state key on this)
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Transport-specific settings (the transport type is derived from these)
    pub settings: AdapterSettings,
    /// Name of the credential to resolve, if the transport needs one
    #[serde(default)]
    pub credential_ref: Option<String>,
    /// Models this provider serves
    #[serde(default)]
    pub models: Vec<ModelMapping>,
    /// Whether the provider participates in routing
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fallback ordering priority (lower = preferred; unset = tried last)
    #[serde(default)]
    pub priority: Option<u32>,
    /// Last observed health
    #[serde(default)]
    pub health: ProviderHealth,
}

impl Provider {
    /// The provider's transport type
    #[must_use]
    pub fn provider_type(&self) -> ProviderType {
        self.settings.provider_type()
    }

    /// Find the mapping for a public model id
    #[must_use]
    pub fn mapping_for(&self, public_id: &str) -> Option<&ModelMapping> {
        self.models.iter().find(|m| m.public_id == public_id)
    }

    /// Whether this provider serves the given public model id
    #[must_use]
    pub fn serves(&self, public_id: &str) -> bool {
        self.mapping_for(public_id).is_some()
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Read access to the provider set, plus health-status writeback.
///
/// The management layer owns provider records; the routing core consumes
/// them through this seam.
#[async_trait]
pub trait ProviderDirectory: Send + Sync {
    /// All enabled providers
    async fn enabled_providers(&self) -> Vec<Provider>;

    /// Enabled providers serving the given public model id
    async fn providers_for_model(&self, public_id: &str) -> Vec<Provider>;

    /// A single provider by id, enabled or not
    async fn provider(&self, id: &str) -> Option<Provider>;

    /// Write back a provider's observed health
    async fn set_health(&self, id: &str, health: ProviderHealth);
}

/// Resolves a credential reference to a transport-ready secret
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolve the credential for a provider, if it has one configured
    async fn resolve(&self, provider: &Provider) -> Result<Option<String>, GatewayError>;
}

// ============================================================================
// In-Memory Implementations
// ============================================================================

/// In-memory provider directory for the daemon and for tests
#[derive(Default)]
pub struct InMemoryDirectory {
    providers: RwLock<Vec<Provider>>,
}

impl InMemoryDirectory {
    /// Build a directory over a fixed provider set
    #[must_use]
    pub fn new(providers: Vec<Provider>) -> Self {
        Self {
            providers: RwLock::new(providers),
        }
    }

    /// Replace the provider set
    pub fn replace(&self, providers: Vec<Provider>) {
        *self.providers.write() = providers;
    }
}

#[async_trait]
impl ProviderDirectory for InMemoryDirectory {
    async fn enabled_providers(&self) -> Vec<Provider> {
        self.providers
            .read()
            .iter()
            .filter(|p| p.enabled)
            .cloned()
            .collect()
    }

    async fn providers_for_model(&self, public_id: &str) -> Vec<Provider> {
        self.providers
            .read()
            .iter()
            .filter(|p| p.enabled && p.serves(public_id))
            .cloned()
            .collect()
    }

    async fn provider(&self, id: &str) -> Option<Provider> {
        self.providers.read().iter().find(|p| p.id == id).cloned()
    }

    async fn set_health(&self, id: &str, health: ProviderHealth) {
        let mut providers = self.providers.write();
        if let Some(p) = providers.iter_mut().find(|p| p.id == id) {
            p.health = health;
        }
    }
}

/// Static credential map keyed by credential reference name
#[derive(Default)]
pub struct StaticCredentials {
    secrets: HashMap<String, String>,
}

impl StaticCredentials {
    /// Build from a reference-name → secret map
    #[must_use]
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, provider: &Provider) -> Result<Option<String>, GatewayError> {
        match &provider.credential_ref {
            None => Ok(None),
            Some(name) => self.secrets.get(name).cloned().map(Some).ok_or_else(|| {
                GatewayError::Configuration {
                    provider: Some(provider.id.clone()),
                    message: format!("credential reference '{name}' cannot be resolved"),
                }
            }),
        }
    }
}

/// Shared handle types used throughout the routing core
pub type SharedDirectory = Arc<dyn ProviderDirectory>;
/// Shared credential resolver handle
pub type SharedCredentials = Arc<dyn CredentialResolver>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_provider(id: &str, models: Vec<&str>) -> Provider {
        Provider {
            id: id.to_string(),
            name: id.to_string(),
            settings: AdapterSettings::Local {
                base_url: "http://localhost:11434".to_string(),
                family: Some(DaemonFamily::Ollama),
                default_tag: None,
                timeout: None,
            },
            credential_ref: None,
            models: models
                .into_iter()
                .map(|m| ModelMapping {
                    public_id: m.to_string(),
                    provider_id: format!("{m}:latest"),
                    max_tokens: Some(4096),
                    context_window: None,
                    supports_embeddings: false,
                    supports_streaming: true,
                })
                .collect(),
            enabled: true,
            priority: None,
            health: ProviderHealth::default(),
        }
    }

    #[tokio::test]
    async fn test_directory_filters_disabled() {
        let mut disabled = test_provider("p2", vec!["m"]);
        disabled.enabled = false;
        let dir = InMemoryDirectory::new(vec![test_provider("p1", vec!["m"]), disabled]);

        let enabled = dir.enabled_providers().await;
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "p1");

        let serving = dir.providers_for_model("m").await;
        assert_eq!(serving.len(), 1);
    }

    #[tokio::test]
    async fn test_directory_model_lookup() {
        let dir = InMemoryDirectory::new(vec![
            test_provider("p1", vec!["a", "b"]),
            test_provider("p2", vec!["b"]),
        ]);

        assert_eq!(dir.providers_for_model("a").await.len(), 1);
        assert_eq!(dir.providers_for_model("b").await.len(), 2);
        assert!(dir.providers_for_model("c").await.is_empty());
    }

    #[tokio::test]
    async fn test_health_writeback() {
        let dir = InMemoryDirectory::new(vec![test_provider("p1", vec!["m"])]);
        dir.set_health(
            "p1",
            ProviderHealth {
                status: HealthStatus::Healthy,
                last_checked_ms: 1234,
                last_error: None,
            },
        )
        .await;

        let p = dir.provider("p1").await.unwrap();
        assert_eq!(p.health.status, HealthStatus::Healthy);
        assert_eq!(p.health.last_checked_ms, 1234);
    }

    #[tokio::test]
    async fn test_static_credentials_missing_ref() {
        let resolver = StaticCredentials::default();
        let mut provider = test_provider("p1", vec!["m"]);
        provider.credential_ref = Some("openai-key".to_string());

        let err = resolver.resolve(&provider).await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }

    #[test]
    fn test_provider_type_from_settings() {
        let p = test_provider("p1", vec![]);
        assert_eq!(p.provider_type(), ProviderType::LocalDaemon);
        assert_eq!(p.provider_type().to_string(), "local-daemon");
    }
}
