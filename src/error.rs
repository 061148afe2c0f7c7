//! Gateway Error Taxonomy
//!
//! Every failure in the routing core is expressed as a [`GatewayError`].
//! The taxonomy is deliberately small and maps deterministically onto the
//! OpenAI-shaped wire error body:
//!
//! - configuration errors fail fast at provider/adapter creation and are
//!   never retried
//! - transport errors (network/timeout) are retried with backoff inside the
//!   adapter, then escalated
//! - breaker-open errors fail fast, carry a retry-after hint, and are not
//!   counted as a new provider failure
//! - fallback-exhausted errors aggregate all attempts for one model
//! - queue-full/queue-timeout errors are admission-control rejections that
//!   never reach a provider
//! - unsupported-operation errors (e.g. embeddings on a chat-only adapter)
//!   are never retried
//!
//! Internal detail (stack traces, upstream bodies) never leaks into the wire
//! response; the wire body carries only the mapped message, type, and code.

use std::time::Duration;

use crate::wire::ErrorBody;

// ============================================================================
// Gateway Error
// ============================================================================

/// Unified error type for the routing core
#[derive(Clone, Debug)]
pub enum GatewayError {
    /// Invalid provider or adapter configuration (never retried)
    Configuration {
        /// Provider the configuration belongs to (if known)
        provider: Option<String>,
        /// What is wrong
        message: String,
    },

    /// Network-level failure reaching a provider
    Connection(String),

    /// An in-flight call exceeded its deadline
    Timeout {
        /// What was being waited on (adapter call, breaker execution, ...)
        operation: String,
    },

    /// The request waited in the queue past its admission timeout
    /// (distinct from an in-flight [`GatewayError::Timeout`])
    QueueTimeout {
        /// How long the request sat queued before expiring
        waited: Duration,
    },

    /// The queue is at capacity; the request was rejected, not blocked
    QueueFull {
        /// Items queued at rejection time
        queued: usize,
        /// Configured queue capacity
        capacity: usize,
    },

    /// The provider's circuit breaker is open; no work was attempted
    BreakerOpen {
        /// Provider whose breaker rejected the call
        provider: String,
        /// Time until the breaker will allow a probe attempt
        retry_after: Duration,
    },

    /// Every candidate provider for a model failed
    FallbackExhausted {
        /// Public model id the request was for
        model: String,
        /// Number of providers attempted (0 if all breakers were open)
        attempts: usize,
        /// Final underlying error
        last: Box<GatewayError>,
    },

    /// The adapter does not support the requested operation
    Unsupported {
        /// Provider that rejected the operation
        provider: String,
        /// Operation name (e.g. "embeddings")
        operation: String,
    },

    /// The provider returned an error status
    Upstream {
        /// HTTP status (or equivalent) from the provider
        status: u16,
        /// Sanitized upstream message
        message: String,
    },

    /// Authentication with the provider failed
    Auth(String),

    /// The client request is malformed or references an unknown model
    InvalidRequest(String),

    /// No enabled provider serves the requested model
    ModelNotFound(String),

    /// Unexpected internal failure
    Internal(String),
}

impl GatewayError {
    /// Whether an adapter may retry this error against the same provider.
    ///
    /// Only idempotent-safe transport failures qualify; everything else
    /// escalates immediately.
    #[must_use]
    pub fn is_retryable_transport(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout { .. } => true,
            Self::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether this error came from admission control (never reached a provider)
    #[must_use]
    pub fn is_admission_rejection(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::QueueTimeout { .. })
    }

    /// Map this error to the fixed wire classification.
    ///
    /// Returns `(error type, error code, HTTP status)`.
    #[must_use]
    pub fn wire_class(&self) -> (&'static str, &'static str, u16) {
        match self {
            Self::Auth(_) => ("authentication_error", "invalid_api_key", 401),
            Self::Upstream { status: 401, .. } => {
                ("authentication_error", "invalid_api_key", 401)
            }
            Self::Upstream { status: 403, .. } => ("permission_error", "permission_denied", 403),
            Self::InvalidRequest(_) | Self::Configuration { .. } => {
                ("invalid_request_error", "invalid_request", 400)
            }
            Self::ModelNotFound(_) => ("invalid_request_error", "model_not_found", 400),
            Self::Unsupported { .. } => ("invalid_request_error", "operation_not_supported", 400),
            Self::QueueFull { .. } | Self::Upstream { status: 429, .. } => {
                ("rate_limit_error", "rate_limit_exceeded", 429)
            }
            Self::Timeout { .. } | Self::QueueTimeout { .. } => {
                ("timeout_error", "request_timeout", 504)
            }
            Self::BreakerOpen { .. } | Self::FallbackExhausted { .. } | Self::Connection(_) => {
                ("provider_unavailable_error", "provider_unavailable", 503)
            }
            Self::Upstream { .. } | Self::Internal(_) => ("internal_error", "internal_error", 500),
        }
    }

    /// Build the OpenAI-shaped wire error body for this error
    #[must_use]
    pub fn to_wire_body(&self) -> ErrorBody {
        let (error_type, code, _) = self.wire_class();
        ErrorBody::new(self.to_string(), error_type, code)
    }

    /// HTTP status for the wire response
    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.wire_class().2
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration { provider, message } => match provider {
                Some(p) => write!(f, "Invalid configuration for provider {p}: {message}"),
                None => write!(f, "Invalid configuration: {message}"),
            },
            Self::Connection(e) => write!(f, "Connection error: {e}"),
            Self::Timeout { operation } => write!(f, "Timed out waiting for {operation}"),
            Self::QueueTimeout { waited } => {
                write!(f, "Request expired after {}ms in queue", waited.as_millis())
            }
            Self::QueueFull { queued, capacity } => {
                write!(f, "Request queue full ({queued}/{capacity})")
            }
            Self::BreakerOpen {
                provider,
                retry_after,
            } => write!(
                f,
                "Provider {provider} unavailable (circuit open, retry in {}ms)",
                retry_after.as_millis()
            ),
            Self::FallbackExhausted {
                model,
                attempts,
                last,
            } => write!(
                f,
                "All providers failed for model {model} ({attempts} attempted): {last}"
            ),
            Self::Unsupported {
                provider,
                operation,
            } => write!(f, "Provider {provider} does not support {operation}"),
            Self::Upstream { status, message } => {
                write!(f, "Provider returned {status}: {message}")
            }
            Self::Auth(e) => write!(f, "Authentication failed: {e}"),
            Self::InvalidRequest(e) => write!(f, "Invalid request: {e}"),
            Self::ModelNotFound(model) => write!(f, "Model not found: {model}"),
            Self::Internal(e) => write!(f, "Internal error: {e}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                operation: "provider response".to_string(),
            }
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else {
            // Body/decode errors reached the provider, so they are not
            // connection failures; surface them as upstream trouble.
            Self::Upstream {
                status: err.status().map_or(502, |s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_class_mapping() {
        let cases: Vec<(GatewayError, u16)> = vec![
            (GatewayError::Auth("bad key".into()), 401),
            (
                GatewayError::Upstream {
                    status: 403,
                    message: "denied".into(),
                },
                403,
            ),
            (GatewayError::InvalidRequest("no messages".into()), 400),
            (GatewayError::ModelNotFound("gpt-x".into()), 400),
            (
                GatewayError::QueueFull {
                    queued: 10,
                    capacity: 10,
                },
                429,
            ),
            (
                GatewayError::Timeout {
                    operation: "chat".into(),
                },
                504,
            ),
            (
                GatewayError::QueueTimeout {
                    waited: Duration::from_secs(5),
                },
                504,
            ),
            (
                GatewayError::BreakerOpen {
                    provider: "p1".into(),
                    retry_after: Duration::from_secs(30),
                },
                503,
            ),
            (GatewayError::Internal("boom".into()), 500),
        ];

        for (err, expected_status) in cases {
            assert_eq!(err.http_status(), expected_status, "for {err}");
        }
    }

    #[test]
    fn test_fallback_exhausted_maps_to_unavailable() {
        let err = GatewayError::FallbackExhausted {
            model: "gpt-4".into(),
            attempts: 3,
            last: Box::new(GatewayError::Connection("refused".into())),
        };
        let (error_type, code, status) = err.wire_class();
        assert_eq!(error_type, "provider_unavailable_error");
        assert_eq!(code, "provider_unavailable");
        assert_eq!(status, 503);
        assert!(err.to_string().contains("3 attempted"));
    }

    #[test]
    fn test_retryable_transport() {
        assert!(GatewayError::Connection("reset".into()).is_retryable_transport());
        assert!(GatewayError::Timeout {
            operation: "x".into()
        }
        .is_retryable_transport());
        assert!(GatewayError::Upstream {
            status: 429,
            message: String::new()
        }
        .is_retryable_transport());
        assert!(GatewayError::Upstream {
            status: 503,
            message: String::new()
        }
        .is_retryable_transport());
        assert!(!GatewayError::Upstream {
            status: 400,
            message: String::new()
        }
        .is_retryable_transport());
        assert!(!GatewayError::InvalidRequest("x".into()).is_retryable_transport());
        assert!(!GatewayError::BreakerOpen {
            provider: "p".into(),
            retry_after: Duration::ZERO
        }
        .is_retryable_transport());
    }

    #[test]
    fn test_wire_body_has_no_internal_detail() {
        let err = GatewayError::Internal("stack trace at src/foo.rs:42".into());
        let body = err.to_wire_body();
        assert_eq!(body.error.error_type, "internal_error");
        assert_eq!(body.error.code, "internal_error");
    }

    #[test]
    fn test_admission_rejection() {
        assert!(GatewayError::QueueFull {
            queued: 1,
            capacity: 1
        }
        .is_admission_rejection());
        assert!(GatewayError::QueueTimeout {
            waited: Duration::ZERO
        }
        .is_admission_rejection());
        assert!(!GatewayError::Connection("x".into()).is_admission_rejection());
    }
}
