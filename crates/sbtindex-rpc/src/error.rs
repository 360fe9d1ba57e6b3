//! Transport-level error types.

use std::time::Duration;

use thiserror::Error;

use crate::request::JsonRpcError;

/// JSON-RPC error codes providers use for quota exhaustion.
const RATE_LIMIT_CODES: &[i64] = &[429, -32005, -32029];

/// Errors that can occur during an RPC transport operation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, 5xx, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Provider quota exhausted. `retry_after` is the provider's reset hint.
    #[error("Rate limit exceeded (provider: {provider})")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if this error is retryable (transient).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Classify a JSON-RPC error object, promoting quota errors to
    /// [`TransportError::RateLimited`].
    pub fn from_rpc(err: JsonRpcError, provider: &str) -> Self {
        if RATE_LIMIT_CODES.contains(&err.code) {
            Self::RateLimited {
                provider: provider.to_string(),
                retry_after: None,
            }
        } else {
            Self::Rpc(err)
        }
    }
}
