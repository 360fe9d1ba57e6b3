//! Applies the rate limiter and retry policy to any [`RpcTransport`].

use async_trait::async_trait;

use crate::error::TransportError;
use crate::policy::{RateLimiter, RateLimiterConfig, RetryConfig, RetryPolicy};
use crate::request::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::RpcTransport;

/// A transport whose every request goes through one shared rate limiter and
/// is retried under a bounded policy.
pub struct RateLimitedTransport<T> {
    inner: T,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl<T: RpcTransport> RateLimitedTransport<T> {
    pub fn new(inner: T, limiter: RateLimiterConfig, retry: RetryConfig) -> Self {
        Self {
            inner,
            limiter: RateLimiter::new(limiter),
            retry: RetryPolicy::new(retry),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: RpcTransport> RpcTransport for RateLimitedTransport<T> {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = {
                let _permit = self.limiter.acquire().await?;
                self.inner.send(req.clone()).await
            };

            // Quota errors may also arrive as a JSON-RPC error object.
            let err = match result {
                Ok(resp) => match &resp.error {
                    Some(rpc_err) => match TransportError::from_rpc(rpc_err.clone(), self.url()) {
                        e @ TransportError::RateLimited { .. } => e,
                        _ => return Ok(resp),
                    },
                    None => return Ok(resp),
                },
                Err(e) => e,
            };

            match self.retry.next_delay(attempt, &err) {
                Some(delay) => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        method = %req.method,
                        error = %err,
                        url = %self.url(),
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    if err.is_retryable() {
                        tracing::error!(
                            attempt,
                            method = %req.method,
                            error = %err,
                            url = %self.url(),
                            "max retries exceeded"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    fn url(&self) -> &str {
        self.inner.url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::JsonRpcError;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` calls with the given kind, then succeeds.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        as_rpc_error: bool,
    }

    #[async_trait]
    impl RpcTransport for Flaky {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                if self.as_rpc_error {
                    return Ok(JsonRpcResponse::failure(
                        req.id,
                        JsonRpcError {
                            code: 429,
                            message: "Too Many Requests".into(),
                            data: None,
                        },
                    ));
                }
                return Err(TransportError::RateLimited {
                    provider: "mock".into(),
                    retry_after: Some(Duration::from_millis(5)),
                });
            }
            Ok(JsonRpcResponse::success(req.id, json!("0x10")))
        }

        fn url(&self) -> &str {
            "mock"
        }
    }

    fn wrap(failures: u32, as_rpc_error: bool) -> RateLimitedTransport<Flaky> {
        RateLimitedTransport::new(
            Flaky {
                calls: AtomicU32::new(0),
                failures,
                as_rpc_error,
            },
            RateLimiterConfig::default(),
            RetryConfig {
                initial_backoff: Duration::from_millis(1),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn one_429_then_success_is_transparent() {
        let t = wrap(1, false);
        let head: String = t.call(1, "eth_blockNumber", vec![]).await.unwrap();
        assert_eq!(head, "0x10");
        assert_eq!(t.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rpc_level_429_is_retried() {
        let t = wrap(2, true);
        let head: String = t.call(1, "eth_blockNumber", vec![]).await.unwrap();
        assert_eq!(head, "0x10");
        assert_eq!(t.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn always_429_gives_up_after_ceiling() {
        let t = wrap(u32::MAX, false);
        let err = t
            .send(JsonRpcRequest::new(1, "eth_getLogs", vec![]))
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(t.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn execution_errors_pass_through() {
        struct Reverts;
        #[async_trait]
        impl RpcTransport for Reverts {
            async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
                Ok(JsonRpcResponse::failure(
                    req.id,
                    JsonRpcError {
                        code: -32000,
                        message: "execution reverted".into(),
                        data: None,
                    },
                ))
            }
            fn url(&self) -> &str {
                "reverts"
            }
        }
        let t = RateLimitedTransport::new(Reverts, RateLimiterConfig::default(), RetryConfig::default());
        let resp = t.send(JsonRpcRequest::new(1, "eth_call", vec![])).await.unwrap();
        assert_eq!(resp.error.unwrap().code, -32000);
    }
}
