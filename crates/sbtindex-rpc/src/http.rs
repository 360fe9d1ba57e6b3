//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! The client itself makes exactly one attempt per request; wrap it in
//! [`RateLimitedTransport`](crate::RateLimitedTransport) for quota discipline.
//! It does translate provider throttling into [`TransportError::RateLimited`]
//! with a reset hint, and honours an exhausted `x-ratelimit-remaining` header
//! by pausing until the advertised reset before the next request.

use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::RpcTransport;

const RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Values above this are read as unix timestamps rather than second counts.
const EPOCH_THRESHOLD: u64 = 1_000_000_000;

/// HTTP JSON-RPC client.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    request_timeout: Duration,
    /// Set when the provider reported an exhausted quota on a success.
    pause_until: Mutex<Option<Instant>>,
}

impl HttpRpcClient {
    /// Create a new client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            request_timeout,
            pause_until: Mutex::new(None),
        })
    }

    async fn wait_for_quota(&self) {
        let until = self.pause_until.lock().unwrap().take();
        if let Some(until) = until {
            let wait = until.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                tracing::debug!(wait_ms = wait.as_millis() as u64, "provider quota exhausted, pausing");
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.wait_for_quota().await;

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        ms: self.request_timeout.as_millis() as u64,
                    }
                } else {
                    TransportError::Http(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited {
                provider: self.url.clone(),
                retry_after: reset_hint(resp.headers(), SystemTime::now()),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {}: {body}", status.as_u16())));
        }

        if quota_exhausted(resp.headers()) {
            if let Some(wait) = reset_hint(resp.headers(), SystemTime::now()) {
                *self.pause_until.lock().unwrap() = Some(Instant::now() + wait);
            }
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    fn url(&self) -> &str {
        &self.url
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn quota_exhausted(headers: &HeaderMap) -> bool {
    header_u64(headers, RATELIMIT_REMAINING) == Some(0)
}

/// How long the provider asks us to wait, from `Retry-After` or
/// `x-ratelimit-reset` (seconds, or a unix timestamp).
pub fn reset_hint(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    if let Some(secs) = header_u64(headers, RETRY_AFTER.as_str()) {
        return Some(Duration::from_secs(secs));
    }
    let reset = header_u64(headers, RATELIMIT_RESET)?;
    if reset < EPOCH_THRESHOLD {
        return Some(Duration::from_secs(reset));
    }
    let now = now.duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(Duration::from_secs(reset.saturating_sub(now)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn retry_after_seconds() {
        let h = headers(&[("retry-after", "3")]);
        assert_eq!(reset_hint(&h, SystemTime::now()), Some(Duration::from_secs(3)));
    }

    #[test]
    fn reset_as_unix_timestamp() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let h = headers(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1700000012")]);
        assert!(quota_exhausted(&h));
        assert_eq!(reset_hint(&h, now), Some(Duration::from_secs(12)));
    }

    #[test]
    fn reset_in_the_past_is_zero() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_100);
        let h = headers(&[("x-ratelimit-reset", "1700000000")]);
        assert_eq!(reset_hint(&h, now), Some(Duration::ZERO));
    }

    #[test]
    fn no_hint_headers() {
        let h = headers(&[("x-ratelimit-remaining", "12")]);
        assert!(!quota_exhausted(&h));
        assert_eq!(reset_hint(&h, SystemTime::now()), None);
    }
}
