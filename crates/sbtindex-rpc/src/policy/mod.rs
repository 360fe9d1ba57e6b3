//! Policy engine: provider quota discipline for RPC calls.
//!
//! The policy stack (applied in order by `RateLimitedTransport`):
//! ```text
//! Request → [RateLimiter: reservoir + in-flight permit] → [RetryPolicy] → [Transport]
//! ```

pub mod rate_limiter;
pub mod retry;

pub use rate_limiter::{RateLimiter, RateLimiterConfig, Reservoir};
pub use retry::{RetryConfig, RetryPolicy};
