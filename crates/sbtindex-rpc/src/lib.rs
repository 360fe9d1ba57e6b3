//! sbtindex-rpc: the provider-facing side of the indexer.
//!
//! - [`RpcTransport`]: the async trait every transport implements
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`]: wire types
//! - [`TransportError`]: structured error type
//! - [`policy`]: reservoir rate limiter and retry policy
//! - [`RateLimitedTransport`]: applies the policy stack to any transport
//! - [`HttpRpcClient`]: `reqwest`-backed HTTP transport

pub mod error;
pub mod http;
pub mod limited;
pub mod policy;
pub mod request;
pub mod transport;

pub use error::TransportError;
pub use http::HttpRpcClient;
pub use limited::RateLimitedTransport;
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use transport::RpcTransport;
