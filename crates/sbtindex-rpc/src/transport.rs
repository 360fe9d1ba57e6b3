//! The `RpcTransport` trait: the seam between the indexer and a provider.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// The async trait every RPC transport implements.
///
/// Implementations must be `Send + Sync` for use across Tokio tasks.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the raw response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// The transport's identifier (URL or name), used in logs and errors.
    fn url(&self) -> &str;

    /// Call a method and deserialize the result. JSON-RPC error objects are
    /// classified with [`TransportError::from_rpc`].
    async fn call<T: DeserializeOwned>(
        &self,
        id: u64,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError>
    where
        Self: Sized,
    {
        let req = JsonRpcRequest::new(id, method, params);
        let resp = self.send(req).await?;
        let result = resp
            .into_result()
            .map_err(|e| TransportError::from_rpc(e, self.url()))?;
        serde_json::from_value(result).map_err(TransportError::Deserialization)
    }
}
