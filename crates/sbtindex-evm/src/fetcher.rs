//! Contract reader and log fetcher.
//!
//! Uses JSON-RPC `eth_blockNumber`, `eth_getBlockByHash`, `eth_getLogs` and
//! `eth_call`. Rate limiting and retries live below this layer, in the
//! transport; here a request that still fails transiently marks its range as
//! abandoned so the caller can schedule it again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy_dyn_abi::DynSolType;
use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use sbtindex_core::cache::RankSource;
use sbtindex_core::config::{EventAbi, RateLimitSettings};
use sbtindex_core::error::IndexerError;
use sbtindex_core::types::{BlockRange, RankConstant};
use sbtindex_rpc::policy::{RateLimiterConfig, RetryConfig};
use sbtindex_rpc::{RpcTransport, TransportError};

use crate::events::{decode_data, function_selector};

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Result<u64, IndexerError> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u32(&self) -> Result<u32, IndexerError> {
        let index = parse_hex_u64(&self.log_index)?;
        u32::try_from(index)
            .map_err(|_| IndexerError::Decode(format!("log index {index} out of range")))
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// Causal position of the log: `(block, log_index)`.
    pub fn position(&self) -> Result<(u64, u32), IndexerError> {
        Ok((self.block_number_u64()?, self.log_index_u32()?))
    }
}

/// Parse a hex-encoded quantity (with or without `0x`).
pub fn parse_hex_u64(s: &str) -> Result<u64, IndexerError> {
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16)
        .map_err(|e| IndexerError::Decode(format!("invalid hex quantity '{s}': {e}")))
}

fn parse_quantity(v: &Value, what: &str) -> Result<u64, IndexerError> {
    let s = v
        .as_str()
        .ok_or_else(|| IndexerError::Decode(format!("{what} is not a hex string: {v}")))?;
    parse_hex_u64(s).map_err(|e| IndexerError::Decode(format!("{what}: {e}")))
}

// ─── ContractReader ───────────────────────────────────────────────────────────

/// Everything the indexer reads from the chain.
#[async_trait]
pub trait ContractReader: RankSource {
    /// Current head block number.
    async fn block_number(&self) -> Result<u64, IndexerError>;

    /// Unix timestamp of the block with the given hash.
    async fn block_timestamp(&self, block_hash: &str) -> Result<i64, IndexerError>;

    /// Logs emitted by `address` with the given topic0 in `[from, to]`.
    async fn get_logs(
        &self,
        address: &str,
        topic0: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError>;
}

/// Limiter and retry configuration for the shared transport.
pub fn policy_configs(settings: &RateLimitSettings) -> (RateLimiterConfig, RetryConfig) {
    (
        RateLimiterConfig {
            capacity: settings.reservoir,
            refill_interval: std::time::Duration::from_millis(settings.refill_interval_ms),
            max_concurrent: settings.max_concurrent,
        },
        RetryConfig {
            max_attempts: settings.max_attempts,
            initial_backoff: std::time::Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: std::time::Duration::from_millis(settings.max_backoff_ms),
            ..Default::default()
        },
    )
}

/// Retryable transport failures become [`IndexerError::Transient`].
pub fn map_transport_error(err: TransportError) -> IndexerError {
    if err.is_retryable() {
        IndexerError::Transient(err.to_string())
    } else {
        IndexerError::Rpc(err.to_string())
    }
}

/// [`ContractReader`] over any JSON-RPC transport.
pub struct RpcContractReader<T> {
    transport: T,
    contract: String,
    rank_selector: [u8; 4],
    next_id: AtomicU64,
}

impl<T: RpcTransport> RpcContractReader<T> {
    pub fn new(
        transport: T,
        contract: impl Into<String>,
        abi: &EventAbi,
    ) -> Result<Self, IndexerError> {
        Ok(Self {
            transport,
            contract: contract.into().to_ascii_lowercase(),
            rank_selector: function_selector(&abi.rank_constants)?,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn call<R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<R, IndexerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.transport
            .call(id, method, params)
            .await
            .map_err(map_transport_error)
    }

    fn rank_call_data(&self, rank_id: u8) -> String {
        let mut data = self.rank_selector.to_vec();
        data.extend_from_slice(&U256::from(rank_id).to_be_bytes::<32>());
        format!("0x{}", hex::encode(data))
    }
}

#[async_trait]
impl<T: RpcTransport> RankSource for RpcContractReader<T> {
    async fn rank_constant(&self, rank_id: u8) -> Result<Option<RankConstant>, IndexerError> {
        let output: String = self
            .call(
                "eth_call",
                vec![
                    json!({ "to": self.contract, "data": self.rank_call_data(rank_id) }),
                    json!("latest"),
                ],
            )
            .await?;
        decode_rank_constant(rank_id, &output)
    }
}

/// Decode `(uint256 S, uint256 T)`. An empty return or `(0, 0)` means the
/// rank is not configured on the contract.
pub fn decode_rank_constant(rank_id: u8, output: &str) -> Result<Option<RankConstant>, IndexerError> {
    if output.trim_start_matches("0x").is_empty() {
        return Ok(None);
    }
    let values = decode_data(output, vec![DynSolType::Uint(256), DynSolType::Uint(256)])?;
    let word = |i: usize| {
        values[i]
            .as_uint()
            .map(|(v, _)| v)
            .ok_or_else(|| IndexerError::Decode(format!("rank {rank_id} constant {i} is not a uint")))
    };
    let (points, lifetime) = (word(0)?, word(1)?);
    if points.is_zero() && lifetime.is_zero() {
        return Ok(None);
    }
    Ok(Some(RankConstant {
        rank_id,
        total_points: u64::try_from(points)
            .map_err(|_| IndexerError::Decode(format!("rank {rank_id} points overflow u64")))?,
        lifetime_seconds: i64::try_from(lifetime)
            .map_err(|_| IndexerError::Decode(format!("rank {rank_id} lifetime overflows i64")))?,
    }))
}

#[async_trait]
impl<T: RpcTransport> ContractReader for RpcContractReader<T> {
    async fn block_number(&self) -> Result<u64, IndexerError> {
        let v: Value = self.call("eth_blockNumber", vec![]).await?;
        parse_quantity(&v, "block number")
    }

    async fn block_timestamp(&self, block_hash: &str) -> Result<i64, IndexerError> {
        let block: Option<Value> = self
            .call("eth_getBlockByHash", vec![json!(block_hash), json!(false)])
            .await?;
        let block =
            block.ok_or_else(|| IndexerError::Rpc(format!("block {block_hash} not found")))?;
        let ts = parse_quantity(&block["timestamp"], "block timestamp")?;
        i64::try_from(ts).map_err(|_| IndexerError::Decode(format!("timestamp {ts} overflows")))
    }

    async fn get_logs(
        &self,
        address: &str,
        topic0: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, IndexerError> {
        let filter = json!({
            "address": address,
            "topics": [topic0],
            "fromBlock": format!("0x{from:x}"),
            "toBlock": format!("0x{to:x}"),
        });
        self.call("eth_getLogs", vec![filter]).await
    }
}

// ─── LogFetcher ───────────────────────────────────────────────────────────────

/// Result of fetching one range for one event kind.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Every sub-range was fetched. Logs are in `(block, log_index)` order.
    Complete(Vec<RawLog>),
    /// Retries were exhausted. No logs from the range may be applied.
    Abandoned { range: BlockRange, reason: String },
}

impl FetchOutcome {
    /// Logs of a complete fetch; empty for an abandoned one.
    pub fn logs(&self) -> &[RawLog] {
        match self {
            Self::Complete(logs) => logs,
            Self::Abandoned { .. } => &[],
        }
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Abandoned { .. })
    }
}

/// Fetches logs of one contract, splitting ranges to the provider's width.
pub struct LogFetcher<R> {
    reader: Arc<R>,
    address: String,
    max_range: u64,
}

impl<R: ContractReader> LogFetcher<R> {
    pub fn new(reader: Arc<R>, address: impl Into<String>, max_range: u64) -> Self {
        Self {
            reader,
            address: address.into(),
            max_range: max_range.max(1),
        }
    }

    /// Fetch all logs with `topic0` in `range`.
    ///
    /// A transient failure on any sub-range abandons the whole range. Other
    /// errors are returned as-is.
    pub async fn fetch(&self, topic0: &str, range: BlockRange) -> Result<FetchOutcome, IndexerError> {
        let mut logs = Vec::new();
        for chunk in range.batches(self.max_range) {
            match self
                .reader
                .get_logs(&self.address, topic0, chunk.from, chunk.to)
                .await
            {
                Ok(chunk_logs) => {
                    for log in chunk_logs.into_iter().filter(|l| !l.is_removed()) {
                        match log.position() {
                            Ok(position) => logs.push((position, log)),
                            Err(e) => tracing::warn!(
                                topic0,
                                tx = %log.tx_hash,
                                error = %e,
                                "log skipped"
                            ),
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        topic0,
                        from = range.from,
                        to = range.to,
                        error = %e,
                        "log fetch abandoned"
                    );
                    return Ok(FetchOutcome::Abandoned {
                        range,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        logs.sort_by_key(|(position, _)| *position);
        let logs: Vec<RawLog> = logs.into_iter().map(|(_, log)| log).collect();
        tracing::debug!(topic0, from = range.from, to = range.to, logs = logs.len(), "fetched logs");
        Ok(FetchOutcome::Complete(logs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn raw(block: u64, index: u32) -> RawLog {
        RawLog {
            address: "0x0".into(),
            topics: vec![],
            data: "0x".into(),
            block_number: format!("0x{block:x}"),
            block_hash: "0x0".into(),
            tx_hash: "0x0".into(),
            log_index: format!("0x{index:x}"),
            removed: None,
        }
    }

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1").unwrap(), 1);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert_eq!(parse_hex_u64("1234").unwrap(), 0x1234);
    }

    #[test]
    fn malformed_quantities_are_decode_errors() {
        assert!(matches!(parse_hex_u64("0xzz"), Err(IndexerError::Decode(_))));
        assert!(matches!(parse_hex_u64(""), Err(IndexerError::Decode(_))));

        let mut log = raw(7, 0);
        log.log_index = "0x100000000".into();
        assert!(log.log_index_u32().is_err());
        log.block_number = "pending".into();
        assert!(log.position().is_err());
    }

    #[test]
    fn raw_log_deserializes_from_rpc_json() {
        let log: RawLog = serde_json::from_value(json!({
            "address": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "topics": ["0x01"],
            "data": "0x",
            "blockNumber": "0x12a05f200",
            "blockHash": "0xb1",
            "transactionHash": "0xt1",
            "logIndex": "0x5",
            "transactionIndex": "0x0"
        }))
        .unwrap();
        assert_eq!(log.block_number_u64().unwrap(), 5_000_000_000);
        assert_eq!(log.log_index_u32().unwrap(), 5);
        assert!(!log.is_removed());
    }

    #[test]
    fn rank_constant_decoding() {
        let word = |v: u64| format!("{v:064x}");
        let out = format!("0x{}{}", word(320_000), word(259_200));
        assert_eq!(
            decode_rank_constant(1, &out).unwrap(),
            Some(RankConstant {
                rank_id: 1,
                total_points: 320_000,
                lifetime_seconds: 259_200
            })
        );
        let zero = format!("0x{}{}", word(0), word(0));
        assert_eq!(decode_rank_constant(1, &zero).unwrap(), None);
        assert_eq!(decode_rank_constant(1, "0x").unwrap(), None);
        assert!(decode_rank_constant(1, "0x1234").is_err());
    }

    #[test]
    fn default_settings_map_to_policy() {
        let (limiter, retry) = policy_configs(&RateLimitSettings::default());
        assert_eq!(limiter.capacity, 25);
        assert_eq!(limiter.max_concurrent, 1);
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.max_backoff, std::time::Duration::from_secs(60));
    }

    #[test]
    fn transport_errors_are_classified() {
        let e = map_transport_error(TransportError::RateLimited {
            provider: "p".into(),
            retry_after: None,
        });
        assert!(e.is_transient());
        let e = map_transport_error(TransportError::Other("bad request".into()));
        assert!(matches!(e, IndexerError::Rpc(_)));
    }

    /// Reader that records requested ranges and fails transiently on demand.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(u64, u64)>>,
        fail_from: Option<u64>,
        /// Prepend a log with an unparseable block number to every chunk.
        malformed: bool,
    }

    #[async_trait]
    impl RankSource for Recorder {
        async fn rank_constant(&self, _: u8) -> Result<Option<RankConstant>, IndexerError> {
            Ok(None)
        }
    }

    #[async_trait]
    impl ContractReader for Recorder {
        async fn block_number(&self) -> Result<u64, IndexerError> {
            Ok(0)
        }
        async fn block_timestamp(&self, _: &str) -> Result<i64, IndexerError> {
            Ok(0)
        }
        async fn get_logs(
            &self,
            _: &str,
            _: &str,
            from: u64,
            to: u64,
        ) -> Result<Vec<RawLog>, IndexerError> {
            self.calls.lock().unwrap().push((from, to));
            if self.fail_from == Some(from) {
                return Err(IndexerError::Transient("429".into()));
            }
            let mut logs = vec![raw(to, 1), raw(from, 0)];
            if self.malformed {
                let mut bad = raw(from, 9);
                bad.block_number = "0xnot-a-number".into();
                logs.insert(0, bad);
            }
            Ok(logs)
        }
    }

    #[tokio::test]
    async fn wide_range_is_split_and_sorted() {
        let reader = Arc::new(Recorder::default());
        let fetcher = LogFetcher::new(reader.clone(), "0xc", 90);
        let out = fetcher.fetch("0xt", BlockRange::new(0, 199)).await.unwrap();
        assert_eq!(
            *reader.calls.lock().unwrap(),
            vec![(0, 89), (90, 179), (180, 199)]
        );
        let positions: Vec<_> = out.logs().iter().map(|l| l.position().unwrap()).collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
        assert_eq!(positions.len(), 6);
    }

    #[tokio::test]
    async fn transient_failure_abandons_whole_range() {
        let reader = Arc::new(Recorder {
            fail_from: Some(90),
            ..Default::default()
        });
        let fetcher = LogFetcher::new(reader, "0xc", 90);
        let out = fetcher.fetch("0xt", BlockRange::new(0, 199)).await.unwrap();
        assert!(out.is_abandoned());
        assert!(out.logs().is_empty());
        match out {
            FetchOutcome::Abandoned { range, .. } => assert_eq!(range, BlockRange::new(0, 199)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_log_is_skipped_not_sorted_first() {
        let reader = Arc::new(Recorder {
            malformed: true,
            ..Default::default()
        });
        let fetcher = LogFetcher::new(reader, "0xc", 90);
        let out = fetcher.fetch("0xt", BlockRange::new(10, 20)).await.unwrap();
        let positions: Vec<_> = out.logs().iter().map(|l| l.position().unwrap()).collect();
        assert_eq!(positions, vec![(10, 0), (20, 1)]);
    }
}
