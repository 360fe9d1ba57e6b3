//! Indexer configuration.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Hard per-query block range limit enforced by most providers.
pub const PROVIDER_MAX_BLOCK_RANGE: u64 = 100;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name for this indexer (used for checkpoint keys).
    pub id: String,
    /// Chain slug (e.g. `"base"`).
    pub chain: String,
    /// Address of the indexed contract.
    pub contract_address: String,
    /// First block of the historical catch-up.
    pub start_block: u64,
    /// Blocks per `eth_getLogs` query. Kept below the provider limit.
    pub batch_size: u64,
    /// Live polling interval (milliseconds).
    pub poll_interval_ms: u64,
    /// Rank ids to load into the reference cache. The last one is the
    /// penalty rank.
    pub rank_ids: Vec<u8>,
    /// Canonical event and function signatures of the deployed contract.
    pub events: EventAbi,
    pub rate_limit: RateLimitSettings,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "sbtindex".into(),
            chain: "ethereum".into(),
            contract_address: String::new(),
            start_block: 0,
            batch_size: 90,
            poll_interval_ms: 15_000,
            rank_ids: vec![0, 1, 2, 3, 4],
            events: EventAbi::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl IndexerConfig {
    /// Check the invariants the drivers rely on.
    pub fn validate(&self) -> Result<(), IndexerError> {
        let addr = self.contract_address.strip_prefix("0x").unwrap_or("");
        if addr.len() != 40 || !addr.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IndexerError::Config(format!(
                "contract_address must be a 0x-prefixed 20-byte hex address, got '{}'",
                self.contract_address
            )));
        }
        if self.batch_size == 0 || self.batch_size > PROVIDER_MAX_BLOCK_RANGE {
            return Err(IndexerError::Config(format!(
                "batch_size must be in 1..={PROVIDER_MAX_BLOCK_RANGE}, got {}",
                self.batch_size
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(IndexerError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.rank_ids.is_empty() {
            return Err(IndexerError::Config("rank_ids must not be empty".into()));
        }
        self.rate_limit.validate()
    }

    /// Lowercase contract address, as used in store keys.
    pub fn contract_key(&self) -> String {
        self.contract_address.to_ascii_lowercase()
    }
}

/// Canonical ABI signatures, with `indexed` markers on event parameters.
///
/// Event names may differ per deployment; the parameter types may not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventAbi {
    pub reveal: String,
    pub transfer: String,
    pub collect: String,
    /// View function returning `(uint256 S, uint256 T)` for a rank id.
    pub rank_constants: String,
}

impl Default for EventAbi {
    fn default() -> Self {
        Self {
            reveal: "Revealed(address indexed owner, uint256 indexed tokenId, uint8 rank, string tokenURI)"
                .into(),
            transfer: "Transfer(address indexed from, address indexed to, uint256 indexed tokenId)"
                .into(),
            collect: "Collected(address indexed owner, uint256 indexed tokenId, uint256 amount)"
                .into(),
            rank_constants: "rankConstants(uint8)".into(),
        }
    }
}

/// Provider quota settings for the fetch client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Requests available per refill window.
    pub reservoir: u32,
    /// Window after which the reservoir is refilled to full (milliseconds).
    pub refill_interval_ms: u64,
    /// Maximum requests in flight.
    pub max_concurrent: usize,
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    /// Upper bound for any single sleep, including provider reset hints.
    pub max_backoff_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            reservoir: 25,
            refill_interval_ms: 1_000,
            max_concurrent: 1,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
        }
    }
}

impl RateLimitSettings {
    fn validate(&self) -> Result<(), IndexerError> {
        if self.reservoir == 0 || self.max_concurrent == 0 || self.max_attempts == 0 {
            return Err(IndexerError::Config(
                "rate_limit.reservoir, max_concurrent and max_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }
}
