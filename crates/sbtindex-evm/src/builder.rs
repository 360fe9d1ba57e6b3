//! Fluent builder API for creating indexers.
//!
//! # Example
//!
//! ```rust,no_run
//! use sbtindex_evm::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .chain("base")
//!     .contract("0x5FbDB2315678afecb367f032d93F642f64180aa3")
//!     .start_block(19_000_000)
//!     .batch_size(90)
//!     .build_config();
//! ```

use std::sync::Arc;

use sbtindex_core::checkpoint::{CheckpointManager, CheckpointStore};
use sbtindex_core::config::{EventAbi, IndexerConfig, RateLimitSettings};
use sbtindex_core::error::IndexerError;
use sbtindex_core::store::TokenStore;

use crate::fetcher::ContractReader;
use crate::index_loop::Indexer;

/// Fluent builder for `IndexerConfig` and `Indexer`.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration (e.g. one read from a file).
    pub fn from_config(config: IndexerConfig) -> Self {
        Self {
            config,
            checkpoints: None,
        }
    }

    /// Set the indexer ID (used for checkpoint keys).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Set the indexed contract address.
    pub fn contract(mut self, address: impl Into<String>) -> Self {
        self.config.contract_address = address.into();
        self
    }

    /// Set the first block of the historical catch-up.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Set the number of blocks per `eth_getLogs` batch.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set live mode polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn rank_ids(mut self, ids: impl Into<Vec<u8>>) -> Self {
        self.config.rank_ids = ids.into();
        self
    }

    pub fn events(mut self, events: EventAbi) -> Self {
        self.config.events = events;
        self
    }

    pub fn rate_limit(mut self, settings: RateLimitSettings) -> Self {
        self.config.rate_limit = settings;
        self
    }

    /// Persist the watermark in `store` and resume from it on start.
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Validate the configuration and build an `Indexer`.
    pub fn build<R, S>(self, reader: Arc<R>, store: Arc<S>) -> Result<Indexer<R, S>, IndexerError>
    where
        R: ContractReader + 'static,
        S: TokenStore + 'static,
    {
        let checkpoint = self
            .checkpoints
            .map(|cps| CheckpointManager::new(cps, &self.config.chain, &self.config.id));
        let indexer = Indexer::new(self.config, reader, store)?;
        Ok(match checkpoint {
            Some(manager) => indexer.with_checkpoint(manager),
            None => indexer,
        })
    }
}
