//! sbtindex-core: foundation for the SBT ownership and score indexer.
//!
//! # Architecture
//!
//! ```text
//! Indexer (sbtindex-evm)
//!     ├── RankCache        (rank → accrual constants, loaded before scoring events)
//!     ├── IndexerState     (watermark, driver flag, retry range)
//!     ├── CheckpointStore  (persisted resume block)
//!     └── TokenStore       (keyed upserts for tokens and users)
//!
//! score::score(token, now, ranks)   ← pure read path used by query layers
//! ```

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod score;
pub mod state;
pub mod store;
pub mod types;

pub use cache::{InitReport, RankCache, RankSource, RankTable};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore};
pub use config::{EventAbi, IndexerConfig, RateLimitSettings};
pub use error::IndexerError;
pub use state::{IndexerState, RunGuard};
pub use store::TokenStore;
pub use types::{BlockRange, RankConstant, Token, TokenKey, User};
