//! sbtindex-evm: decoding, projection and the index drivers.

pub mod builder;
pub mod events;
pub mod fetcher;
pub mod index_loop;
pub mod projector;

pub use builder::IndexerBuilder;
pub use events::{ContractEvent, EventKind, SignatureTable};
pub use fetcher::{policy_configs, ContractReader, FetchOutcome, LogFetcher, RawLog, RpcContractReader};
pub use index_loop::{BatchOutcome, CatchUpOutcome, Indexer, TickOutcome};
pub use projector::{Projection, Projector};
