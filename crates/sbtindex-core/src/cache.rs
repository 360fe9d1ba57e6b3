//! Reference data cache: per-rank accrual constants.
//!
//! The cache is filled once from the contract before any score-affecting
//! event is projected. A missing rank is a valid state: callers treat it as
//! "rate unknown, accrue nothing" rather than as an error.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::IndexerError;
use crate::types::RankConstant;

/// Source of rank constants (the contract, or a fixture in tests).
#[async_trait]
pub trait RankSource: Send + Sync {
    /// `Ok(None)` means the contract has no constants for this rank.
    async fn rank_constant(&self, rank_id: u8) -> Result<Option<RankConstant>, IndexerError>;
}

/// Immutable view of the cache used by the score calculator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankTable {
    entries: HashMap<u8, RankConstant>,
}

impl RankTable {
    pub fn get(&self, rank_id: u8) -> Option<&RankConstant> {
        self.entries.get(&rank_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<RankConstant> for RankTable {
    fn from_iter<I: IntoIterator<Item = RankConstant>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|rc| (rc.rank_id, rc)).collect(),
        }
    }
}

/// Result of one initialization pass.
#[derive(Debug, Default)]
pub struct InitReport {
    pub loaded: Vec<u8>,
    pub absent: Vec<u8>,
    /// Ranks whose fetch failed, with the reason.
    pub failed: Vec<(u8, String)>,
}

impl InitReport {
    pub fn is_ready(&self) -> bool {
        !self.loaded.is_empty()
    }
}

#[derive(Default)]
struct CacheInner {
    table: RankTable,
    ready: bool,
}

/// Thread-safe rank constant cache. Cheap to clone (shared state).
#[derive(Clone, Default)]
pub struct RankCache {
    inner: Arc<RwLock<CacheInner>>,
}

impl RankCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)load constants for `rank_ids`, replacing all prior entries.
    ///
    /// Each rank is fetched independently; a failure is logged and recorded
    /// in the report without aborting the others. The cache is ready only if
    /// at least one rank loaded.
    pub async fn initialize(&self, source: &dyn RankSource, rank_ids: &[u8]) -> InitReport {
        {
            let mut inner = self.inner.write().unwrap();
            inner.table = RankTable::default();
            inner.ready = false;
        }

        let results = join_all(
            rank_ids
                .iter()
                .map(|&rank_id| async move { (rank_id, source.rank_constant(rank_id).await) }),
        )
        .await;

        let mut report = InitReport::default();
        let mut loaded = Vec::new();
        for (rank_id, result) in results {
            match result {
                Ok(Some(rc)) => {
                    report.loaded.push(rank_id);
                    loaded.push(RankConstant { rank_id, ..rc });
                }
                Ok(None) => report.absent.push(rank_id),
                Err(e) => {
                    tracing::warn!(rank_id, error = %e, "failed to load rank constant");
                    report.failed.push((rank_id, e.to_string()));
                }
            }
        }

        let mut inner = self.inner.write().unwrap();
        inner.ready = report.is_ready();
        if inner.ready {
            inner.table = loaded.into_iter().collect();
        }
        tracing::info!(
            loaded = report.loaded.len(),
            absent = report.absent.len(),
            failed = report.failed.len(),
            ready = inner.ready,
            "rank cache initialized"
        );
        report
    }

    pub fn lookup(&self, rank_id: u8) -> Option<RankConstant> {
        self.inner.read().unwrap().table.get(rank_id).copied()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.read().unwrap().ready
    }

    pub fn snapshot(&self) -> RankTable {
        self.inner.read().unwrap().table.clone()
    }
}

impl std::fmt::Debug for RankCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("RankCache")
            .field("ready", &inner.ready)
            .field("ranks", &inner.table.len())
            .finish()
    }
}
