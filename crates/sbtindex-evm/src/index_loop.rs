//! The index drivers: historical catch-up and the live poller.
//!
//! # Catch-up
//! Walk `[resume, head]` in batches of `batch_size` blocks. For each batch,
//! fetch and apply every kind in order Reveal → Transfer → Collect, then save
//! a checkpoint. The sampled head becomes the watermark.
//!
//! # Live
//! Every `poll_interval_ms`: re-apply any outstanding retry range, then walk
//! `(watermark, head]` the same way and advance the watermark.
//!
//! Catch-up and the tick share one run guard, so they never apply ranges at
//! the same time. Blocks after a failed batch are never applied before it. A
//! failed batch turns the rest of its range into the retry range.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use sbtindex_core::cache::{InitReport, RankCache};
use sbtindex_core::checkpoint::CheckpointManager;
use sbtindex_core::config::IndexerConfig;
use sbtindex_core::error::IndexerError;
use sbtindex_core::state::IndexerState;
use sbtindex_core::store::TokenStore;
use sbtindex_core::types::BlockRange;

use crate::events::{EventKind, SignatureTable};
use crate::fetcher::{ContractReader, FetchOutcome, LogFetcher};
use crate::projector::{Projection, Projector};

/// Result of applying a block range.
#[derive(Debug)]
pub enum BatchOutcome {
    /// Every block through `through` is applied.
    Applied { through: u64 },
    /// Blocks before `retry.from` are applied (`applied_through` is the last
    /// batch end, if any); `retry` must be applied before anything newer.
    Partial {
        applied_through: Option<u64>,
        retry: BlockRange,
    },
    /// Nothing was applied.
    Fatal(IndexerError),
}

/// Result of [`Indexer::catch_up`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpOutcome {
    /// Another catch-up holds the guard.
    AlreadyRunning,
    /// The resume block is already past the head.
    UpToDate { head: u64 },
    Completed { range: BlockRange },
    /// Part of `range` is left in the retry range.
    Partial { range: BlockRange, retry: BlockRange },
}

/// Result of one [`Indexer::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A catch-up is running.
    Skipped,
    /// Backfill had not sampled a head yet, so the tick ran catch-up.
    CaughtUp(CatchUpOutcome),
    /// No watermark existed; it is now `head`.
    Initialized { head: u64 },
    Idle { head: u64 },
    Advanced { range: BlockRange },
    /// A retry range is still outstanding.
    Partial { retry: BlockRange },
}

/// One indexer for one contract.
pub struct Indexer<R, S> {
    config: IndexerConfig,
    reader: Arc<R>,
    store: Arc<S>,
    cache: RankCache,
    fetcher: LogFetcher<R>,
    projector: Projector<S, R>,
    checkpoint: Option<CheckpointManager>,
    state: IndexerState,
}

impl<R, S> Indexer<R, S>
where
    R: ContractReader + 'static,
    S: TokenStore + 'static,
{
    pub fn new(config: IndexerConfig, reader: Arc<R>, store: Arc<S>) -> Result<Self, IndexerError> {
        config.validate()?;
        let table = SignatureTable::from_abi(&config.events)?;
        let contract = config.contract_key();
        let cache = RankCache::new();
        Ok(Self {
            fetcher: LogFetcher::new(reader.clone(), contract.clone(), config.batch_size),
            projector: Projector::new(store.clone(), reader.clone(), cache.clone(), table, contract),
            cache,
            reader,
            store,
            checkpoint: None,
            state: IndexerState::new(),
            config,
        })
    }

    /// Persist progress through `checkpoint` and resume from it.
    pub fn with_checkpoint(mut self, checkpoint: CheckpointManager) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn state(&self) -> &IndexerState {
        &self.state
    }

    pub fn cache(&self) -> &RankCache {
        &self.cache
    }

    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ─── Reference data ──────────────────────────────────────────────────────

    /// Load rank constants. When the cache comes up ready, repair tokens
    /// projected while it was not.
    pub async fn init_reference_data(&self) -> InitReport {
        let report = self
            .cache
            .initialize(self.reader.as_ref(), &self.config.rank_ids)
            .await;
        if report.is_ready() {
            if let Err(e) = self.repair_stale_tokens().await {
                tracing::warn!(error = %e, "stale token repair failed");
            }
        } else {
            tracing::warn!(
                failed = report.failed.len(),
                "rank cache not ready, new tokens will accrue nothing until it is"
            );
        }
        report
    }

    /// Recompute expiration and rate for tokens minted without known
    /// constants. Returns the number of tokens repaired.
    pub async fn repair_stale_tokens(&self) -> Result<usize, IndexerError> {
        if !self.cache.is_ready() {
            return Ok(0);
        }
        let mut repaired = 0;
        for token in self.store.stale_tokens(&self.config.contract_key()).await? {
            let Some(rank) = self.cache.lookup(token.rank) else {
                continue;
            };
            if rank.lifetime_seconds <= 0 {
                continue;
            }
            let expiration = token.mint_timestamp + chrono::Duration::seconds(rank.lifetime_seconds);
            if self
                .store
                .update_lifetime(&token.key(), expiration, rank.score_per_second())
                .await?
            {
                repaired += 1;
            }
        }
        if repaired > 0 {
            tracing::info!(repaired, "stale tokens repaired");
        }
        Ok(repaired)
    }

    // ─── Catch-up ────────────────────────────────────────────────────────────

    /// Replay history from the resume block to the current head.
    ///
    /// Returns [`CatchUpOutcome::AlreadyRunning`] without doing anything if
    /// another catch-up or a tick is in progress.
    pub async fn catch_up(&self) -> Result<CatchUpOutcome, IndexerError> {
        let Some(_guard) = self.state.try_begin_run() else {
            tracing::debug!("catch-up skipped, indexer busy");
            return Ok(CatchUpOutcome::AlreadyRunning);
        };
        self.catch_up_claimed().await
    }

    /// Catch-up body. The caller holds the run guard.
    async fn catch_up_claimed(&self) -> Result<CatchUpOutcome, IndexerError> {
        if !self.cache.is_ready() {
            self.init_reference_data().await;
        }

        let start = self.resume_start().await?;
        let head = self.reader.block_number().await?;
        self.state.mark_backfilled();

        if start > head {
            self.state.advance_to(start - 1);
            tracing::info!(start, head, "catch-up: already up to date");
            return Ok(CatchUpOutcome::UpToDate { head });
        }

        let range = BlockRange::new(start, head);
        tracing::info!(from = start, to = head, "starting catch-up");
        let outcome = self.process_range(range).await;
        self.state.advance_to(head);

        match outcome {
            BatchOutcome::Applied { .. } => {
                if let Some(retry) = self.state.retry_range() {
                    if range.from <= retry.from && retry.to <= range.to {
                        self.state.clear_retry();
                        tracing::debug!(%retry, "retry range covered by catch-up");
                    }
                }
                tracing::info!(at = head, "catch-up complete");
                Ok(CatchUpOutcome::Completed { range })
            }
            BatchOutcome::Partial { retry, .. } => {
                self.state.schedule_retry(retry);
                tracing::warn!(%retry, "catch-up incomplete, range scheduled for retry");
                Ok(CatchUpOutcome::Partial { range, retry })
            }
            BatchOutcome::Fatal(e) => {
                self.state.schedule_retry(range);
                tracing::error!(error = %e, %range, "catch-up failed, range scheduled for retry");
                Ok(CatchUpOutcome::Partial { range, retry: range })
            }
        }
    }

    /// First block not yet applied: the latest of the configured start, the
    /// checkpoint and the in-memory watermark.
    async fn resume_start(&self) -> Result<u64, IndexerError> {
        let mut start = self.config.start_block;
        if let Some(manager) = &self.checkpoint {
            if let Some(cp) = manager.load().await? {
                tracing::info!(block = cp.block_number, "resuming from checkpoint");
                start = start.max(cp.block_number + 1);
            }
        }
        if let Some(last) = self.state.resume_block() {
            start = start.max(last + 1);
        }
        Ok(start)
    }

    // ─── Live ────────────────────────────────────────────────────────────────

    /// One poll. Errors leave the watermark where it was.
    pub async fn tick(&self) -> Result<TickOutcome, IndexerError> {
        let Some(_guard) = self.state.try_begin_run() else {
            return Ok(TickOutcome::Skipped);
        };
        if !self.cache.is_ready() {
            self.init_reference_data().await;
        }
        if !self.state.is_backfilled() {
            return Ok(TickOutcome::CaughtUp(self.catch_up_claimed().await?));
        }

        let head = self.reader.block_number().await?;

        if let Some(retry) = self.state.retry_range() {
            tracing::info!(%retry, "re-applying retry range");
            match self.process_range(retry).await {
                BatchOutcome::Applied { .. } => self.state.clear_retry(),
                BatchOutcome::Partial { retry: rest, .. } => {
                    self.state.clear_retry();
                    self.state.schedule_retry(rest);
                    return Ok(TickOutcome::Partial { retry: rest });
                }
                BatchOutcome::Fatal(e) => return Err(e),
            }
        }

        // Catch-up sets the watermark whenever it marks the backfill, so this
        // only triggers if the backfill flag was set by other means.
        let Some(last) = self.state.last_processed_block() else {
            self.state.advance_to(head);
            tracing::info!(head, "watermark initialized");
            return Ok(TickOutcome::Initialized { head });
        };
        if head <= last {
            return Ok(TickOutcome::Idle { head });
        }

        let gap = BlockRange::new(last + 1, head);
        match self.process_range(gap).await {
            BatchOutcome::Applied { .. } => {
                self.state.advance_to(head);
                tracing::debug!(from = gap.from, to = gap.to, "watermark advanced");
                Ok(TickOutcome::Advanced { range: gap })
            }
            BatchOutcome::Partial { retry, .. } => {
                self.state.schedule_retry(retry);
                self.state.advance_to(head);
                tracing::warn!(%retry, "tick incomplete, range scheduled for retry");
                Ok(TickOutcome::Partial { retry })
            }
            BatchOutcome::Fatal(e) => Err(e),
        }
    }

    /// Initialize the cache, start catch-up in the background and poll until
    /// `shutdown` resolves.
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> Result<(), IndexerError>
    where
        F: Future<Output = ()> + Send,
    {
        self.init_reference_data().await;

        let catch_up = {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                match this.catch_up().await {
                    Ok(outcome) => tracing::debug!(?outcome, "catch-up finished"),
                    Err(e) => tracing::error!(error = %e, "catch-up failed"),
                }
            })
        };

        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; polling starts one interval in.
        interval.tick().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                _ = interval.tick() => match self.tick().await {
                    Ok(outcome) => tracing::debug!(?outcome, "tick"),
                    Err(e) => tracing::error!(error = %e, "tick failed"),
                },
            }
        }

        catch_up.abort();
        tracing::info!(
            last_block = ?self.state.last_processed_block(),
            "indexer stopped"
        );
        Ok(())
    }

    // ─── Range processing ────────────────────────────────────────────────────

    /// Apply `range` batch by batch, stopping at the first batch that fails.
    pub async fn process_range(&self, range: BlockRange) -> BatchOutcome {
        let mut applied_through = None;
        for batch in range.batches(self.config.batch_size) {
            match self.process_batch(batch).await {
                BatchOutcome::Applied { through } => {
                    applied_through = Some(through);
                    self.save_checkpoint(through).await;
                }
                BatchOutcome::Partial { retry, .. } => {
                    return BatchOutcome::Partial {
                        applied_through,
                        retry: BlockRange::new(retry.from, range.to),
                    };
                }
                BatchOutcome::Fatal(e) if applied_through.is_some() => {
                    tracing::error!(error = %e, from = batch.from, to = batch.to, "batch failed");
                    return BatchOutcome::Partial {
                        applied_through,
                        retry: BlockRange::new(batch.from, range.to),
                    };
                }
                fatal @ BatchOutcome::Fatal(_) => return fatal,
            }
        }
        BatchOutcome::Applied { through: range.to }
    }

    /// Fetch and apply one batch, kind by kind.
    ///
    /// A kind whose fetch is abandoned, or a transient failure while
    /// applying, makes the whole batch partial. Handlers are idempotent so
    /// the kinds already applied are simply applied again on retry. Other
    /// per-log errors are logged and skipped.
    pub async fn process_batch(&self, batch: BlockRange) -> BatchOutcome {
        let mut applied = 0usize;
        for kind in EventKind::ALL {
            let topic0 = self.projector.table().topic0(kind);
            let logs = match self.fetcher.fetch(topic0, batch).await {
                Ok(FetchOutcome::Complete(logs)) => logs,
                Ok(FetchOutcome::Abandoned { reason, .. }) => {
                    tracing::warn!(%kind, %batch, reason = %reason, "batch abandoned");
                    return BatchOutcome::Partial {
                        applied_through: None,
                        retry: batch,
                    };
                }
                Err(e) => return BatchOutcome::Fatal(e),
            };

            for log in &logs {
                match self.projector.apply(log).await {
                    Ok(Projection::Skipped) => {}
                    Ok(_) => applied += 1,
                    Err(e) if e.is_transient() => {
                        tracing::warn!(%kind, %batch, error = %e, "transient failure while applying batch");
                        return BatchOutcome::Partial {
                            applied_through: None,
                            retry: batch,
                        };
                    }
                    Err(e) => tracing::warn!(
                        %kind,
                        block = %log.block_number,
                        log_index = %log.log_index,
                        tx = %log.tx_hash,
                        error = %e,
                        "log skipped"
                    ),
                }
            }
        }
        tracing::info!(from = batch.from, to = batch.to, applied, "batch applied");
        BatchOutcome::Applied { through: batch.to }
    }

    async fn save_checkpoint(&self, through: u64) {
        if let Some(manager) = &self.checkpoint {
            if let Err(e) = manager.save(through).await {
                tracing::warn!(error = %e, block = through, "checkpoint save failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::RawLog;
    use async_trait::async_trait;
    use sbtindex_core::cache::RankSource;
    use sbtindex_core::types::RankConstant;
    use sbtindex_storage::InMemoryStorage;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// A chain with no events and a movable head. Every `get_logs` yields
    /// once so concurrent drivers interleave.
    struct Empty {
        head: AtomicU64,
        log_queries: Mutex<Vec<u64>>,
    }

    impl Empty {
        fn new(head: u64) -> Self {
            Self {
                head: AtomicU64::new(head),
                log_queries: Mutex::new(Vec::new()),
            }
        }

        fn queries_from(&self, from: u64) -> usize {
            self.log_queries.lock().unwrap().iter().filter(|&&f| f == from).count()
        }
    }

    #[async_trait]
    impl RankSource for Empty {
        async fn rank_constant(&self, rank_id: u8) -> Result<Option<RankConstant>, IndexerError> {
            Ok(Some(RankConstant {
                rank_id,
                total_points: 1,
                lifetime_seconds: 1,
            }))
        }
    }

    #[async_trait]
    impl ContractReader for Empty {
        async fn block_number(&self) -> Result<u64, IndexerError> {
            Ok(self.head.load(Ordering::SeqCst))
        }
        async fn block_timestamp(&self, _: &str) -> Result<i64, IndexerError> {
            Ok(0)
        }
        async fn get_logs(&self, _: &str, _: &str, from: u64, _: u64) -> Result<Vec<RawLog>, IndexerError> {
            self.log_queries.lock().unwrap().push(from);
            tokio::task::yield_now().await;
            Ok(vec![])
        }
    }

    fn indexer(head: u64) -> Indexer<Empty, InMemoryStorage> {
        let config = IndexerConfig {
            contract_address: "0x5fbdb2315678afecb367f032d93f642f64180aa3".into(),
            start_block: 10,
            ..Default::default()
        };
        Indexer::new(
            config,
            Arc::new(Empty::new(head)),
            Arc::new(InMemoryStorage::new()),
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_rejected() {
        let result = Indexer::new(
            IndexerConfig::default(),
            Arc::new(Empty::new(0)),
            Arc::new(InMemoryStorage::new()),
        );
        assert!(matches!(result, Err(IndexerError::Config(_))));
    }

    #[tokio::test]
    async fn overlapping_catch_up_returns_immediately() {
        let idx = indexer(100);
        let _guard = idx.state().try_begin_run().unwrap();
        assert_eq!(idx.catch_up().await.unwrap(), CatchUpOutcome::AlreadyRunning);
        assert_eq!(idx.tick().await.unwrap(), TickOutcome::Skipped);
    }

    #[tokio::test]
    async fn catch_up_then_tick() {
        let idx = indexer(100);
        assert_eq!(
            idx.catch_up().await.unwrap(),
            CatchUpOutcome::Completed {
                range: BlockRange::new(10, 100)
            }
        );
        assert_eq!(idx.state().last_processed_block(), Some(100));
        assert!(!idx.state().is_running());

        assert_eq!(idx.tick().await.unwrap(), TickOutcome::Idle { head: 100 });
        idx.reader.head.store(130, Ordering::SeqCst);
        assert_eq!(
            idx.tick().await.unwrap(),
            TickOutcome::Advanced {
                range: BlockRange::new(101, 130)
            }
        );
        assert_eq!(idx.state().last_processed_block(), Some(130));
    }

    #[tokio::test]
    async fn start_block_after_head_is_up_to_date() {
        let idx = indexer(5);
        assert_eq!(idx.catch_up().await.unwrap(), CatchUpOutcome::UpToDate { head: 5 });
        assert_eq!(idx.state().last_processed_block(), Some(9));
    }

    #[tokio::test]
    async fn first_tick_runs_catch_up() {
        let idx = indexer(50);
        match idx.tick().await.unwrap() {
            TickOutcome::CaughtUp(CatchUpOutcome::Completed { range }) => {
                assert_eq!(range, BlockRange::new(10, 50))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(idx.state().is_backfilled());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let config = IndexerConfig {
            contract_address: "0x5fbdb2315678afecb367f032d93f642f64180aa3".into(),
            poll_interval_ms: 5,
            ..Default::default()
        };
        let reader = Arc::new(Empty::new(20));
        let idx = Arc::new(Indexer::new(config, reader, Arc::new(InMemoryStorage::new())).unwrap());
        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        idx.clone().run(shutdown).await.unwrap();
        assert_eq!(idx.state().last_processed_block(), Some(20));
        assert!(idx.cache().is_ready());
    }

    #[tokio::test]
    async fn tick_and_catch_up_never_overlap() {
        let idx = indexer(100);
        idx.catch_up().await.unwrap();
        idx.reader.head.store(150, Ordering::SeqCst);

        let (tick, catch_up) = tokio::join!(idx.tick(), idx.catch_up());
        assert_eq!(
            tick.unwrap(),
            TickOutcome::Advanced {
                range: BlockRange::new(101, 150)
            }
        );
        assert_eq!(catch_up.unwrap(), CatchUpOutcome::AlreadyRunning);
        // One query per event kind, from a single driver.
        assert_eq!(idx.reader.queries_from(101), 3);

        idx.reader.head.store(200, Ordering::SeqCst);
        let (catch_up, tick) = tokio::join!(idx.catch_up(), idx.tick());
        assert_eq!(
            catch_up.unwrap(),
            CatchUpOutcome::Completed {
                range: BlockRange::new(151, 200)
            }
        );
        assert_eq!(tick.unwrap(), TickOutcome::Skipped);
        assert_eq!(idx.reader.queries_from(151), 3);
        assert!(!idx.state().is_running());
    }

    #[tokio::test]
    async fn backfilled_without_watermark_initializes_at_head() {
        let idx = indexer(100);
        idx.state().mark_backfilled();
        assert_eq!(idx.tick().await.unwrap(), TickOutcome::Initialized { head: 100 });
        assert_eq!(idx.state().last_processed_block(), Some(100));
        assert!(idx.reader.log_queries.lock().unwrap().is_empty());
        assert_eq!(idx.tick().await.unwrap(), TickOutcome::Idle { head: 100 });
    }

    #[tokio::test]
    async fn catch_up_over_retry_range_clears_it() {
        let idx = indexer(100);
        idx.catch_up().await.unwrap();
        idx.state().schedule_retry(BlockRange::new(40, 100));

        assert_eq!(
            idx.catch_up().await.unwrap(),
            CatchUpOutcome::Completed {
                range: BlockRange::new(40, 100)
            }
        );
        assert_eq!(idx.state().retry_range(), None);

        let before = idx.reader.log_queries.lock().unwrap().len();
        assert_eq!(idx.tick().await.unwrap(), TickOutcome::Idle { head: 100 });
        assert_eq!(idx.reader.log_queries.lock().unwrap().len(), before);
    }
}
