//! Runtime state of one indexer instance.
//!
//! Holds the live watermark, the driver guard flag and the outstanding
//! retry range. Owned by a single `Indexer`; nothing here is global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::types::BlockRange;

#[derive(Debug, Default, Clone, Copy)]
struct Watermark {
    last_processed_block: Option<u64>,
    /// A range left behind by an abandoned or failed batch. Blocks after it
    /// are not applied until it has been.
    retry: Option<BlockRange>,
    /// Set once catch-up has sampled a head and scheduled the whole history.
    backfilled: bool,
}

/// Shared, thread-safe indexer state.
#[derive(Debug, Default)]
pub struct IndexerState {
    /// Set while catch-up or a tick is applying ranges.
    running: AtomicBool,
    watermark: Mutex<Watermark>,
}

impl IndexerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the driver slot shared by catch-up and the live tick. Returns
    /// `None` if either is already running.
    pub fn try_begin_run(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { state: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_processed_block(&self) -> Option<u64> {
        self.watermark.lock().unwrap().last_processed_block
    }

    /// Move the watermark forward. Never moves it backwards.
    pub fn advance_to(&self, block: u64) {
        let mut wm = self.watermark.lock().unwrap();
        wm.last_processed_block = Some(wm.last_processed_block.map_or(block, |b| b.max(block)));
    }

    pub fn is_backfilled(&self) -> bool {
        self.watermark.lock().unwrap().backfilled
    }

    pub fn mark_backfilled(&self) {
        self.watermark.lock().unwrap().backfilled = true;
    }

    pub fn retry_range(&self) -> Option<BlockRange> {
        self.watermark.lock().unwrap().retry
    }

    /// Record a range that must be re-applied. Merges with any range already
    /// outstanding so the earliest unapplied block is never lost.
    pub fn schedule_retry(&self, range: BlockRange) {
        let mut wm = self.watermark.lock().unwrap();
        wm.retry = Some(match wm.retry {
            Some(existing) => BlockRange::new(
                existing.from.min(range.from),
                existing.to.max(range.to),
            ),
            None => range,
        });
    }

    pub fn clear_retry(&self) {
        self.watermark.lock().unwrap().retry = None;
    }

    /// The last block that is safe to resume after a restart: the block
    /// before the outstanding retry range, else the watermark.
    pub fn resume_block(&self) -> Option<u64> {
        let wm = self.watermark.lock().unwrap();
        match wm.retry {
            Some(range) => range.from.checked_sub(1),
            None => wm.last_processed_block,
        }
    }
}

/// RAII guard for a running catch-up or tick. Releases the flag on drop,
/// including when the driver future is cancelled.
#[derive(Debug)]
pub struct RunGuard<'a> {
    state: &'a IndexerState,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
    }
}
