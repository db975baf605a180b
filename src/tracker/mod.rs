//! Chain tracker: a background follower of the upstream chain.
//!
//! The tracker polls a [`ChainFetcher`] at a fraction of the chain's average
//! block time and maintains a sliding window of the most recent
//! `{height, hash}` pairs. It provides:
//!
//! - the latest known block height, readable without blocking,
//! - finalization-aware hash ranges resolved from latest-relative arguments,
//! - notifications on new heights and on forks (a hash change at a height
//!   that was previously recorded).

mod fetcher;

pub use fetcher::ChainFetcher;

use crate::error::{Error, Result};
use crate::types::{latest_arg_to_block_num, BlockStore, NOT_APPLICABLE};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked with the latest block height.
pub type BlockCallback = Arc<dyn Fn(i64) + Send + Sync>;

/// Configuration for the chain tracker.
#[derive(Clone)]
pub struct ChainTrackerConfig {
    /// Window size: how many recent block hashes to keep.
    pub blocks_to_save: u64,
    /// Average block time of the tracked chain.
    pub average_block_time: Duration,
    /// Poll frequency multiplier over the block time.
    pub polls_per_block: u64,
    /// Fetch retries per poll iteration before giving up on it.
    pub fetch_retries: u32,
    /// Invoked after the window advanced to a new latest block.
    pub on_new_block: Option<BlockCallback>,
    /// Invoked exactly once per detected fork.
    pub on_fork: Option<BlockCallback>,
}

impl ChainTrackerConfig {
    /// The interval between polls.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.average_block_time / u32::try_from(self.polls_per_block.max(1)).unwrap_or(1)
    }
}

impl std::fmt::Debug for ChainTrackerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainTrackerConfig")
            .field("blocks_to_save", &self.blocks_to_save)
            .field("average_block_time", &self.average_block_time)
            .field("polls_per_block", &self.polls_per_block)
            .field("fetch_retries", &self.fetch_retries)
            .field("on_new_block", &self.on_new_block.is_some())
            .field("on_fork", &self.on_fork.is_some())
            .finish()
    }
}

/// Tracks the head of an upstream chain and a window of recent hashes.
pub struct ChainTracker {
    fetcher: Arc<dyn ChainFetcher>,
    config: ChainTrackerConfig,
    /// Latest observed height, readable without taking the window lock.
    latest_block: AtomicI64,
    /// Recent blocks, oldest first, contiguous heights.
    window: RwLock<VecDeque<BlockStore>>,
}

impl ChainTracker {
    /// Create a tracker. Call [`ChainTracker::start`] to populate the window
    /// and begin polling.
    #[must_use]
    pub fn new(fetcher: Arc<dyn ChainFetcher>, config: ChainTrackerConfig) -> Arc<Self> {
        Arc::new(Self {
            fetcher,
            config,
            latest_block: AtomicI64::new(0),
            window: RwLock::new(VecDeque::new()),
        })
    }

    /// The latest observed block height. Never blocks.
    #[must_use]
    pub fn get_latest_block_num(&self) -> i64 {
        self.latest_block.load(Ordering::Acquire)
    }

    /// Populate the window from the upstream node and spawn the poll loop.
    ///
    /// The loop stops when `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FailedToFetchLatestBlock`] when the initial fetch
    /// fails after the configured retries; once started, the loop never
    /// surfaces fetch errors to callers.
    pub async fn start(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>> {
        self.populate_initial_window().await?;
        info!(
            latest = self.get_latest_block_num(),
            window = self.window.read().len(),
            "chain tracker initialized"
        );

        let tracker = Arc::clone(self);
        let interval = self.config.poll_interval();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        // A dropped sender counts as shutdown.
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("chain tracker shutting down");
                            return;
                        }
                    }
                }
                if let Err(e) = tracker.poll_once().await {
                    warn!("chain tracker poll failed: {e}");
                }
            }
        });
        Ok(handle)
    }

    /// Resolve latest-relative arguments and return the requested hashes.
    ///
    /// `from_arg`/`to_arg` select the half-open range `[from, to)` of window
    /// entries; `NOT_APPLICABLE` skips the range. `specific_arg` selects one
    /// additional block, merged into the result in ascending height order
    /// when distinct from the range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockOutsideWindow`] when any requested height is not
    /// in the maintained window.
    pub fn get_latest_block_data(
        &self,
        from_arg: i64,
        to_arg: i64,
        specific_arg: i64,
    ) -> Result<(i64, Vec<BlockStore>)> {
        let latest = self.get_latest_block_num();
        let window = self.window.read();

        let (window_from, window_to) = match (window.front(), window.back()) {
            (Some(front), Some(back)) => (front.block, back.block),
            _ => {
                return Err(Error::FailedToFetchLatestBlock(
                    "tracker window is empty".to_string(),
                ))
            }
        };
        let in_window = |height: i64| -> Result<()> {
            if height < window_from || height > window_to {
                return Err(Error::BlockOutsideWindow {
                    requested: height,
                    from: window_from,
                    to: window_to,
                });
            }
            Ok(())
        };

        let range = if from_arg == NOT_APPLICABLE {
            None
        } else {
            let from = latest_arg_to_block_num(from_arg, latest);
            let to = if to_arg == NOT_APPLICABLE {
                from + 1
            } else {
                latest_arg_to_block_num(to_arg, latest)
            };
            in_window(from)?;
            if to > from {
                in_window(to - 1)?;
            }
            Some((from, to))
        };
        let specific = if specific_arg == NOT_APPLICABLE {
            None
        } else {
            let height = latest_arg_to_block_num(specific_arg, latest);
            in_window(height)?;
            Some(height)
        };

        let mut blocks = Vec::new();
        for entry in window.iter() {
            let in_range = range.is_some_and(|(from, to)| entry.block >= from && entry.block < to);
            let is_specific = specific == Some(entry.block);
            if in_range || is_specific {
                blocks.push(entry.clone());
            }
        }
        Ok((latest, blocks))
    }

    /// Fetch with bounded exponential backoff.
    async fn fetch_latest_with_retry(&self) -> Result<i64> {
        let mut backoff = Duration::from_millis(50);
        let mut last_err = None;
        for _ in 0..self.config.fetch_retries.max(1) {
            match self.fetcher.fetch_latest_block_num().await {
                Ok(latest) => return Ok(latest),
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(2));
                }
            }
        }
        Err(Error::FailedToFetchLatestBlock(
            last_err.map_or_else(|| "unknown".to_string(), |e| e.to_string()),
        ))
    }

    /// Fill the window backwards from the current head, best effort: heights
    /// the node already pruned are simply not stored.
    async fn populate_initial_window(&self) -> Result<()> {
        let latest = self.fetch_latest_with_retry().await?;
        let mut entries = VecDeque::new();
        let oldest = latest - i64::try_from(self.config.blocks_to_save).unwrap_or(i64::MAX) + 1;
        for height in oldest.max(0)..=latest {
            match self.fetcher.fetch_block_hash_by_num(height).await {
                Ok(hash) => entries.push_back(BlockStore {
                    block: height,
                    hash,
                }),
                Err(e) => {
                    debug!("initial window skips pruned block {height}: {e}");
                    entries.clear();
                }
            }
        }
        if entries.is_empty() {
            return Err(Error::FailedToFetchLatestBlock(format!(
                "no hashes available up to block {latest}"
            )));
        }
        *self.window.write() = entries;
        self.latest_block.store(latest, Ordering::Release);
        Ok(())
    }

    /// One poll iteration: detect advancement and forks, maintain the window.
    async fn poll_once(&self) -> Result<()> {
        let fetched = self.fetch_latest_with_retry().await?;
        let stored = self.get_latest_block_num();

        if fetched < stored {
            warn!(fetched, stored, "upstream reported an older latest block");
            return Ok(());
        }

        let mut forked = false;
        if fetched == stored {
            // No advance: re-check the tip hash to catch same-height forks.
            let tip_hash = self.fetcher.fetch_block_hash_by_num(stored).await?;
            let changed = {
                let window = self.window.read();
                window
                    .back()
                    .is_some_and(|entry| entry.block == stored && entry.hash != tip_hash)
            };
            if changed {
                forked = true;
                self.refetch_window().await;
            }
        } else {
            // Advance: verify the previous tip was not re-written underneath
            // the new blocks, then append the missing heights.
            let prev_tip_hash = self.fetcher.fetch_block_hash_by_num(stored).await.ok();
            let tip_changed = {
                let window = self.window.read();
                match (window.back(), prev_tip_hash.as_ref()) {
                    (Some(entry), Some(hash)) => entry.block == stored && entry.hash != *hash,
                    _ => false,
                }
            };
            if tip_changed {
                forked = true;
                self.refetch_window().await;
            }

            let mut fresh = Vec::new();
            for height in (stored + 1)..=fetched {
                let hash = self.fetcher.fetch_block_hash_by_num(height).await?;
                fresh.push(BlockStore {
                    block: height,
                    hash,
                });
            }
            {
                let mut window = self.window.write();
                for entry in fresh {
                    window.push_back(entry);
                }
                let keep = usize::try_from(self.config.blocks_to_save).unwrap_or(usize::MAX);
                while window.len() > keep {
                    window.pop_front();
                }
            }
            self.latest_block.store(fetched, Ordering::Release);
            debug!(latest = fetched, "chain tracker advanced");
            if let Some(cb) = &self.config.on_new_block {
                cb(fetched);
            }
        }

        if forked {
            info!(latest = fetched, "fork detected, window re-fetched");
            if let Some(cb) = &self.config.on_fork {
                cb(fetched);
            }
        }
        Ok(())
    }

    /// Re-fetch every hash in the window after a fork. Entries the upstream
    /// no longer serves are dropped.
    async fn refetch_window(&self) {
        let heights: Vec<i64> = self.window.read().iter().map(|e| e.block).collect();
        let mut refreshed = VecDeque::with_capacity(heights.len());
        for height in heights {
            match self.fetcher.fetch_block_hash_by_num(height).await {
                Ok(hash) => refreshed.push_back(BlockStore {
                    block: height,
                    hash,
                }),
                Err(e) => {
                    debug!("dropping pruned block {height} after fork: {e}");
                }
            }
        }
        *self.window.write() = refreshed;
    }
}

impl std::fmt::Debug for ChainTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainTracker")
            .field("latest_block", &self.get_latest_block_num())
            .field("window_len", &self.window.read().len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::LATEST_BLOCK;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    /// In-memory fetcher with controllable advancement, forks and pruning.
    struct MockChainFetcher {
        state: Mutex<MockState>,
    }

    struct MockState {
        latest_block: i64,
        block_hashes: Vec<BlockStore>,
        fork: String,
    }

    impl MockChainFetcher {
        fn new(start_block: i64, blocks_to_save: i64) -> Self {
            let mut state = MockState {
                latest_block: 0,
                block_hashes: Vec::new(),
                fork: String::new(),
            };
            for i in 0..blocks_to_save {
                state.latest_block = start_block + i;
                let hash = Self::hash_key(start_block + i, &state.fork);
                state.block_hashes.push(BlockStore {
                    block: start_block + i,
                    hash,
                });
            }
            Self {
                state: Mutex::new(state),
            }
        }

        fn hash_key(block: i64, fork: &str) -> String {
            format!("stub-hash-{block}{fork}")
        }

        fn is_correct_hash(&self, hash: &str, block: i64) -> bool {
            let state = self.state.lock();
            hash == Self::hash_key(block, &state.fork)
        }

        fn advance_block(&self) -> i64 {
            let mut state = self.state.lock();
            state.latest_block += 1;
            let hash = Self::hash_key(state.latest_block, &state.fork);
            let latest = state.latest_block;
            state.block_hashes.remove(0);
            state.block_hashes.push(BlockStore {
                block: latest,
                hash,
            });
            latest
        }

        fn fork(&self, fork: &str) {
            let mut state = self.state.lock();
            if state.fork == fork {
                return;
            }
            state.fork = fork.to_string();
            let fork = state.fork.clone();
            for entry in &mut state.block_hashes {
                entry.hash = Self::hash_key(entry.block, &fork);
            }
        }

        fn shrink(&self, new_size: usize) {
            let mut state = self.state.lock();
            let current = state.block_hashes.len();
            if current <= new_size {
                return;
            }
            state.block_hashes = state.block_hashes.split_off(current - new_size);
        }
    }

    #[async_trait]
    impl ChainFetcher for MockChainFetcher {
        async fn fetch_latest_block_num(&self) -> Result<i64> {
            Ok(self.state.lock().latest_block)
        }

        async fn fetch_block_hash_by_num(&self, block_num: i64) -> Result<String> {
            let state = self.state.lock();
            state
                .block_hashes
                .iter()
                .find(|entry| entry.block == block_num)
                .map(|entry| entry.hash.clone())
                .ok_or_else(|| Error::Upstream(format!("block {block_num} pruned")))
        }
    }

    fn test_config(blocks_to_save: u64) -> ChainTrackerConfig {
        ChainTrackerConfig {
            blocks_to_save,
            average_block_time: Duration::from_millis(8),
            polls_per_block: 4,
            fetch_retries: 1,
            on_new_block: None,
            on_fork: None,
        }
    }

    async fn wait_for_block(tracker: &ChainTracker, target: i64) {
        for _ in 0..100 {
            if tracker.get_latest_block_num() >= target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(4)).await;
        }
    }

    #[tokio::test]
    async fn test_tracks_advancing_chain() {
        let fetcher = Arc::new(MockChainFetcher::new(1000, 20));
        let mut latest = fetcher.advance_block();
        let tracker = ChainTracker::new(fetcher.clone(), test_config(10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tracker.start(shutdown_rx).await.unwrap();

        for advancement in [0i64, 1, 0, 2, 5, 1] {
            for _ in 0..advancement {
                latest = fetcher.advance_block();
            }
            wait_for_block(&tracker, latest).await;
            assert_eq!(tracker.get_latest_block_num(), latest);

            let (reported, hashes) = tracker
                .get_latest_block_data(LATEST_BLOCK - 6, LATEST_BLOCK - 3, NOT_APPLICABLE)
                .unwrap();
            assert_eq!(reported, latest);
            assert_eq!(hashes.len(), 3);
            assert_eq!(hashes[0].block, latest - 6);
            for pair in hashes.windows(2) {
                assert_eq!(pair[0].block + 1, pair[1].block);
            }
            for entry in &hashes {
                assert!(fetcher.is_correct_hash(&entry.hash, entry.block));
            }
        }
        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_specific_block_merges_in_order() {
        let fetcher = Arc::new(MockChainFetcher::new(1000, 60));
        let latest = fetcher.advance_block();
        let tracker = ChainTracker::new(fetcher.clone(), test_config(50));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tracker.start(shutdown_rx).await.unwrap();

        // Specific below the range lands first.
        let (_, hashes) = tracker
            .get_latest_block_data(LATEST_BLOCK - 6, LATEST_BLOCK - 3, LATEST_BLOCK - 30)
            .unwrap();
        assert_eq!(hashes.len(), 4);
        assert_eq!(hashes[0].block, latest - 30);
        assert_eq!(hashes[1].block, latest - 6);

        // Specific above the range lands last.
        let (_, hashes) = tracker
            .get_latest_block_data(LATEST_BLOCK - 6, LATEST_BLOCK - 3, LATEST_BLOCK)
            .unwrap();
        assert_eq!(hashes.len(), 4);
        assert_eq!(hashes[3].block, latest);

        // Specific alone.
        let (_, hashes) = tracker
            .get_latest_block_data(NOT_APPLICABLE, NOT_APPLICABLE, LATEST_BLOCK)
            .unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].block, latest);
    }

    #[tokio::test]
    async fn test_out_of_window_request_fails() {
        let fetcher = Arc::new(MockChainFetcher::new(1000, 20));
        fetcher.advance_block();
        let tracker = ChainTracker::new(fetcher, test_config(10));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tracker.start(shutdown_rx).await.unwrap();

        let err = tracker
            .get_latest_block_data(LATEST_BLOCK - 15, LATEST_BLOCK - 12, NOT_APPLICABLE)
            .unwrap_err();
        assert!(matches!(err, Error::BlockOutsideWindow { .. }));
    }

    #[tokio::test]
    async fn test_fork_fires_callback_once_and_updates_hashes() {
        let fetcher = Arc::new(MockChainFetcher::new(1000, 100));
        let mut latest = fetcher.advance_block();

        let fork_seen = Arc::new(AtomicBool::new(false));
        let new_block_seen = Arc::new(AtomicBool::new(false));
        let mut config = test_config(10);
        {
            let fork_seen = Arc::clone(&fork_seen);
            config.on_fork = Some(Arc::new(move |_| {
                fork_seen.store(true, Ordering::SeqCst);
            }));
            let new_block_seen = Arc::clone(&new_block_seen);
            config.on_new_block = Some(Arc::new(move |_| {
                new_block_seen.store(true, Ordering::SeqCst);
            }));
        }
        let tracker = ChainTracker::new(fetcher.clone(), config);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tracker.start(shutdown_rx).await.unwrap();

        struct Step {
            advancement: i64,
            fork: &'static str,
            should_fork: bool,
        }
        let steps = [
            Step { advancement: 0, fork: "", should_fork: false },
            Step { advancement: 1, fork: "", should_fork: false },
            Step { advancement: 0, fork: "fork", should_fork: true },
            Step { advancement: 0, fork: "fork", should_fork: false },
            Step { advancement: 1, fork: "another-fork", should_fork: true },
            Step { advancement: 2, fork: "", should_fork: true },
            Step { advancement: 5, fork: "", should_fork: false },
        ];
        for step in steps {
            fork_seen.store(false, Ordering::SeqCst);
            new_block_seen.store(false, Ordering::SeqCst);
            for _ in 0..step.advancement {
                latest = fetcher.advance_block();
            }
            fetcher.fork(step.fork);
            for _ in 0..50 {
                tokio::time::sleep(Duration::from_millis(4)).await;
                if tracker.get_latest_block_num() >= latest
                    && (!step.should_fork || fork_seen.load(Ordering::SeqCst))
                {
                    break;
                }
            }
            assert_eq!(tracker.get_latest_block_num(), latest);
            assert_eq!(
                fork_seen.load(Ordering::SeqCst),
                step.should_fork,
                "fork callback mismatch at advancement {} fork {:?}",
                step.advancement,
                step.fork
            );
            assert_eq!(new_block_seen.load(Ordering::SeqCst), step.advancement > 0);

            let (_, hashes) = tracker
                .get_latest_block_data(LATEST_BLOCK - 6, LATEST_BLOCK - 3, NOT_APPLICABLE)
                .unwrap();
            for entry in &hashes {
                assert!(
                    fetcher.is_correct_hash(&entry.hash, entry.block),
                    "stale hash for block {} after fork",
                    entry.block
                );
            }
        }
    }

    #[tokio::test]
    async fn test_window_shrinks_to_configured_size() {
        let fetcher = Arc::new(MockChainFetcher::new(1000, 100));
        let mut latest = fetcher.advance_block();
        let tracker = ChainTracker::new(fetcher.clone(), test_config(10));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tracker.start(shutdown_rx).await.unwrap();

        for _ in 0..6 {
            latest = fetcher.advance_block();
        }
        wait_for_block(&tracker, latest).await;
        assert_eq!(tracker.window.read().len(), 10);

        // The oldest block fell out of the window.
        let err = tracker
            .get_latest_block_data(LATEST_BLOCK - 10, NOT_APPLICABLE, NOT_APPLICABLE)
            .unwrap_err();
        assert!(matches!(err, Error::BlockOutsideWindow { .. }));
    }

    #[tokio::test]
    async fn test_upstream_pruning_does_not_fork() {
        let fetcher = Arc::new(MockChainFetcher::new(1000, 100));
        fetcher.advance_block();

        let fork_seen = Arc::new(AtomicBool::new(false));
        let mut config = test_config(50);
        {
            let fork_seen = Arc::clone(&fork_seen);
            config.on_fork = Some(Arc::new(move |_| {
                fork_seen.store(true, Ordering::SeqCst);
            }));
        }
        let tracker = ChainTracker::new(fetcher.clone(), config);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tracker.start(shutdown_rx).await.unwrap();

        let latest = fetcher.advance_block();
        fetcher.shrink(50);
        wait_for_block(&tracker, latest).await;

        let (_, hashes) = tracker
            .get_latest_block_data(LATEST_BLOCK - 6, LATEST_BLOCK - 3, LATEST_BLOCK - 30)
            .unwrap();
        assert_eq!(hashes.len(), 4);
        assert!(!fork_seen.load(Ordering::SeqCst));
    }
}
