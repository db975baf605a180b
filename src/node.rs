//! Provider runtime: owns every provider-side component and wires them
//! together.
//!
//! The runtime replaces any notion of process-wide state: the session
//! registry, reward ledger, vote handler and epoch counters all live here,
//! and the transport shell reaches them through the runtime. Startup order
//! follows the dependency chain: chain tracker first, then the relay server,
//! then the epoch-update task that drives reward claims.

use crate::chain::cache::RelayCache;
use crate::chain::ChainProxy;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::provider::vote::VoteParams;
use crate::provider::{
    RelayServer, RelayServerConfig, RewardClaimer, RewardLedger, SessionRegistry, VoteHandler,
};
use crate::state::{RelaySigner, StateTracker};
use crate::tracker::{ChainTracker, ChainTrackerConfig};
use crate::types::STALE_EPOCH_DISTANCE;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Initialize tracing with an env-filter, falling back to `log_level`.
pub fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Builder for constructing a provider runtime.
pub struct ProviderRuntimeBuilder {
    node_config: NodeConfig,
    server_config: RelayServerConfig,
    signer: Arc<dyn RelaySigner>,
    state: Arc<dyn StateTracker>,
    proxy: Arc<dyn ChainProxy>,
    cache: Arc<dyn RelayCache>,
}

impl ProviderRuntimeBuilder {
    /// Create a builder from the node configuration and the external
    /// collaborators.
    #[must_use]
    pub fn new(
        node_config: NodeConfig,
        server_config: RelayServerConfig,
        signer: Arc<dyn RelaySigner>,
        state: Arc<dyn StateTracker>,
        proxy: Arc<dyn ChainProxy>,
        cache: Arc<dyn RelayCache>,
    ) -> Self {
        Self {
            node_config,
            server_config,
            signer,
            state,
            proxy,
            cache,
        }
    }

    /// Assemble the runtime. Call [`ProviderRuntime::start`] to begin
    /// serving.
    #[must_use]
    pub fn build(self, fetcher: Arc<dyn crate::tracker::ChainFetcher>) -> ProviderRuntime {
        let registry = Arc::new(SessionRegistry::new());
        let rewards = Arc::new(RewardLedger::new());

        let (new_block_tx, new_block_rx) = mpsc::unbounded_channel();
        let tracker_config = ChainTrackerConfig {
            blocks_to_save: self.node_config.tracker.blocks_to_save,
            average_block_time: std::time::Duration::from_millis(
                self.node_config.tracker.average_block_time_ms,
            ),
            polls_per_block: self.node_config.tracker.polls_per_block,
            fetch_retries: self.node_config.tracker.fetch_retries,
            on_new_block: Some(Arc::new(move |latest| {
                let _ = new_block_tx.send(latest);
            })),
            on_fork: None,
        };
        let tracker = ChainTracker::new(fetcher, tracker_config);

        let server = Arc::new(RelayServer::new(
            self.server_config.clone(),
            Arc::clone(&self.signer),
            Arc::clone(&self.state),
            Arc::clone(&self.proxy),
            Arc::clone(&self.cache),
            Some(Arc::clone(&tracker)),
            Arc::clone(&registry),
            Arc::clone(&rewards),
        ));
        let claimer = Arc::new(RewardClaimer::new(
            rewards,
            registry,
            Arc::clone(&self.state),
            rand::random(),
        ));
        let votes = Arc::new(VoteHandler::new(
            self.server_config.chain_id,
            self.signer.address().to_string(),
            Arc::clone(&self.proxy),
            Arc::clone(&self.state),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        ProviderRuntime {
            server,
            claimer,
            votes,
            tracker,
            state: self.state,
            shutdown_tx,
            new_block_rx: Some(new_block_rx),
            tasks: Vec::new(),
        }
    }
}

/// A running provider node.
pub struct ProviderRuntime {
    server: Arc<RelayServer>,
    claimer: Arc<RewardClaimer>,
    votes: Arc<VoteHandler>,
    tracker: Arc<ChainTracker>,
    state: Arc<dyn StateTracker>,
    shutdown_tx: watch::Sender<bool>,
    new_block_rx: Option<mpsc::UnboundedReceiver<i64>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProviderRuntime {
    /// The relay server, for the transport shell.
    #[must_use]
    pub fn relay_server(&self) -> &Arc<RelayServer> {
        &self.server
    }

    /// The chain tracker.
    #[must_use]
    pub fn chain_tracker(&self) -> &Arc<ChainTracker> {
        &self.tracker
    }

    /// Start the chain tracker and the epoch-update task.
    ///
    /// # Errors
    ///
    /// Returns an error when the tracker cannot reach the upstream node.
    pub async fn start(&mut self) -> Result<()> {
        let tracker_handle = self.tracker.start(self.shutdown_tx.subscribe()).await?;
        self.tasks.push(tracker_handle);

        // Prime the epoch state before serving relays.
        self.apply_pairing_update(self.tracker.get_latest_block_num())
            .await;

        let mut new_block_rx = self
            .new_block_rx
            .take()
            .ok_or_else(|| crate::Error::Internal("runtime already started".to_string()))?;
        let server = Arc::clone(&self.server);
        let claimer = Arc::clone(&self.claimer);
        let state = Arc::clone(&self.state);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut next_block_for_update = 0u64;

        let handle = tokio::spawn(async move {
            loop {
                let latest = tokio::select! {
                    latest = new_block_rx.recv() => match latest {
                        Some(latest) => latest,
                        None => return,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                        continue;
                    }
                };
                if u64::try_from(latest).unwrap_or(0) < next_block_for_update {
                    continue;
                }
                match state.get_pairing(latest).await {
                    Ok(update) => {
                        next_block_for_update = update.next_block_for_update;
                        Self::advance_epoch(&server, &claimer, &update);
                    }
                    Err(e) => warn!("pairing query failed on new block {latest}: {e}"),
                }
            }
        });
        self.tasks.push(handle);
        info!("provider runtime started");
        Ok(())
    }

    /// Query the pairing at `block` and apply it immediately.
    async fn apply_pairing_update(&self, block: i64) {
        match self.state.get_pairing(block).await {
            Ok(update) => Self::advance_epoch(&self.server, &self.claimer, &update),
            Err(e) => warn!("initial pairing query failed: {e}"),
        }
    }

    fn advance_epoch(
        server: &Arc<RelayServer>,
        claimer: &Arc<RewardClaimer>,
        update: &crate::state::PairingUpdate,
    ) {
        if update.epoch <= server.current_epoch() {
            return;
        }
        server.update_epoch(update.epoch);
        server.set_providers_count(u32::try_from(update.pairing.len()).unwrap_or(u32::MAX));

        let stale_epoch = update.epoch.saturating_sub(STALE_EPOCH_DISTANCE);
        if stale_epoch > 0 {
            // Each epoch boundary claims on its own task; the claimer
            // serializes internally.
            let claimer = Arc::clone(claimer);
            tokio::spawn(async move {
                if let Err(e) = claimer.claim_rewards(stale_epoch).await {
                    warn!(stale_epoch, "reward claim failed: {e}");
                }
            });
        }
    }

    /// Forward a vote event to the vote handler with the tracked height.
    ///
    /// # Errors
    ///
    /// Returns broadcast errors from the commit or reveal transactions.
    pub async fn vote_event(
        &self,
        vote_id: &str,
        params: Option<&VoteParams>,
        vote_deadline: u64,
    ) -> Result<()> {
        let height = u64::try_from(self.tracker.get_latest_block_num()).unwrap_or(0);
        self.votes
            .handle_vote_event(vote_id, params, vote_deadline, height)
            .await
    }

    /// Stop background tasks and claim rewards for the final epoch.
    pub async fn shutdown(mut self) {
        let final_epoch = self.server.current_epoch();
        let _ = self.shutdown_tx.send(true);
        if final_epoch > 0 {
            if let Err(e) = self.claimer.claim_rewards(final_epoch).await {
                warn!(final_epoch, "final reward claim failed: {e}");
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        info!("provider runtime stopped");
    }
}
