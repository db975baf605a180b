//! Conflict-vote handling: commit/reveal participation in disputes.
//!
//! When the state-tracker layer delivers a vote event naming this provider
//! in the jury, the disputed query is re-executed against the local chain
//! proxy, the reply hash is committed on-chain as `sha256(nonce ‖ hash)`,
//! and revealed when the reveal event arrives. Entries are keyed by vote id,
//! one per id, and cleared on close events.

use crate::chain::ChainProxy;
use crate::error::Result;
use crate::state::StateTracker;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Parameters of a new-vote event. Reveal events carry none.
#[derive(Debug, Clone)]
pub struct VoteParams {
    /// Chain the disputed relay targeted.
    pub chain_id: String,
    /// Disputed request path or method.
    pub api_url: String,
    /// Disputed request body.
    pub request_data: Vec<u8>,
    /// Connection type of the disputed request.
    pub connection_type: String,
    /// Jury addresses.
    pub voters: Vec<String>,
    /// Whether this event closes the vote.
    pub close_vote: bool,
}

/// Local state of one vote between commit and reveal.
#[derive(Debug, Clone)]
struct VoteData {
    relay_data_hash: Vec<u8>,
    nonce: i64,
    commit_hash: Vec<u8>,
}

/// Commitment hash for a vote: `sha256(nonce ‖ data_hash)`.
#[must_use]
pub fn commit_vote_data(nonce: i64, data_hash: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_le_bytes());
    hasher.update(data_hash);
    hasher.finalize().to_vec()
}

/// Handles vote events for one provider endpoint.
pub struct VoteHandler {
    chain_id: String,
    provider_address: String,
    proxy: Arc<dyn ChainProxy>,
    state: Arc<dyn StateTracker>,
    /// One guard over the vote map; the handler is fully serialized.
    votes: Mutex<HashMap<String, VoteData>>,
}

impl VoteHandler {
    /// Create a handler for `provider_address` on `chain_id`.
    #[must_use]
    pub fn new(
        chain_id: String,
        provider_address: String,
        proxy: Arc<dyn ChainProxy>,
        state: Arc<dyn StateTracker>,
    ) -> Self {
        Self {
            chain_id,
            provider_address,
            proxy,
            state,
            votes: Mutex::new(HashMap::new()),
        }
    }

    /// Number of votes currently tracked.
    pub async fn active_votes(&self) -> usize {
        self.votes.lock().await.len()
    }

    /// Process one vote event.
    ///
    /// `params` is present for new-vote and close events and absent for
    /// reveal events. `current_height` is the tracked chain height used for
    /// the deadline check.
    ///
    /// # Errors
    ///
    /// Returns broadcast errors from the commit or reveal transactions.
    pub async fn handle_vote_event(
        &self,
        vote_id: &str,
        params: Option<&VoteParams>,
        vote_deadline: u64,
        current_height: u64,
    ) -> Result<()> {
        if let Some(params) = params {
            if !params.close_vote {
                if params.chain_id != self.chain_id {
                    return Ok(());
                }
                if vote_deadline < current_height {
                    error!(
                        vote_id,
                        vote_deadline, current_height, "vote event received too late to vote"
                    );
                    return Ok(());
                }
            }
        }

        let mut votes = self.votes.lock().await;
        if let Some(existing) = votes.get(vote_id).cloned() {
            let Some(params) = params else {
                // Reveal event for a vote we committed to.
                if commit_vote_data(existing.nonce, &existing.relay_data_hash)
                    != existing.commit_hash
                {
                    error!(vote_id, "stored commitment does not match vote data");
                    return Ok(());
                }
                info!(vote_id, "received vote reveal event, revealing result");
                return self
                    .state
                    .send_vote_reveal(vote_id, existing.nonce, &existing.relay_data_hash)
                    .await;
            };
            if params.close_vote {
                info!(vote_id, "vote termination event, cleared entry");
                votes.remove(vote_id);
                return Ok(());
            }
            error!(vote_id, "new vote request for an existing vote entry");
            return Ok(());
        }

        let Some(params) = params else {
            error!(vote_id, "reveal request without a vote entry");
            return Ok(());
        };
        if params.close_vote {
            error!(vote_id, "vote closing received without a vote entry");
            return Ok(());
        }
        if !params.voters.iter().any(|v| v == &self.provider_address) {
            info!(vote_id, "new vote initiated but not for this provider");
            return Ok(());
        }

        // In the jury: re-execute the disputed query and commit to its hash.
        let node_msg = match self.proxy.parse_msg(
            &params.api_url,
            &params.request_data,
            &params.connection_type,
        ) {
            Ok(msg) => msg,
            Err(e) => {
                error!(vote_id, "vote request did not pass the chain proxy api check: {e}");
                return Ok(());
            }
        };
        let reply = match self.proxy.send(&node_msg, None).await {
            Ok((reply, _)) => reply,
            Err(e) => {
                warn!(vote_id, "vote relay send failed: {e}");
                return Ok(());
            }
        };

        let relay_data_hash = Sha256::digest(&reply.data).to_vec();
        let nonce: i64 = {
            use rand::Rng;
            rand::thread_rng().gen_range(0..i64::MAX)
        };
        let commit_hash = commit_vote_data(nonce, &relay_data_hash);
        votes.insert(
            vote_id.to_string(),
            VoteData {
                relay_data_hash,
                nonce,
                commit_hash: commit_hash.clone(),
            },
        );
        info!(
            vote_id,
            commit_hash = %hex::encode(&commit_hash),
            "vote started, sending commitment for result"
        );
        self.state.send_vote_commit(vote_id, &commit_hash).await
    }
}
