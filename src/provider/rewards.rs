//! Reward session ledger and the epoch-boundary claimer.
//!
//! Every committed relay session is appended to the ledger under its pairing
//! epoch. When the chain tracker advances far enough past an epoch's end the
//! claimer drains it: proofs are batched into one payment message, the
//! drained sessions are deleted, and the batch is broadcast. Claims are
//! at-most-once: sessions are deleted whether or not the broadcast succeeds.
//!
//! The transaction pipeline reports sequence mismatches only as error text;
//! [`find_sequence_number`] extracts the expected sequence so the claim can
//! be retried with it. This is a known hack kept isolated here until the
//! pipeline exposes a structured error.

use crate::error::Result;
use crate::provider::session::{RelaySession, SessionRegistry};
use crate::state::StateTracker;
use crate::types::{RelayRequest, STALE_EPOCH_DISTANCE};
use parking_lot::Mutex as PlMutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// How many times a claim broadcast is retried on a bad sequence number.
pub const RETRY_INCORRECT_SEQUENCE: usize = 5;

/// Epoch-indexed ledger of sessions awaiting payment claims.
#[derive(Debug, Default)]
pub struct RewardLedger {
    epochs: PlMutex<HashMap<u64, Vec<Arc<Mutex<RelaySession>>>>>,
}

impl RewardLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a session under its epoch.
    pub fn append(&self, epoch: u64, session: Arc<Mutex<RelaySession>>) {
        self.epochs.lock().entry(epoch).or_default().push(session);
    }

    /// Number of epochs with unclaimed sessions.
    #[must_use]
    pub fn epoch_count(&self) -> usize {
        self.epochs.lock().len()
    }

    /// Epochs older than `stale_epoch` that still hold sessions.
    fn older_epochs(&self, stale_epoch: u64) -> Vec<u64> {
        self.epochs
            .lock()
            .keys()
            .copied()
            .filter(|epoch| *epoch < stale_epoch)
            .collect()
    }

    /// Remove and return one epoch's sessions.
    fn drain_epoch(&self, epoch: u64) -> Option<Vec<Arc<Mutex<RelaySession>>>> {
        self.epochs.lock().remove(&epoch)
    }
}

/// Drains the reward ledger and broadcasts batched payment claims.
pub struct RewardClaimer {
    ledger: Arc<RewardLedger>,
    registry: Arc<SessionRegistry>,
    state: Arc<dyn StateTracker>,
    /// Identifies this server instance in claim descriptions.
    server_id: u64,
    /// Serializes claim attempts so concurrent epoch callbacks cannot
    /// produce duplicate submissions.
    claim_lock: Mutex<()>,
}

impl RewardClaimer {
    /// Create a claimer over the given ledger and registry.
    #[must_use]
    pub fn new(
        ledger: Arc<RewardLedger>,
        registry: Arc<SessionRegistry>,
        state: Arc<dyn StateTracker>,
        server_id: u64,
    ) -> Self {
        Self {
            ledger,
            registry,
            state,
            server_id,
            claim_lock: Mutex::new(()),
        }
    }

    /// Claim rewards for `stale_epoch` and any older epoch still in the
    /// ledger.
    ///
    /// # Errors
    ///
    /// Returns broadcast errors after the retry budget is spent; the drained
    /// sessions are deleted regardless.
    pub async fn claim_rewards(&self, stale_epoch: u64) -> Result<()> {
        let _guard = self.claim_lock.lock().await;

        let mut stale_epochs = vec![stale_epoch];
        if self.ledger.epoch_count() > usize::try_from(STALE_EPOCH_DISTANCE).unwrap_or(usize::MAX) + 1
        {
            let older = self.ledger.older_epochs(stale_epoch);
            if !older.is_empty() {
                warn!(
                    requested_epoch = stale_epoch,
                    catching_up = older.len(),
                    "some epochs were not rewarded, catching up"
                );
                stale_epochs.extend(older);
            }
        }

        let mut relays: Vec<RelayRequest> = Vec::new();
        let mut reliability = false;
        let mut sessions_to_delete = Vec::new();

        for epoch in stale_epochs {
            let Some(epoch_sessions) = self.ledger.drain_epoch(epoch) else {
                continue;
            };
            for session in epoch_sessions {
                let (consumer, proof) = {
                    let mut locked = session.lock().await;
                    let Some(proof) = locked.proof.take() else {
                        // Data-reliability entries carry no proof; a missing
                        // proof on a real session loses its reward.
                        if locked.unique_id != 0 {
                            error!(
                                session_id = locked.unique_id,
                                "missing proof, cannot claim reward for this session"
                            );
                        }
                        sessions_to_delete.push(Arc::clone(&session));
                        continue;
                    };
                    (locked.consumer.clone(), proof)
                };
                sessions_to_delete.push(Arc::clone(&session));

                let mut proof = proof;
                if proof.block_height != epoch {
                    error!(
                        relay_epoch = proof.block_height,
                        requested_epoch = epoch,
                        "relay proof is under an incorrect epoch"
                    );
                }
                if let Some(user_entry) = self.registry.get(&consumer) {
                    let mut user = user_entry.lock();
                    if let Some(epoch_data) = user.data_by_epoch.get_mut(&epoch) {
                        // Attach the consumer's DR record to one proof only.
                        if let Some(vrf_data) = epoch_data.data_reliability.take() {
                            proof.data_reliability = Some(vrf_data);
                            reliability = true;
                        }
                    } else {
                        error!(%consumer, epoch, "missing epoch data for claimed session");
                    }
                }
                relays.push(proof);
            }
        }

        // Delete drained sessions before broadcasting; claims are
        // at-most-once.
        let mut touched_consumers = Vec::new();
        for session in sessions_to_delete {
            let (consumer, session_id) = {
                let locked = session.lock().await;
                (locked.consumer.clone(), locked.unique_id)
            };
            if let Some(user_entry) = self.registry.get(&consumer) {
                user_entry.lock().sessions.remove(&session_id);
            }
            touched_consumers.push(consumer);
        }
        self.registry.remove_if_empty(&touched_consumers);

        if relays.is_empty() {
            return Ok(());
        }
        info!(
            relays = relays.len(),
            reliability, "asking for relay payment rewards"
        );
        self.broadcast_with_sequence_retry(relays).await
    }

    /// Broadcast a payment batch, adapting to sequence-number errors.
    async fn broadcast_with_sequence_retry(&self, relays: Vec<RelayRequest>) -> Result<()> {
        let description = self.server_id.to_string();
        let mut sequence: Option<u64> = None;
        let mut summary = String::new();

        for attempt in 0..RETRY_INCORRECT_SEQUENCE {
            if let Some(seq) = sequence {
                info!(sequence = seq, attempt, "retrying claim with sequence number");
            }
            let result_text = match self
                .state
                .send_relay_payment(relays.clone(), &description, sequence)
                .await
            {
                Ok(text) => text,
                // The tx result is the error text in the failure case.
                Err(e) => e.to_string(),
            };

            let (summarized, code) = parse_transaction_result(&result_text);
            summary = summarized;
            if code == 0 {
                info!(%summary, "reward claim succeeded");
                return Ok(());
            }
            if result_text.contains("account sequence") {
                sequence = find_sequence_number(&result_text);
                if sequence.is_none() {
                    warn!("failed to parse sequence number from tx error");
                }
            }
        }
        error!(%summary, "reward claim failed after retries");
        Err(crate::error::Error::Broadcast(summary))
    }
}

/// Extract the expected sequence number from a transaction error text of the
/// form `... account sequence mismatch, expected 42, got 41 ...`.
#[must_use]
pub fn find_sequence_number(text: &str) -> Option<u64> {
    let re = Regex::new(r"expected (\d+), got (\d+)").ok()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

/// Summarize a raw transaction result and extract its return code. A result
/// without a parsable `code:<n>` field counts as failed.
#[must_use]
pub fn parse_transaction_result(result: &str) -> (String, u64) {
    let normalized = result.replace(": ", ":");
    let summary: Vec<&str> = normalized
        .lines()
        .filter(|line| {
            line.contains("raw_log:") || line.contains("txhash:") || line.contains("code:")
        })
        .collect();
    let summary = summary.join(", ");

    let code = Regex::new(r"code:(\d+)")
        .ok()
        .and_then(|re| re.captures(&normalized)?.get(1)?.as_str().parse().ok())
        .unwrap_or(1);
    (summary, code)
}
