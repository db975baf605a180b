//! Shared test doubles for the provider modules.

use crate::chain::{ChainProxy, NodeMessage, ServiceApi, SubscriptionHandle};
use crate::config::ApiInterface;
use crate::error::{Error, Result};
use crate::state::{AuthorizedConsumer, PairingUpdate, RelaySigner, StateTracker, VrfPublicKey};
use crate::tracker::ChainFetcher;
use crate::types::{RelayReply, RelayRequest, LATEST_BLOCK};
use async_trait::async_trait;
use parking_lot::Mutex as PlMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{mpsc, watch};

/// Programmable state tracker capturing every on-chain interaction.
#[derive(Default)]
pub struct MockState {
    /// Response for authorization queries.
    pub auth: PlMutex<Option<AuthorizedConsumer>>,
    /// Counts authorization queries, to observe caching.
    pub auth_queries: AtomicUsize,
    /// Epoch CU allowance handed to new sessions.
    pub max_cu: AtomicU64,
    /// Whether `is_authorized_pairing` succeeds.
    pub pairing_ok: AtomicBool,
    /// Queued raw results for payment broadcasts; empty means `code:0`.
    pub payment_results: PlMutex<Vec<String>>,
    /// Observed `(attempt, sequence)` pairs per broadcast.
    pub payment_calls: PlMutex<Vec<(usize, Option<u64>)>>,
    /// Relay batches passed to broadcasts.
    pub sent_batches: PlMutex<Vec<Vec<RelayRequest>>>,
    /// Captured vote commitments.
    pub commits: PlMutex<Vec<(String, Vec<u8>)>>,
    /// Captured vote reveals.
    pub reveals: PlMutex<Vec<(String, i64, Vec<u8>)>>,
    /// Response for pairing queries.
    pub pairing_update: PlMutex<Option<PairingUpdate>>,
    attempts: AtomicUsize,
}

impl MockState {
    /// Tracker with default happy-path behavior and a 100 CU allowance.
    pub fn new() -> Self {
        let state = Self::default();
        state.max_cu.store(100, Ordering::SeqCst);
        state.pairing_ok.store(true, Ordering::SeqCst);
        state
    }

    /// Queue raw payment broadcast results, consumed in order.
    pub fn with_payment_results(results: Vec<&str>) -> Self {
        let state = Self::new();
        *state.payment_results.lock() = results.into_iter().map(String::from).collect();
        state
    }
}

#[async_trait]
impl StateTracker for MockState {
    async fn is_authorized_consumer(
        &self,
        _consumer: &str,
        _block_height: u64,
    ) -> Result<AuthorizedConsumer> {
        self.auth_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.auth.lock().clone().unwrap_or(AuthorizedConsumer {
            valid: true,
            self_index: 0,
        }))
    }

    async fn is_authorized_pairing(
        &self,
        _consumer: &str,
        _provider: &str,
        _block_height: u64,
    ) -> Result<bool> {
        Ok(self.pairing_ok.load(Ordering::SeqCst))
    }

    async fn vrf_pk_and_max_cu(
        &self,
        _consumer: &str,
        _chain_id: &str,
        _block_height: u64,
    ) -> Result<(VrfPublicKey, u64)> {
        Ok((
            VrfPublicKey(b"vrf-pk".to_vec()),
            self.max_cu.load(Ordering::SeqCst),
        ))
    }

    async fn get_pairing(&self, _block: i64) -> Result<PairingUpdate> {
        Ok(self.pairing_update.lock().clone().unwrap_or(PairingUpdate {
            pairing: vec![],
            epoch: 0,
            next_block_for_update: 0,
        }))
    }

    async fn send_relay_payment(
        &self,
        relays: Vec<RelayRequest>,
        _description: &str,
        sequence: Option<u64>,
    ) -> Result<String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.payment_calls.lock().push((attempt, sequence));
        self.sent_batches.lock().push(relays);
        let mut results = self.payment_results.lock();
        if results.is_empty() {
            Ok("code:0".to_string())
        } else {
            Ok(results.remove(0))
        }
    }

    async fn send_vote_commit(&self, vote_id: &str, commit_hash: &[u8]) -> Result<()> {
        self.commits
            .lock()
            .push((vote_id.to_string(), commit_hash.to_vec()));
        Ok(())
    }

    async fn send_vote_reveal(&self, vote_id: &str, nonce: i64, data_hash: &[u8]) -> Result<()> {
        self.reveals
            .lock()
            .push((vote_id.to_string(), nonce, data_hash.to_vec()));
        Ok(())
    }
}

/// Chain proxy double: every API costs `compute_units`, params decode from
/// the request body, subscriptions replay a queued script.
pub struct MockProxy {
    /// CU cost reported for every parsed message.
    pub compute_units: u64,
    /// Reply body for non-subscription sends.
    pub reply_data: Vec<u8>,
    /// When set, sends fail with an upstream error.
    pub fail_send: AtomicBool,
    /// Upstream notifications replayed into a subscription.
    pub sub_replies: PlMutex<VecDeque<serde_json::Value>>,
    /// Whether the upstream closes the subscription after the replay.
    pub close_after_replay: AtomicBool,
    /// Number of successful sends.
    pub sends: AtomicUsize,
}

impl MockProxy {
    /// Proxy where every API costs `compute_units`.
    pub fn with_cu(compute_units: u64) -> Self {
        Self {
            compute_units,
            reply_data: b"reply".to_vec(),
            fail_send: AtomicBool::new(false),
            sub_replies: PlMutex::new(VecDeque::new()),
            close_after_replay: AtomicBool::new(true),
            sends: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChainProxy for MockProxy {
    fn parse_msg(&self, url: &str, data: &[u8], _connection_type: &str) -> Result<NodeMessage> {
        Ok(NodeMessage {
            service_api: ServiceApi {
                name: url.to_string(),
                compute_units: self.compute_units,
            },
            api_interface: ApiInterface::Jsonrpc,
            requested_block: LATEST_BLOCK,
            params: serde_json::from_slice(data).ok(),
        })
    }

    async fn send(
        &self,
        msg: &NodeMessage,
        subscribe: Option<mpsc::Sender<serde_json::Value>>,
    ) -> Result<(RelayReply, Option<SubscriptionHandle>)> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(Error::Upstream("node unreachable".to_string()));
        }
        self.sends.fetch_add(1, Ordering::SeqCst);

        let handle = if let Some(tx) = subscribe {
            let replies: Vec<_> = self.sub_replies.lock().drain(..).collect();
            let close_after_replay = self.close_after_replay.load(Ordering::SeqCst);
            let (cancel_tx, mut cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                for value in replies {
                    if tx.send(value).await.is_err() {
                        return;
                    }
                }
                if close_after_replay {
                    return;
                }
                // Keep the upstream open until unsubscribed.
                while !*cancel_rx.borrow() {
                    if cancel_rx.changed().await.is_err() {
                        return;
                    }
                }
            });
            Some(SubscriptionHandle::new(
                format!("sub-{}", msg.service_api.name),
                cancel_tx,
            ))
        } else {
            None
        };

        Ok((
            RelayReply {
                data: self.reply_data.clone(),
                ..RelayReply::default()
            },
            handle,
        ))
    }

    fn api_interface(&self) -> ApiInterface {
        ApiInterface::Jsonrpc
    }
}

/// Signer double: the request signature is the consumer address in clear,
/// VRF proofs verify when they equal `b"valid-proof"`.
pub struct MockSigner {
    /// This provider's address.
    pub address: String,
}

impl RelaySigner for MockSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn recover_consumer(&self, request: &RelayRequest) -> Result<String> {
        String::from_utf8(request.sig.clone())
            .map_err(|e| Error::RelayRejected(format!("bad signature: {e}")))
    }

    fn sign_reply(&self, _reply: &RelayReply, _request: &RelayRequest) -> Result<Vec<u8>> {
        Ok(b"provider-sig".to_vec())
    }

    fn sign_finalization(
        &self,
        _reply: &RelayReply,
        _request: &RelayRequest,
        _consumer: &str,
    ) -> Result<Vec<u8>> {
        Ok(b"provider-sig-blocks".to_vec())
    }

    fn verify_vrf_data(
        &self,
        _consumer: &str,
        _vrf_pk: &VrfPublicKey,
        request: &RelayRequest,
    ) -> Result<bool> {
        Ok(request
            .data_reliability
            .as_ref()
            .is_some_and(|vrf| vrf.vrf_proof == b"valid-proof"))
    }

    fn recover_reliability_signer(&self, request: &RelayRequest) -> Result<String> {
        let vrf = request
            .data_reliability
            .as_ref()
            .ok_or_else(|| Error::Internal("no vrf data".to_string()))?;
        String::from_utf8(vrf.provider_sig.clone())
            .map_err(|e| Error::DataReliability(format!("bad provider signature: {e}")))
    }
}

/// Fetcher double serving `hash-<n>` for every height up to `latest`.
pub struct StaticFetcher {
    /// The head height reported to the tracker.
    pub latest: i64,
}

#[async_trait]
impl ChainFetcher for StaticFetcher {
    async fn fetch_latest_block_num(&self) -> Result<i64> {
        Ok(self.latest)
    }

    async fn fetch_block_hash_by_num(&self, block_num: i64) -> Result<String> {
        if block_num > self.latest {
            return Err(Error::Upstream(format!("block {block_num} not yet mined")));
        }
        Ok(format!("hash-{block_num}"))
    }
}
