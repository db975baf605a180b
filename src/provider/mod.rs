//! Provider session server.
//!
//! Accepts inbound relay requests, authenticates and authorizes the
//! consumer, enforces session counters and per-epoch compute-unit quotas,
//! forwards to the local chain proxy, signs replies, and retains the last
//! request of every session as the proof used to claim payment.
//!
//! Relays within one `(consumer, session)` pair are strictly serialized: the
//! server holds the session guard from admission through commit. Failures
//! after the commit are rolled back by [`RelayServer::on_relay_failure`].

pub mod rewards;
mod session;
#[cfg(test)]
pub(crate) mod testutil;
pub mod vote;

pub use rewards::{RewardClaimer, RewardLedger, RETRY_INCORRECT_SEQUENCE};
pub use session::{
    get_or_create_session, RelaySession, SessionRegistry, Subscription, UserEpochData,
    UserSessions,
};
pub use vote::{VoteHandler, VoteParams};

use crate::chain::cache::{CacheKey, RelayCache};
use crate::chain::{ChainProxy, NodeMessage};
use crate::error::{Error, Result};
use crate::state::{vrf_index, AuthorizedConsumer, RelaySigner, StateTracker};
use crate::tracker::ChainTracker;
use crate::types::{
    latest_arg_to_block_num, RelayReply, RelayRequest, DATA_RELIABILITY_CU_SUM,
    DATA_RELIABILITY_RELAY_NUM, DATA_RELIABILITY_SESSION_ID, NOT_APPLICABLE,
};
use parking_lot::Mutex as PlMutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Chain-level parameters of the served endpoint.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Chain this provider serves.
    pub chain_id: String,
    /// Whether finalization proofs and data-reliability probes are enabled
    /// for this chain.
    pub data_reliability_enabled: bool,
    /// VRF gate for data-reliability probes.
    pub reliability_threshold: u32,
    /// Blocks behind the head after which a block counts as finalized.
    pub finalization_criteria: u32,
    /// How many finalized hashes are attached to every reply.
    pub finalization_proof_blocks: u32,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            chain_id: String::new(),
            data_reliability_enabled: true,
            reliability_threshold: u32::MAX / 2,
            finalization_criteria: 7,
            finalization_proof_blocks: 3,
        }
    }
}

/// State carried from admission into relay execution and rollback.
struct InitializedRelay {
    consumer: String,
    node_msg: NodeMessage,
    relay_session: Option<Arc<Mutex<RelaySession>>>,
}

/// The provider-side relay server.
pub struct RelayServer {
    config: RelayServerConfig,
    signer: Arc<dyn RelaySigner>,
    state: Arc<dyn StateTracker>,
    proxy: Arc<dyn ChainProxy>,
    cache: Arc<dyn RelayCache>,
    tracker: Option<Arc<ChainTracker>>,
    registry: Arc<SessionRegistry>,
    rewards: Arc<RewardLedger>,
    current_epoch: AtomicU64,
    previous_epoch: AtomicU64,
    providers_count: AtomicU32,
    /// Authorization responses cached per `(consumer, epoch)`.
    auth_cache: PlMutex<HashMap<(String, u64), AuthorizedConsumer>>,
}

impl RelayServer {
    /// Create a relay server. `tracker` is required when data reliability is
    /// enabled for the chain.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RelayServerConfig,
        signer: Arc<dyn RelaySigner>,
        state: Arc<dyn StateTracker>,
        proxy: Arc<dyn ChainProxy>,
        cache: Arc<dyn RelayCache>,
        tracker: Option<Arc<ChainTracker>>,
        registry: Arc<SessionRegistry>,
        rewards: Arc<RewardLedger>,
    ) -> Self {
        Self {
            config,
            signer,
            state,
            proxy,
            cache,
            tracker,
            registry,
            rewards,
            current_epoch: AtomicU64::new(0),
            previous_epoch: AtomicU64::new(0),
            providers_count: AtomicU32::new(0),
            auth_cache: PlMutex::new(HashMap::new()),
        }
    }

    /// The epoch relays are currently admitted under.
    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// The immediately previous epoch; relays against it are still admitted.
    #[must_use]
    pub fn previous_epoch(&self) -> u64 {
        self.previous_epoch.load(Ordering::Acquire)
    }

    /// Advance the epoch pair. Stale authorization cache entries die with
    /// the epoch that admitted them.
    pub fn update_epoch(&self, epoch: u64) {
        let current = self.current_epoch();
        if epoch <= current {
            return;
        }
        self.previous_epoch.store(current, Ordering::Release);
        self.current_epoch.store(epoch, Ordering::Release);
        let previous = current;
        self.auth_cache
            .lock()
            .retain(|(_, cached_epoch), _| *cached_epoch >= previous);
        info!(epoch, previous, "provider advanced epoch");
    }

    /// Update the pairing size used for VRF index validation.
    pub fn set_providers_count(&self, count: u32) {
        self.providers_count.store(count, Ordering::Release);
    }

    /// Handle one relay request end to end.
    ///
    /// # Errors
    ///
    /// Admission and upstream errors are returned to the transport shell,
    /// which attaches [`Error::status_code`] so the consumer can distinguish
    /// session-out-of-sync failures.
    pub async fn handle_relay(&self, request: &RelayRequest) -> Result<RelayReply> {
        debug!(
            session_id = request.session_id,
            relay_num = request.relay_num,
            cu_sum = request.cu_sum,
            "provider got relay request"
        );
        let init = self.init_relay(request).await?;

        match self.try_relay(request, &init).await {
            Ok(reply) => {
                debug!(
                    session_id = request.session_id,
                    relay_num = request.relay_num,
                    "provider finished relay successfully"
                );
                Ok(reply)
            }
            Err(err) => {
                // Data-reliability relays never touched the counters.
                if request.data_reliability.is_none() {
                    if let Err(rollback_err) = self.on_relay_failure(&init).await {
                        error!(
                            session_id = request.session_id,
                            "relay rollback failed: {rollback_err}"
                        );
                        return Err(rollback_err);
                    }
                }
                error!(
                    session_id = request.session_id,
                    consumer = %init.consumer,
                    "relay failed: {err}"
                );
                Err(err)
            }
        }
    }

    /// Admission: validate the request and commit its session accounting.
    async fn init_relay(&self, request: &RelayRequest) -> Result<InitializedRelay> {
        let current = self.current_epoch();
        let previous = self.previous_epoch();
        if request.block_height != current && request.block_height != previous {
            return Err(Error::RelayRejected(format!(
                "request epoch {} is neither current ({current}) nor previous ({previous})",
                request.block_height
            )));
        }
        if request.provider != self.signer.address() {
            return Err(Error::RelayRejected(format!(
                "request addressed to provider {}, this is {}",
                request.provider,
                self.signer.address()
            )));
        }
        let consumer = self.signer.recover_consumer(request)?;
        if request.chain_id != self.config.chain_id {
            return Err(Error::RelayRejected(format!(
                "chain {} not served, this provider serves {}",
                request.chain_id, self.config.chain_id
            )));
        }

        let auth = self.authorize(&consumer, request.block_height).await?;
        let node_msg = self
            .proxy
            .parse_msg(&request.api_url, &request.data, &request.connection_type)?;

        let relay_session = if request.data_reliability.is_some() {
            self.init_data_reliability(request, &consumer, &auth).await?;
            None
        } else {
            let compute_units = node_msg.service_api.compute_units;
            Some(
                self.init_regular_relay(request, &consumer, compute_units)
                    .await?,
            )
        };

        Ok(InitializedRelay {
            consumer,
            node_msg,
            relay_session,
        })
    }

    /// Authorize a consumer, caching the response per epoch.
    async fn authorize(&self, consumer: &str, epoch: u64) -> Result<AuthorizedConsumer> {
        let key = (consumer.to_string(), epoch);
        if let Some(cached) = self.auth_cache.lock().get(&key) {
            return Ok(cached.clone());
        }
        let auth = self.state.is_authorized_consumer(consumer, epoch).await?;
        if !auth.valid {
            return Err(Error::NotAuthorized {
                consumer: consumer.to_string(),
                block: epoch,
            });
        }
        self.auth_cache.lock().insert(key, auth.clone());
        Ok(auth)
    }

    /// Regular-relay admission: session counters and quota, then commit.
    async fn init_regular_relay(
        &self,
        request: &RelayRequest,
        consumer: &str,
        compute_units: u64,
    ) -> Result<Arc<Mutex<RelaySession>>> {
        if request.session_id == DATA_RELIABILITY_SESSION_ID {
            return Err(Error::RelayRejected(
                "session id 0 is reserved for data reliability".to_string(),
            ));
        }
        let user_entry = self.registry.get_or_create(consumer);
        let needs_create = !user_entry.lock().sessions.contains_key(&request.session_id);
        let (vrf_pk, max_cu) = if needs_create {
            self.state
                .vrf_pk_and_max_cu(consumer, &request.chain_id, request.block_height)
                .await?
        } else {
            (crate::state::VrfPublicKey(Vec::new()), 0)
        };

        let rewards = Arc::clone(&self.rewards);
        let session = get_or_create_session(
            &user_entry,
            consumer,
            request,
            max_cu,
            vrf_pk,
            |session| rewards.append(request.block_height, Arc::clone(session)),
        )?;

        // Admission through commit happens under the session guard.
        let mut locked = session.lock().await;
        if locked.pairing_epoch != request.block_height {
            return Err(Error::RelayRejected(format!(
                "request epoch {} does not match session epoch {}",
                request.block_height, locked.pairing_epoch
            )));
        }

        let expected_relay_num = locked.relay_num + 1;
        if request.relay_num < expected_relay_num {
            return Err(Error::SessionOutOfSync(format!(
                "relay num {} tries to overwrite past usage, expected {expected_relay_num}",
                request.relay_num
            )));
        }
        if request.relay_num > expected_relay_num {
            // The consumer skipped ahead, most likely over a relay we never
            // saw. Serviced anyway; the proof still covers the larger sums.
            error!(
                session_id = request.session_id,
                expected = expected_relay_num,
                received = request.relay_num,
                "consumer requested a larger relay num than expected"
            );
        }
        if locked.cu_sum >= request.cu_sum
            || locked.cu_sum + compute_units != request.cu_sum
        {
            return Err(Error::SessionOutOfSync(format!(
                "bad cu sum: session {} + api {compute_units} != request {}",
                locked.cu_sum, request.cu_sum
            )));
        }

        {
            let mut user = user_entry.lock();
            let epoch_data = user
                .data_by_epoch
                .get_mut(&request.block_height)
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "missing epoch data for consumer {consumer} at {}",
                        request.block_height
                    ))
                })?;
            if epoch_data.used_compute_units + compute_units > epoch_data.max_compute_units {
                return Err(Error::RelayRejected(format!(
                    "consumer cu overflow: used {} + {compute_units} over max {}",
                    epoch_data.used_compute_units, epoch_data.max_compute_units
                )));
            }
            epoch_data.used_compute_units += compute_units;
        }

        locked.relay_num += 1;
        locked.cu_sum = request.cu_sum;
        locked.proof = Some(request.clone());
        drop(locked);
        Ok(session)
    }

    /// Data-reliability admission. DR relays do not consume quota and save
    /// no proof; the VRF record is attached to a payment proof later.
    async fn init_data_reliability(
        &self,
        request: &RelayRequest,
        consumer: &str,
        auth: &AuthorizedConsumer,
    ) -> Result<()> {
        let vrf_data = request
            .data_reliability
            .as_ref()
            .ok_or_else(|| Error::Internal("data reliability branch without vrf data".into()))?;

        if request.relay_num > DATA_RELIABILITY_RELAY_NUM {
            return Err(Error::DataReliability(format!(
                "relay num must be {DATA_RELIABILITY_RELAY_NUM} for a data reliability probe, got {}",
                request.relay_num
            )));
        }
        if request.cu_sum != DATA_RELIABILITY_CU_SUM {
            return Err(Error::DataReliability(format!(
                "cu sum {} differs from the data reliability cu sum",
                request.cu_sum
            )));
        }

        let (vrf_pk, max_cu) = self
            .state
            .vrf_pk_and_max_cu(consumer, &request.chain_id, request.block_height)
            .await?;

        let user_entry = self.registry.get_or_create(consumer);
        {
            let user = user_entry.lock();
            if user
                .data_by_epoch
                .get(&request.block_height)
                .is_some_and(|data| data.data_reliability.is_some())
            {
                return Err(Error::DataReliability(
                    "data reliability can only be used once per consumer per epoch".to_string(),
                ));
            }
        }

        if vrf_data.query_hash != request.query_hash() {
            return Err(Error::DataReliability(format!(
                "query hash mismatch on data reliability message: got {}, computed {}",
                hex::encode(&vrf_data.query_hash),
                hex::encode(request.query_hash())
            )));
        }
        if !self.signer.verify_vrf_data(consumer, &vrf_pk, request)? {
            return Err(Error::DataReliability(
                "invalid consumer signature or vrf proof".to_string(),
            ));
        }
        let original_provider = self.signer.recover_reliability_signer(request)?;
        let paired = self
            .state
            .is_authorized_pairing(consumer, &original_provider, request.block_height)
            .await?;
        if !paired {
            return Err(Error::DataReliability(format!(
                "original provider {original_provider} was not paired with the consumer"
            )));
        }

        let providers_count = self.providers_count.load(Ordering::Acquire);
        let index = vrf_index(
            &vrf_data.vrf_value,
            providers_count,
            self.config.reliability_threshold,
        )
        .ok_or_else(|| {
            Error::DataReliability(
                "vrf value in data reliability request does not meet threshold".to_string(),
            )
        })?;
        if index != auth.self_index {
            return Err(Error::DataReliability(format!(
                "vrf index {index} does not select this provider (self index {})",
                auth.self_index
            )));
        }

        info!(%consumer, epoch = request.block_height, "valid data reliability request");
        let mut user = user_entry.lock();
        user.epoch_data_or_create(request.block_height, max_cu, vrf_pk)
            .data_reliability = Some(vrf_data.clone());
        Ok(())
    }

    /// Roll back the admission commit after a failed relay.
    async fn on_relay_failure(&self, init: &InitializedRelay) -> Result<()> {
        let Some(session) = &init.relay_session else {
            return Ok(());
        };
        let compute_units = init.node_msg.service_api.compute_units;

        let pairing_epoch;
        let mut out_of_sync = false;
        {
            let mut locked = session.lock().await;
            pairing_epoch = locked.pairing_epoch;
            match (
                locked.relay_num.checked_sub(1),
                locked.cu_sum.checked_sub(compute_units),
            ) {
                (Some(relay_num), Some(cu_sum)) => {
                    locked.relay_num = relay_num;
                    locked.cu_sum = cu_sum;
                }
                _ => {
                    error!(
                        session_id = locked.unique_id,
                        "relay counters went negative on rollback"
                    );
                    locked.relay_num = 0;
                    locked.cu_sum = 0;
                    out_of_sync = true;
                }
            }
        }

        if let Some(user_entry) = self.registry.get(&init.consumer) {
            let mut user = user_entry.lock();
            if let Some(epoch_data) = user.data_by_epoch.get_mut(&pairing_epoch) {
                if let Some(used) = epoch_data.used_compute_units.checked_sub(compute_units) {
                    epoch_data.used_compute_units = used;
                } else {
                    // The provider lost sync with the consumer itself, not
                    // just one session.
                    epoch_data.used_compute_units = 0;
                    user.is_block_listed = true;
                    error!(
                        consumer = %init.consumer,
                        "consumer accounting went negative, blocking consumer"
                    );
                    return Err(Error::SessionOutOfSync(
                        "consumer compute units reached a negative value".to_string(),
                    ));
                }
            }
        }

        if out_of_sync {
            return Err(Error::SessionOutOfSync(
                "session counters reached a negative value".to_string(),
            ));
        }
        Ok(())
    }

    /// Relative range arguments selecting the finalization proof blocks.
    fn finalization_range_args(&self) -> (i64, i64) {
        let criteria = i64::from(self.config.finalization_criteria.max(1));
        let proof = i64::from(self.config.finalization_proof_blocks.max(1));
        (-(criteria + proof), -criteria)
    }

    /// Execute the relay: cache lookup, upstream forward, finalization data
    /// and signatures.
    async fn try_relay(
        &self,
        request: &RelayRequest,
        init: &InitializedRelay,
    ) -> Result<RelayReply> {
        let mut latest_block = 0i64;
        let mut finalized_hashes: BTreeMap<i64, String> = BTreeMap::new();
        let mut requested_block_hash = None;
        let mut finalized = false;

        if self.config.data_reliability_enabled {
            let tracker = self.tracker.as_ref().ok_or_else(|| {
                Error::Internal("data reliability enabled without a chain tracker".to_string())
            })?;
            let (from_arg, to_arg) = self.finalization_range_args();
            let (latest, blocks) = tracker
                .get_latest_block_data(from_arg, to_arg, NOT_APPLICABLE)
                .map_err(|e| {
                    Error::Upstream(format!("could not guarantee data reliability: {e}"))
                })?;
            latest_block = latest;
            for block in blocks {
                finalized_hashes.insert(block.block, block.hash);
            }

            let effective_block = latest_arg_to_block_num(request.request_block, latest);
            match tracker.get_latest_block_data(NOT_APPLICABLE, NOT_APPLICABLE, effective_block) {
                Ok((_, mut blocks)) => {
                    requested_block_hash = blocks.pop().map(|b| b.hash);
                }
                Err(e) => {
                    // Can still service the relay, just not from the cache.
                    warn!(
                        requested_block = effective_block,
                        "no hash data for requested block: {e}"
                    );
                }
            }
            finalized =
                effective_block <= latest - i64::from(self.config.finalization_criteria);
        }

        let cache_key = CacheKey {
            api_interface: self.proxy.api_interface(),
            chain_id: self.config.chain_id.clone(),
            request_hash: request.cache_hash(),
            requested_block_hash: requested_block_hash.clone(),
            finalized,
        };
        let cacheable = requested_block_hash.is_some() || finalized;

        let mut reply = None;
        if cacheable {
            match self.cache.get_entry(&cache_key).await {
                Ok(cached) => reply = Some(cached),
                Err(e) if matches!(e, Error::CacheNotConnected(_)) => {
                    warn!("cache not connected: {e}");
                }
                Err(_) => {}
            }
        }

        let mut reply = match reply {
            Some(reply) => reply,
            None => {
                let (reply, _) = self
                    .proxy
                    .send(&init.node_msg, None)
                    .await
                    .map_err(|e| Error::Upstream(format!("sending node message failed: {e}")))?;
                if cacheable {
                    if let Err(e) = self.cache.set_entry(&cache_key, &reply).await {
                        if !matches!(e, Error::CacheNotInitialised) {
                            warn!("error updating cache with new entry: {e}");
                        }
                    }
                }
                reply
            }
        };

        let api_name = &init.node_msg.service_api.name;
        if api_name.contains("unsubscribe") {
            self.process_unsubscribe(api_name, &init.consumer, init.node_msg.params.as_ref());
        }

        reply.finalized_blocks_hashes = serde_json::to_vec(&finalized_hashes)?;
        reply.latest_block = latest_block;
        reply.sig = self.signer.sign_reply(&reply, request)?;
        if self.config.data_reliability_enabled {
            reply.sig_blocks = self.signer.sign_finalization(&reply, request, &init.consumer)?;
        }
        Ok(reply)
    }

    /// Tear down subscriptions named by an unsubscribe call.
    ///
    /// Ethereum-style calls carry the subscription id as the first list
    /// param; Tendermint-style calls carry a `query` key (for `unsubscribe`)
    /// or drop every subscription (`unsubscribe_all`).
    fn process_unsubscribe(
        &self,
        api_name: &str,
        consumer: &str,
        params: Option<&serde_json::Value>,
    ) {
        let Some(user_entry) = self.registry.get(consumer) else {
            return;
        };
        let mut user = user_entry.lock();
        match params {
            Some(serde_json::Value::Array(list)) => {
                if let Some(serde_json::Value::String(id)) = list.first() {
                    if let Some(sub) = user.subs.remove(id) {
                        sub.disconnect();
                    }
                }
            }
            Some(serde_json::Value::Object(map)) => {
                if api_name == "unsubscribe" {
                    if let Some(serde_json::Value::String(query)) = map.get("query") {
                        if let Some(sub) = user.subs.remove(query) {
                            sub.disconnect();
                        }
                    }
                } else {
                    user.disconnect_all_subscriptions();
                }
            }
            _ => {}
        }
    }

    /// Handle a subscription relay: admit it like a regular relay, open the
    /// upstream subscription, and stream replies into `sink` until the
    /// upstream errors, marshalling fails, or the consumer goes away.
    ///
    /// # Errors
    ///
    /// Returns the terminating error; session accounting is rolled back for
    /// non-data-reliability relays that never streamed successfully.
    pub async fn handle_relay_subscribe(
        &self,
        request: &RelayRequest,
        sink: mpsc::Sender<RelayReply>,
    ) -> Result<()> {
        info!(
            session_id = request.session_id,
            "provider got subscribe relay request"
        );
        let init = self.init_relay(request).await?;
        match self.try_relay_subscribe(request, &init, sink).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if request.data_reliability.is_none() {
                    if let Err(rollback_err) = self.on_relay_failure(&init).await {
                        return Err(rollback_err);
                    }
                }
                Err(err)
            }
        }
    }

    async fn try_relay_subscribe(
        &self,
        request: &RelayRequest,
        init: &InitializedRelay,
        sink: mpsc::Sender<RelayReply>,
    ) -> Result<()> {
        let (replies_tx, mut replies_rx) = mpsc::channel(32);
        let (first_reply, handle) = self.proxy.send(&init.node_msg, Some(replies_tx)).await?;
        let handle = handle.ok_or_else(|| {
            Error::Subscription("proxy did not open an upstream subscription".to_string())
        })?;
        let subscription_id = handle.id().to_string();

        let user_entry = self.registry.get_or_create(&init.consumer);
        {
            let mut user = user_entry.lock();
            if user.subs.contains_key(&subscription_id) {
                handle.disconnect();
                return Err(Error::Subscription(format!(
                    "subscription id {subscription_id} already exists"
                )));
            }
            user.subs
                .insert(subscription_id.clone(), Subscription::new(handle));
        }

        // First reply carries the upstream RPC id.
        if let Err(e) = sink.send(first_reply).await {
            warn!("consumer dropped before the first subscription reply: {e}");
        }

        let teardown = |reason: String| {
            let mut user = user_entry.lock();
            if let Some(sub) = user.subs.remove(&subscription_id) {
                sub.disconnect();
            }
            Error::Subscription(reason)
        };

        loop {
            let Some(value) = replies_rx.recv().await else {
                return Err(teardown("upstream subscription closed".to_string()));
            };
            let data = match serde_json::to_vec(&value) {
                Ok(data) => data,
                Err(e) => {
                    return Err(teardown(format!("failed marshalling subscribe reply: {e}")));
                }
            };
            debug!(subscription_id = %subscription_id, bytes = data.len(), "forwarding subscription data");
            if sink
                .send(RelayReply {
                    data,
                    ..RelayReply::default()
                })
                .await
                .is_err()
            {
                // Usually the consumer closed the connection.
                warn!(subscription_id = %subscription_id, "consumer closed subscription");
                return Err(teardown("consumer closed the subscription".to_string()));
            }
        }
    }
}
