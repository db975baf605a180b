//! Per-consumer session state on the provider side.
//!
//! A [`UserSessions`] entry tracks everything the provider knows about one
//! consumer: its relay sessions, open subscriptions, and per-epoch
//! compute-unit accounting. The registry owns all entries; relay sessions
//! refer back to their consumer by address, never by owning pointer, so the
//! accounting rollback can find the parent without a reference cycle.

use crate::chain::SubscriptionHandle;
use crate::error::{Error, Result};
use crate::state::VrfPublicKey;
use crate::types::{RelayRequest, VrfData};
use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Compute-unit accounting for one consumer in one epoch.
#[derive(Debug, Clone)]
pub struct UserEpochData {
    /// Compute units consumed so far.
    pub used_compute_units: u64,
    /// On-chain allowance for the epoch.
    pub max_compute_units: u64,
    /// The consumer's VRF public key at this epoch.
    pub vrf_pk: VrfPublicKey,
    /// Data-reliability record, at most one per epoch; attached to a payment
    /// proof when rewards are claimed.
    pub data_reliability: Option<VrfData>,
}

/// One provider-side relay session.
///
/// `consumer` is a back-reference by address into the registry; it exists for
/// accounting rollback and does not control the consumer entry's lifetime.
#[derive(Debug)]
pub struct RelaySession {
    /// The consumer this session belongs to.
    pub consumer: String,
    /// Session identifier chosen by the consumer.
    pub unique_id: u64,
    /// Cumulative compute units committed on this session.
    pub cu_sum: u64,
    /// Relay counter; the next relay must carry `relay_num + 1`.
    pub relay_num: u64,
    /// The last committed request, the only evidence used to claim payment.
    pub proof: Option<RelayRequest>,
    /// Epoch the session was created in; every relay must carry it.
    pub pairing_epoch: u64,
}

/// An open subscription relay.
#[derive(Debug)]
pub struct Subscription {
    /// Upstream-assigned subscription id.
    pub id: String,
    handle: SubscriptionHandle,
}

impl Subscription {
    /// Wrap an upstream subscription handle.
    #[must_use]
    pub fn new(handle: SubscriptionHandle) -> Self {
        Self {
            id: handle.id().to_string(),
            handle,
        }
    }

    /// Close the upstream subscription.
    pub fn disconnect(&self) {
        self.handle.disconnect();
    }
}

/// Everything the provider tracks for one consumer.
#[derive(Debug, Default)]
pub struct UserSessions {
    /// Sessions by session id.
    pub sessions: HashMap<u64, Arc<Mutex<RelaySession>>>,
    /// Open subscriptions by subscription id.
    pub subs: HashMap<String, Subscription>,
    /// Accounting per epoch.
    pub data_by_epoch: HashMap<u64, UserEpochData>,
    /// Blocklisted consumers are refused at admission.
    pub is_block_listed: bool,
}

impl UserSessions {
    /// Ensure epoch accounting exists, creating it with the given allowance.
    pub fn epoch_data_or_create(
        &mut self,
        epoch: u64,
        max_compute_units: u64,
        vrf_pk: VrfPublicKey,
    ) -> &mut UserEpochData {
        self.data_by_epoch
            .entry(epoch)
            .or_insert_with(|| UserEpochData {
                used_compute_units: 0,
                max_compute_units,
                vrf_pk,
                data_reliability: None,
            })
    }

    /// Tear down every subscription of this consumer.
    pub fn disconnect_all_subscriptions(&mut self) {
        for (_, sub) in self.subs.drain() {
            sub.disconnect();
        }
    }
}

/// Registry of all consumers the provider has state for.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    users: PlMutex<HashMap<String, Arc<PlMutex<UserSessions>>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the entry for `consumer`.
    #[must_use]
    pub fn get_or_create(&self, consumer: &str) -> Arc<PlMutex<UserSessions>> {
        Arc::clone(
            self.users
                .lock()
                .entry(consumer.to_string())
                .or_insert_with(|| Arc::new(PlMutex::new(UserSessions::default()))),
        )
    }

    /// Look up the entry for `consumer` without creating it.
    #[must_use]
    pub fn get(&self, consumer: &str) -> Option<Arc<PlMutex<UserSessions>>> {
        self.users.lock().get(consumer).cloned()
    }

    /// Remove consumers that hold no sessions anymore.
    pub fn remove_if_empty(&self, consumers: &[String]) {
        let mut users = self.users.lock();
        for consumer in consumers {
            let empty = users
                .get(consumer)
                .is_some_and(|entry| entry.lock().sessions.is_empty());
            if empty {
                debug!(%consumer, "removing drained consumer entry");
                users.remove(consumer);
            }
        }
    }

    /// Number of tracked consumers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.lock().is_empty()
    }
}

/// Get an existing relay session or create one bound to the request's epoch.
///
/// New sessions are reported through `on_created` so the caller can append
/// them to the reward ledger exactly once.
///
/// # Errors
///
/// Returns [`Error::ConsumerBlockListed`] for blocklisted consumers.
pub fn get_or_create_session(
    user_entry: &Arc<PlMutex<UserSessions>>,
    consumer: &str,
    request: &RelayRequest,
    max_compute_units: u64,
    vrf_pk: VrfPublicKey,
    on_created: impl FnOnce(&Arc<Mutex<RelaySession>>),
) -> Result<Arc<Mutex<RelaySession>>> {
    let mut user = user_entry.lock();
    if user.is_block_listed {
        return Err(Error::ConsumerBlockListed(consumer.to_string()));
    }
    if let Some(session) = user.sessions.get(&request.session_id) {
        return Ok(Arc::clone(session));
    }

    let session = Arc::new(Mutex::new(RelaySession {
        consumer: consumer.to_string(),
        unique_id: request.session_id,
        cu_sum: 0,
        relay_num: 0,
        proof: None,
        pairing_epoch: request.block_height,
    }));
    info!(
        consumer,
        session_id = request.session_id,
        epoch = request.block_height,
        "new session for consumer"
    );
    user.sessions.insert(request.session_id, Arc::clone(&session));
    user.epoch_data_or_create(request.block_height, max_compute_units, vrf_pk);
    on_created(&session);
    Ok(session)
}
