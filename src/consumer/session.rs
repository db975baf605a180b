//! Per-provider session pool on the consumer side.
//!
//! A [`ConsumerSessionsWithProvider`] owns every session the consumer has
//! open against one provider for the current epoch, plus the provider's
//! endpoints and compute-unit budget. Sessions are handed out as
//! [`ConsumerSessionHandle`] capabilities: the handle holds the session's
//! exclusive guard from acquisition until one of the manager's completion
//! methods consumes it, so relays within a session are strictly serialized
//! by construction.

use crate::consumer::qos::QosInfo;
use crate::error::{Error, Result};
use crate::types::{new_session_id, DATA_RELIABILITY_SESSION_ID};
use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// One relay endpoint of a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Network address of the endpoint.
    pub address: String,
    /// Disabled endpoints are skipped; a provider with no enabled endpoint
    /// is blocked for the epoch.
    pub enabled: bool,
}

/// A single consumer-side relay session.
#[derive(Debug)]
pub struct SingleConsumerSession {
    /// Random 63-bit identifier, or [`DATA_RELIABILITY_SESSION_ID`].
    pub session_id: u64,
    /// Cumulative compute units of committed relays.
    pub cu_sum: u64,
    /// Relay counter, strictly monotonic.
    pub relay_num: u64,
    /// Compute units pre-charged for the in-flight relay.
    pub latest_relay_cu: u64,
    /// Latest block the provider serviced on this session.
    pub latest_block: i64,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u64,
    /// Blocklisted sessions are never handed out again.
    pub block_listed: bool,
    /// QoS scores for this session.
    pub qos: QosInfo,
    /// Endpoint chosen for this session.
    pub endpoint: String,
}

impl SingleConsumerSession {
    fn new(session_id: u64, endpoint: String) -> Self {
        Self {
            session_id,
            cu_sum: 0,
            relay_num: 0,
            latest_relay_cu: 0,
            latest_block: 0,
            consecutive_failures: 0,
            block_listed: false,
            qos: QosInfo::default(),
            endpoint,
        }
    }
}

/// Exclusive capability over one session, consumed by the manager's
/// `on_session_done` / `on_session_failure` / `on_session_unused`.
pub struct ConsumerSessionHandle {
    guard: OwnedMutexGuard<SingleConsumerSession>,
    parent: Arc<ConsumerSessionsWithProvider>,
}

impl ConsumerSessionHandle {
    /// The pool this session belongs to.
    #[must_use]
    pub fn parent(&self) -> &Arc<ConsumerSessionsWithProvider> {
        &self.parent
    }
}

impl Deref for ConsumerSessionHandle {
    type Target = SingleConsumerSession;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for ConsumerSessionHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl std::fmt::Debug for ConsumerSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerSessionHandle")
            .field("session_id", &self.guard.session_id)
            .field("provider", &self.parent.address)
            .finish()
    }
}

/// All sessions the consumer holds against one provider for an epoch.
#[derive(Debug)]
pub struct ConsumerSessionsWithProvider {
    /// Provider account address.
    pub address: String,
    /// Epoch CU allowance on this provider.
    pub max_compute_units: u64,
    /// Epoch this pairing was installed for.
    pairing_epoch: AtomicU64,
    used_compute_units: PlMutex<u64>,
    endpoints: PlMutex<Vec<Endpoint>>,
    sessions: PlMutex<HashMap<u64, Arc<Mutex<SingleConsumerSession>>>>,
    data_reliability: PlMutex<Option<Arc<Mutex<SingleConsumerSession>>>>,
}

impl ConsumerSessionsWithProvider {
    /// Create a pool for `address` with the given endpoints and CU budget.
    #[must_use]
    pub fn new(address: String, endpoints: Vec<String>, max_compute_units: u64) -> Self {
        Self {
            address,
            max_compute_units,
            pairing_epoch: AtomicU64::new(0),
            used_compute_units: PlMutex::new(0),
            endpoints: PlMutex::new(
                endpoints
                    .into_iter()
                    .map(|address| Endpoint {
                        address,
                        enabled: true,
                    })
                    .collect(),
            ),
            sessions: PlMutex::new(HashMap::new()),
            data_reliability: PlMutex::new(None),
        }
    }

    /// The epoch this pairing belongs to.
    #[must_use]
    pub fn pairing_epoch(&self) -> u64 {
        self.pairing_epoch.load(Ordering::Acquire)
    }

    pub(crate) fn set_pairing_epoch(&self, epoch: u64) {
        self.pairing_epoch.store(epoch, Ordering::Release);
    }

    /// Compute units currently charged against this provider.
    #[must_use]
    pub fn used_compute_units(&self) -> u64 {
        *self.used_compute_units.lock()
    }

    /// Check the provider could take `cu_needed` more compute units.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MaxComputeUnitsExceeded`] when it could not.
    pub fn validate_compute_units(&self, cu_needed: u64) -> Result<()> {
        let used = *self.used_compute_units.lock();
        if used + cu_needed > self.max_compute_units {
            return Err(Error::MaxComputeUnitsExceeded {
                provider: self.address.clone(),
                used,
                max: self.max_compute_units,
            });
        }
        Ok(())
    }

    /// Charge `cu` compute units.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MaxComputeUnitsExceeded`] when the charge would
    /// overflow the allowance.
    pub fn add_used_compute_units(&self, cu: u64) -> Result<()> {
        let mut used = self.used_compute_units.lock();
        if *used + cu > self.max_compute_units {
            return Err(Error::MaxComputeUnitsExceeded {
                provider: self.address.clone(),
                used: *used,
                max: self.max_compute_units,
            });
        }
        *used += cu;
        Ok(())
    }

    /// Refund `cu` compute units.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] when the refund would drop below zero;
    /// the manager blocklists the provider on that signal.
    pub fn decrease_used_compute_units(&self, cu: u64) -> Result<()> {
        let mut used = self.used_compute_units.lock();
        if cu > *used {
            return Err(Error::Internal(format!(
                "compute unit refund below zero for provider {}: used {}, refund {}",
                self.address, *used, cu
            )));
        }
        *used -= cu;
        Ok(())
    }

    /// Pick an enabled endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllProviderEndpointsDisabled`] when none is left.
    pub fn fetch_endpoint(&self) -> Result<String> {
        self.endpoints
            .lock()
            .iter()
            .find(|e| e.enabled)
            .map(|e| e.address.clone())
            .ok_or_else(|| Error::AllProviderEndpointsDisabled(self.address.clone()))
    }

    /// Mark an endpoint as unusable for the rest of the epoch.
    pub fn disable_endpoint(&self, address: &str) {
        for endpoint in self.endpoints.lock().iter_mut() {
            if endpoint.address == address {
                endpoint.enabled = false;
            }
        }
    }

    /// Acquire a session: reuse an idle one, or create a new one while the
    /// pool is under `max_sessions`.
    ///
    /// # Errors
    ///
    /// - [`Error::MaximumBlockListedSessions`] when too many sessions are
    ///   blocklisted; the caller blocks the provider for the epoch.
    /// - [`Error::MaximumSessionsExceeded`] when the pool is full of busy
    ///   sessions; the caller skips this provider for this call.
    /// - [`Error::AllProviderEndpointsDisabled`] via endpoint selection.
    pub fn get_session(
        self: &Arc<Self>,
        max_sessions: usize,
        max_blocklisted: usize,
    ) -> Result<ConsumerSessionHandle> {
        let endpoint = self.fetch_endpoint()?;
        let mut sessions = self.sessions.lock();

        let mut blocklisted = 0usize;
        for session in sessions.values() {
            if let Ok(guard) = Arc::clone(session).try_lock_owned() {
                if guard.block_listed {
                    blocklisted += 1;
                    continue;
                }
                return Ok(ConsumerSessionHandle {
                    guard,
                    parent: Arc::clone(self),
                });
            }
        }
        if blocklisted > max_blocklisted {
            return Err(Error::MaximumBlockListedSessions(self.address.clone()));
        }
        if sessions.len() >= max_sessions {
            return Err(Error::MaximumSessionsExceeded(self.address.clone()));
        }

        let session_id = new_session_id();
        let session = Arc::new(Mutex::new(SingleConsumerSession::new(
            session_id,
            endpoint,
        )));
        let guard = Arc::clone(&session)
            .try_lock_owned()
            .map_err(|_| Error::Internal("fresh session already locked".to_string()))?;
        sessions.insert(session_id, session);
        debug!(provider = %self.address, session_id, "created consumer session");
        Ok(ConsumerSessionHandle {
            guard,
            parent: Arc::clone(self),
        })
    }

    /// Acquire the provider's one data-reliability session for this epoch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DataReliability`] when one was already created.
    pub fn get_data_reliability_session(self: &Arc<Self>) -> Result<ConsumerSessionHandle> {
        let endpoint = self.fetch_endpoint()?;
        let mut slot = self.data_reliability.lock();
        if slot.is_some() {
            return Err(Error::DataReliability(format!(
                "data reliability session already exists for provider {}",
                self.address
            )));
        }
        let session = Arc::new(Mutex::new(SingleConsumerSession::new(
            DATA_RELIABILITY_SESSION_ID,
            endpoint,
        )));
        let guard = Arc::clone(&session)
            .try_lock_owned()
            .map_err(|_| Error::Internal("fresh session already locked".to_string()))?;
        *slot = Some(session);
        Ok(ConsumerSessionHandle {
            guard,
            parent: Arc::clone(self),
        })
    }

    /// Session QoS reports, for provider-level aggregation.
    #[must_use]
    pub fn qos_reports(&self) -> Vec<crate::types::QosReport> {
        self.sessions
            .lock()
            .values()
            .filter_map(|session| session.try_lock().map(|s| s.qos.report()).ok())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}
