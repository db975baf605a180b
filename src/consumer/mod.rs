//! Consumer session manager.
//!
//! Holds the active provider pairing for the current epoch and hands out
//! session capabilities for outbound relays. The manager accounts compute
//! units against each provider's epoch allowance, blocks (and optionally
//! reports) misbehaving providers, and keeps the previous epoch's pairing
//! alive as a purge list so in-flight sessions can complete across a
//! rotation.

pub mod qos;
mod session;

pub use session::{
    ConsumerSessionHandle, ConsumerSessionsWithProvider, Endpoint, SingleConsumerSession,
};

use crate::config::{SessionConfig, TimeoutConfig};
use crate::error::{Error, Result};
use crate::types::RELAY_NUMBER_INCREMENT;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Result of a successful session acquisition.
#[derive(Debug)]
pub struct SessionAcquisition {
    /// The exclusive session capability.
    pub session: ConsumerSessionHandle,
    /// Epoch the pairing belongs to.
    pub epoch: u64,
    /// Address of the chosen provider.
    pub provider_address: String,
    /// JSON-encoded list of providers reported this epoch, ready to attach
    /// to the outbound relay.
    pub reported_providers: Vec<u8>,
}

#[derive(Default)]
struct CsmInner {
    pairing: HashMap<String, Arc<ConsumerSessionsWithProvider>>,
    /// All addresses of the installed pairing, in on-chain order; indexed by
    /// data-reliability VRF results.
    pairing_addresses: Vec<String>,
    /// Addresses still eligible for selection this epoch.
    valid_addresses: Vec<String>,
    /// Providers blocked-and-reported this epoch.
    added_to_purge_and_report: HashSet<String>,
    /// Previous epoch's pairing, kept so in-flight sessions can complete.
    pairing_purge: HashMap<String, Arc<ConsumerSessionsWithProvider>>,
    number_of_resets: u64,
}

/// Manages provider pairings and consumer sessions across epochs.
pub struct ConsumerSessionManager {
    config: SessionConfig,
    timeouts: TimeoutConfig,
    current_epoch: AtomicU64,
    inner: RwLock<CsmInner>,
}

impl ConsumerSessionManager {
    /// Create an empty manager; call
    /// [`ConsumerSessionManager::update_all_providers`] to install a pairing.
    #[must_use]
    pub fn new(config: SessionConfig, timeouts: TimeoutConfig) -> Self {
        Self {
            config,
            timeouts,
            current_epoch: AtomicU64::new(0),
            inner: RwLock::new(CsmInner::default()),
        }
    }

    /// The epoch of the installed pairing. Atomic read, no lock.
    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// How many times the valid-address list was reset to the full pairing.
    /// A reset signals that session state from the previous selection
    /// generation is stale.
    #[must_use]
    pub fn number_of_resets(&self) -> u64 {
        self.inner.read().number_of_resets
    }

    /// Install the pairing for a new epoch.
    ///
    /// The current pairing moves to the purge list and the previous purge
    /// list (two epochs old) is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EpochMismatch`] when `epoch` is not newer than the
    /// installed one.
    pub fn update_all_providers(
        &self,
        epoch: u64,
        pairing_list: Vec<Arc<ConsumerSessionsWithProvider>>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let current = self.current_epoch();
        if epoch <= current {
            return Err(Error::EpochMismatch {
                action_epoch: epoch,
                current_epoch: current,
            });
        }
        self.current_epoch.store(epoch, Ordering::Release);

        inner.pairing_addresses = pairing_list.iter().map(|p| p.address.clone()).collect();
        inner.added_to_purge_and_report = HashSet::new();
        inner.number_of_resets = 0;

        // The old purge list dies here; nothing can still hold a session in
        // a pairing two epochs old.
        inner.pairing_purge = std::mem::take(&mut inner.pairing);
        inner.pairing = pairing_list
            .into_iter()
            .map(|provider| {
                provider.set_pairing_epoch(epoch);
                (provider.address.clone(), provider)
            })
            .collect();
        inner.valid_addresses = inner.pairing_addresses.clone();
        debug!(
            epoch,
            providers = inner.pairing_addresses.len(),
            "installed new pairing"
        );
        Ok(())
    }

    /// Reset the valid-address list to the full pairing when it drained.
    fn validate_pairing_not_empty(&self) -> u64 {
        {
            let inner = self.inner.read();
            if !inner.valid_addresses.is_empty() {
                return inner.number_of_resets;
            }
        }
        let mut inner = self.inner.write();
        // Re-verify after taking the write lock.
        if inner.valid_addresses.is_empty() {
            warn!("provider pairing list is empty, resetting state");
            inner.valid_addresses = inner.pairing_addresses.clone();
            inner.number_of_resets += 1;
        }
        inner.number_of_resets
    }

    /// Pick a provider uniformly at random from the valid addresses minus
    /// the ignored set. Caller holds the read lock.
    fn pick_provider(inner: &CsmInner, ignored: &HashSet<String>) -> Result<String> {
        let candidates: Vec<&String> = inner
            .valid_addresses
            .iter()
            .filter(|addr| !ignored.contains(*addr))
            .collect();
        if candidates.is_empty() {
            return Err(Error::PairingListEmpty);
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Ok(candidates[index].clone())
    }

    /// Acquire a session for a relay costing `cu_needed` compute units.
    ///
    /// `unwanted_providers` seeds the set of providers skipped for this call;
    /// the set is also extended locally as providers fail selection. The
    /// returned capability must be consumed by
    /// [`ConsumerSessionManager::on_session_done`],
    /// [`ConsumerSessionManager::on_session_failure`] or
    /// [`ConsumerSessionManager::on_session_unused`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::PairingListEmpty`] when no provider is selectable.
    pub fn get_session(
        &self,
        cu_needed: u64,
        unwanted_providers: &HashSet<String>,
    ) -> Result<SessionAcquisition> {
        self.validate_pairing_not_empty();

        let mut ignored = unwanted_providers.clone();
        let mut ignored_epoch = self.current_epoch();
        loop {
            let (provider, provider_address, session_epoch) = {
                let inner = self.inner.read();
                let epoch = self.current_epoch();
                if ignored_epoch < epoch {
                    // The pairing changed under us; the ignore set belongs to
                    // the old pairing.
                    debug!(
                        ignored_epoch,
                        epoch, "epoch changed mid-selection, clearing ignored providers"
                    );
                    ignored = HashSet::new();
                    ignored_epoch = epoch;
                }
                let address = Self::pick_provider(&inner, &ignored)?;
                let provider = inner
                    .pairing
                    .get(&address)
                    .cloned()
                    .ok_or_else(|| Error::Internal(format!("pairing missing {address}")))?;
                (provider, address, epoch)
            };

            if let Err(e) = provider.validate_compute_units(cu_needed) {
                debug!(provider = %provider_address, "provider exhausted: {e}");
                ignored.insert(provider_address);
                continue;
            }

            let session = match provider.get_session(
                self.config.max_sessions_per_provider,
                self.config.max_blocklisted_sessions,
            ) {
                Ok(session) => session,
                Err(Error::AllProviderEndpointsDisabled(_)) => {
                    // Endpoints dead: block for the epoch and report.
                    match self.block_provider(&provider_address, true, session_epoch) {
                        Ok(()) | Err(Error::EpochMismatch { .. }) => {}
                        Err(e) => return Err(e),
                    }
                    ignored.insert(provider_address);
                    continue;
                }
                Err(Error::MaximumSessionsExceeded(_)) => {
                    ignored.insert(provider_address);
                    continue;
                }
                Err(Error::MaximumBlockListedSessions(_)) => {
                    match self.block_provider(&provider_address, false, session_epoch) {
                        Ok(()) | Err(Error::EpochMismatch { .. }) => {}
                        Err(e) => return Err(e),
                    }
                    ignored.insert(provider_address);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Err(e) = provider.add_used_compute_units(cu_needed) {
                debug!(provider = %provider_address, "pre-charge failed: {e}");
                drop(session);
                ignored.insert(provider_address);
                continue;
            }

            let mut session = session;
            session.latest_relay_cu = cu_needed;
            let reported_providers = self.reported_providers(session_epoch)?;
            return Ok(SessionAcquisition {
                session,
                epoch: session_epoch,
                provider_address,
                reported_providers,
            });
        }
    }

    /// Complete a successful relay: commit the pre-charged compute units,
    /// advance the relay counter and update QoS. Consumes the capability.
    pub fn on_session_done(
        &self,
        mut session: ConsumerSessionHandle,
        latest_serviced_block: i64,
        cu: u64,
        latency: Duration,
        expected_block: i64,
        allowed_lag: i64,
    ) {
        session.cu_sum += session.latest_relay_cu;
        session.latest_relay_cu = 0;
        session.relay_num += RELAY_NUMBER_INCREMENT;
        session.consecutive_failures = 0;
        session.latest_block = latest_serviced_block;
        session.qos.record_success(
            cu,
            latency,
            expected_block - latest_serviced_block,
            allowed_lag,
            &self.timeouts,
        );
    }

    /// Complete a successful data-reliability probe. DR sessions never carry
    /// compute units, so only liveness state is updated.
    pub fn on_data_reliability_session_done(
        &self,
        mut session: ConsumerSessionHandle,
        latest_serviced_block: i64,
    ) {
        session.consecutive_failures = 0;
        session.latest_block = latest_serviced_block;
    }

    /// Roll back a session whose relay was answered from a local cache:
    /// refund the pre-charge without advancing the relay counter.
    ///
    /// # Errors
    ///
    /// Returns an error when the refund drives the provider's accounting
    /// negative; the provider is blocklisted before returning.
    pub fn on_session_unused(&self, mut session: ConsumerSessionHandle) -> Result<()> {
        let cu_to_refund = session.latest_relay_cu;
        session.latest_relay_cu = 0;
        let parent = Arc::clone(session.parent());
        drop(session);
        self.refund_provider(&parent, cu_to_refund)
    }

    /// Record a failed relay: refund the pre-charge, track failures, and
    /// apply session or provider sanctions the error calls for. Consumes the
    /// capability.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionAlreadyBlockListed`] when called on a dead
    /// session, or accounting errors from the refund.
    pub fn on_session_failure(
        &self,
        mut session: ConsumerSessionHandle,
        error_received: &Error,
    ) -> Result<()> {
        if session.block_listed {
            return Err(Error::SessionAlreadyBlockListed(session.session_id));
        }
        session.qos.record_failure();
        session.consecutive_failures += 1;

        if session.consecutive_failures > self.config.max_consecutive_failures
            || error_received.is_session_out_of_sync()
        {
            debug!(session_id = session.session_id, "blocklisting session");
            session.block_listed = true;
        }

        let cu_to_refund = session.latest_relay_cu;
        session.latest_relay_cu = 0;
        let parent = Arc::clone(session.parent());
        // Release the session guard before touching manager state.
        drop(session);

        self.refund_provider(&parent, cu_to_refund)?;

        let (block, report) = error_received.provider_sanction();
        if block {
            match self.block_provider(&parent.address, report, parent.pairing_epoch()) {
                // The epoch moved on; the sanction no longer applies.
                Ok(()) | Err(Error::EpochMismatch { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn refund_provider(
        &self,
        parent: &Arc<ConsumerSessionsWithProvider>,
        cu: u64,
    ) -> Result<()> {
        if let Err(e) = parent.decrease_used_compute_units(cu) {
            error!(provider = %parent.address, "accounting underflow, blocking provider: {e}");
            match self.block_provider(&parent.address, false, parent.pairing_epoch()) {
                Ok(()) | Err(Error::EpochMismatch { .. }) => {}
                Err(block_err) => return Err(block_err),
            }
            return Err(e);
        }
        Ok(())
    }

    /// Block a provider for the rest of the epoch, optionally marking it for
    /// reporting. No-op with [`Error::EpochMismatch`] when `session_epoch`
    /// is not the current epoch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EpochMismatch`] when the epoch has rotated.
    pub fn block_provider(
        &self,
        address: &str,
        report: bool,
        session_epoch: u64,
    ) -> Result<()> {
        // Cheap check before the lock; re-verified after.
        let current = self.current_epoch();
        if session_epoch != current {
            return Err(Error::EpochMismatch {
                action_epoch: session_epoch,
                current_epoch: current,
            });
        }

        let mut inner = self.inner.write();
        let current = self.current_epoch();
        if session_epoch != current {
            return Err(Error::EpochMismatch {
                action_epoch: session_epoch,
                current_epoch: current,
            });
        }

        if let Some(position) = inner.valid_addresses.iter().position(|a| a == address) {
            inner.valid_addresses.remove(position);
        } else {
            debug!(address, "blocked provider was not in the valid list");
        }
        if report {
            inner.added_to_purge_and_report.insert(address.to_string());
        }
        Ok(())
    }

    /// JSON-encoded addresses reported this epoch. Empty when `epoch` is not
    /// current (the report belongs to a pairing that no longer exists).
    ///
    /// # Errors
    ///
    /// Returns a serialization error when encoding fails.
    pub fn reported_providers(&self, epoch: u64) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        if epoch != self.current_epoch() {
            return Ok(Vec::new());
        }
        let mut reported: Vec<&String> = inner.added_to_purge_and_report.iter().collect();
        reported.sort();
        Ok(serde_json::to_vec(&reported)?)
    }

    /// Acquire a data-reliability session on the provider at `index` in the
    /// pairing list. The index is derived externally from the consumer's VRF.
    ///
    /// # Errors
    ///
    /// - [`Error::DataReliability`] when the index is out of range, names the
    ///   originally queried provider, or a DR session already exists there.
    /// - [`Error::EpochMismatch`] when `epoch` is not current.
    pub fn get_data_reliability_session(
        &self,
        original_provider: &str,
        index: usize,
        epoch: u64,
    ) -> Result<SessionAcquisition> {
        let provider = {
            let inner = self.inner.read();
            let current = self.current_epoch();
            if epoch != current {
                return Err(Error::EpochMismatch {
                    action_epoch: epoch,
                    current_epoch: current,
                });
            }
            let address = inner.pairing_addresses.get(index).ok_or_else(|| {
                Error::DataReliability(format!(
                    "index {index} out of range for pairing of {}",
                    inner.pairing_addresses.len()
                ))
            })?;
            if address == original_provider {
                return Err(Error::DataReliability(
                    "data reliability index selects the original provider".to_string(),
                ));
            }
            inner
                .pairing
                .get(address)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("pairing missing {address}")))?
        };

        let session = provider.get_data_reliability_session()?;
        let provider_address = provider.address.clone();
        let reported_providers = self.reported_providers(epoch)?;
        Ok(SessionAcquisition {
            session,
            epoch,
            provider_address,
            reported_providers,
        })
    }

    /// Aggregated QoS report for one provider's sessions.
    #[must_use]
    pub fn provider_qos(&self, address: &str) -> Option<crate::types::QosReport> {
        let provider = self.inner.read().pairing.get(address).cloned()?;
        qos::aggregate_reports(&provider.qos_reports())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn provider(address: &str, max_cu: u64) -> Arc<ConsumerSessionsWithProvider> {
        Arc::new(ConsumerSessionsWithProvider::new(
            address.to_string(),
            vec![format!("{address}:2224")],
            max_cu,
        ))
    }

    fn manager_with_pairing(
        epoch: u64,
        providers: Vec<Arc<ConsumerSessionsWithProvider>>,
    ) -> ConsumerSessionManager {
        let manager =
            ConsumerSessionManager::new(SessionConfig::default(), TimeoutConfig::default());
        manager.update_all_providers(epoch, providers).unwrap();
        manager
    }

    /// Scenario: fresh pairing, one relay start to finish.
    #[test]
    fn test_fresh_pairing_relay_lifecycle() {
        let manager = manager_with_pairing(
            1,
            vec![provider("a", 100), provider("b", 100), provider("c", 100)],
        );

        let acquisition = manager.get_session(10, &HashSet::new()).unwrap();
        assert_eq!(acquisition.epoch, 1);
        assert_eq!(acquisition.session.relay_num, 0);
        assert_eq!(acquisition.session.latest_relay_cu, 10);
        let chosen = acquisition.provider_address.clone();

        manager.on_session_done(
            acquisition.session,
            100,
            10,
            Duration::from_millis(50),
            100,
            2,
        );

        // Re-acquire on the same provider to observe committed counters.
        let unwanted: HashSet<String> = ["a", "b", "c"]
            .iter()
            .filter(|a| **a != chosen.as_str())
            .map(|a| (*a).to_string())
            .collect();
        let again = manager.get_session(5, &unwanted).unwrap();
        assert_eq!(again.provider_address, chosen);
        assert_eq!(again.session.cu_sum, 10);
        assert_eq!(again.session.relay_num, 1);
        manager.on_session_unused(again.session).unwrap();
    }

    #[test]
    fn test_update_rejects_stale_epoch() {
        let manager = manager_with_pairing(5, vec![provider("a", 100)]);
        assert!(matches!(
            manager.update_all_providers(5, vec![provider("a", 100)]),
            Err(Error::EpochMismatch { .. })
        ));
        assert!(matches!(
            manager.update_all_providers(4, vec![provider("a", 100)]),
            Err(Error::EpochMismatch { .. })
        ));
        manager
            .update_all_providers(6, vec![provider("a", 100)])
            .unwrap();
    }

    /// Scenario: every provider's endpoints disabled → providers get blocked
    /// and reported, the call fails with an empty pairing, and the next call
    /// resets the valid list.
    #[test]
    fn test_blocked_provider_cycle_and_reset() {
        let a = provider("a", 100);
        let b = provider("b", 100);
        a.disable_endpoint("a:2224");
        b.disable_endpoint("b:2224");
        let manager = manager_with_pairing(1, vec![a, b]);

        let err = manager.get_session(10, &HashSet::new()).unwrap_err();
        assert!(matches!(err, Error::PairingListEmpty));
        assert_eq!(manager.number_of_resets(), 0);

        // Both got reported.
        let reported: Vec<String> =
            serde_json::from_slice(&manager.reported_providers(1).unwrap()).unwrap();
        assert_eq!(reported, vec!["a".to_string(), "b".to_string()]);

        // The next call resets the valid list, retries and fails again since
        // the endpoints are still dead.
        let err = manager.get_session(10, &HashSet::new()).unwrap_err();
        assert!(matches!(err, Error::PairingListEmpty));
        assert_eq!(manager.number_of_resets(), 1);
    }

    /// Scenario: epoch rotates while a session is in flight; completion still
    /// credits the old pairing and the session is unreachable afterwards.
    #[test]
    fn test_epoch_rollover_with_inflight_session() {
        let old_provider = provider("a", 100);
        let manager = manager_with_pairing(5, vec![Arc::clone(&old_provider)]);

        let acquisition = manager.get_session(10, &HashSet::new()).unwrap();
        assert_eq!(acquisition.epoch, 5);

        manager
            .update_all_providers(6, vec![provider("a", 200)])
            .unwrap();

        // Completion succeeds against the purged pairing.
        manager.on_session_done(
            acquisition.session,
            50,
            10,
            Duration::from_millis(20),
            50,
            2,
        );
        assert_eq!(old_provider.used_compute_units(), 10);

        // A new acquisition uses the fresh pairing object.
        let fresh = manager.get_session(10, &HashSet::new()).unwrap();
        assert_eq!(fresh.epoch, 6);
        assert_eq!(fresh.session.cu_sum, 0);
        // The new pairing object carries only the fresh pre-charge, none of
        // the old epoch's accounting.
        assert_eq!(parent_used(&fresh), 10);
        manager.on_session_unused(fresh.session).unwrap();
        assert_eq!(old_provider.used_compute_units(), 10);
    }

    fn parent_used(acquisition: &SessionAcquisition) -> u64 {
        acquisition.session.parent().used_compute_units()
    }

    #[test]
    fn test_failure_refunds_and_blocklists_after_repeats() {
        let p = provider("a", 100);
        let manager = manager_with_pairing(1, vec![Arc::clone(&p)]);

        for round in 0..4 {
            let acquisition = manager.get_session(10, &HashSet::new()).unwrap();
            assert_eq!(p.used_compute_units(), 10);
            manager
                .on_session_failure(acquisition.session, &Error::Upstream("timeout".into()))
                .unwrap();
            assert_eq!(p.used_compute_units(), 0, "refund after round {round}");
        }

        // Four consecutive failures exceeded the limit; the only session is
        // blocklisted, a fresh one is created.
        let acquisition = manager.get_session(10, &HashSet::new()).unwrap();
        assert_eq!(acquisition.session.consecutive_failures, 0);
        assert_eq!(acquisition.session.cu_sum, 0);
        manager.on_session_unused(acquisition.session).unwrap();
    }

    #[test]
    fn test_out_of_sync_failure_blocklists_immediately() {
        let p = provider("a", 100);
        let manager = manager_with_pairing(1, vec![Arc::clone(&p)]);

        let acquisition = manager.get_session(10, &HashSet::new()).unwrap();
        let session_id = acquisition.session.session_id;
        manager
            .on_session_failure(
                acquisition.session,
                &Error::SessionOutOfSync("counters".into()),
            )
            .unwrap();

        let acquisition = manager.get_session(10, &HashSet::new()).unwrap();
        assert_ne!(acquisition.session.session_id, session_id);
        manager.on_session_unused(acquisition.session).unwrap();
    }

    #[test]
    fn test_report_and_block_sanction_applies_this_epoch_only() {
        let p = provider("a", 100);
        let manager = manager_with_pairing(1, vec![Arc::clone(&p), provider("b", 100)]);

        let unwanted: HashSet<String> = ["b".to_string()].into();
        let acquisition = manager.get_session(10, &unwanted).unwrap();
        assert_eq!(acquisition.provider_address, "a");

        // Rotate before the failure lands; the sanction is skipped silently.
        manager
            .update_all_providers(2, vec![provider("a", 100), provider("b", 100)])
            .unwrap();
        manager
            .on_session_failure(
                acquisition.session,
                &Error::ReportAndBlockProvider("misbehaved".into()),
            )
            .unwrap();
        let reported: Vec<String> =
            serde_json::from_slice(&manager.reported_providers(2).unwrap()).unwrap();
        assert!(reported.is_empty());
    }

    #[test]
    fn test_exhausted_provider_is_skipped() {
        let small = provider("small", 5);
        let big = provider("big", 100);
        let manager = manager_with_pairing(1, vec![small, big]);

        // Needs more CU than "small" can serve; selection must land on "big".
        for _ in 0..5 {
            let acquisition = manager.get_session(50, &HashSet::new()).unwrap();
            assert_eq!(acquisition.provider_address, "big");
            manager.on_session_unused(acquisition.session).unwrap();
        }
    }

    #[test]
    fn test_data_reliability_session_selection() {
        let manager = manager_with_pairing(
            3,
            vec![provider("a", 100), provider("b", 100), provider("c", 100)],
        );

        // Index selects the original provider.
        assert!(matches!(
            manager.get_data_reliability_session("b", 1, 3),
            Err(Error::DataReliability(_))
        ));
        // Index out of range.
        assert!(matches!(
            manager.get_data_reliability_session("a", 9, 3),
            Err(Error::DataReliability(_))
        ));
        // Stale epoch.
        assert!(matches!(
            manager.get_data_reliability_session("a", 1, 2),
            Err(Error::EpochMismatch { .. })
        ));

        let acquisition = manager.get_data_reliability_session("a", 1, 3).unwrap();
        assert_eq!(acquisition.provider_address, "b");
        assert_eq!(
            acquisition.session.session_id,
            crate::types::DATA_RELIABILITY_SESSION_ID
        );
        drop(acquisition);

        // One DR session per provider per epoch.
        assert!(matches!(
            manager.get_data_reliability_session("a", 1, 3),
            Err(Error::DataReliability(_))
        ));
    }
}
