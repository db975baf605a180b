//! Error types for meridian-node.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire status code reserved for [`Error::SessionOutOfSync`].
///
/// The consumer side matches on this code to blocklist its own copy of the
/// session, so it must stay distinct from every other relay failure code.
pub const SESSION_OUT_OF_SYNC_STATUS: u32 = 667;

/// Generic wire status code for relay failures that carry no special meaning
/// for the peer.
pub const RELAY_FAILURE_STATUS: u32 = 1;

/// Errors that can occur in meridian-node.
#[derive(Error, Debug)]
pub enum Error {
    /// No providers left to pick from after filtering.
    #[error("provider pairing list is empty")]
    PairingListEmpty,

    /// The provider has no remaining compute units for this epoch.
    #[error("max compute units exceeded for provider {provider}: used {used}, max {max}")]
    MaxComputeUnitsExceeded {
        /// Provider address.
        provider: String,
        /// Compute units already charged.
        used: u64,
        /// Epoch allowance.
        max: u64,
    },

    /// Every endpoint of a provider is disabled.
    #[error("all endpoints of provider {0} are disabled")]
    AllProviderEndpointsDisabled(String),

    /// The provider's session pool is full.
    #[error("maximum number of sessions exceeded for provider {0}")]
    MaximumSessionsExceeded(String),

    /// Too many of the provider's sessions are blocklisted.
    #[error("maximum number of blocklisted sessions reached for provider {0}")]
    MaximumBlockListedSessions(String),

    /// An epoch-scoped action raced an epoch rotation; the state has moved on.
    #[error("epoch mismatch: action epoch {action_epoch}, current epoch {current_epoch}")]
    EpochMismatch {
        /// Epoch the action was created in.
        action_epoch: u64,
        /// Epoch the manager is currently in.
        current_epoch: u64,
    },

    /// The two sides of a session disagree on its counters; the session is dead.
    #[error("session out of sync: {0}")]
    SessionOutOfSync(String),

    /// The session is already blocklisted.
    #[error("session {0} is already blocklisted")]
    SessionAlreadyBlockListed(u64),

    /// The peer asked us to block this provider for the rest of the epoch.
    #[error("provider must be blocked: {0}")]
    BlockProvider(String),

    /// Like [`Error::BlockProvider`], but the provider is also reported on-chain.
    #[error("provider must be blocked and reported: {0}")]
    ReportAndBlockProvider(String),

    /// Consumer is not authorized for this pairing.
    #[error("consumer {consumer} not authorized at block {block}")]
    NotAuthorized {
        /// Consumer address.
        consumer: String,
        /// Block height used for the authorization query.
        block: u64,
    },

    /// Consumer is blocklisted on the provider side.
    #[error("consumer {0} is blocklisted")]
    ConsumerBlockListed(String),

    /// A data-reliability relay failed validation; normal sessions are unaffected.
    #[error("data reliability error: {0}")]
    DataReliability(String),

    /// The remote relay cache was never configured.
    #[error("relay cache not initialised")]
    CacheNotInitialised,

    /// The remote relay cache is configured but unreachable.
    #[error("relay cache not connected: {0}")]
    CacheNotConnected(String),

    /// The chain tracker could not fetch the latest block from the node.
    #[error("failed to fetch latest block: {0}")]
    FailedToFetchLatestBlock(String),

    /// A block height outside the tracker's maintained window was requested.
    #[error("block {requested} is outside the tracked window [{from}, {to}]")]
    BlockOutsideWindow {
        /// Height that was asked for.
        requested: i64,
        /// Oldest height in the window.
        from: i64,
        /// Newest height in the window.
        to: i64,
    },

    /// Relay request failed basic admission checks.
    #[error("relay rejected: {0}")]
    RelayRejected(String),

    /// Upstream node I/O failure.
    #[error("upstream node error: {0}")]
    Upstream(String),

    /// On-chain transaction broadcast failed.
    #[error("transaction broadcast failed: {0}")]
    Broadcast(String),

    /// Subscription stream failure.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A state that should be impossible was reached. Reserved for invariant
    /// violations; callers treat it as fatal.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    /// Status code attached to the relay reply when this error is returned to
    /// the peer. Only [`Error::SessionOutOfSync`] carries a distinguished
    /// code; everything else collapses to a generic failure.
    #[must_use]
    pub fn status_code(&self) -> u32 {
        match self {
            Self::SessionOutOfSync(_) => SESSION_OUT_OF_SYNC_STATUS,
            _ => RELAY_FAILURE_STATUS,
        }
    }

    /// Whether this error means the session itself must be blocklisted.
    #[must_use]
    pub fn is_session_out_of_sync(&self) -> bool {
        matches!(self, Self::SessionOutOfSync(_))
    }

    /// Whether the provider should be blocked for the rest of the epoch,
    /// and whether it should additionally be reported.
    #[must_use]
    pub fn provider_sanction(&self) -> (bool, bool) {
        match self {
            Self::ReportAndBlockProvider(_) | Self::AllProviderEndpointsDisabled(_) => (true, true),
            Self::BlockProvider(_) => (true, false),
            _ => (false, false),
        }
    }

    /// Cache errors are warnings; relays proceed without the cache.
    #[must_use]
    pub fn is_cache_unavailable(&self) -> bool {
        matches!(self, Self::CacheNotInitialised | Self::CacheNotConnected(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_sync_status_code_is_distinct() {
        let err = Error::SessionOutOfSync("counter mismatch".to_string());
        assert_eq!(err.status_code(), SESSION_OUT_OF_SYNC_STATUS);

        let other = Error::PairingListEmpty;
        assert_ne!(other.status_code(), SESSION_OUT_OF_SYNC_STATUS);
    }

    #[test]
    fn test_provider_sanction_mapping() {
        assert_eq!(
            Error::ReportAndBlockProvider("x".into()).provider_sanction(),
            (true, true)
        );
        assert_eq!(
            Error::BlockProvider("x".into()).provider_sanction(),
            (true, false)
        );
        assert_eq!(
            Error::SessionOutOfSync("x".into()).provider_sanction(),
            (false, false)
        );
    }

    #[test]
    fn test_cache_errors_are_warnings() {
        assert!(Error::CacheNotInitialised.is_cache_unavailable());
        assert!(Error::CacheNotConnected("refused".into()).is_cache_unavailable());
        assert!(!Error::PairingListEmpty.is_cache_unavailable());
    }
}
