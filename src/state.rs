//! On-chain state and signing interfaces.
//!
//! The runtime never talks to the chain or a keyring directly; it goes
//! through these narrow traits. Production implementations wrap the
//! transaction pipeline and key management, both of which live outside this
//! crate.

use crate::error::Result;
use crate::types::{RelayReply, RelayRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A consumer's VRF public key as registered on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfPublicKey(pub Vec<u8>);

/// Result of an authorization query for a consumer at some block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedConsumer {
    /// Whether the pairing between the consumer and this provider is valid.
    pub valid: bool,
    /// This provider's index within the consumer's pairing list, used to
    /// validate VRF-selected data-reliability probes.
    pub self_index: i64,
}

/// One provider entry of a pairing list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingEntry {
    /// Provider account address.
    pub address: String,
    /// Relay endpoints the provider listens on.
    pub endpoints: Vec<String>,
    /// Compute units the consumer may spend on this provider per epoch.
    pub max_compute_units: u64,
}

/// A pairing query response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingUpdate {
    /// Providers assigned for the epoch.
    pub pairing: Vec<PairingEntry>,
    /// The epoch the pairing belongs to.
    pub epoch: u64,
    /// First block at which the pairing should be queried again.
    pub next_block_for_update: u64,
}

/// On-chain queries and transactions the runtime depends on.
#[async_trait]
pub trait StateTracker: Send + Sync {
    /// Check a consumer's pairing authorization at `block_height`.
    async fn is_authorized_consumer(
        &self,
        consumer: &str,
        block_height: u64,
    ) -> Result<AuthorizedConsumer>;

    /// Check that `consumer` and `provider` were paired at `block_height`.
    async fn is_authorized_pairing(
        &self,
        consumer: &str,
        provider: &str,
        block_height: u64,
    ) -> Result<bool>;

    /// Fetch a consumer's VRF public key and epoch CU allowance.
    async fn vrf_pk_and_max_cu(
        &self,
        consumer: &str,
        chain_id: &str,
        block_height: u64,
    ) -> Result<(VrfPublicKey, u64)>;

    /// Fetch the pairing list effective at `block`.
    async fn get_pairing(&self, block: i64) -> Result<PairingUpdate>;

    /// Broadcast a batched relay-payment claim. Returns the raw transaction
    /// result text; the caller parses it for success and sequence errors.
    async fn send_relay_payment(
        &self,
        relays: Vec<RelayRequest>,
        description: &str,
        sequence: Option<u64>,
    ) -> Result<String>;

    /// Broadcast a conflict-vote commitment.
    async fn send_vote_commit(&self, vote_id: &str, commit_hash: &[u8]) -> Result<()>;

    /// Broadcast a conflict-vote reveal.
    async fn send_vote_reveal(&self, vote_id: &str, nonce: i64, data_hash: &[u8]) -> Result<()>;
}

/// Signature operations over relay messages. Key material stays behind this
/// trait.
pub trait RelaySigner: Send + Sync {
    /// This signer's account address.
    fn address(&self) -> &str;

    /// Recover the consumer address from a request signature.
    ///
    /// # Errors
    ///
    /// Returns an error when the signature does not verify.
    fn recover_consumer(&self, request: &RelayRequest) -> Result<String>;

    /// Sign a relay reply bound to its request.
    ///
    /// # Errors
    ///
    /// Returns an error on signing failure.
    fn sign_reply(&self, reply: &RelayReply, request: &RelayRequest) -> Result<Vec<u8>>;

    /// Sign the finalization data of a reply, bound to the consumer.
    ///
    /// # Errors
    ///
    /// Returns an error on signing failure.
    fn sign_finalization(
        &self,
        reply: &RelayReply,
        request: &RelayRequest,
        consumer: &str,
    ) -> Result<Vec<u8>>;

    /// Verify the consumer's signature over the VRF data of a
    /// data-reliability request, and that the VRF proof matches `vrf_pk`.
    ///
    /// # Errors
    ///
    /// Returns an error when verification cannot be performed.
    fn verify_vrf_data(
        &self,
        consumer: &str,
        vrf_pk: &VrfPublicKey,
        request: &RelayRequest,
    ) -> Result<bool>;

    /// Recover the address of the provider that signed the original query a
    /// data-reliability probe duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error when the signature does not verify.
    fn recover_reliability_signer(&self, request: &RelayRequest) -> Result<String>;
}

/// Derive the pairing index selected by a VRF value.
///
/// The first four little-endian bytes gate on the reliability threshold;
/// values above it select nobody. The following eight bytes pick the index
/// uniformly over the provider count.
#[must_use]
pub fn vrf_index(vrf_value: &[u8], providers_count: u32, reliability_threshold: u32) -> Option<i64> {
    if vrf_value.len() < 12 || providers_count == 0 {
        return None;
    }
    let gate = u32::from_le_bytes([vrf_value[0], vrf_value[1], vrf_value[2], vrf_value[3]]);
    if gate > reliability_threshold {
        return None;
    }
    let pick = u64::from_le_bytes([
        vrf_value[4],
        vrf_value[5],
        vrf_value[6],
        vrf_value[7],
        vrf_value[8],
        vrf_value[9],
        vrf_value[10],
        vrf_value[11],
    ]);
    i64::try_from(pick % u64::from(providers_count)).ok()
}
