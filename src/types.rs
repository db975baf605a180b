//! Wire types and protocol constants shared by the consumer and provider
//! runtimes.
//!
//! The request/reply shapes mirror the on-chain pairing protocol: a relay
//! request carries the session counters the provider re-validates, and the
//! reply carries the finalization proof material the consumer audits.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sentinel for "the latest block the provider knows about".
pub const LATEST_BLOCK: i64 = -1;

/// Sentinel for "no specific block applies to this request".
pub const NOT_APPLICABLE: i64 = -2;

/// Session id used by every data-reliability relay. DR relays are not tied to
/// a real session.
pub const DATA_RELIABILITY_SESSION_ID: u64 = 0;

/// Relay counter carried by every data-reliability relay. DR probes are
/// one-shot, so the counter never advances.
pub const DATA_RELIABILITY_RELAY_NUM: u64 = 0;

/// Cumulative CU value carried by every data-reliability relay.
pub const DATA_RELIABILITY_CU_SUM: u64 = 0;

/// How many epochs behind the latest an epoch must be before its reward
/// sessions are claimed.
pub const STALE_EPOCH_DISTANCE: u64 = 2;

/// Relay counter step; sessions advance by exactly one per relay.
pub const RELAY_NUMBER_INCREMENT: u64 = 1;

/// Resolve a latest-relative block argument to an absolute height.
///
/// `LATEST_BLOCK` maps to `latest`, and other negative values are offsets
/// from the latest (`-3` means `latest - 2` since `LATEST_BLOCK` itself is
/// `-1`). Non-negative arguments are already absolute.
#[must_use]
pub fn latest_arg_to_block_num(arg: i64, latest: i64) -> i64 {
    if arg < 0 {
        latest + arg - LATEST_BLOCK
    } else {
        arg
    }
}

/// A single `{height, hash}` entry in the chain tracker's window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStore {
    /// Block height.
    pub block: i64,
    /// Block hash as reported by the upstream node.
    pub hash: String,
}

/// VRF material attached to a data-reliability relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfData {
    /// Hash of the original query this probe duplicates.
    pub query_hash: Vec<u8>,
    /// VRF output used to derive the provider index.
    pub vrf_value: Vec<u8>,
    /// Proof that `vrf_value` was produced by the consumer's VRF key.
    pub vrf_proof: Vec<u8>,
    /// The original provider's signature over the query.
    pub provider_sig: Vec<u8>,
    /// Consumer signature over the VRF data.
    pub sig: Vec<u8>,
    /// Whether the probe differentiates on the finalization path.
    pub differentiator: bool,
}

/// A relay request as received by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    /// Address of the provider this relay is intended for.
    pub provider: String,
    /// Chain this relay targets.
    pub chain_id: String,
    /// Epoch start height the consumer's pairing belongs to.
    pub block_height: u64,
    /// Session identifier, random 63-bit, chosen by the consumer.
    pub session_id: u64,
    /// Cumulative compute units after this relay.
    pub cu_sum: u64,
    /// Relay counter, strictly incrementing within a session.
    pub relay_num: u64,
    /// Request path or method on the upstream API.
    pub api_url: String,
    /// Raw request body.
    pub data: Vec<u8>,
    /// Connection type hint for the chain proxy (e.g. `GET`, `POST`).
    pub connection_type: String,
    /// Block the request semantically refers to; may be a sentinel.
    pub request_block: i64,
    /// Present only on data-reliability probes.
    pub data_reliability: Option<VrfData>,
    /// Consumer signature over the request.
    pub sig: Vec<u8>,
}

impl RelayRequest {
    /// Hash of the query fields a data-reliability probe must reproduce.
    #[must_use]
    pub fn query_hash(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.chain_id.as_bytes());
        hasher.update(self.api_url.as_bytes());
        hasher.update(&self.data);
        hasher.update(self.connection_type.as_bytes());
        hasher.update(self.block_height.to_be_bytes());
        hasher.update(self.request_block.to_be_bytes());
        hasher.finalize().to_vec()
    }

    /// Hash identifying this request for cache lookups.
    #[must_use]
    pub fn cache_hash(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.api_url.as_bytes());
        hasher.update(&self.data);
        hasher.update(self.connection_type.as_bytes());
        hasher.finalize().to_vec()
    }
}

/// A relay reply as produced by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayReply {
    /// Raw response body from the upstream node.
    pub data: Vec<u8>,
    /// The latest block the provider had seen when answering.
    pub latest_block: i64,
    /// JSON-encoded `height → hash` map of finalized blocks.
    pub finalized_blocks_hashes: Vec<u8>,
    /// Provider signature over the reply.
    pub sig: Vec<u8>,
    /// Provider signature over the finalization data, when data reliability
    /// is enabled for the chain.
    pub sig_blocks: Vec<u8>,
}

/// QoS excellence report aggregated per provider, attached to payment claims.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QosReport {
    /// Success ratio in `[0, 1]`.
    pub availability: f64,
    /// Latency score in `[0, 1]`; 1 means at or better than expected.
    pub latency: f64,
    /// Sync score in `[0, 1]`; 1 means within the allowed lag.
    pub sync: f64,
}

impl QosReport {
    /// Combined score, the geometric mean of the three components.
    #[must_use]
    pub fn score(&self) -> f64 {
        (self.availability * self.latency * self.sync).cbrt()
    }
}

/// Generate a fresh 63-bit session identifier. Never returns zero, which is
/// reserved for data-reliability relays.
#[must_use]
pub fn new_session_id() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen_range(1..1u64 << 63)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_arg_resolution() {
        assert_eq!(latest_arg_to_block_num(LATEST_BLOCK, 100), 100);
        assert_eq!(latest_arg_to_block_num(LATEST_BLOCK - 6, 100), 94);
        assert_eq!(latest_arg_to_block_num(42, 100), 42);
    }

    #[test]
    fn test_session_id_is_nonzero_63_bit() {
        for _ in 0..100 {
            let id = new_session_id();
            assert_ne!(id, DATA_RELIABILITY_SESSION_ID);
            assert!(id < (1 << 63));
        }
    }

    #[test]
    fn test_query_hash_covers_request_fields() {
        let mut request = RelayRequest {
            provider: "provider-a".to_string(),
            chain_id: "ETH1".to_string(),
            block_height: 20,
            session_id: 7,
            cu_sum: 10,
            relay_num: 1,
            api_url: "eth_blockNumber".to_string(),
            data: b"{}".to_vec(),
            connection_type: "POST".to_string(),
            request_block: LATEST_BLOCK,
            data_reliability: None,
            sig: vec![],
        };
        let base = request.query_hash();
        request.api_url = "eth_getBalance".to_string();
        assert_ne!(base, request.query_hash());
    }

    #[test]
    fn test_qos_score_geometric_mean() {
        let report = QosReport {
            availability: 1.0,
            latency: 1.0,
            sync: 1.0,
        };
        assert!((report.score() - 1.0).abs() < f64::EPSILON);

        let degraded = QosReport {
            availability: 0.5,
            latency: 1.0,
            sync: 1.0,
        };
        assert!(degraded.score() < 1.0);
    }
}
