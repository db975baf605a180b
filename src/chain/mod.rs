//! Upstream chain proxy interface.
//!
//! A chain proxy understands one upstream API family (JSON-RPC,
//! Tendermint-RPC, REST or gRPC): it parses inbound relay payloads into a
//! [`NodeMessage`] carrying the matched service API and its compute-unit
//! cost, and forwards messages to the local upstream node. The concrete
//! proxies live outside this crate; the runtime only depends on this trait.

pub mod cache;

use crate::config::ApiInterface;
use crate::error::Result;
use crate::types::RelayReply;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

/// A service API matched from a relay payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceApi {
    /// Canonical API name (e.g. `eth_getBalance`).
    pub name: String,
    /// Compute-unit cost of one call.
    pub compute_units: u64,
}

/// A parsed upstream message, ready to be sent to the node.
#[derive(Debug, Clone)]
pub struct NodeMessage {
    /// The matched service API.
    pub service_api: ServiceApi,
    /// API family this message belongs to.
    pub api_interface: ApiInterface,
    /// Block the message refers to, possibly a sentinel.
    pub requested_block: i64,
    /// Decoded request parameters, when the payload had any. Used for
    /// unsubscribe dispatch.
    pub params: Option<serde_json::Value>,
}

/// Handle to an open upstream subscription.
///
/// Replies are pushed into the channel given to [`ChainProxy::send`]; the
/// proxy closes that channel on upstream error. Dropping the handle does not
/// close the subscription; call [`SubscriptionHandle::disconnect`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: String,
    cancel: watch::Sender<bool>,
}

impl SubscriptionHandle {
    /// Create a handle for subscription `id` with its cancel signal.
    #[must_use]
    pub fn new(id: String, cancel: watch::Sender<bool>) -> Self {
        Self { id, cancel }
    }

    /// The upstream-assigned subscription id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Close the upstream subscription.
    pub fn disconnect(&self) {
        let _ = self.cancel.send(true);
    }
}

/// One upstream API family's proxy.
#[async_trait]
pub trait ChainProxy: Send + Sync {
    /// Parse a relay payload: match the service API, extract its cost and
    /// the requested block.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload does not match any known API.
    fn parse_msg(&self, url: &str, data: &[u8], connection_type: &str) -> Result<NodeMessage>;

    /// Forward a parsed message to the upstream node.
    ///
    /// For subscription APIs the caller supplies `subscribe`; the proxy
    /// pushes every upstream notification into it and returns the handle
    /// alongside the first reply.
    ///
    /// # Errors
    ///
    /// Returns an error on upstream I/O failure.
    async fn send(
        &self,
        msg: &NodeMessage,
        subscribe: Option<mpsc::Sender<serde_json::Value>>,
    ) -> Result<(RelayReply, Option<SubscriptionHandle>)>;

    /// The API family this proxy serves.
    fn api_interface(&self) -> ApiInterface;
}
