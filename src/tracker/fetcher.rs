//! The narrow interface the chain tracker uses to talk to an upstream node.

use crate::error::Result;
use async_trait::async_trait;

/// Fetches block data from the upstream chain.
///
/// Implemented over the chain proxy in production; tests supply an in-memory
/// mock.
#[async_trait]
pub trait ChainFetcher: Send + Sync {
    /// Fetch the latest block height known to the upstream node.
    async fn fetch_latest_block_num(&self) -> Result<i64>;

    /// Fetch the hash of the block at `block_num`.
    ///
    /// # Errors
    ///
    /// Returns an error when the node no longer serves that height.
    async fn fetch_block_hash_by_num(&self, block_num: i64) -> Result<String>;
}
