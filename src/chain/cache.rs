//! Optional remote relay cache.
//!
//! Providers consult the cache before forwarding a relay upstream and insert
//! responses for finalized blocks (or blocks with a concrete hash). Cache
//! unavailability is never fatal: [`crate::Error::CacheNotInitialised`] and
//! [`crate::Error::CacheNotConnected`] are logged as warnings and the relay
//! proceeds against the node.

use crate::config::ApiInterface;
use crate::error::{Error, Result};
use crate::types::RelayReply;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Key identifying one cacheable relay response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// API family of the request.
    pub api_interface: ApiInterface,
    /// Chain the request targets.
    pub chain_id: String,
    /// Hash of the request body and routing fields.
    pub request_hash: Vec<u8>,
    /// Hash of the block the request resolved to, when known.
    pub requested_block_hash: Option<String>,
    /// Whether that block is finalized.
    pub finalized: bool,
}

/// Remote relay cache client interface.
#[async_trait]
pub trait RelayCache: Send + Sync {
    /// Look up a cached reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheNotInitialised`] when no cache is configured,
    /// [`Error::CacheNotConnected`] on transport failure, or a miss error.
    async fn get_entry(&self, key: &CacheKey) -> Result<RelayReply>;

    /// Insert a reply. Only finalized blocks or blocks with a concrete hash
    /// should be inserted; the caller enforces that.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`RelayCache::get_entry`].
    async fn set_entry(&self, key: &CacheKey, reply: &RelayReply) -> Result<()>;
}

/// Cache stand-in used when no cache address is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCache;

#[async_trait]
impl RelayCache for DisabledCache {
    async fn get_entry(&self, _key: &CacheKey) -> Result<RelayReply> {
        Err(Error::CacheNotInitialised)
    }

    async fn set_entry(&self, _key: &CacheKey, _reply: &RelayReply) -> Result<()> {
        Err(Error::CacheNotInitialised)
    }
}

/// Process-local cache, mainly for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<CacheKey, RelayReply>>,
}

impl InMemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl RelayCache for InMemoryCache {
    async fn get_entry(&self, key: &CacheKey) -> Result<RelayReply> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::CacheNotConnected("entry not cached".to_string()))
    }

    async fn set_entry(&self, key: &CacheKey, reply: &RelayReply) -> Result<()> {
        self.entries.lock().insert(key.clone(), reply.clone());
        Ok(())
    }
}
