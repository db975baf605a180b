//! # meridian-node
//!
//! Provider and consumer runtime for the Meridian decentralized RPC relay
//! network.
//!
//! Consumers buy compute-unit quota on-chain and open relay sessions against
//! a per-epoch pairing of providers; providers serve the relays against real
//! upstream nodes, retain signed proofs of service, and claim rewards in
//! batched payment transactions. This crate implements the session and
//! accounting core:
//!
//! - [`consumer::ConsumerSessionManager`]: the per-epoch pairing pool,
//!   session acquisition with quota accounting, provider blocking and
//!   reporting, and the data-reliability session path.
//! - [`provider::RelayServer`]: inbound relay admission, per-consumer
//!   compute-unit accounting, proof retention, subscriptions, and conflict
//!   voting.
//! - [`tracker::ChainTracker`]: a background follower of the upstream chain
//!   maintaining a sliding window of recent block hashes and detecting forks.
//! - [`provider::RewardClaimer`]: epoch-boundary draining of the reward
//!   ledger into batched payment claims.
//!
//! Transport, key management, the upstream chain proxies and the on-chain
//! transaction pipeline are external collaborators reached through the
//! narrow traits in [`chain`], [`state`] and [`tracker`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use meridian_node::{NodeConfig, ProviderRuntimeBuilder, RelayServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::from_file("provider.toml".as_ref())?;
//!     let mut runtime = ProviderRuntimeBuilder::new(
//!         config,
//!         RelayServerConfig::default(),
//!         signer,
//!         state_tracker,
//!         chain_proxy,
//!         cache,
//!     )
//!     .build(chain_fetcher);
//!     runtime.start().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod chain;
pub mod config;
pub mod consumer;
pub mod error;
pub mod node;
pub mod provider;
pub mod state;
pub mod tracker;
pub mod types;

pub use config::{ApiInterface, NodeConfig, SessionConfig, TimeoutConfig, TrackerConfig};
pub use consumer::{ConsumerSessionManager, ConsumerSessionsWithProvider};
pub use error::{Error, Result};
pub use node::{init_tracing, ProviderRuntime, ProviderRuntimeBuilder};
pub use provider::{RelayServer, RelayServerConfig, RewardClaimer, SessionRegistry};
pub use tracker::{ChainFetcher, ChainTracker, ChainTrackerConfig};
pub use types::{BlockStore, RelayReply, RelayRequest, LATEST_BLOCK, NOT_APPLICABLE};
