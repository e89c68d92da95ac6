//! # InstantSend
//!
//! Sub-block-interval finality for unconfirmed transactions. A
//! deterministically selected threshold quorum of validators attests that a
//! transaction's inputs are unique and valid at observation time; the
//! aggregated attestation (an "islock") travels the gossip mesh and, once
//! verified locally, is binding: conflicting transactions are evicted from
//! the mempool and a block mining a conflict is invalidated.
//!
//! The subsystem is a single long-lived [`manager::InstantSendManager`] with
//! five cooperating parts:
//!
//! * a signing driver requesting per-input and aggregated quorum signatures,
//! * a pending-lock verifier batching inbound locks against up to two quorum
//!   rotations,
//! * the persistent multi-index lock store [`isdb::InstantSendDb`],
//! * a conflict resolver spanning mempool eviction up to block invalidation,
//! * a retry and garbage collection worker.
//!
//! External services (threshold signing, transaction index, chain access,
//! chainlocks, mempool, peer gateway) are consumed through the traits in
//! [`interface`].

/// Core database traits and backends
pub mod db;
/// Consensus-style binary encoding
pub mod encoding;
/// Traits for the services the manager consumes
pub mod interface;
/// The persistent lock store
pub mod isdb;
/// Lock payloads, request ids and sign hashes
pub mod islock;
/// Log target constants
pub mod logging;
/// The InstantSend manager
pub mod manager;

pub use interface::{FeatureFlags, InstantSendParams};
pub use islock::{InstantSendLock, LockHash, RequestId};
pub use manager::InstantSendManager;
