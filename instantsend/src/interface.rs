//! Interfaces towards the services the InstantSend manager consumes: the
//! threshold signing service, the transaction index, chain access and
//! validation, chainlocks, the mempool and the peer-to-peer gateway.
//!
//! Everything is injected as an `Arc<dyn ...>` handle; there is no global
//! manager state and no global feature toggles.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::islock::{InstantSendLock, LlmqType, LockHash, RequestId};

/// Minimum peer protocol version that understands legacy `islock` inventory
pub const LLMQS_PROTO_VERSION: u32 = 70214;
/// Minimum peer protocol version that understands deterministic `isdlock`
/// inventory
pub const ISDLOCK_PROTO_VERSION: u32 = 70220;

/// Identifies a gossip peer. The local node uses [`PeerId::LOCAL`] when it
/// enqueues its own locks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(i64);

impl PeerId {
    pub const LOCAL: PeerId = PeerId(-1);

    pub fn new(id: i64) -> Self {
        PeerId(id)
    }

    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A block on some chain, identified by hash, with its height
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockRef {
    pub hash: BlockHash,
    pub height: u32,
}

/// Inventory kinds relayed or requested by this subsystem
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvKind {
    Tx,
    IsLock,
    IsdLock,
}

/// An inventory item announced to or requested from peers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: [u8; 32],
}

impl Inv {
    pub fn tx(txid: Txid) -> Self {
        use bitcoin::hashes::Hash;
        Inv {
            kind: InvKind::Tx,
            hash: txid.to_byte_array(),
        }
    }

    pub fn islock(kind: InvKind, hash: LockHash) -> Self {
        use bitcoin::hashes::Hash;
        Inv {
            kind,
            hash: hash.to_byte_array(),
        }
    }
}

/// A quorum eligible to sign requests of a given type in the current signing
/// epoch
#[derive(Clone, Debug)]
pub struct Quorum {
    pub quorum_hash: BlockHash,
    pub public_key: tbls::AggregatePublicKey,
}

/// A threshold signature recovered (or reconstructed) for a signing request
#[derive(Clone, Debug)]
pub struct RecoveredSig {
    pub llmq_type: LlmqType,
    pub quorum_hash: BlockHash,
    pub id: RequestId,
    pub msg_hash: Txid,
    pub sig: tbls::Signature,
}

/// Callback capability for recovered signatures. Implementors are handed
/// every signature the signing service recovers.
#[async_trait]
pub trait RecoveredSigListener: Send + Sync {
    async fn on_recovered_sig(&self, rec: &RecoveredSig);
}

/// Unregisters a listener registration when dropped
pub struct ListenerHandle(Option<Box<dyn FnOnce() + Send>>);

impl ListenerHandle {
    pub fn new(unregister: impl FnOnce() + Send + 'static) -> Self {
        ListenerHandle(Some(Box::new(unregister)))
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(unregister) = self.0.take() {
            unregister();
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ListenerHandle")
    }
}

/// The external threshold signing service
#[async_trait]
pub trait SigningService: Send + Sync {
    /// Starts participating in signing `(id, msg_hash)` if the local node is
    /// a member of the responsible quorum. Returns whether a signing attempt
    /// was started.
    async fn async_sign_if_member(
        &self,
        llmq_type: LlmqType,
        id: RequestId,
        msg_hash: Txid,
        retroactive: bool,
    ) -> bool;

    async fn has_recovered_sig(&self, llmq_type: LlmqType, id: RequestId, msg_hash: Txid) -> bool;

    async fn has_recovered_sig_for_id(&self, llmq_type: LlmqType, id: RequestId) -> bool;

    /// The message hash the local node already voted for under `id`, if any
    async fn get_vote_for_id(&self, llmq_type: LlmqType, id: RequestId) -> Option<Txid>;

    /// Whether a signing request conflicting with `(id, msg_hash)` exists
    async fn is_conflicting(&self, llmq_type: LlmqType, id: RequestId, msg_hash: Txid) -> bool;

    async fn truncate_recovered_sig(&self, llmq_type: LlmqType, id: RequestId);

    /// Hands the service a signature that was already verified elsewhere so
    /// it doesn't verify it again
    async fn push_reconstructed_recovered_sig(&self, rec: RecoveredSig);

    /// Selects the quorum responsible for signing `id`. `sign_height` of
    /// `None` means the current tip; `sign_offset` rewinds the selection by
    /// that many blocks to reach the previous rotation.
    async fn select_quorum_for_signing(
        &self,
        llmq_type: LlmqType,
        id: RequestId,
        sign_height: Option<u32>,
        sign_offset: u32,
    ) -> Option<Arc<Quorum>>;

    /// Subscribes to recovered signatures. The registration lasts until the
    /// returned handle is dropped.
    fn register_recovered_sigs_listener(
        &self,
        listener: Arc<dyn RecoveredSigListener>,
    ) -> ListenerHandle;
}

/// Access to the transaction index
#[async_trait]
pub trait TxIndex: Send + Sync {
    /// Looks up a transaction; the block hash is `None` while the
    /// transaction is unconfirmed
    async fn get_transaction(&self, txid: &Txid) -> Option<(Transaction, Option<BlockHash>)>;

    /// Whether the index covers the whole chain. Gates the one-shot database
    /// upgrade, which would otherwise drop locks of transactions the index
    /// merely hasn't caught up to.
    fn is_synced(&self) -> bool;
}

/// Access to the chainlocks subsystem
pub trait ChainLocks: Send + Sync {
    fn has_chain_lock(&self, height: u32, hash: &BlockHash) -> bool;

    /// Whether chainlocks currently finalize blocks. When they do, fully
    /// confirmed locks are garbage collected on chainlock notifications
    /// rather than at a fixed depth.
    fn is_enabled(&self) -> bool;
}

/// Chain access and validation control
#[async_trait]
pub trait ChainView: Send + Sync {
    fn lookup_block(&self, hash: &BlockHash) -> Option<BlockRef>;

    fn tip(&self) -> BlockRef;

    /// The ancestor of `block` at `height` on `block`'s chain
    fn ancestor(&self, block: &BlockRef, height: u32) -> Option<BlockRef>;

    fn is_synced(&self) -> bool;

    /// Marks the block invalid. A failure here leaves the node in an
    /// inconsistent state and is treated as fatal by the caller.
    async fn invalidate_block(&self, hash: &BlockHash) -> anyhow::Result<()>;

    async fn activate_best_chain(&self) -> anyhow::Result<()>;
}

/// Why a transaction is evicted from the mempool
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    Conflict,
    Block,
    Expiry,
}

/// Access to the mempool
pub trait Mempool: Send + Sync {
    fn get(&self, txid: &Txid) -> Option<Transaction>;

    /// The mempool transaction spending `outpoint`, if any
    fn spender_of(&self, outpoint: &OutPoint) -> Option<Txid>;

    /// Removes the transaction and all its mempool descendants
    fn remove_recursive(&self, txid: &Txid, reason: RemovalReason);

    /// Bumps the mempool-updated counter so block templates re-compose
    fn add_transactions_updated(&self, n: u32);
}

/// Outbound peer-to-peer operations
pub trait PeerGateway: Send + Sync {
    /// Raises the misbehavior score of a peer; 100 is ban-equivalent
    fn misbehave(&self, peer: PeerId, score: i32);

    /// Relays `inv` to peers whose inventory filter matches the transaction,
    /// skipping peers below `min_proto_version`
    fn relay_inv_filtered_tx(&self, inv: Inv, tx: &Transaction, min_proto_version: u32);

    /// Like [`PeerGateway::relay_inv_filtered_tx`] for the case where only
    /// the txid is known locally
    fn relay_inv_filtered_txid(&self, inv: Inv, txid: Txid, min_proto_version: u32);

    /// Requests the transaction from peers that announced it
    fn ask_peers_for_tx(&self, txid: Txid);

    /// Drops an in-flight object request for `inv` from `peer`
    fn erase_object_request(&self, peer: PeerId, inv: Inv);
}

/// Callback capability for accepted transaction locks
pub trait TransactionLockListener: Send + Sync {
    fn on_transaction_lock(&self, tx: &Transaction, islock: &InstantSendLock);
}

/// Spork-derived feature toggles, readable atomically from any thread
#[derive(Debug, Default)]
pub struct FeatureFlags {
    instantsend_enabled: AtomicBool,
    mempool_signing_enabled: AtomicBool,
    reject_conflicting_blocks: AtomicBool,
    dip0020_active: AtomicBool,
}

impl FeatureFlags {
    pub fn instantsend_enabled(&self) -> bool {
        self.instantsend_enabled.load(Ordering::Relaxed)
    }

    pub fn set_instantsend_enabled(&self, value: bool) {
        self.instantsend_enabled.store(value, Ordering::Relaxed);
    }

    pub fn mempool_signing_enabled(&self) -> bool {
        self.mempool_signing_enabled.load(Ordering::Relaxed)
    }

    pub fn set_mempool_signing_enabled(&self, value: bool) {
        self.mempool_signing_enabled.store(value, Ordering::Relaxed);
    }

    pub fn reject_conflicting_blocks(&self) -> bool {
        self.reject_conflicting_blocks.load(Ordering::Relaxed)
    }

    pub fn set_reject_conflicting_blocks(&self, value: bool) {
        self.reject_conflicting_blocks.store(value, Ordering::Relaxed);
    }

    pub fn dip0020_active(&self) -> bool {
        self.dip0020_active.load(Ordering::Relaxed)
    }

    pub fn set_dip0020_active(&self, value: bool) {
        self.dip0020_active.store(value, Ordering::Relaxed);
    }
}

/// Static parameters of the InstantSend subsystem
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstantSendParams {
    /// Quorum type used for input locks and aggregated locks; `None`
    /// disables signing entirely
    pub llmq_type: Option<LlmqType>,
    /// Blocks between quorum rotations
    pub dkg_interval: u32,
    /// Confirmations an input needs before it may be locked (unless its
    /// block is chainlocked or its parent is locked itself)
    pub confirmations_required: u32,
    /// Depth at which locks are considered fully confirmed when chainlocks
    /// are disabled
    pub keep_lock_depth: u32,
    /// Whether this node is a validator eligible for quorum duty
    pub validator_mode: bool,
}

impl Default for InstantSendParams {
    fn default() -> Self {
        InstantSendParams {
            llmq_type: Some(LlmqType(1)),
            dkg_interval: 24,
            confirmations_required: 6,
            keep_lock_depth: 24,
            validator_mode: false,
        }
    }
}
