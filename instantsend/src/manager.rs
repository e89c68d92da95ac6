//! The InstantSend manager: drives input-lock and aggregated-lock signing,
//! verifies inbound locks against the responsible quorums, resolves mempool
//! and block conflicts and garbage collects fully confirmed locks.
//!
//! A single worker task drains the pending queue and the retry queue at a
//! 100 ms idle cadence; all other entry points are called by the host node
//! from arbitrary tasks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::Hash as BitcoinHash;
use bitcoin::{Block, BlockHash, OutPoint, Transaction, Txid};
use tbls::batch::BatchVerifier;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::interface::{
    BlockRef, ChainLocks, ChainView, FeatureFlags, InstantSendParams, Inv, InvKind,
    ListenerHandle, Mempool, PeerGateway, PeerId, RecoveredSig, RecoveredSigListener,
    RemovalReason, SigningService, TransactionLockListener, TxIndex, ISDLOCK_PROTO_VERSION,
    LLMQS_PROTO_VERSION,
};
use crate::isdb::InstantSendDb;
use crate::islock::{
    build_sign_hash, input_request_id, islock_request_id, InstantSendLock, LlmqType, LockHash,
    LockVersion, RequestId,
};
use crate::logging::{LOG_INSTANTSEND, LOG_NET, LOG_SIGNING, LOG_TASK};

/// Locks verified per worker iteration. Bounds verification latency and
/// avoids duplicating work the signing service verifies in parallel.
const MAX_PENDING_BATCH: usize = 32;

/// How long archive markers outlive the confirmation of their lock
const ARCHIVE_RETENTION_BLOCKS: u32 = 100;

const WORK_QUEUE_INTERVAL: Duration = Duration::from_millis(100);

/// An aggregated lock whose threshold signature is still being recovered
#[derive(Clone, Debug)]
struct NascentLock {
    txid: Txid,
    inputs: Vec<OutPoint>,
    cycle_hash: Option<BlockHash>,
}

impl NascentLock {
    fn into_islock(self, sig: tbls::Signature) -> InstantSendLock {
        InstantSendLock {
            txid: self.txid,
            inputs: self.inputs,
            cycle_hash: self.cycle_hash,
            sig,
        }
    }
}

/// A transaction we know about that has no lock yet. Parent/child links are
/// kept by value (txids), never by reference.
#[derive(Debug, Default)]
struct NonLockedTxInfo {
    tx: Option<Transaction>,
    mined_block: Option<BlockRef>,
    children: BTreeSet<Txid>,
}

#[derive(Default)]
struct ManagerState {
    /// Inbound locks awaiting batched verification, by lock hash
    pending_locks: BTreeMap<LockHash, (PeerId, InstantSendLock)>,
    /// Locks this node is currently trying to sign, by aggregated request id
    creating_locks: BTreeMap<RequestId, NascentLock>,
    txid_to_creating: BTreeMap<Txid, RequestId>,
    /// Input request ids this node voted on
    input_request_ids: BTreeSet<RequestId>,
    non_locked_txs: BTreeMap<Txid, NonLockedTxInfo>,
    non_locked_by_outpoint: BTreeMap<OutPoint, Txid>,
    /// Transactions whose locking should be retried because an ancestor
    /// just got locked
    pending_retry_txs: BTreeSet<Txid>,
}

struct WorkerControl {
    shutdown_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
    sig_listener: ListenerHandle,
}

pub struct InstantSendManager {
    params: InstantSendParams,
    flags: Arc<FeatureFlags>,
    db: InstantSendDb,
    signing: Arc<dyn SigningService>,
    tx_index: Arc<dyn TxIndex>,
    chain: Arc<dyn ChainView>,
    chainlocks: Arc<dyn ChainLocks>,
    mempool: Arc<dyn Mempool>,
    peers: Arc<dyn PeerGateway>,
    state: Mutex<ManagerState>,
    worker: Mutex<Option<WorkerControl>>,
    upgraded_db: AtomicBool,
    lock_listeners: Arc<Mutex<BTreeMap<u64, Arc<dyn TransactionLockListener>>>>,
    next_listener_id: AtomicU64,
}

impl InstantSendManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: InstantSendParams,
        flags: Arc<FeatureFlags>,
        db: InstantSendDb,
        signing: Arc<dyn SigningService>,
        tx_index: Arc<dyn TxIndex>,
        chain: Arc<dyn ChainView>,
        chainlocks: Arc<dyn ChainLocks>,
        mempool: Arc<dyn Mempool>,
        peers: Arc<dyn PeerGateway>,
    ) -> Arc<Self> {
        Arc::new(InstantSendManager {
            params,
            flags,
            db,
            signing,
            tx_index,
            chain,
            chainlocks,
            mempool,
            peers,
            state: Mutex::new(ManagerState::default()),
            worker: Mutex::new(None),
            upgraded_db: AtomicBool::new(false),
            lock_listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_listener_id: AtomicU64::new(0),
        })
    }

    pub fn db(&self) -> &InstantSendDb {
        &self.db
    }

    /// Spawns the worker task and subscribes to recovered signatures
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().expect("locking failed");
        assert!(worker.is_none(), "worker already running");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(Arc::clone(self).run_worker(shutdown_rx));
        let sig_listener = self
            .signing
            .register_recovered_sigs_listener(Arc::clone(self) as Arc<dyn RecoveredSigListener>);
        *worker = Some(WorkerControl {
            shutdown_tx,
            join,
            sig_listener,
        });
        info!(target: LOG_TASK, "instant send manager started");
    }

    /// Interrupts the worker and waits for it to finish its current batch
    pub async fn stop(&self) {
        let control = self.worker.lock().expect("locking failed").take();
        let Some(control) = control else {
            return;
        };
        drop(control.sig_listener);
        let _ = control.shutdown_tx.send(true);
        let _ = control.join.await;
        info!(target: LOG_TASK, "instant send manager stopped");
    }

    async fn run_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!(target: LOG_TASK, "worker loop running");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let more_work = self.process_pending_locks().await;
            self.process_pending_retries().await;

            if !more_work {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(WORK_QUEUE_INTERVAL) => {}
                }
            }
        }
        debug!(target: LOG_TASK, "worker loop stopped");
    }

    pub fn subscribe_transaction_locks(
        &self,
        listener: Arc<dyn TransactionLockListener>,
    ) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.lock_listeners
            .lock()
            .expect("locking failed")
            .insert(id, listener);
        let listeners = Arc::clone(&self.lock_listeners);
        ListenerHandle::new(move || {
            listeners.lock().expect("locking failed").remove(&id);
        })
    }

    fn notify_transaction_lock(&self, tx: &Transaction, islock: &InstantSendLock) {
        let listeners: Vec<_> = self
            .lock_listeners
            .lock()
            .expect("locking failed")
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener.on_transaction_lock(tx, islock);
        }
    }

    //
    // Signing driver
    //

    /// Attempts to lock `tx`: requests input-lock signatures and, once all
    /// of them are recovered, the aggregated lock signature.
    ///
    /// `retroactive` marks transactions replayed from a connected block;
    /// those are signed even when mempool signing is disabled so the block
    /// can still receive a chainlock.
    pub async fn process_tx(&self, tx: &Transaction, retroactive: bool) {
        if !self.params.validator_mode || !self.chain.is_synced() {
            return;
        }
        let Some(llmq_type) = self.params.llmq_type else {
            return;
        };
        let txid = tx.compute_txid();

        if !self.check_can_lock(tx).await {
            debug!(target: LOG_SIGNING, %txid, "transaction can not be locked");
            return;
        }

        if let Some(conflicting) = self.get_conflicting_lock_internal(tx).await {
            warn!(
                target: LOG_SIGNING,
                %txid,
                conflicting_islock = %conflicting.hash(),
                conflicting_txid = %conflicting.txid,
                "transaction conflicts with an existing islock"
            );
            return;
        }

        if !self.flags.mempool_signing_enabled() && !retroactive {
            return;
        }

        if !self.try_sign_input_locks(tx, txid, retroactive, llmq_type).await {
            return;
        }

        // We might have received all input locks before the TX itself, in
        // which case the aggregated lock has to be signed now instead of on
        // the last input-lock recovery.
        self.try_sign_islock(tx, txid, llmq_type).await;
    }

    async fn try_sign_input_locks(
        &self,
        tx: &Transaction,
        txid: Txid,
        retroactive: bool,
        llmq_type: LlmqType,
    ) -> bool {
        let mut ids = Vec::with_capacity(tx.input.len());
        let mut already_voted = 0;

        for input in &tx.input {
            let id = input_request_id(&input.previous_output);

            if let Some(other_txid) = self.signing.get_vote_for_id(llmq_type, id).await {
                if other_txid != txid {
                    warn!(
                        target: LOG_SIGNING,
                        %txid,
                        input = %input.previous_output,
                        voted_txid = %other_txid,
                        "input conflicts with a previous vote"
                    );
                    return false;
                }
                already_voted += 1;
            }

            if self.signing.is_conflicting(llmq_type, id, txid).await {
                warn!(
                    target: LOG_SIGNING,
                    %txid,
                    %id,
                    "signing service reports a conflicting request for input"
                );
                return false;
            }

            ids.push(id);
        }

        if !retroactive && already_voted == ids.len() {
            debug!(target: LOG_SIGNING, %txid, "already voted on all inputs");
            return true;
        }

        debug!(target: LOG_SIGNING, %txid, inputs = tx.input.len(), "trying to vote on inputs");
        for (input, id) in tx.input.iter().zip(ids) {
            self.state
                .lock()
                .expect("locking failed")
                .input_request_ids
                .insert(id);
            if self
                .signing
                .async_sign_if_member(llmq_type, id, txid, retroactive)
                .await
            {
                debug!(
                    target: LOG_SIGNING,
                    %txid,
                    input = %input.previous_output,
                    %id,
                    "voted on input"
                );
            }
        }

        true
    }

    /// Whether every input of `tx` satisfies one of: its parent is locked,
    /// its parent is mined deep enough, or its parent's block is chainlocked.
    pub async fn check_can_lock(&self, tx: &Transaction) -> bool {
        if tx.input.is_empty() {
            // TXs without inputs (e.g. quorum commitments) can't be locked
            return false;
        }

        for input in &tx.input {
            if !self.check_can_lock_input(&input.previous_output).await {
                return false;
            }
        }
        true
    }

    async fn check_can_lock_input(&self, outpoint: &OutPoint) -> bool {
        if self.is_locked_internal(&outpoint.txid).await {
            // locked parents allow locking of descendants, mined or not
            return true;
        }

        if self.mempool.get(&outpoint.txid).is_some() {
            debug!(target: LOG_SIGNING, parent = %outpoint.txid, "parent mempool TX is not locked");
            return false;
        }

        let Some((_tx, maybe_block)) = self.tx_index.get_transaction(&outpoint.txid).await else {
            debug!(target: LOG_SIGNING, parent = %outpoint.txid, "failed to find parent TX");
            return false;
        };
        let Some(mined) = maybe_block.and_then(|hash| self.chain.lookup_block(&hash)) else {
            return false;
        };

        let tx_age = self.chain.tip().height.saturating_sub(mined.height) + 1;
        if tx_age < self.params.confirmations_required
            && !self.chainlocks.has_chain_lock(mined.height, &mined.hash)
        {
            debug!(
                target: LOG_SIGNING,
                %outpoint,
                tx_age,
                required = self.params.confirmations_required,
                "parent outpoint is too new and not chainlocked"
            );
            return false;
        }

        true
    }

    async fn try_sign_islock(&self, tx: &Transaction, txid: Txid, llmq_type: LlmqType) {
        for input in &tx.input {
            let id = input_request_id(&input.previous_output);
            if !self.signing.has_recovered_sig(llmq_type, id, txid).await {
                return;
            }
        }

        debug!(target: LOG_SIGNING, %txid, "got all input recovered sigs, creating islock");

        let cycle_hash = if self.flags.dip0020_active() {
            let tip = self.chain.tip();
            let cycle_height = tip.height - (tip.height % self.params.dkg_interval);
            match self.chain.ancestor(&tip, cycle_height) {
                Some(cycle_block) => Some(cycle_block.hash),
                None => {
                    warn!(target: LOG_SIGNING, %txid, "failed to resolve the quorum cycle block");
                    return;
                }
            }
        } else {
            None
        };

        let inputs: Vec<OutPoint> = tx.input.iter().map(|i| i.previous_output).collect();
        let id = islock_request_id(&inputs);

        if self.signing.has_recovered_sig_for_id(llmq_type, id).await {
            return;
        }

        {
            let mut state = self.state.lock().expect("locking failed");
            if state.creating_locks.contains_key(&id) || state.txid_to_creating.contains_key(&txid)
            {
                return;
            }
            state.creating_locks.insert(
                id,
                NascentLock {
                    txid,
                    inputs,
                    cycle_hash,
                },
            );
            state.txid_to_creating.insert(txid, id);
        }

        self.signing
            .async_sign_if_member(llmq_type, id, txid, false)
            .await;
    }

    async fn handle_new_recovered_sig(&self, rec: &RecoveredSig) {
        if !self.flags.instantsend_enabled() || self.params.llmq_type.is_none() {
            return;
        }

        let (input_lock_txid, is_creating) = {
            let state = self.state.lock().expect("locking failed");
            (
                state
                    .input_request_ids
                    .contains(&rec.id)
                    .then_some(rec.msg_hash),
                state.creating_locks.contains_key(&rec.id),
            )
        };

        if let Some(txid) = input_lock_txid {
            self.handle_new_input_lock_recovered_sig(rec, txid).await;
        } else if is_creating {
            self.handle_new_islock_recovered_sig(rec).await;
        }
    }

    async fn handle_new_input_lock_recovered_sig(&self, rec: &RecoveredSig, txid: Txid) {
        let Some((tx, _block)) = self.tx_index.get_transaction(&txid).await else {
            return;
        };
        debug!(target: LOG_SIGNING, %txid, id = %rec.id, "got recovered sig for input");

        let Some(llmq_type) = self.params.llmq_type else {
            return;
        };
        self.try_sign_islock(&tx, txid, llmq_type).await;
    }

    async fn handle_new_islock_recovered_sig(&self, rec: &RecoveredSig) {
        let nascent = {
            let mut state = self.state.lock().expect("locking failed");
            let Some(nascent) = state.creating_locks.remove(&rec.id) else {
                return;
            };
            state.txid_to_creating.remove(&nascent.txid);
            nascent
        };

        if nascent.txid != rec.msg_hash {
            info!(
                target: LOG_SIGNING,
                txid = %nascent.txid,
                recovered_txid = %rec.msg_hash,
                "recovered islock signature is for a different transaction, dropping own version"
            );
            return;
        }

        let islock = nascent.into_islock(rec.sig);
        let hash = islock.hash();

        if self.db.known_lock(hash).await {
            return;
        }
        let mut state = self.state.lock().expect("locking failed");
        if state.pending_locks.contains_key(&hash) {
            return;
        }
        state.pending_locks.insert(hash, (PeerId::LOCAL, islock));
    }

    //
    // Gossip ingestion
    //

    /// Ingests an islock received from a peer. `kind` is the envelope the
    /// payload arrived under; a payload of the other variant is rejected
    /// rather than reinterpreted.
    pub async fn process_islock_message(
        &self,
        peer: PeerId,
        kind: InvKind,
        islock: InstantSendLock,
    ) {
        if !self.flags.instantsend_enabled() {
            return;
        }

        let hash = islock.hash();
        self.peers.erase_object_request(peer, Inv::islock(kind, hash));

        let expected_kind = match islock.version() {
            LockVersion::Deterministic => InvKind::IsdLock,
            LockVersion::Legacy => InvKind::IsLock,
        };
        if kind != expected_kind {
            warn!(target: LOG_NET, %peer, "islock payload variant does not match its envelope");
            self.peers.misbehave(peer, 100);
            return;
        }

        if !Self::preverify_islock(&islock) {
            self.peers.misbehave(peer, 100);
            return;
        }

        if let Some(cycle_hash) = islock.cycle_hash {
            match self.chain.lookup_block(&cycle_hash) {
                None => {
                    // we might not have the block yet, or the peer spams
                    // invalid cycle hashes
                    self.peers.misbehave(peer, 1);
                    return;
                }
                Some(cycle_block) => {
                    if cycle_block.height % self.params.dkg_interval != 0 {
                        self.peers.misbehave(peer, 100);
                        return;
                    }
                }
            }
        }

        if self.db.known_lock(hash).await {
            return;
        }
        let mut state = self.state.lock().expect("locking failed");
        if state.pending_locks.contains_key(&hash) {
            return;
        }

        debug!(
            target: LOG_NET,
            txid = %islock.txid,
            islock = %hash,
            %peer,
            "received islock"
        );
        state.pending_locks.insert(hash, (peer, islock));
    }

    fn preverify_islock(islock: &InstantSendLock) -> bool {
        if islock.txid == Txid::all_zeros() || islock.inputs.is_empty() {
            return false;
        }

        let mut dups = BTreeSet::new();
        islock.inputs.iter().all(|input| dups.insert(*input))
    }

    //
    // Pending lock verification
    //

    /// One worker iteration: drains up to [`MAX_PENDING_BATCH`] pending
    /// locks, verifies them against the current quorum set and retries
    /// failures against the previous rotation. Returns whether more pending
    /// locks are already waiting.
    pub async fn process_pending_locks(&self) -> bool {
        if !self.flags.instantsend_enabled() {
            return false;
        }
        let Some(llmq_type) = self.params.llmq_type else {
            return false;
        };

        let (pend, more_work) = {
            let mut state = self.state.lock().expect("locking failed");
            if state.pending_locks.len() <= MAX_PENDING_BATCH {
                (std::mem::take(&mut state.pending_locks), false)
            } else {
                let mut pend = BTreeMap::new();
                while pend.len() < MAX_PENDING_BATCH {
                    let (hash, entry) = state
                        .pending_locks
                        .pop_first()
                        .expect("len checked above");
                    pend.insert(hash, entry);
                }
                (pend, true)
            }
        };

        if pend.is_empty() {
            return false;
        }

        // First verify against the current quorum set without penalizing
        // anyone: the lock might legitimately stem from the previous
        // rotation.
        let bad_islocks = self.process_pending_batch(llmq_type, 0, &pend, false).await;
        if !bad_islocks.is_empty() {
            debug!(target: LOG_INSTANTSEND, count = bad_islocks.len(), "verifying against the previous quorum set");
            let retry: BTreeMap<_, _> = pend
                .into_iter()
                .filter(|(hash, _)| bad_islocks.contains(hash))
                .collect();
            self.process_pending_batch(llmq_type, self.params.dkg_interval, &retry, true)
                .await;
        }

        more_work
    }

    /// Verifies a batch of pending locks against the quorum set selected at
    /// `sign_offset` and processes the ones that pass. Returns the lock
    /// hashes that failed. `ban` applies the (mild) misbehavior score for
    /// failures, used on the second pass only.
    async fn process_pending_batch(
        &self,
        llmq_type: LlmqType,
        sign_offset: u32,
        pend: &BTreeMap<LockHash, (PeerId, InstantSendLock)>,
        ban: bool,
    ) -> BTreeSet<LockHash> {
        let mut verifier = BatchVerifier::<PeerId, LockHash>::new();
        let mut bad_islocks = BTreeSet::new();
        let mut reconstructed_sigs: BTreeMap<LockHash, RecoveredSig> = BTreeMap::new();
        let mut already_verified = 0usize;
        let tip = self.chain.tip();

        for (hash, (peer, islock)) in pend {
            let id = islock.request_id();

            // no need to verify if the matching recovered sig is already
            // known and was verified by the signing service
            if self
                .signing
                .has_recovered_sig(llmq_type, id, islock.txid)
                .await
            {
                already_verified += 1;
                continue;
            }

            let mut sign_height = None;
            if let Some(cycle_hash) = islock.cycle_hash {
                let Some(cycle_block) = self.chain.lookup_block(&cycle_hash) else {
                    bad_islocks.insert(*hash);
                    if ban && !peer.is_local() {
                        self.peers.misbehave(*peer, 20);
                    }
                    continue;
                };
                if cycle_block.height + self.params.dkg_interval < tip.height {
                    sign_height = Some(cycle_block.height + self.params.dkg_interval - 1);
                }
            }

            let Some(quorum) = self
                .signing
                .select_quorum_for_signing(llmq_type, id, sign_height, sign_offset)
                .await
            else {
                warn!(target: LOG_INSTANTSEND, islock = %hash, sign_offset, "no quorum available for verification");
                bad_islocks.insert(*hash);
                continue;
            };

            let sign_hash = build_sign_hash(llmq_type, quorum.quorum_hash, id, islock.txid);
            verifier.push_message(
                *peer,
                *hash,
                sign_hash.to_message(),
                islock.sig,
                quorum.public_key,
            );

            // The recovered sig can be reconstructed from the islock and
            // handed to the signing service, saving it the verification.
            // Only done once this verification has succeeded.
            if !self.signing.has_recovered_sig_for_id(llmq_type, id).await {
                reconstructed_sigs.insert(
                    *hash,
                    RecoveredSig {
                        llmq_type,
                        quorum_hash: quorum.quorum_hash,
                        id,
                        msg_hash: islock.txid,
                        sig: islock.sig,
                    },
                );
            }
        }

        let verify_count = verifier.message_count();
        verifier.verify();
        debug!(
            target: LOG_INSTANTSEND,
            verify_count,
            already_verified,
            sources = verifier.unique_source_count(),
            sign_offset,
            "verified pending islocks"
        );

        if ban {
            for peer in &verifier.bad_sources {
                if !peer.is_local() {
                    // The peer might simply be unlucky and have relayed an
                    // old lock that no longer validates after a quorum
                    // rotation, so the score stays mild.
                    self.peers.misbehave(*peer, 20);
                }
            }
        }

        for (hash, (peer, islock)) in pend {
            if bad_islocks.contains(hash) {
                continue;
            }
            if verifier.bad_messages.contains(hash) {
                debug!(
                    target: LOG_INSTANTSEND,
                    txid = %islock.txid,
                    islock = %hash,
                    %peer,
                    "invalid signature in islock"
                );
                bad_islocks.insert(*hash);
                continue;
            }

            self.process_islock(*peer, *hash, islock).await;

            if let Some(rec) = reconstructed_sigs.get(hash) {
                if !self.signing.has_recovered_sig_for_id(llmq_type, rec.id).await {
                    debug!(
                        target: LOG_INSTANTSEND,
                        txid = %islock.txid,
                        islock = %hash,
                        "passing reconstructed recovered sig to the signing service"
                    );
                    self.signing
                        .push_reconstructed_recovered_sig(rec.clone())
                        .await;
                }
            }
        }

        bad_islocks
    }

    //
    // Conflict resolution
    //

    /// Accepts a verified lock: persists it, prunes superseded local state,
    /// relays it and resolves conflicts with the mempool and with mined
    /// blocks. Idempotent per lock hash.
    async fn process_islock(&self, from: PeerId, hash: LockHash, islock: &InstantSendLock) {
        debug!(
            target: LOG_INSTANTSEND,
            txid = %islock.txid,
            islock = %hash,
            peer = %from,
            "processing islock"
        );

        {
            // local signing of this transaction is superseded
            let mut state = self.state.lock().expect("locking failed");
            state.creating_locks.remove(&islock.request_id());
            if let Some(id) = state.txid_to_creating.remove(&islock.txid) {
                state.creating_locks.remove(&id);
            }
        }

        if self.db.known_lock(hash).await {
            return;
        }

        // lookup failure is fine, the lock must propagate even if we don't
        // have the TX locally
        let mut tx = None;
        let mut mined_block = None;
        if let Some((found_tx, maybe_block)) = self.tx_index.get_transaction(&islock.txid).await {
            if let Some(block_hash) = maybe_block {
                mined_block = self.chain.lookup_block(&block_hash);
                if let Some(mined) = mined_block {
                    if self.chainlocks.has_chain_lock(mined.height, &mined.hash) {
                        // the chainlock already finalizes this TX and every
                        // conflict, the islock adds nothing
                        debug!(
                            target: LOG_INSTANTSEND,
                            txid = %islock.txid,
                            islock = %hash,
                            block = %mined.hash,
                            "dropping islock, its transaction is already chainlocked"
                        );
                        return;
                    }
                }
            }
            tx = Some(found_tx);
        }

        if let Some(other) = self.db.get_lock_by_txid(&islock.txid).await {
            info!(
                target: LOG_INSTANTSEND,
                txid = %islock.txid,
                islock = %hash,
                other_islock = %other.hash(),
                "duplicate islock for transaction"
            );
        }
        for input in &islock.inputs {
            if let Some(other) = self.db.get_lock_by_input(input).await {
                info!(
                    target: LOG_INSTANTSEND,
                    txid = %islock.txid,
                    islock = %hash,
                    input = %input,
                    other_islock = %other.hash(),
                    "conflicting input in islock"
                );
            }
        }

        self.db.write_new_lock(hash, islock).await;
        if let Some(mined) = mined_block {
            self.db.write_mined(hash, mined.height).await;
        }

        {
            // this also queues child TXs for a locking retry
            let mut state = self.state.lock().expect("locking failed");
            Self::remove_non_locked_tx(&mut state, &islock.txid, true);
        }
        // The recovered sigs for the inputs are not needed anymore; the
        // islock alone detects conflicts from now on.
        self.truncate_recovered_sigs_for_inputs(islock).await;

        let (kind, min_proto) = match islock.version() {
            LockVersion::Deterministic => (InvKind::IsdLock, ISDLOCK_PROTO_VERSION),
            LockVersion::Legacy => (InvKind::IsLock, LLMQS_PROTO_VERSION),
        };
        let inv = Inv::islock(kind, hash);
        match &tx {
            Some(tx) => self.peers.relay_inv_filtered_tx(inv, tx, min_proto),
            // Without the TX, peers are filtered on the txid alone; the
            // announcement is retried when the TX arrives.
            None => self.peers.relay_inv_filtered_txid(inv, islock.txid, min_proto),
        }

        self.resolve_block_conflicts(hash, islock).await;
        self.remove_mempool_conflicts(hash, islock).await;

        if let Some(tx) = &tx {
            debug!(target: LOG_INSTANTSEND, txid = %islock.txid, "notifying about an in-time lock");
            self.notify_transaction_lock(tx, islock);
            // make sure newly locked TXs are picked up by block templates
            self.mempool.add_transactions_updated(1);
        }
    }

    async fn truncate_recovered_sigs_for_inputs(&self, islock: &InstantSendLock) {
        let ids: Vec<RequestId> = islock.inputs.iter().map(input_request_id).collect();
        {
            let mut state = self.state.lock().expect("locking failed");
            for id in &ids {
                state.input_request_ids.remove(id);
            }
        }
        if let Some(llmq_type) = self.params.llmq_type {
            for id in ids {
                self.signing.truncate_recovered_sig(llmq_type, id).await;
            }
        }
    }

    /// Collects mined transactions conflicting with the lock. A conflict in
    /// a chainlocked block wins over the lock (the lock chain is pruned);
    /// any other conflicting block is invalidated and the best chain
    /// re-selected.
    async fn resolve_block_conflicts(&self, islock_hash: LockHash, islock: &InstantSendLock) {
        if !self.flags.reject_conflicting_blocks() {
            return;
        }

        let conflicts: BTreeMap<BlockHash, (BlockRef, BTreeMap<Txid, Transaction>)> = {
            let state = self.state.lock().expect("locking failed");
            let mut conflicts: BTreeMap<BlockHash, (BlockRef, BTreeMap<Txid, Transaction>)> =
                BTreeMap::new();
            for input in &islock.inputs {
                let Some(conflict_txid) = state.non_locked_by_outpoint.get(input) else {
                    continue;
                };
                if *conflict_txid == islock.txid {
                    continue;
                }
                let Some(info) = state.non_locked_txs.get(conflict_txid) else {
                    continue;
                };
                let (Some(mined), Some(conflict_tx)) = (info.mined_block, info.tx.clone()) else {
                    continue;
                };
                warn!(
                    target: LOG_INSTANTSEND,
                    txid = %islock.txid,
                    islock = %islock_hash,
                    conflict_txid = %conflict_txid,
                    input = %input,
                    block = %mined.hash,
                    "mined transaction conflicts with islock"
                );
                conflicts
                    .entry(mined.hash)
                    .or_insert_with(|| (mined, BTreeMap::new()))
                    .1
                    .insert(*conflict_txid, conflict_tx);
            }
            conflicts
        };

        if conflicts.is_empty() {
            return;
        }

        // If a conflict is already chainlocked there is no choice: consensus
        // is better served sacrificing individual islocks than a chainlock.
        for (mined, _txs) in conflicts.values() {
            if self.chainlocks.has_chain_lock(mined.height, &mined.hash) {
                warn!(
                    target: LOG_INSTANTSEND,
                    txid = %islock.txid,
                    islock = %islock_hash,
                    block = %mined.hash,
                    "a conflicting transaction is already chainlocked"
                );
                self.remove_conflicting_lock(islock_hash, islock).await;
                return;
            }
        }

        let mut activate_best_chain = false;
        for (mined, txs) in conflicts.values() {
            {
                let mut state = self.state.lock().expect("locking failed");
                for conflict_tx in txs.values() {
                    Self::remove_conflicted_tx(&mut state, conflict_tx);
                }
            }

            warn!(target: LOG_INSTANTSEND, block = %mined.hash, "invalidating block conflicting with islock");
            if let Err(e) = self.chain.invalidate_block(&mined.hash).await {
                error!(target: LOG_INSTANTSEND, block = %mined.hash, error = %e, "failed to invalidate block");
                // the node state is inconsistent beyond repair at this point
                panic!("failed to invalidate block {}: {e:#}", mined.hash);
            }
            activate_best_chain = true;
        }

        if activate_best_chain {
            if let Err(e) = self.chain.activate_best_chain().await {
                error!(target: LOG_INSTANTSEND, error = %e, "failed to activate best chain");
                panic!("failed to activate best chain: {e:#}");
            }
        }
    }

    /// Prunes the lock and all chained descendant locks, archiving them at
    /// the current tip height
    async fn remove_conflicting_lock(&self, islock_hash: LockHash, islock: &InstantSendLock) {
        warn!(
            target: LOG_INSTANTSEND,
            txid = %islock.txid,
            islock = %islock_hash,
            "removing islock and its chained children"
        );
        let tip_height = self.chain.tip().height;
        let removed = self
            .db
            .remove_chained_locks(islock_hash, islock.txid, tip_height)
            .await;
        for removed_hash in removed {
            info!(
                target: LOG_INSTANTSEND,
                islock = %islock_hash,
                removed_islock = %removed_hash,
                "removed chained islock"
            );
        }
    }

    async fn remove_mempool_conflicts(&self, islock_hash: LockHash, islock: &InstantSendLock) {
        let mut to_delete: BTreeMap<Txid, Transaction> = BTreeMap::new();
        for input in &islock.inputs {
            let Some(spender) = self.mempool.spender_of(input) else {
                continue;
            };
            if spender == islock.txid {
                continue;
            }
            if let Some(conflict_tx) = self.mempool.get(&spender) {
                warn!(
                    target: LOG_INSTANTSEND,
                    txid = %islock.txid,
                    islock = %islock_hash,
                    conflict_txid = %spender,
                    input = %input,
                    "mempool transaction conflicts with islock"
                );
                to_delete.insert(spender, conflict_tx);
            }
        }

        if to_delete.is_empty() {
            return;
        }

        for conflict_txid in to_delete.keys() {
            self.mempool
                .remove_recursive(conflict_txid, RemovalReason::Conflict);
        }
        {
            let mut state = self.state.lock().expect("locking failed");
            for conflict_tx in to_delete.values() {
                Self::remove_conflicted_tx(&mut state, conflict_tx);
            }
        }
        // ask peers that announced the locked TX for the canonical version
        self.peers.ask_peers_for_tx(islock.txid);
    }

    //
    // Non-locked transaction tracking
    //

    fn add_non_locked_tx(&self, tx: &Transaction, mined_block: Option<BlockRef>) {
        let txid = tx.compute_txid();
        let mut state = self.state.lock().expect("locking failed");

        let is_new = !state.non_locked_txs.contains_key(&txid);
        {
            let info = state.non_locked_txs.entry(txid).or_default();
            info.mined_block = mined_block;
            if is_new {
                info.tx = Some(tx.clone());
            }
        }
        if is_new {
            for input in &tx.input {
                state
                    .non_locked_txs
                    .entry(input.previous_output.txid)
                    .or_default()
                    .children
                    .insert(txid);
                state
                    .non_locked_by_outpoint
                    .entry(input.previous_output)
                    .or_insert(txid);
            }
        }

        debug!(
            target: LOG_INSTANTSEND,
            %txid,
            mined_block = ?mined_block.map(|b| b.hash),
            "tracking non-locked transaction"
        );
    }

    fn remove_non_locked_tx(state: &mut ManagerState, txid: &Txid, retry_children: bool) {
        let Some(info) = state.non_locked_txs.remove(txid) else {
            return;
        };

        let mut retry_children_count = 0;
        if retry_children {
            // the TX got locked, descendants can be retried now
            for child in &info.children {
                state.pending_retry_txs.insert(*child);
                retry_children_count += 1;
            }
        }

        if let Some(tx) = &info.tx {
            for input in &tx.input {
                let parent_txid = input.previous_output.txid;
                let remove_parent = match state.non_locked_txs.get_mut(&parent_txid) {
                    Some(parent) => {
                        parent.children.remove(txid);
                        parent.tx.is_none() && parent.children.is_empty()
                    }
                    None => false,
                };
                if remove_parent {
                    state.non_locked_txs.remove(&parent_txid);
                }
                state.non_locked_by_outpoint.remove(&input.previous_output);
            }
        }

        debug!(
            target: LOG_INSTANTSEND,
            %txid,
            retry_children,
            retry_children_count,
            "untracked non-locked transaction"
        );
    }

    fn remove_conflicted_tx(state: &mut ManagerState, tx: &Transaction) {
        Self::remove_non_locked_tx(state, &tx.compute_txid(), false);
        // forget the input votes so a different spender can be signed later
        for input in &tx.input {
            state
                .input_request_ids
                .remove(&input_request_id(&input.previous_output));
        }
    }

    //
    // Mempool and block callbacks
    //

    pub async fn transaction_added_to_mempool(&self, tx: &Transaction) {
        if !self.flags.instantsend_enabled() || !self.chain.is_synced() || tx.input.is_empty() {
            return;
        }
        let txid = tx.compute_txid();

        match self.db.get_lock_by_txid(&txid).await {
            None => {
                self.process_tx(tx, false).await;
                self.add_non_locked_tx(tx, None);
            }
            Some(islock) => {
                {
                    let mut state = self.state.lock().expect("locking failed");
                    Self::remove_non_locked_tx(&mut state, &txid, true);
                }
                // The filtered announcement may have missed this lock while
                // the TX was unknown, so re-announce with the TX available.
                let (kind, min_proto) = match islock.version() {
                    LockVersion::Deterministic => (InvKind::IsdLock, ISDLOCK_PROTO_VERSION),
                    LockVersion::Legacy => (InvKind::IsLock, LLMQS_PROTO_VERSION),
                };
                self.peers
                    .relay_inv_filtered_tx(Inv::islock(kind, islock.hash()), tx, min_proto);
                debug!(target: LOG_INSTANTSEND, %txid, "notifying about an earlier received lock");
                self.notify_transaction_lock(tx, &islock);
            }
        }
    }

    /// A locked transaction leaving the mempool means it was replaced or
    /// double spent; the lock (and its descendants) is void.
    pub async fn transaction_removed_from_mempool(&self, tx: &Transaction) {
        if tx.input.is_empty() || !self.upgraded_db.load(Ordering::Acquire) {
            return;
        }
        let txid = tx.compute_txid();
        let Some(islock) = self.db.get_lock_by_txid(&txid).await else {
            return;
        };

        debug!(target: LOG_INSTANTSEND, %txid, "locked transaction was removed from the mempool");
        self.remove_conflicting_lock(islock.hash(), &islock).await;
    }

    pub async fn block_connected(
        &self,
        block: &Block,
        block_ref: BlockRef,
        conflicted_txs: &[Transaction],
    ) {
        if !self.flags.instantsend_enabled() {
            return;
        }

        if !conflicted_txs.is_empty() {
            let mut state = self.state.lock().expect("locking failed");
            for tx in conflicted_txs {
                Self::remove_conflicted_tx(&mut state, tx);
            }
        }

        if self.chain.is_synced() {
            for tx in &block.txdata {
                if tx.is_coinbase() || tx.input.is_empty() {
                    // coinbase and TXs without inputs can't be locked
                    continue;
                }
                let txid = tx.compute_txid();

                if !self.is_locked_internal(&txid).await
                    && !self
                        .chainlocks
                        .has_chain_lock(block_ref.height, &block_ref.hash)
                {
                    self.process_tx(tx, true).await;
                    self.add_non_locked_tx(tx, Some(block_ref));
                } else {
                    let mut state = self.state.lock().expect("locking failed");
                    Self::remove_non_locked_tx(&mut state, &txid, true);
                }
            }
        }

        let txids: Vec<Txid> = block
            .txdata
            .iter()
            .filter(|tx| !tx.is_coinbase() && !tx.input.is_empty())
            .map(|tx| tx.compute_txid())
            .collect();
        self.db.write_block_locks(&txids, block_ref.height).await;
    }

    pub async fn block_disconnected(&self, block: &Block, block_ref: BlockRef) {
        let txids: Vec<Txid> = block
            .txdata
            .iter()
            .filter(|tx| !tx.is_coinbase() && !tx.input.is_empty())
            .map(|tx| tx.compute_txid())
            .collect();
        self.db.remove_block_locks(&txids, block_ref.height).await;
    }

    //
    // Confirmation and garbage collection
    //

    pub async fn notify_chain_lock(&self, chainlocked_block: BlockRef) {
        self.handle_fully_confirmed_block(chainlocked_block).await;
    }

    pub async fn updated_block_tip(&self, tip: BlockRef) {
        if !self.upgraded_db.load(Ordering::Acquire)
            && self.flags.dip0020_active()
            && self.tx_index.is_synced()
        {
            self.db
                .upgrade(self.tx_index.as_ref())
                .await
                .expect("lock database upgrade failed");
            self.upgraded_db.store(true, Ordering::Release);
        }

        if self.chainlocks.is_enabled() {
            // chainlock notifications confirm locks, nothing to do here
            return;
        }

        let Some(confirmed_height) = tip.height.checked_sub(self.params.keep_lock_depth) else {
            return;
        };
        if let Some(confirmed_block) = self.chain.ancestor(&tip, confirmed_height) {
            self.handle_fully_confirmed_block(confirmed_block).await;
        }
    }

    async fn handle_fully_confirmed_block(&self, block: BlockRef) {
        if !self.flags.instantsend_enabled() {
            return;
        }

        let removed = self.db.remove_confirmed_up_to(block.height).await;
        for (hash, islock) in &removed {
            debug!(
                target: LOG_INSTANTSEND,
                txid = %islock.txid,
                islock = %hash,
                "removed islock, it is fully confirmed"
            );

            // All inputs are spent for good now; the recovered sigs can't be
            // needed for conflict handling anymore.
            self.truncate_recovered_sigs_for_inputs(islock).await;
            if let Some(llmq_type) = self.params.llmq_type {
                self.signing
                    .truncate_recovered_sig(llmq_type, islock.request_id())
                    .await;
            }
        }

        self.db
            .remove_archived_up_to(block.height.saturating_sub(ARCHIVE_RETENTION_BLOCKS))
            .await;

        // Non-locked TXs buried under the confirmed block are final now;
        // their children go to the retry queue.
        let buried: Vec<Txid> = {
            let state = self.state.lock().expect("locking failed");
            state
                .non_locked_txs
                .iter()
                .filter_map(|(txid, info)| {
                    let mined = info.mined_block?;
                    (self.chain.ancestor(&block, mined.height)? == mined).then_some(*txid)
                })
                .collect()
        };
        {
            let mut state = self.state.lock().expect("locking failed");
            for txid in buried {
                Self::remove_non_locked_tx(&mut state, &txid, true);
            }
        }
    }

    //
    // Retry loop
    //

    /// Retries locking for transactions whose ancestors just got locked or
    /// confirmed. This is how a chain of descendants locks step by step.
    pub async fn process_pending_retries(&self) {
        let retry_txs = {
            let mut state = self.state.lock().expect("locking failed");
            std::mem::take(&mut state.pending_retry_txs)
        };
        if retry_txs.is_empty() || !self.flags.instantsend_enabled() {
            return;
        }

        let mut retried = 0usize;
        for txid in retry_txs {
            let tx = {
                let state = self.state.lock().expect("locking failed");
                let Some(tx) = state.non_locked_txs.get(&txid).and_then(|info| info.tx.clone())
                else {
                    continue;
                };
                if state.txid_to_creating.contains_key(&txid) {
                    // already in the middle of locking this one
                    continue;
                }
                tx
            };

            if self.is_locked_internal(&txid).await {
                continue;
            }
            if self.get_conflicting_lock_internal(&tx).await.is_some() {
                continue;
            }

            debug!(target: LOG_INSTANTSEND, %txid, "retrying to lock transaction");
            self.process_tx(&tx, false).await;
            retried += 1;
        }

        if retried > 0 {
            let non_locked = self
                .state
                .lock()
                .expect("locking failed")
                .non_locked_txs
                .len();
            debug!(target: LOG_INSTANTSEND, retried, non_locked, "retried transactions");
        }
    }

    //
    // Queries
    //

    pub async fn is_locked(&self, txid: &Txid) -> bool {
        self.flags.instantsend_enabled() && self.is_locked_internal(txid).await
    }

    async fn is_locked_internal(&self, txid: &Txid) -> bool {
        match self.db.get_lock_hash_by_txid(txid).await {
            Some(hash) => self.db.known_lock(hash).await,
            None => false,
        }
    }

    /// The lock covering one of `tx`'s inputs for a different txid, if any
    pub async fn get_conflicting_lock(&self, tx: &Transaction) -> Option<InstantSendLock> {
        if !self.flags.instantsend_enabled() {
            return None;
        }
        self.get_conflicting_lock_internal(tx).await
    }

    async fn get_conflicting_lock_internal(&self, tx: &Transaction) -> Option<InstantSendLock> {
        let txid = tx.compute_txid();
        for input in &tx.input {
            if let Some(other) = self.db.get_lock_by_input(&input.previous_output).await {
                if other.txid != txid {
                    return Some(other);
                }
            }
        }
        None
    }

    pub async fn get_lock_by_hash(&self, hash: LockHash) -> Option<InstantSendLock> {
        if !self.flags.instantsend_enabled() {
            return None;
        }
        self.db.get_lock_by_hash(hash).await
    }

    pub async fn get_lock_by_txid(&self, txid: &Txid) -> Option<InstantSendLock> {
        if !self.flags.instantsend_enabled() {
            return None;
        }
        self.db.get_lock_by_txid(txid).await
    }

    pub async fn get_lock_hash_by_txid(&self, txid: &Txid) -> Option<LockHash> {
        if !self.flags.instantsend_enabled() {
            return None;
        }
        self.db.get_lock_hash_by_txid(txid).await
    }

    /// Whether the lock behind `inv` needs to be requested from the
    /// announcing peer
    pub async fn already_have(&self, inv: &Inv) -> bool {
        if !self.flags.instantsend_enabled() {
            return true;
        }
        let hash = LockHash::from_byte_array(inv.hash);
        if self
            .state
            .lock()
            .expect("locking failed")
            .pending_locks
            .contains_key(&hash)
        {
            return true;
        }
        self.db.known_lock(hash).await
    }

    pub async fn lock_count(&self) -> usize {
        self.db.lock_count().await
    }
}

#[async_trait]
impl RecoveredSigListener for InstantSendManager {
    async fn on_recovered_sig(&self, rec: &RecoveredSig) {
        self.handle_new_recovered_sig(rec).await;
    }
}
