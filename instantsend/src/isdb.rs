//! Persistent multi-index store for InstantSend locks.
//!
//! Live locks are indexed three ways (by lock hash, by locked txid, by spent
//! outpoint). Mined and archived locks are additionally indexed under
//! height-inverted keys: the height encodes as `u32::MAX - height` big
//! endian, so an ascending scan starting at the inverted key for `H` yields
//! exactly the entries at heights `<= H`, newest first.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{Error, Read, Write};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use bitcoin::{OutPoint, Txid};
use lru::LruCache;
use strum_macros::EnumIter;
use tracing::{debug, warn};

use crate::db::{Database, DatabaseTransaction};
use crate::encoding::{Decodable, DecodeError, Encodable};
use crate::interface::TxIndex;
use crate::islock::{InstantSendLock, LockHash};
use crate::logging::LOG_DB;
use crate::{impl_consensus_encoding, impl_db_lookup, impl_db_record};

/// Schema version written by [`InstantSendDb::upgrade`]
pub const CURRENT_VERSION: u64 = 1;

const LOCK_CACHE_SIZE: usize = 10_000;

#[repr(u8)]
#[derive(Clone, EnumIter, Debug)]
pub enum DbKeyPrefix {
    LockByHash = 0x01,
    LockByTxid = 0x02,
    LockByOutpoint = 0x03,
    MinedByHeight = 0x04,
    ArchivedByHeight = 0x05,
    ArchivedByHash = 0x06,
    DatabaseVersion = 0x07,
}

impl fmt::Display for DbKeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

macro_rules! impl_unit_key_encoding {
    ($type:ty) => {
        impl Encodable for $type {
            fn consensus_encode<W: Write>(&self, _writer: &mut W) -> Result<usize, Error> {
                Ok(0)
            }
        }

        impl Decodable for $type {
            fn consensus_decode<R: Read>(_r: &mut R) -> Result<Self, DecodeError> {
                Ok(Self)
            }
        }
    };
}

/// Block height stored with all bits inverted so ascending key order means
/// descending height
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct InvertedHeight(u32);

impl InvertedHeight {
    pub fn new(height: u32) -> Self {
        InvertedHeight(height)
    }

    pub fn height(self) -> u32 {
        self.0
    }

    /// Key suffix an inverted-height range scan starts from
    pub fn range_start(self) -> [u8; 4] {
        (u32::MAX - self.0).to_be_bytes()
    }
}

impl Encodable for InvertedHeight {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, Error> {
        writer.write_all(&(u32::MAX - self.0).to_be_bytes())?;
        Ok(4)
    }
}

impl Decodable for InvertedHeight {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let mut bytes = [0u8; 4];
        r.read_exact(&mut bytes).map_err(DecodeError::from_err)?;
        Ok(InvertedHeight(u32::MAX - u32::from_be_bytes(bytes)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockByHashKey(pub LockHash);
impl_consensus_encoding!(LockByHashKey, 0);

#[derive(Debug)]
pub struct LockByHashKeyPrefix;
impl_unit_key_encoding!(LockByHashKeyPrefix);

impl_db_record!(
    key = LockByHashKey,
    value = InstantSendLock,
    db_prefix = DbKeyPrefix::LockByHash,
);
impl_db_lookup!(key = LockByHashKey, query_prefix = LockByHashKeyPrefix);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockByTxidKey(pub Txid);
impl_consensus_encoding!(LockByTxidKey, 0);

impl_db_record!(
    key = LockByTxidKey,
    value = LockHash,
    db_prefix = DbKeyPrefix::LockByTxid,
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockByOutpointKey(pub OutPoint);
impl_consensus_encoding!(LockByOutpointKey, 0);

/// Strict key prefix selecting every outpoint row spending a given parent
/// txid: outpoints serialize txid-first, so `(parent, 0)` onwards shares this
/// prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockByOutpointParentPrefix(pub Txid);
impl_consensus_encoding!(LockByOutpointParentPrefix, 0);

impl_db_record!(
    key = LockByOutpointKey,
    value = LockHash,
    db_prefix = DbKeyPrefix::LockByOutpoint,
);
impl_db_lookup!(
    key = LockByOutpointKey,
    query_prefix = LockByOutpointParentPrefix
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedByHeightKey(pub InvertedHeight, pub LockHash);
impl_consensus_encoding!(MinedByHeightKey, 0, 1);

impl_db_record!(
    key = MinedByHeightKey,
    value = (),
    db_prefix = DbKeyPrefix::MinedByHeight,
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedByHeightKey(pub InvertedHeight, pub LockHash);
impl_consensus_encoding!(ArchivedByHeightKey, 0, 1);

impl_db_record!(
    key = ArchivedByHeightKey,
    value = (),
    db_prefix = DbKeyPrefix::ArchivedByHeight,
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedByHashKey(pub LockHash);
impl_consensus_encoding!(ArchivedByHashKey, 0);

impl_db_record!(
    key = ArchivedByHashKey,
    value = (),
    db_prefix = DbKeyPrefix::ArchivedByHash,
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseVersionKey;
impl_unit_key_encoding!(DatabaseVersionKey);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DatabaseVersion(pub u64);
impl_consensus_encoding!(DatabaseVersion, 0);

impl_db_record!(
    key = DatabaseVersionKey,
    value = DatabaseVersion,
    db_prefix = DbKeyPrefix::DatabaseVersion,
);

struct LockCaches {
    by_hash: LruCache<LockHash, Option<InstantSendLock>>,
    hash_by_txid: LruCache<Txid, Option<LockHash>>,
    hash_by_outpoint: LruCache<OutPoint, Option<LockHash>>,
}

impl LockCaches {
    fn new() -> Self {
        let size = NonZeroUsize::new(LOCK_CACHE_SIZE).expect("is non-zero");
        LockCaches {
            by_hash: LruCache::new(size),
            hash_by_txid: LruCache::new(size),
            hash_by_outpoint: LruCache::new(size),
        }
    }

    fn forget_lock(&mut self, hash: LockHash, islock: &InstantSendLock) {
        self.by_hash.pop(&hash);
        self.hash_by_txid.pop(&islock.txid);
        for input in &islock.inputs {
            self.hash_by_outpoint.pop(input);
        }
    }
}

/// The InstantSend lock store ("IS-DB")
pub struct InstantSendDb {
    db: Database,
    // Negative results are cached as `None` so repeated lookups for unknown
    // keys don't hit the backend.
    caches: Mutex<LockCaches>,
    best_confirmed_height: AtomicU32,
}

impl InstantSendDb {
    pub fn new(db: Database) -> Self {
        InstantSendDb {
            db,
            caches: Mutex::new(LockCaches::new()),
            best_confirmed_height: AtomicU32::new(0),
        }
    }

    /// One-shot schema upgrade: drops locks whose transaction the index no
    /// longer knows, then stamps the current version. Must only run once the
    /// transaction index is fully available, otherwise valid locks would be
    /// erased.
    pub async fn upgrade(&self, tx_index: &dyn TxIndex) -> anyhow::Result<()> {
        let mut dbtx = self.db.begin_transaction().await;
        let version = dbtx
            .get_value(&DatabaseVersionKey)
            .await
            .unwrap_or(DatabaseVersion(0));
        if version.0 >= CURRENT_VERSION {
            return Ok(());
        }

        let mut dropped = 0usize;
        for (LockByHashKey(hash), islock) in dbtx.find_by_prefix(&LockByHashKeyPrefix).await {
            if tx_index.get_transaction(&islock.txid).await.is_none() {
                dbtx.remove_entry(&LockByTxidKey(islock.txid)).await;
                for input in &islock.inputs {
                    dbtx.remove_entry(&LockByOutpointKey(*input)).await;
                }
                dbtx.remove_entry(&LockByHashKey(hash)).await;
                dropped += 1;
            }
        }
        dbtx.insert_entry(&DatabaseVersionKey, &DatabaseVersion(CURRENT_VERSION))
            .await;
        dbtx.commit_tx().await?;

        debug!(target: LOG_DB, version = CURRENT_VERSION, dropped, "upgraded lock database");
        Ok(())
    }

    /// Atomically writes the lock under all three live indices
    pub async fn write_new_lock(&self, hash: LockHash, islock: &InstantSendLock) {
        let mut dbtx = self.db.begin_transaction().await;
        dbtx.insert_entry(&LockByHashKey(hash), islock).await;
        dbtx.insert_entry(&LockByTxidKey(islock.txid), &hash).await;
        for input in &islock.inputs {
            dbtx.insert_entry(&LockByOutpointKey(*input), &hash).await;
        }
        dbtx.commit_tx().await.expect("database commit failed");

        let mut caches = self.caches.lock().expect("locking failed");
        caches.by_hash.put(hash, Some(islock.clone()));
        caches.hash_by_txid.put(islock.txid, Some(hash));
        for input in &islock.inputs {
            caches.hash_by_outpoint.put(*input, Some(hash));
        }
    }

    /// Removes the three live index rows of a lock within `dbtx`. Loads the
    /// lock first when the caller doesn't have it; no-op if it doesn't exist.
    async fn remove_lock(
        &self,
        dbtx: &mut DatabaseTransaction<'_>,
        hash: LockHash,
        islock: Option<InstantSendLock>,
        keep_cache: bool,
    ) -> Option<InstantSendLock> {
        let islock = match islock {
            Some(islock) => islock,
            None => dbtx.get_value(&LockByHashKey(hash)).await?,
        };

        dbtx.remove_entry(&LockByHashKey(hash)).await;
        dbtx.remove_entry(&LockByTxidKey(islock.txid)).await;
        for input in &islock.inputs {
            dbtx.remove_entry(&LockByOutpointKey(*input)).await;
        }

        if !keep_cache {
            self.caches
                .lock()
                .expect("locking failed")
                .forget_lock(hash, &islock);
        }

        Some(islock)
    }

    pub async fn write_mined(&self, hash: LockHash, height: u32) {
        let mut dbtx = self.db.begin_transaction().await;
        dbtx.insert_entry(&MinedByHeightKey(InvertedHeight::new(height), hash), &())
            .await;
        dbtx.commit_tx().await.expect("database commit failed");
    }

    async fn write_archived(
        &self,
        dbtx: &mut DatabaseTransaction<'_>,
        hash: LockHash,
        height: u32,
    ) {
        dbtx.insert_entry(&ArchivedByHeightKey(InvertedHeight::new(height), hash), &())
            .await;
        dbtx.insert_entry(&ArchivedByHashKey(hash), &()).await;
    }

    /// Records the mined height of every locked transaction in a connected
    /// block
    pub async fn write_block_locks(&self, txids: &[Txid], height: u32) {
        let mut dbtx = self.db.begin_transaction().await;
        for txid in txids {
            if let Some(hash) = self.lock_hash_by_txid(&mut dbtx, txid).await {
                dbtx.insert_entry(&MinedByHeightKey(InvertedHeight::new(height), hash), &())
                    .await;
            }
        }
        dbtx.commit_tx().await.expect("database commit failed");
    }

    /// Drops the mined markers of a disconnected block again
    pub async fn remove_block_locks(&self, txids: &[Txid], height: u32) {
        let mut dbtx = self.db.begin_transaction().await;
        for txid in txids {
            if let Some(hash) = self.lock_hash_by_txid(&mut dbtx, txid).await {
                dbtx.remove_entry(&MinedByHeightKey(InvertedHeight::new(height), hash))
                    .await;
            }
        }
        dbtx.commit_tx().await.expect("database commit failed");
    }

    /// Removes all locks mined at heights `<= until_height`, archiving their
    /// hashes. Returns the removed locks. `best_confirmed_height` only moves
    /// forward; attempts to confirm an already confirmed height are rejected.
    pub async fn remove_confirmed_up_to(
        &self,
        until_height: u32,
    ) -> BTreeMap<LockHash, InstantSendLock> {
        let previous = self
            .best_confirmed_height
            .fetch_max(until_height, Ordering::SeqCst);
        if until_height <= previous {
            warn!(
                target: LOG_DB,
                until_height,
                best_confirmed_height = previous,
                "attempt to confirm an already confirmed height, this should never happen"
            );
            return BTreeMap::new();
        }

        let mut dbtx = self.db.begin_transaction().await;
        let mined: Vec<(MinedByHeightKey, ())> = dbtx
            .find_by_range(&InvertedHeight::new(until_height).range_start(), None)
            .await;

        let mut removed = BTreeMap::new();
        for (MinedByHeightKey(inv_height, hash), ()) in mined {
            // caches are invalidated here so that after the archive marker
            // expires the lock really is unknown again
            if let Some(islock) = self.remove_lock(&mut dbtx, hash, None, false).await {
                removed.insert(hash, islock);
            }
            // archive the hash either way, so the lock still counts as known
            self.write_archived(&mut dbtx, hash, inv_height.height())
                .await;
            dbtx.remove_entry(&MinedByHeightKey(inv_height, hash)).await;
        }
        dbtx.commit_tx().await.expect("database commit failed");

        removed
    }

    /// Drops archive markers for heights `<= until_height`
    pub async fn remove_archived_up_to(&self, until_height: u32) {
        if until_height == 0 {
            return;
        }

        let mut dbtx = self.db.begin_transaction().await;
        let archived: Vec<(ArchivedByHeightKey, ())> = dbtx
            .find_by_range(&InvertedHeight::new(until_height).range_start(), None)
            .await;
        for (key, ()) in archived {
            dbtx.remove_entry(&ArchivedByHashKey(key.1)).await;
            dbtx.remove_entry(&key).await;
        }
        dbtx.commit_tx().await.expect("database commit failed");
    }

    /// True iff the lock is live or its hash was archived
    pub async fn known_lock(&self, hash: LockHash) -> bool {
        if self.get_lock_by_hash(hash).await.is_some() {
            return true;
        }
        let mut dbtx = self.db.begin_transaction().await;
        dbtx.get_value(&ArchivedByHashKey(hash)).await.is_some()
    }

    pub async fn get_lock_by_hash(&self, hash: LockHash) -> Option<InstantSendLock> {
        if let Some(cached) = self
            .caches
            .lock()
            .expect("locking failed")
            .by_hash
            .get(&hash)
        {
            return cached.clone();
        }

        let mut dbtx = self.db.begin_transaction().await;
        let islock = dbtx.get_value(&LockByHashKey(hash)).await;
        self.caches
            .lock()
            .expect("locking failed")
            .by_hash
            .put(hash, islock.clone());
        islock
    }

    async fn lock_hash_by_txid(
        &self,
        dbtx: &mut DatabaseTransaction<'_>,
        txid: &Txid,
    ) -> Option<LockHash> {
        if let Some(cached) = self
            .caches
            .lock()
            .expect("locking failed")
            .hash_by_txid
            .get(txid)
        {
            return *cached;
        }

        let hash = dbtx.get_value(&LockByTxidKey(*txid)).await;
        self.caches
            .lock()
            .expect("locking failed")
            .hash_by_txid
            .put(*txid, hash);
        hash
    }

    pub async fn get_lock_hash_by_txid(&self, txid: &Txid) -> Option<LockHash> {
        let mut dbtx = self.db.begin_transaction().await;
        self.lock_hash_by_txid(&mut dbtx, txid).await
    }

    pub async fn get_lock_by_txid(&self, txid: &Txid) -> Option<InstantSendLock> {
        let hash = self.get_lock_hash_by_txid(txid).await?;
        self.get_lock_by_hash(hash).await
    }

    pub async fn get_lock_hash_by_input(&self, outpoint: &OutPoint) -> Option<LockHash> {
        if let Some(cached) = self
            .caches
            .lock()
            .expect("locking failed")
            .hash_by_outpoint
            .get(outpoint)
        {
            return *cached;
        }

        let mut dbtx = self.db.begin_transaction().await;
        let hash = dbtx.get_value(&LockByOutpointKey(*outpoint)).await;
        self.caches
            .lock()
            .expect("locking failed")
            .hash_by_outpoint
            .put(*outpoint, hash);
        hash
    }

    pub async fn get_lock_by_input(&self, outpoint: &OutPoint) -> Option<InstantSendLock> {
        let hash = self.get_lock_hash_by_input(outpoint).await?;
        self.get_lock_by_hash(hash).await
    }

    /// Lock hashes of all live locks spending an output of `parent`
    async fn locks_by_parent(
        &self,
        dbtx: &mut DatabaseTransaction<'_>,
        parent: &Txid,
    ) -> Vec<LockHash> {
        dbtx.find_by_prefix(&LockByOutpointParentPrefix(*parent))
            .await
            .into_iter()
            .map(|(_key, hash)| hash)
            .collect()
    }

    /// Prunes the given lock and, transitively, every live lock descending
    /// from its transaction, archiving each at `height`. Returns the pruned
    /// lock hashes, the root last.
    pub async fn remove_chained_locks(
        &self,
        root_hash: LockHash,
        root_txid: Txid,
        height: u32,
    ) -> Vec<LockHash> {
        let mut dbtx = self.db.begin_transaction().await;
        let mut result = Vec::new();
        let mut stack = vec![root_txid];
        let mut seen_txids = BTreeSet::new();

        while let Some(parent) = stack.pop() {
            for child_hash in self.locks_by_parent(&mut dbtx, &parent).await {
                let Some(child_islock) =
                    self.remove_lock(&mut dbtx, child_hash, None, false).await
                else {
                    continue;
                };
                self.write_archived(&mut dbtx, child_hash, height).await;
                result.push(child_hash);

                if seen_txids.insert(child_islock.txid) {
                    stack.push(child_islock.txid);
                }
            }
        }

        self.remove_lock(&mut dbtx, root_hash, None, false).await;
        self.write_archived(&mut dbtx, root_hash, height).await;
        result.push(root_hash);

        dbtx.commit_tx().await.expect("database commit failed");

        result
    }

    pub async fn lock_count(&self) -> usize {
        let mut dbtx = self.db.begin_transaction().await;
        dbtx.find_by_prefix(&LockByHashKeyPrefix).await.len()
    }

    pub fn best_confirmed_height(&self) -> u32 {
        self.best_confirmed_height.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash as BitcoinHash;
    use bitcoin::{OutPoint, Txid};

    use super::{InstantSendDb, InvertedHeight};
    use crate::db::mem_impl::MemDatabase;
    use crate::db::Database;
    use crate::encoding::Encodable;
    use crate::islock::{InstantSendLock, LockHash};

    fn test_db() -> InstantSendDb {
        InstantSendDb::new(Database::new(MemDatabase::new()))
    }

    fn sig() -> tbls::Signature {
        let msg = tbls::Message::from_bytes(b"isdb test");
        let (_pk, _pks, sks) = tbls::dealer_keygen(1, 1);
        tbls::combine_signature_shares(vec![(0, tbls::sign(msg, sks[0]))].into_iter(), 1)
    }

    fn lock_for(txid_byte: u8, inputs: Vec<OutPoint>) -> (LockHash, InstantSendLock) {
        let islock = InstantSendLock {
            txid: Txid::from_byte_array([txid_byte; 32]),
            inputs,
            cycle_hash: None,
            sig: sig(),
        };
        (islock.hash(), islock)
    }

    fn outpoint(parent: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([parent; 32]),
            vout,
        }
    }

    #[test]
    fn db_prefixes_are_unique() {
        use strum::IntoEnumIterator;

        let mut seen = std::collections::BTreeSet::new();
        for prefix in super::DbKeyPrefix::iter() {
            assert!(seen.insert(prefix.clone() as u8), "duplicate prefix {prefix}");
        }
    }

    #[test]
    fn inverted_height_orders_descending() {
        let newer = InvertedHeight::new(100).consensus_encode_to_vec();
        let older = InvertedHeight::new(99).consensus_encode_to_vec();
        // the newer block sorts first
        assert!(newer < older);
    }

    #[test_log::test(tokio::test)]
    async fn write_and_lookup_all_indices() {
        let db = test_db();
        let (hash, islock) = lock_for(1, vec![outpoint(10, 0), outpoint(11, 1)]);

        db.write_new_lock(hash, &islock).await;

        assert_eq!(db.get_lock_by_hash(hash).await, Some(islock.clone()));
        assert_eq!(db.get_lock_by_txid(&islock.txid).await, Some(islock.clone()));
        for input in &islock.inputs {
            assert_eq!(db.get_lock_by_input(input).await, Some(islock.clone()));
        }
        assert!(db.known_lock(hash).await);
        assert_eq!(db.lock_count().await, 1);
    }

    #[test_log::test(tokio::test)]
    async fn negative_lookups_are_cached_and_invalidated() {
        let db = test_db();
        let (hash, islock) = lock_for(2, vec![outpoint(12, 0)]);

        assert_eq!(db.get_lock_by_hash(hash).await, None);
        // the negative entry must not mask the subsequent write
        db.write_new_lock(hash, &islock).await;
        assert_eq!(db.get_lock_by_hash(hash).await, Some(islock));
    }

    #[test_log::test(tokio::test)]
    async fn confirmation_is_monotone_and_archives() {
        let db = test_db();
        let (hash, islock) = lock_for(3, vec![outpoint(13, 0)]);
        db.write_new_lock(hash, &islock).await;
        db.write_mined(hash, 50).await;

        let removed = db.remove_confirmed_up_to(60).await;
        assert_eq!(removed.keys().copied().collect::<Vec<_>>(), vec![hash]);

        // live indices gone, archive marker keeps the hash known
        assert_eq!(db.lock_count().await, 0);
        assert!(db.known_lock(hash).await);

        // confirming the same or a lower height again is refused
        assert!(db.remove_confirmed_up_to(60).await.is_empty());
        assert!(db.remove_confirmed_up_to(55).await.is_empty());
        assert_eq!(db.best_confirmed_height(), 60);

        // 100 blocks later the archive marker is dropped as well
        db.remove_archived_up_to(50).await;
        assert!(!db.known_lock(hash).await);
    }

    #[test_log::test(tokio::test)]
    async fn confirmation_only_removes_up_to_height() {
        let db = test_db();
        let (hash_low, islock_low) = lock_for(4, vec![outpoint(14, 0)]);
        let (hash_high, islock_high) = lock_for(5, vec![outpoint(15, 0)]);
        db.write_new_lock(hash_low, &islock_low).await;
        db.write_new_lock(hash_high, &islock_high).await;
        db.write_mined(hash_low, 10).await;
        db.write_mined(hash_high, 20).await;

        let removed = db.remove_confirmed_up_to(15).await;
        assert!(removed.contains_key(&hash_low));
        assert!(!removed.contains_key(&hash_high));
        assert_eq!(db.lock_count().await, 1);
    }

    #[test_log::test(tokio::test)]
    async fn chained_locks_are_pruned_transitively() {
        let db = test_db();

        // lock A locks tx 6; lock B spends tx 6; lock C spends B's tx
        let (hash_a, islock_a) = lock_for(6, vec![outpoint(16, 0)]);
        let (hash_b, islock_b) = lock_for(7, vec![outpoint(6, 0)]);
        let (hash_c, islock_c) = lock_for(8, vec![outpoint(7, 3)]);
        // unrelated lock survives
        let (hash_d, islock_d) = lock_for(9, vec![outpoint(17, 0)]);

        for (hash, islock) in [
            (hash_a, &islock_a),
            (hash_b, &islock_b),
            (hash_c, &islock_c),
            (hash_d, &islock_d),
        ] {
            db.write_new_lock(hash, islock).await;
        }

        let removed = db.remove_chained_locks(hash_a, islock_a.txid, 77).await;
        assert_eq!(removed.len(), 3);
        assert_eq!(*removed.last().unwrap(), hash_a);
        assert!(removed.contains(&hash_b));
        assert!(removed.contains(&hash_c));

        for hash in [hash_a, hash_b, hash_c] {
            assert_eq!(db.get_lock_by_hash(hash).await, None);
            // archived at the pruning height, so still known
            assert!(db.known_lock(hash).await);
        }
        assert_eq!(db.get_lock_by_hash(hash_d).await, Some(islock_d));
    }

    #[test_log::test(tokio::test)]
    async fn disconnected_block_unmarks_mined_locks() {
        let db = test_db();
        let (hash, islock) = lock_for(10, vec![outpoint(18, 0)]);
        db.write_new_lock(hash, &islock).await;

        db.write_block_locks(&[islock.txid], 30).await;
        db.remove_block_locks(&[islock.txid], 30).await;

        // nothing mined anymore, so nothing confirms
        assert!(db.remove_confirmed_up_to(40).await.is_empty());
        assert_eq!(db.lock_count().await, 1);
    }
}
