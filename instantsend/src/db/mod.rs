//! Core database traits: a raw ordered key-value backend with atomic
//! transactions, and a typed record layer on top of it.
//!
//! Every record type is tagged with a unique prefix byte. Full keys are
//! `prefix byte ‖ encoded key fields`; lookup types encode a strict key
//! prefix of one or more records, enabling ordered prefix scans.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::encoding::{Decodable, DecodeError, Encodable};

pub mod mem_impl;
pub mod rocksdb;

/// Anything that can be turned into the raw byte representation of a database
/// key or key prefix
pub trait DatabaseKeyPrefix: Debug {
    fn to_bytes(&self) -> Vec<u8>;
}

/// A key + value pair in the database with a unique prefix byte
pub trait DatabaseRecord {
    const DB_PREFIX: u8;
    type Value: Encodable + Decodable + Debug;
}

/// A key that can be used to query one or more [`DatabaseRecord`]s
pub trait DatabaseLookup {
    type Record: DatabaseRecord;
}

// Every `DatabaseRecord` is automatically a `DatabaseLookup` for itself
impl<Record> DatabaseLookup for Record
where
    Record: DatabaseRecord + Debug + Decodable + Encodable,
{
    type Record = Record;
}

impl<T> DatabaseKeyPrefix for T
where
    T: DatabaseLookup + Encodable + Debug,
{
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![<T as DatabaseLookup>::Record::DB_PREFIX];
        self.consensus_encode(&mut bytes)
            .expect("writing to a Vec can't fail");
        bytes
    }
}

/// Reconstructs a full key (prefix byte included) read back from the backend
pub trait DatabaseKey: Sized {
    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError>;
}

impl<T> DatabaseKey for T
where
    T: DatabaseRecord + Decodable,
{
    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let Some((&prefix, rest)) = data.split_first() else {
            return Err(DecodeError::new_custom(anyhow::format_err!(
                "empty database key"
            )));
        };
        if prefix != Self::DB_PREFIX {
            return Err(DecodeError::new_custom(anyhow::format_err!(
                "wrong key prefix: expected {:#04x}, got {prefix:#04x}",
                Self::DB_PREFIX
            )));
        }
        T::consensus_decode_whole(rest)
    }
}

#[async_trait]
pub trait IRawDatabase: Debug + Send + Sync + 'static {
    async fn begin_transaction<'a>(&'a self) -> Box<dyn IDatabaseTransaction + 'a>;
}

/// A transaction against the raw backend. All mutations become visible
/// atomically on [`IDatabaseTransaction::commit_tx`] or not at all.
#[async_trait]
pub trait IDatabaseTransaction: Send {
    async fn raw_insert_bytes(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    async fn raw_get_bytes(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn raw_remove_entry(&mut self, key: &[u8]) -> Result<()>;

    /// All entries whose key starts with `key_prefix`, in ascending key order
    async fn raw_find_by_prefix(&mut self, key_prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// All entries with `start <= key < end`, in ascending key order
    async fn raw_find_by_range(
        &mut self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    async fn commit_tx(self: Box<Self>) -> Result<()>;
}

/// Shareable handle to a raw database
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<dyn IRawDatabase>,
}

impl Database {
    pub fn new(db: impl IRawDatabase + 'static) -> Self {
        Database {
            inner: Arc::new(db),
        }
    }

    pub async fn begin_transaction(&self) -> DatabaseTransaction<'_> {
        DatabaseTransaction {
            raw: self.inner.begin_transaction().await,
        }
    }
}

/// Typed view of a raw transaction.
///
/// Backend failures are unrecoverable for this subsystem (batches are atomic,
/// so partial state is impossible), hence the typed layer treats them as
/// fatal rather than propagating `Result`s to every call site.
pub struct DatabaseTransaction<'a> {
    raw: Box<dyn IDatabaseTransaction + 'a>,
}

impl<'a> DatabaseTransaction<'a> {
    pub async fn get_value<K>(&mut self, key: &K) -> Option<<K::Record as DatabaseRecord>::Value>
    where
        K: DatabaseLookup + DatabaseKeyPrefix,
    {
        let value_bytes = self
            .raw
            .raw_get_bytes(&key.to_bytes())
            .await
            .expect("database read failed");
        value_bytes.map(|bytes| {
            Decodable::consensus_decode_whole(&bytes).expect("stored value failed to decode")
        })
    }

    pub async fn insert_entry<K>(&mut self, key: &K, value: &<K::Record as DatabaseRecord>::Value)
    where
        K: DatabaseLookup + DatabaseKeyPrefix,
    {
        self.raw
            .raw_insert_bytes(&key.to_bytes(), &value.consensus_encode_to_vec())
            .await
            .expect("database write failed");
    }

    pub async fn remove_entry<K>(&mut self, key: &K)
    where
        K: DatabaseLookup + DatabaseKeyPrefix,
    {
        self.raw
            .raw_remove_entry(&key.to_bytes())
            .await
            .expect("database erase failed");
    }

    /// Decoded entries of the record family selected by `prefix`, in
    /// ascending key order
    pub async fn find_by_prefix<P>(
        &mut self,
        prefix: &P,
    ) -> Vec<(P::Record, <P::Record as DatabaseRecord>::Value)>
    where
        P: DatabaseLookup + DatabaseKeyPrefix,
        P::Record: DatabaseKey,
    {
        self.raw
            .raw_find_by_prefix(&prefix.to_bytes())
            .await
            .expect("database scan failed")
            .into_iter()
            .map(decode_entry::<P::Record>)
            .collect()
    }

    /// Decoded entries of `K`'s record family with `start <= key < end`,
    /// where both bounds are given as key suffixes under the family's prefix
    /// byte. Passing `None` as `end` scans to the end of the family.
    pub async fn find_by_range<K>(
        &mut self,
        start_suffix: &[u8],
        end_suffix: Option<&[u8]>,
    ) -> Vec<(K, K::Value)>
    where
        K: DatabaseRecord + DatabaseKey,
    {
        let mut start = vec![K::DB_PREFIX];
        start.extend_from_slice(start_suffix);
        let end = match end_suffix {
            Some(suffix) => {
                let mut end = vec![K::DB_PREFIX];
                end.extend_from_slice(suffix);
                end
            }
            None => vec![K::DB_PREFIX + 1],
        };
        self.raw
            .raw_find_by_range(&start, &end)
            .await
            .expect("database scan failed")
            .into_iter()
            .map(decode_entry::<K>)
            .collect()
    }

    pub async fn commit_tx(self) -> Result<()> {
        self.raw.commit_tx().await
    }
}

fn decode_entry<K>((key_bytes, value_bytes): (Vec<u8>, Vec<u8>)) -> (K, K::Value)
where
    K: DatabaseRecord + DatabaseKey,
{
    let key = K::from_bytes(&key_bytes).expect("stored key failed to decode");
    let value =
        Decodable::consensus_decode_whole(&value_bytes).expect("stored value failed to decode");
    (key, value)
}

/// Declares a type as the key of a database record family.
#[macro_export]
macro_rules! impl_db_record {
    (key = $key:ty, value = $val:ty, db_prefix = $db_prefix:expr $(,)?) => {
        impl $crate::db::DatabaseRecord for $key {
            const DB_PREFIX: u8 = $db_prefix as u8;
            type Value = $val;
        }
    };
}

/// Declares lookup types that query a record family by key prefix.
#[macro_export]
macro_rules! impl_db_lookup {
    (key = $key:ty $(, query_prefix = $query_prefix:ty)* $(,)?) => {
        $(
            impl $crate::db::DatabaseLookup for $query_prefix {
                type Record = $key;
            }
        )*
    };
}

#[cfg(test)]
mod tests {
    use super::mem_impl::MemDatabase;
    use super::{Database, DatabaseKeyPrefix};
    use crate::impl_consensus_encoding;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestKey {
        id: u32,
    }
    impl_consensus_encoding!(TestKey, id);

    #[derive(Debug)]
    struct TestKeyPrefix;

    impl crate::encoding::Encodable for TestKeyPrefix {
        fn consensus_encode<W: std::io::Write>(
            &self,
            _writer: &mut W,
        ) -> Result<usize, std::io::Error> {
            Ok(0)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestValue {
        data: u64,
    }
    impl_consensus_encoding!(TestValue, data);

    impl_db_record!(key = TestKey, value = TestValue, db_prefix = 0x42);
    impl_db_lookup!(key = TestKey, query_prefix = TestKeyPrefix);

    #[test_log::test(tokio::test)]
    async fn typed_roundtrip_and_prefix_scan() {
        let db = Database::new(MemDatabase::new());

        let mut dbtx = db.begin_transaction().await;
        for id in [3u32, 1, 2] {
            dbtx.insert_entry(&TestKey { id }, &TestValue {
                data: u64::from(id) * 10,
            })
            .await;
        }
        dbtx.commit_tx().await.expect("commit");

        let mut dbtx = db.begin_transaction().await;
        assert_eq!(
            dbtx.get_value(&TestKey { id: 2 }).await,
            Some(TestValue { data: 20 })
        );
        assert_eq!(dbtx.get_value(&TestKey { id: 9 }).await, None);

        // keys come back in ascending big-endian order
        let entries = dbtx.find_by_prefix(&TestKeyPrefix).await;
        assert_eq!(
            entries.iter().map(|(k, _)| k.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test_log::test(tokio::test)]
    async fn uncommitted_transaction_changes_nothing() {
        let db = Database::new(MemDatabase::new());

        {
            let mut dbtx = db.begin_transaction().await;
            dbtx.insert_entry(&TestKey { id: 1 }, &TestValue { data: 1 })
                .await;
            // dropped without commit
        }

        let mut dbtx = db.begin_transaction().await;
        assert_eq!(dbtx.get_value(&TestKey { id: 1 }).await, None);
    }

    #[test_log::test(tokio::test)]
    async fn range_scan_honors_bounds() {
        let db = Database::new(MemDatabase::new());

        let mut dbtx = db.begin_transaction().await;
        for id in 0u32..6 {
            dbtx.insert_entry(&TestKey { id }, &TestValue { data: 0 }).await;
        }
        dbtx.commit_tx().await.expect("commit");

        let mut dbtx = db.begin_transaction().await;
        let from_two: Vec<(TestKey, TestValue)> =
            dbtx.find_by_range(&2u32.to_be_bytes(), None).await;
        assert_eq!(
            from_two.iter().map(|(k, _)| k.id).collect::<Vec<_>>(),
            vec![2, 3, 4, 5]
        );

        assert_eq!(TestKey { id: 7 }.to_bytes()[0], 0x42);
    }
}
