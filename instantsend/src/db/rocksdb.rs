//! RocksDB storage backend. Uses an `OptimisticTransactionDB` so that every
//! [`crate::db::DatabaseTransaction`] maps onto a native transaction with
//! snapshot reads and an atomic commit.

use std::fmt;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use super::{IDatabaseTransaction, IRawDatabase};

pub struct RocksDb(rocksdb::OptimisticTransactionDB);

pub struct RocksDbTransaction<'a>(rocksdb::Transaction<'a, rocksdb::OptimisticTransactionDB>);

impl RocksDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<RocksDb, rocksdb::Error> {
        let db: rocksdb::OptimisticTransactionDB =
            rocksdb::OptimisticTransactionDB::<rocksdb::SingleThreaded>::open_default(&db_path)?;
        Ok(RocksDb(db))
    }

    pub fn inner(&self) -> &rocksdb::OptimisticTransactionDB {
        &self.0
    }
}

impl fmt::Debug for RocksDb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("RocksDb")
    }
}

#[async_trait]
impl IRawDatabase for RocksDb {
    async fn begin_transaction<'a>(&'a self) -> Box<dyn IDatabaseTransaction + 'a> {
        let mut optimistic_options = rocksdb::OptimisticTransactionOptions::default();
        optimistic_options.set_snapshot(true);
        Box::new(RocksDbTransaction(self.0.transaction_opt(
            &rocksdb::WriteOptions::default(),
            &optimistic_options,
        )))
    }
}

#[async_trait]
impl<'a> IDatabaseTransaction for RocksDbTransaction<'a> {
    async fn raw_insert_bytes(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.0.put(key, value)?;
        Ok(())
    }

    async fn raw_get_bytes(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.0.snapshot().get(key)?)
    }

    async fn raw_remove_entry(&mut self, key: &[u8]) -> Result<()> {
        self.0.delete(key)?;
        Ok(())
    }

    async fn raw_find_by_prefix(&mut self, key_prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let prefix = key_prefix.to_vec();
        let mut options = rocksdb::ReadOptions::default();
        options.set_iterate_range(rocksdb::PrefixRange(prefix.clone()));
        let iter = self.0.snapshot().iterator_opt(
            rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward),
            options,
        );
        let mut entries = Vec::new();
        for item in iter {
            let (key_bytes, value_bytes) = item?;
            if !key_bytes.starts_with(&prefix) {
                break;
            }
            entries.push((key_bytes.to_vec(), value_bytes.to_vec()));
        }
        Ok(entries)
    }

    async fn raw_find_by_range(
        &mut self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut options = rocksdb::ReadOptions::default();
        options.set_iterate_range(start.to_vec()..end.to_vec());
        let iter = self.0.snapshot().iterator_opt(
            rocksdb::IteratorMode::From(start, rocksdb::Direction::Forward),
            options,
        );
        let mut entries = Vec::new();
        for item in iter {
            let (key_bytes, value_bytes) = item?;
            if key_bytes.as_ref() >= end {
                break;
            }
            entries.push((key_bytes.to_vec(), value_bytes.to_vec()));
        }
        Ok(entries)
    }

    async fn commit_tx(self: Box<Self>) -> Result<()> {
        self.0.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::RocksDb;
    use crate::db::IRawDatabase;

    fn open_temp_db(temp_path: &str) -> (RocksDb, tempfile::TempDir) {
        let path = tempfile::Builder::new()
            .prefix(temp_path)
            .tempdir()
            .unwrap();
        let db = RocksDb::open(&path).unwrap();
        (db, path)
    }

    #[test_log::test(tokio::test)]
    async fn insert_get_remove() {
        let (db, _dir) = open_temp_db("is-rocksdb-insert");
        let mut tx = db.begin_transaction().await;
        tx.raw_insert_bytes(b"key", b"value").await.unwrap();
        tx.commit_tx().await.unwrap();

        let mut tx = db.begin_transaction().await;
        assert_eq!(
            tx.raw_get_bytes(b"key").await.unwrap(),
            Some(b"value".to_vec())
        );
        tx.raw_remove_entry(b"key").await.unwrap();
        tx.commit_tx().await.unwrap();

        let mut tx = db.begin_transaction().await;
        assert_eq!(tx.raw_get_bytes(b"key").await.unwrap(), None);
    }

    #[test_log::test(tokio::test)]
    async fn range_scan_is_half_open() {
        let (db, _dir) = open_temp_db("is-rocksdb-range");
        let mut tx = db.begin_transaction().await;
        for byte in 0u8..5 {
            tx.raw_insert_bytes(&[0x10, byte], &[byte]).await.unwrap();
        }
        tx.commit_tx().await.unwrap();

        let mut tx = db.begin_transaction().await;
        let entries = tx
            .raw_find_by_range(&[0x10, 1], &[0x10, 4])
            .await
            .unwrap();
        assert_eq!(
            entries.into_iter().map(|(k, _)| k).collect::<Vec<_>>(),
            vec![vec![0x10, 1], vec![0x10, 2], vec![0x10, 3]]
        );
    }
}
