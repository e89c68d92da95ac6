//! In-memory database implementation, used by tests. Transactions buffer
//! their mutations in an operation journal and apply it atomically on commit.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::{IDatabaseTransaction, IRawDatabase};

#[derive(Debug)]
enum DatabaseOperation {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct MemDatabase {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

#[derive(Debug)]
pub struct MemTransaction<'a> {
    operations: Vec<DatabaseOperation>,
    tx_data: BTreeMap<Vec<u8>, Vec<u8>>,
    db: &'a MemDatabase,
}

impl MemDatabase {
    pub fn new() -> MemDatabase {
        Default::default()
    }
}

#[async_trait]
impl IRawDatabase for MemDatabase {
    async fn begin_transaction<'a>(&'a self) -> Box<dyn IDatabaseTransaction + 'a> {
        let db_copy = self.data.lock().expect("locking failed").clone();
        Box::new(MemTransaction {
            operations: Vec::new(),
            tx_data: db_copy,
            db: self,
        })
    }
}

// The snapshot copy taken at `begin_transaction` means a transaction reads
// its own writes but never sees writes of transactions committed after it
// started.
#[async_trait]
impl<'a> IDatabaseTransaction for MemTransaction<'a> {
    async fn raw_insert_bytes(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx_data.insert(key.to_vec(), value.to_vec());
        self.operations.push(DatabaseOperation::Insert {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    async fn raw_get_bytes(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tx_data.get(key).cloned())
    }

    async fn raw_remove_entry(&mut self, key: &[u8]) -> Result<()> {
        self.tx_data.remove(key);
        self.operations
            .push(DatabaseOperation::Delete { key: key.to_vec() });
        Ok(())
    }

    async fn raw_find_by_prefix(&mut self, key_prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .tx_data
            .range::<Vec<u8>, _>(key_prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(key_prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn raw_find_by_range(
        &mut self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .tx_data
            .range::<Vec<u8>, _>(start.to_vec()..end.to_vec())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn commit_tx(self: Box<Self>) -> Result<()> {
        let mut data = self.db.data.lock().expect("locking failed");
        for op in self.operations {
            match op {
                DatabaseOperation::Insert { key, value } => {
                    data.insert(key, value);
                }
                DatabaseOperation::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemDatabase;
    use crate::db::IRawDatabase;

    #[test_log::test(tokio::test)]
    async fn reads_own_writes() {
        let db = MemDatabase::new();
        let mut tx = db.begin_transaction().await;
        tx.raw_insert_bytes(b"name", b"john").await.unwrap();
        assert_eq!(
            tx.raw_get_bytes(b"name").await.unwrap(),
            Some(b"john".to_vec())
        );
        tx.raw_remove_entry(b"name").await.unwrap();
        assert_eq!(tx.raw_get_bytes(b"name").await.unwrap(), None);
    }

    #[test_log::test(tokio::test)]
    async fn prefix_scan_is_bounded() {
        let db = MemDatabase::new();
        let mut tx = db.begin_transaction().await;
        tx.raw_insert_bytes(b"a1", b"1").await.unwrap();
        tx.raw_insert_bytes(b"a2", b"2").await.unwrap();
        tx.raw_insert_bytes(b"b1", b"3").await.unwrap();
        tx.commit_tx().await.unwrap();

        let mut tx = db.begin_transaction().await;
        let entries = tx.raw_find_by_prefix(b"a").await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}
