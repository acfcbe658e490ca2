use redb::{
    Database as RedbDatabase, Key, ReadTransaction, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::tables::*;

const DB_FILE: &str = "docstore.redb";

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Redb(Box<redb::Error>),
    #[error("Failed to decode row: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    #[error("Failed to encode row: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Every redb failure folds into [`DatabaseError::Redb`].
macro_rules! from_redb {
    ($($err:ty),+ $(,)?) => {
        $(impl From<$err> for DatabaseError {
            fn from(e: $err) -> Self {
                DatabaseError::Redb(Box::new(e.into()))
            }
        })+
    };
}

from_redb!(
    redb::Error,
    redb::CommitError,
    redb::DatabaseError,
    redb::StorageError,
    redb::TableError,
    redb::TransactionError,
);

/// Handle to the relational store. Clones share one redb instance.
#[derive(Clone)]
pub struct Database {
    db: Arc<RedbDatabase>,
}

/// Rows removed by [`Database::purge_all`], per table.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub documents: u64,
    pub versions: u64,
    pub access_records: u64,
}

impl Database {
    /// Open or create `docstore.redb` under `data_dir`, creating every table.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db = RedbDatabase::create(data_dir.as_ref().join(DB_FILE))?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(DOCUMENTS)?;
        write_txn.open_table(DOCUMENT_VERSIONS)?;
        write_txn.open_table(DOCUMENT_ACCESS_RECORDS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn begin_read(&self) -> Result<ReadTransaction, DatabaseError> {
        Ok(self.db.begin_read()?)
    }

    pub fn begin_write(&self) -> Result<WriteTransaction, DatabaseError> {
        Ok(self.db.begin_write()?)
    }

    /// Drop every row in one transaction. Test mode only.
    pub fn purge_all(&self) -> Result<PurgeStats, DatabaseError> {
        let write_txn = self.begin_write()?;
        let stats = PurgeStats {
            documents: clear_table(&write_txn, DOCUMENTS)?,
            versions: clear_table(&write_txn, DOCUMENT_VERSIONS)?,
            access_records: clear_table(&write_txn, DOCUMENT_ACCESS_RECORDS)?,
        };
        write_txn.commit()?;
        Ok(stats)
    }
}

fn clear_table<K: Key + 'static>(
    txn: &WriteTransaction,
    definition: TableDefinition<K, &'static [u8]>,
) -> Result<u64, DatabaseError> {
    let mut table = txn.open_table(definition)?;
    let rows = table.len()?;
    table.retain(|_, _| false)?;
    Ok(rows)
}
