use chrono::{DateTime, Utc};
use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::{DocType, Document, DocumentAccessRecord, DocumentLock, DocumentVersion};
use super::tables::*;

/// Everything the upload path writes once all objects are in storage.
#[derive(Debug, Clone)]
pub struct VersionCommit {
    pub document_id: i64,
    /// Owner, used only when the document row is created.
    pub owner_id: i64,
    pub project_id: Option<i64>,
    pub path: String,
    pub name: String,
    pub size: u64,
    /// Storage version id of the manifest just written.
    pub version_id: String,
    pub version_row_id: i64,
    pub last_cmd_id: u64,
    /// User whose access record is upserted.
    pub accessor_id: i64,
    /// Used only when the access record does not exist yet.
    pub access_record_id: i64,
    pub committed_at: DateTime<Utc>,
}

impl Database {
    // ========================================================================
    // Document operations
    // ========================================================================

    /// Upsert the document, append its version row and upsert the accessor's
    /// access record in one transaction.
    ///
    /// An existing document keeps its owner, path and locks; only name, size,
    /// version id and `updated_at` move.
    pub fn commit_version(&self, commit: &VersionCommit) -> Result<Document, DatabaseError> {
        debug_assert!(!commit.path.is_empty(), "document path must not be empty");

        let write_txn = self.begin_write()?;
        let document = {
            let mut documents = write_txn.open_table(DOCUMENTS)?;
            let existing: Option<Document> = documents
                .get(commit.document_id)?
                .map(|v| rmp_serde::from_slice(v.value()))
                .transpose()?;

            let document = match existing {
                Some(mut doc) => {
                    doc.name = commit.name.clone();
                    doc.size = commit.size;
                    doc.version_id = commit.version_id.clone();
                    doc.updated_at = commit.committed_at;
                    doc
                }
                None => Document {
                    id: commit.document_id,
                    user_id: commit.owner_id,
                    project_id: commit.project_id,
                    name: commit.name.clone(),
                    path: commit.path.clone(),
                    doc_type: DocType::default(),
                    size: commit.size,
                    version_id: commit.version_id.clone(),
                    created_at: commit.committed_at,
                    updated_at: commit.committed_at,
                    deleted_at: None,
                    purged_at: None,
                    locks: Vec::new(),
                },
            };
            let data = rmp_serde::to_vec_named(&document)?;
            documents.insert(commit.document_id, data.as_slice())?;

            let version = DocumentVersion {
                id: commit.version_row_id,
                document_id: commit.document_id,
                version_id: commit.version_id.clone(),
                last_cmd_id: commit.last_cmd_id,
                created_at: commit.committed_at,
            };
            let mut versions = write_txn.open_table(DOCUMENT_VERSIONS)?;
            let data = rmp_serde::to_vec_named(&version)?;
            versions.insert((commit.document_id, commit.version_row_id), data.as_slice())?;

            let mut records = write_txn.open_table(DOCUMENT_ACCESS_RECORDS)?;
            upsert_access_record(
                &mut records,
                commit.accessor_id,
                commit.document_id,
                commit.access_record_id,
                commit.committed_at,
            )?;

            document
        };
        write_txn.commit()?;
        Ok(document)
    }

    /// Get a document by id, including soft-deleted ones
    pub fn get_document(&self, id: i64) -> Result<Option<Document>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS)?;

        match table.get(id)? {
            Some(data) => {
                let doc: Document = rmp_serde::from_slice(data.value())?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// Replace the moderation lock set. Returns false if the document is gone.
    pub fn set_locks(&self, id: i64, locks: Vec<DocumentLock>) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(DOCUMENTS)?;
            let existing: Option<Document> = table
                .get(id)?
                .map(|v| rmp_serde::from_slice(v.value()))
                .transpose()?;

            match existing {
                Some(mut doc) => {
                    doc.locks = locks;
                    let data = rmp_serde::to_vec_named(&doc)?;
                    table.insert(id, data.as_slice())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(updated)
    }

    /// Mark a document deleted. Returns false if it does not exist or is
    /// already deleted.
    pub fn soft_delete_document(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(DOCUMENTS)?;
            let existing: Option<Document> = table
                .get(id)?
                .map(|v| rmp_serde::from_slice(v.value()))
                .transpose()?;

            match existing {
                Some(mut doc) if doc.deleted_at.is_none() => {
                    doc.deleted_at = Some(at);
                    let data = rmp_serde::to_vec_named(&doc)?;
                    table.insert(id, data.as_slice())?;
                    true
                }
                _ => false,
            }
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    // ========================================================================
    // Version log
    // ========================================================================

    /// All versions of a document, oldest first
    pub fn list_versions(&self, document_id: i64) -> Result<Vec<DocumentVersion>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(DOCUMENT_VERSIONS)?;

        let mut versions = Vec::new();
        for result in table.range((document_id, i64::MIN)..=(document_id, i64::MAX))? {
            let (_, value) = result?;
            let version: DocumentVersion = rmp_serde::from_slice(value.value())?;
            versions.push(version);
        }
        Ok(versions)
    }

    pub fn latest_version(
        &self,
        document_id: i64,
    ) -> Result<Option<DocumentVersion>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(DOCUMENT_VERSIONS)?;

        let mut range = table.range((document_id, i64::MIN)..=(document_id, i64::MAX))?;
        match range.next_back() {
            Some(result) => {
                let (_, value) = result?;
                Ok(Some(rmp_serde::from_slice(value.value())?))
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // Access records
    // ========================================================================

    /// Record that `user_id` accessed `document_id` at `at`.
    /// `new_id` is only used when no record exists yet.
    pub fn touch_access_record(
        &self,
        user_id: i64,
        document_id: i64,
        new_id: i64,
        at: DateTime<Utc>,
    ) -> Result<DocumentAccessRecord, DatabaseError> {
        let write_txn = self.begin_write()?;
        let record = {
            let mut table = write_txn.open_table(DOCUMENT_ACCESS_RECORDS)?;
            upsert_access_record(&mut table, user_id, document_id, new_id, at)?
        };
        write_txn.commit()?;
        Ok(record)
    }

    pub fn get_access_record(
        &self,
        user_id: i64,
        document_id: i64,
    ) -> Result<Option<DocumentAccessRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(DOCUMENT_ACCESS_RECORDS)?;

        match table.get((user_id, document_id))? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }
}

fn upsert_access_record(
    table: &mut redb::Table<'_, (i64, i64), &'static [u8]>,
    user_id: i64,
    document_id: i64,
    new_id: i64,
    at: DateTime<Utc>,
) -> Result<DocumentAccessRecord, DatabaseError> {
    let existing: Option<DocumentAccessRecord> = table
        .get((user_id, document_id))?
        .map(|v| rmp_serde::from_slice(v.value()))
        .transpose()?;

    let record = match existing {
        Some(mut record) => {
            record.last_access_time = at;
            record
        }
        None => DocumentAccessRecord {
            id: new_id,
            user_id,
            document_id,
            last_access_time: at,
        },
    };
    let data = rmp_serde::to_vec_named(&record)?;
    table.insert((user_id, document_id), data.as_slice())?;
    Ok(record)
}
