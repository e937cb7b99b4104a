use std::path::PathBuf;

use crate::doc_id::DocumentId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("query embedding failed: {0}")]
    QueryEmbedding(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("stored item {item_id} is corrupt: {reason}")]
    Corruption { item_id: u64, reason: String },

    #[error(
        "document {doc_id} partially ingested: {failed} branch failed ({reason}), {stored} branch stored"
    )]
    PartialFailure {
        doc_id: DocumentId,
        stored: &'static str,
        failed: &'static str,
        reason: String,
    },

    #[error("ingestion of document {0} was cancelled")]
    Cancelled(DocumentId),

    #[error("ingestion job for document {doc_id} died: {reason}")]
    JobFailed { doc_id: DocumentId, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Whether this error means the storage subsystem itself is broken, as
    /// opposed to the caller asking for something invalid or missing.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Error::Storage(_)
                | Error::Io(_)
                | Error::Redb(_)
                | Error::RedbDatabase(_)
                | Error::RedbStorage(_)
                | Error::RedbTransaction(_)
                | Error::RedbTable(_)
                | Error::RedbCommit(_)
        )
    }
}
