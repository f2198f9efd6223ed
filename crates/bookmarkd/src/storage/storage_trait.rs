use crate::types::{Operation, Tree};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A targeted mutation matched nothing (e.g. the node was deleted since
    /// validation)
    #[error("{op} affected no rows for node {node_id}")]
    NoRowsAffected { op: &'static str, node_id: String },
    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// Durable tree store
///
/// Storage owns sibling-order math: ords are always computed against the
/// persisted sibling set inside the apply transaction. It does not validate
/// batches; callers run `validate::validate_ops` first.
pub trait Storage: Send + Sync {
    /// Create the schema and the root node. Idempotent.
    fn init(&self) -> Result<(), StorageError>;

    /// Full scan into a canonical snapshot
    fn load_tree(&self) -> Result<Tree, StorageError>;

    /// Apply a batch in one transaction and return the reloaded tree
    ///
    /// Any failing operation rolls back the whole batch.
    fn apply_ops(&self, ops: &[Operation]) -> Result<Tree, StorageError>;

    /// Persist the version tag reported by later `load_tree` calls
    ///
    /// Must leave the file at `path()` untouched: the tag is the hash of a
    /// commit that contains that file.
    fn record_version(&self, version: &str) -> Result<(), StorageError>;

    /// Drop open connections and reopen the backing file
    ///
    /// Needed after the file was replaced underneath the store, e.g. by a
    /// VCS pull.
    fn reopen(&self) -> Result<(), StorageError>;

    /// Backing file, for the VCS collaborator
    fn path(&self) -> &Path;
}
