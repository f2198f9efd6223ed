pub mod sqlite;
pub mod storage_trait;

pub use sqlite::SqliteStorage;
pub use storage_trait::{Storage, StorageError};
