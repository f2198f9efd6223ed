// Architecture modules
pub mod config;
pub mod daemon;
pub mod hub;
pub mod order;
pub mod protocol;
pub mod snapshot;
pub mod storage;
pub mod types;
pub mod validate;
pub mod vcs;

// Public exports
pub use config::Config;
pub use daemon::{ApplyOutcome, Daemon, DaemonError, SearchMatch};
pub use hub::{EventHub, Subscription, TreeChangedEvent};
pub use protocol::{ErrorCode, Request, Response, RpcClient, RpcError, RpcServer};
pub use storage::{SqliteStorage, Storage, StorageError};
pub use types::{Node, NodeKind, Operation, ROOT_ID, Tab, Tree};
pub use validate::{ValidationError, ValidationFailure, validate_ops};
pub use vcs::{CommitStatus, DisabledVcs, GitVcs, Vcs, VcsError, VcsStatus};
