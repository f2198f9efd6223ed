use crate::config::Config;
use crate::hub::{EventHub, Subscription, TreeChangedEvent};
use crate::protocol::{ErrorCode, EventSource, RpcError, RpcServer};
use crate::snapshot::write_snapshot;
use crate::storage::{SqliteStorage, Storage, StorageError};
use crate::types::{NodeKind, Operation, Tree, clamp_search_limit, now_millis};
use crate::validate::{ValidationFailure, validate_ops};
use crate::vcs::{CommitStatus, DisabledVcs, GitVcs, Vcs, VcsError, VcsStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationFailure),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("vcs error: {0}")]
    Vcs(#[from] VcsError),
}

impl From<DaemonError> for RpcError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::InvalidRequest(message) => RpcError::invalid_request(message),
            DaemonError::Validation(failure) => {
                RpcError::new(ErrorCode::ValidationFailed, failure.error.to_string())
                    .with_detail("reason", failure.error.reason())
                    .with_detail("opIndex", failure.op_index)
                    .with_detail("op", failure.op)
            }
            DaemonError::Storage(e) => {
                let message = e.to_string();
                match e {
                    // A panicked blocking task is not a storage outcome
                    StorageError::Join(_) => RpcError::internal(message),
                    StorageError::NoRowsAffected { node_id, .. } => {
                        RpcError::new(ErrorCode::StorageError, message).with_detail("nodeId", node_id)
                    }
                    _ => RpcError::new(ErrorCode::StorageError, message),
                }
            }
            DaemonError::Vcs(e) => {
                RpcError::new(ErrorCode::VcsError, e.to_string()).with_detail("reason", e.reason())
            }
        }
    }
}

/// Result of a successful `apply_ops`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub tree: Tree,
    pub vcs_status: CommitStatus,
    #[serde(skip)]
    pub changed_node_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchMatch {
    pub id: String,
    pub title: String,
    pub url: Option<String>,
    pub kind: NodeKind,
}

#[derive(Debug, Deserialize)]
struct ApplyOpsParams {
    ops: Vec<Operation>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    #[serde(default)]
    query: String,
    #[serde(default)]
    limit: Option<i64>,
}

/// The bookmark daemon: storage, change hub and VCS behind the RPC methods
///
/// Mutations (`apply_ops`, `vcs_pull`) are serialised by one write lock held
/// from the pre-batch load until the change event is broadcast, so a batch is
/// always validated against the generation it is applied to. Reads go
/// straight to storage.
pub struct Daemon<S: Storage> {
    storage: Arc<S>,
    hub: EventHub,
    vcs: Arc<dyn Vcs>,
    snapshot_path: PathBuf,
    branch: String,
    write_lock: Mutex<()>,
}

impl<S: Storage + 'static> Daemon<S> {
    pub fn new(
        storage: Arc<S>,
        vcs: Arc<dyn Vcs>,
        snapshot_path: PathBuf,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            hub: EventHub::new(),
            vcs,
            snapshot_path,
            branch: branch.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Run a storage call off the async runtime
    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&S) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || f(&storage)).await?
    }

    pub fn ping(&self) -> i64 {
        now_millis()
    }

    pub async fn get_tree(&self) -> Result<Tree, DaemonError> {
        Ok(self.blocking(|s| s.load_tree()).await?)
    }

    /// Validate, apply, snapshot, commit, then notify subscribers
    pub async fn apply_ops(&self, ops: Vec<Operation>) -> Result<ApplyOutcome, DaemonError> {
        if ops.is_empty() {
            return Err(DaemonError::InvalidRequest("ops must not be empty".to_string()));
        }
        let _guard = self.write_lock.lock().await;

        let before = self.blocking(|s| s.load_tree()).await?;
        validate_ops(&before, &ops)?;

        let count = ops.len();
        let message = commit_message(&ops);
        let mut tree = self.blocking(move |s| s.apply_ops(&ops)).await?;
        info!(ops = count, "applied batch");

        let vcs_status = self.version(&mut tree, &message).await;
        let changed_node_ids = tree.changed_since(&before);
        self.notify(&tree, &changed_node_ids);

        Ok(ApplyOutcome {
            tree,
            vcs_status,
            changed_node_ids,
        })
    }

    /// Export and commit the new state; failures leave the change pending
    async fn version(&self, tree: &mut Tree, message: &str) -> CommitStatus {
        if let Err(e) = write_snapshot(&self.snapshot_path, tree, now_millis()) {
            warn!("snapshot export failed, commit deferred: {}", e);
            return CommitStatus::pending();
        }

        let paths = vec![self.storage.path().to_path_buf(), self.snapshot_path.clone()];
        let status = match self.vcs.commit(&paths, message).await {
            Ok(status) => status,
            Err(e) => {
                warn!(reason = e.reason(), "vcs commit failed, change left pending: {}", e);
                return CommitStatus::pending();
            }
        };

        if let Some(hash) = status.hash.as_deref() {
            if hash != tree.version {
                let recorded = hash.to_string();
                match self.blocking(move |s| s.record_version(&recorded)).await {
                    Ok(()) => tree.version = hash.to_string(),
                    Err(e) => warn!("failed to record version {}: {}", hash, e),
                }
            }
        }
        debug!(committed = status.committed, pending = status.pending, "vcs commit");
        status
    }

    fn notify(&self, tree: &Tree, changed_node_ids: &[String]) {
        let event = TreeChangedEvent::new(tree.version.clone(), changed_node_ids.to_vec(), now_millis());
        let report = self.hub.broadcast(&event);
        debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast tree_changed"
        );
    }

    pub async fn search(&self, query: &str, limit: Option<i64>) -> Result<Vec<SearchMatch>, DaemonError> {
        let tree = self.get_tree().await?;
        Ok(tree
            .search(query, clamp_search_limit(limit))
            .into_iter()
            .map(|node| SearchMatch {
                id: node.id.clone(),
                title: node.title.clone(),
                url: node.url.clone(),
                kind: node.kind,
            })
            .collect())
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.register()
    }

    pub async fn vcs_status(&self) -> Result<VcsStatus, DaemonError> {
        Ok(self.vcs.status(&self.branch).await?)
    }

    pub async fn vcs_push(&self) -> Result<(), DaemonError> {
        let _guard = self.write_lock.lock().await;
        self.vcs.push().await?;
        info!("pushed to remote");
        Ok(())
    }

    /// Fast-forward to the remote, then reload the replaced database
    ///
    /// A profile with bookmarks but no commits is refused: taking the
    /// remote's files would discard them.
    pub async fn vcs_pull(&self) -> Result<Tree, DaemonError> {
        let _guard = self.write_lock.lock().await;
        let before = self.blocking(|s| s.load_tree()).await?;

        let local = self.vcs.status(&self.branch).await?;
        if local.local_hash.is_none() && before.nodes.len() > 1 {
            return Err(VcsError::UncommittedChanges.into());
        }

        self.vcs.pull(&self.branch).await?;
        self.blocking(|s| s.reopen()).await?;

        let status = self.vcs.status(&self.branch).await?;
        if let Some(hash) = status.local_hash {
            self.blocking(move |s| s.record_version(&hash)).await?;
        }
        let tree = self.blocking(|s| s.load_tree()).await?;
        info!(version = %tree.version, "pulled from remote");

        let changed = tree.changed_since(&before);
        if !changed.is_empty() {
            self.notify(&tree, &changed);
        }
        Ok(tree)
    }

    /// Expose every method on `server`
    pub fn register_handlers(self: &Arc<Self>, server: &RpcServer) {
        let daemon = Arc::clone(self);
        server.register("ping", move |_params: Option<Value>| {
            let now = daemon.ping();
            async move { Ok::<_, RpcError>(json!({ "now": now })) }
        });

        let daemon = Arc::clone(self);
        server.register("get_tree", move |_params: Option<Value>| {
            let daemon = Arc::clone(&daemon);
            async move {
                let tree = daemon.get_tree().await?;
                Ok::<_, RpcError>(json!({ "tree": tree }))
            }
        });

        let daemon = Arc::clone(self);
        server.register("apply_ops", move |params: Option<Value>| {
            let daemon = Arc::clone(&daemon);
            async move {
                let ApplyOpsParams { ops } = decode_params(params)?;
                let outcome = daemon.apply_ops(ops).await?;
                to_value(&outcome)
            }
        });

        let daemon = Arc::clone(self);
        server.register("search", move |params: Option<Value>| {
            let daemon = Arc::clone(&daemon);
            async move {
                let SearchParams { query, limit } = match params {
                    Some(_) => decode_params(params)?,
                    None => SearchParams::default(),
                };
                let matches = daemon.search(&query, limit).await?;
                Ok::<_, RpcError>(json!({ "matches": matches }))
            }
        });

        let daemon = Arc::clone(self);
        server.register("vcs_status", move |_params: Option<Value>| {
            let daemon = Arc::clone(&daemon);
            async move {
                let status = daemon.vcs_status().await?;
                to_value(&status)
            }
        });

        let daemon = Arc::clone(self);
        server.register("vcs_push", move |_params: Option<Value>| {
            let daemon = Arc::clone(&daemon);
            async move {
                daemon.vcs_push().await?;
                Ok::<_, RpcError>(json!({ "status": "ok" }))
            }
        });

        let daemon = Arc::clone(self);
        server.register("vcs_pull", move |_params: Option<Value>| {
            let daemon = Arc::clone(&daemon);
            async move {
                let tree = daemon.vcs_pull().await?;
                Ok::<_, RpcError>(json!({ "tree": tree }))
            }
        });

        let daemon = Arc::clone(self);
        server.register_stream("subscribe_events", move |_params: Option<Value>| {
            let subscription = daemon.subscribe();
            async move { Ok::<_, RpcError>(Box::new(subscription) as Box<dyn EventSource>) }
        });
    }
}

impl Daemon<SqliteStorage> {
    /// Open the profile's database and VCS collaborator as configured
    pub fn open(config: &Config) -> Result<Self, StorageError> {
        let db_path = config.db_path();
        info!("Opening database at: {:?}", db_path);
        let storage = Arc::new(SqliteStorage::open(&db_path, &config.storage)?);

        let vcs: Arc<dyn Vcs> = if config.vcs.enabled {
            info!("Versioning profile {:?} with git", config.profile_dir);
            Arc::new(GitVcs::new(
                &config.profile_dir,
                config.vcs.remote.clone(),
                config.vcs.branch.clone(),
            ))
        } else {
            Arc::new(DisabledVcs)
        };

        Ok(Self::new(
            storage,
            vcs,
            config.snapshot_path(),
            config.vcs.branch.clone(),
        ))
    }
}

fn decode_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let params = params.ok_or_else(|| RpcError::invalid_request("missing params"))?;
    serde_json::from_value(params).map_err(|e| {
        RpcError::invalid_request("invalid params").with_detail("cause", e.to_string())
    })
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value)
        .map_err(|e| RpcError::internal(format!("result serialization failed: {e}")))
}

fn commit_message(ops: &[Operation]) -> String {
    let names: Vec<&str> = ops.iter().map(Operation::name).collect();
    format!("apply_ops: {}", names.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::ValidationError;

    #[test]
    fn test_validation_error_details() {
        let failure = ValidationFailure {
            op_index: 2,
            op: "move_node",
            error: ValidationError::CycleDetected {
                node_id: "a".into(),
                new_parent_id: "b".into(),
            },
        };
        let rpc: RpcError = DaemonError::from(failure).into();
        assert_eq!(rpc.code, ErrorCode::ValidationFailed);
        assert_eq!(rpc.detail("reason"), Some(&json!("cycle_detected")));
        assert_eq!(rpc.detail("opIndex"), Some(&json!(2)));
        assert_eq!(rpc.detail("op"), Some(&json!("move_node")));
    }

    #[test]
    fn test_storage_and_vcs_error_codes() {
        let rpc: RpcError = DaemonError::from(StorageError::NoRowsAffected {
            op: "rename_node",
            node_id: "gone".into(),
        })
        .into();
        assert_eq!(rpc.code, ErrorCode::StorageError);
        assert_eq!(rpc.detail("nodeId"), Some(&json!("gone")));

        let rpc: RpcError = DaemonError::from(VcsError::NonFastForward).into();
        assert_eq!(rpc.code, ErrorCode::VcsError);
        assert_eq!(rpc.detail("reason"), Some(&json!("non_fast_forward")));
    }

    #[tokio::test]
    async fn test_panicked_storage_task_is_internal() {
        let join = tokio::task::spawn_blocking(|| panic!("boom")).await.unwrap_err();
        let rpc: RpcError = DaemonError::from(StorageError::from(join)).into();
        assert_eq!(rpc.code, ErrorCode::Internal);
        assert!(rpc.detail("nodeId").is_none());
    }

    #[test]
    fn test_decode_params() {
        let params: ApplyOpsParams = decode_params(Some(json!({
            "ops": [{"type": "add_folder", "parentId": "root", "title": "A"}]
        })))
        .unwrap();
        assert_eq!(params.ops.len(), 1);

        let err = decode_params::<ApplyOpsParams>(None).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        let err = decode_params::<ApplyOpsParams>(Some(json!({"ops": [{"type": "explode"}]})))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_commit_message_lists_ops() {
        let ops = vec![
            Operation::RenameNode {
                node_id: "a".into(),
                title: "x".into(),
            },
            Operation::DeleteNode {
                node_id: "b".into(),
                recursive: true,
            },
        ];
        assert_eq!(commit_message(&ops), "apply_ops: rename_node, delete_node");
    }
}
