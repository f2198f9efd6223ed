use async_trait::async_trait;
use bookmarkd::config::StorageConfig;
use bookmarkd::types::{ROOT_ID, UNINITIALIZED_VERSION};
use bookmarkd::{
    CommitStatus, Daemon, DaemonError, DisabledVcs, ErrorCode, Operation, RpcError, SqliteStorage,
    Vcs, VcsError, VcsStatus,
};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Records every commit and hands out sequential hashes
#[derive(Default)]
struct RecordingVcs {
    commits: Mutex<Vec<(Vec<PathBuf>, String)>>,
    fail_commits: AtomicBool,
}

impl RecordingVcs {
    fn commit_count(&self) -> usize {
        self.commits.lock().unwrap().len()
    }
}

#[async_trait]
impl Vcs for RecordingVcs {
    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<CommitStatus, VcsError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(VcsError::Command {
                command: "commit".to_string(),
                stderr: "disk full".to_string(),
            });
        }
        let mut commits = self.commits.lock().unwrap();
        commits.push((paths.to_vec(), message.to_string()));
        Ok(CommitStatus {
            committed: true,
            pending: false,
            hash: Some(format!("hash{}", commits.len())),
        })
    }

    async fn push(&self) -> Result<(), VcsError> {
        Ok(())
    }

    async fn pull(&self, _branch: &str) -> Result<(), VcsError> {
        Err(VcsError::NonFastForward)
    }

    async fn status(&self, _branch: &str) -> Result<VcsStatus, VcsError> {
        Ok(VcsStatus {
            local_hash: Some(format!("hash{}", self.commit_count())),
            remote_hash: None,
            ahead: self.commit_count() as u64,
            behind: 0,
        })
    }
}

struct Fixture {
    temp: TempDir,
    vcs: Arc<RecordingVcs>,
    daemon: Arc<Daemon<SqliteStorage>>,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let storage =
        Arc::new(SqliteStorage::open(temp.path().join("state.db"), &StorageConfig::default()).unwrap());
    let vcs = Arc::new(RecordingVcs::default());
    let daemon = Arc::new(Daemon::new(
        storage,
        Arc::clone(&vcs) as Arc<dyn Vcs>,
        temp.path().join("snapshot.json"),
        "main",
    ));
    Fixture { temp, vcs, daemon }
}

fn add_bookmark(title: &str, url: &str) -> Operation {
    Operation::AddBookmark {
        parent_id: ROOT_ID.to_string(),
        title: title.to_string(),
        url: url.to_string(),
        index: None,
    }
}

fn rpc_error(err: DaemonError) -> RpcError {
    err.into()
}

#[tokio::test]
async fn test_apply_commits_and_versions_tree() {
    let f = fixture();

    let outcome = f
        .daemon
        .apply_ops(vec![Operation::AddFolder {
            parent_id: ROOT_ID.to_string(),
            title: "Work".to_string(),
            index: None,
        }])
        .await
        .unwrap();

    assert_eq!(
        outcome.vcs_status,
        CommitStatus {
            committed: true,
            pending: false,
            hash: Some("hash1".to_string())
        }
    );
    assert_eq!(outcome.tree.version, "hash1");
    assert_eq!(outcome.tree.nodes.len(), 2);
    assert_eq!(f.daemon.get_tree().await.unwrap().version, "hash1");

    let commits = f.vcs.commits.lock().unwrap().clone();
    assert_eq!(commits.len(), 1);
    let (paths, message) = &commits[0];
    assert_eq!(
        paths,
        &vec![f.temp.path().join("state.db"), f.temp.path().join("snapshot.json")]
    );
    assert!(message.contains("add_folder"));

    let snapshot: Value =
        serde_json::from_slice(&std::fs::read(f.temp.path().join("snapshot.json")).unwrap()).unwrap();
    assert_eq!(snapshot["schemaVersion"], 1);
    assert_eq!(snapshot["nodes"].as_object().unwrap().len(), 2);
}

#[tokio::test]
async fn test_subscribers_receive_changed_ids() {
    let f = fixture();
    let mut subscription = f.daemon.subscribe();

    let outcome = f
        .daemon
        .apply_ops(vec![add_bookmark("Rust", "https://www.rust-lang.org/")])
        .await
        .unwrap();
    let new_id = outcome
        .tree
        .nodes
        .values()
        .find(|n| n.title == "Rust")
        .map(|n| n.id.clone())
        .unwrap();
    assert_eq!(outcome.changed_node_ids, vec![new_id.clone()]);

    let event: Value = serde_json::from_slice(&subscription.recv().await.unwrap()).unwrap();
    assert_eq!(event["kind"], "event");
    assert_eq!(event["event"], "tree_changed");
    assert_eq!(event["version"], "hash1");
    assert_eq!(event["changedNodeIds"], json!([new_id]));
    assert!(event["generatedAt"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_validation_failure_has_no_side_effects() {
    let f = fixture();
    let mut subscription = f.daemon.subscribe();
    let before = f.daemon.get_tree().await.unwrap();

    let err = f
        .daemon
        .apply_ops(vec![
            add_bookmark("Fine", "https://example.com/"),
            add_bookmark("Bad", "ftp://example.com/"),
        ])
        .await
        .unwrap_err();
    let rpc = rpc_error(err);
    assert_eq!(rpc.code, ErrorCode::ValidationFailed);
    assert_eq!(rpc.detail("reason"), Some(&json!("invalid_url")));
    assert_eq!(rpc.detail("opIndex"), Some(&json!(1)));

    assert_eq!(f.daemon.get_tree().await.unwrap(), before);
    assert_eq!(f.vcs.commit_count(), 0);
    assert!(subscription.try_recv().is_none());
    assert!(!f.temp.path().join("snapshot.json").exists());
}

#[tokio::test]
async fn test_structural_rule_codes() {
    let f = fixture();

    let cases = vec![
        (
            Operation::RenameNode {
                node_id: ROOT_ID.to_string(),
                title: "x".to_string(),
            },
            "root_immutable",
        ),
        (
            Operation::AddFolder {
                parent_id: "nope".to_string(),
                title: "x".to_string(),
                index: None,
            },
            "invalid_parent",
        ),
        (
            Operation::AddFolder {
                parent_id: ROOT_ID.to_string(),
                title: "x".to_string(),
                index: Some(5),
            },
            "invalid_index",
        ),
        (
            Operation::DeleteNode {
                node_id: "ghost".to_string(),
                recursive: true,
            },
            "invalid_node",
        ),
    ];
    for (op, reason) in cases {
        let rpc = rpc_error(f.daemon.apply_ops(vec![op]).await.unwrap_err());
        assert_eq!(rpc.code, ErrorCode::ValidationFailed);
        assert_eq!(rpc.detail("reason"), Some(&json!(reason)));
        assert_eq!(rpc.detail("opIndex"), Some(&json!(0)));
    }
}

#[tokio::test]
async fn test_cycle_rejected() {
    let f = fixture();
    let outcome = f
        .daemon
        .apply_ops(vec![Operation::AddFolder {
            parent_id: ROOT_ID.to_string(),
            title: "Outer".to_string(),
            index: None,
        }])
        .await
        .unwrap();
    let outer = outcome.tree.children_of(ROOT_ID)[0].clone();
    let outcome = f
        .daemon
        .apply_ops(vec![Operation::AddFolder {
            parent_id: outer.clone(),
            title: "Inner".to_string(),
            index: None,
        }])
        .await
        .unwrap();
    let inner = outcome.tree.children_of(&outer)[0].clone();

    let err = f
        .daemon
        .apply_ops(vec![Operation::MoveNode {
            node_id: outer,
            new_parent_id: inner,
            new_index: None,
        }])
        .await
        .unwrap_err();
    assert_eq!(rpc_error(err).detail("reason"), Some(&json!("cycle_detected")));
}

#[tokio::test]
async fn test_empty_batch_is_invalid_request() {
    let f = fixture();
    let rpc = rpc_error(f.daemon.apply_ops(vec![]).await.unwrap_err());
    assert_eq!(rpc.code, ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn test_vcs_failure_leaves_change_pending() {
    let f = fixture();
    f.vcs.fail_commits.store(true, Ordering::SeqCst);
    let mut subscription = f.daemon.subscribe();

    let outcome = f
        .daemon
        .apply_ops(vec![add_bookmark("Still saved", "https://example.com/")])
        .await
        .unwrap();
    assert_eq!(outcome.vcs_status, CommitStatus::pending());
    assert_eq!(outcome.tree.version, UNINITIALIZED_VERSION);
    assert_eq!(f.daemon.get_tree().await.unwrap().nodes.len(), 2);

    let event: Value = serde_json::from_slice(&subscription.recv().await.unwrap()).unwrap();
    assert_eq!(event["version"], UNINITIALIZED_VERSION);
}

#[tokio::test]
async fn test_disabled_vcs_reports_pending() {
    let temp = TempDir::new().unwrap();
    let storage =
        Arc::new(SqliteStorage::open(temp.path().join("state.db"), &StorageConfig::default()).unwrap());
    let daemon = Daemon::new(
        storage,
        Arc::new(DisabledVcs),
        temp.path().join("snapshot.json"),
        "main",
    );

    let outcome = daemon
        .apply_ops(vec![add_bookmark("A", "https://a.example/")])
        .await
        .unwrap();
    assert!(outcome.vcs_status.pending);
    assert!(!outcome.vcs_status.committed);
    assert!(temp.path().join("snapshot.json").exists());

    let rpc = rpc_error(daemon.vcs_push().await.unwrap_err());
    assert_eq!(rpc.code, ErrorCode::VcsError);
    assert_eq!(rpc.detail("reason"), Some(&json!("disabled")));
}

#[tokio::test]
async fn test_search_matches_title_and_url() {
    let f = fixture();
    f.daemon
        .apply_ops(vec![
            add_bookmark("Rust Book", "https://doc.rust-lang.org/book/"),
            add_bookmark("Crates", "https://crates.io/"),
            add_bookmark("News", "https://news.example/rust"),
        ])
        .await
        .unwrap();

    let matches = f.daemon.search("RUST", None).await.unwrap();
    let titles: Vec<&str> = matches.iter().map(|m| m.title.as_str()).collect();
    assert_eq!(titles.len(), 2);
    assert!(titles.contains(&"Rust Book"));
    assert!(titles.contains(&"News"));

    assert_eq!(f.daemon.search("", Some(2)).await.unwrap().len(), 2);
    assert_eq!(f.daemon.search("", Some(0)).await.unwrap().len(), 1);
    assert!(f.daemon.search("nothing", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_batches_all_apply() {
    let f = fixture();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let daemon = Arc::clone(&f.daemon);
        tasks.push(tokio::spawn(async move {
            daemon
                .apply_ops(vec![Operation::AddBookmark {
                    parent_id: ROOT_ID.to_string(),
                    title: format!("B{i}"),
                    url: format!("https://b{i}.example/"),
                    index: Some(0),
                }])
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let tree = f.daemon.get_tree().await.unwrap();
    assert_eq!(tree.nodes.len(), 11);
    assert_eq!(tree.children_of(ROOT_ID).len(), 10);
    assert_eq!(tree.version, "hash10");
}

#[tokio::test]
async fn test_vcs_methods_delegate() {
    let f = fixture();
    f.daemon.vcs_push().await.unwrap();

    let status = f.daemon.vcs_status().await.unwrap();
    assert_eq!(status.ahead, 0);

    let rpc = rpc_error(f.daemon.vcs_pull().await.unwrap_err());
    assert_eq!(rpc.code, ErrorCode::VcsError);
    assert_eq!(rpc.detail("reason"), Some(&json!("non_fast_forward")));
}
