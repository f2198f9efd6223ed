use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Output;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const REMOTE_NAME: &str = "origin";

/// Outcome of a commit attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitStatus {
    pub committed: bool,
    /// The change is durable locally but not yet versioned
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl CommitStatus {
    pub fn pending() -> Self {
        Self {
            committed: false,
            pending: true,
            hash: None,
        }
    }
}

/// Local vs remote position of the tracked branch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcsStatus {
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub ahead: u64,
    pub behind: u64,
}

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("no remote configured")]
    RemoteNotConfigured,
    #[error("remote has diverged; fast-forward not possible")]
    NonFastForward,
    #[error("{ahead} local commits not pushed")]
    LocalCommitsPresent { ahead: u64 },
    #[error("working tree has changes that are not committed")]
    UncommittedChanges,
    #[error("version control is disabled")]
    Disabled,
    #[error("`git {command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VcsError {
    /// Machine-readable reason carried in error details
    pub fn reason(&self) -> &'static str {
        match self {
            VcsError::RemoteNotConfigured => "remote_not_configured",
            VcsError::NonFastForward => "non_fast_forward",
            VcsError::LocalCommitsPresent { .. } => "local_commits_present",
            VcsError::UncommittedChanges => "uncommitted_changes",
            VcsError::Disabled => "disabled",
            VcsError::Command { .. } | VcsError::Io(_) => "command_failed",
        }
    }
}

/// Version-control collaborator for the profile directory
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Stage `paths` and record a commit if anything changed
    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<CommitStatus, VcsError>;

    async fn push(&self) -> Result<(), VcsError>;

    /// Fast-forward the working tree to the remote `branch`
    ///
    /// With no local commits yet, the remote branch is checked out over
    /// whatever files are in the way.
    async fn pull(&self, branch: &str) -> Result<(), VcsError>;

    /// Position against the remote as of the last fetch
    async fn status(&self, branch: &str) -> Result<VcsStatus, VcsError>;
}

/// Used when versioning is switched off: every commit stays pending
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledVcs;

#[async_trait]
impl Vcs for DisabledVcs {
    async fn commit(&self, _paths: &[PathBuf], _message: &str) -> Result<CommitStatus, VcsError> {
        Ok(CommitStatus::pending())
    }

    async fn push(&self) -> Result<(), VcsError> {
        Err(VcsError::Disabled)
    }

    async fn pull(&self, _branch: &str) -> Result<(), VcsError> {
        Err(VcsError::Disabled)
    }

    async fn status(&self, _branch: &str) -> Result<VcsStatus, VcsError> {
        Err(VcsError::Disabled)
    }
}

/// Git repository driven through the `git` command line
///
/// The repository is created lazily in `repo_dir` on first use.
pub struct GitVcs {
    repo_dir: PathBuf,
    remote: Option<String>,
    branch: String,
    ready: OnceCell<()>,
}

impl GitVcs {
    pub fn new<P: AsRef<Path>>(repo_dir: P, remote: Option<String>, branch: impl Into<String>) -> Self {
        Self {
            repo_dir: repo_dir.as_ref().to_path_buf(),
            remote,
            branch: branch.into(),
            ready: OnceCell::new(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    async fn output(&self, args: &[&str]) -> Result<Output, VcsError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await?;
        Ok(output)
    }

    /// Run git and return trimmed stdout, failing on a non-zero exit
    async fn run(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(command_failed(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git and report only whether it exited successfully
    async fn succeeds(&self, args: &[&str]) -> Result<bool, VcsError> {
        Ok(self.output(args).await?.status.success())
    }

    async fn ensure_repo(&self) -> Result<(), VcsError> {
        self.ready.get_or_try_init(|| self.init_repo()).await?;
        Ok(())
    }

    async fn init_repo(&self) -> Result<(), VcsError> {
        tokio::fs::create_dir_all(&self.repo_dir).await?;

        if !self.repo_dir.join(".git").exists() {
            info!("initialising git repository in {:?}", self.repo_dir);
            self.run(&["init", "-q"]).await?;
            let head = format!("refs/heads/{}", self.branch);
            self.run(&["symbolic-ref", "HEAD", &head]).await?;
        }

        if !self.succeeds(&["config", "user.email"]).await? {
            self.run(&["config", "user.name", "bookmarkd"]).await?;
            self.run(&["config", "user.email", "bookmarkd@localhost"]).await?;
        }

        if let Some(remote) = &self.remote {
            if self.succeeds(&["remote", "get-url", REMOTE_NAME]).await? {
                self.run(&["remote", "set-url", REMOTE_NAME, remote]).await?;
            } else {
                self.run(&["remote", "add", REMOTE_NAME, remote]).await?;
            }
        }
        Ok(())
    }

    fn remote(&self) -> Result<&str, VcsError> {
        self.remote.as_deref().ok_or(VcsError::RemoteNotConfigured)
    }

    async fn rev_parse(&self, rev: &str) -> Result<Option<String>, VcsError> {
        let output = self.output(&["rev-parse", "--verify", "-q", rev]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    async fn count(&self, rev: &str) -> Result<u64, VcsError> {
        let out = self.run(&["rev-list", "--count", rev]).await?;
        parse_count(&out)
    }

    async fn ahead_behind(
        &self,
        local: Option<&str>,
        remote: Option<&str>,
    ) -> Result<(u64, u64), VcsError> {
        match (local, remote) {
            (Some(local), Some(remote)) => {
                let range = format!("{local}...{remote}");
                let out = self
                    .run(&["rev-list", "--left-right", "--count", &range])
                    .await?;
                let mut parts = out.split_whitespace();
                let ahead = parse_count(parts.next().unwrap_or("0"))?;
                let behind = parse_count(parts.next().unwrap_or("0"))?;
                Ok((ahead, behind))
            }
            (Some(local), None) => Ok((self.count(local).await?, 0)),
            (None, Some(remote)) => Ok((0, self.count(remote).await?)),
            (None, None) => Ok((0, 0)),
        }
    }

    fn tracking_ref(branch: &str) -> String {
        format!("{REMOTE_NAME}/{branch}")
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<CommitStatus, VcsError> {
        self.ensure_repo().await?;

        let paths: Vec<String> = paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let mut add = vec!["add", "--"];
        add.extend(paths.iter().map(String::as_str));
        self.run(&add).await?;

        // Exit code 0 means nothing is staged
        let diff = self.output(&["diff", "--cached", "--quiet"]).await?;
        match diff.status.code() {
            Some(0) => {
                debug!("nothing to commit");
                return Ok(CommitStatus {
                    committed: false,
                    pending: false,
                    hash: self.rev_parse("HEAD").await?,
                });
            }
            Some(1) => {}
            _ => return Err(command_failed(&["diff", "--cached", "--quiet"], &diff)),
        }

        self.run(&["-c", "commit.gpgsign=false", "commit", "-q", "-m", message])
            .await?;
        let hash = self.rev_parse("HEAD").await?;
        debug!(hash = ?hash, "committed");
        Ok(CommitStatus {
            committed: true,
            pending: false,
            hash,
        })
    }

    async fn push(&self) -> Result<(), VcsError> {
        self.remote()?;
        self.ensure_repo().await?;

        let refspec = format!("HEAD:refs/heads/{}", self.branch);
        let args = ["push", "-q", REMOTE_NAME, refspec.as_str()];
        let output = self.output(&args).await?;
        if output.status.success() {
            info!("pushed to {}/{}", REMOTE_NAME, self.branch);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("non-fast-forward") || stderr.contains("fetch first") {
            return Err(VcsError::NonFastForward);
        }
        Err(command_failed(&args, &output))
    }

    async fn pull(&self, branch: &str) -> Result<(), VcsError> {
        self.remote()?;
        self.ensure_repo().await?;

        self.run(&["fetch", "-q", REMOTE_NAME, branch]).await?;
        let tracking = Self::tracking_ref(branch);
        let local = self.rev_parse("HEAD").await?;
        let remote = self.rev_parse(&tracking).await?;
        let (ahead, _) = self.ahead_behind(local.as_deref(), remote.as_deref()).await?;
        if ahead > 0 {
            return Err(VcsError::LocalCommitsPresent { ahead });
        }

        if local.is_none() {
            // Unborn HEAD: the profile's files were never committed
            self.run(&["checkout", "-q", "-f", "-B", branch, tracking.as_str()])
                .await?;
            info!("checked out {}", tracking);
            return Ok(());
        }

        let args = ["merge", "-q", "--ff-only", tracking.as_str()];
        let output = self.output(&args).await?;
        if output.status.success() {
            info!("fast-forwarded to {}", tracking);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Not possible to fast-forward") {
            return Err(VcsError::NonFastForward);
        }
        if stderr.contains("would be overwritten") {
            return Err(VcsError::UncommittedChanges);
        }
        Err(command_failed(&args, &output))
    }

    async fn status(&self, branch: &str) -> Result<VcsStatus, VcsError> {
        self.ensure_repo().await?;

        let local_hash = self.rev_parse("HEAD").await?;
        let remote_hash = match self.remote {
            Some(_) => self.rev_parse(&Self::tracking_ref(branch)).await?,
            None => None,
        };
        let (ahead, behind) = self
            .ahead_behind(local_hash.as_deref(), remote_hash.as_deref())
            .await?;
        Ok(VcsStatus {
            local_hash,
            remote_hash,
            ahead,
            behind,
        })
    }
}

fn command_failed(args: &[&str], output: &Output) -> VcsError {
    VcsError::Command {
        command: args.join(" "),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn parse_count(s: &str) -> Result<u64, VcsError> {
    s.trim().parse().map_err(|_| VcsError::Command {
        command: "rev-list --count".to_string(),
        stderr: format!("unexpected count output: {s:?}"),
    })
}
