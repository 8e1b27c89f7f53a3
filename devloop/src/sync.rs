//! Incremental push of the project tree to the remote container.
//!
//! A sync cycle loads the persisted [`FileIndex`], scans the tree, pushes the
//! difference and only then commits and saves the new index. A failed or
//! cancelled push leaves the stored index untouched, so the next cycle
//! retries every file that was not acknowledged.

use async_trait::async_trait;
use devloop_common::ErrorCode;
use devloop_common::file_index::{
    self, Changeset, FileIndex, IndexError, delete_index, ensure_state_dir_ignored, index_path,
    scan_tree,
};
use devloop_common::ignore_rules::{IgnoreError, IgnoreRules};
use devloop_common::remote::{ExecOutput, FileTransport, RemoteError, RemoteExec, TargetRef};
use devloop_common::util::{remote_join, shell_quote};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Ignore(#[from] IgnoreError),

    #[error("{} of {} file(s) failed to push: {}", failed.len(), succeeded + failed.len(), summarize(failed))]
    Partial {
        succeeded: usize,
        /// `(relative path, error)` per failed file.
        failed: Vec<(String, String)>,
    },

    #[error("push aborted: {0}")]
    Transport(RemoteError),

    #[error("push cancelled after {succeeded} file(s)")]
    Cancelled { succeeded: usize },
}

fn summarize(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(path, err)| format!("{path}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Index(e) => e.code(),
            Self::Ignore(_) => ErrorCode::SyncScanFailed,
            Self::Partial { .. } => ErrorCode::SyncPartialPush,
            Self::Transport(e) => e.code(),
            Self::Cancelled { .. } => ErrorCode::SyncCancelled,
        }
    }

    /// The remote target disappeared mid-push.
    pub fn is_target_gone(&self) -> bool {
        matches!(self, Self::Transport(RemoteError::TargetGone(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Incremental,
    /// Discard the stored index and push the whole tree.
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushResult {
    pub files_transferred: usize,
    pub bytes_transferred: u64,
    pub files_deleted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    NoChanges,
    Pushed(PushResult),
}

/// Pushes changesets into one container folder.
pub struct Syncer {
    root: PathBuf,
    container: String,
    remote_folder: String,
    files: Arc<dyn FileTransport>,
}

impl Syncer {
    pub fn new(
        root: impl Into<PathBuf>,
        container: impl Into<String>,
        remote_folder: impl Into<String>,
        files: Arc<dyn FileTransport>,
    ) -> Self {
        Self {
            root: root.into(),
            container: container.into(),
            remote_folder: remote_folder.into(),
            files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn remote_folder(&self) -> &str {
        &self.remote_folder
    }

    pub fn index_path(&self) -> PathBuf {
        index_path(&self.root)
    }

    /// Load, scan, diff, push, then commit and save.
    pub async fn sync_cycle(
        &self,
        target: &TargetRef,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, SyncError> {
        let index_path = self.index_path();
        let (index, full) = match mode {
            SyncMode::Full => {
                delete_index(&index_path)?;
                (FileIndex::empty(), true)
            }
            SyncMode::Incremental => match FileIndex::load(&index_path) {
                Ok(index) if !index.matches_target(&target.uid) => {
                    info!(
                        pod = %target,
                        previous = index.target().unwrap_or("unknown"),
                        "Index was recorded against another pod, pushing full tree"
                    );
                    delete_index(&index_path)?;
                    (FileIndex::empty(), true)
                }
                Ok(index) => (index, false),
                Err(IndexError::Corrupt { path, reason }) => {
                    warn!(path = %path.display(), %reason, "File index is corrupt, forcing full resync");
                    delete_index(&index_path)?;
                    (FileIndex::empty(), true)
                }
                Err(e) => return Err(e.into()),
            },
        };
        if index.is_empty() && ensure_state_dir_ignored(&self.root)? {
            debug!("Added state directory to .gitignore");
        }

        let rules = IgnoreRules::load(&self.root)?;
        let root = self.root.clone();
        let scan_rules = rules.clone();
        let listing = tokio::task::spawn_blocking(move || scan_tree(&root, &scan_rules))
            .await
            .map_err(|e| IndexError::Scan {
                path: self.root.clone(),
                message: e.to_string(),
            })??;

        let changeset = if full {
            Changeset::all_added(&listing)
        } else {
            index.diff(&listing, &rules)
        };

        if changeset.is_empty() {
            debug!(files = listing.len(), "No file changes detected");
            return Ok(SyncOutcome::NoChanges);
        }

        info!(
            added = changeset.added.len(),
            modified = changeset.modified.len(),
            deleted = changeset.deleted.len(),
            full,
            "Pushing changeset"
        );
        let result = self.push(target, &changeset, cancel).await?;

        let committed = index.commit(&changeset).with_target(&target.uid);
        committed.save(&index_path)?;
        Ok(SyncOutcome::Pushed(result))
    }

    /// Upload added and modified files, then remove deleted paths.
    ///
    /// Upload failures are collected and the remaining files still go out;
    /// a transport failure aborts immediately.
    pub async fn push(
        &self,
        target: &TargetRef,
        changeset: &Changeset,
        cancel: &CancellationToken,
    ) -> Result<PushResult, SyncError> {
        self.remote_call(cancel, 0, self.files.ensure_dir(target, &self.container, &self.remote_folder))
            .await?;

        let mut result = PushResult::default();
        let mut failed = Vec::new();

        for entry in changeset.transfers() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled {
                    succeeded: result.files_transferred,
                });
            }

            let local = self.root.join(&entry.relative_path);
            let content = match tokio::fs::read(&local).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %entry.relative_path, error = %e, "Cannot read file for upload");
                    failed.push((entry.relative_path.clone(), e.to_string()));
                    continue;
                }
            };

            let remote = remote_join(&self.remote_folder, &entry.relative_path);
            let upload = self.files.upload(target, &self.container, &remote, content);
            match tokio::select! {
                _ = cancel.cancelled() => Err(RemoteError::Cancelled),
                r = upload => r,
            } {
                Ok(()) => {
                    debug!(path = %entry.relative_path, bytes = entry.size, "Uploaded");
                    result.files_transferred += 1;
                    result.bytes_transferred += entry.size;
                }
                Err(RemoteError::Cancelled) => {
                    return Err(SyncError::Cancelled {
                        succeeded: result.files_transferred,
                    });
                }
                Err(e) if e.is_transport() => return Err(SyncError::Transport(e)),
                Err(e) => {
                    warn!(path = %entry.relative_path, error = %e, "Upload failed");
                    failed.push((entry.relative_path.clone(), e.to_string()));
                }
            }
        }

        if !changeset.deleted.is_empty() {
            let paths = self.removal_order(&changeset.deleted);
            self.remote_call(
                cancel,
                result.files_transferred,
                self.files.remove(target, &self.container, &paths),
            )
            .await?;
            result.files_deleted = changeset.deleted.len();
        }

        if !failed.is_empty() {
            return Err(SyncError::Partial {
                succeeded: result.files_transferred,
                failed,
            });
        }
        Ok(result)
    }

    /// Deleted files first, then local directories that no longer exist,
    /// deepest first.
    fn removal_order(&self, deleted: &[String]) -> Vec<String> {
        let mut dirs = BTreeSet::new();
        for path in deleted {
            let mut current = Path::new(path).parent();
            while let Some(dir) = current.filter(|d| !d.as_os_str().is_empty()) {
                if self.root.join(dir).exists() {
                    break;
                }
                dirs.insert(dir.to_string_lossy().replace('\\', "/"));
                current = dir.parent();
            }
        }
        let mut dirs: Vec<String> = dirs.into_iter().collect();
        dirs.sort_by(|a, b| {
            b.matches('/')
                .count()
                .cmp(&a.matches('/').count())
                .then_with(|| a.cmp(b))
        });

        deleted
            .iter()
            .chain(dirs.iter())
            .map(|rel| remote_join(&self.remote_folder, rel))
            .collect()
    }

    async fn remote_call<F>(
        &self,
        cancel: &CancellationToken,
        succeeded: usize,
        call: F,
    ) -> Result<(), SyncError>
    where
        F: std::future::Future<Output = Result<(), RemoteError>>,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled { succeeded }),
            r = call => r.map_err(|e| match e {
                RemoteError::Cancelled => SyncError::Cancelled { succeeded },
                e => SyncError::Transport(e),
            }),
        }
    }
}

/// Drop every trace of previous pushes so the next cycle is a full sync.
pub fn reset_index(root: &Path) -> Result<bool, IndexError> {
    file_index::delete_index(&index_path(root))
}

// ── Shell-based transport ───────────────────────────────────────────────

/// [`FileTransport`] over plain `sh` commands run through [`RemoteExec`].
pub struct ShellTransport {
    exec: Arc<dyn RemoteExec>,
}

impl ShellTransport {
    pub fn new(exec: Arc<dyn RemoteExec>) -> Self {
        Self { exec }
    }

    async fn run(
        &self,
        target: &TargetRef,
        container: &str,
        script: String,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, RemoteError> {
        let argv = vec!["sh".to_string(), "-c".to_string(), script];
        let output = self.exec.exec(target, container, &argv, stdin).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(RemoteError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl FileTransport for ShellTransport {
    async fn ensure_dir(
        &self,
        target: &TargetRef,
        container: &str,
        dir: &str,
    ) -> Result<(), RemoteError> {
        self.run(target, container, format!("mkdir -p {}", shell_quote(dir)), None)
            .await
            .map(|_| ())
    }

    async fn upload(
        &self,
        target: &TargetRef,
        container: &str,
        remote_path: &str,
        content: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let parent = Path::new(remote_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        let script = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(&parent),
            shell_quote(remote_path)
        );
        self.run(target, container, script, Some(content))
            .await
            .map(|_| ())
    }

    async fn remove(
        &self,
        target: &TargetRef,
        container: &str,
        remote_paths: &[String],
    ) -> Result<(), RemoteError> {
        if remote_paths.is_empty() {
            return Ok(());
        }
        let quoted: Vec<String> = remote_paths
            .iter()
            .map(|p| shell_quote(p).into_owned())
            .collect();
        self.run(target, container, format!("rm -rf {}", quoted.join(" ")), None)
            .await
            .map(|_| ())
    }
}
