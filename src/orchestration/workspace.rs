//! Workspace manager for per-attempt git worktrees.
//!
//! Every attempt gets its own worktree on its own branch, so concurrent
//! workers never write through the same checkout. Attempt N>1 branches from
//! the previous attempt's final commit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::task::TaskId;
use crate::git::GitOps;
use crate::util::{blocking, sanitize_component, task_slug};
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

/// An isolated checkout owned by exactly one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    /// The task this checkout belongs to.
    pub task_id: TaskId,
    /// Attempt number the checkout was created for.
    pub attempt: u32,
    /// Checkout directory.
    pub path: PathBuf,
    /// Branch checked out in the worktree.
    pub branch: String,
    /// Git worktree admin name.
    pub name: String,
    /// Commit the branch was created from.
    pub base_commit: String,
}

/// Creates and destroys attempt workspaces for one wave.
#[derive(Clone)]
pub struct WorkspaceManager {
    git: Arc<GitOps>,
    root: PathBuf,
    wave_id: String,
}

impl WorkspaceManager {
    /// `root` is the workspace directory; checkouts land under `root/<wave_id>/`.
    pub fn new(repo_path: &Path, root: &Path, wave_id: &str) -> Result<Self> {
        Ok(Self {
            git: Arc::new(GitOps::new(repo_path)?),
            root: root.to_path_buf(),
            wave_id: wave_id.to_string(),
        })
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    pub fn wave_dir(&self) -> PathBuf {
        self.root.join(sanitize_component(&self.wave_id))
    }

    /// Deterministic checkout path for `(task, attempt)`.
    pub fn path_for(&self, task_id: &TaskId, attempt: u32) -> PathBuf {
        self.wave_dir()
            .join(format!("{}-a{}", task_slug(task_id.as_str()), attempt))
    }

    /// Deterministic branch name for `(task, attempt)`.
    pub fn branch_for(&self, task_id: &TaskId, attempt: u32) -> String {
        format!(
            "ralph/{}/{}-a{}",
            sanitize_component(&self.wave_id),
            task_slug(task_id.as_str()),
            attempt
        )
    }

    fn worktree_name(&self, task_id: &TaskId, attempt: u32) -> String {
        format!(
            "ralph-{}-{}-a{}",
            sanitize_component(&self.wave_id),
            task_slug(task_id.as_str()),
            attempt
        )
    }

    /// Describe the workspace an attempt would use, without touching disk.
    pub fn describe(&self, task_id: &TaskId, attempt: u32) -> Workspace {
        Workspace {
            task_id: task_id.clone(),
            attempt,
            path: self.path_for(task_id, attempt),
            branch: self.branch_for(task_id, attempt),
            name: self.worktree_name(task_id, attempt),
            base_commit: String::new(),
        }
    }

    /// Allocate a fresh checkout for `(task, attempt)`, branched from `base`
    /// or from repository HEAD.
    ///
    /// # Errors
    /// `WorkspaceCreationFailed` on path collision or any git failure.
    pub async fn create(
        &self,
        task_id: &TaskId,
        attempt: u32,
        base: Option<&str>,
    ) -> Result<Workspace> {
        let mut workspace = self.describe(task_id, attempt);
        let path_display = workspace.path.display().to_string();

        if workspace.path.exists() {
            return Err(Error::WorkspaceCreationFailed {
                path: path_display,
                reason: "path already exists".to_string(),
            });
        }

        let git = Arc::clone(&self.git);
        let name = workspace.name.clone();
        let branch = workspace.branch.clone();
        let path = workspace.path.clone();
        let base = base.map(str::to_string);
        let result = blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if git.branch_exists(&branch)? {
                // Left behind by an attempt that crashed before it was recorded.
                rlog_warn!("Branch {} already exists, recreating", branch);
                git.delete_branch(&branch)?;
            }
            git.create_worktree(&name, &branch, &path, base.as_deref())
        })
        .await;

        match result {
            Ok(base_commit) => {
                rlog_debug!(
                    "Workspace created {} attempt {} at {} on {}",
                    task_id,
                    attempt,
                    path_display,
                    workspace.branch
                );
                workspace.base_commit = base_commit;
                Ok(workspace)
            }
            Err(e) => Err(Error::WorkspaceCreationFailed {
                path: path_display,
                reason: e.to_string(),
            }),
        }
    }

    /// Remove a checkout unless `keep` is set or the attempt failed.
    ///
    /// Returns whether the checkout was removed. Retained checkouts are
    /// logged with their path. The branch always survives.
    pub async fn destroy(&self, workspace: &Workspace, keep: bool, failed: bool) -> Result<bool> {
        if failed {
            rlog_warn!(
                "Retaining workspace for failed attempt {} #{}: {}",
                workspace.task_id,
                workspace.attempt,
                workspace.path.display()
            );
            return Ok(false);
        }
        if keep {
            rlog!(
                "Keeping workspace {} #{}: {}",
                workspace.task_id,
                workspace.attempt,
                workspace.path.display()
            );
            return Ok(false);
        }

        let git = Arc::clone(&self.git);
        let name = workspace.name.clone();
        let path = workspace.path.clone();
        blocking(move || git.remove_worktree(&name, &path)).await?;
        rlog_debug!("Workspace removed {}", workspace.path.display());
        Ok(true)
    }

    /// Stage and commit everything in the checkout, even when nothing changed.
    pub async fn commit(&self, workspace: &Workspace, message: &str) -> Result<String> {
        let path = workspace.path.clone();
        let message = message.to_string();
        blocking(move || GitOps::commit_all(&path, &message)).await
    }

    /// Unified diff between two commits, cut at `max_chars`.
    pub async fn diff(&self, before: &str, after: &str, max_chars: usize) -> Result<String> {
        let git = Arc::clone(&self.git);
        let before = before.to_string();
        let after = after.to_string();
        blocking(move || git.diff_between(&before, &after, max_chars)).await
    }

    /// Remove the wave directory once no checkouts remain in it.
    pub fn remove_wave_dir_if_empty(&self) -> Result<()> {
        let dir = self.wave_dir();
        if dir.exists() && self.existing()?.is_empty() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Checkouts currently present under this wave's directory.
    pub fn existing(&self) -> Result<Vec<PathBuf>> {
        let dir = self.wave_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}
