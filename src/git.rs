use std::path::{Path, PathBuf};

use git2::{DiffFormat, ErrorCode, IndexAddOption, Oid, Repository, Signature};

use crate::{rlog_debug, rlog_warn, Result};

/// Marker appended when a diff is cut short.
pub const DIFF_TRUNCATED_MARKER: &str = "\n[... diff truncated ...]\n";

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        rlog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    /// Create a branch at `base` (or HEAD) and check it out in a new worktree.
    pub fn create_worktree(
        &self,
        name: &str,
        branch: &str,
        worktree_path: &Path,
        base: Option<&str>,
    ) -> Result<String> {
        rlog_debug!(
            "GitOps::create_worktree name={} branch={} path={} base={:?}",
            name,
            branch,
            worktree_path.display(),
            base
        );
        let repo = self.repo()?;
        let commit = match base {
            Some(sha) => repo.find_commit(Oid::from_str(sha)?)?,
            None => repo.head()?.peel_to_commit()?,
        };
        rlog_debug!("Creating branch {} from commit {}", branch, commit.id());
        let branch_obj = repo.branch(branch, &commit, false)?;
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(name, worktree_path, Some(&opts))?;
        rlog_debug!("Worktree created successfully");
        Ok(commit.id().to_string())
    }

    /// Remove a worktree checkout and its admin entry. The branch is kept.
    pub fn remove_worktree(&self, name: &str, worktree_path: &Path) -> Result<()> {
        rlog_debug!(
            "GitOps::remove_worktree name={} path={}",
            name,
            worktree_path.display()
        );
        let repo = self.repo()?;

        if let Ok(worktree) = repo.find_worktree(name) {
            let _ = worktree.unlock();
            let prune_result = worktree.prune(Some(
                git2::WorktreePruneOptions::new()
                    .valid(true)
                    .working_tree(true)
                    .locked(true),
            ));
            if let Err(e) = prune_result {
                rlog_warn!("Worktree prune failed for '{}': {}", name, e);
            }
        }

        if worktree_path.exists() {
            rlog_debug!("Removing worktree directory: {}", worktree_path.display());
            std::fs::remove_dir_all(worktree_path)?;
        }

        // If the admin dir survives, git still considers the branch checked out.
        let admin_dir = repo.path().join("worktrees").join(name);
        if admin_dir.exists() {
            rlog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
            let _ = std::fs::remove_dir_all(&admin_dir);
        }

        Ok(())
    }

    /// Stage every change (including deletions) and commit, even when the
    /// tree is unchanged. Returns the new commit id.
    pub fn commit_all(worktree_path: &Path, message: &str) -> Result<String> {
        rlog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Ralph", "ralph@localhost"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        rlog_debug!("Commit created: {}", commit_id);
        Ok(commit_id.to_string())
    }

    /// Full id of the commit checked out at `path`.
    pub fn head_commit_at(path: &Path) -> Result<String> {
        let repo = Repository::open(path)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Unified patch between two commits, cut at `max_chars`.
    pub fn diff_between(&self, before: &str, after: &str, max_chars: usize) -> Result<String> {
        let repo = self.repo()?;
        let old_tree = repo.find_commit(Oid::from_str(before)?)?.tree()?;
        let new_tree = repo.find_commit(Oid::from_str(after)?)?.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;

        let mut patch = String::new();
        let mut truncated = false;
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if patch.len() >= max_chars {
                truncated = true;
                return false;
            }
            let origin = line.origin();
            if matches!(origin, '+' | '-' | ' ') {
                patch.push(origin);
            }
            patch.push_str(&String::from_utf8_lossy(line.content()));
            true
        })
        .or_else(|e| {
            // print() reports the callback abort as a user error
            if truncated && e.code() == ErrorCode::User {
                Ok(())
            } else {
                Err(e)
            }
        })?;

        if truncated || patch.len() > max_chars {
            let mut cut = max_chars.min(patch.len());
            while !patch.is_char_boundary(cut) {
                cut -= 1;
            }
            patch.truncate(cut);
            patch.push_str(DIFF_TRUNCATED_MARKER);
        }
        Ok(patch)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = repo.find_branch(branch, git2::BranchType::Local);
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        let found = repo.find_branch(branch, git2::BranchType::Local);
        match found {
            Ok(mut b) => b.delete()?,
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        Ok(repo
            .worktrees()?
            .iter()
            .flatten()
            .map(String::from)
            .collect())
    }
}
