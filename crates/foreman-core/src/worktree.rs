//! Git worktree lifecycle management for agent isolation.
//!
//! Each card gets its own worktree at `<baseDir>/.worktrees/<cardId[0:8]>` on
//! a branch named `agent/<agentKind>/<slug>-<cardId[0:8]>`. Collisions on the
//! 8-char prefix are treated as an existing worktree: `create` removes
//! whatever is there before attempting a fresh create.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::git_exec::{run_git, GitExecError};

/// Dependency directories best-effort-linked from the base checkout into a
/// fresh worktree so verification commands (npm/cargo/etc.) find them
/// without reinstalling. Extend this list as new ecosystems are supported.
const LINKED_DEPENDENCY_DIRS: &[&str] = &["node_modules", "target", ".venv"];

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("worktree path has no parent directory: {0}")]
    NoParent(PathBuf),

    #[error("worktree path is not valid UTF-8: {0}")]
    InvalidPath(PathBuf),

    #[error("path {path} escapes base directory {base}")]
    PathTraversal { path: PathBuf, base: PathBuf },

    #[error("failed to create branch and attach worktree: {0}")]
    CreateFailed(String),

    #[error(transparent)]
    GitExec(#[from] GitExecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A worktree created for one card's agent run.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub card_id: String,
    pub branch: String,
    pub path: PathBuf,
}

/// Creates, removes, and path-validates per-card worktrees under one base
/// repository checkout.
pub struct WorktreeManager {
    base_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn worktrees_dir(&self) -> PathBuf {
        self.base_dir.join(".worktrees")
    }

    /// Canonical per-card worktree path: `<baseDir>/.worktrees/<cardId[0:8]>`.
    pub fn worktree_path(&self, card_id: &str) -> PathBuf {
        self.worktrees_dir().join(short_id(card_id))
    }

    /// Canonical branch name: `agent/<agentKind>/<slug>-<cardId[0:8]>`.
    pub fn branch_name(agent_kind: &str, title: &str, card_id: &str) -> String {
        let slug = slugify(title);
        format!("agent/{agent_kind}/{slug}-{}", short_id(card_id))
    }

    /// `true` iff `resolve(base_dir, rel_path)` is a proper descendant of
    /// `resolve(base_dir)`. `rel_path` need not exist yet: any prefix of it
    /// that does exist is canonicalized and the missing suffix re-appended,
    /// so a path several directories deep in an as-yet-uncreated worktree is
    /// still validated correctly.
    pub fn is_path_safe(&self, rel_path: &Path) -> bool {
        let candidate = self.base_dir.join(rel_path);
        let canon_base = match self.base_dir.canonicalize() {
            Ok(p) => p,
            Err(_) => return false,
        };

        let mut existing = candidate.as_path();
        let mut missing_suffix: Vec<&std::ffi::OsStr> = Vec::new();
        let canon_existing = loop {
            if let Ok(p) = existing.canonicalize() {
                break p;
            }
            match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    missing_suffix.push(name);
                    existing = parent;
                }
                _ => return false,
            }
        };

        let canon_candidate = missing_suffix
            .into_iter()
            .rev()
            .fold(canon_existing, |acc, part| acc.join(part));

        canon_candidate != canon_base && canon_candidate.starts_with(&canon_base)
    }

    fn validate_new_path(&self, path: &Path) -> Result<(), WorktreeError> {
        let canon_base = self.base_dir.canonicalize()?;
        let parent = path
            .parent()
            .ok_or_else(|| WorktreeError::NoParent(path.to_path_buf()))?;
        let canon_parent = parent.canonicalize()?;
        if !canon_parent.starts_with(&canon_base) {
            return Err(WorktreeError::PathTraversal {
                path: path.to_path_buf(),
                base: canon_base,
            });
        }
        Ok(())
    }

    /// Create a worktree for `card_id` on `branch`, branching from
    /// `base_ref`. If `branch` already exists, attaches to it instead of
    /// failing.
    pub async fn create(
        &self,
        card_id: &str,
        branch: &str,
        base_ref: &str,
    ) -> Result<Worktree, WorktreeError> {
        let path = self.worktree_path(card_id);

        if path.exists() {
            debug!(path = %path.display(), "stale worktree prefix collision, removing first");
            self.force_remove(&path).await;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.validate_new_path(&path)?;

        match run_git(&["branch", branch, base_ref], &self.base_dir).await {
            Ok(_) => {}
            Err(_) => {
                // Branch may already exist; verify it does before treating
                // this as the documented "attach to existing branch" path.
                run_git(
                    &["rev-parse", "--verify", branch],
                    &self.base_dir,
                )
                .await
                .map_err(|e| {
                    WorktreeError::CreateFailed(format!(
                        "branch {branch} does not exist and could not be created: {e}"
                    ))
                })?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| WorktreeError::InvalidPath(path.clone()))?;
        run_git(&["worktree", "add", path_str, branch], &self.base_dir).await?;

        info!(card_id, branch, path = %path.display(), "worktree created");
        self.link_dependencies(&path).await;

        Ok(Worktree {
            card_id: card_id.to_string(),
            branch: branch.to_string(),
            path,
        })
    }

    /// Best-effort symlink of known dependency directories into the new
    /// worktree. Failures are logged, never propagated.
    async fn link_dependencies(&self, worktree_path: &Path) {
        for name in LINKED_DEPENDENCY_DIRS {
            let src = self.base_dir.join(name);
            if !src.exists() {
                continue;
            }
            let dst = worktree_path.join(name);
            #[cfg(unix)]
            let result = tokio::fs::symlink(&src, &dst).await;
            #[cfg(windows)]
            let result = tokio::fs::symlink_dir(&src, &dst).await;
            if let Err(e) = result {
                warn!(dep = name, error = %e, "failed to link dependency directory");
            }
        }
    }

    /// Remove a worktree directory. Idempotent: a missing directory is not
    /// an error.
    pub async fn remove(&self, path: &Path) {
        if !path.exists() {
            return;
        }
        let path_str = match path.to_str() {
            Some(s) => s,
            None => {
                warn!(path = %path.display(), "worktree path is not valid UTF-8, forcing fs removal");
                let _ = tokio::fs::remove_dir_all(path).await;
                return;
            }
        };

        if let Err(e) = run_git(&["worktree", "remove", path_str], &self.base_dir).await {
            debug!(error = %e, "git worktree remove failed, falling back to force remove");
            self.force_remove(path).await;
        }
    }

    async fn force_remove(&self, path: &Path) {
        if let Some(path_str) = path.to_str() {
            let _ = run_git(
                &["worktree", "remove", "--force", path_str],
                &self.base_dir,
            )
            .await;
        }
        let _ = tokio::fs::remove_dir_all(path).await;
    }

    /// Delete a local branch. Never fails loudly; the branch may already be
    /// gone or still be checked out elsewhere.
    pub async fn delete_branch(&self, branch: &str) {
        if let Err(e) = run_git(&["branch", "-D", branch], &self.base_dir).await {
            debug!(branch, error = %e, "branch deletion failed (may already be gone)");
        }
    }
}

fn short_id(card_id: &str) -> String {
    card_id.chars().take(8).collect()
}

/// Lowercase, collapse non-alphanumerics to `-`, trim, cap at 50 chars.
fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_dash = false;
    for c in title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_was_dash = false;
        } else if !last_was_dash && !slug.is_empty() {
            slug.push('-');
            last_was_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(50);
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_test_repo() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().expect("failed to create temp dir");
        let root = tmp.path().to_path_buf();

        run_git(&["init"], &root).await.unwrap();
        run_git(&["config", "user.email", "test@foreman.dev"], &root)
            .await
            .unwrap();
        run_git(&["config", "user.name", "Foreman Test"], &root)
            .await
            .unwrap();

        let placeholder = root.join("README.md");
        tokio::fs::write(&placeholder, "# test repo\n").await.unwrap();
        run_git(&["add", "."], &root).await.unwrap();
        run_git(&["commit", "-m", "initial commit"], &root)
            .await
            .unwrap();

        (tmp, root)
    }

    #[test]
    fn slugify_collapses_and_trims() {
        assert_eq!(slugify("Add OAuth Login!!"), "add-oauth-login");
        assert_eq!(slugify(""), "");
        assert_eq!(slugify("   ---   "), "");
    }

    #[test]
    fn branch_name_contains_card_suffix() {
        let name = WorktreeManager::branch_name("claude", "Add X", "abcdef0123456789");
        assert_eq!(name, "agent/claude/add-x-abcdef01");
    }

    #[test]
    fn branch_name_for_empty_title_still_unique() {
        let name = WorktreeManager::branch_name("claude", "", "abcdef0123456789");
        assert_eq!(name, "agent/claude/-abcdef01");
        assert!(name.ends_with("abcdef01"));
    }

    #[tokio::test]
    async fn create_and_remove_lifecycle() {
        let (_tmp, root) = setup_test_repo().await;
        let mgr = WorktreeManager::new(root);
        let card_id = "abcdef0123456789";
        let branch = WorktreeManager::branch_name("claude", "Add X", card_id);

        let wt = mgr.create(card_id, &branch, "HEAD").await.unwrap();
        assert!(wt.path.exists());

        mgr.remove(&wt.path).await;
        assert!(!wt.path.exists());
    }

    #[tokio::test]
    async fn remove_on_nonexistent_dir_is_a_noop() {
        let (_tmp, root) = setup_test_repo().await;
        let mgr = WorktreeManager::new(root.clone());
        mgr.remove(&root.join(".worktrees").join("ffffffff")).await;
    }

    #[tokio::test]
    async fn prefix_collision_is_removed_before_create() {
        let (_tmp, root) = setup_test_repo().await;
        let mgr = WorktreeManager::new(root);
        let card_id = "collision123456";

        let branch1 = WorktreeManager::branch_name("claude", "First", card_id);
        let wt1 = mgr.create(card_id, &branch1, "HEAD").await.unwrap();
        assert!(wt1.path.exists());

        // Do not remove wt1; simulate a crash leaving it behind, then create
        // again for the same card id (same 8-char prefix).
        let branch2 = WorktreeManager::branch_name("codex", "Second", card_id);
        mgr.delete_branch(&branch1).await;
        let wt2 = mgr.create(card_id, &branch2, "HEAD").await.unwrap();
        assert!(wt2.path.exists());
        assert_eq!(wt1.path, wt2.path);
    }

    #[tokio::test]
    async fn path_safety_rejects_traversal() {
        let (_tmp, root) = setup_test_repo().await;
        let mgr = WorktreeManager::new(root);
        assert!(!mgr.is_path_safe(Path::new("../escape")));
        assert!(mgr.is_path_safe(Path::new(".worktrees/abc")));
    }
}
