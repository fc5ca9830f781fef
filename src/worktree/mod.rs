//! Isolated git worktrees for parallel task execution.
//!
//! Each execute-phase task runs in its own detached worktree under
//! `<base>/.quorum/worktrees/<project_id>/<workflow_id>/<task_id>/`, so
//! concurrent tasks never collide even across projects sharing one
//! repository. Destruction is idempotent, and orphan cleanup removes trees
//! whose owning workflow no longer exists in state.

use crate::errors::{QuorumError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// A created worktree. The path is the task's working directory.
#[derive(Debug, Clone)]
pub struct WorktreeHandle {
    pub project_id: String,
    pub workflow_id: String,
    pub task_id: String,
    pub path: PathBuf,
}

/// Manager rooted at one base repository.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    base_repo: PathBuf,
    root: PathBuf,
}

impl WorktreeManager {
    pub fn new(base_repo: &Path) -> Self {
        Self {
            base_repo: base_repo.to_path_buf(),
            root: base_repo.join(".quorum").join("worktrees"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the base directory is a git repository at all. Projects that
    /// are not repositories run tasks in place instead.
    pub async fn is_git_repo(&self) -> bool {
        Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(&self.base_repo)
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Create a detached worktree for one task. A failed creation leaves no
    /// partial directory behind.
    pub async fn create(
        &self,
        project_id: &str,
        workflow_id: &str,
        task_id: &str,
    ) -> Result<WorktreeHandle> {
        let path = self.root.join(project_id).join(workflow_id).join(task_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| QuorumError::Io(format!("create {}: {e}", parent.display())))?;
        }

        let output = Command::new("git")
            .args(["worktree", "add", "--detach"])
            .arg(&path)
            .arg("HEAD")
            .current_dir(&self.base_repo)
            .output()
            .await
            .map_err(|e| QuorumError::Io(format!("git worktree add: {e}")))?;

        if !output.status.success() {
            // Roll back anything git managed to create.
            let _ = tokio::fs::remove_dir_all(&path).await;
            self.prune().await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(QuorumError::Io(format!(
                "git worktree add failed for {task_id}: {}",
                stderr.trim()
            )));
        }

        debug!(%workflow_id, %task_id, path = %path.display(), "worktree created");
        Ok(WorktreeHandle {
            project_id: project_id.to_string(),
            workflow_id: workflow_id.to_string(),
            task_id: task_id.to_string(),
            path,
        })
    }

    /// Remove a worktree. Calling this twice is a no-op on the second call.
    pub async fn destroy(&self, handle: &WorktreeHandle) -> Result<()> {
        self.destroy_path(&handle.path).await
    }

    /// Remove one task's worktree by coordinates, without a handle. Used by
    /// terminal cleanup for tasks that never reported their handle back.
    pub async fn destroy_task(
        &self,
        project_id: &str,
        workflow_id: &str,
        task_id: &str,
    ) -> Result<()> {
        let path = self.root.join(project_id).join(workflow_id).join(task_id);
        self.destroy_path(&path).await
    }

    async fn destroy_path(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.base_repo)
            .output()
            .await
            .map_err(|e| QuorumError::Io(format!("git worktree remove: {e}")))?;

        if !output.status.success() {
            // Fall back to a direct delete plus prune; the tree may already
            // be unregistered or the repository gone.
            warn!(path = %path.display(), "git worktree remove failed, deleting directly");
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| QuorumError::Io(format!("remove {}: {e}", path.display())))?;
        }
        self.prune().await;
        Ok(())
    }

    /// Delete every worktree whose workflow id is not in `live`. Returns the
    /// number of trees removed.
    pub async fn cleanup_orphans(&self, live: &HashSet<String>) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        // Layout is <root>/<project_id>/<workflow_id>/<task_id>.
        for project_entry in read_dirs(&self.root)? {
            for workflow_entry in read_dirs(&project_entry)? {
                let workflow_id = match workflow_entry.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };
                if live.contains(&workflow_id) {
                    continue;
                }
                for task_entry in read_dirs(&workflow_entry)? {
                    self.destroy_path(&task_entry).await?;
                    removed += 1;
                }
                let _ = tokio::fs::remove_dir(&workflow_entry).await;
            }
            let _ = tokio::fs::remove_dir(&project_entry).await;
        }
        if removed > 0 {
            debug!(removed, "orphan worktrees cleaned up");
        }
        Ok(removed)
    }

    async fn prune(&self) {
        let _ = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.base_repo)
            .output()
            .await;
    }
}

fn read_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in walkdir::WalkDir::new(path)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    /// Build a throwaway git repository with one commit, or skip the test
    /// when git is unavailable.
    fn init_repo() -> Option<TempDir> {
        if StdCommand::new("git").arg("--version").output().is_err() {
            return None;
        }
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let status = StdCommand::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap();
            assert!(status.status.success(), "git {args:?} failed");
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "quorum@test"]);
        run(&["config", "user.name", "quorum"]);
        std::fs::write(dir.path().join("README.md"), "seed\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "seed"]);
        Some(dir)
    }

    #[tokio::test]
    async fn test_create_and_destroy_worktree() {
        let Some(repo) = init_repo() else { return };
        let manager = WorktreeManager::new(repo.path());
        assert!(manager.is_git_repo().await);

        let handle = manager.create("proj", "wf-1", "t1").await.unwrap();
        assert!(handle.path.join("README.md").exists());

        manager.destroy(&handle).await.unwrap();
        assert!(!handle.path.exists());

        // Idempotent: second destroy is a no-op.
        manager.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_tasks_get_disjoint_paths() {
        let Some(repo) = init_repo() else { return };
        let manager = WorktreeManager::new(repo.path());
        let a = manager.create("proj", "wf-1", "t1").await.unwrap();
        let b = manager.create("proj", "wf-1", "t2").await.unwrap();
        assert_ne!(a.path, b.path);
        manager.destroy(&a).await.unwrap();
        manager.destroy(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_orphans_spares_live_workflows() {
        let Some(repo) = init_repo() else { return };
        let manager = WorktreeManager::new(repo.path());
        let dead = manager.create("proj", "wf-dead", "t1").await.unwrap();
        let live = manager.create("proj", "wf-live", "t1").await.unwrap();

        let live_ids: HashSet<String> = ["wf-live".to_string()].into_iter().collect();
        let removed = manager.cleanup_orphans(&live_ids).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!dead.path.exists());
        assert!(live.path.exists());
    }

    #[tokio::test]
    async fn test_create_in_non_repo_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let manager = WorktreeManager::new(dir.path());
        assert!(!manager.is_git_repo().await);
        let err = manager.create("proj", "wf-1", "t1").await;
        assert!(err.is_err());
        assert!(!manager.root().join("proj/wf-1/t1").exists());
    }
}
