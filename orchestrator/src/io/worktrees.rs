//! Git worktrees as pooled workspaces.
//!
//! Each workspace is a linked worktree under the worktree directory, named
//! `ws-<slot>-<timestamp>-<short id>` and checked out on branch
//! `orchestrator/<name>`. The branch prefix is how leftovers from earlier runs
//! are found again.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::io::git::Git;
use crate::pool::workspace::{CleanupReport, CreatedWorkspace, WorkspaceBackend};

pub const BRANCH_PREFIX: &str = "orchestrator/";
const NAME_PREFIX: &str = "ws-";

/// A pooled worktree found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PooledWorktree {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone)]
pub struct GitWorktrees {
    repo: Git,
    root: PathBuf,
    base: String,
    artifacts: Vec<String>,
}

impl GitWorktrees {
    /// Open the repository at `repo`, pinning the pool's base to the current `HEAD`.
    pub fn open(repo: &Path, root: PathBuf, artifacts: Vec<String>) -> Result<Self> {
        let probe = Git::new(repo);
        let toplevel = probe
            .toplevel()
            .with_context(|| format!("{} is not a git repository", repo.display()))?;
        let repo = Git::new(toplevel);
        let base = repo.rev_parse("HEAD").context("resolve base commit")?;
        debug!(base = %base, root = %root.display(), "opened worktree backend");
        Ok(Self {
            repo,
            root,
            base,
            artifacts,
        })
    }

    /// Pooled worktrees registered with the repository, sorted by id.
    pub fn pooled(&self) -> Result<Vec<PooledWorktree>> {
        let mut pooled: Vec<PooledWorktree> = self
            .repo
            .worktree_list()?
            .into_iter()
            .filter_map(|entry| {
                let branch = entry.branch?;
                let id = branch.strip_prefix(BRANCH_PREFIX)?.to_string();
                Some(PooledWorktree {
                    id,
                    path: entry.path,
                    branch,
                })
            })
            .collect();
        pooled.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pooled)
    }

    /// Remove every pooled worktree, orphaned pool branch, and stray
    /// workspace directory under the worktree root.
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub fn sweep(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for worktree in self.pooled()? {
            match self.destroy(&worktree.path, &worktree.branch) {
                Ok(()) => report.removed += 1,
                Err(err) => {
                    warn!(id = %worktree.id, err = %format!("{err:#}"), "failed to remove worktree");
                    report.failed += 1;
                }
            }
        }
        self.repo.worktree_prune()?;

        for branch in self.repo.branches_with_prefix(BRANCH_PREFIX)? {
            if let Err(err) = self.repo.delete_branch(&branch) {
                warn!(branch = %branch, err = %format!("{err:#}"), "failed to delete pool branch");
                report.failed += 1;
            }
        }

        if self.root.is_dir() {
            let entries = fs::read_dir(&self.root)
                .with_context(|| format!("read {}", self.root.display()))?;
            for entry in entries.filter_map(|entry| entry.ok()) {
                let name = entry.file_name();
                if !name.to_string_lossy().starts_with(NAME_PREFIX) {
                    continue;
                }
                match fs::remove_dir_all(entry.path()) {
                    Ok(()) => report.removed += 1,
                    Err(err) => {
                        warn!(path = %entry.path().display(), err = %err, "failed to remove stray workspace");
                        report.failed += 1;
                    }
                }
            }
        }
        info!(removed = report.removed, failed = report.failed, "swept pooled worktrees");
        Ok(report)
    }
}

impl WorkspaceBackend for GitWorktrees {
    #[instrument(skip_all, fields(slot))]
    fn create(&self, slot: usize) -> Result<CreatedWorkspace> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create worktree dir {}", self.root.display()))?;
        let id = build_workspace_name(slot, &generate_timestamp(), &generate_short_id());
        let path = self.root.join(&id);
        let branch = format!("{BRANCH_PREFIX}{id}");
        self.repo
            .worktree_add(&path, &branch, &self.base)
            .with_context(|| format!("create workspace {id}"))?;
        Ok(CreatedWorkspace { id, path, branch })
    }

    fn reset(&self, path: &Path, target: Option<&str>) -> Result<()> {
        if !path.is_dir() {
            return Err(anyhow!("workspace {} is missing", path.display()));
        }
        for artifact in &self.artifacts {
            let file = path.join(artifact);
            if file.is_file() {
                fs::remove_file(&file).with_context(|| format!("remove {}", file.display()))?;
            }
        }
        let git = Git::new(path);
        git.reset_hard(target.unwrap_or(&self.base))?;
        git.clean_all()?;
        Ok(())
    }

    fn destroy(&self, path: &Path, branch: &str) -> Result<()> {
        if let Err(err) = self.repo.worktree_remove(path) {
            debug!(err = %format!("{err:#}"), "worktree remove failed, removing directory");
            if path.exists() {
                fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))?;
            }
            self.repo.worktree_prune()?;
        }
        if !self.repo.branches_with_prefix(branch)?.is_empty() {
            self.repo.delete_branch(branch)?;
        }
        Ok(())
    }
}

pub fn build_workspace_name(slot: usize, timestamp: &str, short_id: &str) -> String {
    format!("{NAME_PREFIX}{slot:02}-{timestamp}-{short_id}")
}

pub(crate) fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

pub(crate) fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::init_git_repo;

    #[test]
    fn workspace_names_are_distinct() {
        assert_eq!(
            build_workspace_name(3, "20260101120000", "abc123"),
            "ws-03-20260101120000-abc123"
        );
        let a = generate_short_id();
        let b = generate_short_id();
        assert_eq!(a.len(), 6);
        assert_ne!(a, b);
    }

    #[test]
    fn create_reset_destroy_round() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = init_git_repo(&temp.path().join("repo"));
        let backend =
            GitWorktrees::open(&repo, temp.path().join("wt"), vec!["task_envelope.json".into()])
                .expect("open");

        let ws = backend.create(0).expect("create");
        assert!(ws.path.join("README.md").is_file());
        assert_eq!(backend.pooled().expect("pooled").len(), 1);

        fs::write(ws.path.join("README.md"), "changed").expect("modify");
        fs::write(ws.path.join("task_envelope.json"), "{}").expect("artifact");
        fs::write(ws.path.join("scratch.txt"), "junk").expect("untracked");
        backend.reset(&ws.path, None).expect("reset");
        assert!(Git::new(&ws.path).status_porcelain().expect("status").is_empty());
        assert!(!ws.path.join("task_envelope.json").exists());

        backend.destroy(&ws.path, &ws.branch).expect("destroy");
        assert!(!ws.path.exists());
        assert!(backend.pooled().expect("pooled").is_empty());
    }

    #[test]
    fn sweep_removes_leftovers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = init_git_repo(&temp.path().join("repo"));
        let backend = GitWorktrees::open(&repo, temp.path().join("wt"), Vec::new()).expect("open");
        backend.create(0).expect("create");
        backend.create(1).expect("create");
        fs::create_dir_all(temp.path().join("wt").join("ws-99-stray")).expect("stray");

        let report = backend.sweep().expect("sweep");
        assert_eq!(report.removed, 3);
        assert_eq!(report.failed, 0);
        assert!(backend.pooled().expect("pooled").is_empty());
        assert!(
            Git::new(&repo)
                .branches_with_prefix(BRANCH_PREFIX)
                .expect("branches")
                .is_empty()
        );
    }
}
