//! Git branch management for per-task isolation.
//!
//! Each task's work happens on a dedicated branch derived from its id. The
//! [`BranchManager`] owns one repository working tree and serializes all
//! mutating git operations behind a wait-based gate: checkout and commit
//! mutate shared on-disk state and are never safe to run concurrently.
//! Clones of a manager share the gate, so one gate exists per repository
//! path.
//!
//! `commit_wip` is the safety net that prevents loss of in-progress agent
//! edits when a process dies or is killed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use git2::{
    build::CheckoutBuilder, BranchType, ErrorCode, IndexAddOption, Repository, Signature,
    StatusOptions,
};
use tokio::sync::Mutex;

use crate::core::task::TaskId;
use crate::{osplog_debug, util, Error, Result};

/// Prefix for task branches.
pub const BRANCH_PREFIX: &str = "opensprint/";

/// Attempts made waiting for a git lock before giving up.
pub const GIT_READY_MAX_ATTEMPTS: u32 = 10;

/// Base delay between lock checks; grows linearly per attempt.
pub const GIT_READY_BASE_DELAY_MS: u64 = 100;

/// Branch name for a task. Pure function of the id; never stored.
pub fn task_branch(task_id: &TaskId) -> String {
    format!("{}{}", BRANCH_PREFIX, task_id)
}

#[derive(Clone)]
pub struct BranchManager {
    repo_path: PathBuf,
    git_dir: PathBuf,
    default_branch: String,
    gate: Arc<Mutex<()>>,
}

impl BranchManager {
    pub fn new(repo_path: &Path) -> Result<Self> {
        osplog_debug!("BranchManager::new path={}", repo_path.display());
        let repo = Repository::discover(repo_path)?;
        let git_dir = repo.path().to_path_buf();
        let default_branch = detect_default_branch(&repo)?;
        osplog_debug!("Default branch: {}", default_branch);
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            git_dir,
            default_branch,
            gate: Arc::new(Mutex::new(())),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    /// Wait until no git lock file is present, with incremental backoff.
    /// Fails with [`Error::GitBusy`] once the retry bound is exceeded.
    pub async fn wait_for_git_ready(&self) -> Result<()> {
        let lock_file = self.git_dir.join("index.lock");
        for attempt in 1..=GIT_READY_MAX_ATTEMPTS {
            if !lock_file.exists() {
                return Ok(());
            }
            osplog_debug!(
                "Git lock present, attempt {}/{}",
                attempt,
                GIT_READY_MAX_ATTEMPTS
            );
            tokio::time::sleep(Duration::from_millis(
                GIT_READY_BASE_DELAY_MS * attempt as u64,
            ))
            .await;
        }
        Err(Error::GitBusy {
            attempts: GIT_READY_MAX_ATTEMPTS,
        })
    }

    /// Switch to `branch`, creating it from the default branch tip if it does
    /// not exist yet.
    pub async fn checkout(&self, branch: &str) -> Result<()> {
        let _gate = self.gate.lock().await;
        let path = self.repo_path.clone();
        let default = self.default_branch.clone();
        let branch = branch.to_string();
        util::blocking(move || checkout_blocking(&path, &default, &branch)).await
    }

    /// Stage all working-tree changes and commit them as `WIP: <task-id>`,
    /// but only if the tree is dirty. Returns `true` if a commit was made.
    /// Idempotent: a second call on an unchanged tree is a no-op.
    pub async fn commit_wip(&self, task_id: &TaskId) -> Result<bool> {
        let _gate = self.gate.lock().await;
        let path = self.repo_path.clone();
        let message = format!("WIP: {}", task_id);
        util::blocking(move || commit_wip_blocking(&path, &message)).await
    }

    /// Best-effort switch back to the default branch so the working tree is
    /// never left pinned to a stale task branch. Callers may swallow errors.
    pub async fn ensure_on_main(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        let path = self.repo_path.clone();
        let default = self.default_branch.clone();
        util::blocking(move || switch_blocking(&path, &default)).await
    }

    /// Name of the currently checked-out branch.
    pub fn current_branch(&self) -> Result<String> {
        let repo = Repository::discover(&self.repo_path)?;
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        let commit = head.peel_to_commit()?;
        Ok(format!("{:.7}", commit.id()))
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = Repository::discover(&self.repo_path)?;
        let found = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => true,
            Err(e) if e.code() == ErrorCode::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(found)
    }
}

/// Pick the branch `ensure_on_main` returns to. HEAD is only trusted when it
/// is not itself a task branch: after a crash the tree may still be pinned to
/// `opensprint/<id>`, and recording that as the default would make every
/// later checkout fork from the stale task tip.
fn detect_default_branch(repo: &Repository) -> Result<String> {
    if let Ok(head) = repo.head() {
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                if !name.starts_with(BRANCH_PREFIX) {
                    return Ok(name.to_string());
                }
            }
        }
    }
    for candidate in ["main", "master"] {
        if repo.find_branch(candidate, BranchType::Local).is_ok() {
            return Ok(candidate.to_string());
        }
    }
    if let Ok(origin_head) = repo.find_reference("refs/remotes/origin/HEAD") {
        if let Some(target) = origin_head.symbolic_target() {
            if let Some(name) = target.strip_prefix("refs/remotes/origin/") {
                return Ok(name.to_string());
            }
        }
    }
    Err(Error::BranchNotFound("main".to_string()))
}

fn checkout_blocking(repo_path: &Path, default_branch: &str, branch: &str) -> Result<()> {
    osplog_debug!("BranchManager::checkout branch={}", branch);
    let repo = Repository::discover(repo_path)?;

    match repo.find_branch(branch, BranchType::Local) {
        Ok(_) => {}
        Err(e) if e.code() == ErrorCode::NotFound => {
            let target = repo
                .find_branch(default_branch, BranchType::Local)
                .map_err(|e| {
                    if e.code() == ErrorCode::NotFound {
                        Error::BranchNotFound(default_branch.to_string())
                    } else {
                        e.into()
                    }
                })?
                .get()
                .peel_to_commit()?;
            osplog_debug!("Creating branch {} from commit {}", branch, target.id());
            repo.branch(branch, &target, false)?;
        }
        Err(e) => return Err(e.into()),
    }

    switch_to(&repo, branch)
}

fn switch_blocking(repo_path: &Path, branch: &str) -> Result<()> {
    let repo = Repository::discover(repo_path)?;
    switch_to(&repo, branch)
}

fn switch_to(repo: &Repository, branch: &str) -> Result<()> {
    let refname = format!("refs/heads/{}", branch);
    let obj = repo.revparse_single(&refname).map_err(|e| {
        if e.code() == ErrorCode::NotFound {
            Error::BranchNotFound(branch.to_string())
        } else {
            e.into()
        }
    })?;
    repo.checkout_tree(&obj, Some(CheckoutBuilder::new().safe()))?;
    repo.set_head(&refname)?;
    Ok(())
}

fn commit_wip_blocking(repo_path: &Path, message: &str) -> Result<bool> {
    let repo = Repository::discover(repo_path)?;

    let mut status_opts = StatusOptions::new();
    status_opts
        .include_untracked(true)
        .recurse_untracked_dirs(true);
    if repo.statuses(Some(&mut status_opts))?.is_empty() {
        osplog_debug!("commit_wip: clean tree, nothing to commit");
        return Ok(false);
    }

    let mut index = repo.index()?;
    index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = repo
        .signature()
        .or_else(|_| Signature::now("OpenSprint", "opensprint@localhost"))?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(e) if e.code() == ErrorCode::UnbornBranch => None,
        Err(e) => return Err(e.into()),
    };

    let parents: Vec<&git2::Commit> = parent.iter().collect();
    let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    osplog_debug!("WIP commit created: {}", commit_id);
    Ok(true)
}

impl std::fmt::Debug for BranchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchManager")
            .field("repo_path", &self.repo_path)
            .field("default_branch", &self.default_branch)
            .finish()
    }
}
