//! Orphan recovery.
//!
//! A task is orphaned when the store says an agent is working on it but no
//! live process backs that claim (crash, kill, or a previous run of the
//! host). Recovery preserves whatever the dead agent left in the working
//! tree as a WIP commit on the task's branch, returns the tree to the
//! default branch, and reopens the task. The sweep runs at startup and
//! periodically thereafter; repeated runs converge because a recovered task
//! no longer matches the orphan predicate.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::store::TaskStore;
use crate::core::task::{TaskId, TaskStatus, TaskUpdate};
use crate::git::{task_branch, BranchManager};
use crate::orchestration::registry::ProcessRegistry;
use crate::{osplog, osplog_debug, osplog_warn, Result};

/// Default interval between periodic sweeps.
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of one recovery sweep.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    /// Tasks reopened, with their work preserved.
    pub recovered: Vec<TaskId>,
    /// Orphans that could not be reopened this sweep; retried next time.
    pub failed: Vec<TaskId>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.recovered.is_empty() && self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct OrphanRecovery {
    store: Arc<dyn TaskStore>,
    branches: BranchManager,
    registry: Arc<ProcessRegistry>,
}

impl OrphanRecovery {
    pub fn new(
        store: Arc<dyn TaskStore>,
        branches: BranchManager,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            store,
            branches,
            registry,
        }
    }

    /// Sweep one project for orphans. `exclude` shields a task mid-dispatch
    /// (claimed in the store, process not yet registered) from being
    /// mistaken for an orphan.
    pub async fn run(&self, project_id: &str, exclude: Option<&TaskId>) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for task in self.store.list(project_id)? {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            if Some(&task.id) == exclude {
                continue;
            }
            let Some(assignee) = task.assignee else {
                continue;
            };
            if self.registry.contains(&assignee) {
                continue;
            }

            osplog!(
                "Recovering orphaned task {} (dead agent {})",
                task.id,
                assignee.short()
            );
            match self.recover_one(project_id, &task.id).await {
                Ok(()) => report.recovered.push(task.id),
                Err(e) => {
                    osplog_warn!("Failed to recover task {}: {}", task.id, e);
                    report.failed.push(task.id);
                }
            }
        }

        if !report.is_clean() {
            osplog!(
                "Recovery sweep for {}: {} recovered, {} failed",
                project_id,
                report.recovered.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    async fn recover_one(&self, project_id: &str, task_id: &TaskId) -> Result<()> {
        self.branches.wait_for_git_ready().await?;

        // Preserve the dead agent's edits. Either step failing must not
        // strand the task in_progress, so both are tolerated; when the
        // checkout fails the WIP commit still lands wherever the tree is,
        // which beats leaving the edits loose for a later sweep to fold
        // into another task's commit.
        let branch = task_branch(task_id);
        if let Err(e) = self.branches.checkout(&branch).await {
            osplog_warn!("Recovery checkout of {} failed: {}", branch, e);
        }
        match self.branches.commit_wip(task_id).await {
            Ok(true) => osplog!("Preserved WIP for task {}", task_id),
            Ok(false) => osplog_debug!("No WIP to preserve for task {}", task_id),
            Err(e) => osplog_warn!("WIP commit for {} failed: {}", task_id, e),
        }
        if let Err(e) = self.branches.ensure_on_main().await {
            osplog_warn!("Could not return to default branch: {}", e);
        }

        self.store.update(
            project_id,
            task_id,
            TaskUpdate::new().status(TaskStatus::Open).clear_assignee(),
        )?;
        Ok(())
    }

    /// Run sweeps on an interval until `shutdown` is cancelled.
    pub fn spawn_periodic(
        self,
        project_id: String,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        osplog_debug!("Periodic recovery for {} stopping", project_id);
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = self.run(&project_id, None).await {
                            osplog_warn!("Periodic recovery for {} failed: {}", project_id, e);
                        }
                    }
                }
            }
        })
    }
}
