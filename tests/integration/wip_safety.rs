//! WIP safety net tests: uncommitted agent work must survive crashes.

use std::sync::Arc;

use opensprint::agent::AgentId;
use opensprint::core::store::{MemoryTaskStore, TaskStore};
use opensprint::core::task::{Task, TaskId, TaskStatus};
use opensprint::git::task_branch;
use opensprint::orchestration::{OrphanRecovery, ProcessRegistry};

use crate::fixtures::TestRepo;

#[tokio::test]
async fn test_commit_wip_only_when_dirty() {
    let repo = TestRepo::new();
    let branches = repo.branch_manager();
    let id = TaskId::from("os-1");

    // Clean tree: nothing to preserve.
    assert!(!branches.commit_wip(&id).await.unwrap());

    repo.write_file("notes.txt", "half-finished\n");
    assert!(branches.commit_wip(&id).await.unwrap());
    assert!(repo.is_clean());
    assert_eq!(repo.tip_message("main"), "WIP: os-1");

    // Second call on the now-clean tree is a no-op.
    assert!(!branches.commit_wip(&id).await.unwrap());
}

#[tokio::test]
async fn test_checkout_creates_branch_from_default() {
    let repo = TestRepo::new();
    let branches = repo.branch_manager();

    assert!(!branches.branch_exists("opensprint/os-9").unwrap());
    branches.checkout("opensprint/os-9").await.unwrap();
    assert_eq!(repo.current_branch(), "opensprint/os-9");

    branches.ensure_on_main().await.unwrap();
    assert_eq!(repo.current_branch(), "main");
    assert!(branches.branch_exists("opensprint/os-9").unwrap());
    assert!(repo.branch_exists("opensprint/os-9"));
}

/// A manager opened while the tree is still pinned to a task branch (as
/// after a host crash) must not mistake that branch for the default.
#[tokio::test]
async fn test_default_branch_detection_survives_task_branch_head() {
    let repo = TestRepo::new();
    let setup = repo.branch_manager();
    setup.checkout("opensprint/os-42").await.unwrap();
    repo.write_file("wip.txt", "half\n");
    setup.commit_wip(&TaskId::from("os-42")).await.unwrap();

    // A manager opened after a restart, with the task branch checked out.
    let branches = repo.branch_manager();
    assert_eq!(branches.default_branch(), "main");

    branches.ensure_on_main().await.unwrap();
    assert_eq!(repo.current_branch(), "main");

    // New task branches fork from main, not from the stale task tip.
    branches.checkout("opensprint/os-43").await.unwrap();
    assert_eq!(repo.tip_message("opensprint/os-43"), "Initial commit");
}

#[tokio::test]
async fn test_checkout_reuses_existing_branch() {
    let repo = TestRepo::new();
    let branches = repo.branch_manager();

    branches.checkout("opensprint/os-9").await.unwrap();
    branches.ensure_on_main().await.unwrap();
    branches.checkout("opensprint/os-9").await.unwrap();
    assert_eq!(repo.current_branch(), "opensprint/os-9");
}

/// Host crashes while an agent was editing files for task os-42; on restart,
/// recovery must preserve the edits as a WIP commit on the task branch and
/// reopen the task.
#[tokio::test]
async fn test_crash_recovery_preserves_uncommitted_work() {
    let repo = TestRepo::new();
    let store = Arc::new(MemoryTaskStore::new());

    let mut task = Task::new("os-42", "partial", "Write src/partial.ts");
    task.status = TaskStatus::InProgress;
    task.assignee = Some(AgentId::new());
    store.insert("demo", task);

    // The dead agent had checked out the task branch and left edits behind.
    let branches = repo.branch_manager();
    branches.checkout("opensprint/os-42").await.unwrap();
    repo.write_file("src/partial.ts", "export const x = 1\n");

    // Fresh registry, as after a restart: no live processes.
    let recovery = OrphanRecovery::new(
        store.clone(),
        repo.branch_manager(),
        Arc::new(ProcessRegistry::new()),
    );
    let report = recovery.run("demo", None).await.unwrap();
    assert_eq!(report.recovered, vec![TaskId::from("os-42")]);
    assert!(report.failed.is_empty());

    // Work preserved on the task branch, tree back on main, task reopened.
    let branch = task_branch(&TaskId::from("os-42"));
    assert_eq!(repo.tip_message(&branch), "WIP: os-42");
    assert_eq!(repo.current_branch(), "main");
    assert!(repo.is_clean());

    let task = store.get("demo", &TaskId::from("os-42")).unwrap();
    assert_eq!(task.status, TaskStatus::Open);
    assert!(task.assignee.is_none());
}

/// Recovery on a clean crash (no edits) still reopens the task without
/// inventing a commit.
#[tokio::test]
async fn test_crash_recovery_with_clean_tree() {
    let repo = TestRepo::new();
    let store = Arc::new(MemoryTaskStore::new());

    let mut task = Task::new("os-7", "t", "d");
    task.status = TaskStatus::InProgress;
    task.assignee = Some(AgentId::new());
    store.insert("demo", task);

    let recovery = OrphanRecovery::new(
        store.clone(),
        repo.branch_manager(),
        Arc::new(ProcessRegistry::new()),
    );
    recovery.run("demo", None).await.unwrap();

    let branch = task_branch(&TaskId::from("os-7"));
    // Branch created by the recovery checkout but its tip is still main's.
    assert_eq!(repo.tip_message(&branch), "Initial commit");
    assert_eq!(
        store.get("demo", &TaskId::from("os-7")).unwrap().status,
        TaskStatus::Open
    );
}
