//! Kill, shutdown, and periodic recovery tests.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use opensprint::agent::AgentId;
use opensprint::core::store::{MemoryTaskStore, TaskStore};
use opensprint::core::task::{Task, TaskId, TaskStatus};
use opensprint::orchestration::{
    DispatcherConfig, KillOutcome, OrphanRecovery, ProcessRegistry,
};

use crate::fixtures::{dispatcher, wait_for, FakeAgent, TestRepo};

const PROJECT: &str = "demo";

#[tokio::test(flavor = "multi_thread")]
async fn test_kill_agent_reopens_task() {
    let repo = TestRepo::new();
    let agent = FakeAgent::sleeping(30);
    let (dispatcher, store) = dispatcher(&repo, &agent, DispatcherConfig::default());
    store.insert(PROJECT, Task::new("os-1", "t", "d"));

    dispatcher.start(PROJECT);
    assert!(wait_for(Duration::from_secs(5), || {
        dispatcher.active_agents(PROJECT).len() == 1
    })
    .await);

    // Pause so the reopened task is not immediately re-dispatched.
    dispatcher.pause(PROJECT);

    let active = dispatcher.active_agents(PROJECT);
    let outcome = dispatcher.kill_agent(PROJECT, &active[0].agent_id);
    assert_eq!(outcome, KillOutcome::SignalSent);

    let id = TaskId::from("os-1");
    assert!(wait_for(Duration::from_secs(5), || {
        store.get(PROJECT, &id).unwrap().status == TaskStatus::Open
    })
    .await);

    let task = store.get(PROJECT, &id).unwrap();
    assert!(task.assignee.is_none());
    assert_eq!(task.consecutive_failures, 1);
    let summary = task.last_execution_summary.unwrap();
    assert_eq!(summary.failure_type.as_deref(), Some("killed_by_signal"));

    assert!(dispatcher.active_agents(PROJECT).is_empty());
    assert!(dispatcher.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_terminates_all_agents() {
    let repo = TestRepo::new();
    let agent = FakeAgent::sleeping(30);
    let (dispatcher, store) = dispatcher(&repo, &agent, DispatcherConfig::default());
    store.insert(PROJECT, Task::new("os-1", "t", "d"));

    dispatcher.start(PROJECT);
    assert!(wait_for(Duration::from_secs(5), || {
        dispatcher.active_agents(PROJECT).len() == 1
    })
    .await);

    let signalled = dispatcher.shutdown();
    assert_eq!(signalled, 1);

    let id = TaskId::from("os-1");
    assert!(wait_for(Duration::from_secs(5), || {
        store.get(PROJECT, &id).unwrap().status == TaskStatus::Open
    })
    .await);
    assert!(dispatcher.registry().is_empty());
    assert!(dispatcher.active_agents(PROJECT).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_periodic_recovery_sweeps() {
    let repo = TestRepo::new();
    let store = Arc::new(MemoryTaskStore::new());

    let mut task = Task::new("os-1", "t", "d");
    task.status = TaskStatus::InProgress;
    task.assignee = Some(AgentId::new());
    store.insert(PROJECT, task);

    let recovery = OrphanRecovery::new(
        store.clone(),
        repo.branch_manager(),
        Arc::new(ProcessRegistry::new()),
    );
    let shutdown = CancellationToken::new();
    let handle = recovery.spawn_periodic(
        PROJECT.to_string(),
        Duration::from_millis(100),
        shutdown.clone(),
    );

    let id = TaskId::from("os-1");
    assert!(wait_for(Duration::from_secs(5), || {
        store.get(PROJECT, &id).unwrap().status == TaskStatus::Open
    })
    .await);

    shutdown.cancel();
    handle.await.unwrap();
}
