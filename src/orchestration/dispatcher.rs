//! The dispatch loop.
//!
//! One dispatcher serves one working tree. Each project has a small control
//! block: a pause flag, a run guard so at most one dispatch cycle executes
//! at a time, a coalesced nudge flag, and the set of active agents. Anyone
//! may nudge at any time; nudges that arrive mid-cycle collapse into a
//! single follow-up cycle.
//!
//! A cycle claims the most urgent ready task, checks out its branch, spawns
//! the agent CLI in its own process group, and hands the child to a
//! supervision task. Supervision watches output for stalls and routes the
//! exit through the failure backoff policy. Whatever the outcome, the
//! working tree is swept for uncommitted work (WIP commit) and returned to
//! the default branch before the task's next state is written.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentId};
use crate::core::store::TaskStore;
use crate::core::summary::{
    next_backoff, AttemptOutcome, BackoffDecision, ExecutionSummary, Phase,
    BACKOFF_FAILURE_THRESHOLD,
};
use crate::core::task::{Task, TaskId, TaskStatus, TaskUpdate};
use crate::git::{task_branch, BranchManager};
use crate::orchestration::events::{DispatchEvent, EventSink};
use crate::orchestration::registry::{send_sigterm, ProcessHandle, ProcessRegistry};
use crate::{osplog, osplog_debug, osplog_error, osplog_warn, Error, Result};

/// Agent output lines retained for the execution summary.
const OUTPUT_TAIL_LINES: usize = 40;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Agents allowed to run concurrently per project. Defaults to 1: all
    /// agents share one working tree, and concurrent checkouts would
    /// trample each other.
    pub max_concurrent_agents: usize,
    /// How long an agent may produce no output before it is stalled.
    pub inactivity_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 1,
            inactivity_timeout: Duration::from_secs(300),
        }
    }
}

/// A currently supervised agent.
#[derive(Debug, Clone)]
pub struct ActiveAgent {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
}

/// Snapshot of a project's dispatch state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchStatus {
    pub paused: bool,
    pub cycle_running: bool,
    pub nudge_pending: bool,
    pub active_agents: usize,
}

/// Result of a kill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// SIGTERM went out; the supervisor will observe the exit and finish
    /// the attempt as a failure.
    SignalSent,
    /// No live process for that agent in this project.
    NotKillable,
}

#[derive(Default)]
struct ProjectControl {
    paused: bool,
    cycle_running: bool,
    nudge_pending: bool,
    active: HashMap<AgentId, ActiveAgent>,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    branches: BranchManager,
    registry: Arc<ProcessRegistry>,
    events: Arc<dyn EventSink>,
    agent: Agent,
    config: DispatcherConfig,
    projects: Mutex<HashMap<String, ProjectControl>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        branches: BranchManager,
        registry: Arc<ProcessRegistry>,
        events: Arc<dyn EventSink>,
        agent: Agent,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                branches,
                registry,
                events,
                agent,
                config,
                projects: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> Arc<ProcessRegistry> {
        self.inner.registry.clone()
    }

    /// Unpause a project and schedule a cycle.
    pub fn start(&self, project_id: &str) {
        osplog!("Starting dispatch for project {}", project_id);
        {
            let mut projects = self.inner.projects.lock().expect("dispatcher lock");
            projects.entry(project_id.to_string()).or_default().paused = false;
        }
        self.nudge(project_id);
    }

    /// Stop claiming new tasks. Agents already running are unaffected.
    pub fn pause(&self, project_id: &str) {
        osplog!("Pausing dispatch for project {}", project_id);
        let mut projects = self.inner.projects.lock().expect("dispatcher lock");
        projects.entry(project_id.to_string()).or_default().paused = true;
    }

    /// Request a dispatch cycle. If one is already running the request is
    /// coalesced: any number of nudges during a cycle produce exactly one
    /// follow-up cycle.
    pub fn nudge(&self, project_id: &str) {
        {
            let mut projects = self.inner.projects.lock().expect("dispatcher lock");
            let control = projects.entry(project_id.to_string()).or_default();
            if control.cycle_running {
                control.nudge_pending = true;
                return;
            }
            control.cycle_running = true;
        }

        let this = self.clone();
        let project = project_id.to_string();
        tokio::spawn(async move { this.drive(project).await });
    }

    /// Cycle until no nudge arrived while the last one ran, then release
    /// the run guard.
    async fn drive(&self, project: String) {
        loop {
            if let Err(e) = self.run_cycle(&project).await {
                osplog_error!("Dispatch cycle for {} failed: {}", project, e);
            }
            let mut projects = self.inner.projects.lock().expect("dispatcher lock");
            let control = projects.entry(project.clone()).or_default();
            if control.nudge_pending {
                control.nudge_pending = false;
                continue;
            }
            control.cycle_running = false;
            return;
        }
    }

    /// One dispatch cycle: claim and launch ready tasks until the project
    /// is paused, out of capacity, or out of claimable work.
    async fn run_cycle(&self, project: &str) -> Result<()> {
        loop {
            if self.inner.shutdown.is_cancelled() {
                return Ok(());
            }
            let capacity = {
                let mut projects = self.inner.projects.lock().expect("dispatcher lock");
                let control = projects.entry(project.to_string()).or_default();
                if control.paused {
                    osplog_debug!("Project {} paused, skipping cycle", project);
                    return Ok(());
                }
                self.inner
                    .config
                    .max_concurrent_agents
                    .saturating_sub(control.active.len())
            };
            if capacity == 0 {
                return Ok(());
            }

            let mut candidates = self.inner.store.list_ready(project)?;
            // Most urgent first; FIFO within a rank.
            candidates.sort_by_key(|t| (t.urgency_rank, t.created_at));

            let mut dispatched = false;
            for task in candidates {
                let agent_id = AgentId::new();
                if !self.inner.store.claim(project, &task.id, agent_id)? {
                    osplog_debug!("Lost claim race for task {}", task.id);
                    continue;
                }
                self.publish_status(project, &task.id, TaskStatus::InProgress);

                match self.launch(project, &task, agent_id).await {
                    Ok(()) => {
                        dispatched = true;
                        break;
                    }
                    Err(e) => {
                        osplog_warn!("Could not launch agent for task {}: {}", task.id, e);
                        self.release_claim(project, &task.id);
                    }
                }
            }
            if !dispatched {
                return Ok(());
            }
        }
    }

    /// Check out the task branch and spawn the agent process. The claim is
    /// already written; on any error here the caller releases it.
    async fn launch(&self, project: &str, task: &Task, agent_id: AgentId) -> Result<()> {
        self.inner.branches.wait_for_git_ready().await?;
        let branch = task_branch(&task.id);
        self.inner.branches.checkout(&branch).await?;

        let command_line = self.inner.agent.command(Some(&task.description));
        let (program, args) = command_line
            .split_first()
            .ok_or_else(|| Error::AgentNotAvailable("empty agent command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(self.inner.branches.repo_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group so termination reaches the agent's children too.
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| Error::AgentNotAvailable("agent exited before supervision".to_string()))?
            as i32;

        osplog!(
            "Dispatched task {} to agent {} (pid {}) on {}",
            task.id,
            agent_id.short(),
            pid,
            branch
        );
        self.inner.registry.register(agent_id, ProcessHandle::group(pid));
        {
            let mut projects = self.inner.projects.lock().expect("dispatcher lock");
            projects.entry(project.to_string()).or_default().active.insert(
                agent_id,
                ActiveAgent {
                    agent_id,
                    task_id: task.id.clone(),
                    phase: Phase::Execute,
                    started_at: Utc::now(),
                },
            );
        }

        let this = self.clone();
        let project = project.to_string();
        let task = task.clone();
        tokio::spawn(async move { this.supervise(project, task, agent_id, child).await });
        Ok(())
    }

    /// Watch one agent until it exits, then settle the attempt.
    async fn supervise(&self, project: String, task: Task, agent_id: AgentId, mut child: Child) {
        let timeout = self.inner.config.inactivity_timeout;
        let mut stdout_lines = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr_lines = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut out_done = stdout_lines.is_none();
        let mut err_done = stderr_lines.is_none();

        let mut last_activity = Instant::now();
        let mut stalled = false;
        let mut shutdown_seen = false;
        let mut tail: Vec<String> = Vec::new();

        let exit: Option<ExitStatus> = loop {
            let deadline = last_activity + timeout;
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(s) => break Some(s),
                        Err(e) => {
                            osplog_error!("Waiting on agent {} failed: {}", agent_id.short(), e);
                            break None;
                        }
                    }
                }
                line = next_line(&mut stdout_lines), if !out_done => {
                    match line {
                        Some(text) => self.on_output(&project, &task, agent_id, text, &mut last_activity, &mut tail),
                        None => out_done = true,
                    }
                }
                line = next_line(&mut stderr_lines), if !err_done => {
                    match line {
                        Some(text) => self.on_output(&project, &task, agent_id, text, &mut last_activity, &mut tail),
                        None => err_done = true,
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !stalled => {
                    stalled = true;
                    osplog_warn!(
                        "Agent {} on task {} stalled ({}s silent), terminating",
                        agent_id.short(),
                        task.id,
                        timeout.as_secs()
                    );
                    self.inner.events.publish(DispatchEvent::AgentStalled {
                        project_id: project.clone(),
                        task_id: task.id.clone(),
                        agent_id,
                        idle: timeout,
                    });
                    self.terminate(&agent_id);
                }
                _ = self.inner.shutdown.cancelled(), if !shutdown_seen => {
                    shutdown_seen = true;
                    self.terminate(&agent_id);
                }
            }
        };

        self.inner.registry.unregister(&agent_id);
        {
            let mut projects = self.inner.projects.lock().expect("dispatcher lock");
            if let Some(control) = projects.get_mut(&project) {
                control.active.remove(&agent_id);
            }
        }

        self.sweep_working_tree(&task.id).await;
        self.settle(&project, &task, exit, stalled, &tail);
        self.nudge(&project);
    }

    fn on_output(
        &self,
        project: &str,
        task: &Task,
        agent_id: AgentId,
        text: String,
        last_activity: &mut Instant,
        tail: &mut Vec<String>,
    ) {
        *last_activity = Instant::now();
        tail.push(text.clone());
        if tail.len() > OUTPUT_TAIL_LINES {
            tail.remove(0);
        }
        self.inner.events.publish(DispatchEvent::AgentOutput {
            project_id: project.to_string(),
            task_id: task.id.clone(),
            agent_id,
            chunk: text,
        });
    }

    /// Preserve uncommitted work and return the tree to the default branch.
    /// Runs on every exit path; failures are logged, never fatal.
    async fn sweep_working_tree(&self, task_id: &TaskId) {
        match self.inner.branches.wait_for_git_ready().await {
            Ok(()) => match self.inner.branches.commit_wip(task_id).await {
                Ok(true) => osplog!("Preserved WIP for task {}", task_id),
                Ok(false) => {}
                Err(e) => osplog_warn!("WIP commit for {} failed: {}", task_id, e),
            },
            Err(e) => osplog_warn!("Git not ready after task {}: {}", task_id, e),
        }
        if let Err(e) = self.inner.branches.ensure_on_main().await {
            osplog_warn!("Could not return to default branch: {}", e);
        }
    }

    /// Write the attempt's outcome back to the store.
    fn settle(
        &self,
        project: &str,
        task: &Task,
        exit: Option<ExitStatus>,
        stalled: bool,
        tail: &[String],
    ) {
        let success = !stalled && exit.map(|s| s.success()).unwrap_or(false);
        let attempt = task.consecutive_failures + 1;
        let output_tail = tail.join(" ");

        let update = if success {
            let text = if output_tail.trim().is_empty() {
                format!("agent completed task {}", task.id)
            } else {
                output_tail.clone()
            };
            let summary = ExecutionSummary::new(attempt, AttemptOutcome::Success, Phase::Execute, &text);
            TaskUpdate::new()
                .status(TaskStatus::Done)
                .clear_assignee()
                .consecutive_failures(0)
                .summary(summary)
        } else {
            let failure_type = if stalled {
                "stalled".to_string()
            } else {
                describe_exit(exit)
            };
            let failure_text = if output_tail.trim().is_empty() {
                format!("agent failed: {}", failure_type)
            } else {
                format!("agent failed: {}; last output: {}", failure_type, output_tail)
            };
            let failures = task.consecutive_failures + 1;
            match next_backoff(task.consecutive_failures, task.urgency_rank) {
                BackoffDecision::Retry { failures } => {
                    osplog!(
                        "Task {} failed ({}), attempt {} of {}, reopening",
                        task.id,
                        failure_type,
                        failures,
                        BACKOFF_FAILURE_THRESHOLD
                    );
                    let summary =
                        ExecutionSummary::new(attempt, AttemptOutcome::Failure, Phase::Execute, &failure_text)
                            .with_failure_type(&failure_type);
                    TaskUpdate::new()
                        .status(TaskStatus::Open)
                        .clear_assignee()
                        .consecutive_failures(failures)
                        .summary(summary)
                }
                BackoffDecision::Demote { new_rank } => {
                    osplog!(
                        "Task {} hit {} consecutive failures, demoting to rank {}",
                        task.id,
                        BACKOFF_FAILURE_THRESHOLD,
                        new_rank
                    );
                    let summary =
                        ExecutionSummary::new(attempt, AttemptOutcome::Failure, Phase::Execute, &failure_text)
                            .with_failure_type(&failure_type);
                    TaskUpdate::new()
                        .status(TaskStatus::Open)
                        .clear_assignee()
                        .urgency_rank(new_rank)
                        .consecutive_failures(0)
                        .summary(summary)
                }
                BackoffDecision::Block => {
                    let reason = format!(
                        "{} consecutive failures at lowest urgency",
                        BACKOFF_FAILURE_THRESHOLD
                    );
                    osplog!("Task {} blocked: {}", task.id, reason);
                    let summary =
                        ExecutionSummary::new(attempt, AttemptOutcome::Failure, Phase::Execute, &failure_text)
                            .with_failure_type(&failure_type)
                            .with_block_reason(&reason);
                    TaskUpdate::new()
                        .status(TaskStatus::Blocked { reason })
                        .clear_assignee()
                        .consecutive_failures(failures)
                        .summary(summary)
                }
            }
        };

        match self.inner.store.update(project, &task.id, update) {
            Ok(updated) => self.publish_status(project, &task.id, updated.status),
            Err(e) => osplog_error!("Could not settle task {}: {}", task.id, e),
        }
    }

    /// Send SIGTERM to a live agent of this project. The supervisor observes
    /// the exit and settles the attempt as a failure.
    pub fn kill_agent(&self, project_id: &str, agent_id: &AgentId) -> KillOutcome {
        let is_active = {
            let projects = self.inner.projects.lock().expect("dispatcher lock");
            projects
                .get(project_id)
                .map(|c| c.active.contains_key(agent_id))
                .unwrap_or(false)
        };
        if !is_active {
            return KillOutcome::NotKillable;
        }
        let Some(handle) = self.inner.registry.get(agent_id) else {
            return KillOutcome::NotKillable;
        };
        osplog!("Kill requested for agent {} (pid {})", agent_id.short(), handle.pid);
        if let Err(e) = send_sigterm(&handle) {
            // Exit already in flight; the supervisor will settle it.
            osplog_warn!("Signal to agent {} failed: {}", agent_id.short(), e);
        }
        KillOutcome::SignalSent
    }

    fn terminate(&self, agent_id: &AgentId) {
        if let Some(handle) = self.inner.registry.get(agent_id) {
            if let Err(e) = send_sigterm(&handle) {
                osplog_warn!("Signal to agent {} failed: {}", agent_id.short(), e);
            }
        }
    }

    pub fn status(&self, project_id: &str) -> DispatchStatus {
        let projects = self.inner.projects.lock().expect("dispatcher lock");
        match projects.get(project_id) {
            Some(control) => DispatchStatus {
                paused: control.paused,
                cycle_running: control.cycle_running,
                nudge_pending: control.nudge_pending,
                active_agents: control.active.len(),
            },
            None => DispatchStatus {
                paused: false,
                cycle_running: false,
                nudge_pending: false,
                active_agents: 0,
            },
        }
    }

    pub fn active_agents(&self, project_id: &str) -> Vec<ActiveAgent> {
        let projects = self.inner.projects.lock().expect("dispatcher lock");
        projects
            .get(project_id)
            .map(|c| c.active.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Terminate all agents and stop all supervision. Returns how many
    /// processes were signalled.
    pub fn shutdown(&self) -> usize {
        osplog!("Dispatcher shutting down");
        self.inner.shutdown.cancel();
        self.inner.registry.kill_all()
    }

    fn release_claim(&self, project: &str, task_id: &TaskId) {
        let update = TaskUpdate::new().status(TaskStatus::Open).clear_assignee();
        match self.inner.store.update(project, task_id, update) {
            Ok(updated) => self.publish_status(project, task_id, updated.status),
            Err(e) => osplog_error!("Could not release claim on {}: {}", task_id, e),
        }
    }

    fn publish_status(&self, project: &str, task_id: &TaskId, status: TaskStatus) {
        self.inner.events.publish(DispatchEvent::TaskStatusChanged {
            project_id: project.to_string(),
            task_id: task_id.clone(),
            status,
        });
    }
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(l) => l.next_line().await.ok().flatten(),
        None => None,
    }
}

fn describe_exit(exit: Option<ExitStatus>) -> String {
    match exit {
        Some(status) => match status.code() {
            Some(code) => format!("exit_code_{}", code),
            None => "killed_by_signal".to_string(),
        },
        None => "wait_failed".to_string(),
    }
}
