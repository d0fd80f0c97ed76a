//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Fake agent scripts standing in for the real agent CLI
//! - Building wired-up dispatchers

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use opensprint::agent::Agent;
use opensprint::core::store::{MemoryTaskStore, TaskStore};
use opensprint::git::BranchManager;
use opensprint::orchestration::{
    Dispatcher, DispatcherConfig, EventSink, NullSink, ProcessRegistry,
};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository on `main` with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        Command::new("git")
            .args(["init", "-b", "main"])
            .current_dir(&path)
            .output()
            .expect("Failed to init git");

        Command::new("git")
            .args(["config", "user.email", "test@test.com"])
            .current_dir(&path)
            .output()
            .expect("Failed to set user.email");

        Command::new("git")
            .args(["config", "user.name", "Test User"])
            .current_dir(&path)
            .output()
            .expect("Failed to set user.name");

        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");

        Command::new("git")
            .args(["add", "."])
            .current_dir(&path)
            .output()
            .expect("Failed to git add");

        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(&path)
            .output()
            .expect("Failed to git commit");

        Self { temp_dir, path }
    }

    /// Write a file into the working tree without committing it.
    pub fn write_file(&self, filename: &str, content: &str) {
        let file_path = self.path.join(filename);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(&file_path, content).expect("Failed to write file");
    }

    /// Name of the currently checked-out branch.
    pub fn current_branch(&self) -> String {
        let output = Command::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(&self.path)
            .output()
            .expect("Failed to read HEAD");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Whether a local branch exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", &format!("refs/heads/{}", name)])
            .current_dir(&self.path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Subject line of the tip commit of a branch.
    pub fn tip_message(&self, branch: &str) -> String {
        let output = Command::new("git")
            .args(["log", "-1", "--format=%s", branch])
            .current_dir(&self.path)
            .output()
            .expect("Failed to read log");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Whether the working tree has no uncommitted changes.
    pub fn is_clean(&self) -> bool {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.path)
            .output()
            .expect("Failed to read status");
        output.stdout.is_empty()
    }

    pub fn branch_manager(&self) -> BranchManager {
        BranchManager::new(&self.path).expect("Failed to open repository")
    }
}

/// An executable shell script standing in for the agent CLI. The script
/// ignores the prompt argument the dispatcher appends.
pub struct FakeAgent {
    _dir: TempDir,
    script: PathBuf,
}

impl FakeAgent {
    fn with_script(body: &str) -> Self {
        let dir = TempDir::new().expect("Failed to create agent dir");
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, body).expect("Failed to write agent script");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .expect("Failed to chmod agent script");
        }

        Self { _dir: dir, script }
    }

    /// Agent that prints a line and exits successfully.
    pub fn succeeding() -> Self {
        Self::with_script("#!/bin/sh\necho working\nexit 0\n")
    }

    /// Agent that writes a file into the working tree, then succeeds.
    pub fn writing(filename: &str) -> Self {
        Self::with_script(&format!(
            "#!/bin/sh\necho working\necho done > {}\nexit 0\n",
            filename
        ))
    }

    /// Agent that prints a line and exits with code 1.
    pub fn failing() -> Self {
        Self::with_script("#!/bin/sh\necho attempt\nexit 1\n")
    }

    /// Agent that announces itself and then sleeps.
    pub fn sleeping(secs: u32) -> Self {
        Self::with_script(&format!("#!/bin/sh\necho started\nsleep {}\n", secs))
    }

    pub fn agent(&self) -> Agent {
        Agent::from_command(&self.script.to_string_lossy())
    }
}

/// Wire a dispatcher over a repo, store, and fake agent.
pub fn dispatcher_with(
    repo: &TestRepo,
    store: Arc<dyn TaskStore>,
    agent: &FakeAgent,
    config: DispatcherConfig,
    events: Arc<dyn EventSink>,
) -> Dispatcher {
    Dispatcher::new(
        store,
        repo.branch_manager(),
        Arc::new(ProcessRegistry::new()),
        events,
        agent.agent(),
        config,
    )
}

/// Wire a dispatcher with a fresh memory store and no event sink.
pub fn dispatcher(
    repo: &TestRepo,
    agent: &FakeAgent,
    config: DispatcherConfig,
) -> (Dispatcher, Arc<MemoryTaskStore>) {
    let store = Arc::new(MemoryTaskStore::new());
    let d = dispatcher_with(repo, store.clone(), agent, config, Arc::new(NullSink));
    (d, store)
}

/// Poll `predicate` until it holds or the deadline passes.
pub async fn wait_for<F>(deadline: Duration, predicate: F) -> bool
where
    F: Fn() -> bool,
{
    let start = tokio::time::Instant::now();
    loop {
        if predicate() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
