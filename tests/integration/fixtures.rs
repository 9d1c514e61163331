//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - A scripted agent backend that edits the workspace and replays verdicts
//! - A file-backed task store and a config pointing at temp directories

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use git2::{Repository, Signature};
use tempfile::TempDir;
use tokio::sync::mpsc;

use ralph::config::{AgentRole, Config, TrackerKind};
use ralph::core::task::{Task, TaskId};
use ralph::orchestration::{AgentBackend, WaveEvent, WaveRunner};
use ralph::state::{Ledger, WaveRecord};
use ralph::tracker::{FileStore, TaskStore};
use ralph::{Error, Result};

/// A test repository with a temporary directory and an initial commit.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        let repo = Repository::init(&path).expect("Failed to init git");

        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test User", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .expect("Failed to commit");

        Self { temp_dir, path }
    }
}

/// One scripted backend reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Timeout,
    Transport,
}

impl Reply {
    pub fn text(s: &str) -> Self {
        Reply::Text(s.to_string())
    }
}

/// A recorded backend call.
#[derive(Debug, Clone)]
pub struct Call {
    pub role: AgentRole,
    pub task: String,
    pub attempt: u32,
    pub prompt: String,
}

/// In-memory agent backend.
///
/// The implementer appends a line to `<checkout>.txt` in the workspace; the
/// reviewer replays queued replies per task and approves when the queue is
/// empty. Implementer replies can be queued to inject failures.
pub struct ScriptedBackend {
    reviews: Mutex<HashMap<String, VecDeque<Reply>>>,
    implementations: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
}

impl ScriptedBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            reviews: Mutex::new(HashMap::new()),
            implementations: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn script_reviews(&self, task: &str, replies: Vec<Reply>) {
        self.reviews
            .lock()
            .unwrap()
            .insert(task.to_string(), replies.into());
    }

    pub fn script_implementations(&self, task: &str, replies: Vec<Reply>) {
        self.implementations
            .lock()
            .unwrap()
            .insert(task.to_string(), replies.into());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, task: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.task == task)
            .collect()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_reply(queue: &Mutex<HashMap<String, VecDeque<Reply>>>, task: &str) -> Option<Reply> {
        queue
            .lock()
            .unwrap()
            .get_mut(task)
            .and_then(|replies| replies.pop_front())
    }
}

/// Split a workspace directory name `<slug>-a<n>` into its parts.
fn parse_workspace(directory: &Path) -> (String, u32) {
    let name = directory
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.rsplit_once("-a") {
        Some((slug, attempt)) => (slug.to_string(), attempt.parse().unwrap_or(0)),
        None => (name, 0),
    }
}

/// The raw task id from either role's prompt (`... task <id>: <title>`).
fn task_in_prompt(prompt: &str) -> Option<String> {
    let start = prompt.find("task ")? + "task ".len();
    let rest = &prompt[start..];
    rest.find(": ").map(|end| rest[..end].to_string())
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn send(
        &self,
        prompt: &str,
        role: AgentRole,
        directory: &Path,
        timeout: Duration,
    ) -> Result<String> {
        let (slug, attempt) = parse_workspace(directory);
        let task = task_in_prompt(prompt).unwrap_or_else(|| slug.clone());
        self.calls.lock().unwrap().push(Call {
            role,
            task: task.clone(),
            attempt,
            prompt: prompt.to_string(),
        });

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let queue = match role {
            AgentRole::Implementer => &self.implementations,
            AgentRole::Reviewer => &self.reviews,
        };
        match Self::next_reply(queue, &task) {
            Some(Reply::Timeout) => return Err(Error::AgentTimeout(timeout)),
            Some(Reply::Transport) => {
                return Err(Error::AgentTransport("connection reset".to_string()))
            }
            Some(Reply::Text(text)) if role == AgentRole::Reviewer => return Ok(text),
            _ => {}
        }

        match role {
            AgentRole::Implementer => {
                let file = directory.join(format!("{}.txt", slug));
                let mut content = std::fs::read_to_string(&file).unwrap_or_default();
                content.push_str(&format!("attempt {}\n", attempt));
                std::fs::write(&file, content)?;
                Ok("Implemented.".to_string())
            }
            AgentRole::Reviewer => Ok("APPROVED\nLooks complete.".to_string()),
        }
    }
}

/// A repo, a task store, a scripted backend, and a config rooted in temp dirs.
pub struct Harness {
    pub repo: TestRepo,
    pub state_dir: TempDir,
    pub store: Arc<FileStore>,
    pub backend: Arc<ScriptedBackend>,
    pub config: Config,
}

impl Harness {
    pub fn new(max_parallel: usize, max_attempts: u32) -> Self {
        Self::with_delay(max_parallel, max_attempts, Duration::from_millis(20))
    }

    pub fn with_delay(max_parallel: usize, max_attempts: u32, delay: Duration) -> Self {
        let repo = TestRepo::new();
        let state_dir = TempDir::new().expect("Failed to create state directory");
        let tasks_path = state_dir.path().join("tasks.json");

        let mut config = Config::default();
        config.run.max_parallel = max_parallel;
        config.run.max_attempts = max_attempts;
        config.run.max_live_workers = max_parallel.max(4);
        config.run.run_dir = Some(state_dir.path().join("runs").display().to_string());
        config.run.workspace_dir = Some(
            state_dir
                .path()
                .join("workspaces")
                .display()
                .to_string(),
        );
        config.tracker.kind = TrackerKind::File;
        config.tracker.path = tasks_path.display().to_string();

        Self {
            repo,
            store: Arc::new(FileStore::new(&tasks_path)),
            state_dir,
            backend: Arc::new(ScriptedBackend::new(delay)),
            config,
        }
    }

    pub async fn add_task(&self, id: &str, deps: &[&str]) {
        let mut task = Task::new(id, &format!("Task {}", id), &format!("Implement {}.", id));
        for dep in deps {
            task = task.depends_on(*dep);
        }
        self.store.create(&task).await.expect("Failed to create task");
    }

    pub fn runner(&self) -> WaveRunner {
        WaveRunner::new(
            self.config.clone(),
            &self.repo.path,
            Arc::clone(&self.store) as Arc<dyn TaskStore>,
            Arc::clone(&self.backend) as Arc<dyn AgentBackend>,
        )
    }

    /// A runner whose events land in the returned receiver.
    pub fn runner_with_events(&self) -> (WaveRunner, mpsc::Receiver<WaveEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        (self.runner().with_events(tx), rx)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.state_dir.path().join("runs")
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.state_dir.path().join("workspaces")
    }

    pub fn record(&self, wave_id: &str) -> WaveRecord {
        Ledger::load(&self.run_dir(), wave_id).expect("Failed to load wave")
    }

    /// Checkout directories still present under the workspace root.
    pub fn remaining_workspaces(&self) -> Vec<PathBuf> {
        let root = self.workspace_dir();
        let mut found = Vec::new();
        let waves = match std::fs::read_dir(&root) {
            Ok(waves) => waves,
            Err(_) => return found,
        };
        for wave in waves.flatten() {
            if let Ok(checkouts) = std::fs::read_dir(wave.path()) {
                found.extend(checkouts.flatten().map(|c| c.path()));
            }
        }
        found.sort();
        found
    }
}

pub fn ids(ids: &[&str]) -> Vec<TaskId> {
    ids.iter().map(|id| TaskId::from(*id)).collect()
}

/// Drain every event already sent.
pub fn drain(rx: &mut mpsc::Receiver<WaveEvent>) -> Vec<WaveEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
