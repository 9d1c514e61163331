//! Adapter for the `bd` (beads) issue tracker CLI.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::tracker::TaskStore;
use crate::{rlog_debug, rlog_warn, Error, Result};

/// Dependency types that order execution. Everything else (notably
/// `parent-child`) is structure only.
const BLOCKING_DEP_TYPES: &[&str] = &["blocks"];

pub struct BeadsStore {
    binary: PathBuf,
    cwd: PathBuf,
}

impl BeadsStore {
    /// Find `command` on PATH and run it from `cwd`.
    pub fn locate(command: &str, cwd: &Path) -> Result<Self> {
        let binary = which::which(command)
            .map_err(|_| Error::Tracker(format!("{} not found on PATH", command)))?;
        Ok(Self::new(binary, cwd))
    }

    pub fn new(binary: PathBuf, cwd: &Path) -> Self {
        Self {
            binary,
            cwd: cwd.to_path_buf(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        rlog_debug!("bd {}", args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.cwd)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            rlog_warn!("bd {} failed: {}", args.first().unwrap_or(&""), stderr);
            return Err(Error::Tracker(if stderr.is_empty() {
                format!("bd {} exited with {}", args.join(" "), output.status)
            } else {
                stderr
            }));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TaskStore for BeadsStore {
    async fn create(&self, task: &Task) -> Result<()> {
        let deps = task
            .deps
            .iter()
            .map(|d| format!("blocks:{}", d))
            .collect::<Vec<_>>()
            .join(",");
        let mut args = vec![
            "create",
            task.title.as_str(),
            "--id",
            task.id.as_str(),
            "--description",
            task.description.as_str(),
        ];
        if !deps.is_empty() {
            args.push("--deps");
            args.push(&deps);
        }
        args.push("--json");
        self.run(&args).await?;
        Ok(())
    }

    async fn show(&self, id: &TaskId) -> Result<Task> {
        let stdout = self.run(&["show", id.as_str(), "--json"]).await?;
        parse_issue_json(&stdout)
    }

    async fn update(&self, id: &TaskId, status: TaskStatus, notes: &str) -> Result<()> {
        self.run(&[
            "update",
            id.as_str(),
            "--status",
            to_beads_status(status),
            "--notes",
            notes,
        ])
        .await?;
        Ok(())
    }

    async fn close(&self, id: &TaskId, reason: &str) -> Result<()> {
        self.run(&["close", id.as_str(), "--reason", reason]).await?;
        Ok(())
    }

    async fn list_dependents(&self, epic: &TaskId) -> Result<Vec<TaskId>> {
        let stdout = self
            .run(&["list", "--parent", epic.as_str(), "--json"])
            .await?;
        parse_issue_list_json(&stdout)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShowOutput {
    Many(Vec<BeadsIssue>),
    One(BeadsIssue),
}

#[derive(Debug, Deserialize)]
struct BeadsIssue {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "deps")]
    dependencies: Vec<BeadsDep>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BeadsDep {
    Id(String),
    Edge {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        depends_on_id: Option<String>,
        #[serde(default, rename = "type", alias = "dependency_type")]
        dep_type: Option<String>,
    },
}

impl BeadsDep {
    /// The depended-on id, or `None` for non-blocking edges.
    fn blocking_target(&self) -> Option<&str> {
        match self {
            BeadsDep::Id(id) => Some(id),
            BeadsDep::Edge {
                id,
                depends_on_id,
                dep_type,
            } => {
                if let Some(kind) = dep_type {
                    if !BLOCKING_DEP_TYPES.contains(&kind.as_str()) {
                        return None;
                    }
                }
                depends_on_id.as_deref().or(id.as_deref())
            }
        }
    }
}

impl From<BeadsIssue> for Task {
    fn from(issue: BeadsIssue) -> Self {
        let deps = issue
            .dependencies
            .iter()
            .filter_map(BeadsDep::blocking_target)
            .filter(|dep| *dep != issue.id)
            .map(TaskId::from)
            .collect();
        Task {
            id: TaskId::new(issue.id),
            title: issue.title,
            description: issue.description,
            deps,
            status: issue
                .status
                .as_deref()
                .map(from_beads_status)
                .unwrap_or_default(),
        }
    }
}

/// Parse `bd show --json` output: one issue object or a one-element array.
pub fn parse_issue_json(json: &str) -> Result<Task> {
    let parsed: ShowOutput = serde_json::from_str(json.trim())
        .map_err(|e| Error::Tracker(format!("unreadable bd show output: {}", e)))?;
    let issue = match parsed {
        ShowOutput::One(issue) => issue,
        ShowOutput::Many(issues) => issues
            .into_iter()
            .next()
            .ok_or_else(|| Error::Tracker("bd show returned no issue".into()))?,
    };
    Ok(issue.into())
}

/// Parse `bd list --json` output into sorted ids.
pub fn parse_issue_list_json(json: &str) -> Result<Vec<TaskId>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let issues: Vec<BeadsIssue> = serde_json::from_str(json.trim())
        .map_err(|e| Error::Tracker(format!("unreadable bd list output: {}", e)))?;
    let mut ids: Vec<TaskId> = issues.into_iter().map(|i| TaskId::new(i.id)).collect();
    ids.sort();
    Ok(ids)
}

pub fn from_beads_status(status: &str) -> TaskStatus {
    match status {
        "in_progress" => TaskStatus::Running,
        "closed" => TaskStatus::Complete,
        "blocked" => TaskStatus::Blocked,
        _ => TaskStatus::Pending,
    }
}

/// Beads has no failed state; a failed task goes back to `open` and the
/// failure is carried in the notes.
pub fn to_beads_status(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending | TaskStatus::Failed => "open",
        TaskStatus::Running => "in_progress",
        TaskStatus::Complete => "closed",
        TaskStatus::Blocked => "blocked",
    }
}
