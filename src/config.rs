use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{rlog_debug, Error, Result};

/// Default agent runtime endpoint.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:4096";

/// Default per-call agent timeout (seconds).
pub const DEFAULT_TIMEOUT_SECS: u64 = 180;

/// Top-level configuration, loaded once per command and passed down.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_parallel: usize,
    pub max_attempts: u32,
    /// Process-wide ceiling on concurrently running workers.
    pub max_live_workers: usize,
    pub keep_workspaces: bool,
    pub run_dir: Option<String>,
    pub workspace_dir: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            max_attempts: 3,
            max_live_workers: 16,
            keep_workspaces: false,
            run_dir: None,
            workspace_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub teardown_timeout_secs: u64,
    pub implementer: AgentProfile,
    pub reviewer: AgentProfile,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            teardown_timeout_secs: 10,
            implementer: AgentProfile {
                agent: "build".to_string(),
                model: ModelRef::default(),
            },
            reviewer: AgentProfile {
                agent: "plan".to_string(),
                model: ModelRef::default(),
            },
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }

    pub fn profile(&self, role: AgentRole) -> &AgentProfile {
        match role {
            AgentRole::Implementer => &self.implementer,
            AgentRole::Reviewer => &self.reviewer,
        }
    }
}

/// Which side of the implement/review cycle a call is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Implementer,
    Reviewer,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Implementer => write!(f, "implementer"),
            AgentRole::Reviewer => write!(f, "reviewer"),
        }
    }
}

/// Agent name and model used for one role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentProfile {
    pub agent: String,
    pub model: ModelRef,
}

/// A `provider/model` reference, e.g. `anthropic/claude-sonnet-4`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl Default for ModelRef {
    fn default() -> Self {
        Self {
            provider_id: "anthropic".to_string(),
            model_id: "claude-sonnet-4".to_string(),
        }
    }
}

impl std::str::FromStr for ModelRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Ok(Self {
                provider_id: provider.to_string(),
                model_id: model.to_string(),
            }),
            _ => Err(Error::Config(format!(
                "model must be provider/model, got {:?}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for ModelRef {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ModelRef> for String {
    fn from(value: ModelRef) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    /// The `bd` issue tracker CLI.
    #[default]
    Beads,
    /// A local JSON file of task records.
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub kind: TrackerKind,
    pub command: String,
    pub path: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            kind: TrackerKind::Beads,
            command: "bd".to_string(),
            path: ".ralph/tasks.json".to_string(),
        }
    }
}

impl Config {
    pub fn ralph_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".ralph"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::ralph_dir()?.join("ralph.toml"))
    }

    pub fn run_dir(&self) -> Result<PathBuf> {
        match &self.run.run_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::ralph_dir()?.join("runs")),
        }
    }

    pub fn workspace_dir(&self) -> Result<PathBuf> {
        match &self.run.workspace_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::ralph_dir()?.join("workspaces")),
        }
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        rlog_debug!(
            "Config loaded: max_parallel={}, max_attempts={}, backend={}",
            config.run.max_parallel,
            config.run.max_attempts,
            config.backend.base_url
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.run.max_parallel == 0 {
            return Err(Error::Config("run.max_parallel must be at least 1".into()));
        }
        if self.run.max_attempts == 0 {
            return Err(Error::Config("run.max_attempts must be at least 1".into()));
        }
        if self.run.max_live_workers < self.run.max_parallel {
            return Err(Error::Config(format!(
                "run.max_live_workers ({}) must be >= run.max_parallel ({})",
                self.run.max_live_workers, self.run.max_parallel
            )));
        }
        if self.backend.timeout_secs == 0 {
            return Err(Error::Config("backend.timeout_secs must be positive".into()));
        }
        for (role, profile) in [
            (AgentRole::Implementer, &self.backend.implementer),
            (AgentRole::Reviewer, &self.backend.reviewer),
        ] {
            if profile.agent.trim().is_empty() {
                return Err(Error::Config(format!("{} agent name is empty", role)));
            }
        }
        if self.tracker.kind == TrackerKind::Beads && self.tracker.command.trim().is_empty() {
            return Err(Error::Config("tracker.command is empty".into()));
        }
        Ok(())
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
