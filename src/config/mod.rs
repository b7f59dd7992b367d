#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::core::naming::validate_branch_pattern;
use crate::error::AgentqError;
use crate::task::model::Task;

pub const CONFIG_FILE: &str = "agentq.toml";
pub const STATE_DIR: &str = ".agentq";
pub const DEFAULT_MAX_STEPS: u32 = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory holding `agentq.toml`; also the repository the tasks run against.
    #[serde(skip)]
    pub project_dir: PathBuf,

    pub project_name: String,
    pub provider: String,
    pub model: Option<String>,
    pub timeout_minutes: u64,
    pub max_steps: Option<u32>,
    /// Legacy name for `max_steps`.
    pub max_turns: Option<u32>,
    pub worktree_dir: String,
    pub auto_commit: bool,
    pub branch_strategy: BranchStrategyConfig,
    pub task_types: BTreeMap<String, TaskTypeConfig>,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub workers: WorkersConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            project_name: String::new(),
            provider: "claude".to_owned(),
            model: None,
            timeout_minutes: 10,
            max_steps: None,
            max_turns: None,
            worktree_dir: "/tmp/agentq-worktrees".to_owned(),
            auto_commit: true,
            branch_strategy: BranchStrategyConfig::default(),
            task_types: BTreeMap::new(),
            providers: BTreeMap::new(),
            workers: WorkersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BranchStrategyConfig {
    pub pattern: String,
    pub default_type: String,
}

impl Default for BranchStrategyConfig {
    fn default() -> Self {
        Self {
            pattern: "{project}/{task_id}".to_owned(),
            default_type: "feature".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskTypeConfig {
    pub model: Option<String>,
    pub max_steps: Option<u32>,
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Defaults to the provider name looked up on `PATH`.
    pub executable: Option<String>,
    /// Extra arguments placed before the provider's own.
    pub args: Vec<String>,
    pub model: Option<String>,
    pub task_types: BTreeMap<String, TaskTypeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkersConfig {
    pub poll_interval_secs: u64,
    pub stop_grace_secs: u64,
    pub reclaim_age_days: u64,
    pub store_busy_retries: u32,
    pub lock_timeout_secs: u64,
    pub metrics_flush_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            stop_grace_secs: 10,
            reclaim_age_days: 7,
            store_busy_retries: 8,
            lock_timeout_secs: 30,
            metrics_flush_secs: 5,
        }
    }
}

pub fn load(project_dir: &Path) -> anyhow::Result<Config> {
    let mut cfg = load_from_file(&project_dir.join(CONFIG_FILE))?;
    cfg.project_dir = project_dir.to_path_buf();
    if cfg.project_name.trim().is_empty() {
        cfg.project_name = project_dir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("project")
            .to_owned();
    }
    cfg.validate()?;
    Ok(cfg)
}

fn load_from_file(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse TOML in {}", path.display()))
}

impl Config {
    pub fn validate(&self) -> Result<(), AgentqError> {
        if self.provider.trim().is_empty() {
            return Err(AgentqError::Config("provider must not be empty".to_owned()));
        }
        if self.timeout_minutes == 0 {
            return Err(AgentqError::Config(
                "timeout_minutes must be >= 1".to_owned(),
            ));
        }
        if self.max_steps == Some(0) || self.max_turns == Some(0) {
            return Err(AgentqError::Config(
                "max_steps/max_turns must be >= 1".to_owned(),
            ));
        }
        if self.worktree_dir.trim().is_empty() {
            return Err(AgentqError::Config(
                "worktree_dir must not be empty".to_owned(),
            ));
        }
        validate_branch_pattern(&self.branch_strategy.pattern)?;
        for name in self
            .task_types
            .keys()
            .chain(self.providers.values().flat_map(|p| p.task_types.keys()))
        {
            name.parse::<crate::task::model::TaskType>()
                .map_err(|_| AgentqError::Config(format!("unknown task type '{name}'")))?;
        }
        if self.workers.store_busy_retries == 0 {
            return Err(AgentqError::Config(
                "workers.store_busy_retries must be >= 1".to_owned(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.project_dir.join(STATE_DIR)
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("agentq.db")
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    #[must_use]
    pub fn workers_dir(&self) -> PathBuf {
        self.state_dir().join("workers")
    }

    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.state_dir().join("reports")
    }

    #[must_use]
    pub fn wip_dir(&self) -> PathBuf {
        self.state_dir().join("wip")
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("repo.lock")
    }

    pub fn worktree_base(&self) -> anyhow::Result<PathBuf> {
        expand_path(&self.worktree_dir)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    #[must_use]
    pub fn effective_provider(&self, task: &Task) -> String {
        task.provider.clone().unwrap_or_else(|| self.provider.clone())
    }

    #[must_use]
    pub fn effective_model(&self, task: &Task) -> Option<String> {
        if task.model.is_some() {
            return task.model.clone();
        }
        let provider = self.providers.get(&self.effective_provider(task));
        let task_type = task.task_type.as_str();
        provider
            .and_then(|p| p.task_types.get(task_type))
            .and_then(|t| t.model.clone())
            .or_else(|| self.task_types.get(task_type).and_then(|t| t.model.clone()))
            .or_else(|| provider.and_then(|p| p.model.clone()))
            .or_else(|| self.model.clone())
    }

    /// Step budget, most specific first. `max_turns` is accepted wherever
    /// `max_steps` is, one level below it.
    #[must_use]
    pub fn effective_max_steps(&self, task: &Task) -> u32 {
        let task_type = task.task_type.as_str();
        let provider_type = self
            .providers
            .get(&self.effective_provider(task))
            .and_then(|p| p.task_types.get(task_type));
        let global_type = self.task_types.get(task_type);

        task.max_steps
            .or(task.max_turns)
            .or_else(|| provider_type.and_then(|t| t.max_steps))
            .or_else(|| provider_type.and_then(|t| t.max_turns))
            .or_else(|| global_type.and_then(|t| t.max_steps))
            .or_else(|| global_type.and_then(|t| t.max_turns))
            .or(self.max_steps)
            .or(self.max_turns)
            .unwrap_or(DEFAULT_MAX_STEPS)
    }

    pub fn resolved_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    input.to_owned()
}

pub fn expand_path(input: &str) -> anyhow::Result<PathBuf> {
    let expanded = expand_env_vars(&expand_tilde(input));
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(cwd.join(p))
}

fn expand_env_vars(input: &str) -> String {
    // Unknown variables are left as written.
    let Ok(re) = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?") else {
        return input.to_owned();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::{TaskDraft, TaskType};

    fn task(task_type: TaskType) -> Task {
        let draft = TaskDraft {
            task_type,
            ..TaskDraft::new("p")
        };
        Task::from_draft(1, &draft, String::new())
    }

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn validation_catches_invalid_values() {
        let mut cfg = Config::default();
        cfg.branch_strategy.pattern = "bad..pattern".to_owned();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.task_types
            .insert("deploy".to_owned(), TaskTypeConfig::default());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn step_budget_precedence() {
        let mut cfg = Config::default();
        let mut t = task(TaskType::Implement);
        assert_eq!(cfg.effective_max_steps(&t), DEFAULT_MAX_STEPS);

        cfg.max_turns = Some(40);
        assert_eq!(cfg.effective_max_steps(&t), 40);
        cfg.max_steps = Some(30);
        assert_eq!(cfg.effective_max_steps(&t), 30);

        cfg.task_types.insert(
            "implement".to_owned(),
            TaskTypeConfig {
                max_turns: Some(25),
                ..TaskTypeConfig::default()
            },
        );
        assert_eq!(cfg.effective_max_steps(&t), 25);

        let mut provider = ProviderConfig::default();
        provider.task_types.insert(
            "implement".to_owned(),
            TaskTypeConfig {
                max_steps: Some(15),
                ..TaskTypeConfig::default()
            },
        );
        cfg.providers.insert("claude".to_owned(), provider);
        assert_eq!(cfg.effective_max_steps(&t), 15);

        // A different provider does not see claude's override.
        t.provider = Some("codex".to_owned());
        assert_eq!(cfg.effective_max_steps(&t), 25);

        t.max_turns = Some(9);
        assert_eq!(cfg.effective_max_steps(&t), 9);
        t.max_steps = Some(7);
        assert_eq!(cfg.effective_max_steps(&t), 7);
    }

    #[test]
    fn model_resolution_prefers_most_specific() {
        let mut cfg = Config {
            model: Some("global".to_owned()),
            ..Config::default()
        };
        let t = task(TaskType::Review);
        assert_eq!(cfg.effective_model(&t).as_deref(), Some("global"));

        cfg.providers.insert(
            "claude".to_owned(),
            ProviderConfig {
                model: Some("provider".to_owned()),
                ..ProviderConfig::default()
            },
        );
        assert_eq!(cfg.effective_model(&t).as_deref(), Some("provider"));

        cfg.task_types.insert(
            "review".to_owned(),
            TaskTypeConfig {
                model: Some("review-model".to_owned()),
                ..TaskTypeConfig::default()
            },
        );
        assert_eq!(cfg.effective_model(&t).as_deref(), Some("review-model"));
    }

    #[test]
    fn loads_project_file_and_fills_project_name() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("shop");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(
            project.join(CONFIG_FILE),
            r#"
provider = "codex"
timeout_minutes = 3

[workers]
stop_grace_secs = 2

[providers.codex]
executable = "/opt/codex"
"#,
        )
        .unwrap();

        let cfg = load(&project).unwrap();
        assert_eq!(cfg.project_name, "shop");
        assert_eq!(cfg.provider, "codex");
        assert_eq!(cfg.timeout(), Duration::from_secs(180));
        assert_eq!(cfg.workers.stop_grace_secs, 2);
        assert_eq!(cfg.workers.poll_interval_secs, 5);
        assert_eq!(
            cfg.providers["codex"].executable.as_deref(),
            Some("/opt/codex")
        );
        assert_eq!(cfg.db_path(), project.join(".agentq/agentq.db"));
    }

    #[test]
    fn expands_env_vars_in_paths() {
        // HOME is always set in test environments on unix.
        let home = std::env::var("HOME").unwrap();
        assert_eq!(
            expand_path("$HOME/wt").unwrap(),
            PathBuf::from(format!("{home}/wt"))
        );
        assert_eq!(expand_tilde("~/x"), format!("{home}/x"));
        assert_eq!(expand_env_vars("$AGENTQ_SURELY_UNSET_VAR/a"), "$AGENTQ_SURELY_UNSET_VAR/a");
    }
}
