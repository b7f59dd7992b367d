#![forbid(unsafe_code)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::config::Config;
use crate::core::git::{Git, RebaseOutcome};
use crate::core::naming::{task_slug_base, unique_slug};
use crate::core::process::{Signal, is_alive, send_signal, start_fingerprint};
use crate::core::workspace::{OwnerProbe, WorkspaceManager};
use crate::error::AgentqError;
use crate::task::execution::{ExecutionEngine, ExecutionLimits};
use crate::task::model::{
    FailureReason, MergeStatus, Task, TaskStatus, now_timestamp, parse_timestamp,
};
use crate::task::prompt::{PromptBuilder, REPORT_FILE};
use crate::task::provider::provider_for;
use crate::task::storage::{ProviderFilter, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Completed,
    Failed,
    Stopped,
    /// Never written: derived for a `running` record whose process is gone.
    Stale,
}

impl WorkerStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Stale => "stale",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub pid: u32,
    pub start_fingerprint: Option<String>,
    #[serde(default)]
    pub background: bool,
    pub task_id: Option<i64>,
    pub task_slug: Option<String>,
    /// Provider subprocess, which leads its own process group.
    #[serde(default)]
    pub provider_pid: Option<u32>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: WorkerStatus,
    pub log_file: Option<String>,
    pub worktree: Option<String>,
    pub exit_reason: Option<String>,
}

impl WorkerRecord {
    #[must_use]
    pub fn for_current_process(worker_id: &str) -> Self {
        let pid = std::process::id();
        Self {
            worker_id: worker_id.to_owned(),
            pid,
            start_fingerprint: start_fingerprint(pid),
            background: false,
            task_id: None,
            task_slug: None,
            provider_pid: None,
            started_at: now_timestamp(),
            finished_at: None,
            status: WorkerStatus::Running,
            log_file: None,
            worktree: None,
            exit_reason: None,
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        is_alive(self.pid, self.start_fingerprint.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    dir: PathBuf,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    #[must_use]
    pub fn new_worker_id() -> String {
        let now = OffsetDateTime::now_utc();
        let short = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "w-{:04}{:02}{:02}-{:02}{:02}{:02}-{}",
            now.year(),
            u8::from(now.month()),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            &short[..6]
        )
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn pid_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.pid"))
    }

    #[must_use]
    pub fn log_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.log"))
    }

    /// Goes through a rename so readers never see a half-written file.
    fn write_record(&self, record: &WorkerRecord) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.record_path(&record.worker_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(record)?)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn save(&self, record: &WorkerRecord) -> anyhow::Result<()> {
        self.write_record(record)?;
        let pid_path = self.pid_path(&record.worker_id);
        std::fs::write(&pid_path, format!("{}\n", record.pid))
            .with_context(|| format!("failed to write {}", pid_path.display()))?;
        Ok(())
    }

    /// Writes a placeholder for a worker that is about to start. It carries
    /// no pid and no marker until the worker registers itself.
    pub fn reserve(&self, record: &WorkerRecord) -> anyhow::Result<()> {
        self.write_record(&WorkerRecord {
            pid: 0,
            start_fingerprint: None,
            ..record.clone()
        })
    }

    /// Records the calling process as worker `id`, keeping what a spawning
    /// parent reserved. Only the worker itself writes its pid.
    pub fn register_current(&self, id: &str) -> anyhow::Result<WorkerRecord> {
        let mut record = WorkerRecord::for_current_process(id);
        if let Some(existing) = self.load(id)? {
            record.background = existing.background;
            record.log_file = existing.log_file;
            record.task_id = existing.task_id;
            record.started_at = existing.started_at;
        }
        self.save(&record)?;
        Ok(record)
    }

    pub fn load(&self, id: &str) -> anyhow::Result<Option<WorkerRecord>> {
        let path = self.record_path(id);
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let record = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(record))
    }

    pub fn update<F>(&self, id: &str, f: F) -> anyhow::Result<WorkerRecord>
    where
        F: FnOnce(&mut WorkerRecord),
    {
        let mut record = self
            .load(id)?
            .ok_or_else(|| AgentqError::NotFound(format!("worker {id}")))?;
        f(&mut record);
        self.write_record(&record)?;
        Ok(record)
    }

    pub fn finish(&self, id: &str, status: WorkerStatus, reason: Option<&str>) -> anyhow::Result<()> {
        let _ = self.update(id, |r| {
            r.status = status;
            r.finished_at = Some(now_timestamp());
            r.provider_pid = None;
            r.exit_reason = reason.map(str::to_owned);
        })?;
        let pid_path = self.pid_path(id);
        if pid_path.exists() {
            std::fs::remove_file(&pid_path)
                .with_context(|| format!("failed to remove {}", pid_path.display()))?;
        }
        Ok(())
    }

    /// All records, oldest first. A `running` record whose process fails the
    /// liveness check is reported as `stale` once it has a pid marker, or
    /// once a reservation has gone unclaimed for `RESERVATION_TIMEOUT`.
    pub fn list(&self, include_terminal: bool) -> anyhow::Result<Vec<WorkerRecord>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.dir.display()));
            }
        };
        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let mut record = match self.load(id) {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable worker record");
                    continue;
                }
            };
            if record.status == WorkerStatus::Running
                && !record.is_alive()
                && (self.pid_path(id).exists() || reservation_expired(&record))
            {
                record.status = WorkerStatus::Stale;
            }
            let terminal = !matches!(record.status, WorkerStatus::Running | WorkerStatus::Stale);
            if include_terminal || !terminal {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(out)
    }

    pub fn is_alive(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self
            .load(id)?
            .is_some_and(|r| r.status == WorkerStatus::Running && r.is_alive()))
    }

    pub fn prune(&self, max_age: Duration) -> anyhow::Result<usize> {
        let cutoff = OffsetDateTime::now_utc() - max_age;
        let mut removed = 0;
        for record in self.list(true)? {
            if matches!(record.status, WorkerStatus::Running | WorkerStatus::Stale) {
                continue;
            }
            let finished = record
                .finished_at
                .as_deref()
                .or(Some(record.started_at.as_str()))
                .and_then(parse_timestamp);
            if finished.is_some_and(|t| t < cutoff) {
                for path in [
                    self.record_path(&record.worker_id),
                    self.pid_path(&record.worker_id),
                    self.log_path(&record.worker_id),
                ] {
                    if path.exists() {
                        std::fs::remove_file(&path)
                            .with_context(|| format!("failed to remove {}", path.display()))?;
                    }
                }
                removed += 1;
            }
        }
        Ok(removed)
    }
}

const RESERVATION_TIMEOUT: Duration = Duration::from_secs(60);

fn reservation_expired(record: &WorkerRecord) -> bool {
    record.pid == 0
        && parse_timestamp(&record.started_at)
            .is_none_or(|t| OffsetDateTime::now_utc() - t > RESERVATION_TIMEOUT)
}

/// Workspace liveness backed by the registry: a path is in use while some
/// other live worker records it as its worktree.
pub struct LiveWorkers<'a> {
    pub registry: &'a WorkerRegistry,
    pub exclude: Option<&'a str>,
}

impl OwnerProbe for LiveWorkers<'_> {
    fn path_in_use(&self, path: &Path) -> bool {
        let Ok(workers) = self.registry.list(false) else {
            // Unknown ownership is treated as in use.
            return true;
        };
        workers.iter().any(|w| {
            Some(w.worker_id.as_str()) != self.exclude
                && w.status == WorkerStatus::Running
                && w.worktree.as_deref().is_some_and(|p| Path::new(p) == path)
                && w.is_alive()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Fresh,
    /// Continue the provider session, keeping every counter.
    Resume {
        session_id: String,
        message: Option<String>,
    },
    /// New session with counters reset, same workspace policy as fresh.
    Retry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Idle,
    Finished {
        task_id: i64,
        status: TaskStatus,
        failure_reason: Option<FailureReason>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclaimReport {
    pub released: Vec<i64>,
    pub workspaces: Vec<PathBuf>,
    pub pruned_workers: usize,
}

pub struct Coordinator {
    cfg: Config,
    store: TaskStore,
    registry: WorkerRegistry,
    workspaces: WorkspaceManager,
    worker_id: String,
    filter: Option<ProviderFilter>,
    stop: watch::Receiver<bool>,
}

impl Coordinator {
    pub fn open(cfg: Config, worker_id: String, stop: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let store = TaskStore::open_with_retries(&cfg.db_path(), cfg.workers.store_busy_retries)
            .with_context(|| format!("failed to open {}", cfg.db_path().display()))?;
        let git = Git::from_dir(&cfg.project_dir)?;
        Ok(Self {
            registry: WorkerRegistry::new(cfg.workers_dir()),
            workspaces: WorkspaceManager::new(git, cfg.clone()),
            store,
            cfg,
            worker_id,
            filter: None,
            stop,
        })
    }

    #[must_use]
    pub fn with_provider_filter(mut self, filter: ProviderFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    #[must_use]
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    #[must_use]
    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn register(&self) -> anyhow::Result<()> {
        let _ = self.registry.register_current(&self.worker_id)?;
        Ok(())
    }

    pub async fn run_one(&self) -> anyhow::Result<RunOutcome> {
        let Some(task) = self
            .store
            .claim_next_eligible(self.filter.as_ref(), &self.worker_id)?
        else {
            return Ok(RunOutcome::Idle);
        };
        Ok(self.drive(task, Attempt::Fresh).await)
    }

    pub async fn run_task(&self, reference: &str) -> anyhow::Result<RunOutcome> {
        let task = self.store.resolve(reference)?;
        let Some(claimed) = self
            .store
            .claim_specific(task.id, &[TaskStatus::Pending], &self.worker_id)?
        else {
            anyhow::bail!("task {} is {} and cannot be started", task.label(), task.status);
        };
        Ok(self.drive(claimed, Attempt::Fresh).await)
    }

    pub async fn run_loop(&self, count: Option<usize>, wait: bool) -> anyhow::Result<LoopSummary> {
        let mut summary = LoopSummary::default();
        let poll = Duration::from_secs(self.cfg.workers.poll_interval_secs);
        let mut stop = self.stop.clone();
        loop {
            if self.stop_requested() {
                tracing::info!(worker_id = %self.worker_id, "stop requested, leaving loop");
                break;
            }
            if count.is_some_and(|c| summary.completed + summary.failed >= c) {
                break;
            }
            match self.run_one().await? {
                RunOutcome::Idle if wait => {
                    tracing::debug!(worker_id = %self.worker_id, "queue empty, polling");
                    tokio::select! {
                        () = tokio::time::sleep(poll) => {}
                        res = stop.wait_for(|s| *s) => {
                            if res.is_err() {
                                tokio::time::sleep(poll).await;
                            }
                        }
                    }
                }
                RunOutcome::Idle => break,
                RunOutcome::Finished { status, .. } => {
                    if status == TaskStatus::Completed {
                        summary.completed += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    pub async fn resume(&self, reference: &str, message: Option<String>) -> anyhow::Result<RunOutcome> {
        let task = self.store.resolve(reference)?;
        let Some(session_id) = task.session_id.clone() else {
            anyhow::bail!("task {} has no session to resume", task.label());
        };
        let Some(claimed) = self
            .store
            .claim_specific(task.id, &[TaskStatus::Failed], &self.worker_id)?
        else {
            anyhow::bail!("only failed tasks can be resumed; {} is {}", task.label(), task.status);
        };
        Ok(self
            .drive(claimed, Attempt::Resume { session_id, message })
            .await)
    }

    pub async fn retry(&self, reference: &str) -> anyhow::Result<RunOutcome> {
        let task = self.store.resolve(reference)?;
        let Some(claimed) = self.store.claim_specific(
            task.id,
            &[TaskStatus::Failed, TaskStatus::Completed],
            &self.worker_id,
        )?
        else {
            anyhow::bail!("task {} is {} and cannot be retried", task.label(), task.status);
        };
        Ok(self.drive(claimed, Attempt::Retry).await)
    }

    /// Drives a claimed task, turning any error into a recorded failure so a
    /// single task can never take the loop down with it.
    pub async fn drive(&self, mut task: Task, attempt: Attempt) -> RunOutcome {
        if let Err(e) = self.registry.update(&self.worker_id, |r| {
            r.task_id = Some(task.id);
            r.task_slug.clone_from(&task.slug);
        }) {
            tracing::debug!(worker_id = %self.worker_id, error = %e, "worker not registered");
        }

        if let Err(e) = self.drive_inner(&mut task, &attempt).await {
            let reason = match e.downcast_ref::<AgentqError>() {
                Some(AgentqError::WorkspaceConflict { .. }) => FailureReason::WorkspaceConflict,
                Some(AgentqError::UnknownProvider(_) | AgentqError::ProviderProcess(_)) => {
                    FailureReason::ProviderError
                }
                _ => FailureReason::Unknown,
            };
            tracing::error!(task_id = task.id, error = %format!("{e:#}"), %reason, "task attempt failed");
            task.status = TaskStatus::Failed;
            task.failure_reason = Some(reason);
            task.completed_at = Some(now_timestamp());
            if let Err(e) = self.store.update(&task) {
                tracing::error!(task_id = task.id, error = %e, "could not record task failure");
            }
        }

        if let Err(e) = self.registry.update(&self.worker_id, |r| r.provider_pid = None) {
            tracing::debug!(worker_id = %self.worker_id, error = %e, "worker not registered");
        }

        RunOutcome::Finished {
            task_id: task.id,
            status: task.status,
            failure_reason: task.failure_reason,
        }
    }

    async fn drive_inner(&self, task: &mut Task, attempt: &Attempt) -> anyhow::Result<()> {
        match attempt {
            Attempt::Fresh | Attempt::Retry => task.reset_metrics(),
            Attempt::Resume { .. } => {
                task.failure_reason = None;
                task.completed_at = None;
            }
        }

        if task.slug.is_none() {
            let base = task_slug_base(&task.prompt, OffsetDateTime::now_utc().date());
            task.slug = Some(unique_slug(&base, |s| self.store.slug_taken(s))?);
        }
        self.store.update(task)?;

        let source = match task.based_on {
            Some(id) => self.store.find(id)?,
            None => None,
        };
        let probe = LiveWorkers {
            registry: &self.registry,
            exclude: Some(&self.worker_id),
        };
        let workspace = self.workspaces.prepare(task, source.as_ref(), &probe, false)?;
        task.branch.clone_from(&workspace.branch);
        task.worktree_path = Some(workspace.path.to_string_lossy().into_owned());
        let provider_name = self.cfg.effective_provider(task);
        task.provider = Some(provider_name.clone());
        let model = self.cfg.effective_model(task);
        self.store.update(task)?;

        let _ = self.registry.update(&self.worker_id, |r| {
            r.task_slug.clone_from(&task.slug);
            r.worktree.clone_from(&task.worktree_path);
        });

        let report_in_worktree = workspace.path.join(REPORT_FILE);
        let (prompt, resume) = match attempt {
            Attempt::Resume {
                session_id,
                message,
            } => (
                PromptBuilder::resume(message.as_deref()),
                Some(session_id.as_str()),
            ),
            Attempt::Fresh | Attempt::Retry => {
                if report_in_worktree.exists() {
                    std::fs::remove_file(&report_in_worktree).with_context(|| {
                        format!("failed to remove {}", report_in_worktree.display())
                    })?;
                }
                let tasks = self.store.all_by_id()?;
                (
                    PromptBuilder::new(&self.cfg.project_dir, &tasks).build(task, &workspace.path),
                    None,
                )
            }
        };

        let provider = provider_for(&provider_name, &self.cfg)?;
        let limits = ExecutionLimits::for_task(&self.cfg, task);
        let record_pid = |pid: u32| {
            let _ = self.registry.update(&self.worker_id, |r| r.provider_pid = Some(pid));
        };
        let engine = ExecutionEngine::new(
            &self.store,
            provider.as_ref(),
            limits,
            self.cfg.logs_dir(),
            self.stop.clone(),
        )
        .on_spawn(&record_pid);
        let result = engine
            .execute(task, &workspace.path, &prompt, resume, model.as_deref())
            .await?;

        if report_in_worktree.exists() {
            let content = std::fs::read_to_string(&report_in_worktree)
                .with_context(|| format!("failed to read {}", report_in_worktree.display()))?;
            let reports = self.cfg.reports_dir();
            std::fs::create_dir_all(&reports)
                .with_context(|| format!("failed to create {}", reports.display()))?;
            let name = format!("{}.md", task.label().trim_start_matches('#'));
            std::fs::write(reports.join(&name), &content)
                .with_context(|| format!("failed to write report {name}"))?;
            task.report_file = Some(format!("{}/reports/{name}", crate::config::STATE_DIR));
            task.output_content = Some(content);
        } else if result.last_output.is_some() {
            task.output_content.clone_from(&result.last_output);
        }

        let outcome = self
            .workspaces
            .finalize(task, result.status == TaskStatus::Completed)?;
        outcome.apply(task);
        if task.status == TaskStatus::Completed
            && task.task_type.produces_code()
            && !outcome.has_commits
        {
            tracing::warn!(task_id = task.id, "completed without commits");
            task.status = TaskStatus::Failed;
            task.failure_reason = Some(FailureReason::NoChanges);
        }
        self.store.update(task)?;

        tracing::info!(
            task_id = task.id,
            slug = task.slug.as_deref().unwrap_or(""),
            status = %task.status,
            reason = task.failure_reason.map(FailureReason::as_str),
            steps = result.steps,
            "task finished"
        );
        Ok(())
    }

    pub fn rebase(&self, reference: &str, onto: Option<&str>) -> anyhow::Result<RebaseOutcome> {
        let task = self.store.resolve(reference)?;
        Ok(self.workspaces.rebase(&task, onto)?)
    }

    pub fn mark_merged(&self, reference: &str, verify: bool) -> anyhow::Result<bool> {
        let task = self.store.resolve(reference)?;
        if task.branch.is_none() {
            anyhow::bail!("task {} has no branch", task.label());
        }
        if verify && !self.workspaces.is_merged(&task)? {
            anyhow::bail!("branch of task {} is not merged yet", task.label());
        }
        if task.merge_status.is_none() {
            let _ = self.store.set_merge_status(task.id, MergeStatus::Unmerged)?;
        }
        Ok(self.store.set_merge_status(task.id, MergeStatus::Merged)?)
    }

    pub fn reclaim(&self, max_age: Duration) -> anyhow::Result<ReclaimReport> {
        let mut report = ReclaimReport::default();
        for task in self.store.get_in_progress()? {
            let owner_alive = match task.worker_id.as_deref() {
                Some(id) => self.registry.is_alive(id)?,
                None => false,
            };
            if owner_alive {
                continue;
            }
            if self.store.release_claim(task.id, task.worker_id.as_deref())? {
                tracing::warn!(task_id = task.id, worker_id = task.worker_id.as_deref(), "released orphaned task");
                report.released.push(task.id);
                if let Some(id) = task.worker_id.as_deref()
                    && let Ok(Some(record)) = self.registry.load(id)
                    && record.status == WorkerStatus::Running
                {
                    self.registry
                        .finish(id, WorkerStatus::Failed, Some("reclaimed: process gone"))?;
                }
            }
        }

        let tasks = self.store.all_by_id()?;
        let probe = LiveWorkers {
            registry: &self.registry,
            exclude: Some(&self.worker_id),
        };
        report.workspaces = self.workspaces.reclaim_stale(&tasks, max_age, &probe)?;
        report.pruned_workers = self.registry.prune(max_age)?;
        Ok(report)
    }
}

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SpawnSpec {
    pub fn current_exe(project_dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            program: std::env::current_exe().context("failed to locate own executable")?,
            args: vec![
                "--project".to_owned(),
                project_dir.to_string_lossy().into_owned(),
            ],
        })
    }
}

/// Starts a detached worker in its own process group. The registry only
/// gets a reservation; the worker writes its own pid when it registers.
pub fn spawn_background(
    registry: &WorkerRegistry,
    spec: &SpawnSpec,
    task: Option<&str>,
) -> anyhow::Result<WorkerRecord> {
    use std::os::unix::process::CommandExt as _;

    let worker_id = WorkerRegistry::new_worker_id();
    std::fs::create_dir_all(&registry.dir)
        .with_context(|| format!("failed to create {}", registry.dir.display()))?;
    let log_path = registry.log_path(&worker_id);
    let log = File::create(&log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    let log_err = log.try_clone()?;

    let mut record = WorkerRecord {
        worker_id: worker_id.clone(),
        pid: 0,
        start_fingerprint: None,
        background: true,
        task_id: None,
        task_slug: None,
        provider_pid: None,
        started_at: now_timestamp(),
        finished_at: None,
        status: WorkerStatus::Running,
        log_file: Some(log_path.to_string_lossy().into_owned()),
        worktree: None,
        exit_reason: None,
    };
    registry.reserve(&record)?;

    let mut cmd = std::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .args(["worker", "--worker-id", &worker_id]);
    if let Some(task) = task {
        cmd.args(["--task", task]);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .process_group(0);
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            registry.finish(&worker_id, WorkerStatus::Failed, Some("spawn failed"))?;
            return Err(e).with_context(|| format!("failed to start {}", spec.program.display()));
        }
    };
    let pid = child.id();
    record.pid = pid;
    record.start_fingerprint = start_fingerprint(pid);
    tracing::info!(worker_id = %record.worker_id, pid, "spawned background worker");
    Ok(record)
}

/// Signals a worker. A graceful stop lets the worker record its own task as
/// interrupted; a forced stop kills it and its provider, then records the
/// interruption on its behalf.
pub async fn stop_worker(
    registry: &WorkerRegistry,
    store: &TaskStore,
    worker_id: &str,
    force: bool,
    grace: Duration,
) -> anyhow::Result<bool> {
    let record = registry
        .load(worker_id)?
        .ok_or_else(|| AgentqError::NotFound(format!("worker {worker_id}")))?;
    if record.status != WorkerStatus::Running || !record.is_alive() {
        tracing::info!(worker_id, "worker is not running");
        return Ok(false);
    }

    let signal = if force { Signal::Kill } else { Signal::Term };
    send_signal(record.pid, signal, record.background)?;
    if force {
        if let Some(provider) = record.provider_pid {
            let _ = send_signal(provider, Signal::Kill, true);
        }
        if let Some(task_id) = record.task_id {
            let mut task = store.get(task_id)?;
            if task.status == TaskStatus::InProgress
                && task.worker_id.as_deref() == Some(worker_id)
            {
                task.status = TaskStatus::Failed;
                task.failure_reason = Some(FailureReason::Interrupted);
                task.completed_at = Some(now_timestamp());
                store.update(&task)?;
            }
        }
        registry.finish(worker_id, WorkerStatus::Stopped, Some("killed"))?;
        return Ok(true);
    }

    // The worker gives its provider `grace` before escalating, so allow for
    // that plus its own shutdown.
    let deadline = tokio::time::Instant::now() + grace * 2 + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if !record.is_alive() {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::warn!(worker_id, "worker still running after stop request");
    Ok(false)
}

pub fn install_stop_handler() -> anyhow::Result<watch::Receiver<bool>> {
    use tokio::signal::unix::{SignalKind, signal};

    let (tx, rx) = watch::channel(false);
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        tracing::warn!("stop signal received");
        let _ = tx.send(true);
    });
    Ok(rx)
}
