#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::config::Config;
use crate::core::process::{Signal, send_signal};
use crate::task::model::{FailureReason, Task, TaskStatus, now_timestamp};
use crate::task::provider::{Event, Provider, RunRequest, Usage};
use crate::task::storage::TaskStore;

static FAILURE_MARKER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[AGENTQ_FAILURE:([A-Z_]+)\]").ok());

/// Last well-formed `[AGENTQ_FAILURE:<REASON>]` marker in `text`.
#[must_use]
pub fn scan_failure_marker(text: &str) -> Option<FailureReason> {
    let re = FAILURE_MARKER.as_ref()?;
    re.captures_iter(text)
        .filter_map(|c| c[1].parse::<FailureReason>().ok())
        .last()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub max_steps: u32,
    pub stop_grace: Duration,
    pub metrics_flush: Duration,
}

impl ExecutionLimits {
    #[must_use]
    pub fn for_task(cfg: &Config, task: &Task) -> Self {
        Self {
            timeout: cfg.timeout(),
            max_steps: cfg.effective_max_steps(task),
            stop_grace: Duration::from_secs(cfg.workers.stop_grace_secs),
            metrics_flush: Duration::from_secs(cfg.workers.metrics_flush_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    NotStarted,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl AttemptState {
    fn advance(self, to: Self) -> Self {
        debug_assert!(
            matches!(
                (self, to),
                (Self::NotStarted, Self::Running)
                    | (Self::Running, Self::Completed | Self::Failed | Self::TimedOut)
            ),
            "invalid attempt transition {self:?} -> {to:?}"
        );
        to
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub state: AttemptState,
    pub status: TaskStatus,
    pub failure_reason: Option<FailureReason>,
    pub exit_code: Option<i32>,
    /// Steps across every attempt of the task, not just this one.
    pub steps: u32,
    pub session_id: Option<String>,
    pub duration: Duration,
    /// Final text the agent produced, if any.
    pub last_output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub task_id: i64,
    pub attempt: u32,
    pub seq: u64,
    pub event: Event,
}

#[derive(Debug)]
pub struct EventLog {
    file: tokio::fs::File,
    path: PathBuf,
    task_id: i64,
    attempt: u32,
    seq: u64,
}

impl EventLog {
    #[must_use]
    pub fn path_for(logs_dir: &Path, task: &Task) -> PathBuf {
        logs_dir.join(format!("{}.jsonl", task.label().trim_start_matches('#')))
    }

    pub async fn open(path: &Path, task_id: i64) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let attempt = match tokio::fs::read_to_string(path).await {
            Ok(existing) => last_attempt(&existing) + 1,
            Err(_) => 1,
        };
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            task_id,
            attempt,
            seq: 0,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub async fn append(&mut self, event: &Event) -> anyhow::Result<()> {
        self.seq += 1;
        let record = LogRecord {
            timestamp: now_timestamp(),
            task_id: self.task_id,
            attempt: self.attempt,
            seq: self.seq,
            event: event.clone(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        Ok(())
    }
}

fn last_attempt(existing: &str) -> u32 {
    existing
        .lines()
        .rev()
        .find_map(|l| serde_json::from_str::<LogRecord>(l).ok())
        .map_or(0, |r| r.attempt)
}

pub fn read_log(path: &Path) -> anyhow::Result<Vec<LogRecord>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(data
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

enum Ending {
    Exited(Option<i32>),
    StepBudget,
    TimedOut,
    Interrupted,
}

#[derive(Debug, Clone, Copy)]
struct Tally {
    base_steps: u32,
    base_usage: Usage,
    base_duration: f64,
    run_steps: u32,
    run_usage: Usage,
}

impl Tally {
    fn seeded(task: &Task) -> Self {
        Self {
            base_steps: task.num_steps_computed.unwrap_or(0),
            base_usage: Usage {
                input_tokens: task.input_tokens.unwrap_or(0),
                output_tokens: task.output_tokens.unwrap_or(0),
                cost_usd: task.cost_usd,
            },
            base_duration: task.duration_seconds.unwrap_or(0.0),
            run_steps: 0,
            run_usage: Usage::default(),
        }
    }

    fn steps(&self) -> u32 {
        self.base_steps + self.run_steps
    }

    fn apply(&self, task: &mut Task, elapsed: Duration) {
        let usage = self.base_usage.plus(self.run_usage);
        task.num_steps_computed = Some(self.steps());
        task.input_tokens = Some(usage.input_tokens);
        task.output_tokens = Some(usage.output_tokens);
        task.cost_usd = usage.cost_usd;
        task.duration_seconds = Some(self.base_duration + elapsed.as_secs_f64());
    }
}

pub struct ExecutionEngine<'a> {
    store: &'a TaskStore,
    provider: &'a dyn Provider,
    limits: ExecutionLimits,
    logs_dir: PathBuf,
    stop: watch::Receiver<bool>,
    spawn_hook: Option<&'a dyn Fn(u32)>,
}

impl<'a> ExecutionEngine<'a> {
    #[must_use]
    pub fn new(
        store: &'a TaskStore,
        provider: &'a dyn Provider,
        limits: ExecutionLimits,
        logs_dir: PathBuf,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            provider,
            limits,
            logs_dir,
            stop,
            spawn_hook: None,
        }
    }

    #[must_use]
    pub fn on_spawn(mut self, hook: &'a dyn Fn(u32)) -> Self {
        self.spawn_hook = Some(hook);
        self
    }

    /// Runs the provider for `task` in `work_dir` and records the outcome.
    ///
    /// With `resume`, the provider continues that session and step/usage
    /// counters carry on from the task's current values; callers starting a
    /// fresh session reset the task's metrics first. The task's terminal
    /// status and failure reason are written before returning.
    pub async fn execute(
        &self,
        task: &mut Task,
        work_dir: &Path,
        prompt: &str,
        resume: Option<&str>,
        model: Option<&str>,
    ) -> anyhow::Result<ExecutionResult> {
        let mut state = AttemptState::NotStarted;
        let log_path = EventLog::path_for(&self.logs_dir, task);
        let mut log = EventLog::open(&log_path, task.id).await?;
        task.log_file = Some(log_path.to_string_lossy().into_owned());

        let invocation = self.provider.invocation(&RunRequest {
            prompt,
            work_dir,
            resume,
            model,
            max_steps: self.limits.max_steps,
        });
        let mut adapter = self.provider.adapter();
        let mut tally = Tally::seeded(task);

        tracing::info!(
            task_id = task.id,
            provider = self.provider.name(),
            attempt = log.attempt(),
            resume = resume.is_some(),
            max_steps = self.limits.max_steps,
            "starting provider"
        );

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(work_dir)
            .env("AGENTQ_TASK_ID", task.id.to_string())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to start {}: {e}", invocation.program);
                tracing::error!(task_id = task.id, %message);
                log.append(&Event::RunError {
                    message: message.clone(),
                    reason: Some(FailureReason::ProviderError),
                })
                .await?;
                state = state.advance(AttemptState::Running);
                return self.finish(
                    task,
                    &tally,
                    state.advance(AttemptState::Failed),
                    Some(FailureReason::ProviderError),
                    None,
                    started.elapsed(),
                    None,
                    Some(message),
                );
            }
        };
        state = state.advance(AttemptState::Running);
        if let (Some(hook), Some(pid)) = (self.spawn_hook, child.id()) {
            hook(pid);
        }
        self.store.update(task)?;

        if let (Some(input), Some(mut stdin)) = (invocation.stdin.as_deref(), child.stdin.take())
        {
            // A provider that exits without reading stdin is not an error here.
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                tracing::debug!(task_id = task.id, error = %e, "provider closed stdin early");
            }
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .context("provider stdout was not captured")?;
        let stderr = child
            .stderr
            .take()
            .context("provider stderr was not captured")?;
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let (mut stdout_done, mut stderr_done) = (false, false);

        let deadline = tokio::time::sleep(self.limits.timeout);
        tokio::pin!(deadline);
        let mut stop = self.stop.clone();
        let mut stop_closed = false;

        let mut marker: Option<FailureReason> = None;
        let mut provider_error: Option<(String, Option<FailureReason>)> = None;
        let mut last_output: Option<String> = None;
        let mut last_flush = Instant::now();

        let ending = loop {
            let events = tokio::select! {
                line = stdout.next_line(), if !stdout_done => match line {
                    Ok(Some(line)) => {
                        if let Some(m) = scan_failure_marker(&line) {
                            marker = Some(m);
                        }
                        adapter.translate(&line)
                    }
                    Ok(None) => { stdout_done = true; Vec::new() }
                    Err(e) => {
                        tracing::warn!(task_id = task.id, error = %e, "reading provider stdout");
                        stdout_done = true;
                        Vec::new()
                    }
                },
                line = stderr.next_line(), if !stderr_done => match line {
                    Ok(Some(line)) => {
                        if let Some(m) = scan_failure_marker(&line) {
                            marker = Some(m);
                        }
                        tracing::debug!(task_id = task.id, stderr = %line);
                        vec![Event::Output { text: line }]
                    }
                    Ok(None) | Err(_) => { stderr_done = true; Vec::new() }
                },
                status = child.wait(), if stdout_done && stderr_done => {
                    let code = status.context("waiting for provider")?.code();
                    break Ending::Exited(code);
                }
                () = &mut deadline => break Ending::TimedOut,
                requested = stop.wait_for(|s| *s), if !stop_closed => {
                    if requested.is_ok() {
                        break Ending::Interrupted;
                    }
                    stop_closed = true;
                    Vec::new()
                }
            };

            let mut over_budget = false;
            let mut flush_now = false;
            for event in events {
                match &event {
                    Event::SessionStarted { session_id } => {
                        task.session_id = Some(session_id.clone());
                        flush_now = true;
                    }
                    Event::StepStarted { .. } => {
                        tally.run_steps += 1;
                        flush_now |= last_flush.elapsed() >= self.limits.metrics_flush;
                        if tally.steps() > self.limits.max_steps {
                            over_budget = true;
                        }
                    }
                    Event::StepProgress {
                        usage: Some(usage), ..
                    } => tally.run_usage = tally.run_usage.plus(*usage),
                    Event::RunCompleted {
                        usage,
                        session_id,
                        num_steps_reported,
                    } => {
                        if let Some(usage) = usage {
                            tally.run_usage = *usage;
                        }
                        if let Some(id) = session_id {
                            task.session_id = Some(id.clone());
                        }
                        if let Some(n) = num_steps_reported {
                            task.num_steps_reported = Some(*n);
                            task.num_turns_reported = Some(*n);
                        }
                    }
                    Event::RunError { message, reason } => {
                        tracing::warn!(task_id = task.id, %message, "provider reported error");
                        provider_error = Some((message.clone(), *reason));
                    }
                    Event::Output { text } => {
                        if let Some(m) = scan_failure_marker(text) {
                            marker = Some(m);
                        }
                        if !text.trim().is_empty() {
                            last_output = Some(text.clone());
                        }
                    }
                    Event::StepProgress { usage: None, .. } | Event::StepCompleted => {}
                }
                log.append(&event).await?;
                if over_budget {
                    break;
                }
            }

            if flush_now {
                tally.apply(task, started.elapsed());
                self.store.update(task)?;
                last_flush = Instant::now();
            }
            if over_budget {
                break Ending::StepBudget;
            }
        };

        if !matches!(ending, Ending::Exited(_)) {
            self.terminate(&mut child, task.id).await;
        }
        let elapsed = started.elapsed();

        let (next_state, reason, exit_code, error) = match ending {
            Ending::StepBudget => {
                tracing::warn!(task_id = task.id, steps = tally.steps(), "step budget exceeded");
                (
                    AttemptState::Failed,
                    Some(FailureReason::MaxSteps),
                    None,
                    Some(format!("exceeded {} steps", self.limits.max_steps)),
                )
            }
            Ending::TimedOut => {
                tracing::warn!(task_id = task.id, ?elapsed, "provider timed out");
                (
                    AttemptState::TimedOut,
                    Some(FailureReason::Timeout),
                    None,
                    Some(format!("timed out after {:?}", self.limits.timeout)),
                )
            }
            Ending::Interrupted => {
                tracing::warn!(task_id = task.id, "interrupted by stop request");
                (
                    AttemptState::Failed,
                    Some(FailureReason::Interrupted),
                    None,
                    Some("interrupted".to_owned()),
                )
            }
            Ending::Exited(code) => {
                let provider_reason = provider_error.as_ref().and_then(|(_, r)| *r);
                classify_exit(code, marker, provider_error.is_some(), provider_reason)
                    .map_or_else(
                        || (AttemptState::Completed, None, code, None),
                        |reason| {
                            let message = provider_error
                                .as_ref()
                                .map(|(m, _)| m.clone())
                                .unwrap_or_else(|| format!("provider exited with {code:?}"));
                            (AttemptState::Failed, Some(reason), code, Some(message))
                        },
                    )
            }
        };

        self.finish(
            task,
            &tally,
            state.advance(next_state),
            reason,
            exit_code,
            elapsed,
            last_output,
            error,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        task: &mut Task,
        tally: &Tally,
        state: AttemptState,
        reason: Option<FailureReason>,
        exit_code: Option<i32>,
        elapsed: Duration,
        last_output: Option<String>,
        error: Option<String>,
    ) -> anyhow::Result<ExecutionResult> {
        tally.apply(task, elapsed);
        let status = if state == AttemptState::Completed {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        task.status = status;
        task.failure_reason = reason;
        task.completed_at = Some(now_timestamp());
        self.store.update(task)?;

        tracing::info!(
            task_id = task.id,
            status = %status,
            reason = reason.map(FailureReason::as_str),
            steps = tally.steps(),
            "provider finished"
        );
        Ok(ExecutionResult {
            state,
            status,
            failure_reason: reason,
            exit_code,
            steps: tally.steps(),
            session_id: task.session_id.clone(),
            duration: elapsed,
            last_output,
            error,
        })
    }

    async fn terminate(&self, child: &mut Child, task_id: i64) {
        let Some(pid) = child.id() else {
            return;
        };
        if let Err(e) = send_signal(pid, Signal::Term, true) {
            tracing::debug!(task_id, error = %e, "SIGTERM to provider group failed");
        }
        if tokio::time::timeout(self.limits.stop_grace, child.wait())
            .await
            .is_ok()
        {
            return;
        }
        tracing::warn!(task_id, pid, "provider ignored SIGTERM, killing");
        if send_signal(pid, Signal::Kill, true).is_err() {
            let _ = child.start_kill();
        }
        let _ = child.wait().await;
    }
}

/// Outcome of a provider that exited on its own. `None` means success.
///
/// A clean exit succeeds unless the provider reported an error event. On
/// failure the agent's own marker wins over the provider's category.
#[must_use]
pub fn classify_exit(
    exit_code: Option<i32>,
    marker: Option<FailureReason>,
    provider_errored: bool,
    provider_reason: Option<FailureReason>,
) -> Option<FailureReason> {
    if exit_code == Some(0) && !provider_errored {
        return None;
    }
    Some(marker.or(provider_reason).unwrap_or(FailureReason::Unknown))
}
