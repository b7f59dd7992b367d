#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use crate::config::{self, Config};
use crate::core::git::RebaseOutcome;
use crate::logging;
use crate::output::table::Table;
use crate::task::execution::read_log;
use crate::task::model::{Task, TaskDraft, TaskStatus, TaskType};
use crate::task::provider::{Event, provider_for};
use crate::task::scheduler::{TaskView, pending_overview};
use crate::task::storage::{ProviderFilter, TaskStore};
use crate::task::worker::{
    Coordinator, LoopSummary, RunOutcome, SpawnSpec, WorkerRegistry, WorkerStatus,
    install_stop_handler, spawn_background, stop_worker,
};

#[derive(Debug, Parser)]
#[command(
    name = "agentq",
    version,
    about = "Queue and run coding-agent tasks in isolated git worktrees"
)]
pub struct Cli {
    /// Project directory (defaults to the current directory)
    #[arg(long = "project", global = true)]
    pub project: Option<PathBuf>,
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Queue a new task
    Add(AddArgs),
    /// Run queued tasks in the foreground or start background workers
    Work(WorkArgs),
    /// Entry point of a background worker process
    #[command(hide = true)]
    Worker(WorkerArgs),
    /// List workers
    Ps(PsArgs),
    /// Stop a worker
    Stop(StopArgs),
    /// Continue a failed task's agent session
    Resume(ResumeArgs),
    /// Run a finished task again from scratch
    Retry(TaskRef),
    /// Rebase a task branch onto the default branch
    Rebase(RebaseArgs),
    /// Record that a task branch was merged
    Merged(MergedArgs),
    /// Push a task branch with --force-with-lease
    Push(TaskRef),
    /// Release orphaned tasks and remove stale workspaces
    Reclaim(ReclaimArgs),
    /// Queue counts and pending tasks
    Status(JsonFlag),
    /// Details of one task
    Show(ShowArgs),
    /// Print a task's event log
    Log(TaskRef),
    /// Inspect configuration
    Config(ConfigArgs),
}

#[derive(Debug, Parser)]
pub struct AddArgs {
    /// What the agent should do
    pub prompt: String,
    /// Task type (generic, explore, plan, implement, review, improve)
    #[arg(short = 't', long = "type", default_value = "generic")]
    pub task_type: String,
    /// Spec file, relative to the project
    #[arg(long = "spec")]
    pub spec: Option<String>,
    #[arg(long = "group")]
    pub group: Option<String>,
    /// Wait for this task to complete first
    #[arg(long = "depends-on")]
    pub depends_on: Option<String>,
    /// Build on this task's output
    #[arg(long = "based-on")]
    pub based_on: Option<String>,
    /// Work on the based-on task's branch
    #[arg(long = "same-branch")]
    pub same_branch: bool,
    /// Branch type used by `{type}` in the branch pattern
    #[arg(long = "branch-type")]
    pub branch_type: Option<String>,
    #[arg(long = "provider")]
    pub provider: Option<String>,
    #[arg(long = "model")]
    pub model: Option<String>,
    #[arg(long = "max-steps")]
    pub max_steps: Option<u32>,
    /// Legacy alias of --max-steps
    #[arg(long = "max-turns")]
    pub max_turns: Option<u32>,
}

#[derive(Debug, Parser)]
pub struct WorkArgs {
    /// Run this task instead of the next eligible one
    pub task: Option<String>,
    /// Stop after this many tasks
    #[arg(short = 'n', long = "count")]
    pub count: Option<usize>,
    /// Keep polling when the queue is empty
    #[arg(short = 'w', long = "wait")]
    pub wait: bool,
    /// Start detached workers instead of running here
    #[arg(short = 'b', long = "background")]
    pub background: bool,
    /// Number of background workers to start
    #[arg(long = "workers", default_value_t = 1)]
    pub workers: usize,
    /// Only claim tasks assigned to this provider
    #[arg(long = "provider")]
    pub provider: Option<String>,
    /// With --provider, also claim tasks with no provider set
    #[arg(long = "include-unassigned")]
    pub include_unassigned: bool,
}

#[derive(Debug, Parser)]
pub struct WorkerArgs {
    #[arg(long = "worker-id")]
    pub worker_id: String,
    #[arg(long = "task")]
    pub task: Option<String>,
    #[arg(long = "count")]
    pub count: Option<usize>,
    #[arg(long = "wait")]
    pub wait: bool,
}

#[derive(Debug, Parser)]
pub struct PsArgs {
    /// Include finished workers
    #[arg(short = 'a', long = "all")]
    pub all: bool,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct StopArgs {
    pub worker_id: String,
    /// SIGKILL instead of SIGTERM
    #[arg(short = 'f', long = "force")]
    pub force: bool,
}

#[derive(Debug, Parser)]
pub struct ResumeArgs {
    pub task: String,
    /// Message sent to the agent on resume
    #[arg(short = 'm', long = "message")]
    pub message: Option<String>,
}

#[derive(Debug, Parser)]
pub struct TaskRef {
    /// Task id, #id or slug
    pub task: String,
}

#[derive(Debug, Parser)]
pub struct RebaseArgs {
    pub task: String,
    #[arg(long = "onto")]
    pub onto: Option<String>,
}

#[derive(Debug, Parser)]
pub struct MergedArgs {
    pub task: String,
    /// Record the merge without asking git
    #[arg(long = "no-verify")]
    pub no_verify: bool,
}

#[derive(Debug, Parser)]
pub struct ReclaimArgs {
    /// Age threshold in days (defaults to workers.reclaim_age_days)
    #[arg(long = "days")]
    pub days: Option<u64>,
}

#[derive(Debug, Parser)]
pub struct JsonFlag {
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ShowArgs {
    pub task: String,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    /// Print the resolved configuration
    Show,
}

pub async fn main() -> ExitCode {
    logging::init("agentq=info");
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let project_dir = match cli.project {
        Some(p) => p,
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let cfg = config::load(&project_dir)?;

    match cli.cmd {
        Commands::Add(args) => cmd_add(&cfg, args),
        Commands::Work(args) => cmd_work(cfg, args).await,
        Commands::Worker(args) => cmd_worker(cfg, args).await,
        Commands::Ps(args) => cmd_ps(&cfg, &args),
        Commands::Stop(args) => cmd_stop(&cfg, &args).await,
        Commands::Resume(args) => {
            let coord = foreground(cfg)?;
            let outcome = coord.resume(&args.task, args.message).await;
            finish_worker(&coord, outcome.map(|o| report(&o)))
        }
        Commands::Retry(args) => {
            let coord = foreground(cfg)?;
            let outcome = coord.retry(&args.task).await;
            finish_worker(&coord, outcome.map(|o| report(&o)))
        }
        Commands::Rebase(args) => cmd_rebase(cfg, &args),
        Commands::Merged(args) => {
            let coord = Coordinator::open(cfg, WorkerRegistry::new_worker_id(), idle_stop())?;
            if coord.mark_merged(&args.task, !args.no_verify)? {
                println!("Marked {} as merged", args.task);
            } else {
                println!("{} was already merged", args.task);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Push(args) => {
            let coord = Coordinator::open(cfg, WorkerRegistry::new_worker_id(), idle_stop())?;
            let task = coord.store().resolve(&args.task)?;
            coord.workspaces().push_with_lease(&task)?;
            println!("Pushed {}", task.branch.as_deref().unwrap_or_default());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reclaim(args) => cmd_reclaim(cfg, &args),
        Commands::Status(args) => cmd_status(&cfg, &args),
        Commands::Show(args) => cmd_show(&cfg, &args),
        Commands::Log(args) => cmd_log(&cfg, &args),
        Commands::Config(args) => match args.cmd {
            ConfigCmd::Show => {
                print!("{}", cfg.resolved_toml()?);
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}

fn open_store(cfg: &Config) -> anyhow::Result<TaskStore> {
    TaskStore::open_with_retries(&cfg.db_path(), cfg.workers.store_busy_retries)
        .with_context(|| format!("failed to open {}", cfg.db_path().display()))
}

/// One-shot commands never drive a provider, so nothing listens for stops.
fn idle_stop() -> watch::Receiver<bool> {
    watch::channel(false).1
}

fn cmd_add(cfg: &Config, args: AddArgs) -> anyhow::Result<ExitCode> {
    let store = open_store(cfg)?;
    let resolve = |r: Option<&str>| -> anyhow::Result<Option<i64>> {
        r.map(|r| store.resolve(r).map(|t| t.id))
            .transpose()
            .map_err(Into::into)
    };
    let draft = TaskDraft {
        prompt: args.prompt,
        task_type: args.task_type.parse::<TaskType>()?,
        spec: args.spec,
        group: args.group,
        depends_on: resolve(args.depends_on.as_deref())?,
        based_on: resolve(args.based_on.as_deref())?,
        same_branch: args.same_branch,
        task_type_hint: args.branch_type,
        provider: args.provider,
        model: args.model,
        max_steps: args.max_steps,
        max_turns: args.max_turns,
    };
    if let Some(provider) = draft.provider.as_deref() {
        provider_for(provider, cfg)?;
    }
    let id = store.add(&draft)?;
    println!("Added task #{id}");
    Ok(ExitCode::SUCCESS)
}

/// A coordinator for this process, registered as a worker so other
/// processes see it own its workspace.
fn foreground(cfg: Config) -> anyhow::Result<Coordinator> {
    let stop = install_stop_handler()?;
    let coord = Coordinator::open(cfg, WorkerRegistry::new_worker_id(), stop)?;
    coord.register()?;
    Ok(coord)
}

fn report(outcome: &RunOutcome) -> LoopSummary {
    let mut summary = LoopSummary::default();
    match outcome {
        RunOutcome::Idle => println!("No eligible tasks"),
        RunOutcome::Finished {
            task_id,
            status,
            failure_reason,
        } => {
            match failure_reason {
                Some(reason) => println!("Task #{task_id}: {status} ({reason})"),
                None => println!("Task #{task_id}: {status}"),
            }
            if *status == TaskStatus::Completed {
                summary.completed = 1;
            } else {
                summary.failed = 1;
            }
        }
    }
    summary
}

/// Records how this worker ended and maps it to the exit code.
fn finish_worker(
    coord: &Coordinator,
    outcome: anyhow::Result<LoopSummary>,
) -> anyhow::Result<ExitCode> {
    let summary = match outcome {
        Ok(s) => s,
        Err(e) => {
            if let Err(finish_err) = coord.registry().finish(
                coord.worker_id(),
                WorkerStatus::Failed,
                Some(&format!("{e:#}")),
            ) {
                tracing::warn!(error = %finish_err, "failed to record worker exit");
            }
            return Err(e);
        }
    };
    let status = if coord.stop_requested() {
        WorkerStatus::Stopped
    } else if summary.failed > 0 {
        WorkerStatus::Failed
    } else {
        WorkerStatus::Completed
    };
    coord.registry().finish(coord.worker_id(), status, None)?;
    Ok(if summary.failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

async fn run_counted(
    coord: &Coordinator,
    task: Option<&str>,
    count: Option<usize>,
    wait: bool,
) -> anyhow::Result<LoopSummary> {
    if let Some(task) = task {
        return Ok(report(&coord.run_task(task).await?));
    }
    let summary = coord.run_loop(count, wait).await?;
    let ran = summary.completed + summary.failed;
    if ran == 0 {
        println!("No eligible tasks");
    } else {
        println!(
            "Ran {ran} task(s): {} completed, {} failed",
            summary.completed, summary.failed
        );
    }
    Ok(summary)
}

async fn cmd_work(cfg: Config, args: WorkArgs) -> anyhow::Result<ExitCode> {
    if args.background {
        let registry = WorkerRegistry::new(cfg.workers_dir());
        let spec = SpawnSpec::current_exe(&cfg.project_dir)?;
        // A named task can only be claimed once.
        let workers = if args.task.is_some() { 1 } else { args.workers.max(1) };
        for _ in 0..workers {
            let record = spawn_background(&registry, &spec, args.task.as_deref())?;
            println!(
                "Started worker {} (pid {}), log: {}",
                record.worker_id,
                record.pid,
                record.log_file.as_deref().unwrap_or_default()
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut coord = foreground(cfg)?;
    if let Some(provider) = args.provider {
        coord = coord.with_provider_filter(ProviderFilter {
            provider,
            include_unassigned: args.include_unassigned,
        });
    }
    let outcome = run_counted(&coord, args.task.as_deref(), args.count, args.wait).await;
    finish_worker(&coord, outcome)
}

async fn cmd_worker(cfg: Config, args: WorkerArgs) -> anyhow::Result<ExitCode> {
    let stop = install_stop_handler()?;
    let coord = Coordinator::open(cfg, args.worker_id, stop)?;
    coord.register()?;
    tracing::info!(worker_id = %coord.worker_id(), pid = std::process::id(), "worker started");
    let outcome = run_counted(&coord, args.task.as_deref(), args.count, args.wait).await;
    finish_worker(&coord, outcome)
}

fn cmd_ps(cfg: &Config, args: &PsArgs) -> anyhow::Result<ExitCode> {
    let registry = WorkerRegistry::new(cfg.workers_dir());
    let workers = registry.list(args.all)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&workers)?);
        return Ok(ExitCode::SUCCESS);
    }
    if workers.is_empty() {
        println!("No workers");
        return Ok(ExitCode::SUCCESS);
    }
    let mut table = Table::new(["WORKER", "PID", "STATUS", "TASK", "STARTED"]);
    for w in &workers {
        table.row([
            w.worker_id.clone(),
            w.pid.to_string(),
            w.status.to_string(),
            w.task_slug
                .clone()
                .or_else(|| w.task_id.map(|id| format!("#{id}")))
                .unwrap_or_else(|| "-".to_owned()),
            w.started_at.clone(),
        ]);
    }
    table.print()?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_stop(cfg: &Config, args: &StopArgs) -> anyhow::Result<ExitCode> {
    let registry = WorkerRegistry::new(cfg.workers_dir());
    let store = open_store(cfg)?;
    let stopped = stop_worker(
        &registry,
        &store,
        &args.worker_id,
        args.force,
        Duration::from_secs(cfg.workers.stop_grace_secs),
    )
    .await?;
    if stopped {
        println!("Stopped {}", args.worker_id);
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{} is not running or did not stop in time", args.worker_id);
        Ok(ExitCode::from(1))
    }
}

fn cmd_rebase(cfg: Config, args: &RebaseArgs) -> anyhow::Result<ExitCode> {
    let coord = Coordinator::open(cfg, WorkerRegistry::new_worker_id(), idle_stop())?;
    match coord.rebase(&args.task, args.onto.as_deref())? {
        RebaseOutcome::Success => {
            println!("Rebased {}", args.task);
            Ok(ExitCode::SUCCESS)
        }
        RebaseOutcome::Conflict { detail } => {
            eprintln!("Rebase of {} hit conflicts and was aborted:\n{detail}", args.task);
            Ok(ExitCode::from(2))
        }
    }
}

fn cmd_reclaim(cfg: Config, args: &ReclaimArgs) -> anyhow::Result<ExitCode> {
    let days = args.days.unwrap_or(cfg.workers.reclaim_age_days);
    let coord = Coordinator::open(cfg, WorkerRegistry::new_worker_id(), idle_stop())?;
    let report = coord.reclaim(Duration::from_secs(days * 86_400))?;
    for id in &report.released {
        println!("Released orphaned task #{id}");
    }
    for path in &report.workspaces {
        println!("Removed workspace {}", path.display());
    }
    if report.pruned_workers > 0 {
        println!("Pruned {} worker record(s)", report.pruned_workers);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_status(cfg: &Config, args: &JsonFlag) -> anyhow::Result<ExitCode> {
    let store = open_store(cfg)?;
    let tasks = store.all_by_id()?;
    let overview = pending_overview(&tasks);

    if args.json {
        let counts: std::collections::BTreeMap<String, usize> = store
            .count_by_status()?
            .into_iter()
            .map(|(s, n)| (s.to_string(), n))
            .collect();
        let pending: Vec<serde_json::Value> = overview
            .iter()
            .map(|(t, view)| {
                serde_json::json!({
                    "id": t.id,
                    "prompt": t.prompt,
                    "state": view_label(view),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "counts": counts,
                "pending": pending,
            }))?
        );
        return Ok(ExitCode::SUCCESS);
    }

    let counts = store.count_by_status()?;
    for status in [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ] {
        println!("{:<12} {}", status.as_str(), counts.get(&status).copied().unwrap_or(0));
    }
    if !overview.is_empty() {
        println!();
        let mut table = Table::new(["ID", "TYPE", "STATE", "PROMPT"]).truncate_cells(60);
        for (t, view) in &overview {
            table.row([
                format!("#{}", t.id),
                t.task_type.to_string(),
                view_label(view),
                t.prompt.clone(),
            ]);
        }
        table.print()?;
    }
    Ok(ExitCode::SUCCESS)
}

fn view_label(view: &TaskView) -> String {
    match view {
        TaskView::Ready => "ready".to_owned(),
        TaskView::Blocked { on, status } => format!("waiting on #{on} ({status})"),
        TaskView::PermanentlyBlocked { root_failed, .. } => {
            format!("blocked: #{root_failed} failed")
        }
        TaskView::Orphaned { on } => format!("blocked: #{on} missing"),
    }
}

fn cmd_show(cfg: &Config, args: &ShowArgs) -> anyhow::Result<ExitCode> {
    let store = open_store(cfg)?;
    let task = store.resolve(&args.task)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        print_task(&task);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_task(task: &Task) {
    println!("Task #{} {}", task.id, task.slug.as_deref().unwrap_or(""));
    println!("  type:     {}", task.task_type);
    println!("  status:   {}", task.status);
    if let Some(reason) = task.failure_reason {
        println!("  failure:  {reason}");
    }
    if let Some(branch) = task.branch.as_deref() {
        println!("  branch:   {branch}");
    }
    if let Some(merge) = task.merge_status {
        println!("  merge:    {merge}");
    }
    if let Some(steps) = task.num_steps_computed {
        println!("  steps:    {steps}");
    }
    if let (Some(i), Some(o)) = (task.input_tokens, task.output_tokens) {
        println!("  tokens:   {i} in / {o} out");
    }
    if let Some(cost) = task.cost_usd {
        println!("  cost:     ${cost:.4}");
    }
    if let Some(secs) = task.duration_seconds {
        println!("  duration: {secs:.1}s");
    }
    if let Some(log) = task.log_file.as_deref() {
        println!("  log:      {log}");
    }
    println!("  prompt:   {}", task.prompt);
}

fn cmd_log(cfg: &Config, args: &TaskRef) -> anyhow::Result<ExitCode> {
    let store = open_store(cfg)?;
    let task = store.resolve(&args.task)?;
    let Some(path) = task.log_file.as_deref() else {
        println!("Task {} has not run yet", task.label());
        return Ok(ExitCode::SUCCESS);
    };
    for record in read_log(Path::new(path))? {
        let detail = match &record.event {
            Event::SessionStarted { session_id } => format!("session {session_id}"),
            Event::StepStarted { .. } => "step".to_owned(),
            Event::StepProgress { tool: Some(tool), .. } => format!("tool {tool}"),
            Event::StepProgress { usage: Some(u), .. } => {
                format!("usage +{} in / +{} out", u.input_tokens, u.output_tokens)
            }
            Event::StepProgress { .. } | Event::StepCompleted => continue,
            Event::RunCompleted { usage, .. } => match usage {
                Some(u) => format!("done: {} in / {} out", u.input_tokens, u.output_tokens),
                None => "done".to_owned(),
            },
            Event::RunError { message, .. } => format!("error: {message}"),
            Event::Output { text } => text.lines().next().unwrap_or_default().to_owned(),
        };
        println!("[{}#{}] {} {detail}", record.attempt, record.seq, record.timestamp);
    }
    Ok(ExitCode::SUCCESS)
}
