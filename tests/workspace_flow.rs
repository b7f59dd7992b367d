mod common;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agentq::config::Config;
use agentq::core::git::{Git, RebaseOutcome};
use agentq::core::workspace::{OwnerProbe, WorkspaceManager};
use agentq::error::AgentqError;
use agentq::task::model::{
    FailureReason, MergeStatus, Task, TaskDraft, TaskStatus, TaskType, now_timestamp,
};
use agentq::task::worker::{Coordinator, RunOutcome, WorkerRecord, WorkerStatus};
use tokio::sync::watch;

const EDITS_A_FILE: &str = r#"
    echo '{"type":"session_started","session_id":"sess-edit"}'
    echo '{"type":"step_started"}'
    echo 'feature' > feature.txt
    echo '{"type":"run_completed","usage":{"input_tokens":3,"output_tokens":2}}'
"#;

fn coordinator(
    root: &Path,
    script: &str,
    worker_id: &str,
) -> (Coordinator, watch::Sender<bool>) {
    let repo = root.join("repo");
    common::init_repo(&repo);
    let cfg = common::sim_config(&repo, &root.join("wt"), script);
    let (tx, rx) = watch::channel(false);
    let coord = Coordinator::open(cfg, worker_id.to_owned(), rx).expect("coordinator");
    coord.register().expect("register");
    (coord, tx)
}

#[tokio::test]
async fn code_task_runs_in_its_own_worktree_and_commits() {
    if !common::git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let (coord, _stop) = coordinator(td.path(), EDITS_A_FILE, "w-test-code");
    let id = coord
        .store()
        .add(&TaskDraft::new("add feature file"))
        .expect("add");

    let outcome = coord.run_one().await.expect("run");
    assert_eq!(
        outcome,
        RunOutcome::Finished {
            task_id: id,
            status: TaskStatus::Completed,
            failure_reason: None,
        }
    );

    let task = coord.store().get(id).expect("get");
    let slug = task.slug.clone().expect("slug");
    let branch = task.branch.clone().expect("branch");
    assert_eq!(branch, format!("demo/{slug}"));
    assert_eq!(task.has_commits, Some(true));
    assert_eq!(task.merge_status, Some(MergeStatus::Unmerged));
    assert_eq!(task.diff_files_changed, Some(1));
    assert_eq!(task.session_id.as_deref(), Some("sess-edit"));
    assert_eq!(task.input_tokens, Some(3));

    let worktree = Path::new(task.worktree_path.as_deref().expect("worktree"));
    assert!(worktree.join("feature.txt").exists());
    let repo = td.path().join("repo");
    let subject = common::git(&repo, &["log", "-1", "--format=%s", &branch]);
    assert_eq!(subject, "agentq: add feature file");
    assert!(!repo.join("feature.txt").exists());

    assert!(coord.mark_merged(&id.to_string(), true).is_err());
    common::git(&repo, &["merge", "--ff-only", &branch]);
    assert!(coord.mark_merged(&id.to_string(), true).expect("mark merged"));
    assert_eq!(
        coord.store().get(id).expect("get").merge_status,
        Some(MergeStatus::Merged)
    );

    let record = coord
        .registry()
        .load("w-test-code")
        .expect("load")
        .expect("record");
    assert_eq!(record.task_id, Some(id));
    assert_eq!(record.provider_pid, None);
}

#[tokio::test]
async fn code_task_without_changes_fails_with_no_changes() {
    if !common::git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let (coord, _stop) = coordinator(
        td.path(),
        r#"echo '{"type":"run_completed"}'"#,
        "w-test-noop",
    );
    let id = coord.store().add(&TaskDraft::new("do nothing")).expect("add");

    coord.run_one().await.expect("run");
    let task = coord.store().get(id).expect("get");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure_reason, Some(FailureReason::NoChanges));
    assert_eq!(task.has_commits, Some(false));
}

#[tokio::test]
async fn explore_task_report_is_kept_and_feeds_follow_up() {
    if !common::git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let (coord, _stop) = coordinator(
        td.path(),
        r#"echo '# Findings' > .agentq-report.md; echo '{"type":"run_completed"}'"#,
        "w-test-explore",
    );
    let explore = coord
        .store()
        .add(&TaskDraft {
            task_type: TaskType::Explore,
            ..TaskDraft::new("map the auth code")
        })
        .expect("add");

    coord.run_one().await.expect("run");
    let task = coord.store().get(explore).expect("get");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.branch, None);
    assert_eq!(task.output_content.as_deref(), Some("# Findings\n"));
    let report = task.report_file.clone().expect("report file");
    assert!(report.starts_with(".agentq/reports/"));
    assert!(td.path().join("repo").join(&report).exists());
    let worktree = task.worktree_path.clone().expect("worktree");
    assert!(worktree.ends_with("-explore"));
}

#[tokio::test]
async fn reclaim_releases_tasks_of_dead_workers() {
    if !common::git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let (coord, _stop) = coordinator(td.path(), "true", "w-test-reclaimer");

    // Same pid as this test, but a start fingerprint no process has.
    let registry = coord.registry();
    let mut ghost = WorkerRecord::for_current_process("w-ghost");
    ghost.start_fingerprint = Some("not-a-start-time".to_owned());
    registry.save(&ghost).expect("save");

    let id = coord.store().add(&TaskDraft::new("orphaned work")).expect("add");
    let claimed = coord
        .store()
        .claim_next_eligible(None, "w-ghost")
        .expect("claim")
        .expect("task");
    assert_eq!(claimed.id, id);

    let listed = registry.list(false).expect("list");
    let ghost_row = listed
        .iter()
        .find(|w| w.worker_id == "w-ghost")
        .expect("ghost listed");
    assert_eq!(ghost_row.status, WorkerStatus::Stale);

    let report = coord
        .reclaim(Duration::from_secs(7 * 86_400))
        .expect("reclaim");
    assert_eq!(report.released, vec![id]);

    let task = coord.store().get(id).expect("get");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.worker_id, None);
    let ghost = registry.load("w-ghost").expect("load").expect("record");
    assert_eq!(ghost.status, WorkerStatus::Failed);

    // The reclaiming worker itself is alive and keeps its record.
    assert!(registry.is_alive("w-test-reclaimer").expect("alive"));
}

#[tokio::test]
async fn released_task_starts_over_with_a_full_budget() {
    if !common::git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let script = r#"
        echo '{"type":"session_started","session_id":"sess-fresh"}'
        echo '{"type":"step_started"}'
        echo '{"type":"step_started"}'
        echo '{"type":"step_started"}'
        echo 'feature' > feature.txt
        echo '{"type":"run_completed"}'
    "#;
    let td = tempfile::tempdir().expect("tempdir");
    let (coord, _stop) = coordinator(td.path(), script, "w-test-fresh");

    let registry = coord.registry();
    let mut ghost = WorkerRecord::for_current_process("w-ghost");
    ghost.start_fingerprint = Some("not-a-start-time".to_owned());
    registry.save(&ghost).expect("save");

    let id = coord
        .store()
        .add(&TaskDraft {
            max_steps: Some(20),
            ..TaskDraft::new("nearly exhausted")
        })
        .expect("add");
    let mut dead_run = coord
        .store()
        .claim_next_eligible(None, "w-ghost")
        .expect("claim")
        .expect("task");
    dead_run.session_id = Some("sess-dead".to_owned());
    dead_run.num_steps_computed = Some(19);
    dead_run.duration_seconds = Some(500.0);
    coord.store().update(&dead_run).expect("update");

    let report = coord
        .reclaim(Duration::from_secs(7 * 86_400))
        .expect("reclaim");
    assert_eq!(report.released, vec![id]);
    let released = coord.store().get(id).expect("get");
    assert_eq!(released.session_id, None);
    assert_eq!(released.num_steps_computed, None);
    assert_eq!(released.duration_seconds, None);

    let outcome = coord.run_one().await.expect("run");
    assert_eq!(
        outcome,
        RunOutcome::Finished {
            task_id: id,
            status: TaskStatus::Completed,
            failure_reason: None,
        }
    );
    let task = coord.store().get(id).expect("get");
    assert_eq!(task.num_steps_computed, Some(3));
    assert_eq!(task.session_id.as_deref(), Some("sess-fresh"));
    assert!(task.duration_seconds.is_some_and(|d| d < 500.0));
}

#[tokio::test]
async fn retry_starts_a_new_session_with_reset_counters() {
    if !common::git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let flag = td.path().join("second-attempt");
    let script = format!(
        r#"
        echo "{{\"type\":\"session_started\",\"session_id\":\"sess-$$\"}}"
        echo '{{"type":"step_started"}}'
        if [ -f '{flag}' ]; then
            echo retried > feature.txt
            echo '{{"type":"run_completed"}}'
        else
            echo '{{"type":"step_started"}}'
            echo '{{"type":"step_started"}}'
            echo 'still red [AGENTQ_FAILURE:TEST_FAILURE]'
            exit 1
        fi
    "#,
        flag = flag.display()
    );
    let (coord, _stop) = coordinator(td.path(), &script, "w-test-retry");
    let id = coord.store().add(&TaskDraft::new("fix the tests")).expect("add");

    coord.run_one().await.expect("run");
    let first = coord.store().get(id).expect("get");
    assert_eq!(first.failure_reason, Some(FailureReason::TestFailure));
    assert_eq!(first.num_steps_computed, Some(3));
    let first_session = first.session_id.clone().expect("session");

    std::fs::write(&flag, "").expect("flag");
    let outcome = coord.retry(&id.to_string()).await.expect("retry");
    assert_eq!(
        outcome,
        RunOutcome::Finished {
            task_id: id,
            status: TaskStatus::Completed,
            failure_reason: None,
        }
    );
    let second = coord.store().get(id).expect("get");
    assert_eq!(second.num_steps_computed, Some(1));
    assert_eq!(second.failure_reason, None);
    let second_session = second.session_id.clone().expect("session");
    assert_ne!(second_session, first_session);
    assert_eq!(second.worktree_path, first.worktree_path);
    assert_eq!(second.has_commits, Some(true));

    // Only completed or failed tasks can be retried.
    let pending = coord.store().add(&TaskDraft::new("not yet run")).expect("add");
    assert!(coord.retry(&pending.to_string()).await.is_err());
}

#[tokio::test]
async fn rebase_applies_cleanly_or_aborts_on_conflict() {
    if !common::git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let (coord, _stop) = coordinator(td.path(), EDITS_A_FILE, "w-test-rebase");
    let repo = td.path().join("repo");
    let id = coord
        .store()
        .add(&TaskDraft::new("add feature file"))
        .expect("add");
    coord.run_one().await.expect("run");
    let task = coord.store().get(id).expect("get");
    let branch = task.branch.clone().expect("branch");
    let worktree = PathBuf::from(task.worktree_path.clone().expect("worktree"));

    std::fs::write(repo.join("README.md"), "hello again\n").expect("write");
    common::git(&repo, &["commit", "-am", "touch readme"]);
    assert_eq!(
        coord.rebase(&id.to_string(), None).expect("rebase"),
        RebaseOutcome::Success
    );
    let main_head = common::git(&repo, &["rev-parse", "main"]);
    let merge_base = common::git(&repo, &["merge-base", "main", &branch]);
    assert_eq!(merge_base, main_head);

    std::fs::write(repo.join("feature.txt"), "something else\n").expect("write");
    common::git(&repo, &["add", "feature.txt"]);
    common::git(&repo, &["commit", "-m", "conflicting feature"]);
    let before = common::git(&repo, &["rev-parse", &branch]);

    let outcome = coord.rebase(&id.to_string(), None).expect("rebase");
    assert!(matches!(outcome, RebaseOutcome::Conflict { .. }), "{outcome:?}");
    assert_eq!(common::git(&repo, &["rev-parse", &branch]), before);
    assert_eq!(common::git(&worktree, &["status", "--porcelain"]), "");
}

struct Nobody;

impl OwnerProbe for Nobody {
    fn path_in_use(&self, _path: &Path) -> bool {
        false
    }
}

struct Everybody;

impl OwnerProbe for Everybody {
    fn path_in_use(&self, _path: &Path) -> bool {
        true
    }
}

fn manager(root: &Path) -> (WorkspaceManager, Config) {
    let repo = root.join("repo");
    common::init_repo(&repo);
    let cfg = common::sim_config(&repo, &root.join("wt"), "true");
    let git = Git::from_dir(&repo).expect("git");
    (WorkspaceManager::new(git, cfg.clone()), cfg)
}

fn task(id: i64, slug: &str, draft: &TaskDraft) -> Task {
    let mut t = Task::from_draft(id, draft, now_timestamp());
    t.slug = Some(slug.to_owned());
    t
}

#[test]
fn dirty_stale_workspace_is_a_conflict_unless_forced() {
    if !common::git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let (mgr, cfg) = manager(td.path());
    let draft = TaskDraft::new("shared slug");

    let first = mgr
        .prepare(&task(1, "20250101-shared", &draft), None, &Nobody, false)
        .expect("prepare");
    std::fs::write(first.path.join("scratch.txt"), "half done\n").expect("write");

    // A different task landing on the same path does not own the worktree.
    let second = task(2, "20250101-shared", &draft);
    let err = mgr
        .prepare(&second, None, &Nobody, false)
        .expect_err("dirty workspace");
    assert!(matches!(err, AgentqError::WorkspaceConflict { .. }), "{err}");
    assert!(first.path.join("scratch.txt").exists());

    let forced = mgr.prepare(&second, None, &Nobody, true).expect("forced");
    assert_eq!(forced.path, first.path);
    assert!(!forced.reused);
    let diff = std::fs::read_to_string(cfg.wip_dir().join("20250101-shared.diff")).expect("diff");
    assert!(diff.contains("half done"));
    let branch = forced.branch.clone().expect("branch");
    let subject = common::git(&forced.path, &["log", "-1", "--format=%s", &branch]);
    assert_eq!(subject, "WIP: agentq task interrupted");
}

#[test]
fn same_branch_shares_the_worktree_unless_its_holder_is_live() {
    if !common::git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let (mgr, _cfg) = manager(td.path());

    let mut implement = task(1, "20250101-impl", &TaskDraft::new("implement it"));
    let ws = mgr.prepare(&implement, None, &Nobody, false).expect("prepare");
    implement.branch.clone_from(&ws.branch);
    implement.worktree_path = Some(ws.path.to_string_lossy().into_owned());

    let follow_up = task(
        2,
        "20250101-improve",
        &TaskDraft {
            task_type: TaskType::Improve,
            based_on: Some(1),
            same_branch: true,
            ..TaskDraft::new("improve it")
        },
    );
    let shared = mgr
        .prepare(&follow_up, Some(&implement), &Nobody, false)
        .expect("shared");
    assert_eq!(shared.path, ws.path);
    assert_eq!(shared.branch, ws.branch);
    assert!(shared.reused);

    let err = mgr
        .prepare(&follow_up, Some(&implement), &Everybody, false)
        .expect_err("live holder");
    assert!(matches!(err, AgentqError::WorkspaceConflict { .. }), "{err}");

    let orphan = mgr.prepare(&follow_up, None, &Nobody, false);
    assert!(matches!(orphan, Err(AgentqError::Validation(_))));
}

#[test]
fn stale_dirty_workspace_is_saved_before_removal() {
    if !common::git_available() {
        eprintln!("skipping: git not found");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let (mgr, cfg) = manager(td.path());

    let mut failed = task(7, "20250101-abandoned", &TaskDraft::new("abandoned work"));
    let ws = mgr.prepare(&failed, None, &Nobody, false).expect("prepare");
    std::fs::write(ws.path.join("notes.txt"), "keep me\n").expect("write");
    failed.status = TaskStatus::Failed;
    failed.branch.clone_from(&ws.branch);
    failed.worktree_path = Some(ws.path.to_string_lossy().into_owned());
    let tasks = HashMap::from([(failed.id, failed.clone())]);

    // A live holder keeps it in place.
    let kept = mgr
        .reclaim_stale(&tasks, Duration::ZERO, &Everybody)
        .expect("reclaim");
    assert!(kept.is_empty());

    let removed = mgr
        .reclaim_stale(&tasks, Duration::ZERO, &Nobody)
        .expect("reclaim");
    assert_eq!(removed, vec![ws.path.clone()]);
    assert!(!ws.path.exists());

    let diff = std::fs::read_to_string(cfg.wip_dir().join("20250101-abandoned.diff")).expect("diff");
    assert!(diff.contains("keep me"));
    let branch = ws.branch.expect("branch");
    let repo = td.path().join("repo");
    assert_eq!(
        common::git(&repo, &["log", "-1", "--format=%s", &branch]),
        "WIP: agentq task interrupted"
    );
    assert_eq!(common::git(&repo, &["show", &format!("{branch}:notes.txt")]), "keep me");
}
