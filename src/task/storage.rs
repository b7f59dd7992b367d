#![forbid(unsafe_code)]

// Claims rely on `BEGIN IMMEDIATE` plus a conditional UPDATE.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, named_params, params};

use crate::error::AgentqError;
use crate::task::model::{
    FailureReason, MergeStatus, Task, TaskDraft, TaskStatus, TaskType, now_timestamp,
};
use crate::task::scheduler::{ELIGIBLE_SQL, FIFO_ORDER_SQL};

const DEFAULT_BUSY_RETRIES: u32 = 8;
const INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

const COLUMNS: &str = "id, slug, prompt, task_type, spec, task_group, task_type_hint, \
     depends_on, based_on, same_branch, status, session_id, branch, worktree_path, \
     log_file, report_file, output_content, worker_id, created_at, started_at, \
     completed_at, duration_seconds, num_steps_reported, num_steps_computed, \
     num_turns_reported, input_tokens, output_tokens, cost_usd, failure_reason, \
     has_commits, merge_status, pr_number, diff_files_changed, diff_lines_added, \
     diff_lines_removed, provider, model, max_steps, max_turns";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFilter {
    pub provider: String,
    /// Also accept tasks with no provider override (they run on the default).
    pub include_unassigned: bool,
}

#[derive(Debug)]
pub struct TaskStore {
    conn: Connection,
    path: PathBuf,
    busy_retries: u32,
}

impl TaskStore {
    const SCHEMA_VERSION: i32 = 1;

    pub fn open(path: &Path) -> Result<Self, AgentqError> {
        Self::open_with_retries(path, DEFAULT_BUSY_RETRIES)
    }

    pub fn open_with_retries(path: &Path, busy_retries: u32) -> Result<Self, AgentqError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentqError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(200))?;
        let store = Self {
            conn,
            path: path.to_path_buf(),
            busy_retries: busy_retries.max(1),
        };
        store.with_busy_retry(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
            )
        })?;
        store.ensure_schema()?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_schema(&self) -> Result<(), AgentqError> {
        let version: i32 = self.with_busy_retry(|conn| {
            conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        })?;
        if version == Self::SCHEMA_VERSION {
            return Ok(());
        }
        if version > Self::SCHEMA_VERSION {
            return Err(AgentqError::Validation(format!(
                "database {} has schema version {version}, newer than supported {}",
                self.path.display(),
                Self::SCHEMA_VERSION
            )));
        }
        tracing::debug!(path = %self.path.display(), "creating task schema");
        self.with_busy_retry(|conn| {
            conn.execute_batch(&format!(
                "
                BEGIN IMMEDIATE;
                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    slug TEXT UNIQUE,
                    prompt TEXT NOT NULL,
                    task_type TEXT NOT NULL DEFAULT 'generic',
                    spec TEXT,
                    task_group TEXT,
                    task_type_hint TEXT,
                    depends_on INTEGER REFERENCES tasks(id),
                    based_on INTEGER REFERENCES tasks(id),
                    same_branch INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'pending',
                    session_id TEXT,
                    branch TEXT,
                    worktree_path TEXT,
                    log_file TEXT,
                    report_file TEXT,
                    output_content TEXT,
                    worker_id TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    duration_seconds REAL,
                    num_steps_reported INTEGER,
                    num_steps_computed INTEGER,
                    num_turns_reported INTEGER,
                    input_tokens INTEGER,
                    output_tokens INTEGER,
                    cost_usd REAL,
                    failure_reason TEXT,
                    has_commits INTEGER,
                    merge_status TEXT,
                    pr_number INTEGER,
                    diff_files_changed INTEGER,
                    diff_lines_added INTEGER,
                    diff_lines_removed INTEGER,
                    provider TEXT,
                    model TEXT,
                    max_steps INTEGER,
                    max_turns INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks(status, created_at, id);
                CREATE INDEX IF NOT EXISTS idx_tasks_depends_on ON tasks(depends_on);
                PRAGMA user_version = {};
                COMMIT;
                ",
                Self::SCHEMA_VERSION
            ))
        })
    }

    /// Runs `op`, retrying on `SQLITE_BUSY`/`SQLITE_LOCKED` with exponential
    /// backoff.
    fn with_busy_retry<T, F>(&self, mut op: F) -> Result<T, AgentqError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T>,
    {
        let mut delay = INITIAL_BACKOFF;
        for attempt in 1..=self.busy_retries {
            match op(&self.conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) => {
                    // A failed statement inside an explicit transaction may
                    // leave it open.
                    if !self.conn.is_autocommit() {
                        let _ = self.conn.execute_batch("ROLLBACK");
                    }
                    if attempt == self.busy_retries {
                        break;
                    }
                    tracing::debug!(attempt, delay_ms = delay.as_millis(), "task store busy");
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AgentqError::StoreBusy {
            attempts: self.busy_retries,
        })
    }

    pub fn add(&self, draft: &TaskDraft) -> Result<i64, AgentqError> {
        if draft.prompt.trim().is_empty() {
            return Err(AgentqError::Validation("prompt must not be empty".to_owned()));
        }
        if draft.same_branch && draft.based_on.is_none() && draft.depends_on.is_none() {
            return Err(AgentqError::Validation(
                "same_branch requires based_on or depends_on".to_owned(),
            ));
        }
        for (field, id) in [("depends_on", draft.depends_on), ("based_on", draft.based_on)] {
            if let Some(id) = id
                && self.find(id)?.is_none()
            {
                return Err(AgentqError::Validation(format!(
                    "{field} references unknown task {id}"
                )));
            }
        }

        let created_at = now_timestamp();
        let id = self.with_busy_retry(|conn| {
            conn.execute(
                "INSERT INTO tasks (prompt, task_type, spec, task_group, task_type_hint,
                    depends_on, based_on, same_branch, status, created_at,
                    provider, model, max_steps, max_turns)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?10, ?11, ?12, ?13)",
                params![
                    draft.prompt,
                    draft.task_type.as_str(),
                    draft.spec,
                    draft.group,
                    draft.task_type_hint,
                    draft.depends_on,
                    draft.based_on,
                    draft.same_branch,
                    created_at,
                    draft.provider,
                    draft.model,
                    draft.max_steps,
                    draft.max_turns,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        tracing::info!(task_id = id, task_type = %draft.task_type, "task added");
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Result<Task, AgentqError> {
        self.find(id)?
            .ok_or_else(|| AgentqError::NotFound(format!("task {id}")))
    }

    pub fn find(&self, id: i64) -> Result<Option<Task>, AgentqError> {
        self.with_busy_retry(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                row_to_task,
            )
            .optional()
        })
    }

    pub fn get_by_slug(&self, slug: &str) -> Result<Option<Task>, AgentqError> {
        self.with_busy_retry(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM tasks WHERE slug = ?1"),
                [slug],
                row_to_task,
            )
            .optional()
        })
    }

    pub fn resolve(&self, reference: &str) -> Result<Task, AgentqError> {
        let trimmed = reference.trim().trim_start_matches('#');
        if let Ok(id) = trimmed.parse::<i64>() {
            return self.get(id);
        }
        self.get_by_slug(trimmed)?
            .ok_or_else(|| AgentqError::NotFound(format!("task '{reference}'")))
    }

    pub fn slug_taken(&self, slug: &str) -> Result<bool, AgentqError> {
        self.with_busy_retry(|conn| {
            conn.query_row("SELECT EXISTS(SELECT 1 FROM tasks WHERE slug = ?1)", [slug], |r| {
                r.get(0)
            })
        })
    }

    pub fn update(&self, task: &Task) -> Result<(), AgentqError> {
        let changed = self.with_busy_retry(|conn| {
            conn.execute(
                "UPDATE tasks SET
                    slug = :slug, prompt = :prompt, task_type = :task_type, spec = :spec,
                    task_group = :task_group, task_type_hint = :task_type_hint,
                    depends_on = :depends_on, based_on = :based_on, same_branch = :same_branch,
                    status = :status, session_id = :session_id, branch = :branch,
                    worktree_path = :worktree_path, log_file = :log_file,
                    report_file = :report_file, output_content = :output_content,
                    worker_id = :worker_id, started_at = :started_at,
                    completed_at = :completed_at, duration_seconds = :duration_seconds,
                    num_steps_reported = :num_steps_reported,
                    num_steps_computed = :num_steps_computed,
                    num_turns_reported = :num_turns_reported,
                    input_tokens = :input_tokens, output_tokens = :output_tokens,
                    cost_usd = :cost_usd, failure_reason = :failure_reason,
                    has_commits = :has_commits, merge_status = :merge_status,
                    pr_number = :pr_number, diff_files_changed = :diff_files_changed,
                    diff_lines_added = :diff_lines_added,
                    diff_lines_removed = :diff_lines_removed, provider = :provider,
                    model = :model, max_steps = :max_steps, max_turns = :max_turns
                 WHERE id = :id",
                named_params! {
                    ":id": task.id,
                    ":slug": task.slug,
                    ":prompt": task.prompt,
                    ":task_type": task.task_type.as_str(),
                    ":spec": task.spec,
                    ":task_group": task.group,
                    ":task_type_hint": task.task_type_hint,
                    ":depends_on": task.depends_on,
                    ":based_on": task.based_on,
                    ":same_branch": task.same_branch,
                    ":status": task.status.as_str(),
                    ":session_id": task.session_id,
                    ":branch": task.branch,
                    ":worktree_path": task.worktree_path,
                    ":log_file": task.log_file,
                    ":report_file": task.report_file,
                    ":output_content": task.output_content,
                    ":worker_id": task.worker_id,
                    ":started_at": task.started_at,
                    ":completed_at": task.completed_at,
                    ":duration_seconds": task.duration_seconds,
                    ":num_steps_reported": task.num_steps_reported,
                    ":num_steps_computed": task.num_steps_computed,
                    ":num_turns_reported": task.num_turns_reported,
                    ":input_tokens": task.input_tokens,
                    ":output_tokens": task.output_tokens,
                    ":cost_usd": task.cost_usd,
                    ":failure_reason": task.failure_reason.map(FailureReason::as_str),
                    ":has_commits": task.has_commits,
                    ":merge_status": task.merge_status.map(MergeStatus::as_str),
                    ":pr_number": task.pr_number,
                    ":diff_files_changed": task.diff_files_changed,
                    ":diff_lines_added": task.diff_lines_added,
                    ":diff_lines_removed": task.diff_lines_removed,
                    ":provider": task.provider,
                    ":model": task.model,
                    ":max_steps": task.max_steps,
                    ":max_turns": task.max_turns,
                },
            )
        })?;
        if changed == 0 {
            return Err(AgentqError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    /// Atomically claims the oldest eligible pending task for `worker_id`.
    /// The returned row already reflects the claim.
    pub fn claim_next_eligible(
        &self,
        filter: Option<&ProviderFilter>,
        worker_id: &str,
    ) -> Result<Option<Task>, AgentqError> {
        let select = format!(
            "SELECT t.id FROM tasks t
             LEFT JOIN tasks d ON d.id = t.depends_on
             WHERE {ELIGIBLE_SQL}
               AND (?1 IS NULL OR t.provider = ?1 OR (?2 AND t.provider IS NULL))
             ORDER BY {FIFO_ORDER_SQL}
             LIMIT 1"
        );
        let provider = filter.map(|f| f.provider.as_str());
        let include_unassigned = filter.is_some_and(|f| f.include_unassigned);

        let claimed = self.with_busy_retry(|conn| {
            immediate(conn, |conn| {
                let Some(id) = conn
                    .query_row(&select, params![provider, include_unassigned], |r| {
                        r.get::<_, i64>(0)
                    })
                    .optional()?
                else {
                    return Ok(None);
                };
                flip_to_in_progress(conn, id, &[TaskStatus::Pending], worker_id)
            })
        })?;

        if let Some(task) = &claimed {
            tracing::info!(task_id = task.id, worker_id, "claimed task");
        }
        Ok(claimed)
    }

    /// The same conditional flip for a named task, accepted only from one of
    /// `from` statuses. `Ok(None)` when the task is in any other status.
    pub fn claim_specific(
        &self,
        id: i64,
        from: &[TaskStatus],
        worker_id: &str,
    ) -> Result<Option<Task>, AgentqError> {
        let _ = self.get(id)?;
        let claimed = self.with_busy_retry(|conn| {
            immediate(conn, |conn| flip_to_in_progress(conn, id, from, worker_id))
        })?;
        if claimed.is_some() {
            tracing::info!(task_id = id, worker_id, "claimed task by id");
        }
        Ok(claimed)
    }

    /// Puts an `in_progress` task back to `pending`, but only while `worker_id`
    /// still owns it. The abandoned run's session and counters are cleared so
    /// the next claim starts from zero.
    pub fn release_claim(&self, id: i64, worker_id: Option<&str>) -> Result<bool, AgentqError> {
        let changed = self.with_busy_retry(|conn| {
            conn.execute(
                "UPDATE tasks SET status = 'pending', worker_id = NULL, started_at = NULL,
                    session_id = NULL, duration_seconds = NULL, num_steps_reported = NULL,
                    num_steps_computed = NULL, num_turns_reported = NULL, input_tokens = NULL,
                    output_tokens = NULL, cost_usd = NULL, failure_reason = NULL,
                    completed_at = NULL
                 WHERE id = ?1 AND status = 'in_progress' AND worker_id IS ?2",
                params![id, worker_id],
            )
        })?;
        Ok(changed == 1)
    }

    /// One step along `NULL -> unmerged -> merged`. Returns whether anything
    /// changed.
    pub fn set_merge_status(&self, id: i64, status: MergeStatus) -> Result<bool, AgentqError> {
        let from: Option<&str> = match status {
            MergeStatus::Unmerged => None,
            MergeStatus::Merged => Some(MergeStatus::Unmerged.as_str()),
        };
        let changed = self.with_busy_retry(|conn| {
            conn.execute(
                "UPDATE tasks SET merge_status = ?2 WHERE id = ?1 AND merge_status IS ?3",
                params![id, status.as_str(), from],
            )
        })?;
        Ok(changed == 1)
    }

    pub fn get_recent(
        &self,
        status: Option<TaskStatus>,
        task_type: Option<TaskType>,
        limit: usize,
    ) -> Result<Vec<Task>, AgentqError> {
        self.query_tasks(
            &format!(
                "SELECT {COLUMNS} FROM tasks
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR task_type = ?2)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3"
            ),
            params![
                status.map(TaskStatus::as_str),
                task_type.map(TaskType::as_str),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
        )
    }

    pub fn get_dependents(&self, id: i64) -> Result<Vec<Task>, AgentqError> {
        self.query_tasks(
            &format!("SELECT {COLUMNS} FROM tasks WHERE depends_on = ?1 ORDER BY created_at, id"),
            [id],
        )
    }

    pub fn get_pending(&self) -> Result<Vec<Task>, AgentqError> {
        self.query_tasks(
            &format!(
                "SELECT {COLUMNS} FROM tasks WHERE status = 'pending' ORDER BY created_at, id"
            ),
            [],
        )
    }

    pub fn get_in_progress(&self) -> Result<Vec<Task>, AgentqError> {
        self.query_tasks(
            &format!(
                "SELECT {COLUMNS} FROM tasks WHERE status = 'in_progress' ORDER BY started_at, id"
            ),
            [],
        )
    }

    pub fn all_by_id(&self) -> Result<HashMap<i64, Task>, AgentqError> {
        let tasks = self.query_tasks(&format!("SELECT {COLUMNS} FROM tasks"), [])?;
        Ok(tasks.into_iter().map(|t| (t.id, t)).collect())
    }

    pub fn count_by_status(&self) -> Result<HashMap<TaskStatus, usize>, AgentqError> {
        let rows: Vec<(String, i64)> = self.with_busy_retry(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect()
        })?;
        let mut out = HashMap::new();
        for (status, count) in rows {
            out.insert(
                status.parse()?,
                usize::try_from(count).unwrap_or_default(),
            );
        }
        Ok(out)
    }

    fn query_tasks<P: rusqlite::Params + Clone>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<Task>, AgentqError> {
        self.with_busy_retry(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params.clone(), row_to_task)?;
            rows.collect()
        })
    }
}

fn immediate<T, F>(conn: &Connection, body: F) -> rusqlite::Result<T>
where
    F: FnOnce(&Connection) -> rusqlite::Result<T>,
{
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match body(conn).and_then(|v| conn.execute_batch("COMMIT").map(|()| v)) {
        Ok(v) => Ok(v),
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn flip_to_in_progress(
    conn: &Connection,
    id: i64,
    from: &[TaskStatus],
    worker_id: &str,
) -> rusqlite::Result<Option<Task>> {
    let current: Option<String> = conn
        .query_row("SELECT status FROM tasks WHERE id = ?1", [id], |r| r.get(0))
        .optional()?;
    let Some(current) = current else {
        return Ok(None);
    };
    if !from.iter().any(|s| s.as_str() == current) {
        return Ok(None);
    }
    let changed = conn.execute(
        "UPDATE tasks SET status = 'in_progress', started_at = ?2, worker_id = ?3
         WHERE id = ?1 AND status = ?4",
        params![id, now_timestamp(), worker_id, current],
    )?;
    if changed != 1 {
        return Ok(None);
    }
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
        [id],
        row_to_task,
    )
    .map(Some)
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn parse_col<T>(row: &Row<'_>, idx: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = AgentqError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: AgentqError| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_opt_col<T>(row: &Row<'_>, idx: &str) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = AgentqError>,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse().map_err(|e: AgentqError| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get("id")?,
        slug: row.get("slug")?,
        prompt: row.get("prompt")?,
        task_type: parse_col(row, "task_type")?,
        spec: row.get("spec")?,
        group: row.get("task_group")?,
        task_type_hint: row.get("task_type_hint")?,
        depends_on: row.get("depends_on")?,
        based_on: row.get("based_on")?,
        same_branch: row.get("same_branch")?,
        status: parse_col(row, "status")?,
        session_id: row.get("session_id")?,
        branch: row.get("branch")?,
        worktree_path: row.get("worktree_path")?,
        log_file: row.get("log_file")?,
        report_file: row.get("report_file")?,
        output_content: row.get("output_content")?,
        worker_id: row.get("worker_id")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        duration_seconds: row.get("duration_seconds")?,
        num_steps_reported: row.get("num_steps_reported")?,
        num_steps_computed: row.get("num_steps_computed")?,
        num_turns_reported: row.get("num_turns_reported")?,
        input_tokens: row.get("input_tokens")?,
        output_tokens: row.get("output_tokens")?,
        cost_usd: row.get("cost_usd")?,
        failure_reason: parse_opt_col(row, "failure_reason")?,
        has_commits: row.get("has_commits")?,
        merge_status: parse_opt_col(row, "merge_status")?,
        pr_number: row.get("pr_number")?,
        diff_files_changed: row.get("diff_files_changed")?,
        diff_lines_added: row.get("diff_lines_added")?,
        diff_lines_removed: row.get("diff_lines_removed")?,
        provider: row.get("provider")?,
        model: row.get("model")?,
        max_steps: row.get("max_steps")?,
        max_turns: row.get("max_turns")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(&dir.path().join("agentq.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn add_then_get_round_trips_draft_fields() {
        let (_dir, store) = store();
        let parent = store.add(&TaskDraft::new("plan the work")).unwrap();
        let draft = TaskDraft {
            prompt: "Implement the cache".to_owned(),
            task_type: TaskType::Implement,
            spec: Some("docs/cache.md".to_owned()),
            group: Some("perf".to_owned()),
            depends_on: Some(parent),
            based_on: Some(parent),
            same_branch: true,
            task_type_hint: Some("feature".to_owned()),
            provider: Some("codex".to_owned()),
            model: Some("o3".to_owned()),
            max_steps: Some(12),
            max_turns: None,
        };
        let id = store.add(&draft).unwrap();
        let task = store.get(id).unwrap();

        let expected = Task::from_draft(id, &draft, task.created_at.clone());
        assert_eq!(task, expected);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(id > parent);
    }

    #[test]
    fn add_rejects_unknown_references() {
        let (_dir, store) = store();
        let err = store
            .add(&TaskDraft {
                depends_on: Some(42),
                ..TaskDraft::new("x")
            })
            .unwrap_err();
        assert!(matches!(err, AgentqError::Validation(_)));

        let err = store
            .add(&TaskDraft {
                same_branch: true,
                ..TaskDraft::new("x")
            })
            .unwrap_err();
        assert!(matches!(err, AgentqError::Validation(_)));
        assert!(matches!(store.get(1), Err(AgentqError::NotFound(_))));
    }

    #[test]
    fn claim_is_fifo_and_marks_owner() {
        let (_dir, store) = store();
        let a = store.add(&TaskDraft::new("first")).unwrap();
        let b = store.add(&TaskDraft::new("second")).unwrap();

        let claimed = store.claim_next_eligible(None, "w1").unwrap().unwrap();
        assert_eq!(claimed.id, a);
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert!(claimed.started_at.is_some());
        assert_eq!(store.get(a).unwrap(), claimed);

        assert_eq!(store.claim_next_eligible(None, "w2").unwrap().unwrap().id, b);
        assert!(store.claim_next_eligible(None, "w3").unwrap().is_none());
    }

    #[test]
    fn blocked_claim_returns_none_without_writing() {
        let (_dir, store) = store();
        let a = store.add(&TaskDraft::new("a")).unwrap();
        let b = store
            .add(&TaskDraft {
                depends_on: Some(a),
                ..TaskDraft::new("b")
            })
            .unwrap();
        let mut a_task = store.get(a).unwrap();
        a_task.status = TaskStatus::Failed;
        store.update(&a_task).unwrap();

        let before = store.all_by_id().unwrap();
        for _ in 0..3 {
            assert!(store.claim_next_eligible(None, "w").unwrap().is_none());
        }
        assert_eq!(store.all_by_id().unwrap(), before);
        assert_eq!(store.get_dependents(a).unwrap()[0].id, b);
    }

    #[test]
    fn provider_filter_selects_matching_tasks() {
        let (_dir, store) = store();
        let codex = store
            .add(&TaskDraft {
                provider: Some("codex".to_owned()),
                ..TaskDraft::new("codex task")
            })
            .unwrap();
        let plain = store.add(&TaskDraft::new("default task")).unwrap();

        let only_claude = ProviderFilter {
            provider: "claude".to_owned(),
            include_unassigned: true,
        };
        let t = store.claim_next_eligible(Some(&only_claude), "w").unwrap().unwrap();
        assert_eq!(t.id, plain);
        assert!(store.claim_next_eligible(Some(&only_claude), "w").unwrap().is_none());

        let only_codex = ProviderFilter {
            provider: "codex".to_owned(),
            include_unassigned: false,
        };
        let t = store.claim_next_eligible(Some(&only_codex), "w").unwrap().unwrap();
        assert_eq!(t.id, codex);
    }

    #[test]
    fn claim_specific_and_release_are_owner_checked() {
        let (_dir, store) = store();
        let id = store.add(&TaskDraft::new("x")).unwrap();
        assert!(
            store
                .claim_specific(id, &[TaskStatus::Failed], "w1")
                .unwrap()
                .is_none()
        );
        let t = store
            .claim_specific(id, &[TaskStatus::Pending], "w1")
            .unwrap()
            .unwrap();
        assert_eq!(t.worker_id.as_deref(), Some("w1"));

        let mut running = t;
        running.session_id = Some("sess-dead".to_owned());
        running.num_steps_computed = Some(19);
        running.duration_seconds = Some(500.0);
        running.input_tokens = Some(1200);
        store.update(&running).unwrap();

        assert!(!store.release_claim(id, Some("w2")).unwrap());
        assert!(store.release_claim(id, Some("w1")).unwrap());
        let t = store.get(id).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.worker_id.is_none());
        assert!(t.started_at.is_none());
        assert_eq!(t.session_id, None);
        assert_eq!(t.num_steps_computed, None);
        assert_eq!(t.duration_seconds, None);
        assert_eq!(t.input_tokens, None);
    }

    #[test]
    fn recent_tasks_are_newest_first_and_filtered() {
        let (_dir, store) = store();
        let a = store.add(&TaskDraft::new("a")).unwrap();
        let b = store
            .add(&TaskDraft {
                task_type: TaskType::Explore,
                ..TaskDraft::new("b")
            })
            .unwrap();
        let c = store.add(&TaskDraft::new("c")).unwrap();
        store.claim_specific(c, &[TaskStatus::Pending], "w1").unwrap();

        let ids = |tasks: Vec<Task>| tasks.iter().map(|t| t.id).collect::<Vec<_>>();
        assert_eq!(ids(store.get_recent(None, None, 10).unwrap()), vec![c, b, a]);
        assert_eq!(ids(store.get_recent(None, None, 2).unwrap()), vec![c, b]);
        assert_eq!(
            ids(store.get_recent(Some(TaskStatus::Pending), None, 10).unwrap()),
            vec![b, a]
        );
        assert_eq!(
            ids(store
                .get_recent(Some(TaskStatus::Pending), Some(TaskType::Explore), 10)
                .unwrap()),
            vec![b]
        );
        assert!(store.get_recent(Some(TaskStatus::Failed), None, 10).unwrap().is_empty());
    }

    #[test]
    fn merge_status_never_moves_backward() {
        let (_dir, store) = store();
        let id = store.add(&TaskDraft::new("x")).unwrap();
        assert!(!store.set_merge_status(id, MergeStatus::Merged).unwrap());
        assert_eq!(store.get(id).unwrap().merge_status, None);
        assert!(store.set_merge_status(id, MergeStatus::Unmerged).unwrap());
        assert!(!store.set_merge_status(id, MergeStatus::Unmerged).unwrap());
        assert!(store.set_merge_status(id, MergeStatus::Merged).unwrap());
        assert!(!store.set_merge_status(id, MergeStatus::Unmerged).unwrap());
        assert_eq!(
            store.get(id).unwrap().merge_status,
            Some(MergeStatus::Merged)
        );
    }

    #[test]
    fn resolve_accepts_id_hash_and_slug() {
        let (_dir, store) = store();
        let id = store.add(&TaskDraft::new("x")).unwrap();
        let mut t = store.get(id).unwrap();
        t.slug = Some("20250101-x".to_owned());
        store.update(&t).unwrap();

        assert_eq!(store.resolve(&id.to_string()).unwrap().id, id);
        assert_eq!(store.resolve(&format!("#{id}")).unwrap().id, id);
        assert_eq!(store.resolve("20250101-x").unwrap().id, id);
        assert!(store.slug_taken("20250101-x").unwrap());
        assert!(matches!(
            store.resolve("nope"),
            Err(AgentqError::NotFound(_))
        ));
    }

    #[test]
    fn reopening_keeps_schema_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentq.db");
        let id = TaskStore::open(&path)
            .unwrap()
            .add(&TaskDraft::new("persist me"))
            .unwrap();
        let store = TaskStore::open(&path).unwrap();
        assert_eq!(store.get(id).unwrap().prompt, "persist me");
        assert_eq!(
            store.count_by_status().unwrap().get(&TaskStatus::Pending),
            Some(&1)
        );
    }
}
