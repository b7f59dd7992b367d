#![forbid(unsafe_code)]

// Every ref-mutating call below runs under the repository lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::config::Config;
use crate::core::git::{DiffStat, Git, RebaseOutcome};
use crate::core::lock::RepoLock;
use crate::core::naming::{BranchVars, render_branch_name, sanitize_for_filesystem};
use crate::error::AgentqError;
use crate::task::model::{MergeStatus, Task, TaskStatus};

pub trait OwnerProbe {
    fn path_in_use(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    /// `None` for detached worktrees of non-code task types.
    pub branch: Option<String>,
    pub reused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub has_commits: bool,
    pub merge_status: Option<MergeStatus>,
    pub commits_ahead: u32,
    pub diff: DiffStat,
}

impl FinalizeOutcome {
    pub fn apply(&self, task: &mut Task) {
        task.has_commits = Some(self.has_commits);
        task.merge_status = self.merge_status;
        task.diff_files_changed = Some(self.diff.files_changed);
        task.diff_lines_added = Some(self.diff.lines_added);
        task.diff_lines_removed = Some(self.diff.lines_removed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: String,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    git: Git,
    cfg: Config,
}

impl WorkspaceManager {
    #[must_use]
    pub fn new(git: Git, cfg: Config) -> Self {
        Self { git, cfg }
    }

    #[must_use]
    pub fn git(&self) -> &Git {
        &self.git
    }

    fn lock(&self) -> Result<RepoLock, AgentqError> {
        RepoLock::acquire(
            &self.cfg.lock_path(),
            Duration::from_secs(self.cfg.workers.lock_timeout_secs),
        )
    }

    fn project_root(&self) -> Result<PathBuf, AgentqError> {
        let base = self
            .cfg
            .worktree_base()
            .map_err(|e| AgentqError::Config(e.to_string()))?;
        Ok(base.join(sanitize_for_filesystem(&self.cfg.project_name)))
    }

    /// `<worktree_dir>/<project>/<slug>`, with a `-<type>` suffix for
    /// detached types so a plan and its implementation never collide.
    pub fn workspace_path(&self, task: &Task) -> Result<PathBuf, AgentqError> {
        let slug = task
            .slug
            .as_deref()
            .ok_or_else(|| AgentqError::Validation(format!("task {} has no slug", task.id)))?;
        let dir = if task.task_type.produces_code() {
            sanitize_for_filesystem(slug)
        } else {
            sanitize_for_filesystem(&format!("{slug}-{}", task.task_type))
        };
        Ok(self.project_root()?.join(dir))
    }

    pub fn branch_name(&self, task: &Task) -> Result<String, AgentqError> {
        let slug = task
            .slug
            .as_deref()
            .ok_or_else(|| AgentqError::Validation(format!("task {} has no slug", task.id)))?;
        Ok(render_branch_name(
            &self.cfg.branch_strategy.pattern,
            &BranchVars {
                project: &self.cfg.project_name,
                task_slug: slug,
                prompt: &task.prompt,
                explicit_type: task.task_type_hint.as_deref(),
                default_type: &self.cfg.branch_strategy.default_type,
            },
        ))
    }

    /// Gives `task` a worktree.
    ///
    /// `source` is the `based_on` task, required when `same_branch` is set.
    /// A worktree the task already owns (resume, retry) is reused; anything
    /// else occupying the path is reclaimed when no live worker holds it and
    /// it is clean, or unconditionally with `force`.
    pub fn prepare(
        &self,
        task: &Task,
        source: Option<&Task>,
        probe: &dyn OwnerProbe,
        force: bool,
    ) -> Result<Workspace, AgentqError> {
        let _lock = self.lock()?;
        let default = self.git.default_branch()?;
        let base = self.git.base_ref(&default)?;
        let mut registered = self.list()?;

        if task.same_branch {
            return self.prepare_same_branch(task, source, probe, force, &registered);
        }

        let path = self.workspace_path(task)?;
        let branch = if task.task_type.produces_code() {
            Some(match &task.branch {
                Some(existing) => existing.clone(),
                None => self.branch_name(task)?,
            })
        } else {
            None
        };

        if let Some(entry) = registered.iter().find(|e| same_path(&e.path, &path)) {
            let owned = task.worktree_path.as_deref() == Some(path.to_string_lossy().as_ref())
                && entry.branch == branch;
            if owned && !probe.path_in_use(&path) {
                tracing::info!(task_id = task.id, path = %path.display(), "reusing workspace");
                return Ok(Workspace {
                    path,
                    branch,
                    reused: true,
                });
            }
        }
        if path.exists() || registered.iter().any(|e| same_path(&e.path, &path)) {
            self.reclaim_path(&path, probe, force, &registered)?;
            registered = self.list()?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentqError::io(parent, e))?;
        }

        match &branch {
            Some(name) if self.git.branch_exists(name)? => {
                if let Some(holder) = registered
                    .iter()
                    .find(|e| e.branch.as_deref() == Some(name.as_str()))
                {
                    return Err(AgentqError::WorkspaceConflict {
                        path: holder.path.clone(),
                        reason: format!("branch {name} is checked out elsewhere"),
                    });
                }
                self.git.add_worktree_existing(&path, name)?;
            }
            Some(name) => self.git.add_worktree_new_branch(&path, name, &base)?,
            None => self.git.add_worktree_detached(&path, &base)?,
        }
        tracing::info!(
            task_id = task.id,
            path = %path.display(),
            branch = branch.as_deref().unwrap_or("(detached)"),
            base = %base,
            "created workspace"
        );
        Ok(Workspace {
            path,
            branch,
            reused: false,
        })
    }

    fn prepare_same_branch(
        &self,
        task: &Task,
        source: Option<&Task>,
        probe: &dyn OwnerProbe,
        force: bool,
        registered: &[WorktreeEntry],
    ) -> Result<Workspace, AgentqError> {
        let Some(branch) = source.and_then(|s| s.branch.clone()) else {
            return Err(AgentqError::Validation(format!(
                "task {} wants the same branch but its source has none",
                task.id
            )));
        };
        if !self.git.branch_exists(&branch)? {
            return Err(AgentqError::Validation(format!(
                "branch {branch} no longer exists"
            )));
        }

        // Whoever has the branch checked out, the worktree is shared.
        if let Some(holder) = registered
            .iter()
            .find(|e| e.branch.as_deref() == Some(branch.as_str()))
        {
            if probe.path_in_use(&holder.path) {
                return Err(AgentqError::WorkspaceConflict {
                    path: holder.path.clone(),
                    reason: format!("branch {branch} is in use by a live worker"),
                });
            }
            tracing::info!(task_id = task.id, path = %holder.path.display(), %branch, "sharing workspace");
            return Ok(Workspace {
                path: holder.path.clone(),
                branch: Some(branch),
                reused: true,
            });
        }

        let path = self.workspace_path(task)?;
        if path.exists() {
            self.reclaim_path(&path, probe, force, registered)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentqError::io(parent, e))?;
        }
        self.git.add_worktree_existing(&path, &branch)?;
        Ok(Workspace {
            path,
            branch: Some(branch),
            reused: false,
        })
    }

    fn reclaim_path(
        &self,
        path: &Path,
        probe: &dyn OwnerProbe,
        force: bool,
        registered: &[WorktreeEntry],
    ) -> Result<(), AgentqError> {
        if probe.path_in_use(path) {
            return Err(AgentqError::WorkspaceConflict {
                path: path.to_path_buf(),
                reason: "in use by a live worker".to_owned(),
            });
        }
        let is_worktree = registered.iter().any(|e| same_path(&e.path, &path));
        if is_worktree && path.exists() {
            if self.git.has_changes(path)? {
                if !force {
                    return Err(AgentqError::WorkspaceConflict {
                        path: path.to_path_buf(),
                        reason: "stale workspace has uncommitted changes".to_owned(),
                    });
                }
                let _ = self.save_wip(path, None)?;
            }
            self.git.remove_worktree(path, true)?;
        } else if path.exists() {
            let non_empty = std::fs::read_dir(path)
                .map_err(|e| AgentqError::io(path, e))?
                .next()
                .is_some();
            if non_empty && !force {
                return Err(AgentqError::WorkspaceConflict {
                    path: path.to_path_buf(),
                    reason: "directory exists and is not a worktree".to_owned(),
                });
            }
            std::fs::remove_dir_all(path).map_err(|e| AgentqError::io(path, e))?;
        }
        self.git.prune_worktrees()?;
        tracing::warn!(path = %path.display(), "reclaimed stale workspace");
        Ok(())
    }

    pub fn finalize(&self, task: &Task, succeeded: bool) -> Result<FinalizeOutcome, AgentqError> {
        let Some(branch) = task.branch.as_deref() else {
            return Ok(FinalizeOutcome {
                has_commits: false,
                merge_status: task.merge_status,
                commits_ahead: 0,
                diff: DiffStat::default(),
            });
        };
        let _lock = self.lock()?;

        if let Some(dir) = task.worktree_path.as_deref().map(Path::new)
            && succeeded
            && self.cfg.auto_commit
            && dir.exists()
            && self.git.has_changes(dir)?
        {
            let summary: String = task.prompt.chars().take(50).collect();
            let message = format!("agentq: {summary}\n\nTask: {}", task.label());
            self.git.commit_all(dir, &message)?;
            tracing::info!(task_id = task.id, %branch, "committed workspace changes");
        }

        let default = self.git.default_branch()?;
        let commits_ahead = self.git.count_commits_ahead(&default, branch)?;
        let diff = if commits_ahead > 0 {
            self.git.diff_stat(&default, branch)?
        } else {
            DiffStat::default()
        };
        let has_commits = commits_ahead > 0;
        let merge_status = match task.merge_status {
            None if has_commits => Some(MergeStatus::Unmerged),
            other => other,
        };
        tracing::debug!(task_id = task.id, %branch, commits_ahead, "finalized workspace");
        Ok(FinalizeOutcome {
            has_commits,
            merge_status,
            commits_ahead,
            diff,
        })
    }

    pub fn is_merged(&self, task: &Task) -> Result<bool, AgentqError> {
        let branch = task
            .branch
            .as_deref()
            .ok_or_else(|| AgentqError::Validation(format!("task {} has no branch", task.label())))?;
        let default = self.git.default_branch()?;
        self.git.is_merged(branch, &default)
    }

    /// Rebases the task's branch inside its worktree. A conflict is aborted
    /// and reported, never left half-applied.
    pub fn rebase(&self, task: &Task, onto: Option<&str>) -> Result<RebaseOutcome, AgentqError> {
        let dir = self.existing_worktree(task)?;
        let _lock = self.lock()?;
        let onto = match onto {
            Some(o) => o.to_owned(),
            None => self.git.base_ref(&self.git.default_branch()?)?,
        };
        let outcome = self.git.rebase(&dir, &onto)?;
        match &outcome {
            RebaseOutcome::Success => tracing::info!(task_id = task.id, %onto, "rebased"),
            RebaseOutcome::Conflict { .. } => {
                tracing::warn!(task_id = task.id, %onto, "rebase conflict, aborted");
            }
        }
        Ok(outcome)
    }

    pub fn push_with_lease(&self, task: &Task) -> Result<(), AgentqError> {
        let dir = self.existing_worktree(task)?;
        let branch = task
            .branch
            .as_deref()
            .ok_or_else(|| AgentqError::Validation(format!("task {} has no branch", task.label())))?;
        let _lock = self.lock()?;
        self.git.push_force_with_lease(&dir, branch)
    }

    fn existing_worktree(&self, task: &Task) -> Result<PathBuf, AgentqError> {
        let dir = task
            .worktree_path
            .as_deref()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .ok_or_else(|| {
                AgentqError::NotFound(format!("workspace for task {}", task.label()))
            })?;
        Ok(dir)
    }

    pub fn list(&self) -> Result<Vec<WorktreeEntry>, AgentqError> {
        let out = self.git.list_worktrees_porcelain()?;
        Ok(parse_worktree_porcelain(&out))
    }

    /// Removes this project's worktrees whose task is terminal and older than
    /// `max_age`, or whose task is still in flight but has no live owner.
    /// Dirty worktrees of unfinished tasks are left alone. Branches are kept.
    pub fn reclaim_stale(
        &self,
        tasks: &HashMap<i64, Task>,
        max_age: Duration,
        probe: &dyn OwnerProbe,
    ) -> Result<Vec<PathBuf>, AgentqError> {
        let root = self.project_root()?;
        let _lock = self.lock()?;
        let by_path: HashMap<&str, &Task> = tasks
            .values()
            .filter_map(|t| t.worktree_path.as_deref().map(|p| (p, t)))
            .collect();

        let mut removed = Vec::new();
        for entry in self.list()? {
            if !entry.path.starts_with(&root) || probe.path_in_use(&entry.path) {
                continue;
            }
            let old = age_of(&entry.path).is_none_or(|age| age >= max_age);
            let owner = by_path.get(entry.path.to_string_lossy().as_ref()).copied();
            let remove = match owner {
                None => old,
                Some(t) if t.status.is_terminal() => old,
                Some(t) if t.status == TaskStatus::InProgress || t.status == TaskStatus::Pending => {
                    entry.path.exists() && !self.git.has_changes(&entry.path)?
                }
                Some(_) => false,
            };
            if !remove {
                continue;
            }
            if let Err(e) = self.save_wip(&entry.path, owner) {
                tracing::warn!(path = %entry.path.display(), error = %e, "could not save work in progress, keeping workspace");
                continue;
            }
            match self.git.remove_worktree(&entry.path, true) {
                Ok(()) => {
                    tracing::info!(path = %entry.path.display(), task_id = owner.map(|t| t.id), "removed stale workspace");
                    removed.push(entry.path);
                }
                Err(e) => tracing::warn!(path = %entry.path.display(), error = %e, "could not remove workspace"),
            }
        }
        self.git.prune_worktrees()?;
        Ok(removed)
    }

    /// Saves uncommitted work in `path` before it is thrown away: the staged
    /// diff goes to `.agentq/wip/<name>.diff` and, on a branch, into a
    /// `--no-verify` WIP commit. Returns the diff file, if one was written.
    pub fn save_wip(
        &self,
        path: &Path,
        owner: Option<&Task>,
    ) -> Result<Option<PathBuf>, AgentqError> {
        if !path.exists() || !self.git.has_changes(path)? {
            return Ok(None);
        }
        let name = owner
            .and_then(|t| t.slug.clone())
            .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "workspace".to_owned());
        let diff = self.git.stage_all_diff(path)?;
        let dir = self.cfg.wip_dir();
        std::fs::create_dir_all(&dir).map_err(|e| AgentqError::io(&dir, e))?;
        let file = dir.join(format!("{}.diff", sanitize_for_filesystem(&name)));
        std::fs::write(&file, diff).map_err(|e| AgentqError::io(&file, e))?;

        if let Some(branch) = self.git.current_branch(path)? {
            let message = format!("WIP: agentq task interrupted\n\nTask: {name}");
            let _ = self
                .git
                .run_in_dir(path, &["commit", "--no-verify", "-m", &message])?;
            tracing::info!(%branch, file = %file.display(), "saved work in progress");
        } else {
            tracing::info!(file = %file.display(), "saved work in progress diff");
        }
        Ok(Some(file))
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    a == b
        || matches!(
            (std::fs::canonicalize(a), std::fs::canonicalize(b)),
            (Ok(x), Ok(y)) if x == y
        )
}

fn age_of(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[must_use]
pub fn parse_worktree_porcelain(out: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut cur: Option<WorktreeEntry> = None;

    for line in out.lines() {
        let line = line.trim_end();
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(cur.take());
            cur = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
                head: String::new(),
            });
        } else if let Some(entry) = cur.as_mut() {
            if let Some(branch) = line.strip_prefix("branch ") {
                entry.branch = Some(branch.trim().trim_start_matches("refs/heads/").to_owned());
            } else if let Some(head) = line.strip_prefix("HEAD ") {
                head.trim().clone_into(&mut entry.head);
            }
        }
    }
    entries.extend(cur);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worktree_list_porcelain() {
        let out = r"worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /tmp/agentq-worktrees/demo/20250101-fix
HEAD 2222222222222222222222222222222222222222
branch refs/heads/demo/20250101-fix

worktree /tmp/agentq-worktrees/demo/20250101-look-explore
HEAD 3333333333333333333333333333333333333333
detached
";
        let entries = parse_worktree_porcelain(out);
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            WorktreeEntry {
                path: PathBuf::from("/repo"),
                branch: Some("main".to_owned()),
                head: "1111111111111111111111111111111111111111".to_owned(),
            }
        );
        assert_eq!(entries[1].branch.as_deref(), Some("demo/20250101-fix"));
        assert_eq!(entries[2].branch, None);
    }

    #[test]
    fn paths_and_branches_follow_task_type() {
        use crate::task::model::{TaskDraft, TaskType};

        let cfg = Config {
            project_name: "demo".to_owned(),
            worktree_dir: "/wt".to_owned(),
            ..Config::default()
        };
        let mgr = WorkspaceManager::new(Git::new(PathBuf::from("/repo")), cfg);

        let mut task = Task::from_draft(3, &TaskDraft::new("fix login"), String::new());
        task.slug = Some("20250101-fix-login".to_owned());
        assert_eq!(
            mgr.workspace_path(&task).unwrap(),
            PathBuf::from("/wt/demo/20250101-fix-login")
        );
        assert_eq!(mgr.branch_name(&task).unwrap(), "demo/20250101-fix-login");

        task.task_type = TaskType::Review;
        assert_eq!(
            mgr.workspace_path(&task).unwrap(),
            PathBuf::from("/wt/demo/20250101-fix-login-review")
        );

        task.slug = None;
        assert!(mgr.workspace_path(&task).is_err());
    }
}
