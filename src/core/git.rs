#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::AgentqError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStat {
    pub files_changed: u32,
    pub lines_added: u32,
    pub lines_removed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Success,
    /// The rebase was aborted; the branch is unchanged.
    Conflict { detail: String },
}

#[derive(Debug, Clone)]
pub struct Git {
    repo_root: PathBuf,
}

impl Git {
    pub fn from_dir(dir: &Path) -> Result<Self, AgentqError> {
        let repo_root = find_repo_root(dir).ok_or(AgentqError::NotInGitRepo)?;
        Ok(Self { repo_root })
    }

    #[must_use]
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// `origin/HEAD` when a remote is configured, else `main`/`master`, else
    /// whatever the main checkout is on.
    pub fn default_branch(&self) -> Result<String, AgentqError> {
        if let Ok(out) = self.run(&["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            && let Some(name) = out.trim().strip_prefix("origin/")
        {
            return Ok(name.to_owned());
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate)? {
                return Ok(candidate.to_owned());
            }
        }
        let out = self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(out.trim().to_owned())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool, AgentqError> {
        self.ref_exists(&format!("refs/heads/{branch}"))
    }

    pub fn ref_exists(&self, reference: &str) -> Result<bool, AgentqError> {
        let out = self.run_raw(&["rev-parse", "--verify", "--quiet", reference])?;
        Ok(out.status.success())
    }

    pub fn base_ref(&self, default_branch: &str) -> Result<String, AgentqError> {
        let remote = format!("origin/{default_branch}");
        if !self.ref_exists(&format!("refs/remotes/{remote}"))? {
            return Ok(default_branch.to_owned());
        }
        if !self.branch_exists(default_branch)? {
            return Ok(remote);
        }
        if self.is_ancestor(default_branch, &remote)? {
            Ok(remote)
        } else {
            Ok(default_branch.to_owned())
        }
    }

    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, AgentqError> {
        let out = self.run_raw(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(command_error(
                &["merge-base", "--is-ancestor", ancestor, descendant],
                &out,
            )),
        }
    }

    /// Commits on `head` whose patch is not yet in `upstream`.
    pub fn cherry(&self, upstream: &str, head: &str) -> Result<Vec<String>, AgentqError> {
        let out = self.run(&["cherry", upstream, head])?;
        Ok(out
            .lines()
            .filter_map(|l| l.strip_prefix("+ "))
            .map(str::to_owned)
            .collect())
    }

    /// Merged either by ancestry or because every commit has an equivalent
    /// patch upstream (squash/rebase merges).
    pub fn is_merged(&self, branch: &str, into: &str) -> Result<bool, AgentqError> {
        if self.is_ancestor(branch, into)? {
            return Ok(true);
        }
        Ok(self.cherry(into, branch)?.is_empty())
    }

    pub fn count_commits_ahead(&self, base: &str, head: &str) -> Result<u32, AgentqError> {
        let out = self.run(&["rev-list", "--count", &format!("{base}..{head}")])?;
        out.trim()
            .parse()
            .map_err(|_| AgentqError::GitOperation(format!("unexpected rev-list output: {out}")))
    }

    pub fn diff_stat(&self, base: &str, head: &str) -> Result<DiffStat, AgentqError> {
        let out = self.run(&["diff", "--numstat", &format!("{base}...{head}")])?;
        Ok(parse_numstat(&out))
    }

    pub fn has_changes(&self, dir: &Path) -> Result<bool, AgentqError> {
        let out = self.run_in_dir(dir, &["status", "--porcelain"])?;
        Ok(!out.trim().is_empty())
    }

    pub fn commit_all(&self, dir: &Path, message: &str) -> Result<(), AgentqError> {
        let _ = self.run_in_dir(dir, &["add", "-A"])?;
        let _ = self.run_in_dir(dir, &["commit", "--no-verify", "-m", message])?;
        Ok(())
    }

    pub fn stage_all_diff(&self, dir: &Path) -> Result<String, AgentqError> {
        let _ = self.run_in_dir(dir, &["add", "-A"])?;
        self.run_in_dir(dir, &["diff", "--cached", "--binary"])
    }

    pub fn current_branch(&self, dir: &Path) -> Result<Option<String>, AgentqError> {
        let out = self.run_in_dir(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim();
        Ok((name != "HEAD").then(|| name.to_owned()))
    }

    pub fn rebase(&self, dir: &Path, onto: &str) -> Result<RebaseOutcome, AgentqError> {
        let out = self.run_raw_in_dir(dir, &["rebase", onto])?;
        if out.status.success() {
            return Ok(RebaseOutcome::Success);
        }
        let detail = format!(
            "{}{}",
            String::from_utf8_lossy(&out.stdout).trim(),
            String::from_utf8_lossy(&out.stderr).trim()
        );
        // Leave nothing half-applied, even if git already gave up on its own.
        let _ = self.run_raw_in_dir(dir, &["rebase", "--abort"])?;
        Ok(RebaseOutcome::Conflict { detail })
    }

    pub fn push_force_with_lease(&self, dir: &Path, branch: &str) -> Result<(), AgentqError> {
        let _ = self.run_in_dir(
            dir,
            &["push", "--force-with-lease", "--set-upstream", "origin", branch],
        )?;
        Ok(())
    }

    pub fn list_worktrees_porcelain(&self) -> Result<String, AgentqError> {
        self.run(&["worktree", "list", "--porcelain"])
    }

    pub fn add_worktree_new_branch(
        &self,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), AgentqError> {
        let path = path.to_string_lossy();
        let _ = self.run(&["worktree", "add", "-b", branch, &path, base])?;
        Ok(())
    }

    pub fn add_worktree_existing(&self, path: &Path, branch: &str) -> Result<(), AgentqError> {
        let path = path.to_string_lossy();
        let _ = self.run(&["worktree", "add", &path, branch])?;
        Ok(())
    }

    pub fn add_worktree_detached(&self, path: &Path, base: &str) -> Result<(), AgentqError> {
        let path = path.to_string_lossy();
        let _ = self.run(&["worktree", "add", "--detach", &path, base])?;
        Ok(())
    }

    pub fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), AgentqError> {
        let path = path.to_string_lossy();
        if force {
            let _ = self.run(&["worktree", "remove", "--force", &path])?;
        } else {
            let _ = self.run(&["worktree", "remove", &path])?;
        }
        Ok(())
    }

    pub fn prune_worktrees(&self) -> Result<(), AgentqError> {
        let _ = self.run(&["worktree", "prune"])?;
        Ok(())
    }

    pub fn run(&self, args: &[&str]) -> Result<String, AgentqError> {
        self.run_in_dir(&self.repo_root, args)
    }

    pub fn run_raw(&self, args: &[&str]) -> Result<Output, AgentqError> {
        self.run_raw_in_dir(&self.repo_root, args)
    }

    pub fn run_in_dir(&self, dir: &Path, args: &[&str]) -> Result<String, AgentqError> {
        let out = self.run_raw_in_dir(dir, args)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            Err(command_error(args, &out))
        }
    }

    pub fn run_raw_in_dir(&self, dir: &Path, args: &[&str]) -> Result<Output, AgentqError> {
        tracing::trace!(?args, dir = %dir.display(), "git");
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AgentqError::GitNotFound,
                _ => AgentqError::GitOperation(format!("failed to run git: {e}")),
            })
    }
}

fn command_error(args: &[&str], out: &Output) -> AgentqError {
    let stderr = String::from_utf8_lossy(&out.stderr);
    AgentqError::GitOperation(format!("git {}: {}", args.join(" "), stderr.trim()))
}

#[must_use]
pub fn parse_numstat(out: &str) -> DiffStat {
    let mut stat = DiffStat::default();
    for line in out.lines() {
        let mut parts = line.split('\t');
        let (Some(added), Some(removed), Some(_path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        stat.files_changed += 1;
        // Binary files report "-".
        stat.lines_added += added.parse::<u32>().unwrap_or(0);
        stat.lines_removed += removed.parse::<u32>().unwrap_or(0);
    }
    stat
}

fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(dir) = cur {
        let candidate = dir.join(".git");
        if candidate.is_dir() || candidate.is_file() {
            return Some(dir.to_path_buf());
        }
        cur = dir.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numstat_counts_binary_files_without_lines() {
        let out = "3\t1\tsrc/lib.rs\n-\t-\tassets/logo.png\n10\t0\tREADME.md\n";
        assert_eq!(
            parse_numstat(out),
            DiffStat {
                files_changed: 3,
                lines_added: 13,
                lines_removed: 1,
            }
        );
        assert_eq!(parse_numstat(""), DiffStat::default());
    }

    #[test]
    fn repo_root_is_found_from_nested_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        let nested = tmp.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_repo_root(&nested).unwrap(), tmp.path());
    }
}
