#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::task::model::{Task, TaskType};
use crate::task::scheduler::find_in_chain;

/// File non-code tasks write their findings to, relative to the worktree.
pub const REPORT_FILE: &str = ".agentq-report.md";

const FAILURE_INSTRUCTIONS: &str = "If you cannot complete the task, end your final message with \
a line of the form [AGENTQ_FAILURE:<REASON>] where <REASON> is one of TEST_FAILURE, \
MAX_STEPS or UNKNOWN.";

pub struct PromptBuilder<'a> {
    project_dir: &'a Path,
    tasks: &'a HashMap<i64, Task>,
}

impl<'a> PromptBuilder<'a> {
    #[must_use]
    pub fn new(project_dir: &'a Path, tasks: &'a HashMap<i64, Task>) -> Self {
        Self { project_dir, tasks }
    }

    #[must_use]
    pub fn build(&self, task: &Task, work_dir: &Path) -> String {
        let mut out = format!("Complete this task: {}", task.prompt);

        if let Some(spec) = task.spec.as_deref()
            && let Some(content) = self.read_project_file(spec)
        {
            let _ = write!(
                out,
                "\n\n## Specification\n\nThe following specification file ({spec}) provides \
                 context for this task:\n\n{content}"
            );
        }

        let context = self.chain_context(task);
        if !context.is_empty() {
            out.push_str("\n\n");
            out.push_str(&context);
        }

        if !task.task_type.produces_code() {
            let report = work_dir.join(REPORT_FILE);
            let _ = write!(
                out,
                "\n\nDo not modify the code. Write your {} as markdown to {}.",
                match task.task_type {
                    TaskType::Plan => "plan",
                    TaskType::Review => "review",
                    _ => "findings",
                },
                report.display()
            );
        }

        out.push_str("\n\n");
        out.push_str(FAILURE_INSTRUCTIONS);
        out
    }

    /// Prompt for resuming a session: only the new message plus the marker
    /// instructions, since the provider already holds the conversation.
    #[must_use]
    pub fn resume(message: Option<&str>) -> String {
        let message = message.unwrap_or("Continue where you left off and finish the task.");
        format!("{message}\n\n{FAILURE_INSTRUCTIONS}")
    }

    fn chain_context(&self, task: &Task) -> String {
        let mut parts: Vec<String> = Vec::new();
        let dependency = task.depends_on.and_then(|id| self.tasks.get(&id));

        match task.task_type {
            TaskType::Implement => {
                if let Some(plan) = task
                    .based_on
                    .and_then(|id| find_in_chain(id, TaskType::Plan, self.tasks))
                    .and_then(|t| self.output_of(t))
                {
                    parts.push(format!("## Plan to implement:\n\n{plan}"));
                }
            }
            TaskType::Review => {
                if let Some(implementation) = dependency {
                    if let Some(spec) = implementation.spec.as_deref()
                        && let Some(content) = self.read_project_file(spec)
                    {
                        parts.push(format!("## Specification ({spec})\n\n{content}"));
                    }
                    if let Some(branch) = implementation.branch.as_deref() {
                        parts.push(format!(
                            "## Changes under review\n\nReview the commits on branch {branch} \
                             against the default branch."
                        ));
                    }
                    if let Some(plan) = implementation
                        .based_on
                        .and_then(|id| find_in_chain(id, TaskType::Plan, self.tasks))
                        .and_then(|t| self.output_of(t))
                    {
                        parts.push(format!("## Original plan:\n\n{plan}"));
                    }
                }
            }
            TaskType::Improve => {
                if let Some(review) = dependency.filter(|t| t.task_type == TaskType::Review)
                    && let Some(feedback) = self.output_of(review)
                {
                    parts.push(format!("## Review feedback to address:\n\n{feedback}"));
                }
                if let Some(plan) = task
                    .based_on
                    .and_then(|id| find_in_chain(id, TaskType::Plan, self.tasks))
                    .and_then(|t| self.output_of(t))
                {
                    parts.push(format!("## Original plan:\n\n{plan}"));
                }
            }
            TaskType::Generic | TaskType::Explore | TaskType::Plan => {}
        }

        if parts.is_empty()
            && let Some(parent) = task.based_on.and_then(|id| self.tasks.get(&id))
        {
            match parent.report_file.as_deref() {
                Some(report) => parts.push(format!(
                    "This task is based on the findings in: {report}\n\
                     Read and review that report for context before starting."
                )),
                None => {
                    let summary: String = parent.prompt.chars().take(100).collect();
                    parts.push(format!(
                        "This task is a follow-up to task {}: {summary}",
                        parent.label()
                    ));
                }
            }
        }
        parts.join("\n\n")
    }

    fn output_of(&self, task: &Task) -> Option<String> {
        task.report_file
            .as_deref()
            .and_then(|p| self.read_project_file(p))
            .or_else(|| task.output_content.clone())
            .filter(|s| !s.trim().is_empty())
    }

    fn read_project_file(&self, relative: &str) -> Option<String> {
        let path = resolve(self.project_dir, relative);
        std::fs::read_to_string(&path)
            .map_err(|e| tracing::debug!(path = %path.display(), error = %e, "context file unreadable"))
            .ok()
    }
}

fn resolve(project_dir: &Path, p: &str) -> PathBuf {
    let path = Path::new(p);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::{TaskDraft, TaskStatus};

    fn task(id: i64, task_type: TaskType, prompt: &str) -> Task {
        let mut t = Task::from_draft(id, &TaskDraft::new(prompt), String::new());
        t.task_type = task_type;
        t.status = TaskStatus::Completed;
        t
    }

    #[test]
    fn implement_pulls_plan_from_chain() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".agentq/reports")).unwrap();
        std::fs::write(dir.path().join(".agentq/reports/plan.md"), "1. do the thing").unwrap();

        let mut plan = task(1, TaskType::Plan, "plan auth");
        plan.report_file = Some(".agentq/reports/plan.md".to_owned());
        let mut implement = task(2, TaskType::Implement, "implement auth");
        implement.based_on = Some(1);
        let tasks: HashMap<i64, Task> = [(1, plan), (2, implement.clone())].into();

        let prompt = PromptBuilder::new(dir.path(), &tasks).build(&implement, Path::new("/wt"));
        assert!(prompt.starts_with("Complete this task: implement auth"));
        assert!(prompt.contains("## Plan to implement:\n\n1. do the thing"));
        assert!(prompt.contains("[AGENTQ_FAILURE:"));
        assert!(!prompt.contains(REPORT_FILE));
    }

    #[test]
    fn non_code_tasks_get_report_instructions() {
        let dir = tempfile::tempdir().unwrap();
        let explore = task(1, TaskType::Explore, "look around");
        let mut follow = task(2, TaskType::Review, "check it");
        follow.based_on = Some(1);
        let tasks: HashMap<i64, Task> = [(1, explore), (2, follow.clone())].into();

        let prompt = PromptBuilder::new(dir.path(), &tasks).build(&follow, Path::new("/wt/x"));
        assert!(prompt.contains("/wt/x/.agentq-report.md"));
        assert!(prompt.contains("follow-up to task #1: look around"));
    }

    #[test]
    fn resume_prompt_carries_message() {
        let p = PromptBuilder::resume(Some("fix the test"));
        assert!(p.starts_with("fix the test"));
        assert!(PromptBuilder::resume(None).starts_with("Continue"));
    }
}
