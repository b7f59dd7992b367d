#![forbid(unsafe_code)]

// These SQL fragments and the predicates below must agree.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::task::model::{Task, TaskStatus, TaskType};

/// Upper bound on any `depends_on`/`based_on` walk.
pub const MAX_CHAIN_DEPTH: usize = 64;

pub(crate) const ELIGIBLE_SQL: &str =
    "t.status = 'pending' AND (t.depends_on IS NULL OR d.status = 'completed')";

pub(crate) const FIFO_ORDER_SQL: &str = "t.created_at ASC, t.id ASC";

#[must_use]
pub fn fifo_cmp(a: &Task, b: &Task) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

#[must_use]
pub fn is_eligible(task: &Task, tasks: &HashMap<i64, Task>) -> bool {
    task.status == TaskStatus::Pending
        && task.depends_on.is_none_or(|dep| {
            tasks
                .get(&dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskView {
    Ready,
    Blocked { on: i64, status: TaskStatus },
    /// Some ancestor failed, so this task can never become eligible.
    PermanentlyBlocked { on: i64, root_failed: i64 },
    /// The dependency id no longer exists.
    Orphaned { on: i64 },
}

#[must_use]
pub fn classify(task: &Task, tasks: &HashMap<i64, Task>) -> TaskView {
    let Some(on) = task.depends_on else {
        return TaskView::Ready;
    };
    let chain = walk_chain(
        task.id,
        |id| tasks.get(&id),
        |t| t.depends_on,
        MAX_CHAIN_DEPTH,
    );
    // chain[0] is the task itself.
    for ancestor in chain.iter().skip(1) {
        if ancestor.status == TaskStatus::Failed {
            return TaskView::PermanentlyBlocked {
                on,
                root_failed: ancestor.id,
            };
        }
    }
    match tasks.get(&on) {
        None => TaskView::Orphaned { on },
        Some(dep) if dep.status == TaskStatus::Completed => TaskView::Ready,
        Some(dep) => TaskView::Blocked {
            on,
            status: dep.status,
        },
    }
}

#[must_use]
pub fn pending_overview(tasks: &HashMap<i64, Task>) -> Vec<(&Task, TaskView)> {
    let mut pending: Vec<&Task> = tasks
        .values()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();
    pending.sort_by(|a, b| fifo_cmp(a, b));
    pending
        .into_iter()
        .map(|t| (t, classify(t, tasks)))
        .collect()
}

/// Follows `next` from `start`, returning the visited tasks in order
/// (including `start`). Stops at a missing id, a repeated id or `max_depth`.
pub fn walk_chain<'a, L, N>(start: i64, lookup: L, next: N, max_depth: usize) -> Vec<&'a Task>
where
    L: Fn(i64) -> Option<&'a Task>,
    N: Fn(&Task) -> Option<i64>,
{
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut cur = Some(start);
    while let Some(id) = cur {
        if out.len() > max_depth {
            break;
        }
        if !seen.insert(id) {
            tracing::warn!(task_id = start, at = id, "cycle in task chain");
            break;
        }
        let Some(task) = lookup(id) else { break };
        out.push(task);
        cur = next(task);
    }
    out
}

#[must_use]
pub fn find_in_chain(start: i64, task_type: TaskType, tasks: &HashMap<i64, Task>) -> Option<&Task> {
    walk_chain(start, |id| tasks.get(&id), |t| t.based_on, MAX_CHAIN_DEPTH)
        .into_iter()
        .find(|t| t.task_type == task_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::TaskDraft;

    fn task(id: i64, status: TaskStatus, depends_on: Option<i64>) -> Task {
        let draft = TaskDraft {
            depends_on,
            ..TaskDraft::new(format!("task {id}"))
        };
        let mut t = Task::from_draft(id, &draft, format!("2025-01-01T00:00:{id:02}.000000Z"));
        t.status = status;
        t
    }

    fn index(tasks: Vec<Task>) -> HashMap<i64, Task> {
        tasks.into_iter().map(|t| (t.id, t)).collect()
    }

    #[test]
    fn dependency_must_be_completed() {
        let tasks = index(vec![
            task(1, TaskStatus::InProgress, None),
            task(2, TaskStatus::Pending, Some(1)),
            task(3, TaskStatus::Pending, None),
        ]);
        assert!(!is_eligible(&tasks[&2], &tasks));
        assert!(is_eligible(&tasks[&3], &tasks));
        assert_eq!(
            classify(&tasks[&2], &tasks),
            TaskView::Blocked {
                on: 1,
                status: TaskStatus::InProgress
            }
        );
    }

    #[test]
    fn failed_ancestor_blocks_whole_chain() {
        let tasks = index(vec![
            task(1, TaskStatus::Failed, None),
            task(2, TaskStatus::Pending, Some(1)),
            task(3, TaskStatus::Pending, Some(2)),
            task(4, TaskStatus::Pending, Some(99)),
        ]);
        assert_eq!(
            classify(&tasks[&3], &tasks),
            TaskView::PermanentlyBlocked {
                on: 2,
                root_failed: 1
            }
        );
        assert_eq!(classify(&tasks[&4], &tasks), TaskView::Orphaned { on: 99 });

        let overview = pending_overview(&tasks);
        let ids: Vec<i64> = overview.iter().map(|(t, _)| t.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn chain_walk_survives_cycles_and_depth() {
        let mut tasks = index(vec![
            task(1, TaskStatus::Completed, Some(3)),
            task(2, TaskStatus::Completed, Some(1)),
            task(3, TaskStatus::Pending, Some(2)),
        ]);
        let chain = walk_chain(3, |id| tasks.get(&id), |t| t.depends_on, 10);
        let ids: Vec<i64> = chain.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let chain = walk_chain(3, |id| tasks.get(&id), |t| t.depends_on, 1);
        assert_eq!(chain.len(), 2);

        tasks.get_mut(&1).unwrap().depends_on = None;
        let chain = walk_chain(3, |id| tasks.get(&id), |t| t.depends_on, 10);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn finds_plan_through_based_on() {
        let mut plan = task(1, TaskStatus::Completed, None);
        plan.task_type = TaskType::Plan;
        let mut implement = task(2, TaskStatus::Completed, None);
        implement.task_type = TaskType::Implement;
        implement.based_on = Some(1);
        let mut review = task(3, TaskStatus::Pending, None);
        review.task_type = TaskType::Review;
        review.based_on = Some(2);
        let tasks = index(vec![plan, implement, review]);

        assert_eq!(find_in_chain(3, TaskType::Plan, &tasks).map(|t| t.id), Some(1));
        assert_eq!(
            find_in_chain(3, TaskType::Implement, &tasks).map(|t| t.id),
            Some(2)
        );
        assert!(find_in_chain(3, TaskType::Explore, &tasks).is_none());
    }

    #[test]
    fn fifo_breaks_ties_by_id() {
        let a = task(5, TaskStatus::Pending, None);
        let mut b = task(4, TaskStatus::Pending, None);
        b.created_at.clone_from(&a.created_at);
        assert_eq!(fifo_cmp(&b, &a), Ordering::Less);
    }
}
