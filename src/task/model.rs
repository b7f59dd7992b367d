#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

use crate::error::AgentqError;

/// Fixed-width UTC timestamps so that text ordering equals time ordering.
const TIMESTAMP_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

#[must_use]
pub fn now_timestamp() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}

#[must_use]
pub fn format_timestamp(t: OffsetDateTime) -> String {
    t.to_offset(time::UtcOffset::UTC)
        .format(TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| "1970-01-01T00:00:00.000000Z".to_owned())
}

#[must_use]
pub fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    time::PrimitiveDateTime::parse(s, TIMESTAMP_FORMAT)
        .map(time::PrimitiveDateTime::assume_utc)
        .ok()
        .or_else(|| {
            OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339).ok()
        })
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AgentqError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(AgentqError::Validation(format!(
                        "invalid {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

text_enum!(TaskStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Generic,
    Explore,
    Plan,
    Implement,
    Review,
    Improve,
}

text_enum!(TaskType {
    Generic => "generic",
    Explore => "explore",
    Plan => "plan",
    Implement => "implement",
    Review => "review",
    Improve => "improve",
});

impl TaskType {
    /// Code-producing tasks get their own branch; the rest run detached.
    #[must_use]
    pub fn produces_code(self) -> bool {
        matches!(self, Self::Generic | Self::Implement | Self::Improve)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MergeStatus {
    Unmerged,
    Merged,
}

text_enum!(MergeStatus {
    Unmerged => "unmerged",
    Merged => "merged",
});

impl MergeStatus {
    /// `None -> Unmerged -> Merged`, never backwards.
    #[must_use]
    pub fn can_advance(from: Option<Self>, to: Self) -> bool {
        match (from, to) {
            (None, _) | (Some(Self::Unmerged), Self::Merged) => true,
            (Some(a), b) => a == b,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    MaxSteps,
    MaxTurns,
    Timeout,
    Interrupted,
    TestFailure,
    WorkspaceConflict,
    ProviderError,
    NoChanges,
    Unknown,
}

text_enum!(FailureReason {
    MaxSteps => "MAX_STEPS",
    MaxTurns => "MAX_TURNS",
    Timeout => "TIMEOUT",
    Interrupted => "INTERRUPTED",
    TestFailure => "TEST_FAILURE",
    WorkspaceConflict => "WORKSPACE_CONFLICT",
    ProviderError => "PROVIDER_ERROR",
    NoChanges => "NO_CHANGES",
    Unknown => "UNKNOWN",
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDraft {
    pub prompt: String,
    pub task_type: TaskType,
    pub spec: Option<String>,
    pub group: Option<String>,
    pub depends_on: Option<i64>,
    pub based_on: Option<i64>,
    pub same_branch: bool,
    pub task_type_hint: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub max_steps: Option<u32>,
    pub max_turns: Option<u32>,
}

impl TaskDraft {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    /// Human-readable `YYYYMMDD-slug`, assigned on first execution.
    pub slug: Option<String>,

    pub prompt: String,
    pub task_type: TaskType,
    pub spec: Option<String>,
    pub group: Option<String>,
    pub task_type_hint: Option<String>,

    pub depends_on: Option<i64>,
    pub based_on: Option<i64>,
    pub same_branch: bool,

    pub status: TaskStatus,
    pub session_id: Option<String>,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub log_file: Option<String>,
    pub report_file: Option<String>,
    pub output_content: Option<String>,
    pub worker_id: Option<String>,

    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub num_steps_reported: Option<u32>,
    pub num_steps_computed: Option<u32>,
    pub num_turns_reported: Option<u32>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub failure_reason: Option<FailureReason>,
    pub has_commits: Option<bool>,
    pub merge_status: Option<MergeStatus>,
    pub pr_number: Option<i64>,
    pub diff_files_changed: Option<u32>,
    pub diff_lines_added: Option<u32>,
    pub diff_lines_removed: Option<u32>,

    pub provider: Option<String>,
    pub model: Option<String>,
    pub max_steps: Option<u32>,
    pub max_turns: Option<u32>,
}

impl Task {
    #[must_use]
    pub fn from_draft(id: i64, draft: &TaskDraft, created_at: String) -> Self {
        Self {
            id,
            slug: None,
            prompt: draft.prompt.clone(),
            task_type: draft.task_type,
            spec: draft.spec.clone(),
            group: draft.group.clone(),
            task_type_hint: draft.task_type_hint.clone(),
            depends_on: draft.depends_on,
            based_on: draft.based_on,
            same_branch: draft.same_branch,
            status: TaskStatus::Pending,
            session_id: None,
            branch: None,
            worktree_path: None,
            log_file: None,
            report_file: None,
            output_content: None,
            worker_id: None,
            created_at,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            num_steps_reported: None,
            num_steps_computed: None,
            num_turns_reported: None,
            input_tokens: None,
            output_tokens: None,
            cost_usd: None,
            failure_reason: None,
            has_commits: None,
            merge_status: None,
            pr_number: None,
            diff_files_changed: None,
            diff_lines_added: None,
            diff_lines_removed: None,
            provider: draft.provider.clone(),
            model: draft.model.clone(),
            max_steps: draft.max_steps,
            max_turns: draft.max_turns,
        }
    }

    #[must_use]
    pub fn label(&self) -> String {
        self.slug
            .clone()
            .unwrap_or_else(|| format!("#{}", self.id))
    }

    pub fn reset_metrics(&mut self) {
        self.session_id = None;
        self.duration_seconds = None;
        self.num_steps_reported = None;
        self.num_steps_computed = None;
        self.num_turns_reported = None;
        self.input_tokens = None;
        self.output_tokens = None;
        self.cost_usd = None;
        self.failure_reason = None;
        self.completed_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = OffsetDateTime::from_unix_timestamp_nanos(1_700_000_000_050_000_000).unwrap();
        let b = OffsetDateTime::from_unix_timestamp_nanos(1_700_000_000_500_000_000).unwrap();
        let c = OffsetDateTime::from_unix_timestamp_nanos(1_700_000_001_000_000_000).unwrap();
        let (sa, sb, sc) = (format_timestamp(a), format_timestamp(b), format_timestamp(c));
        assert!(sa < sb && sb < sc);
        assert_eq!(parse_timestamp(&sb), Some(b));
    }

    #[test]
    fn merge_status_only_moves_forward() {
        assert!(MergeStatus::can_advance(None, MergeStatus::Unmerged));
        assert!(MergeStatus::can_advance(
            Some(MergeStatus::Unmerged),
            MergeStatus::Merged
        ));
        assert!(!MergeStatus::can_advance(
            Some(MergeStatus::Merged),
            MergeStatus::Unmerged
        ));
    }

    #[test]
    fn enums_round_trip_through_text() {
        assert_eq!(
            "in_progress".parse::<TaskStatus>().unwrap(),
            TaskStatus::InProgress
        );
        assert_eq!(
            "MAX_STEPS".parse::<FailureReason>().unwrap(),
            FailureReason::MaxSteps
        );
        assert!("bogus".parse::<TaskType>().is_err());
        assert!(TaskType::Improve.produces_code());
        assert!(!TaskType::Review.produces_code());
    }
}
