//! Task state machine and the durable task record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its context to become idle.
    Pending,
    /// Claimed by the scheduler; an agent is working on it.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped on request, either while queued or while running.
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Cancelled) |
            // From Running
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A unit of work bound to one context.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Store-assigned, monotonically increasing.
    pub id: i64,
    /// Chat that submitted the task; results go back here.
    pub submitter: String,
    pub context: String,
    pub prompt: String,
    pub status: TaskStatus,
    /// Final result text, or the error message for failed tasks.
    pub result: Option<String>,
    /// Tool invocations observed during the run.
    pub tool_count: u32,
    /// Transport message id of the progress indicator, if any.
    pub progress_handle: Option<i64>,
    /// The submitter explicitly asked for multi-agent orchestration.
    pub orchestration_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Wall-clock time between start and finish (or now, if still running).
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.finished_at.unwrap_or_else(Utc::now);
            let duration = end.signed_duration_since(start);
            Duration::from_secs(duration.num_seconds().max(0) as u64)
        })
    }

    /// `[#id | context]` prefix used on every message about this task.
    pub fn tag(&self) -> String {
        format!("[#{} | {}]", self.id, self.context)
    }
}

/// Input for [`crate::store::Database::submit_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub submitter: String,
    pub context: String,
    pub prompt: String,
    pub progress_handle: Option<i64>,
    pub orchestration_requested: bool,
}

impl NewTask {
    pub fn new(
        submitter: impl Into<String>,
        context: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            submitter: submitter.into(),
            context: context.into(),
            prompt: prompt.into(),
            progress_handle: None,
            orchestration_requested: false,
        }
    }

    pub fn with_progress_handle(mut self, handle: Option<i64>) -> Self {
        self.progress_handle = handle;
        self
    }

    pub fn with_orchestration(mut self, requested: bool) -> Self {
        self.orchestration_requested = requested;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            for target in [
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(target),
                    "{terminal} -> {target} should be rejected"
                );
            }
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("stuck".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn status_serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn new_task_builder() {
        let t = NewTask::new("42", "vm", "hello")
            .with_progress_handle(Some(7))
            .with_orchestration(true);
        assert_eq!(t.submitter, "42");
        assert_eq!(t.progress_handle, Some(7));
        assert!(t.orchestration_requested);
    }
}
