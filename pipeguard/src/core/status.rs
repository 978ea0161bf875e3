//! Status and priority enums shared across components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a schedule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleAction {
    /// The workflow should run now.
    Run,
    /// The workflow should not run now.
    Skip,
}

impl fmt::Display for ScheduleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => write!(f, "RUN"),
            Self::Skip => write!(f, "SKIP"),
        }
    }
}

/// Lifecycle status of a backfill queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    /// Waiting to be claimed.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Given up on.
    Failed,
    /// Cancelled before running.
    Cancelled,
}

impl QueueStatus {
    /// Returns true while the item blocks a duplicate enqueue.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Priority of a backfill item. Higher values are claimed first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    /// Routine remediation.
    #[default]
    Normal = 0,
    /// Data a downstream stage is waiting on.
    Elevated = 1,
    /// Blocking production output.
    Critical = 2,
}

impl QueuePriority {
    /// Returns the numeric priority level.
    #[must_use]
    pub fn level(self) -> u8 {
        self as u8
    }

    /// Converts a numeric level, saturating at critical.
    #[must_use]
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Normal,
            1 => Self::Elevated,
            _ => Self::Critical,
        }
    }
}

impl fmt::Display for QueuePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Elevated => write!(f, "elevated"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Outcome of a single sub-task within a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The job reported success.
    Success,
    /// The job failed, timed out, or could not be dispatched.
    Failed,
    /// The task did not run (gate blocked, breaker open, upstream failed).
    Skipped,
}

impl TaskStatus {
    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Aggregate status of a trigger or manual run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every task succeeded (or was skipped by design).
    Completed,
    /// Some tasks failed, some succeeded.
    PartialFailure,
    /// Every executed task failed.
    Failed,
    /// The trigger was not actionable.
    Skipped,
    /// No processors are mapped to the trigger.
    NoProcessors,
}

impl RunStatus {
    /// HTTP status the front end should answer with.
    ///
    /// Only total failure returns 500 so that at-least-once redelivery is
    /// limited to runs that made no progress.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Failed => 500,
            Self::Completed | Self::PartialFailure | Self::Skipped | Self::NoProcessors => 200,
        }
    }

    /// Rolls task statuses up into a run status.
    ///
    /// Skipped tasks are not failures: a run where nothing failed is
    /// `Completed` if anything succeeded and `Skipped` otherwise.
    #[must_use]
    pub fn summarize(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        let (mut total, mut succeeded, mut failed) = (0usize, 0usize, 0usize);
        for status in statuses {
            total += 1;
            match status {
                TaskStatus::Success => succeeded += 1,
                TaskStatus::Failed => failed += 1,
                TaskStatus::Skipped => {}
            }
        }
        match (total, succeeded, failed) {
            (0, _, _) => Self::NoProcessors,
            (_, 0, 0) => Self::Skipped,
            (_, _, 0) => Self::Completed,
            (_, 0, _) => Self::Failed,
            _ => Self::PartialFailure,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::PartialFailure => write!(f, "partial_failure"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::NoProcessors => write!(f, "no_processors"),
        }
    }
}
