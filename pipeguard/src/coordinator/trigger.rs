//! Request and response types of the trigger and manual-run entry points.

use crate::core::RunStatus;
use crate::executor::{TaskResult, WorkflowResult};
use crate::scheduler::ScheduleDecision;
use crate::utils::DateArg;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A completion signal from an upstream stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    /// Signal name, looked up in the `[triggers]` table.
    pub source_signal: String,
    /// Date the upstream stage processed; defaults to `AUTO`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<DateArg>,
    /// Whether the upstream stage succeeded.
    #[serde(default = "default_success")]
    pub success: bool,
    /// Correlates downstream work with this signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Who or what sent the signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
}

const fn default_success() -> bool {
    true
}

impl TriggerPayload {
    /// Creates a successful signal for `AUTO`.
    #[must_use]
    pub fn new(source_signal: impl Into<String>) -> Self {
        Self {
            source_signal: source_signal.into(),
            target_date: None,
            success: true,
            correlation_id: None,
            triggered_by: None,
        }
    }

    /// Sets the target date.
    #[must_use]
    pub fn with_target_date(mut self, date: DateArg) -> Self {
        self.target_date = Some(date);
        self
    }

    /// Sets the upstream success flag.
    #[must_use]
    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Sets the sender.
    #[must_use]
    pub fn with_triggered_by(mut self, who: impl Into<String>) -> Self {
        self.triggered_by = Some(who.into());
        self
    }
}

/// Flags for a manual run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Reprocess a historical date.
    #[serde(default)]
    pub backfill_mode: bool,
    /// Refuse bootstrap-mode data.
    #[serde(default)]
    pub strict_mode: bool,
    /// Bypass the completeness gate.
    #[serde(default)]
    pub skip_dependency_check: bool,
}

/// Response of a trigger or manual run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerResponse {
    /// Overall status.
    pub status: RunStatus,
    /// Resolved target date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<NaiveDate>,
    /// Per-job results.
    pub results: Vec<TaskResult>,
    /// Why nothing ran, when nothing did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Correlation id carried through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl TriggerResponse {
    /// A response for a run that dispatched nothing.
    #[must_use]
    pub fn empty(status: RunStatus, message: impl Into<String>, correlation_id: Option<String>) -> Self {
        Self {
            status,
            target_date: None,
            results: Vec::new(),
            message: Some(message.into()),
            correlation_id,
        }
    }

    /// Builds a response from an executed run.
    #[must_use]
    pub fn from_run(result: WorkflowResult, target_date: NaiveDate, correlation_id: Option<String>) -> Self {
        Self {
            status: result.status,
            target_date: Some(target_date),
            results: result.tasks,
            message: None,
            correlation_id,
        }
    }

    /// HTTP status for front-ends: 500 only when everything failed.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.status.http_status()
    }
}

/// What one scheduler tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    /// Local date evaluated.
    pub date: Option<NaiveDate>,
    /// Every decision, in workflow priority order.
    pub decisions: Vec<ScheduleDecision>,
    /// Runs dispatched by this tick.
    pub runs: Vec<WorkflowResult>,
    /// Workflows whose due slot had already run.
    pub already_ran: Vec<String>,
}
