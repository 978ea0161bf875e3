//! Data-quality audit events.

use crate::utils::{generate_uuid, Timestamp};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of quality event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityEventType {
    /// A problem was detected.
    IssueDetected,
    /// Remediation was queued.
    BackfillQueued,
    /// Remediation started.
    BackfillStarted,
    /// Remediation succeeded.
    BackfillCompleted,
    /// Remediation failed.
    BackfillFailed,
    /// The problem went away without intervention.
    SelfHealed,
    /// Rows were excluded by validation.
    ValidationBlocked,
    /// An alert went out.
    AlertSent,
    /// An operator fixed the data by hand.
    ManualFix,
}

impl fmt::Display for QualityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IssueDetected => "issue_detected",
            Self::BackfillQueued => "backfill_queued",
            Self::BackfillStarted => "backfill_started",
            Self::BackfillCompleted => "backfill_completed",
            Self::BackfillFailed => "backfill_failed",
            Self::SelfHealed => "self_healed",
            Self::ValidationBlocked => "validation_blocked",
            Self::AlertSent => "alert_sent",
            Self::ManualFix => "manual_fix",
        };
        f.write_str(s)
    }
}

/// Event severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    #[default]
    Info,
    /// Needs attention eventually.
    Warning,
    /// Output is wrong or missing.
    Error,
    /// Production output is blocked.
    Critical,
}

/// An append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityEvent {
    /// Unique id.
    pub id: String,
    /// When the event happened.
    pub timestamp: Timestamp,
    /// Kind of event.
    pub event_type: QualityEventType,
    /// Severity.
    pub severity: Severity,
    /// Affected table or job.
    pub table: String,
    /// Affected date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    /// Affected metric, e.g. `completeness_pct`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    /// Human-readable description.
    pub description: String,
    /// The event this one follows from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_event_id: Option<String>,
    /// Correlates events across components.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl QualityEvent {
    /// Creates an event with a fresh id.
    #[must_use]
    pub fn new(
        event_type: QualityEventType,
        severity: Severity,
        table: impl Into<String>,
        description: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: generate_uuid().to_string(),
            timestamp,
            event_type,
            severity,
            table: table.into(),
            date: None,
            metric: None,
            description: description.into(),
            related_event_id: None,
            correlation_id: None,
        }
    }

    /// Sets the affected date.
    #[must_use]
    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    /// Sets the affected metric.
    #[must_use]
    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = Some(metric.into());
        self
    }

    /// Links to an earlier event.
    #[must_use]
    pub fn with_related(mut self, event_id: impl Into<String>) -> Self {
        self.related_event_id = Some(event_id.into());
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }
}
