//! Backfill queue items.

use crate::core::{QueuePriority, QueueStatus};
use crate::jobs::ALL_ENTITIES;
use crate::utils::{generate_uuid_v7, Timestamp};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A request to enqueue remediation work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRequest {
    /// Job to re-run.
    pub job: String,
    /// Entity to re-run for, or the whole date.
    pub entity: Option<String>,
    /// Date to re-run.
    pub date: NaiveDate,
    /// Why the work is needed.
    pub reason: String,
    /// Claim priority.
    pub priority: QueuePriority,
    /// Correlates the item with the trigger that detected the problem.
    pub correlation_id: Option<String>,
    /// Quality event that detected the problem.
    pub related_event_id: Option<String>,
    /// Overrides the configured max attempts.
    pub max_attempts: Option<u32>,
}

impl BackfillRequest {
    /// Creates a normal-priority request.
    #[must_use]
    pub fn new(job: impl Into<String>, date: NaiveDate, reason: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            entity: None,
            date,
            reason: reason.into(),
            priority: QueuePriority::Normal,
            correlation_id: None,
            related_event_id: None,
            max_attempts: None,
        }
    }

    /// Targets one entity.
    #[must_use]
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }

    /// Links the quality event that detected the problem.
    #[must_use]
    pub fn with_related_event(mut self, event_id: impl Into<String>) -> Self {
        self.related_event_id = Some(event_id.into());
        self
    }

    /// Sets max attempts for this item.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A unit of remediation work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique id (time-ordered).
    pub id: String,
    /// Job to re-run.
    pub job: String,
    /// Entity, or `*` for the whole date.
    pub entity: String,
    /// Date to re-run.
    pub date: NaiveDate,
    /// Why the work is needed.
    pub reason: String,
    /// Claim priority.
    pub priority: QueuePriority,
    /// Lifecycle status.
    pub status: QueueStatus,
    /// Failed executions so far.
    pub attempts: u32,
    /// Executions allowed before the item is dead-lettered.
    pub max_attempts: u32,
    /// Creation time.
    pub created_at: Timestamp,
    /// Not claimable before this time.
    pub scheduled_for: Option<Timestamp>,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Start of the latest execution.
    pub started_at: Option<Timestamp>,
    /// Completion time.
    pub completed_at: Option<Timestamp>,
    /// Duration of the successful execution.
    pub duration_ms: Option<u64>,
    /// Worker holding the claim.
    pub claimed_by: Option<String>,
    /// Claim expiry.
    pub lease_until: Option<Timestamp>,
    /// Correlation id.
    pub correlation_id: Option<String>,
}

impl QueueItem {
    /// Builds a pending item from a request.
    #[must_use]
    pub fn from_request(request: BackfillRequest, default_max_attempts: u32, now: Timestamp) -> Self {
        Self {
            id: generate_uuid_v7().to_string(),
            job: request.job,
            entity: request.entity.unwrap_or_else(|| ALL_ENTITIES.to_string()),
            date: request.date,
            reason: request.reason,
            priority: request.priority,
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts).max(1),
            created_at: now,
            scheduled_for: None,
            last_error: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            claimed_by: None,
            lease_until: None,
            correlation_id: request.correlation_id,
        }
    }

    /// Key enforcing one open item per unit of work.
    #[must_use]
    pub fn dedup_key(&self) -> (String, String, NaiveDate) {
        (self.job.clone(), self.entity.clone(), self.date)
    }

    /// Returns true if all attempts are used up.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Returns true if the item can be claimed at `now`.
    #[must_use]
    pub fn is_claimable(&self, now: Timestamp) -> bool {
        self.status == QueueStatus::Pending
            && !self.is_exhausted()
            && self.scheduled_for.map_or(true, |at| at <= now)
            && self.lease_until.map_or(true, |until| until <= now)
    }

    /// Entity as an option, `None` for whole-date items.
    #[must_use]
    pub fn entity_filter(&self) -> Option<String> {
        (self.entity != ALL_ENTITIES).then(|| self.entity.clone())
    }
}

/// Counts of items per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending items (including exhausted ones).
    pub pending: usize,
    /// Running items.
    pub running: usize,
    /// Completed items.
    pub completed: usize,
    /// Failed items.
    pub failed: usize,
    /// Cancelled items.
    pub cancelled: usize,
    /// Pending items that will never be claimed again.
    pub exhausted: usize,
}

impl QueueStats {
    /// Tallies a set of items.
    #[must_use]
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a QueueItem>) -> Self {
        let mut stats = Self::default();
        for item in items {
            match item.status {
                QueueStatus::Pending => {
                    stats.pending += 1;
                    if item.is_exhausted() {
                        stats.exhausted += 1;
                    }
                }
                QueueStatus::Running => stats.running += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => stats.failed += 1,
                QueueStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}
