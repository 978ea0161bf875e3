//! Automatic detection of gaps and draining of the queue.

use super::backfill::BackfillQueue;
use super::item::BackfillRequest;
use crate::core::{QueuePriority, QueueStatus};
use crate::errors::{QueueError, Result};
use crate::gate::{CompletenessGate, GateDecision};
use crate::jobs::{JobRegistry, ALL_ENTITIES};
use crate::quality::{QualityEvent, QualityEventLog, QualityEventType, Severity};
use crate::utils::{date_range, Clock, SystemClock};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// What a scan found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// (date, entity) pairs checked.
    pub checked: usize,
    /// Pairs the gate blocked.
    pub blocked: usize,
    /// New queue items.
    pub enqueued: usize,
    /// Blocked pairs that already had an open item.
    pub already_queued: usize,
}

/// What a drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Stale RUNNING items returned to PENDING.
    pub recovered: usize,
    /// Items claimed.
    pub claimed: usize,
    /// Items that completed.
    pub completed: usize,
    /// Items that failed this pass.
    pub failed: usize,
    /// Items another worker took first.
    pub conflicts: usize,
}

/// Turns completeness gaps into queue items and drains the queue.
#[derive(Debug)]
pub struct AutoBackfill {
    gate: Arc<CompletenessGate>,
    queue: Arc<BackfillQueue>,
    events: QualityEventLog,
    clock: Arc<dyn Clock>,
}

impl AutoBackfill {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        gate: Arc<CompletenessGate>,
        queue: Arc<BackfillQueue>,
        events: QualityEventLog,
    ) -> Self {
        Self {
            gate,
            queue,
            events,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Checks `job` for every date in `[start, end]` and enqueues blocked
    /// (date, entity) pairs. An empty `entities` slice checks the whole date.
    pub async fn scan(
        &self,
        job: &str,
        entities: &[String],
        start: NaiveDate,
        end: NaiveDate,
        priority: QueuePriority,
        correlation_id: Option<String>,
    ) -> Result<ScanReport> {
        let whole_date = [ALL_ENTITIES.to_string()];
        let entities = if entities.is_empty() { &whole_date[..] } else { entities };
        let mut report = ScanReport::default();

        for date in date_range(start, end) {
            let verdicts = self.gate.check_batch(job, entities, date).await?;
            report.checked += verdicts.len();

            for verdict in verdicts.into_iter().filter(|v| v.decision() == GateDecision::Block) {
                report.blocked += 1;
                let issue = QualityEvent::new(
                    QualityEventType::IssueDetected,
                    Severity::Warning,
                    job,
                    format!(
                        "{} incomplete for {} on {}: {}",
                        job, verdict.entity, date, verdict.processing_decision_reason
                    ),
                    self.clock.now(),
                )
                .with_date(date)
                .with_metric("completeness_pct")
                .with_correlation_id(correlation_id.clone());
                let issue_id = self.events.record(issue).await;

                let reason = verdict.processing_decision_reason.clone();
                let mut request = BackfillRequest::new(job, date, reason)
                    .with_priority(priority)
                    .with_correlation_id(correlation_id.clone())
                    .with_related_event(issue_id);
                if verdict.entity != ALL_ENTITIES {
                    request = request.with_entity(verdict.entity.clone());
                }

                if self.queue.enqueue(request).await?.enqueued {
                    report.enqueued += 1;
                } else {
                    report.already_queued += 1;
                }
            }
        }

        info!(
            job,
            %start,
            %end,
            checked = report.checked,
            blocked = report.blocked,
            enqueued = report.enqueued,
            "backfill scan finished"
        );
        Ok(report)
    }

    /// Recovers stale items, then claims and executes up to `limit` items.
    pub async fn drain_once(&self, limit: usize, registry: &JobRegistry) -> Result<DrainReport> {
        let mut report = DrainReport {
            recovered: self.queue.recover_stale().await?,
            ..DrainReport::default()
        };

        let claimed = self.queue.claim(limit).await?;
        report.claimed = claimed.len();

        for item in claimed {
            match self.queue.execute(&item, registry).await {
                Ok(done) if done.status == QueueStatus::Completed => report.completed += 1,
                Ok(_) => report.failed += 1,
                Err(
                    QueueError::InvalidTransition { .. }
                    | QueueError::ClaimHeld { .. }
                    | QueueError::LeaseLost(_),
                ) => {
                    warn!(item_id = %item.id, "backfill item taken by another worker");
                    report.conflicts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if report.claimed > 0 || report.recovered > 0 {
            info!(
                claimed = report.claimed,
                completed = report.completed,
                failed = report.failed,
                recovered = report.recovered,
                "backfill drain pass finished"
            );
        }
        Ok(report)
    }
}
