//! Backfill queue operations.
//!
//! Every status transition is written to the quality event log so that an
//! item's history can be reconstructed from its correlation id.

use super::backoff::BackoffPolicy;
use super::item::{BackfillRequest, QueueItem, QueueStats};
use super::store::{InsertOutcome, QueueStore};
use crate::config::QueueConfig;
use crate::core::QueueStatus;
use crate::errors::{JobError, QueueError};
use crate::jobs::{JobOptions, JobRegistry};
use crate::quality::{QualityEvent, QualityEventLog, QualityEventType, Severity};
use crate::utils::{short_id, Clock, SystemClock};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, info, warn};

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    /// Id of the new item, or of the open item that blocked it.
    pub id: String,
    /// False when deduplicated against an open item.
    pub enqueued: bool,
}

/// The backfill queue.
pub struct BackfillQueue {
    store: Arc<dyn QueueStore>,
    events: QualityEventLog,
    config: QueueConfig,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
    worker_id: String,
    job_timeout: Option<StdDuration>,
}

impl fmt::Debug for BackfillQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackfillQueue")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BackfillQueue {
    /// Creates a queue over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn QueueStore>, events: QualityEventLog, config: QueueConfig) -> Self {
        Self {
            store,
            events,
            backoff: BackoffPolicy::from_config(&config),
            config,
            clock: Arc::new(SystemClock),
            worker_id: format!("worker-{}", short_id()),
            job_timeout: None,
        }
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the worker id recorded on claims.
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Sets the per-run job deadline. It is capped below the lease so a
    /// run always ends before its claim can be recovered.
    #[must_use]
    pub fn with_job_timeout(mut self, timeout: StdDuration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Returns the worker id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Adds remediation work unless an open item already covers it.
    pub async fn enqueue(&self, request: BackfillRequest) -> Result<EnqueueOutcome, QueueError> {
        let now = self.clock.now();
        let related = request.related_event_id.clone();
        let item = QueueItem::from_request(request, self.config.default_max_attempts, now);
        let id = item.id.clone();

        match self.store.insert_unique(item.clone()).await? {
            InsertOutcome::Duplicate(existing) => {
                debug!(
                    job = %item.job,
                    entity = %item.entity,
                    date = %item.date,
                    existing_id = %existing,
                    "backfill already open, not enqueued"
                );
                Ok(EnqueueOutcome {
                    id: existing,
                    enqueued: false,
                })
            }
            InsertOutcome::Inserted => {
                info!(
                    item_id = %id,
                    job = %item.job,
                    entity = %item.entity,
                    date = %item.date,
                    priority = %item.priority,
                    "backfill enqueued"
                );
                let mut event = self
                    .transition_event(&item, QualityEventType::BackfillQueued, Severity::Info)
                    .with_metric("queue_item");
                if let Some(related) = related {
                    event = event.with_related(related);
                }
                self.events.record(event).await;
                Ok(EnqueueOutcome { id, enqueued: true })
            }
        }
    }

    /// Leases up to `limit` claimable items to this worker.
    pub async fn claim(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let lease_until = now + self.lease();
        let items = self
            .store
            .claim(limit, now, &self.worker_id, lease_until)
            .await?;
        debug!(worker = %self.worker_id, claimed = items.len(), limit, "backfill items claimed");
        Ok(items)
    }

    /// Runs a claimed item through its job in backfill mode.
    ///
    /// The item moves PENDING to RUNNING conditionally; if another worker
    /// got there first, the call fails with an invalid transition. The job
    /// runs under a deadline shorter than the lease, and its result is only
    /// stored while this worker still holds the claim.
    pub async fn execute(
        &self,
        item: &QueueItem,
        registry: &JobRegistry,
    ) -> Result<QueueItem, QueueError> {
        let started = self.clock.now();
        let mut running = self.require(&item.id).await?;
        if running.status == QueueStatus::Pending && running.is_exhausted() {
            return Err(QueueError::InvalidTransition {
                id: running.id,
                from: "PENDING (exhausted)".to_string(),
                to: QueueStatus::Running.to_string(),
            });
        }
        if let Some(owner) = running.claimed_by.as_deref() {
            let live = running.lease_until.is_some_and(|until| until > started);
            if live && owner != self.worker_id {
                return Err(QueueError::ClaimHeld {
                    id: running.id.clone(),
                    owner: owner.to_string(),
                });
            }
        }
        running.status = QueueStatus::Running;
        running.started_at = Some(started);
        running.claimed_by = Some(self.worker_id.clone());
        running.lease_until = Some(started + self.lease());
        if !self.store.compare_and_swap(&running, QueueStatus::Pending).await? {
            return Err(self.invalid(&item.id, QueueStatus::Running).await);
        }
        let event =
            self.transition_event(&running, QualityEventType::BackfillStarted, Severity::Info);
        self.events.record(event).await;

        let options = JobOptions::new(running.date)
            .with_backfill_mode(true)
            .with_correlation_id(running.correlation_id.clone());
        let options = match running.entity_filter() {
            Some(entity) => options.with_entity(entity),
            None => options,
        };

        let deadline = self.deadline();
        let timer = Instant::now();
        let result = tokio::time::timeout(deadline, registry.run(&running.job, &options)).await;
        let elapsed_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);
        let now = self.clock.now();

        let mut finished = running.clone();
        finished.claimed_by = None;
        finished.lease_until = None;

        let error = match result {
            Ok(Ok(outcome)) if outcome.success => None,
            Ok(Ok(outcome)) => Some(
                outcome
                    .message
                    .unwrap_or_else(|| "job reported failure".to_string()),
            ),
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(
                JobError::Timeout {
                    job: running.job.clone(),
                    seconds: deadline.as_secs(),
                }
                .to_string(),
            ),
        };

        match error {
            None => {
                finished.status = QueueStatus::Completed;
                finished.completed_at = Some(now);
                finished.duration_ms = Some(elapsed_ms);
                finished.last_error = None;
                info!(
                    item_id = %finished.id,
                    job = %finished.job,
                    duration_ms = elapsed_ms,
                    "backfill completed"
                );
                self.finish(&finished).await?;
                let event = self.transition_event(
                    &finished,
                    QualityEventType::BackfillCompleted,
                    Severity::Info,
                );
                self.events.record(event).await;
            }
            Some(message) => {
                finished.status = QueueStatus::Pending;
                finished.attempts = finished.attempts.saturating_add(1);
                finished.last_error = Some(message.clone());
                finished.scheduled_for = Some(now + self.backoff.delay_for(finished.attempts));
                let exhausted = finished.is_exhausted();
                warn!(
                    item_id = %finished.id,
                    job = %finished.job,
                    attempts = finished.attempts,
                    max_attempts = finished.max_attempts,
                    exhausted,
                    error = %message,
                    "backfill failed"
                );
                self.finish(&finished).await?;
                let severity = if exhausted { Severity::Error } else { Severity::Warning };
                let mut event =
                    self.transition_event(&finished, QualityEventType::BackfillFailed, severity);
                event.description = format!(
                    "{} (attempt {}/{}{})",
                    message,
                    finished.attempts,
                    finished.max_attempts,
                    if exhausted { ", exhausted" } else { "" }
                );
                self.events.record(event).await;
            }
        }

        Ok(finished)
    }

    /// Cancels a PENDING item.
    pub async fn cancel(&self, id: &str) -> Result<QueueItem, QueueError> {
        self.close_pending(id, QueueStatus::Cancelled, "cancelled").await
    }

    /// Operator give-up: moves a PENDING item to FAILED.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<QueueItem, QueueError> {
        self.close_pending(id, QueueStatus::Failed, reason).await
    }

    /// Returns RUNNING items whose lease has expired to PENDING, counting the
    /// lost run as a failed attempt. Returns how many were recovered.
    pub async fn recover_stale(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let mut recovered = 0;
        for item in self.store.list(Some(QueueStatus::Running)).await? {
            if item.lease_until.map_or(true, |until| until > now) {
                continue;
            }
            let mut reset = item.clone();
            reset.status = QueueStatus::Pending;
            reset.attempts = reset.attempts.saturating_add(1);
            reset.last_error = Some("lease expired while running".to_string());
            reset.claimed_by = None;
            reset.lease_until = None;
            if self.store.compare_and_swap(&reset, QueueStatus::Running).await? {
                warn!(item_id = %reset.id, job = %reset.job, "stale backfill recovered");
                let event =
                    self.transition_event(&reset, QualityEventType::BackfillFailed, Severity::Warning);
                self.events.record(event).await;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Returns one item.
    pub async fn get(&self, id: &str) -> Result<Option<QueueItem>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    /// Lists items, optionally by status.
    pub async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self.store.list(status).await?)
    }

    /// Counts items per status.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let items = self.store.list(None).await?;
        Ok(QueueStats::from_items(&items))
    }

    async fn close_pending(
        &self,
        id: &str,
        to: QueueStatus,
        reason: &str,
    ) -> Result<QueueItem, QueueError> {
        let mut item = self.require(id).await?;
        if item.status != QueueStatus::Pending {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: item.status.to_string(),
                to: to.to_string(),
            });
        }
        item.status = to;
        item.completed_at = Some(self.clock.now());
        item.claimed_by = None;
        item.lease_until = None;
        if to == QueueStatus::Failed {
            item.last_error = Some(reason.to_string());
        }
        if !self.store.compare_and_swap(&item, QueueStatus::Pending).await? {
            return Err(self.invalid(id, to).await);
        }

        info!(item_id = %id, status = %to, reason, "backfill closed");
        let mut event = self.transition_event(&item, QualityEventType::ManualFix, Severity::Info);
        event.description = format!("{} {}: {}", item.job, to, reason);
        self.events.record(event).await;
        Ok(item)
    }

    async fn finish(&self, item: &QueueItem) -> Result<(), QueueError> {
        if self.store.finish_owned(item, &self.worker_id).await? {
            Ok(())
        } else {
            warn!(item_id = %item.id, worker = %self.worker_id, "backfill lease lost, result discarded");
            Err(QueueError::LeaseLost(item.id.clone()))
        }
    }

    async fn require(&self, id: &str) -> Result<QueueItem, QueueError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    async fn invalid(&self, id: &str, to: QueueStatus) -> QueueError {
        let from = match self.store.get(id).await {
            Ok(Some(item)) => item.status.to_string(),
            _ => "unknown".to_string(),
        };
        QueueError::InvalidTransition {
            id: id.to_string(),
            from,
            to: to.to_string(),
        }
    }

    fn lease(&self) -> Duration {
        Duration::minutes(i64::try_from(self.config.lease_minutes).unwrap_or(60))
    }

    fn deadline(&self) -> StdDuration {
        let lease = StdDuration::from_secs(self.config.lease_minutes.saturating_mul(60));
        let cap = lease.saturating_sub(StdDuration::from_secs(1));
        self.job_timeout.map_or(cap, |timeout| timeout.min(cap))
    }

    fn transition_event(
        &self,
        item: &QueueItem,
        event_type: QualityEventType,
        severity: Severity,
    ) -> QualityEvent {
        QualityEvent::new(
            event_type,
            severity,
            item.job.clone(),
            format!(
                "{} {} for {} on {}: {}",
                event_type, item.id, item.entity, item.date, item.reason
            ),
            self.clock.now(),
        )
        .with_date(item.date)
        .with_correlation_id(item.correlation_id.clone())
    }
}
