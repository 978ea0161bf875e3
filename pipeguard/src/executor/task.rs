//! Running one job invocation behind the breaker and the gate.

use crate::breaker::{CircuitBreaker, RetryKey};
use crate::core::{QueuePriority, TaskStatus};
use crate::errors::{JobError, PipeguardError};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::gate::{CompletenessGate, GateDecision};
use crate::jobs::{JobOptions, JobOutcome, JobRegistry};
use crate::observability::SpanTimer;
use crate::queue::{BackfillQueue, BackfillRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Result of one sub-task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Job name.
    pub job: String,
    /// What happened.
    pub status: TaskStatus,
    /// What the job reported, if it ran to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JobOutcome>,
    /// Failure or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Wall time spent, zero for tasks that never started.
    pub duration_ms: u64,
    /// Remediation queued for this failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backfill_item_id: Option<String>,
}

impl TaskResult {
    /// A task that did not run.
    #[must_use]
    pub fn skipped(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            status: TaskStatus::Skipped,
            outcome: None,
            reason: Some(reason.into()),
            duration_ms: 0,
            backfill_item_id: None,
        }
    }

    fn failed(job: &str, reason: String, outcome: Option<JobOutcome>, duration_ms: u64) -> Self {
        Self {
            job: job.to_string(),
            status: TaskStatus::Failed,
            outcome,
            reason: Some(reason),
            duration_ms,
            backfill_item_id: None,
        }
    }

    /// Returns true if the job ran and succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// Invokes jobs with breaker, gate, timeout and remediation handling.
///
/// Each call records at most one breaker attempt: one on failure, none on
/// skip, and a clear on success.
pub struct TaskRunner {
    registry: Arc<JobRegistry>,
    breaker: Arc<CircuitBreaker>,
    gate: Option<Arc<CompletenessGate>>,
    queue: Option<Arc<BackfillQueue>>,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("jobs", &self.registry.names())
            .field("gate", &self.gate.is_some())
            .field("queue", &self.queue.is_some())
            .finish_non_exhaustive()
    }
}

impl TaskRunner {
    /// Creates a runner without gate or remediation queue.
    #[must_use]
    pub fn new(registry: Arc<JobRegistry>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            registry,
            breaker,
            gate: None,
            queue: None,
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Gates every task on upstream completeness.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<CompletenessGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Queues remediation for failed and blocked tasks.
    #[must_use]
    pub fn with_backfill_queue(mut self, queue: Arc<BackfillQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Sets the lifecycle event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the job registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Runs `job` for `options`, giving up after `timeout`.
    pub async fn run(&self, job: &str, options: &JobOptions, timeout: Duration) -> TaskResult {
        let key = RetryKey::new(job, options.entity_key(), options.target_date);

        match self.breaker.check(&key).await {
            Ok(state) if state.active => {
                let until = state
                    .cooldown_until
                    .map_or_else(|| "unknown".to_string(), |t| t.to_rfc3339());
                return self
                    .skip(job, format!("circuit breaker open until {until} after {} attempts", state.attempts))
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                error!(job, error = %e, "circuit breaker check failed");
                return self.finish_failed(job, options, &key, e.to_string(), None, 0).await;
            }
        }

        match self.check_gate(job, options).await {
            Ok(Some(result)) => return result,
            Ok(None) => {}
            Err(e) => {
                error!(job, error = %e, "completeness check failed");
                let reason = format!("completeness check failed: {e}");
                return self.finish_failed(job, options, &key, reason, None, 0).await;
            }
        }

        let timer = SpanTimer::start(job);
        let run = tokio::time::timeout(timeout, self.registry.run(job, options)).await;
        let duration_ms = timer.elapsed_ms();

        match run {
            Ok(Ok(outcome)) if outcome.success => {
                if let Err(e) = self.breaker.record_success(&key).await {
                    warn!(job, error = %e, "failed to clear retry record");
                }
                info!(
                    job,
                    date = %options.target_date,
                    duration_ms,
                    rows = outcome.stats.rows_processed,
                    "task completed"
                );
                self.sink
                    .emit(
                        names::TASK_COMPLETED,
                        Some(json!({
                            "job": job,
                            "date": options.target_date,
                            "duration_ms": duration_ms,
                            "rows_processed": outcome.stats.rows_processed,
                        })),
                    )
                    .await;
                TaskResult {
                    job: job.to_string(),
                    status: TaskStatus::Success,
                    outcome: Some(outcome),
                    reason: None,
                    duration_ms,
                    backfill_item_id: None,
                }
            }
            Ok(Ok(outcome)) => {
                let reason = outcome
                    .message
                    .clone()
                    .unwrap_or_else(|| "job reported failure".to_string());
                self.finish_failed(job, options, &key, reason, Some(outcome), duration_ms)
                    .await
            }
            Ok(Err(e)) => {
                self.finish_failed(job, options, &key, e.to_string(), None, duration_ms)
                    .await
            }
            Err(_) => {
                let err = JobError::Timeout {
                    job: job.to_string(),
                    seconds: timeout.as_secs(),
                };
                self.finish_failed(job, options, &key, err.to_string(), None, duration_ms)
                    .await
            }
        }
    }

    /// Returns the skip result when the gate blocks. An unreadable source is
    /// an error: unchecked data never runs.
    async fn check_gate(
        &self,
        job: &str,
        options: &JobOptions,
    ) -> Result<Option<TaskResult>, PipeguardError> {
        let Some(gate) = self.gate.as_ref() else {
            return Ok(None);
        };
        if options.skip_dependency_check {
            return Ok(None);
        }

        let verdict = gate.check(job, options.entity_key(), options.target_date).await?;

        let blocked = match verdict.decision() {
            GateDecision::Proceed => false,
            GateDecision::ProceedBootstrap => options.strict_mode,
            GateDecision::Block => true,
        };
        if !blocked {
            return Ok(None);
        }

        let reason = format!(
            "upstream {:.1}% complete: {}",
            verdict.percentage, verdict.processing_decision_reason
        );
        let mut result = self.skip(job, reason.clone()).await;
        if !options.backfill_mode {
            result.backfill_item_id = self.enqueue(job, options, &reason).await;
        }
        Ok(Some(result))
    }

    async fn skip(&self, job: &str, reason: String) -> TaskResult {
        info!(job, reason = %reason, "task skipped");
        self.sink
            .emit(names::TASK_SKIPPED, Some(json!({"job": job, "reason": reason})))
            .await;
        TaskResult::skipped(job, reason)
    }

    async fn finish_failed(
        &self,
        job: &str,
        options: &JobOptions,
        key: &RetryKey,
        reason: String,
        outcome: Option<JobOutcome>,
        duration_ms: u64,
    ) -> TaskResult {
        error!(job, date = %options.target_date, reason = %reason, "task failed");

        match self.breaker.record_attempt(key).await {
            Ok(state) if state.active => {
                self.sink
                    .emit(
                        names::ALERT_BREAKER_TRIPPED,
                        Some(json!({
                            "key": key.to_string(),
                            "attempts": state.attempts,
                            "cooldown_until": state.cooldown_until,
                        })),
                    )
                    .await;
            }
            Ok(_) => {}
            Err(e) => warn!(job, error = %e, "failed to record breaker attempt"),
        }

        self.sink
            .emit(
                names::TASK_FAILED,
                Some(json!({"job": job, "date": options.target_date, "reason": reason})),
            )
            .await;

        let mut result = TaskResult::failed(job, reason.clone(), outcome, duration_ms);
        if !options.backfill_mode {
            result.backfill_item_id = self.enqueue(job, options, &reason).await;
        }
        result
    }

    async fn enqueue(&self, job: &str, options: &JobOptions, reason: &str) -> Option<String> {
        let queue = self.queue.as_ref()?;
        let mut request = BackfillRequest::new(job, options.target_date, reason)
            .with_priority(QueuePriority::Normal)
            .with_correlation_id(options.correlation_id.clone());
        if let Some(entity) = &options.entity {
            request = request.with_entity(entity.clone());
        }
        match queue.enqueue(request).await {
            Ok(outcome) => Some(outcome.id),
            Err(e) => {
                error!(job, error = %e, "failed to enqueue backfill");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::InMemoryRetryStore;
    use crate::config::{BreakerConfig, GateConfig, QueueConfig};
    use crate::events::CollectingEventSink;
    use crate::errors::StoreError;
    use crate::gate::{InMemoryCompletenessSource, MockCompletenessSource, UpstreamSnapshot};
    use crate::jobs::{FnJob, JobStats};
    use crate::quality::QualityEventLog;
    use crate::queue::InMemoryQueueStore;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            Arc::new(InMemoryRetryStore::new()),
            BreakerConfig::default(),
        ))
    }

    fn queue() -> Arc<BackfillQueue> {
        Arc::new(BackfillQueue::new(
            Arc::new(InMemoryQueueStore::new()),
            QualityEventLog::default(),
            QueueConfig::default(),
        ))
    }

    fn failing_registry(calls: Arc<AtomicUsize>) -> Arc<JobRegistry> {
        let job = FnJob::new("analytics", move |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(JobError::failed("analytics", "warehouse unavailable"))
            }
        });
        Arc::new(JobRegistry::new().with_job(job))
    }

    #[tokio::test]
    async fn test_success_clears_breaker() {
        let job = FnJob::new("analytics", |_| async { Ok(JobOutcome::ok(JobStats::new(5, 0))) });
        let breaker = breaker();
        let runner = TaskRunner::new(Arc::new(JobRegistry::new().with_job(job)), breaker.clone());

        let result = runner
            .run("analytics", &JobOptions::new(date()), Duration::from_secs(5))
            .await;
        assert!(result.succeeded());
        assert_eq!(result.outcome.unwrap().stats.rows_processed, 5);

        let key = RetryKey::new("analytics", "*", date());
        assert_eq!(breaker.check(&key).await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_failure_records_one_attempt_and_enqueues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let breaker = breaker();
        let queue = queue();
        let sink = Arc::new(CollectingEventSink::new());
        let runner = TaskRunner::new(failing_registry(calls.clone()), breaker.clone())
            .with_backfill_queue(queue.clone())
            .with_event_sink(sink.clone());

        let result = runner
            .run("analytics", &JobOptions::new(date()), Duration::from_secs(5))
            .await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.reason.unwrap().contains("warehouse unavailable"));
        assert!(result.backfill_item_id.is_some());
        let key = RetryKey::new("analytics", "*", date());
        assert_eq!(breaker.check(&key).await.unwrap().attempts, 1);
        assert_eq!(queue.list(None).await.unwrap().len(), 1);
        assert_eq!(sink.events_of_type(names::TASK_FAILED).len(), 1);
    }

    #[tokio::test]
    async fn test_breaker_trips_and_then_skips() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(CollectingEventSink::new());
        let runner = TaskRunner::new(failing_registry(calls.clone()), breaker())
            .with_event_sink(sink.clone());
        let options = JobOptions::new(date());

        for _ in 0..3 {
            let r = runner.run("analytics", &options, Duration::from_secs(5)).await;
            assert_eq!(r.status, TaskStatus::Failed);
        }
        assert_eq!(sink.events_of_type(names::ALERT_BREAKER_TRIPPED).len(), 1);

        let r = runner.run("analytics", &options, Duration::from_secs(5)).await;
        assert_eq!(r.status, TaskStatus::Skipped);
        assert!(r.reason.unwrap().contains("circuit breaker open"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_a_failed_result() {
        let job = FnJob::new("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(JobOutcome::ok(JobStats::default()))
        });
        let runner = TaskRunner::new(Arc::new(JobRegistry::new().with_job(job)), breaker());

        let result = runner
            .run("slow", &JobOptions::new(date()), Duration::from_millis(20))
            .await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_gate_blocks_and_enqueues() {
        let source = InMemoryCompletenessSource::new();
        source.set("default", date(), UpstreamSnapshot::new("*", 10, 5));
        let gate = Arc::new(CompletenessGate::new(Arc::new(source), GateConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = queue();
        let runner = TaskRunner::new(failing_registry(calls.clone()), breaker())
            .with_gate(gate)
            .with_backfill_queue(queue.clone());

        let result = runner
            .run("analytics", &JobOptions::new(date()), Duration::from_secs(5))
            .await;
        assert_eq!(result.status, TaskStatus::Skipped);
        assert!(result.reason.unwrap().starts_with("upstream 50.0% complete"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.list(None).await.unwrap().len(), 1);

        // Skipping the dependency check runs the job anyway.
        let options = JobOptions::new(date()).with_skip_dependency_check(true);
        let result = runner.run("analytics", &options, Duration::from_secs(5)).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_bootstrap() {
        let source = InMemoryCompletenessSource::new();
        source.set("default", date(), UpstreamSnapshot::new("*", 10, 5));
        let config = GateConfig {
            season_start: Some(date()),
            ..GateConfig::default()
        };
        let gate = Arc::new(CompletenessGate::new(Arc::new(source), config));
        let job = FnJob::new("analytics", |_| async { Ok(JobOutcome::ok(JobStats::default())) });
        let runner = TaskRunner::new(Arc::new(JobRegistry::new().with_job(job)), breaker()).with_gate(gate);

        let lenient = runner
            .run("analytics", &JobOptions::new(date()), Duration::from_secs(5))
            .await;
        assert!(lenient.succeeded());

        let strict = runner
            .run("analytics", &JobOptions::new(date()).with_strict_mode(true), Duration::from_secs(5))
            .await;
        assert_eq!(strict.status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_gate_error_fails_closed() {
        let mut source = MockCompletenessSource::new();
        source
            .expect_fetch()
            .returning(|_, _, _, _| Err(StoreError::Unavailable("warehouse down".to_string())));
        let gate = Arc::new(CompletenessGate::new(Arc::new(source), GateConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let job = FnJob::new("analytics", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(JobOutcome::ok(JobStats::default()))
            }
        });
        let breaker = breaker();
        let queue = queue();
        let runner = TaskRunner::new(Arc::new(JobRegistry::new().with_job(job)), breaker.clone())
            .with_gate(gate)
            .with_backfill_queue(queue.clone());
        let key = RetryKey::new("analytics", "*", date());

        for strict in [false, true] {
            let options = JobOptions::new(date()).with_strict_mode(strict);
            let result = runner.run("analytics", &options, Duration::from_secs(5)).await;
            assert_eq!(result.status, TaskStatus::Failed);
            assert!(result.reason.unwrap().contains("completeness check failed"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.check(&key).await.unwrap().attempts, 2);
        assert_eq!(queue.list(None).await.unwrap().len(), 1);

        // Backfill runs record the attempt but queue nothing new.
        let options = JobOptions::new(date()).with_backfill_mode(true);
        let result = runner.run("analytics", &options, Duration::from_secs(5)).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.backfill_item_id.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unregistered_job_fails() {
        let runner = TaskRunner::new(Arc::new(JobRegistry::new()), breaker());
        let result = runner
            .run("missing", &JobOptions::new(date()), Duration::from_secs(1))
            .await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.reason.unwrap().contains("not registered"));
    }
}
