//! The coordinator: triggers, manual runs, scheduler ticks and drains.

use super::context::CoordinatorContext;
use super::schedule::ExpectedScheduleEntry;
use super::trigger::{RunOptions, TickReport, TriggerPayload, TriggerResponse};
use crate::breaker::{CircuitBreaker, RetryKey, RetryRecord};
use crate::cancellation::ShutdownToken;
use crate::config::{CoordinatorConfig, DecisionType, WorkflowSpec};
use crate::core::{QueuePriority, RunStatus, ScheduleAction};
use crate::errors::Result;
use crate::events::names;
use crate::executor::{TaskRunner, WorkflowExecutor};
use crate::gate::CompletenessGate;
use crate::jobs::JobOptions;
use crate::quality::QualityEventLog;
use crate::queue::{AutoBackfill, BackfillQueue, DrainReport, ScanReport};
use crate::scheduler::WorkflowScheduler;
use crate::utils::{generate_uuid, local_date, DateArg, Timestamp};
use crate::writer::{IdempotentWriter, WarehouseBackend};
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde_json::json;
use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything derived from one configuration snapshot.
struct Components {
    config: Arc<CoordinatorConfig>,
    scheduler: WorkflowScheduler,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<BackfillQueue>,
    executor: WorkflowExecutor,
    auto: AutoBackfill,
}

/// Coordinates scheduled and triggered runs of pipeline stages.
///
/// Components are rebuilt lazily whenever the config store holds a new
/// snapshot, so a reload takes effect on the next call without a restart.
pub struct Coordinator {
    ctx: CoordinatorContext,
    events: QualityEventLog,
    components: Mutex<Option<Arc<Components>>>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Creates a coordinator from its context.
    #[must_use]
    pub fn new(ctx: CoordinatorContext) -> Self {
        let events = QualityEventLog::new(Arc::clone(&ctx.quality_store));
        Self {
            ctx,
            events,
            components: Mutex::new(None),
        }
    }

    /// Returns the context.
    #[must_use]
    pub fn context(&self) -> &CoordinatorContext {
        &self.ctx
    }

    /// Returns the quality event log.
    #[must_use]
    pub fn quality_events(&self) -> &QualityEventLog {
        &self.events
    }

    /// Returns the backfill queue for the current config.
    #[must_use]
    pub fn backfill_queue(&self) -> Arc<BackfillQueue> {
        Arc::clone(&self.components().queue)
    }

    /// Returns the circuit breaker for the current config.
    #[must_use]
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.components().breaker)
    }

    fn components(&self) -> Arc<Components> {
        let config = self.ctx.config.current();
        let mut guard = self.components.lock();
        if let Some(existing) = guard.as_ref() {
            if Arc::ptr_eq(&existing.config, &config) {
                return Arc::clone(existing);
            }
        }
        let built = Arc::new(self.build(config));
        *guard = Some(Arc::clone(&built));
        built
    }

    fn build(&self, config: Arc<CoordinatorConfig>) -> Components {
        let ctx = &self.ctx;
        let gate = Arc::new(
            CompletenessGate::new(Arc::clone(&ctx.completeness_source), config.gate.clone())
                .with_clock(Arc::clone(&ctx.clock)),
        );
        let breaker = Arc::new(
            CircuitBreaker::new(Arc::clone(&ctx.retry_store), config.breaker.clone())
                .with_clock(Arc::clone(&ctx.clock)),
        );
        let queue = Arc::new(
            BackfillQueue::new(Arc::clone(&ctx.queue_store), self.events.clone(), config.queue.clone())
                .with_clock(Arc::clone(&ctx.clock))
                .with_worker_id(ctx.worker_id.clone())
                .with_job_timeout(Duration::from_secs(config.executor.task_timeout_seconds)),
        );
        let runner = TaskRunner::new(Arc::clone(&ctx.registry), Arc::clone(&breaker))
            .with_gate(Arc::clone(&gate))
            .with_backfill_queue(Arc::clone(&queue))
            .with_event_sink(Arc::clone(&ctx.sink));
        let executor = WorkflowExecutor::new(Arc::new(runner), config.executor.clone())
            .with_event_sink(Arc::clone(&ctx.sink));
        let auto = AutoBackfill::new(gate, Arc::clone(&queue), self.events.clone())
            .with_clock(Arc::clone(&ctx.clock));

        debug!(workflows = config.workflows.len(), "coordinator components built");
        Components {
            scheduler: WorkflowScheduler::new(&config.scheduler),
            config,
            breaker,
            queue,
            executor,
            auto,
        }
    }

    /// Handles an upstream completion signal by running the mapped processors.
    pub async fn handle_trigger(&self, payload: TriggerPayload) -> TriggerResponse {
        let c = self.components();
        let correlation_id = payload
            .correlation_id
            .clone()
            .or_else(|| Some(generate_uuid().to_string()));

        self.ctx
            .sink
            .emit(
                names::TRIGGER_RECEIVED,
                Some(json!({
                    "source_signal": payload.source_signal,
                    "success": payload.success,
                    "triggered_by": payload.triggered_by,
                    "correlation_id": correlation_id,
                })),
            )
            .await;

        if !payload.success {
            info!(signal = %payload.source_signal, "upstream reported failure, skipping processors");
            return TriggerResponse::empty(
                RunStatus::Skipped,
                format!("upstream {} reported failure", payload.source_signal),
                correlation_id,
            );
        }

        let processors = c.config.processors_for(&payload.source_signal);
        if processors.is_empty() {
            warn!(signal = %payload.source_signal, "no processors mapped to signal");
            return TriggerResponse::empty(
                RunStatus::NoProcessors,
                format!("no processors mapped to {}", payload.source_signal),
                correlation_id,
            );
        }

        let target_date = payload
            .target_date
            .unwrap_or(DateArg::Auto)
            .resolve(self.ctx.clock.now(), c.scheduler.offset());
        let options = JobOptions::new(target_date).with_correlation_id(correlation_id.clone());

        info!(
            signal = %payload.source_signal,
            %target_date,
            processors = processors.len(),
            "dispatching trigger"
        );
        let label = format!("trigger:{}", payload.source_signal);
        let result = c.executor.execute_jobs(&label, processors, &options).await;
        TriggerResponse::from_run(result, target_date, correlation_id)
    }

    /// Runs `jobs` for a date outside the schedule.
    pub async fn run_for_date(&self, date: DateArg, jobs: &[String], options: RunOptions) -> TriggerResponse {
        let c = self.components();
        let correlation_id = Some(generate_uuid().to_string());
        if jobs.is_empty() {
            return TriggerResponse::empty(RunStatus::NoProcessors, "no jobs requested", correlation_id);
        }

        let target_date = date.resolve(self.ctx.clock.now(), c.scheduler.offset());
        let job_options = JobOptions::new(target_date)
            .with_backfill_mode(options.backfill_mode)
            .with_strict_mode(options.strict_mode)
            .with_skip_dependency_check(options.skip_dependency_check)
            .with_correlation_id(correlation_id.clone());

        info!(%date, %target_date, jobs = jobs.len(), backfill = options.backfill_mode, "manual run");
        let result = c.executor.execute_jobs("manual", jobs, &job_options).await;
        TriggerResponse::from_run(result, target_date, correlation_id)
    }

    /// Evaluates every workflow at `now` and runs each due slot once.
    ///
    /// Every decision is written to the expected-schedule ledger, RUN or not.
    pub async fn tick(&self, now: Timestamp) -> Result<TickReport> {
        let c = self.components();
        let store = &self.ctx.schedule_store;
        let date = c.scheduler.local_day(now);

        let mut workflows: Vec<&WorkflowSpec> = c.config.workflows.iter().collect();
        workflows.sort_by_key(|w| Reverse(w.priority));

        let mut report = TickReport {
            date: Some(date),
            ..TickReport::default()
        };

        for spec in workflows {
            let mut decision = c.scheduler.evaluate(spec, now, self.ctx.calendar.as_ref());

            if decision.should_run() && matches!(spec.decision, DecisionType::Discovery { .. }) {
                let done = store.get(date, &spec.id).await?.is_some_and(|e| e.succeeded);
                if done {
                    decision.action = ScheduleAction::Skip;
                    decision.reason = "discovery already succeeded today".to_string();
                    decision.target_time = None;
                }
            }

            store
                .record_decision(ExpectedScheduleEntry::from_decision(date, spec.decision.kind(), &decision))
                .await?;

            let slot = match decision.target_time {
                Some(slot) if decision.should_run() => slot,
                _ => {
                    debug!(workflow = %spec.id, reason = %decision.reason, "workflow not due");
                    report.decisions.push(decision);
                    continue;
                }
            };

            if !store.claim_slot(date, &spec.id, slot).await? {
                debug!(workflow = %spec.id, %slot, "slot already ran");
                report.already_ran.push(spec.id.clone());
                report.decisions.push(decision);
                continue;
            }

            let target_date = Self::scheduled_target_date(spec, slot, &c.scheduler);
            let options = JobOptions::new(target_date).with_correlation_id(Some(generate_uuid().to_string()));
            info!(workflow = %spec.id, %slot, %target_date, reason = %decision.reason, "running scheduled workflow");

            let result = c.executor.execute(spec, &options).await;
            if result.status == RunStatus::Completed {
                store.mark_succeeded(date, &spec.id).await?;
            }
            report.runs.push(result);
            report.decisions.push(decision);
        }

        if !report.runs.is_empty() {
            self.ctx
                .sink
                .emit(
                    names::SCHEDULE_TICK,
                    Some(json!({
                        "date": date,
                        "runs": report.runs.iter().map(|r| r.workflow_id.as_str()).collect::<Vec<_>>(),
                    })),
                )
                .await;
        }
        Ok(report)
    }

    /// Date a scheduled run processes: the slot's local day, or the day
    /// before for retrospective workflows.
    fn scheduled_target_date(spec: &WorkflowSpec, slot: Timestamp, scheduler: &WorkflowScheduler) -> NaiveDate {
        let day = local_date(slot, scheduler.offset());
        match spec.decision {
            DecisionType::EventAwareRetrospective { .. } => day.pred_opt().unwrap_or(day),
            _ => day,
        }
    }

    /// Returns the day's expected-schedule entries.
    pub async fn expected_schedule(&self, date: NaiveDate) -> Result<Vec<ExpectedScheduleEntry>> {
        Ok(self.ctx.schedule_store.list(date).await?)
    }

    /// Recovers stale claims, then claims and executes queued backfills.
    ///
    /// `limit` defaults to the configured drain batch size.
    pub async fn drain_backfill(&self, limit: Option<usize>) -> Result<DrainReport> {
        let c = self.components();
        let limit = limit.unwrap_or(c.config.queue.drain_batch_size);
        c.auto.drain_once(limit, &self.ctx.registry).await
    }

    /// Checks `job` over `[start, end]` and enqueues incomplete dates.
    pub async fn scan_backfill(
        &self,
        job: &str,
        entities: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ScanReport> {
        let c = self.components();
        c.auto
            .scan(job, entities, start, end, QueuePriority::Normal, None)
            .await
    }

    /// Clears a breaker record. Returns false if none existed.
    pub async fn reset_breaker(&self, job: &str, entity: &str, date: NaiveDate) -> Result<bool> {
        self.breaker().reset(&RetryKey::new(job, entity, date)).await
    }

    /// Lists breakers currently in cooldown.
    pub async fn list_tripped(&self) -> Result<Vec<RetryRecord>> {
        self.breaker().list_tripped().await
    }

    /// Builds a writer wired to this coordinator's event log, queue and sink.
    #[must_use]
    pub fn writer(&self, backend: Arc<dyn WarehouseBackend>) -> IdempotentWriter {
        let c = self.components();
        IdempotentWriter::new(backend, c.config.writer.clone(), self.events.clone())
            .with_event_sink(Arc::clone(&self.ctx.sink))
            .with_backfill_queue(Arc::clone(&c.queue))
            .with_clock(Arc::clone(&self.ctx.clock))
    }

    /// Spawns the scheduler and drain loops. Both stop on shutdown.
    pub fn spawn_loops(
        self: &Arc<Self>,
        shutdown: &ShutdownToken,
        tick_interval: Duration,
        drain_interval: Duration,
    ) -> Vec<JoinHandle<()>> {
        let ticker = {
            let coordinator = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = shutdown.wait() => {
                            debug!("scheduler loop stopping");
                            return;
                        }
                        _ = interval.tick() => {
                            let now = coordinator.ctx.clock.now();
                            if let Err(e) = coordinator.tick(now).await {
                                error!(error = %e, "scheduler tick failed");
                            }
                        }
                    }
                }
            })
        };

        let drainer = {
            let coordinator = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(drain_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = shutdown.wait() => {
                            debug!("drain loop stopping");
                            return;
                        }
                        _ = interval.tick() => {
                            if let Err(e) = coordinator.drain_backfill(None).await {
                                error!(error = %e, "backfill drain failed");
                            }
                        }
                    }
                }
            })
        };

        vec![ticker, drainer]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::core::TaskStatus;
    use crate::errors::JobError;
    use crate::events::CollectingEventSink;
    use crate::jobs::{FnJob, JobOutcome, JobRegistry, JobStats};
    use crate::scheduler::StaticEventCalendar;
    use crate::utils::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(day: u32, hour: u32, minute: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2025, 1, day, hour, minute, 0).unwrap()
    }

    fn counting_job(name: &str, calls: Arc<AtomicUsize>) -> FnJob {
        FnJob::new(name, move |_options| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(JobOutcome::ok(JobStats::new(1, 0)))
            }
        })
    }

    fn failing_job(name: &str) -> FnJob {
        FnJob::new(name, |_options| async { Err(JobError::failed("analytics", "boom")) })
    }

    fn base_config() -> CoordinatorConfig {
        let mut triggers = BTreeMap::new();
        triggers.insert("raw_complete".to_string(), vec!["analytics".to_string(), "features".to_string()]);
        CoordinatorConfig {
            triggers,
            ..CoordinatorConfig::default()
        }
    }

    struct Harness {
        coordinator: Coordinator,
        sink: Arc<CollectingEventSink>,
        clock: Arc<ManualClock>,
    }

    fn harness(config: CoordinatorConfig, registry: JobRegistry) -> Harness {
        let clock = Arc::new(ManualClock::new(at(10, 12, 0)));
        let sink = Arc::new(CollectingEventSink::new());
        let store = Arc::new(ConfigStore::from_config(config).unwrap());
        let ctx = CoordinatorContext::in_memory(store, Arc::new(registry))
            .with_clock(clock.clone())
            .with_event_sink(sink.clone())
            .with_calendar(Arc::new(
                StaticEventCalendar::new().with_event("game-1", at(10, 19, 0)),
            ));
        Harness {
            coordinator: Coordinator::new(ctx),
            sink,
            clock,
        }
    }

    #[tokio::test]
    async fn test_trigger_runs_mapped_processors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new()
            .with_job(counting_job("analytics", calls.clone()))
            .with_job(counting_job("features", calls.clone()));
        let h = harness(base_config(), registry);

        let response = h
            .coordinator
            .handle_trigger(TriggerPayload::new("raw_complete").with_correlation_id("corr-1"))
            .await;

        assert_eq!(response.status, RunStatus::Completed);
        assert_eq!(response.http_status(), 200);
        assert_eq!(response.results.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(response.target_date, NaiveDate::from_ymd_opt(2025, 1, 9));
        assert_eq!(response.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(h.sink.events_of_type(names::TRIGGER_RECEIVED).len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_upstream_failure_is_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new().with_job(counting_job("analytics", calls.clone()));
        let h = harness(base_config(), registry);

        let response = h
            .coordinator
            .handle_trigger(TriggerPayload::new("raw_complete").with_success(false))
            .await;

        assert_eq!(response.status, RunStatus::Skipped);
        assert!(response.results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trigger_unknown_signal() {
        let h = harness(base_config(), JobRegistry::new());
        let response = h.coordinator.handle_trigger(TriggerPayload::new("nothing")).await;
        assert_eq!(response.status, RunStatus::NoProcessors);
        assert_eq!(response.http_status(), 200);
    }

    #[tokio::test]
    async fn test_trigger_all_failed_is_500() {
        let registry = JobRegistry::new()
            .with_job(failing_job("analytics"))
            .with_job(failing_job("features"));
        let h = harness(base_config(), registry);

        let response = h.coordinator.handle_trigger(TriggerPayload::new("raw_complete")).await;
        assert_eq!(response.status, RunStatus::Failed);
        assert_eq!(response.http_status(), 500);
    }

    #[tokio::test]
    async fn test_run_for_date_resolves_symbolic_dates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new().with_job(counting_job("analytics", calls.clone()));
        let h = harness(base_config(), registry);
        let jobs = vec!["analytics".to_string()];

        let today = h
            .coordinator
            .run_for_date(DateArg::Today, &jobs, RunOptions::default())
            .await;
        assert_eq!(today.target_date, NaiveDate::from_ymd_opt(2025, 1, 10));
        assert_eq!(today.status, RunStatus::Completed);

        let none = h.coordinator.run_for_date(DateArg::Auto, &[], RunOptions::default()).await;
        assert_eq!(none.status, RunStatus::NoProcessors);
    }

    #[tokio::test]
    async fn test_tick_runs_event_aware_slot_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new().with_job(counting_job("predictions", calls.clone()));
        let mut config = base_config();
        config.workflows.push(
            WorkflowSpec::new(
                "pregame",
                DecisionType::EventAware {
                    frequency_hours: 2,
                    window_before_event_hours: 6,
                    business_hours_start: 8,
                    business_hours_end: 20,
                    min_events: 1,
                },
            )
            .with_task("predictions"),
        );
        let h = harness(config, registry);
        let date = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();

        let first = h.coordinator.tick(at(10, 13, 5)).await.unwrap();
        assert_eq!(first.runs.len(), 1);
        assert_eq!(first.runs[0].status, RunStatus::Completed);

        let second = h.coordinator.tick(at(10, 13, 20)).await.unwrap();
        assert!(second.runs.is_empty());
        assert_eq!(second.already_ran, vec!["pregame".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let entries = h.coordinator.expected_schedule(date).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].planned_slots, vec![at(10, 13, 0), at(10, 15, 0), at(10, 17, 0)]);
        assert_eq!(entries[0].executed_slots, vec![at(10, 13, 0)]);
        assert!(entries[0].succeeded);
        assert_eq!(entries[0].missed_slots(at(10, 16, 0)), vec![at(10, 15, 0)]);
    }

    #[tokio::test]
    async fn test_tick_records_skips_for_disabled_workflow() {
        let mut config = base_config();
        config.workflows.push(
            WorkflowSpec::new(
                "nightly",
                DecisionType::FixedWindow {
                    start_hour: 2,
                    window_hours: 2,
                },
            )
            .with_task("analytics")
            .with_enabled(false),
        );
        let h = harness(config, JobRegistry::new());

        let report = h.coordinator.tick(at(10, 3, 0)).await.unwrap();
        assert!(report.runs.is_empty());
        assert_eq!(report.decisions[0].action, ScheduleAction::Skip);

        let entry = h
            .coordinator
            .context()
            .schedule_store
            .get(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(), "nightly")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.reason, "workflow disabled");
    }

    #[tokio::test]
    async fn test_discovery_stops_after_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new().with_job(counting_job("discover", calls.clone()));
        let mut config = base_config();
        config.workflows.push(
            WorkflowSpec::new(
                "discovery",
                DecisionType::Discovery {
                    max_attempts: 3,
                    window_start_hour: 6,
                    window_end_hour: 12,
                },
            )
            .with_task("discover"),
        );
        let h = harness(config, registry);

        let first = h.coordinator.tick(at(10, 6, 0)).await.unwrap();
        assert_eq!(first.runs.len(), 1);

        let second = h.coordinator.tick(at(10, 8, 0)).await.unwrap();
        assert!(second.runs.is_empty());
        assert_eq!(second.decisions[0].reason, "discovery already succeeded today");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retrospective_targets_previous_day() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let job = {
            let seen = Arc::clone(&seen);
            FnJob::new("recap", move |options: JobOptions| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(options.target_date);
                    Ok(JobOutcome::ok(JobStats::default()))
                }
            })
        };
        let mut config = base_config();
        config.workflows.push(
            WorkflowSpec::new(
                "recap",
                DecisionType::EventAwareRetrospective {
                    run_hour: 6,
                    min_events: 1,
                },
            )
            .with_task("recap"),
        );
        let h = harness(config, JobRegistry::new().with_job(job));

        let report = h.coordinator.tick(at(11, 6, 5)).await.unwrap();
        assert_eq!(report.runs.len(), 1, "{:?}", report.decisions);
        assert_eq!(*seen.lock(), vec![NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()]);
    }

    #[tokio::test]
    async fn test_failed_task_enqueues_and_drain_runs_it() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let job = {
            let attempts = Arc::clone(&attempts);
            FnJob::new("analytics", move |options: JobOptions| {
                let attempts = Arc::clone(&attempts);
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n == 0 && !options.backfill_mode {
                        Err(JobError::failed("analytics", "warehouse busy"))
                    } else {
                        Ok(JobOutcome::ok(JobStats::new(5, 0)))
                    }
                }
            })
        };
        let h = harness(base_config(), JobRegistry::new().with_job(job));
        let jobs = vec!["analytics".to_string()];

        let response = h
            .coordinator
            .run_for_date(DateArg::Auto, &jobs, RunOptions::default())
            .await;
        assert_eq!(response.status, RunStatus::Failed);
        let item_id = response.results[0].backfill_item_id.clone().unwrap();

        let drained = h.coordinator.drain_backfill(None).await.unwrap();
        assert_eq!(drained.claimed, 1);
        assert_eq!(drained.completed, 1);

        let item = h.coordinator.backfill_queue().get(&item_id).await.unwrap().unwrap();
        assert_eq!(item.status, crate::core::QueueStatus::Completed);
    }

    #[tokio::test]
    async fn test_breaker_trips_and_resets() {
        let registry = JobRegistry::new().with_job(failing_job("analytics"));
        let mut config = base_config();
        config.breaker.max_attempts = 2;
        let h = harness(config, registry);
        let jobs = vec!["analytics".to_string()];
        let opts = RunOptions {
            backfill_mode: true,
            ..RunOptions::default()
        };

        for _ in 0..2 {
            let r = h.coordinator.run_for_date(DateArg::Auto, &jobs, opts).await;
            assert_eq!(r.results[0].status, TaskStatus::Failed);
        }
        let blocked = h.coordinator.run_for_date(DateArg::Auto, &jobs, opts).await;
        assert_eq!(blocked.results[0].status, TaskStatus::Skipped);
        assert_eq!(h.coordinator.list_tripped().await.unwrap().len(), 1);
        assert_eq!(h.sink.events_of_type(names::ALERT_BREAKER_TRIPPED).len(), 1);

        let date = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        assert!(h.coordinator.reset_breaker("analytics", "*", date).await.unwrap());
        assert!(h.coordinator.list_tripped().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_components_follow_config_reload() {
        let h = harness(base_config(), JobRegistry::new());
        let before = h.coordinator.breaker();
        assert!(Arc::ptr_eq(&before, &h.coordinator.breaker()));

        let mut next = base_config();
        next.breaker.max_attempts = 5;
        h.coordinator.context().config.replace(next).unwrap();
        assert!(!Arc::ptr_eq(&before, &h.coordinator.breaker()));
    }

    #[tokio::test]
    async fn test_spawned_loops_stop_on_shutdown() {
        let h = harness(base_config(), JobRegistry::new());
        h.clock.set(at(10, 12, 0));
        let coordinator = Arc::new(h.coordinator);
        let shutdown = ShutdownToken::new();

        let handles = coordinator.spawn_loops(&shutdown, Duration::from_millis(5), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.shutdown("test");
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
