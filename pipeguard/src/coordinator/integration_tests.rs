//! End-to-end scenarios driven through the coordinator.

#[cfg(test)]
mod tests {
    use crate::breaker::RetryKey;
    use crate::config::{ConfigStore, CoordinatorConfig, DecisionType, ReloadOutcome, WorkflowSpec};
    use crate::coordinator::{Coordinator, CoordinatorContext, RunOptions, TriggerPayload};
    use crate::core::{QueueStatus, RunStatus, TaskStatus};
    use crate::errors::{BackendError, JobError};
    use crate::events::{names, CollectingEventSink};
    use crate::gate::{InMemoryCompletenessSource, UpstreamSnapshot};
    use crate::jobs::{FnJob, Job, JobOptions, JobOutcome, JobRegistry, JobStats, ALL_ENTITIES};
    use crate::quality::QualityEventType;
    use crate::scheduler::StaticEventCalendar;
    use crate::utils::{DateArg, ManualClock, Timestamp};
    use crate::writer::{IdempotentWriter, InMemoryWarehouse, Remediation, Row, WarehouseOp, WriteTarget};
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::SystemTime;

    fn at(day: u32, hour: u32, minute: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2025, 1, day, hour, minute, 0).unwrap()
    }

    fn jan(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    fn counting(name: &str, calls: &Arc<AtomicUsize>) -> FnJob {
        let calls = Arc::clone(calls);
        FnJob::new(name, move |_options| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(JobOutcome::ok(JobStats::new(1, 0)))
            }
        })
    }

    fn config_with_trigger(jobs: &[&str]) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default();
        config.triggers.insert(
            "raw_complete".to_string(),
            jobs.iter().map(ToString::to_string).collect(),
        );
        config
    }

    struct PlayerStatsJob {
        writer: IdempotentWriter,
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[async_trait]
    impl Job for PlayerStatsJob {
        fn name(&self) -> &str {
            "player_stats"
        }

        async fn run(&self, options: &JobOptions) -> Result<JobOutcome, JobError> {
            let date = options.target_date.to_string();
            let rows = vec![
                row(json!({"id": 1, "date": date, "points": 10, "processed_at": "t1"})),
                row(json!({"id": 2, "date": date, "points": 7, "processed_at": "t1"})),
                row(json!({"id": 3, "date": date, "points": 3, "processed_at": "t1"})),
            ];
            let target = WriteTarget::new("player_stats", ["id"])
                .with_partition_field("date")
                .with_required_fields(["date"])
                .with_remediation(Remediation::new("player_stats", options.target_date))
                .with_correlation_id(options.correlation_id.clone());
            let report = self.writer.save(&target, rows).await?;
            Ok(JobOutcome::ok(report.to_job_stats()))
        }
    }

    #[tokio::test]
    async fn test_replayed_trigger_writes_each_key_once() {
        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(ConfigStore::from_config(config_with_trigger(&["player_stats"])).unwrap());
        let sink = Arc::new(CollectingEventSink::new());
        let clock = Arc::new(ManualClock::new(at(10, 12, 0)));
        let ctx = CoordinatorContext::in_memory(store, Arc::clone(&registry))
            .with_event_sink(sink.clone())
            .with_clock(clock);
        let coordinator = Coordinator::new(ctx);

        let warehouse = Arc::new(InMemoryWarehouse::new());
        registry.register(Arc::new(PlayerStatsJob {
            writer: coordinator.writer(warehouse.clone()),
        }));

        let payload = TriggerPayload::new("raw_complete").with_target_date(DateArg::Date(jan(9)));
        for _ in 0..2 {
            let response = coordinator.handle_trigger(payload.clone()).await;
            assert_eq!(response.status, RunStatus::Completed);
        }
        assert_eq!(warehouse.rows("player_stats").len(), 3);

        warehouse.fail_next(WarehouseOp::Merge, BackendError::syntax("MERGE unsupported"));
        let response = coordinator.handle_trigger(payload).await;
        assert_eq!(response.status, RunStatus::Completed);
        let stats = &response.results[0].outcome.as_ref().unwrap().stats;
        assert_eq!(stats.extra["write_path"], json!("delete_insert"));

        assert_eq!(warehouse.rows("player_stats").len(), 3);
        assert_eq!(warehouse.call_count(WarehouseOp::Delete), 1);
        assert_eq!(sink.events_of_type(names::WRITER_FALLBACK).len(), 1);
        assert!(warehouse
            .table_names()
            .iter()
            .all(|t| !t.starts_with("_staging")));
    }

    #[tokio::test]
    async fn test_gate_threshold_bootstrap_and_strict_mode() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(JobRegistry::new().with_job(counting("analytics", &calls)));
        let source = Arc::new(InMemoryCompletenessSource::new());
        let store = Arc::new(ConfigStore::from_config(config_with_trigger(&["analytics"])).unwrap());
        let clock = Arc::new(ManualClock::new(at(10, 12, 0)));
        let ctx = CoordinatorContext::in_memory(Arc::clone(&store), registry)
            .with_completeness_source(source.clone())
            .with_clock(clock);
        let coordinator = Coordinator::new(ctx);
        let jobs = vec!["analytics".to_string()];

        source.set("default", jan(9), UpstreamSnapshot::new(ALL_ENTITIES, 10, 9));
        let ready = coordinator
            .run_for_date(DateArg::Auto, &jobs, RunOptions::default())
            .await;
        assert_eq!(ready.status, RunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        source.set("default", jan(9), UpstreamSnapshot::new(ALL_ENTITIES, 10, 8));
        let blocked = coordinator
            .run_for_date(DateArg::Auto, &jobs, RunOptions::default())
            .await;
        assert_eq!(blocked.status, RunStatus::Skipped);
        assert_eq!(blocked.results[0].status, TaskStatus::Skipped);
        assert!(blocked.results[0].reason.as_deref().unwrap().contains("80.0%"));
        assert!(blocked.results[0].backfill_item_id.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator
                .quality_events()
                .events_of(QualityEventType::BackfillQueued)
                .await
                .len(),
            1
        );

        let mut bootstrap = config_with_trigger(&["analytics"]);
        bootstrap.gate.season_start = Some(jan(1));
        store.replace(bootstrap).unwrap();

        let strict = coordinator
            .run_for_date(
                DateArg::Auto,
                &jobs,
                RunOptions {
                    strict_mode: true,
                    backfill_mode: true,
                    ..RunOptions::default()
                },
            )
            .await;
        assert_eq!(strict.results[0].status, TaskStatus::Skipped);
        assert!(strict.results[0].backfill_item_id.is_none());

        let lenient = coordinator
            .run_for_date(DateArg::Auto, &jobs, RunOptions::default())
            .await;
        assert_eq!(lenient.status, RunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_breaker_cooldown_expiry_permits_new_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = {
            let calls = Arc::clone(&calls);
            FnJob::new("analytics", move |_options| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::failed("analytics", "warehouse unavailable"))
                }
            })
        };
        let store = Arc::new(ConfigStore::from_config(CoordinatorConfig::default()).unwrap());
        let clock = Arc::new(ManualClock::new(at(10, 12, 0)));
        let ctx = CoordinatorContext::in_memory(store, Arc::new(JobRegistry::new().with_job(failing)))
            .with_clock(clock.clone());
        let coordinator = Coordinator::new(ctx);
        let jobs = vec!["analytics".to_string()];
        let backfill = RunOptions {
            backfill_mode: true,
            ..RunOptions::default()
        };
        let key = RetryKey::new("analytics", ALL_ENTITIES, jan(9));

        for _ in 0..3 {
            coordinator.run_for_date(DateArg::Auto, &jobs, backfill).await;
        }
        let state = coordinator.breaker().check(&key).await.unwrap();
        assert!(state.active);
        assert_eq!(state.attempts, 3);
        assert_eq!(state.cooldown_until, Some(at(17, 12, 0)));

        let skipped = coordinator.run_for_date(DateArg::Date(jan(9)), &jobs, backfill).await;
        assert_eq!(skipped.results[0].status, TaskStatus::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        clock.set(at(17, 12, 1));
        let state = coordinator.breaker().check(&key).await.unwrap();
        assert!(!state.active);
        assert_eq!(state.attempts, 3);

        let retried = coordinator.run_for_date(DateArg::Date(jan(9)), &jobs, backfill).await;
        assert_eq!(retried.results[0].status, TaskStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_event_aware_day_runs_three_slots() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut config = CoordinatorConfig::default();
        config.scheduler.utc_offset_minutes = -300;
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
        let store = Arc::new(ConfigStore::from_config(config).unwrap());
        // 19:00 local is midnight UTC.
        let calendar = StaticEventCalendar::new().with_event("game-1", at(11, 0, 0));
        let ctx = CoordinatorContext::in_memory(
            store,
            Arc::new(JobRegistry::new().with_job(counting("predictions", &calls))),
        )
        .with_calendar(Arc::new(calendar));
        let coordinator = Coordinator::new(ctx);

        let local_midnight = at(10, 5, 0);
        let mut run_times = Vec::new();
        for step in 0..96 {
            let now = local_midnight + Duration::minutes(step * 15);
            let report = coordinator.tick(now).await.unwrap();
            if !report.runs.is_empty() {
                run_times.push(now);
            }
        }

        assert_eq!(run_times, vec![at(10, 18, 0), at(10, 20, 0), at(10, 22, 0)]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let entry = coordinator
            .context()
            .schedule_store
            .get(jan(10), "pregame")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.executed_slots, entry.planned_slots);
        assert!(entry.missed_slots(at(11, 4, 0)).is_empty());
    }

    #[tokio::test]
    async fn test_failed_backfill_exhausts_and_stays_pending() {
        let failing = FnJob::new("features", |_options| async {
            Err(JobError::failed("features", "upstream table missing"))
        });
        let mut config = CoordinatorConfig::default();
        config.queue.default_max_attempts = 2;
        config.queue.base_backoff_minutes = 1;
        config.breaker.max_attempts = 10;
        let store = Arc::new(ConfigStore::from_config(config).unwrap());
        let clock = Arc::new(ManualClock::new(at(10, 12, 0)));
        let ctx = CoordinatorContext::in_memory(store, Arc::new(JobRegistry::new().with_job(failing)))
            .with_clock(clock.clone());
        let coordinator = Coordinator::new(ctx);

        let response = coordinator
            .run_for_date(DateArg::Auto, &["features".to_string()], RunOptions::default())
            .await;
        let item_id = response.results[0].backfill_item_id.clone().unwrap();

        for _ in 0..4 {
            coordinator.drain_backfill(Some(5)).await.unwrap();
            clock.advance(Duration::hours(1));
        }

        let item = coordinator.backfill_queue().get(&item_id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.attempts, 2);
        assert!(item.is_exhausted());
        assert!(coordinator.backfill_queue().claim(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_config_reload_changes_trigger_mapping() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(
            JobRegistry::new()
                .with_job(counting("analytics", &calls))
                .with_job(counting("features", &calls)),
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[triggers]\nraw_complete = [\"analytics\"]\n").unwrap();
        file.flush().unwrap();

        let store = Arc::new(ConfigStore::load(file.path()).unwrap());
        let coordinator = Coordinator::new(CoordinatorContext::in_memory(Arc::clone(&store), registry));

        let first = coordinator.handle_trigger(TriggerPayload::new("raw_complete")).await;
        assert_eq!(first.results.len(), 1);

        let bump = |contents: &[u8], secs: u64| {
            std::fs::write(file.path(), contents).unwrap();
            let handle = std::fs::File::options().write(true).open(file.path()).unwrap();
            handle
                .set_modified(SystemTime::now() + std::time::Duration::from_secs(secs))
                .unwrap();
        };

        bump(b"[triggers]\nraw_complete = [\"analytics\", \"features\"]\n", 5);
        assert_eq!(store.reload_if_changed(), ReloadOutcome::Reloaded);
        let second = coordinator.handle_trigger(TriggerPayload::new("raw_complete")).await;
        assert_eq!(second.results.len(), 2);

        bump(b"[triggers\nbroken", 10);
        assert!(matches!(store.reload_if_changed(), ReloadOutcome::Rejected(_)));
        let third = coordinator.handle_trigger(TriggerPayload::new("raw_complete")).await;
        assert_eq!(third.results.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
