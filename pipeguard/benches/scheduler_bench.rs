//! Benchmarks for schedule evaluation.

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pipeguard::config::{DecisionType, SchedulerConfig, WorkflowSpec};
use pipeguard::scheduler::{StaticEventCalendar, WorkflowScheduler};

fn scheduler_benchmark(c: &mut Criterion) {
    let scheduler = WorkflowScheduler::new(&SchedulerConfig {
        utc_offset_minutes: -300,
        tolerance_minutes: 30,
    });
    let base = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
    let calendar = (0..200).fold(StaticEventCalendar::new(), |cal, i| {
        cal.with_event(format!("game-{i}"), base + Duration::hours(i64::from(i) * 3))
    });
    let workflows = vec![
        WorkflowSpec::new(
            "nightly",
            DecisionType::FixedWindow {
                start_hour: 2,
                window_hours: 2,
            },
        )
        .with_task("analytics"),
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
        WorkflowSpec::new(
            "discovery",
            DecisionType::Discovery {
                max_attempts: 6,
                window_start_hour: 6,
                window_end_hour: 18,
            },
        )
        .with_task("discover"),
    ];

    c.bench_function("evaluate_day_every_5_minutes", |b| {
        b.iter(|| {
            for step in 0..288 {
                let now = base + Duration::minutes(step * 5);
                for spec in &workflows {
                    black_box(scheduler.evaluate(spec, now, &calendar));
                }
            }
        });
    });
}

criterion_group!(benches, scheduler_benchmark);
criterion_main!(benches);
