//! Shared clients a coordinator is built from.

use super::schedule::{ExpectedScheduleStore, InMemoryExpectedScheduleStore};
use crate::breaker::{InMemoryRetryStore, RetryStore};
use crate::config::ConfigStore;
use crate::events::{EventSink, LoggingEventSink};
use crate::gate::{CompletenessSource, InMemoryCompletenessSource};
use crate::jobs::JobRegistry;
use crate::quality::{InMemoryQualityEventStore, QualityEventStore};
use crate::queue::{InMemoryQueueStore, QueueStore};
use crate::scheduler::{EventCalendar, StaticEventCalendar};
use crate::utils::{short_id, Clock, SystemClock};
use std::fmt;
use std::sync::Arc;

/// Everything a [`Coordinator`](super::Coordinator) needs, constructed once
/// at process start and passed down explicitly.
#[derive(Clone)]
pub struct CoordinatorContext {
    /// Active configuration.
    pub config: Arc<ConfigStore>,
    /// Job entry points.
    pub registry: Arc<JobRegistry>,
    /// Circuit breaker records.
    pub retry_store: Arc<dyn RetryStore>,
    /// Backfill queue items.
    pub queue_store: Arc<dyn QueueStore>,
    /// Quality event log.
    pub quality_store: Arc<dyn QualityEventStore>,
    /// Expected-schedule ledger.
    pub schedule_store: Arc<dyn ExpectedScheduleStore>,
    /// Expected and actual upstream counts.
    pub completeness_source: Arc<dyn CompletenessSource>,
    /// Event calendar for event-aware workflows.
    pub calendar: Arc<dyn EventCalendar>,
    /// Lifecycle events and alerts.
    pub sink: Arc<dyn EventSink>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Identifies this process on queue claims.
    pub worker_id: String,
}

impl fmt::Debug for CoordinatorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorContext")
            .field("jobs", &self.registry.names())
            .field("calendar", &self.calendar)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl CoordinatorContext {
    /// Creates a context with in-memory stores, an empty calendar, a
    /// logging event sink and the system clock.
    #[must_use]
    pub fn in_memory(config: Arc<ConfigStore>, registry: Arc<JobRegistry>) -> Self {
        Self {
            config,
            registry,
            retry_store: Arc::new(InMemoryRetryStore::new()),
            queue_store: Arc::new(InMemoryQueueStore::new()),
            quality_store: Arc::new(InMemoryQualityEventStore::new()),
            schedule_store: Arc::new(InMemoryExpectedScheduleStore::new()),
            completeness_source: Arc::new(InMemoryCompletenessSource::new()),
            calendar: Arc::new(StaticEventCalendar::new()),
            sink: Arc::new(LoggingEventSink::default()),
            clock: Arc::new(SystemClock),
            worker_id: format!("coordinator-{}", short_id()),
        }
    }

    /// Sets the retry store.
    #[must_use]
    pub fn with_retry_store(mut self, store: Arc<dyn RetryStore>) -> Self {
        self.retry_store = store;
        self
    }

    /// Sets the queue store.
    #[must_use]
    pub fn with_queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue_store = store;
        self
    }

    /// Sets the quality event store.
    #[must_use]
    pub fn with_quality_store(mut self, store: Arc<dyn QualityEventStore>) -> Self {
        self.quality_store = store;
        self
    }

    /// Sets the expected-schedule store.
    #[must_use]
    pub fn with_schedule_store(mut self, store: Arc<dyn ExpectedScheduleStore>) -> Self {
        self.schedule_store = store;
        self
    }

    /// Sets the completeness source.
    #[must_use]
    pub fn with_completeness_source(mut self, source: Arc<dyn CompletenessSource>) -> Self {
        self.completeness_source = source;
        self
    }

    /// Sets the event calendar.
    #[must_use]
    pub fn with_calendar(mut self, calendar: Arc<dyn EventCalendar>) -> Self {
        self.calendar = calendar;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the worker id.
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}
