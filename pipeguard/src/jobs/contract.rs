//! The contract every pipeline stage job implements.

use crate::errors::JobError;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Entity placeholder for jobs that process a whole date at once.
pub const ALL_ENTITIES: &str = "*";

/// Options passed to a job invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// The date to process.
    pub target_date: NaiveDate,
    /// Reprocessing historical data rather than producing today's output.
    #[serde(default)]
    pub backfill_mode: bool,
    /// Fail on any data-quality problem instead of degrading.
    #[serde(default)]
    pub strict_mode: bool,
    /// Bypass the completeness gate.
    #[serde(default)]
    pub skip_dependency_check: bool,
    /// Restrict processing to one entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    /// Correlates this invocation with its trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl JobOptions {
    /// Creates options for a normal run of `target_date`.
    #[must_use]
    pub fn new(target_date: NaiveDate) -> Self {
        Self {
            target_date,
            backfill_mode: false,
            strict_mode: false,
            skip_dependency_check: false,
            entity: None,
            correlation_id: None,
        }
    }

    /// Sets backfill mode.
    #[must_use]
    pub fn with_backfill_mode(mut self, enabled: bool) -> Self {
        self.backfill_mode = enabled;
        self
    }

    /// Sets strict mode.
    #[must_use]
    pub fn with_strict_mode(mut self, enabled: bool) -> Self {
        self.strict_mode = enabled;
        self
    }

    /// Sets whether the dependency check is skipped.
    #[must_use]
    pub fn with_skip_dependency_check(mut self, skip: bool) -> Self {
        self.skip_dependency_check = skip;
        self
    }

    /// Restricts the run to one entity.
    #[must_use]
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }

    /// The entity used for breaker and gate keys.
    #[must_use]
    pub fn entity_key(&self) -> &str {
        self.entity.as_deref().unwrap_or(ALL_ENTITIES)
    }
}

/// Counters reported by a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    /// Rows written.
    pub rows_processed: u64,
    /// Rows skipped (blocked, deferred to the next run).
    pub rows_skipped: u64,
    /// Job-specific counters.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobStats {
    /// Creates stats with the given counts.
    #[must_use]
    pub fn new(rows_processed: u64, rows_skipped: u64) -> Self {
        Self {
            rows_processed,
            rows_skipped,
            extra: serde_json::Map::new(),
        }
    }

    /// Adds a job-specific counter.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// What a job reports back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Whether the job considers the run successful.
    pub success: bool,
    /// Counters.
    pub stats: JobStats,
    /// Optional summary or failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobOutcome {
    /// A successful outcome.
    #[must_use]
    pub fn ok(stats: JobStats) -> Self {
        Self {
            success: true,
            stats,
            message: None,
        }
    }

    /// An unsuccessful outcome.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stats: JobStats::default(),
            message: Some(message.into()),
        }
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A pipeline stage entry point.
///
/// Jobs must be safe to re-invoke for the same date: the coordinator
/// delivers triggers at least once and backfills replay earlier dates.
#[async_trait]
pub trait Job: Send + Sync {
    /// Registered name.
    fn name(&self) -> &str;

    /// Runs the job.
    async fn run(&self, options: &JobOptions) -> Result<JobOutcome, JobError>;
}

type JobFuture = BoxFuture<'static, Result<JobOutcome, JobError>>;

/// A job backed by a closure.
#[derive(Clone)]
pub struct FnJob {
    name: String,
    func: Arc<dyn Fn(JobOptions) -> JobFuture + Send + Sync>,
}

impl FnJob {
    /// Wraps `func` as a job called `name`.
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(JobOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobOutcome, JobError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(move |options| Box::pin(func(options))),
        }
    }
}

impl fmt::Debug for FnJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnJob").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Job for FnJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, options: &JobOptions) -> Result<JobOutcome, JobError> {
        (self.func)(options.clone()).await
    }
}
