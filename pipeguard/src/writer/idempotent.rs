//! Stage, merge, fall back, verify.
//!
//! [`IdempotentWriter::save`] makes a batch write safe to replay: rows are
//! deduplicated by primary key, staged into a per-call table and merged into
//! the target. When the backend rejects the merge's shape, the writer falls
//! back once to delete-then-insert over the batch's scope. A write is never
//! rolled back; problems found after the write raise alerts and may queue a
//! backfill instead.

use super::backend::{row_key, Row, WarehouseBackend, WriteScope};
use super::rules::{apply_rules, is_empty_value, BlockedRow, RequiredFields, ValidationRule};
use crate::config::WriterConfig;
use crate::core::QueuePriority;
use crate::errors::BackendError;
use crate::events::{names, EventSink, NoOpEventSink};
use crate::jobs::JobStats;
use crate::quality::{QualityEvent, QualityEventLog, QualityEventType, Severity};
use crate::queue::{BackfillQueue, BackfillRequest};
use crate::utils::{short_id, Clock, SystemClock};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The job and date to re-run when a write turns out bad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    /// Job that produced the rows.
    pub job: String,
    /// Date the rows belong to.
    pub date: NaiveDate,
    /// Entity the rows belong to, if the write was entity-scoped.
    pub entity: Option<String>,
}

impl Remediation {
    /// Creates a whole-date remediation.
    #[must_use]
    pub fn new(job: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            job: job.into(),
            date,
            entity: None,
        }
    }

    /// Scopes the remediation to one entity.
    #[must_use]
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }
}

/// Where and how a batch is written.
#[derive(Debug, Clone)]
pub struct WriteTarget {
    /// Target table.
    pub table: String,
    /// Primary key columns.
    pub primary_key: Vec<String>,
    /// Column whose values bound the fallback delete. Without it the
    /// fallback deletes by primary key.
    pub partition_field: Option<String>,
    /// Fields that must be non-empty, checked before and after the write.
    pub required_fields: Vec<String>,
    /// Extra pre-write rules.
    pub rules: Vec<Arc<dyn ValidationRule>>,
    /// What to re-run if post-write validation fails.
    pub remediation: Option<Remediation>,
    /// Correlation id for quality events.
    pub correlation_id: Option<String>,
}

impl WriteTarget {
    /// Creates a target keyed on `primary_key`.
    #[must_use]
    pub fn new<S: Into<String>>(table: impl Into<String>, primary_key: impl IntoIterator<Item = S>) -> Self {
        Self {
            table: table.into(),
            primary_key: primary_key.into_iter().map(Into::into).collect(),
            partition_field: None,
            required_fields: Vec::new(),
            rules: Vec::new(),
            remediation: None,
            correlation_id: None,
        }
    }

    /// Bounds the fallback delete by a partition column.
    #[must_use]
    pub fn with_partition_field(mut self, field: impl Into<String>) -> Self {
        self.partition_field = Some(field.into());
        self
    }

    /// Sets the required fields.
    #[must_use]
    pub fn with_required_fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a pre-write rule.
    #[must_use]
    pub fn with_rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    /// Sets the remediation target.
    #[must_use]
    pub fn with_remediation(mut self, remediation: Remediation) -> Self {
        self.remediation = Some(remediation);
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }

    fn key_scope(&self, rows: &[Row]) -> WriteScope {
        WriteScope::Keys {
            fields: self.primary_key.clone(),
            keys: rows
                .iter()
                .filter_map(|r| row_key(r, &self.primary_key))
                .collect(),
        }
    }

    fn fallback_scope(&self, rows: &[Row]) -> WriteScope {
        match &self.partition_field {
            Some(field) => {
                let mut values: Vec<Value> = Vec::new();
                for value in rows.iter().filter_map(|r| r.get(field)) {
                    if !values.contains(value) {
                        values.push(value.clone());
                    }
                }
                WriteScope::Partition {
                    field: field.clone(),
                    values,
                }
            }
            None => self.key_scope(rows),
        }
    }
}

/// How the rows reached the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePath {
    /// Atomic merge.
    Merge,
    /// Delete-then-insert after the merge was rejected.
    DeleteInsert,
    /// Deferred to the next run because of write-visibility lag.
    Skipped,
    /// Nothing to write.
    NoOp,
}

impl fmt::Display for WritePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge => write!(f, "merge"),
            Self::DeleteInsert => write!(f, "delete_insert"),
            Self::Skipped => write!(f, "skipped"),
            Self::NoOp => write!(f, "no_op"),
        }
    }
}

/// Result of checking the target after a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostWriteValidation {
    /// Rows the batch should have left in scope.
    pub expected_rows: u64,
    /// Rows counted in scope.
    pub actual_rows: u64,
    /// Gap between the two, in percent of expected.
    pub variance_pct: f64,
    /// Rows sampled.
    pub sampled: usize,
    /// Sampled rows with an empty required field.
    pub empty_required: usize,
    /// Whether every check passed.
    pub passed: bool,
    /// Failed checks.
    pub issues: Vec<String>,
}

/// Outcome of a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteReport {
    /// Target table.
    pub table: String,
    /// Rows handed to the writer.
    pub rows_received: usize,
    /// Duplicates dropped within the batch.
    pub rows_deduplicated: usize,
    /// Rows merged or inserted.
    pub rows_written: u64,
    /// Rows excluded by validation.
    pub rows_blocked: usize,
    /// Rows deferred to the next run.
    pub rows_skipped: usize,
    /// The excluded rows.
    pub blocked: Vec<BlockedRow>,
    /// Write path taken.
    pub path: WritePath,
    /// Classified merge error that caused the fallback.
    pub fallback_error: Option<String>,
    /// Post-write checks, when they ran.
    pub validation: Option<PostWriteValidation>,
    /// Backfill queued after failed post-write checks.
    pub backfill_item_id: Option<String>,
    /// Staging table used by the call.
    pub staging_table: Option<String>,
    /// SHA-256 of the rows written, hex encoded. Equal across replays.
    pub batch_fingerprint: Option<String>,
}

impl WriteReport {
    fn new(table: &str, rows_received: usize) -> Self {
        Self {
            table: table.to_string(),
            rows_received,
            rows_deduplicated: 0,
            rows_written: 0,
            rows_blocked: 0,
            rows_skipped: 0,
            blocked: Vec::new(),
            path: WritePath::NoOp,
            fallback_error: None,
            validation: None,
            backfill_item_id: None,
            staging_table: None,
            batch_fingerprint: None,
        }
    }

    /// Converts the report into job statistics.
    #[must_use]
    pub fn to_job_stats(&self) -> JobStats {
        JobStats::new(self.rows_written, (self.rows_skipped + self.rows_blocked) as u64)
            .with_extra("write_path", self.path.to_string())
            .with_extra("rows_blocked", self.rows_blocked)
            .with_extra("rows_deduplicated", self.rows_deduplicated)
    }
}

/// Computes a stable digest of a batch.
#[must_use]
pub fn batch_fingerprint(rows: &[Row]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        // serde_json maps are ordered, so equal rows serialize identically
        if let Ok(bytes) = serde_json::to_vec(row) {
            hasher.update(&bytes);
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Writes batches so that replays do not duplicate rows.
pub struct IdempotentWriter {
    backend: Arc<dyn WarehouseBackend>,
    config: WriterConfig,
    events: QualityEventLog,
    sink: Arc<dyn EventSink>,
    queue: Option<Arc<BackfillQueue>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for IdempotentWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotentWriter")
            .field("config", &self.config)
            .field("queue", &self.queue.is_some())
            .finish_non_exhaustive()
    }
}

impl IdempotentWriter {
    /// Creates a writer over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn WarehouseBackend>, config: WriterConfig, events: QualityEventLog) -> Self {
        Self {
            backend,
            config,
            events,
            sink: Arc::new(NoOpEventSink),
            queue: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the sink for fallbacks and alerts.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Enables backfill enqueueing on failed post-write checks.
    #[must_use]
    pub fn with_backfill_queue(mut self, queue: Arc<BackfillQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Writes `rows` into `target`.
    ///
    /// # Errors
    ///
    /// Returns the backend error when staging fails, when the merge fails
    /// with a transient error, or when the fallback fails with anything
    /// other than write-visibility lag. The staging table is dropped in
    /// every case.
    pub async fn save(&self, target: &WriteTarget, rows: Vec<Row>) -> Result<WriteReport, BackendError> {
        let mut report = WriteReport::new(&target.table, rows.len());
        if rows.is_empty() {
            debug!(table = %target.table, "empty batch, nothing to write");
            return Ok(report);
        }

        let (unique, missing_key) = Self::dedup(target, rows, &mut report);
        let mut rules: Vec<Arc<dyn ValidationRule>> = Vec::with_capacity(target.rules.len() + 1);
        if !target.required_fields.is_empty() {
            rules.push(Arc::new(RequiredFields::new(target.required_fields.iter().cloned())));
        }
        rules.extend(target.rules.iter().cloned());
        let (valid, mut blocked) = apply_rules(&rules, unique);
        blocked.splice(0..0, missing_key);

        if !blocked.is_empty() {
            self.report_blocked(target, &blocked).await;
        }
        report.rows_blocked = blocked.len();
        report.blocked = blocked;

        if valid.is_empty() {
            info!(table = %target.table, blocked = report.rows_blocked, "no valid rows to write");
            return Ok(report);
        }

        report.batch_fingerprint = Some(batch_fingerprint(&valid));
        let staging = format!("{}_{}_{}", self.config.staging_prefix, target.table, short_id());
        report.staging_table = Some(staging.clone());

        let written = self.write_staged(target, &staging, &valid, &mut report).await;
        if let Err(e) = self.backend.drop_table(&staging).await {
            warn!(staging = %staging, error = %e, "failed to drop staging table");
        }
        written?;

        if matches!(report.path, WritePath::Merge | WritePath::DeleteInsert) {
            self.validate_after_write(target, &valid, &mut report).await;
        }

        info!(
            table = %target.table,
            path = %report.path,
            received = report.rows_received,
            written = report.rows_written,
            blocked = report.rows_blocked,
            skipped = report.rows_skipped,
            fingerprint = ?report.batch_fingerprint,
            "batch saved"
        );
        Ok(report)
    }

    /// Drops later duplicates in favour of the last occurrence, preserving
    /// first-seen order. Rows without a full primary key are returned as
    /// blocked.
    fn dedup(
        target: &WriteTarget,
        rows: Vec<Row>,
        report: &mut WriteReport,
    ) -> (Vec<Row>, Vec<BlockedRow>) {
        let mut positions: HashMap<String, usize> = HashMap::with_capacity(rows.len());
        let mut unique: Vec<Row> = Vec::with_capacity(rows.len());
        let mut missing = Vec::new();

        for row in rows {
            let Some(key) = row_key(&row, &target.primary_key) else {
                missing.push(BlockedRow {
                    rule: "primary_key".to_string(),
                    reason: format!("missing primary key ({})", target.primary_key.join(", ")),
                    row,
                });
                continue;
            };
            match positions.get(&key) {
                Some(&i) => {
                    unique[i] = row;
                    report.rows_deduplicated += 1;
                }
                None => {
                    positions.insert(key, unique.len());
                    unique.push(row);
                }
            }
        }
        (unique, missing)
    }

    async fn report_blocked(&self, target: &WriteTarget, blocked: &[BlockedRow]) {
        warn!(table = %target.table, blocked = blocked.len(), "rows blocked by validation");

        let sample: Vec<&str> = blocked.iter().take(3).map(|b| b.reason.as_str()).collect();
        let event = QualityEvent::new(
            QualityEventType::ValidationBlocked,
            Severity::Warning,
            &target.table,
            format!("{} rows blocked by validation: {}", blocked.len(), sample.join("; ")),
            self.clock.now(),
        )
        .with_metric("rows_blocked")
        .with_correlation_id(target.correlation_id.clone());
        let event = match &target.remediation {
            Some(r) => event.with_date(r.date),
            None => event,
        };
        let event_id = self.events.record(event).await;

        if blocked.len() > self.config.blocked_alert_threshold {
            self.sink
                .emit(
                    names::ALERT_VALIDATION_BLOCKED,
                    Some(json!({
                        "table": target.table,
                        "rows_blocked": blocked.len(),
                        "threshold": self.config.blocked_alert_threshold,
                    })),
                )
                .await;
            let alert = QualityEvent::new(
                QualityEventType::AlertSent,
                Severity::Error,
                &target.table,
                format!(
                    "{} blocked rows exceed threshold {}",
                    blocked.len(),
                    self.config.blocked_alert_threshold
                ),
                self.clock.now(),
            )
            .with_related(event_id)
            .with_correlation_id(target.correlation_id.clone());
            self.events.record(alert).await;
        }
    }

    async fn write_staged(
        &self,
        target: &WriteTarget,
        staging: &str,
        rows: &[Row],
        report: &mut WriteReport,
    ) -> Result<(), BackendError> {
        self.backend.create_staging(staging, rows).await?;

        match self
            .backend
            .merge(staging, &target.table, &target.primary_key, &self.config.order_field)
            .await
        {
            Ok(affected) => {
                report.path = WritePath::Merge;
                report.rows_written = affected;
                Ok(())
            }
            Err(e) if e.triggers_fallback() => {
                warn!(
                    table = %target.table,
                    kind = %e.kind,
                    error = %e.message,
                    "merge rejected, falling back to delete-then-insert"
                );
                self.sink
                    .emit(
                        names::WRITER_FALLBACK,
                        Some(json!({
                            "table": target.table,
                            "kind": e.kind,
                            "error": e.message,
                        })),
                    )
                    .await;
                report.fallback_error = Some(e.to_string());
                self.delete_then_insert(target, rows, report).await
            }
            Err(e) => {
                error!(table = %target.table, error = %e, "merge failed");
                Err(e)
            }
        }
    }

    async fn delete_then_insert(
        &self,
        target: &WriteTarget,
        rows: &[Row],
        report: &mut WriteReport,
    ) -> Result<(), BackendError> {
        let scope = target.fallback_scope(rows);
        match self.backend.delete_scope(&target.table, &scope).await {
            Ok(deleted) => debug!(table = %target.table, deleted, "fallback delete done"),
            Err(e) if e.is_visibility_lag() => {
                warn!(
                    table = %target.table,
                    rows = rows.len(),
                    error = %e.message,
                    "rows skipped, will retry next run"
                );
                self.sink
                    .emit(
                        names::WRITER_DEFERRED,
                        Some(json!({"table": target.table, "rows": rows.len()})),
                    )
                    .await;
                report.path = WritePath::Skipped;
                report.rows_skipped = rows.len();
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        report.rows_written = self.backend.insert(&target.table, rows).await?;
        report.path = WritePath::DeleteInsert;
        Ok(())
    }

    async fn validate_after_write(&self, target: &WriteTarget, rows: &[Row], report: &mut WriteReport) {
        let scope = target.key_scope(rows);
        let expected = rows.len() as u64;

        let actual = match self.backend.count_rows(&target.table, &scope).await {
            Ok(n) => n,
            Err(e) => {
                warn!(table = %target.table, error = %e, "post-write count unavailable");
                return;
            }
        };
        let sample = match self
            .backend
            .sample_rows(&target.table, &scope, self.config.sample_size)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(table = %target.table, error = %e, "post-write sample unavailable");
                Vec::new()
            }
        };

        let variance_pct = if expected == 0 {
            0.0
        } else {
            (actual as f64 - expected as f64).abs() * 100.0 / expected as f64
        };
        let empty_required = sample
            .iter()
            .filter(|r| {
                target
                    .required_fields
                    .iter()
                    .any(|f| is_empty_value(r.get(f.as_str())))
            })
            .count();

        let mut issues = Vec::new();
        if variance_pct > self.config.variance_tolerance_pct {
            issues.push(format!(
                "row count {actual} differs from expected {expected} by {variance_pct:.1}%"
            ));
        }
        if empty_required > 0 {
            issues.push(format!("{empty_required} sampled rows have empty required fields"));
        }

        let validation = PostWriteValidation {
            expected_rows: expected,
            actual_rows: actual,
            variance_pct,
            sampled: sample.len(),
            empty_required,
            passed: issues.is_empty(),
            issues,
        };
        if !validation.passed {
            report.backfill_item_id = self.report_post_write_failure(target, &validation).await;
        }
        report.validation = Some(validation);
    }

    async fn report_post_write_failure(
        &self,
        target: &WriteTarget,
        validation: &PostWriteValidation,
    ) -> Option<String> {
        let description = validation.issues.join("; ");
        error!(table = %target.table, issues = %description, "post-write validation failed");

        self.sink
            .emit(
                names::ALERT_POST_WRITE,
                Some(json!({"table": target.table, "issues": validation.issues})),
            )
            .await;

        let mut event = QualityEvent::new(
            QualityEventType::IssueDetected,
            Severity::Error,
            &target.table,
            format!("post-write validation failed: {description}"),
            self.clock.now(),
        )
        .with_metric("post_write_validation")
        .with_correlation_id(target.correlation_id.clone());
        if let Some(r) = &target.remediation {
            event = event.with_date(r.date);
        }
        let event_id = self.events.record(event).await;

        let (queue, remediation) = (self.queue.as_ref()?, target.remediation.as_ref()?);
        let mut request = BackfillRequest::new(
            &remediation.job,
            remediation.date,
            format!("post-write validation failed on {}", target.table),
        )
        .with_priority(QueuePriority::Elevated)
        .with_correlation_id(target.correlation_id.clone())
        .with_related_event(event_id);
        if let Some(entity) = &remediation.entity {
            request = request.with_entity(entity);
        }
        match queue.enqueue(request).await {
            Ok(outcome) => Some(outcome.id),
            Err(e) => {
                error!(table = %target.table, error = %e, "failed to enqueue post-write backfill");
                None
            }
        }
    }
}
