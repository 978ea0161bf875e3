//! Lifecycle events and alerts.
//!
//! Components emit named events through an [`EventSink`] handed to them at
//! construction. Alerts are events whose name starts with `alert.`.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event names emitted by the coordinator and its components.
pub mod names {
    /// An upstream completion signal arrived.
    pub const TRIGGER_RECEIVED: &str = "trigger.received";
    /// A scheduler tick dispatched due workflows.
    pub const SCHEDULE_TICK: &str = "schedule.tick";
    /// A workflow run began.
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    /// A workflow run finished.
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    /// A sub-task succeeded.
    pub const TASK_COMPLETED: &str = "task.completed";
    /// A sub-task failed or timed out.
    pub const TASK_FAILED: &str = "task.failed";
    /// A sub-task did not run.
    pub const TASK_SKIPPED: &str = "task.skipped";
    /// The writer fell back to delete-then-insert.
    pub const WRITER_FALLBACK: &str = "writer.fallback";
    /// Rows were deferred to the next run.
    pub const WRITER_DEFERRED: &str = "writer.deferred";
    /// Too many rows failed pre-write validation.
    pub const ALERT_VALIDATION_BLOCKED: &str = "alert.validation_blocked";
    /// Post-write validation failed.
    pub const ALERT_POST_WRITE: &str = "alert.post_write_validation";
    /// A circuit breaker tripped.
    pub const ALERT_BREAKER_TRIPPED: &str = "alert.breaker_tripped";

    /// Returns true for alert events.
    #[must_use]
    pub fn is_alert(event_type: &str) -> bool {
        event_type.starts_with("alert.")
    }
}
