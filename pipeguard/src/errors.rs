//! Error types for pipeguard.
//!
//! Each concern gets its own `thiserror` enum; [`PipeguardError`] is the
//! umbrella type returned across module boundaries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = PipeguardError> = std::result::Result<T, E>;

/// The main error type for pipeguard operations.
#[derive(Debug, Error)]
pub enum PipeguardError {
    /// Configuration could not be loaded or failed validation.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The storage backend rejected an operation.
    #[error("{0}")]
    Backend(#[from] BackendError),

    /// A job entry point failed.
    #[error("{0}")]
    Job(#[from] JobError),

    /// A backfill queue operation failed.
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// A coordination store (retry records, events, schedule) failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// An operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading or validating the declarative config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        /// The file that failed to load.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML or does not match the schema.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// The config parsed but violates an invariant.
    #[error("{0}")]
    Invalid(#[from] ConfigValidationError),
}

/// Error raised when a parsed configuration violates an invariant.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigValidationError {
    /// Stable error code, e.g. `CONFIG-002-CYCLE`.
    pub code: String,
    /// The error message.
    pub message: String,
    /// The workflows involved.
    pub workflows: Vec<String>,
    /// Hint for fixing the problem.
    pub fix_hint: Option<String>,
}

impl ConfigValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            workflows: Vec::new(),
            fix_hint: None,
        }
    }

    /// Sets the workflows involved.
    #[must_use]
    pub fn with_workflows(mut self, workflows: Vec<String>) -> Self {
        self.workflows = workflows;
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Creates an error for a sub-task ordering cycle.
    #[must_use]
    pub fn cycle(workflow: &str, cycle_path: &[String]) -> Self {
        Self::new(
            "CONFIG-002-CYCLE",
            format!(
                "Workflow '{}' has a task ordering cycle: {}",
                workflow,
                cycle_path.join(" -> ")
            ),
        )
        .with_workflows(vec![workflow.to_string()])
        .with_fix_hint("Remove one of the `after` references in the cycle.")
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code));
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("workflows".to_string(), serde_json::json!(self.workflows));
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        map
    }
}

/// Classification of a backend failure, used to pick the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// The statement was malformed for this backend.
    Syntax,
    /// The request shape was rejected.
    BadRequest,
    /// Deletes/updates rejected because of a recent append.
    VisibilityLag,
    /// The target or staging table does not exist.
    NotFound,
    /// A retryable infrastructure failure.
    Transient,
    /// Anything else.
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax_error"),
            Self::BadRequest => write!(f, "bad_request"),
            Self::VisibilityLag => write!(f, "visibility_lag"),
            Self::NotFound => write!(f, "not_found"),
            Self::Transient => write!(f, "transient"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Error returned by a storage backend.
#[derive(Debug, Clone, Error)]
#[error("Backend error ({kind}): {message}")]
pub struct BackendError {
    /// Classification of the failure.
    pub kind: BackendErrorKind,
    /// Backend-provided message.
    pub message: String,
}

impl BackendError {
    /// Creates a new backend error.
    #[must_use]
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a syntax error.
    #[must_use]
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Syntax, message)
    }

    /// Creates a bad request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::BadRequest, message)
    }

    /// Creates a write-visibility-lag error.
    #[must_use]
    pub fn visibility_lag(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::VisibilityLag, message)
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, message)
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transient, message)
    }

    /// Returns true when the merge path should fall back to delete-then-insert.
    #[must_use]
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::Syntax
                | BackendErrorKind::BadRequest
                | BackendErrorKind::VisibilityLag
                | BackendErrorKind::NotFound
        )
    }

    /// Returns true for write-visibility-lag conflicts.
    #[must_use]
    pub fn is_visibility_lag(&self) -> bool {
        self.kind == BackendErrorKind::VisibilityLag
    }
}

/// Errors raised by job entry points.
#[derive(Debug, Error)]
pub enum JobError {
    /// No job is registered under this name.
    #[error("Job not registered: {0}")]
    NotRegistered(String),

    /// The job ran and reported failure.
    #[error("Job '{job}' failed: {reason}")]
    Failed {
        /// The job name.
        job: String,
        /// The failure reason.
        reason: String,
    },

    /// The job exceeded its deadline.
    #[error("Job '{job}' timed out after {seconds}s")]
    Timeout {
        /// The job name.
        job: String,
        /// The timeout that elapsed.
        seconds: u64,
    },

    /// A write through the idempotent writer failed.
    #[error("{0}")]
    Backend(#[from] BackendError),

    /// Any other error surfaced by the job implementation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    /// Creates a failed error.
    #[must_use]
    pub fn failed(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            job: job.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by backfill queue operations.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// No item with this id exists.
    #[error("Queue item not found: {0}")]
    NotFound(String),

    /// The requested status transition is not allowed.
    #[error("Invalid queue transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// The item id.
        id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Another worker holds an unexpired claim on the item.
    #[error("Queue item {id} is claimed by {owner}")]
    ClaimHeld {
        /// The item id.
        id: String,
        /// The worker holding the claim.
        owner: String,
    },

    /// The claim expired and was recovered while this worker ran the job;
    /// the result was discarded.
    #[error("Lease on queue item {0} was lost during execution")]
    LeaseLost(String),

    /// The underlying store failed.
    #[error("{0}")]
    Store(#[from] StoreError),
}

/// Errors raised by coordination stores.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A conditional update lost a race.
    #[error("Store conflict: {0}")]
    Conflict(String),

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation_error_cycle() {
        let err = ConfigValidationError::cycle(
            "daily",
            &["a".to_string(), "b".to_string(), "a".to_string()],
        );

        assert_eq!(err.code, "CONFIG-002-CYCLE");
        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(err.workflows, vec!["daily".to_string()]);
        assert!(err.fix_hint.is_some());
    }

    #[test]
    fn test_config_validation_error_to_dict() {
        let err = ConfigValidationError::new("CONFIG-001-DUPLICATE", "duplicate id")
            .with_workflows(vec!["w".to_string()]);

        let dict = err.to_dict();
        assert_eq!(dict.get("code").unwrap(), "CONFIG-001-DUPLICATE");
        assert!(!dict.contains_key("fix_hint"));
    }

    #[test]
    fn test_backend_error_fallback_classification() {
        assert!(BackendError::syntax("bad").triggers_fallback());
        assert!(BackendError::bad_request("bad").triggers_fallback());
        assert!(BackendError::visibility_lag("lag").triggers_fallback());
        assert!(BackendError::not_found("gone").triggers_fallback());
        assert!(!BackendError::transient("flaky").triggers_fallback());
        assert!(!BackendError::new(BackendErrorKind::Other, "?").triggers_fallback());
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::visibility_lag("streaming buffer");
        assert_eq!(err.to_string(), "Backend error (visibility_lag): streaming buffer");
        assert!(err.is_visibility_lag());
    }

    #[test]
    fn test_error_conversions() {
        let err: PipeguardError = QueueError::NotFound("q1".to_string()).into();
        assert!(matches!(err, PipeguardError::Queue(_)));

        let err: JobError = anyhow::anyhow!("boom").into();
        assert_eq!(err.to_string(), "boom");
    }
}
