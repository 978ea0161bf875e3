//! # Pipeguard
//!
//! Coordination layer for multi-stage batch data pipelines.
//!
//! Pipeguard decides when each stage runs and whether its inputs are good
//! enough to run on:
//!
//! - **Scheduling**: fixed-window, event-aware, retrospective and discovery
//!   workflows evaluated against an injectable clock
//! - **Completeness gate**: expected vs. actual upstream counts per entity
//!   and window, with a bootstrap grace period
//! - **Circuit breaker**: bounded retries per (job, entity, date)
//! - **Backfill queue**: leased, prioritized remediation with backoff
//! - **Idempotent writer**: dedup, validation, staged merge with a
//!   delete-then-insert fallback and post-write checks
//! - **Quality event log**: append-only audit of detected issues and
//!   their remediation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipeguard::prelude::*;
//!
//! let config = Arc::new(ConfigStore::load("pipeguard.toml")?);
//! let registry = Arc::new(JobRegistry::new().with_job(AnalyticsJob::new()));
//! let coordinator = Coordinator::new(CoordinatorContext::in_memory(config, registry));
//!
//! let response = coordinator
//!     .handle_trigger(TriggerPayload::new("raw_complete"))
//!     .await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod breaker;
pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod gate;
pub mod jobs;
pub mod observability;
pub mod quality;
pub mod queue;
pub mod scheduler;
pub mod utils;
pub mod writer;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::breaker::{CircuitBreaker, RetryKey, RetryStore};
    pub use crate::cancellation::ShutdownToken;
    pub use crate::config::{ConfigStore, CoordinatorConfig, DecisionType, WorkflowSpec};
    pub use crate::coordinator::{
        Coordinator, CoordinatorContext, RunOptions, TriggerPayload, TriggerResponse,
    };
    pub use crate::core::{QueuePriority, QueueStatus, RunStatus, ScheduleAction, TaskStatus};
    pub use crate::errors::{BackendError, JobError, PipeguardError, Result};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::gate::{CompletenessGate, CompletenessSource, GateDecision};
    pub use crate::jobs::{FnJob, Job, JobOptions, JobOutcome, JobRegistry, JobStats};
    pub use crate::observability::init_tracing;
    pub use crate::queue::{BackfillQueue, BackfillRequest};
    pub use crate::writer::{IdempotentWriter, Row, WarehouseBackend, WriteTarget};
    pub use crate::utils::{generate_uuid, iso_timestamp, Clock, DateArg, Timestamp};
    pub use std::sync::Arc;
}
