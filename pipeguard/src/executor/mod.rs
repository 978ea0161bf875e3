//! Workflow execution.
//!
//! [`TaskRunner`] runs a single job behind the circuit breaker and the
//! completeness gate; [`WorkflowExecutor`] schedules a workflow's tasks on a
//! bounded pool.

mod task;
mod workflow;

pub use task::{TaskResult, TaskRunner};
pub use workflow::{PlannedTask, WorkflowExecutor, WorkflowResult};
