//! Core domain enums shared by every component.

mod status;

pub use status::{QueuePriority, QueueStatus, RunStatus, ScheduleAction, TaskStatus};
