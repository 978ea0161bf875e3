//! Job entry-point contract and registry.

mod contract;
mod registry;

pub use contract::{FnJob, Job, JobOptions, JobOutcome, JobStats, ALL_ENTITIES};
pub use registry::JobRegistry;
