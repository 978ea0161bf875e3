//! Logging setup and timing helpers.

mod tracing;

pub use tracing::{build_filter, init_tracing, SpanTimer};
