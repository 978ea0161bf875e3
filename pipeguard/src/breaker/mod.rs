//! Circuit breaker bounding retries per (job, entity, date).

mod circuit;
mod store;

pub use circuit::{BreakerState, CircuitBreaker};
pub use store::{InMemoryRetryStore, RetryKey, RetryRecord, RetryStore};
