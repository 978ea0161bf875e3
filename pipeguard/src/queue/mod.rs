//! Durable backfill queue and the auto-backfill orchestrator.

mod auto;
mod backfill;
mod backoff;
mod item;
mod store;

pub use auto::{AutoBackfill, DrainReport, ScanReport};
pub use backfill::{BackfillQueue, EnqueueOutcome};
pub use backoff::{BackoffPolicy, BackoffStrategy, JitterStrategy};
pub use item::{BackfillRequest, QueueItem, QueueStats};
pub use store::{InMemoryQueueStore, InsertOutcome, QueueStore};
