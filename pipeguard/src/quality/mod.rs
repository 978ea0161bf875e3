//! Append-only log of data-quality events.

mod event;
mod log;

pub use event::{QualityEvent, QualityEventType, Severity};
pub use log::{InMemoryQualityEventStore, QualityEventLog, QualityEventStore};
