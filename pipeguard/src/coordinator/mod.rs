//! Coordinator entry points: upstream triggers, manual runs, scheduler
//! ticks and backfill drains, plus the expected-schedule ledger.

mod context;
mod runtime;
mod schedule;
mod trigger;

pub use context::CoordinatorContext;
pub use runtime::Coordinator;
pub use schedule::{ExpectedScheduleEntry, ExpectedScheduleStore, InMemoryExpectedScheduleStore};
pub use trigger::{RunOptions, TickReport, TriggerPayload, TriggerResponse};

#[cfg(test)]
mod integration_tests;
