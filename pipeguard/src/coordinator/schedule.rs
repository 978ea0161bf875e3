//! Daily expected-schedule ledger.
//!
//! One entry per (local date, workflow) records what the scheduler planned
//! and which slots actually ran, so a missed execution can be told apart
//! from a correct skip. The ledger also enforces run-once per slot.

use crate::core::ScheduleAction;
use crate::errors::StoreError;
use crate::scheduler::ScheduleDecision;
use crate::utils::Timestamp;
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// What one workflow was expected to do on one local day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedScheduleEntry {
    /// Local calendar date.
    pub date: NaiveDate,
    /// Workflow id.
    pub workflow_id: String,
    /// Decision kind, e.g. `event_aware`.
    pub decision_kind: String,
    /// Every slot planned for the day.
    pub planned_slots: Vec<Timestamp>,
    /// Latest action.
    pub action: ScheduleAction,
    /// Latest reason.
    pub reason: String,
    /// Slots that were dispatched.
    pub executed_slots: Vec<Timestamp>,
    /// A dispatched run finished without failures.
    pub succeeded: bool,
    /// Last evaluation time.
    pub updated_at: Timestamp,
}

impl ExpectedScheduleEntry {
    /// Creates an entry from a decision.
    #[must_use]
    pub fn from_decision(date: NaiveDate, decision_kind: &str, decision: &ScheduleDecision) -> Self {
        Self {
            date,
            workflow_id: decision.workflow_id.clone(),
            decision_kind: decision_kind.to_string(),
            planned_slots: decision.planned_slots.clone(),
            action: decision.action,
            reason: decision.reason.clone(),
            executed_slots: Vec::new(),
            succeeded: false,
            updated_at: decision.evaluated_at,
        }
    }

    /// Planned slots at or before `now` that never ran.
    #[must_use]
    pub fn missed_slots(&self, now: Timestamp) -> Vec<Timestamp> {
        self.planned_slots
            .iter()
            .copied()
            .filter(|slot| *slot <= now && !self.executed_slots.contains(slot))
            .collect()
    }
}

/// Storage for the expected-schedule ledger.
///
/// `record_decision` keeps executed slots and the success flag of an
/// existing entry. `claim_slot` must be atomic: of several concurrent
/// callers for the same slot, exactly one gets `true`.
#[async_trait]
pub trait ExpectedScheduleStore: Send + Sync {
    /// Inserts or refreshes the entry for the decision's workflow and date.
    async fn record_decision(&self, entry: ExpectedScheduleEntry) -> Result<(), StoreError>;

    /// Marks `slot` executed. Returns false if it already was.
    async fn claim_slot(
        &self,
        date: NaiveDate,
        workflow_id: &str,
        slot: Timestamp,
    ) -> Result<bool, StoreError>;

    /// Records that a dispatched run succeeded.
    async fn mark_succeeded(&self, date: NaiveDate, workflow_id: &str) -> Result<(), StoreError>;

    /// Fetches one entry.
    async fn get(
        &self,
        date: NaiveDate,
        workflow_id: &str,
    ) -> Result<Option<ExpectedScheduleEntry>, StoreError>;

    /// Lists a day's entries ordered by workflow id.
    async fn list(&self, date: NaiveDate) -> Result<Vec<ExpectedScheduleEntry>, StoreError>;
}

/// Ledger held in memory.
#[derive(Debug, Default)]
pub struct InMemoryExpectedScheduleStore {
    entries: DashMap<(NaiveDate, String), ExpectedScheduleEntry>,
}

impl InMemoryExpectedScheduleStore {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(date: NaiveDate, workflow_id: &str) -> StoreError {
    StoreError::Conflict(format!("no schedule entry for {workflow_id} on {date}"))
}

#[async_trait]
impl ExpectedScheduleStore for InMemoryExpectedScheduleStore {
    async fn record_decision(&self, entry: ExpectedScheduleEntry) -> Result<(), StoreError> {
        let key = (entry.date, entry.workflow_id.clone());
        self.entries
            .entry(key)
            .and_modify(|existing| {
                existing.decision_kind.clone_from(&entry.decision_kind);
                existing.planned_slots.clone_from(&entry.planned_slots);
                existing.action = entry.action;
                existing.reason.clone_from(&entry.reason);
                existing.updated_at = entry.updated_at;
            })
            .or_insert(entry);
        Ok(())
    }

    async fn claim_slot(
        &self,
        date: NaiveDate,
        workflow_id: &str,
        slot: Timestamp,
    ) -> Result<bool, StoreError> {
        let mut entry = self
            .entries
            .get_mut(&(date, workflow_id.to_string()))
            .ok_or_else(|| missing(date, workflow_id))?;
        if entry.executed_slots.contains(&slot) {
            return Ok(false);
        }
        entry.executed_slots.push(slot);
        Ok(true)
    }

    async fn mark_succeeded(&self, date: NaiveDate, workflow_id: &str) -> Result<(), StoreError> {
        let mut entry = self
            .entries
            .get_mut(&(date, workflow_id.to_string()))
            .ok_or_else(|| missing(date, workflow_id))?;
        entry.succeeded = true;
        Ok(())
    }

    async fn get(
        &self,
        date: NaiveDate,
        workflow_id: &str,
    ) -> Result<Option<ExpectedScheduleEntry>, StoreError> {
        Ok(self
            .entries
            .get(&(date, workflow_id.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn list(&self, date: NaiveDate) -> Result<Vec<ExpectedScheduleEntry>, StoreError> {
        let mut entries: Vec<ExpectedScheduleEntry> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == date)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2025, 1, 10, hour, 0, 0).unwrap()
    }

    fn entry() -> ExpectedScheduleEntry {
        ExpectedScheduleEntry {
            date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            workflow_id: "pregame".to_string(),
            decision_kind: "event_aware".to_string(),
            planned_slots: vec![at(13), at(15), at(17)],
            action: ScheduleAction::Skip,
            reason: "no slot due".to_string(),
            executed_slots: Vec::new(),
            succeeded: false,
            updated_at: at(12),
        }
    }

    #[tokio::test]
    async fn test_claim_slot_once() {
        let store = InMemoryExpectedScheduleStore::new();
        let e = entry();
        store.record_decision(e.clone()).await.unwrap();

        assert!(store.claim_slot(e.date, "pregame", at(13)).await.unwrap());
        assert!(!store.claim_slot(e.date, "pregame", at(13)).await.unwrap());
        assert!(store.claim_slot(e.date, "pregame", at(15)).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_decision_keeps_execution_history() {
        let store = InMemoryExpectedScheduleStore::new();
        let e = entry();
        store.record_decision(e.clone()).await.unwrap();
        store.claim_slot(e.date, "pregame", at(13)).await.unwrap();
        store.mark_succeeded(e.date, "pregame").await.unwrap();

        let mut refreshed = entry();
        refreshed.action = ScheduleAction::Run;
        refreshed.reason = "slot 15:00 due".to_string();
        store.record_decision(refreshed).await.unwrap();

        let stored = store.get(e.date, "pregame").await.unwrap().unwrap();
        assert_eq!(stored.action, ScheduleAction::Run);
        assert_eq!(stored.executed_slots, vec![at(13)]);
        assert!(stored.succeeded);
        assert_eq!(stored.missed_slots(at(16)), vec![at(15)]);
    }

    #[tokio::test]
    async fn test_claim_without_entry_fails() {
        let store = InMemoryExpectedScheduleStore::new();
        let date = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        assert!(store.claim_slot(date, "ghost", at(1)).await.is_err());
        assert!(store.list(date).await.unwrap().is_empty());
    }
}
