//! Retry record storage.

use crate::errors::StoreError;
use crate::utils::Timestamp;
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one unit of retryable work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryKey {
    /// Job name.
    pub job: String,
    /// Entity the job processes.
    pub entity: String,
    /// Target date.
    pub date: NaiveDate,
}

impl RetryKey {
    /// Creates a key.
    #[must_use]
    pub fn new(job: impl Into<String>, entity: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            job: job.into(),
            entity: entity.into(),
            date,
        }
    }
}

impl fmt::Display for RetryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.job, self.entity, self.date)
    }
}

/// Attempt history for one [`RetryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// The key.
    pub key: RetryKey,
    /// Failed attempts so far.
    pub attempts: u32,
    /// When the latest attempt was recorded.
    pub last_attempt_at: Timestamp,
    /// Whether the breaker has tripped for this key.
    pub tripped: bool,
    /// No retries before this instant. Only set when tripped.
    pub cooldown_until: Option<Timestamp>,
    /// When the record was created.
    pub created_at: Timestamp,
}

/// Shared storage for retry records.
///
/// Implementations must make [`RetryStore::increment`] atomic so concurrent
/// failures of the same key are all counted.
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Returns the record for `key`, if any.
    async fn get(&self, key: &RetryKey) -> Result<Option<RetryRecord>, StoreError>;

    /// Adds one attempt, creating the record on first use.
    async fn increment(&self, key: &RetryKey, now: Timestamp) -> Result<RetryRecord, StoreError>;

    /// Marks the record tripped until `until`.
    async fn trip(&self, key: &RetryKey, until: Timestamp) -> Result<(), StoreError>;

    /// Deletes the record. Returns true if one existed.
    async fn clear(&self, key: &RetryKey) -> Result<bool, StoreError>;

    /// Returns every record.
    async fn list(&self) -> Result<Vec<RetryRecord>, StoreError>;
}

/// Retry store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryRetryStore {
    records: DashMap<RetryKey, RetryRecord>,
}

impl InMemoryRetryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a record; used to seed state.
    pub fn put(&self, record: RetryRecord) {
        self.records.insert(record.key.clone(), record);
    }
}

#[async_trait]
impl RetryStore for InMemoryRetryStore {
    async fn get(&self, key: &RetryKey) -> Result<Option<RetryRecord>, StoreError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn increment(&self, key: &RetryKey, now: Timestamp) -> Result<RetryRecord, StoreError> {
        let mut entry = self.records.entry(key.clone()).or_insert_with(|| RetryRecord {
            key: key.clone(),
            attempts: 0,
            last_attempt_at: now,
            tripped: false,
            cooldown_until: None,
            created_at: now,
        });
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_attempt_at = now;
        Ok(entry.value().clone())
    }

    async fn trip(&self, key: &RetryKey, until: Timestamp) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(key)
            .ok_or_else(|| StoreError::Conflict(format!("no retry record for {key}")))?;
        record.tripped = true;
        record.cooldown_until = Some(until);
        Ok(())
    }

    async fn clear(&self, key: &RetryKey) -> Result<bool, StoreError> {
        Ok(self.records.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<RetryRecord>, StoreError> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }
}
