//! Durable storage for the backfill queue.

use super::item::QueueItem;
use crate::core::QueueStatus;
use crate::errors::StoreError;
use crate::utils::Timestamp;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Result of an insert with deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The item was stored.
    Inserted,
    /// An open item for the same work exists; carries its id.
    Duplicate(String),
}

/// Storage operations the queue needs.
///
/// `insert_unique`, `claim` and `compare_and_swap` must each be atomic
/// with respect to concurrent callers.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Stores `item` unless a PENDING or RUNNING item shares its dedup key.
    async fn insert_unique(&self, item: QueueItem) -> Result<InsertOutcome, StoreError>;

    /// Leases up to `limit` claimable items to `worker` until `lease_until`,
    /// ordered by priority (high first), then age, then id.
    async fn claim(
        &self,
        limit: usize,
        now: Timestamp,
        worker: &str,
        lease_until: Timestamp,
    ) -> Result<Vec<QueueItem>, StoreError>;

    /// Replaces the stored item if its current status is `expected`.
    async fn compare_and_swap(
        &self,
        item: &QueueItem,
        expected: QueueStatus,
    ) -> Result<bool, StoreError>;

    /// Replaces the stored item if it is RUNNING and still claimed by
    /// `worker`. A worker whose lease was recovered gets `false`.
    async fn finish_owned(&self, item: &QueueItem, worker: &str) -> Result<bool, StoreError>;

    /// Fetches one item.
    async fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError>;

    /// Lists items, optionally filtered by status, oldest first.
    async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<QueueItem>, StoreError>;
}

/// Queue store held in memory behind a single lock.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    items: Mutex<HashMap<String, QueueItem>>,
}

impl InMemoryQueueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert_unique(&self, item: QueueItem) -> Result<InsertOutcome, StoreError> {
        let mut items = self.items.lock();
        let key = item.dedup_key();
        if let Some(existing) = items
            .values()
            .find(|i| i.status.is_open() && i.dedup_key() == key)
        {
            return Ok(InsertOutcome::Duplicate(existing.id.clone()));
        }
        items.insert(item.id.clone(), item);
        Ok(InsertOutcome::Inserted)
    }

    async fn claim(
        &self,
        limit: usize,
        now: Timestamp,
        worker: &str,
        lease_until: Timestamp,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let mut items = self.items.lock();
        let mut candidates: Vec<&QueueItem> =
            items.values().filter(|i| i.is_claimable(now)).collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let ids: Vec<String> = candidates.into_iter().take(limit).map(|i| i.id.clone()).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = items.get_mut(&id) {
                item.claimed_by = Some(worker.to_string());
                item.lease_until = Some(lease_until);
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn compare_and_swap(
        &self,
        item: &QueueItem,
        expected: QueueStatus,
    ) -> Result<bool, StoreError> {
        let mut items = self.items.lock();
        match items.get_mut(&item.id) {
            Some(current) if current.status == expected => {
                *current = item.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_owned(&self, item: &QueueItem, worker: &str) -> Result<bool, StoreError> {
        let mut items = self.items.lock();
        match items.get_mut(&item.id) {
            Some(current)
                if current.status == QueueStatus::Running
                    && current.claimed_by.as_deref() == Some(worker) =>
            {
                *current = item.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        Ok(self.items.lock().get(id).cloned())
    }

    async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<QueueItem>, StoreError> {
        let mut items: Vec<QueueItem> = self
            .items
            .lock()
            .values()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }
}
