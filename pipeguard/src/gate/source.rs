//! Upstream completeness sources.

use crate::config::WindowSpec;
use crate::errors::StoreError;
use crate::utils::Timestamp;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Expected vs. actual row counts for one entity over one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamSnapshot {
    /// Entity the counts belong to.
    pub entity: String,
    /// Count reported by the reference source (e.g. the event schedule).
    pub expected: u64,
    /// Count present in upstream output.
    pub actual: u64,
    /// Most recent upstream write, if known.
    pub last_updated: Option<Timestamp>,
}

impl UpstreamSnapshot {
    /// Creates a snapshot with no freshness information.
    #[must_use]
    pub fn new(entity: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self {
            entity: entity.into(),
            expected,
            actual,
            last_updated: None,
        }
    }

    /// Sets the last upstream update time.
    #[must_use]
    pub fn with_last_updated(mut self, at: Timestamp) -> Self {
        self.last_updated = Some(at);
        self
    }
}

/// Supplies expected and actual counts to the completeness gate.
///
/// One call covers every requested entity for one window so batch checks
/// cost a single round-trip per window.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletenessSource: Send + Sync {
    /// Returns snapshots for `entities` over `window` ending at `date`.
    ///
    /// Entities missing from the result have nothing expected.
    async fn fetch(
        &self,
        job: &str,
        window: &WindowSpec,
        entities: &[String],
        date: NaiveDate,
    ) -> Result<Vec<UpstreamSnapshot>, StoreError>;
}

/// In-memory source keyed by (window name, entity, date).
#[derive(Debug, Default)]
pub struct InMemoryCompletenessSource {
    snapshots: RwLock<HashMap<(String, String, NaiveDate), UpstreamSnapshot>>,
}

impl InMemoryCompletenessSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records counts for an entity and window on a date.
    pub fn set(&self, window: &str, date: NaiveDate, snapshot: UpstreamSnapshot) {
        self.snapshots
            .write()
            .insert((window.to_string(), snapshot.entity.clone(), date), snapshot);
    }
}

#[async_trait]
impl CompletenessSource for InMemoryCompletenessSource {
    async fn fetch(
        &self,
        _job: &str,
        window: &WindowSpec,
        entities: &[String],
        date: NaiveDate,
    ) -> Result<Vec<UpstreamSnapshot>, StoreError> {
        let snapshots = self.snapshots.read();
        Ok(entities
            .iter()
            .filter_map(|entity| {
                snapshots
                    .get(&(window.name.clone(), entity.clone(), date))
                    .cloned()
            })
            .collect())
    }
}
