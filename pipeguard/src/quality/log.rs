//! Append-only quality event log.

use super::event::{QualityEvent, QualityEventType, Severity};
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Persistent storage for quality events.
#[async_trait]
pub trait QualityEventStore: Send + Sync {
    /// Appends an event.
    async fn append(&self, event: QualityEvent) -> Result<(), StoreError>;

    /// Returns every event in append order.
    async fn list(&self) -> Result<Vec<QualityEvent>, StoreError>;
}

/// Quality event store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryQualityEventStore {
    events: RwLock<Vec<QualityEvent>>,
}

impl InMemoryQualityEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QualityEventStore for InMemoryQualityEventStore {
    async fn append(&self, event: QualityEvent) -> Result<(), StoreError> {
        self.events.write().push(event);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<QualityEvent>, StoreError> {
        Ok(self.events.read().clone())
    }
}

/// Front end for recording quality events.
///
/// Recording never fails the caller: a store error is logged and the event
/// is dropped.
#[derive(Clone)]
pub struct QualityEventLog {
    store: Arc<dyn QualityEventStore>,
}

impl std::fmt::Debug for QualityEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityEventLog").finish_non_exhaustive()
    }
}

impl Default for QualityEventLog {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryQualityEventStore::new()))
    }
}

impl QualityEventLog {
    /// Creates a log over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn QualityEventStore>) -> Self {
        Self { store }
    }

    /// Records an event and returns its id.
    pub async fn record(&self, event: QualityEvent) -> String {
        let id = event.id.clone();
        match event.severity {
            Severity::Info => info!(
                event_type = %event.event_type,
                table = %event.table,
                date = ?event.date,
                "{}", event.description
            ),
            Severity::Warning => warn!(
                event_type = %event.event_type,
                table = %event.table,
                date = ?event.date,
                "{}", event.description
            ),
            Severity::Error | Severity::Critical => error!(
                event_type = %event.event_type,
                table = %event.table,
                date = ?event.date,
                "{}", event.description
            ),
        }

        if let Err(e) = self.store.append(event).await {
            error!(event_id = %id, error = %e, "failed to persist quality event");
        }
        id
    }

    /// Returns every event.
    pub async fn events(&self) -> Vec<QualityEvent> {
        self.store.list().await.unwrap_or_else(|e| {
            error!(error = %e, "failed to list quality events");
            Vec::new()
        })
    }

    /// Returns events of one type.
    pub async fn events_of(&self, event_type: QualityEventType) -> Vec<QualityEvent> {
        self.events()
            .await
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Returns every event sharing a correlation id, in order.
    pub async fn chain(&self, correlation_id: &str) -> Vec<QualityEvent> {
        self.events()
            .await
            .into_iter()
            .filter(|e| e.correlation_id.as_deref() == Some(correlation_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_utc;

    #[tokio::test]
    async fn test_record_and_filter() {
        let log = QualityEventLog::default();
        let first = log
            .record(
                QualityEvent::new(
                    QualityEventType::IssueDetected,
                    Severity::Warning,
                    "features",
                    "completeness 70%",
                    now_utc(),
                )
                .with_correlation_id(Some("c1".to_string())),
            )
            .await;
        log.record(
            QualityEvent::new(
                QualityEventType::BackfillQueued,
                Severity::Info,
                "features",
                "queued",
                now_utc(),
            )
            .with_related(first.clone())
            .with_correlation_id(Some("c1".to_string())),
        )
        .await;
        log.record(QualityEvent::new(
            QualityEventType::AlertSent,
            Severity::Critical,
            "odds",
            "unrelated",
            now_utc(),
        ))
        .await;

        assert_eq!(log.events().await.len(), 3);
        assert_eq!(log.events_of(QualityEventType::AlertSent).await.len(), 1);

        let chain = log.chain("c1").await;
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].related_event_id.as_deref(), Some(first.as_str()));
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(QualityEventType::ValidationBlocked.to_string(), "validation_blocked");
        assert!(Severity::Critical > Severity::Warning);
    }
}
