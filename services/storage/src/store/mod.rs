//! Persistence gateway for detection events.
//!
//! Every backend maintains the same logical indexes:
//!
//! | index | serves |
//! |-------|--------|
//! | `timestamp desc` | recent events, time-range scans, retention purge |
//! | `source_id` | per-source equality scans |
//! | `frame_number` | per-frame lookups |
//! | `(source_id, timestamp desc)` | "recent events for this source" |

mod memory;
mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::event::{ClassCountSnapshot, DetectionEvent, EventId, StoredEvent};
use crate::statistics::ClassStatistics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Description of one index on the event collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub definition: String,
}

/// Collection-level information reported by `collection_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub total_documents: u64,
    pub database_name: String,
    pub table_name: String,
    pub indexes: Vec<IndexDescriptor>,
}

/// Durable, indexed storage for [`DetectionEvent`]s.
///
/// Implementations are shared between pipelines and the statistics engine, so
/// they must be usable concurrently without external locking. A document only
/// becomes visible to readers once it has been written completely.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Create the indexes listed in the module docs. Idempotent. Failures are
    /// reported as [`StoreError::IndexCreationFailed`] and are not fatal.
    async fn ensure_indexes(&self) -> Result<(), StoreError>;

    /// Validate and write one event.
    async fn persist(&self, event: &DetectionEvent) -> Result<EventId, StoreError>;

    /// Write several events atomically: either all are stored or none.
    async fn persist_many(&self, events: &[DetectionEvent]) -> Result<Vec<EventId>, StoreError> {
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            ids.push(self.persist(event).await?);
        }
        Ok(ids)
    }

    /// Newest events across all sources.
    async fn query_recent(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError>;

    /// Newest events of one source, truncated to `limit`.
    async fn query_by_source(
        &self,
        source_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Events with `start <= timestamp <= end`, newest first.
    async fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        source_id: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Events recorded for a raw frame number, newest first.
    async fn query_by_frame_number(
        &self,
        frame_number: u64,
        source_id: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Delete every event with `timestamp < cutoff`; returns the deleted count.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn collection_stats(&self) -> Result<CollectionStats, StoreError>;

    /// Per-class detection statistics over every stored detection, optionally
    /// restricted to one source. Computed without loading the full history.
    async fn class_statistics(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<ClassStatistics>, StoreError>;

    /// Sum of `object_counts` per class over events in `[start, end]`.
    async fn class_totals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ClassCountSnapshot, StoreError>;

    /// Release connections. Further calls fail with `StoreUnavailable`.
    async fn close(&self);
}

/// Open the backend selected by the URL scheme and make sure its indexes exist.
///
/// Index failures are logged and swallowed; connection failures are returned.
pub async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn EventStore>, StoreError> {
    let store: Arc<dyn EventStore> = if config.is_memory() {
        info!("Using in-process event store");
        Arc::new(MemoryEventStore::with_limits(
            config.table.clone(),
            config.max_document_bytes,
        ))
    } else if config.url.starts_with("postgres://") || config.url.starts_with("postgresql://") {
        Arc::new(PgEventStore::connect(config).await?)
    } else {
        return Err(StoreError::StoreUnavailable(format!(
            "unsupported store URL scheme: {}",
            config.url
        )));
    };

    if let Err(e) = store.ensure_indexes().await {
        tracing::warn!(error = %e, "Continuing without some indexes; queries may be slower");
    }

    Ok(store)
}

/// Schema and size checks shared by every backend.
pub(crate) fn check_document(event: &DetectionEvent, max_bytes: usize) -> Result<(), StoreError> {
    event.validate()?;
    let size = event.document_size()?;
    if size > max_bytes {
        return Err(StoreError::WriteRejected(format!(
            "document is {} bytes, limit is {}",
            size, max_bytes
        )));
    }
    Ok(())
}

pub(crate) fn describe_filters(pairs: &[(&str, Option<String>)]) -> String {
    let parts: Vec<String> = pairs
        .iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| format!("{}={}", key, v)))
        .collect();
    if parts.is_empty() {
        "no filters".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::{create_detection, create_test_event};

    #[test]
    fn test_oversized_document_rejected() {
        let event = create_test_event("cam-1", &[create_detection("car", 0.9)]);
        assert!(check_document(&event, 1 << 20).is_ok());
        assert!(matches!(
            check_document(&event, 16),
            Err(StoreError::WriteRejected(_))
        ));
    }

    #[test]
    fn test_describe_filters() {
        assert_eq!(describe_filters(&[("source_id", None)]), "no filters");
        assert_eq!(
            describe_filters(&[
                ("source_id", Some("cam-1".to_string())),
                ("limit", Some("10".to_string())),
            ]),
            "source_id=cam-1, limit=10"
        );
    }

    #[test]
    fn test_open_memory_store() {
        let config = DatabaseConfig {
            url: "memory://".to_string(),
            ..Default::default()
        };
        let stats = tokio_test::block_on(async {
            let store = open_store(&config).await.unwrap();
            store.collection_stats().await.unwrap()
        });
        assert_eq!(stats.total_documents, 0);
        assert_eq!(stats.indexes.len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_unavailable() {
        let config = DatabaseConfig {
            url: "redis://localhost:6379".to_string(),
            ..Default::default()
        };
        let err = open_store(&config).await.err().unwrap();
        assert!(err.is_unavailable());
    }
}
