//! Read-side analytics over persisted detection events.

use crate::error::StoreError;
use crate::event::{ClassCountSnapshot, Detection, StoredEvent};
use crate::store::{describe_filters, CollectionStats, EventStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Aggregate over every stored detection of one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassStatistics {
    pub class_name: String,
    pub total_count: u64,
    pub avg_confidence: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
}

#[derive(Debug, Clone, Copy)]
struct ClassAccumulator {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

/// Streaming reducer for [`ClassStatistics`]. Holds one accumulator per class,
/// never the detections themselves.
#[derive(Debug, Default)]
pub struct ClassStatsReducer {
    classes: HashMap<String, ClassAccumulator>,
}

impl ClassStatsReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, detection: &Detection) {
        let confidence = detection.confidence;
        self.classes
            .entry(detection.class_name.clone())
            .and_modify(|acc| {
                acc.count += 1;
                acc.sum += confidence;
                acc.min = acc.min.min(confidence);
                acc.max = acc.max.max(confidence);
            })
            .or_insert(ClassAccumulator {
                count: 1,
                sum: confidence,
                min: confidence,
                max: confidence,
            });
    }

    pub fn observe_all<'a>(&mut self, detections: impl IntoIterator<Item = &'a Detection>) {
        for detection in detections {
            self.observe(detection);
        }
    }

    /// Sorted by `total_count` descending, ties by class name ascending.
    pub fn finish(self) -> Vec<ClassStatistics> {
        let mut stats: Vec<ClassStatistics> = self
            .classes
            .into_iter()
            .map(|(class_name, acc)| ClassStatistics {
                class_name,
                total_count: acc.count,
                avg_confidence: acc.sum / acc.count as f64,
                min_confidence: acc.min,
                max_confidence: acc.max,
            })
            .collect();
        sort_class_statistics(&mut stats);
        stats
    }
}

pub(crate) fn sort_class_statistics(stats: &mut [ClassStatistics]) {
    stats.sort_by(|a, b| {
        b.total_count
            .cmp(&a.total_count)
            .then_with(|| a.class_name.cmp(&b.class_name))
    });
}

/// Whether a destructive purge was explicitly confirmed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeConfirmation {
    Confirmed,
    Unconfirmed,
}

impl From<bool> for PurgeConfirmation {
    fn from(confirmed: bool) -> Self {
        if confirmed {
            PurgeConfirmation::Confirmed
        } else {
            PurgeConfirmation::Unconfirmed
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeReport {
    pub cutoff: DateTime<Utc>,
    pub deleted: u64,
}

/// Events in a trailing window plus their summed class counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub events: Vec<StoredEvent>,
    /// Sum of `object_counts` over `events`
    pub class_totals: ClassCountSnapshot,
}

impl WindowReport {
    /// Class totals sorted by count descending, ties by name.
    pub fn ranked_totals(&self) -> Vec<(&str, u64)> {
        let mut ranked: Vec<(&str, u64)> = self
            .class_totals
            .iter()
            .map(|(name, count)| (name.as_str(), *count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
    }
}

/// Read-only analytics over an [`EventStore`], plus the retention purge.
#[derive(Clone)]
pub struct StatisticsEngine {
    store: Arc<dyn EventStore>,
}

impl StatisticsEngine {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Per-class count and confidence statistics over all stored detections.
    #[instrument(skip(self))]
    pub async fn aggregate_by_class(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<ClassStatistics>, StoreError> {
        self.store.class_statistics(source_id).await.map_err(|e| {
            read_context(
                e,
                "aggregate_by_class",
                &[("source_id", source_id.map(str::to_string))],
            )
        })
    }

    /// Sum of per-event class counts over `[start, end]`.
    #[instrument(skip(self))]
    pub async fn aggregate_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ClassCountSnapshot, StoreError> {
        check_range(start, end)?;
        self.store.class_totals(start, end).await.map_err(|e| {
            read_context(
                e,
                "aggregate_by_time_range",
                &[("start", Some(start.to_rfc3339())), ("end", Some(end.to_rfc3339()))],
            )
        })
    }

    pub async fn recent_events(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        self.store
            .query_recent(limit)
            .await
            .map_err(|e| read_context(e, "recent_events", &[("limit", Some(limit.to_string()))]))
    }

    /// Events from the trailing `hours`, newest first, with summed class counts.
    pub async fn events_in_last(
        &self,
        hours: u32,
        source_id: Option<&str>,
    ) -> Result<WindowReport, StoreError> {
        let end = Utc::now();
        let start = window_start(end, hours)?;
        let events = self
            .store
            .query_by_time_range(start, end, source_id)
            .await
            .map_err(|e| {
                read_context(
                    e,
                    "events_in_last",
                    &[
                        ("hours", Some(hours.to_string())),
                        ("source_id", source_id.map(str::to_string)),
                    ],
                )
            })?;

        let mut class_totals = ClassCountSnapshot::new();
        for stored in &events {
            for (class_name, count) in &stored.event.object_counts {
                *class_totals.entry(class_name.clone()).or_insert(0) += count;
            }
        }

        Ok(WindowReport {
            start,
            end,
            events,
            class_totals,
        })
    }

    pub async fn events_for_frame(
        &self,
        frame_number: u64,
        source_id: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.store
            .query_by_frame_number(frame_number, source_id)
            .await
            .map_err(|e| {
                read_context(
                    e,
                    "events_for_frame",
                    &[
                        ("frame_number", Some(frame_number.to_string())),
                        ("source_id", source_id.map(str::to_string)),
                    ],
                )
            })
    }

    pub async fn collection_info(&self) -> Result<CollectionStats, StoreError> {
        self.store
            .collection_stats()
            .await
            .map_err(|e| read_context(e, "collection_info", &[]))
    }

    /// Delete events older than `now - max_age`. Refuses unless confirmed.
    #[instrument(skip(self))]
    pub async fn purge(
        &self,
        max_age: Duration,
        confirmation: PurgeConfirmation,
    ) -> Result<PurgeReport, StoreError> {
        if max_age < Duration::zero() {
            return Err(StoreError::InvalidQuery(
                "max_age must not be negative".to_string(),
            ));
        }
        let cutoff = Utc::now().checked_sub_signed(max_age).ok_or_else(|| {
            StoreError::InvalidQuery(format!(
                "max_age of {} days reaches past the earliest representable time",
                max_age.num_days()
            ))
        })?;
        if confirmation != PurgeConfirmation::Confirmed {
            warn!(cutoff = %cutoff, "Purge refused without confirmation");
            return Err(StoreError::PurgeConfirmationRequired { cutoff });
        }

        let deleted = self.store.purge_older_than(cutoff).await?;
        info!(deleted = deleted, cutoff = %cutoff, "Purged old detection events");
        metrics::counter!("vigil.events.purged").increment(deleted);

        Ok(PurgeReport { cutoff, deleted })
    }
}

/// Start of a trailing window of `hours` ending at `end`.
fn window_start(end: DateTime<Utc>, hours: u32) -> Result<DateTime<Utc>, StoreError> {
    Duration::try_hours(i64::from(hours))
        .and_then(|span| end.checked_sub_signed(span))
        .ok_or_else(|| {
            StoreError::InvalidQuery(format!(
                "a window of {} hours reaches past the earliest representable time",
                hours
            ))
        })
}

fn check_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), StoreError> {
    if start > end {
        return Err(StoreError::InvalidQuery(format!(
            "start {} is after end {}",
            start.to_rfc3339(),
            end.to_rfc3339()
        )));
    }
    Ok(())
}

/// Reads never surface a bare `StoreUnavailable`; they name what was asked.
fn read_context(
    error: StoreError,
    operation: &'static str,
    filters: &[(&str, Option<String>)],
) -> StoreError {
    match error {
        StoreError::StoreUnavailable(reason) => {
            StoreError::query_failed(operation, describe_filters(filters), reason)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::{create_detection, create_test_event};
    use crate::event::{DetectionEvent, EventId};
    use crate::store::MemoryEventStore;
    use async_trait::async_trait;

    async fn seeded_engine() -> StatisticsEngine {
        let store = Arc::new(MemoryEventStore::new("detection_events"));
        let events = [
            create_test_event(
                "cam-1",
                &[create_detection("car", 0.9), create_detection("person", 0.6)],
            ),
            create_test_event(
                "cam-1",
                &[create_detection("car", 0.7), create_detection("car", 0.5)],
            ),
            create_test_event("cam-2", &[create_detection("person", 0.8)]),
        ];
        for event in &events {
            store.persist(event).await.unwrap();
        }
        StatisticsEngine::new(store)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn test_aggregate_by_class() {
        let engine = seeded_engine().await;
        let stats = engine.aggregate_by_class(None).await.unwrap();

        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].class_name, "car");
        assert_eq!(stats[0].total_count, 3);
        assert!(approx(stats[0].avg_confidence, 0.7));
        assert!(approx(stats[0].min_confidence, 0.5));
        assert!(approx(stats[0].max_confidence, 0.9));

        assert_eq!(stats[1].class_name, "person");
        assert_eq!(stats[1].total_count, 2);
        assert!(approx(stats[1].avg_confidence, 0.7));
    }

    #[tokio::test]
    async fn test_aggregate_by_class_for_source() {
        let engine = seeded_engine().await;
        let stats = engine.aggregate_by_class(Some("cam-2")).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].class_name, "person");
        assert_eq!(stats[0].total_count, 1);
    }

    #[tokio::test]
    async fn test_empty_store_yields_no_statistics() {
        let engine = StatisticsEngine::new(Arc::new(MemoryEventStore::new("detection_events")));
        assert!(engine.aggregate_by_class(None).await.unwrap().is_empty());
    }

    #[test]
    fn test_ties_sorted_by_name() {
        let mut reducer = ClassStatsReducer::new();
        reducer.observe(&create_detection("truck", 0.5));
        reducer.observe(&create_detection("bus", 0.5));
        let stats = reducer.finish();
        assert_eq!(stats[0].class_name, "bus");
        assert_eq!(stats[1].class_name, "truck");
    }

    #[tokio::test]
    async fn test_time_range_sums_counts() {
        let engine = seeded_engine().await;
        let end = Utc::now();
        let totals = engine
            .aggregate_by_time_range(end - Duration::hours(1), end)
            .await
            .unwrap();
        assert_eq!(totals.get("car"), Some(&3));
        assert_eq!(totals.get("person"), Some(&2));
    }

    #[tokio::test]
    async fn test_inverted_range_is_invalid() {
        let engine = seeded_engine().await;
        let now = Utc::now();
        let result = engine
            .aggregate_by_time_range(now, now - Duration::hours(1))
            .await;
        assert!(matches!(result, Err(StoreError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn test_events_in_last_window() {
        let store = Arc::new(MemoryEventStore::new("detection_events"));
        let old = create_test_event("cam-1", &[create_detection("car", 0.9)])
            .with_timestamp(Utc::now() - Duration::hours(5));
        store.persist(&old).await.unwrap();
        store
            .persist(&create_test_event("cam-1", &[create_detection("bus", 0.9)]))
            .await
            .unwrap();

        let engine = StatisticsEngine::new(store);
        let report = engine.events_in_last(1, None).await.unwrap();
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.ranked_totals(), vec![("bus", 1)]);
    }

    #[tokio::test]
    async fn test_purge_requires_confirmation() {
        let engine = seeded_engine().await;
        let result = engine
            .purge(Duration::days(7), PurgeConfirmation::Unconfirmed)
            .await;
        assert!(matches!(
            result,
            Err(StoreError::PurgeConfirmationRequired { .. })
        ));
        assert_eq!(engine.collection_info().await.unwrap().total_documents, 3);
    }

    #[tokio::test]
    async fn test_purge_deletes_only_old_events() {
        let store = Arc::new(MemoryEventStore::new("detection_events"));
        let now = Utc::now();
        for age_days in [10, 8, 1] {
            let event = create_test_event("cam-1", &[create_detection("car", 0.9)])
                .with_timestamp(now - Duration::days(age_days));
            store.persist(&event).await.unwrap();
        }

        let engine = StatisticsEngine::new(store);
        let report = engine
            .purge(Duration::days(7), PurgeConfirmation::Confirmed)
            .await
            .unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(engine.collection_info().await.unwrap().total_documents, 1);
    }

    #[tokio::test]
    async fn test_window_past_representable_time_is_invalid() {
        let engine = seeded_engine().await;
        assert!(matches!(
            engine.events_in_last(u32::MAX, None).await,
            Err(StoreError::InvalidQuery(_))
        ));

        let century = engine.events_in_last(24 * 365 * 100, None).await.unwrap();
        assert_eq!(century.events.len(), 3);
    }

    #[tokio::test]
    async fn test_purge_past_representable_time_is_invalid() {
        let engine = seeded_engine().await;
        let result = engine
            .purge(
                Duration::days(i64::from(u32::MAX)),
                PurgeConfirmation::Confirmed,
            )
            .await;
        assert!(matches!(result, Err(StoreError::InvalidQuery(_))));
        assert_eq!(engine.collection_info().await.unwrap().total_documents, 3);

        let report = engine
            .purge(Duration::days(365 * 100), PurgeConfirmation::Confirmed)
            .await
            .unwrap();
        assert_eq!(report.deleted, 0);
    }

    struct UnreachableStore;

    #[async_trait]
    impl EventStore for UnreachableStore {
        async fn ensure_indexes(&self) -> Result<(), StoreError> {
            Err(down())
        }
        async fn persist(&self, _event: &DetectionEvent) -> Result<EventId, StoreError> {
            Err(down())
        }
        async fn query_recent(&self, _limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
            Err(down())
        }
        async fn query_by_source(
            &self,
            _source_id: &str,
            _limit: usize,
        ) -> Result<Vec<StoredEvent>, StoreError> {
            Err(down())
        }
        async fn query_by_time_range(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _source_id: Option<&str>,
        ) -> Result<Vec<StoredEvent>, StoreError> {
            Err(down())
        }
        async fn query_by_frame_number(
            &self,
            _frame_number: u64,
            _source_id: Option<&str>,
        ) -> Result<Vec<StoredEvent>, StoreError> {
            Err(down())
        }
        async fn purge_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            Err(down())
        }
        async fn collection_stats(&self) -> Result<CollectionStats, StoreError> {
            Err(down())
        }
        async fn class_statistics(
            &self,
            _source_id: Option<&str>,
        ) -> Result<Vec<ClassStatistics>, StoreError> {
            Err(down())
        }
        async fn class_totals(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<ClassCountSnapshot, StoreError> {
            Err(down())
        }
        async fn close(&self) {}
    }

    fn down() -> StoreError {
        StoreError::StoreUnavailable("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_unavailable_store_reported_as_query_failure() {
        let engine = StatisticsEngine::new(Arc::new(UnreachableStore));
        match engine.aggregate_by_class(Some("cam-9")).await {
            Err(StoreError::QueryFailed {
                operation, filters, ..
            }) => {
                assert_eq!(operation, "aggregate_by_class");
                assert_eq!(filters, "source_id=cam-9");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_store_error_on_purge_propagates() {
        let engine = StatisticsEngine::new(Arc::new(UnreachableStore));
        let result = engine
            .purge(Duration::days(1), PurgeConfirmation::Confirmed)
            .await;
        assert!(matches!(result, Err(StoreError::StoreUnavailable(_))));
    }
}
