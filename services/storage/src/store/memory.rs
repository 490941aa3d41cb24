use super::{check_document, CollectionStats, EventStore, IndexDescriptor};
use crate::error::StoreError;
use crate::event::{ClassCountSnapshot, DetectionEvent, EventId, StoredEvent};
use crate::statistics::{ClassStatistics, ClassStatsReducer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use uuid::Uuid;

/// Ordering key for time indexes. The sequence breaks timestamp ties in
/// insertion order.
type TimeKey = (DateTime<Utc>, u64);

#[derive(Default)]
struct MemoryIndexes {
    documents: HashMap<EventId, DetectionEvent>,
    by_timestamp: BTreeMap<TimeKey, EventId>,
    by_source: HashMap<String, BTreeMap<TimeKey, EventId>>,
    by_frame_number: BTreeMap<u64, Vec<(TimeKey, EventId)>>,
    next_seq: u64,
}

impl MemoryIndexes {
    fn insert(&mut self, event: DetectionEvent) -> EventId {
        let id = Uuid::new_v4();
        let key = (event.timestamp, self.next_seq);
        self.next_seq += 1;

        self.by_timestamp.insert(key, id);
        self.by_source
            .entry(event.source_id.clone())
            .or_default()
            .insert(key, id);
        self.by_frame_number
            .entry(event.frame_number)
            .or_default()
            .push((key, id));
        self.documents.insert(id, event);
        id
    }

    fn remove(&mut self, key: TimeKey, id: EventId) {
        if let Some(event) = self.documents.remove(&id) {
            if let Some(per_source) = self.by_source.get_mut(&event.source_id) {
                per_source.remove(&key);
                if per_source.is_empty() {
                    self.by_source.remove(&event.source_id);
                }
            }
            if let Some(per_frame) = self.by_frame_number.get_mut(&event.frame_number) {
                per_frame.retain(|(_, other)| *other != id);
                if per_frame.is_empty() {
                    self.by_frame_number.remove(&event.frame_number);
                }
            }
        }
    }

    fn stored(&self, id: &EventId) -> Option<StoredEvent> {
        self.documents.get(id).map(|event| StoredEvent {
            id: *id,
            event: event.clone(),
        })
    }

    fn events_in_range<'a>(
        &'a self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        source_id: Option<&str>,
    ) -> Box<dyn DoubleEndedIterator<Item = &'a EventId> + 'a> {
        let range = (start, 0)..=(end, u64::MAX);
        match source_id {
            Some(source) => match self.by_source.get(source) {
                Some(index) => Box::new(index.range(range).map(|(_, id)| id)),
                None => Box::new(std::iter::empty()),
            },
            None => Box::new(self.by_timestamp.range(range).map(|(_, id)| id)),
        }
    }
}

/// In-process event store.
///
/// Keeps documents and their secondary indexes behind one lock so a write is
/// visible to readers either completely or not at all. Used for tests,
/// `memory://` deployments and offline analysis.
pub struct MemoryEventStore {
    table: String,
    max_document_bytes: usize,
    inner: RwLock<MemoryIndexes>,
    closed: AtomicBool,
}

impl MemoryEventStore {
    pub fn new(table: impl Into<String>) -> Self {
        Self::with_limits(table, 16 * 1024 * 1024)
    }

    pub fn with_limits(table: impl Into<String>, max_document_bytes: usize) -> Self {
        Self {
            table: table.into(),
            max_document_bytes,
            inner: RwLock::new(MemoryIndexes::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::StoreUnavailable("store is closed".to_string()));
        }
        Ok(())
    }

    fn index_descriptors(&self) -> Vec<IndexDescriptor> {
        [
            ("_id_", "id (unique)"),
            ("timestamp_desc", "timestamp desc"),
            ("source_id", "source_id"),
            ("frame_number", "frame_number"),
            ("source_id_timestamp_desc", "source_id, timestamp desc"),
        ]
        .into_iter()
        .map(|(name, definition)| IndexDescriptor {
            name: format!("{}_{}", self.table, name),
            definition: definition.to_string(),
        })
        .collect()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        // Indexes are maintained on every write.
        self.ensure_open()
    }

    async fn persist(&self, event: &DetectionEvent) -> Result<EventId, StoreError> {
        self.ensure_open()?;
        check_document(event, self.max_document_bytes)?;
        let id = self.inner.write().insert(event.clone());
        debug!(event_id = %id, source_id = %event.source_id, "Event stored in memory");
        Ok(id)
    }

    async fn persist_many(&self, events: &[DetectionEvent]) -> Result<Vec<EventId>, StoreError> {
        self.ensure_open()?;
        for event in events {
            check_document(event, self.max_document_bytes)?;
        }
        let mut inner = self.inner.write();
        Ok(events
            .iter()
            .map(|event| inner.insert(event.clone()))
            .collect())
    }

    async fn query_recent(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        self.ensure_open()?;
        let inner = self.inner.read();
        Ok(inner
            .by_timestamp
            .values()
            .rev()
            .take(limit)
            .filter_map(|id| inner.stored(id))
            .collect())
    }

    async fn query_by_source(
        &self,
        source_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.ensure_open()?;
        let inner = self.inner.read();
        Ok(inner
            .by_source
            .get(source_id)
            .map(|index| {
                index
                    .values()
                    .rev()
                    .take(limit)
                    .filter_map(|id| inner.stored(id))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        source_id: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.ensure_open()?;
        if start > end {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();
        Ok(inner
            .events_in_range(start, end, source_id)
            .rev()
            .filter_map(|id| inner.stored(id))
            .collect())
    }

    async fn query_by_frame_number(
        &self,
        frame_number: u64,
        source_id: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.ensure_open()?;
        let inner = self.inner.read();
        let mut matches: Vec<(_, StoredEvent)> = inner
            .by_frame_number
            .get(&frame_number)
            .into_iter()
            .flatten()
            .filter_map(|(key, id)| inner.stored(id).map(|stored| (*key, stored)))
            .filter(|(_, stored)| source_id.map_or(true, |s| stored.event.source_id == s))
            .collect();
        matches.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(matches.into_iter().map(|(_, stored)| stored).collect())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        let expired: Vec<(TimeKey, EventId)> = inner
            .by_timestamp
            .range(..(cutoff, 0))
            .map(|(key, id)| (*key, *id))
            .collect();
        for (key, id) in &expired {
            inner.by_timestamp.remove(key);
            inner.remove(*key, *id);
        }
        Ok(expired.len() as u64)
    }

    async fn collection_stats(&self) -> Result<CollectionStats, StoreError> {
        self.ensure_open()?;
        Ok(CollectionStats {
            total_documents: self.len() as u64,
            database_name: "memory".to_string(),
            table_name: self.table.clone(),
            indexes: self.index_descriptors(),
        })
    }

    async fn class_statistics(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<ClassStatistics>, StoreError> {
        self.ensure_open()?;
        let inner = self.inner.read();
        let mut reducer = ClassStatsReducer::new();
        inner
            .documents
            .values()
            .filter(|event| source_id.map_or(true, |s| event.source_id == s))
            .for_each(|event| reducer.observe_all(&event.detections));
        Ok(reducer.finish())
    }

    async fn class_totals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ClassCountSnapshot, StoreError> {
        self.ensure_open()?;
        let inner = self.inner.read();
        let mut totals = ClassCountSnapshot::new();
        if start > end {
            return Ok(totals);
        }
        for id in inner.events_in_range(start, end, None) {
            if let Some(event) = inner.documents.get(id) {
                for (class_name, count) in &event.object_counts {
                    *totals.entry(class_name.clone()).or_insert(0) += count;
                }
            }
        }
        Ok(totals)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
