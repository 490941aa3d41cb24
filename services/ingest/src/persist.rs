//! Bounded persistence queue between the frame loop and the event store.
//!
//! The frame loop submits events; a single writer task drains them in FIFO
//! order, so events of one pipeline reach the store in processed-frame order.

use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vigil_storage::{open_store, DatabaseConfig, DetectionEvent, EventStore, StoreError};

/// Largest number of queued events written in one store call.
const MAX_BATCH: usize = 64;

/// Behaviour when an event is submitted to a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for the writer to free a slot
    #[default]
    Block,
    /// Discard the oldest pending event
    DropOldest,
}

#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest pending event
    DroppedOldest(Box<DetectionEvent>),
    /// The queue no longer accepts events
    Closed,
}

struct QueueState {
    items: VecDeque<DetectionEvent>,
    closed: bool,
}

pub struct PersistQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: BackpressurePolicy,
    not_empty: Notify,
    not_full: Notify,
}

impl PersistQueue {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity: capacity.max(1),
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn push(&self, event: DetectionEvent) -> PushOutcome {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return PushOutcome::Closed;
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(event);
                    drop(state);
                    self.not_empty.notify_one();
                    return PushOutcome::Queued;
                }
                if self.policy == BackpressurePolicy::DropOldest {
                    let evicted = state.items.pop_front();
                    state.items.push_back(event);
                    drop(state);
                    self.not_empty.notify_one();
                    return match evicted {
                        Some(old) => PushOutcome::DroppedOldest(Box::new(old)),
                        None => PushOutcome::Queued,
                    };
                }
            }
            self.not_full.notified().await;
        }
    }

    /// Up to `max` events in FIFO order; `None` once closed and empty.
    pub async fn next_batch(&self, max: usize) -> Option<Vec<DetectionEvent>> {
        loop {
            {
                let mut state = self.state.lock();
                if !state.items.is_empty() {
                    let take = state.items.len().min(max.max(1));
                    let batch: Vec<DetectionEvent> = state.items.drain(..take).collect();
                    drop(state);
                    self.not_full.notify_one();
                    return Some(batch);
                }
                if state.closed {
                    return None;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Stop accepting events. Pending events stay available to `next_batch`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_one();
        self.not_full.notify_waiters();
    }

    /// Remove and return everything still pending.
    pub fn drain_remaining(&self) -> Vec<DetectionEvent> {
        self.state.lock().items.drain(..).collect()
    }
}

#[derive(Debug, Default)]
struct PersistStats {
    persisted: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    dropped_backpressure: AtomicU64,
    dropped_on_shutdown: AtomicU64,
    in_flight: AtomicU64,
}

impl PersistStats {
    fn report(&self) -> PersistenceReport {
        PersistenceReport {
            persisted: self.persisted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
            dropped_on_shutdown: self.dropped_on_shutdown.load(Ordering::Relaxed),
        }
    }
}

/// Outcome counts of the persistence writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceReport {
    pub persisted: u64,
    /// Refused by the store (schema or constraint violation)
    pub rejected: u64,
    /// Lost because the store was unreachable
    pub failed: u64,
    pub dropped_backpressure: u64,
    pub dropped_on_shutdown: u64,
}

impl PersistenceReport {
    pub fn dropped(&self) -> u64 {
        self.dropped_backpressure + self.dropped_on_shutdown
    }
}

impl fmt::Display for PersistenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "persisted {}, rejected {}, failed {}, dropped {}",
            self.persisted,
            self.rejected,
            self.failed,
            self.dropped()
        )
    }
}

/// Handle to a running persistence writer.
pub struct PersistHandle {
    queue: Arc<PersistQueue>,
    stats: Arc<PersistStats>,
    task: JoinHandle<()>,
}

impl PersistHandle {
    pub fn spawn(store: Arc<dyn EventStore>, capacity: usize, policy: BackpressurePolicy) -> Self {
        let queue = Arc::new(PersistQueue::new(capacity, policy));
        let stats = Arc::new(PersistStats::default());

        let task = tokio::spawn({
            let queue = Arc::clone(&queue);
            let stats = Arc::clone(&stats);
            async move {
                run_writer(queue, store, stats).await;
                debug!("Persistence writer stopped");
            }
        });

        Self { queue, stats, task }
    }

    /// Queue an event for writing, applying the backpressure policy.
    pub async fn submit(&self, event: DetectionEvent) -> bool {
        match self.queue.push(event).await {
            PushOutcome::Queued => true,
            PushOutcome::DroppedOldest(old) => {
                self.stats
                    .dropped_backpressure
                    .fetch_add(1, Ordering::Relaxed);
                metrics::counter!("vigil.events.dropped").increment(1);
                warn!(
                    source_id = %old.source_id,
                    frame_number = old.frame_number,
                    "Persistence queue full, dropped oldest pending event"
                );
                true
            }
            PushOutcome::Closed => {
                warn!("Persistence queue closed, event not written");
                false
            }
        }
    }

    /// Count events the caller gave up submitting because of a stop request.
    pub fn record_discarded(&self, count: u64) {
        self.stats
            .dropped_on_shutdown
            .fetch_add(count, Ordering::Relaxed);
        metrics::counter!("vigil.events.dropped").increment(count);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn report(&self) -> PersistenceReport {
        self.stats.report()
    }

    /// Stop accepting events and wait up to `timeout` for the queue to drain.
    /// Whatever is still pending after that is dropped and counted.
    pub async fn shutdown(self, timeout: Duration) -> PersistenceReport {
        let PersistHandle {
            queue,
            stats,
            mut task,
        } = self;
        queue.close();
        let pending = queue.len();
        if pending > 0 {
            info!(pending = pending, "Draining persistence queue");
        }

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Persistence writer task failed");
                abandon_pending(&queue, &stats);
            }
            Err(_) => {
                task.abort();
                // Wait for the abort to land so the in-flight count is final.
                let _ = task.await;
                let dropped = abandon_pending(&queue, &stats);
                warn!(
                    dropped = dropped,
                    timeout_secs = timeout.as_secs_f64(),
                    "Persistence drain timed out, discarding pending events"
                );
            }
        }

        stats.report()
    }
}

fn abandon_pending(queue: &PersistQueue, stats: &PersistStats) -> u64 {
    let remaining = queue.drain_remaining().len() as u64;
    let in_flight = stats.in_flight.swap(0, Ordering::AcqRel);
    let dropped = remaining + in_flight;
    stats
        .dropped_on_shutdown
        .fetch_add(dropped, Ordering::Relaxed);
    metrics::counter!("vigil.events.dropped").increment(dropped);
    dropped
}

async fn run_writer(
    queue: Arc<PersistQueue>,
    store: Arc<dyn EventStore>,
    stats: Arc<PersistStats>,
) {
    while let Some(batch) = queue.next_batch(MAX_BATCH).await {
        stats.in_flight.store(batch.len() as u64, Ordering::Release);
        write_batch(&*store, &batch, &stats).await;
        stats.in_flight.store(0, Ordering::Release);
    }
}

async fn write_batch(store: &dyn EventStore, batch: &[DetectionEvent], stats: &PersistStats) {
    if batch.len() > 1 {
        match store.persist_many(batch).await {
            Ok(ids) => {
                record_persisted(stats, ids.len() as u64);
                return;
            }
            Err(StoreError::WriteRejected(reason)) => {
                debug!(
                    reason = %reason,
                    size = batch.len(),
                    "Batch rejected, writing events individually"
                );
            }
            Err(e) => {
                stats.failed.fetch_add(batch.len() as u64, Ordering::Relaxed);
                warn!(error = %e, skipped = batch.len(), "Store unavailable, events not persisted");
                return;
            }
        }
    }

    for event in batch {
        match store.persist(event).await {
            Ok(_) => record_persisted(stats, 1),
            Err(StoreError::WriteRejected(reason)) => {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("vigil.events.rejected").increment(1);
                warn!(
                    source_id = %event.source_id,
                    frame_number = event.frame_number,
                    reason = %reason,
                    "Detection event rejected by store"
                );
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    source_id = %event.source_id,
                    frame_number = event.frame_number,
                    error = %e,
                    "Store unavailable, event not persisted"
                );
            }
        }
    }
}

fn record_persisted(stats: &PersistStats, count: u64) {
    stats.persisted.fetch_add(count, Ordering::Relaxed);
    metrics::counter!("vigil.events.persisted").increment(count);
}

/// Open the event store, retrying unavailability with exponential backoff.
pub async fn connect_with_retry(
    config: &DatabaseConfig,
    max_attempts: u32,
) -> Result<Arc<dyn EventStore>, StoreError> {
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(5),
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut attempts = 0u32;
    loop {
        match open_store(config).await {
            Ok(store) => {
                info!(attempts = attempts + 1, "Connected to event store");
                return Ok(store);
            }
            Err(e) if e.is_unavailable() => {
                attempts += 1;
                if attempts >= max_attempts.max(1) {
                    return Err(e);
                }
                if let Some(delay) = backoff.next_backoff() {
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Event store connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    backoff.reset();
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};
    use vigil_storage::{BoundingBox, ClassCountSnapshot, Detection, MemoryEventStore, ModelInfo};

    fn event(frame: u64) -> DetectionEvent {
        let detections = [Detection::new("car", 0.9, BoundingBox::new(0.0, 0.0, 4.0, 4.0))];
        let counts: ClassCountSnapshot = [("car".to_string(), 1)].into_iter().collect();
        let model = ModelInfo::new("yolov8m.pt", 0.5);
        DetectionEvent::new("cam-1", frame, frame, counts, &detections, model)
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_front() {
        let queue = PersistQueue::new(2, BackpressurePolicy::DropOldest);
        assert!(matches!(queue.push(event(1)).await, PushOutcome::Queued));
        assert!(matches!(queue.push(event(2)).await, PushOutcome::Queued));
        match queue.push(event(3)).await {
            PushOutcome::DroppedOldest(old) => assert_eq!(old.frame_number, 1),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let batch = queue.next_batch(10).await.unwrap();
        let frames: Vec<u64> = batch.iter().map(|e| e.frame_number).collect();
        assert_eq!(frames, vec![2, 3]);
    }

    #[test]
    fn test_block_waits_for_space() {
        let queue = PersistQueue::new(1, BackpressurePolicy::Block);
        let mut first = task::spawn(queue.push(event(1)));
        assert!(matches!(assert_ready!(first.poll()), PushOutcome::Queued));
        drop(first);

        let mut blocked = task::spawn(queue.push(event(2)));
        assert_pending!(blocked.poll());

        let mut consumer = task::spawn(queue.next_batch(1));
        let batch = assert_ready!(consumer.poll()).unwrap();
        assert_eq!(batch[0].frame_number, 1);

        assert!(blocked.is_woken());
        assert!(matches!(assert_ready!(blocked.poll()), PushOutcome::Queued));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_drains_then_ends() {
        let queue = PersistQueue::new(4, BackpressurePolicy::Block);
        queue.push(event(1)).await;
        queue.close();

        assert!(matches!(queue.push(event(2)).await, PushOutcome::Closed));
        assert_eq!(queue.next_batch(4).await.unwrap().len(), 1);
        assert!(queue.next_batch(4).await.is_none());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_persists_everything() {
        let store = Arc::new(MemoryEventStore::new("detection_events"));
        let handle = PersistHandle::spawn(store.clone(), 8, BackpressurePolicy::Block);
        for frame in 1..=20 {
            assert!(handle.submit(event(frame)).await);
        }

        let report = handle.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.persisted, 20);
        assert_eq!(report.dropped(), 0);
        assert_eq!(store.len(), 20);
    }

    #[tokio::test]
    async fn test_rejected_event_does_not_sink_batch() {
        let store = Arc::new(MemoryEventStore::new("detection_events"));
        let mut bad = event(2);
        bad.total_objects_detected = 7;

        let batch = vec![event(1), bad, event(3)];
        let stats = PersistStats::default();
        write_batch(&*store, &batch, &stats).await;

        let report = stats.report();
        assert_eq!(report.persisted, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_connect_memory_store() {
        let config = DatabaseConfig {
            url: "memory://".to_string(),
            ..Default::default()
        };
        assert!(connect_with_retry(&config, 1).await.is_ok());
    }
}
