//! Per-frame class tallies and the running maximum across a stream.

use crate::cadence::FrameCadenceController;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::num::NonZeroU64;
use vigil_storage::{ClassCountSnapshot, Detection};

/// Largest per-frame count observed for each class in one pipeline run.
pub type RunningMaxCounters = BTreeMap<String, u64>;

/// Tally `raw` per class, keeping only members of `class_filter` unless it is
/// empty. Detections keep their emission order.
pub fn build_snapshot(
    raw: Vec<Detection>,
    class_filter: &HashSet<String>,
) -> (ClassCountSnapshot, Vec<Detection>) {
    let kept: Vec<Detection> = if class_filter.is_empty() {
        raw
    } else {
        raw.into_iter()
            .filter(|detection| class_filter.contains(&detection.class_name))
            .collect()
    };

    let mut snapshot = ClassCountSnapshot::new();
    for detection in &kept {
        *snapshot.entry(detection.class_name.clone()).or_insert(0) += 1;
    }
    (snapshot, kept)
}

/// Folds per-frame snapshots into [`RunningMaxCounters`].
pub struct DetectionAggregator {
    class_filter: HashSet<String>,
    counters: Mutex<RunningMaxCounters>,
}

impl DetectionAggregator {
    pub fn new(target_classes: impl IntoIterator<Item = String>) -> Self {
        Self {
            class_filter: target_classes.into_iter().collect(),
            counters: Mutex::new(RunningMaxCounters::new()),
        }
    }

    pub fn class_filter(&self) -> &HashSet<String> {
        &self.class_filter
    }

    pub fn build_snapshot(&self, raw: Vec<Detection>) -> (ClassCountSnapshot, Vec<Detection>) {
        build_snapshot(raw, &self.class_filter)
    }

    /// Raise each counter to the snapshot's value if larger. Keys absent from
    /// the snapshot are left alone.
    pub fn fold(&self, snapshot: &ClassCountSnapshot) {
        let mut counters = self.counters.lock();
        for (class_name, &count) in snapshot {
            let current = counters.entry(class_name.clone()).or_insert(0);
            *current = (*current).max(count);
        }
    }

    pub fn running_max(&self) -> RunningMaxCounters {
        self.counters.lock().clone()
    }
}

/// Running state owned by one pipeline instance.
pub struct PipelineState {
    pub cadence: FrameCadenceController,
    pub aggregator: DetectionAggregator,
}

impl PipelineState {
    pub fn new(
        skip_interval: NonZeroU64,
        target_classes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            cadence: FrameCadenceController::new(skip_interval),
            aggregator: DetectionAggregator::new(target_classes),
        }
    }
}
