//! Detection event schema.
//!
//! A [`DetectionEvent`] is the persisted record of one processed frame. Its
//! serialized form is the stable document shape written to every backend:
//!
//! ```text
//! {
//!   timestamp, source_id, frame_number, processed_frame_number,
//!   total_objects_detected,
//!   object_counts: { <class_name>: <int>, ... },
//!   detections: [ { class_name, confidence, bounding_box: {x1,y1,x2,y2} }, ... ],
//!   model_info: { model_name, confidence_threshold }
//! }
//! ```

use crate::error::StoreError;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Opaque identifier assigned to an event when it is persisted.
pub type EventId = Uuid;

/// Per-class detection counts for a single processed frame.
pub type ClassCountSnapshot = BTreeMap<String, u64>;

/// Axis-aligned bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Coordinates are finite and ordered (x1 <= x2, y1 <= y2).
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x1 <= self.x2
            && self.y1 <= self.y2
    }

    fn rounded(&self) -> Self {
        Self {
            x1: round_to(self.x1, 2),
            y1: round_to(self.y1, 2),
            x2: round_to(self.x2, 2),
            y2: round_to(self.y2, 2),
        }
    }
}

/// One recognized object instance within a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class label from the detector's vocabulary
    pub class_name: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f64,
    /// Bounding box in pixel coordinates
    pub bounding_box: BoundingBox,
}

impl Detection {
    pub fn new(class_name: impl Into<String>, confidence: f64, bounding_box: BoundingBox) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
            bounding_box,
        }
    }

    /// Storage precision: confidence to 4 decimals, coordinates to 2.
    pub fn rounded(&self) -> Self {
        Self {
            class_name: self.class_name.clone(),
            confidence: round_to(self.confidence, 4),
            bounding_box: self.bounding_box.rounded(),
        }
    }
}

/// Provenance of the detections in an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub confidence_threshold: f64,
}

impl ModelInfo {
    pub fn new(model_name: impl Into<String>, confidence_threshold: f64) -> Self {
        Self {
            model_name: model_name.into(),
            confidence_threshold,
        }
    }
}

/// Persisted summary of all detections in one processed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    /// Creation instant (UTC, microsecond precision)
    pub timestamp: DateTime<Utc>,
    /// Originating stream (file path, stream URL, device index)
    pub source_id: String,
    /// Raw frame index, 1-based, counting skipped frames
    pub frame_number: u64,
    /// Number of frames processed so far, 1-based
    pub processed_frame_number: u64,
    /// Always equal to `detections.len()`
    pub total_objects_detected: u64,
    /// Per-class tally of `detections`
    pub object_counts: ClassCountSnapshot,
    /// Detections in detector emission order
    pub detections: Vec<Detection>,
    pub model_info: ModelInfo,
}

impl DetectionEvent {
    /// Schematize one processed frame. Detections are rounded to storage
    /// precision and the timestamp is taken now.
    pub fn new(
        source_id: impl Into<String>,
        frame_number: u64,
        processed_frame_number: u64,
        object_counts: ClassCountSnapshot,
        detections: &[Detection],
        model_info: ModelInfo,
    ) -> Self {
        let detections: Vec<Detection> = detections.iter().map(Detection::rounded).collect();
        Self {
            timestamp: Utc::now().trunc_subsecs(6),
            source_id: source_id.into(),
            frame_number,
            processed_frame_number,
            total_objects_detected: detections.len() as u64,
            object_counts,
            detections,
            model_info,
        }
    }

    /// Override the creation instant (backfills and tests).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.trunc_subsecs(6);
        self
    }

    /// Check the document against the fixed schema before it is written.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.source_id.trim().is_empty() {
            return Err(reject("source_id must not be empty"));
        }
        if self.frame_number == 0 || self.processed_frame_number == 0 {
            return Err(reject("frame numbers are 1-based"));
        }
        if self.processed_frame_number > self.frame_number {
            return Err(reject(format!(
                "processed_frame_number {} exceeds frame_number {}",
                self.processed_frame_number, self.frame_number
            )));
        }
        if self.total_objects_detected != self.detections.len() as u64 {
            return Err(reject(format!(
                "total_objects_detected {} does not match {} detections",
                self.total_objects_detected,
                self.detections.len()
            )));
        }

        let counted: u64 = self.object_counts.values().sum();
        if counted != self.detections.len() as u64 {
            return Err(reject(format!(
                "object_counts sum to {} but event has {} detections",
                counted,
                self.detections.len()
            )));
        }

        let mut tally = ClassCountSnapshot::new();
        for detection in &self.detections {
            if detection.class_name.is_empty() {
                return Err(reject("detection class_name must not be empty"));
            }
            if !(0.0..=1.0).contains(&detection.confidence) {
                return Err(reject(format!(
                    "confidence {} for class {} is outside [0, 1]",
                    detection.confidence, detection.class_name
                )));
            }
            if !detection.bounding_box.is_valid() {
                return Err(reject(format!(
                    "bounding box for class {} is not ordered",
                    detection.class_name
                )));
            }
            *tally.entry(detection.class_name.clone()).or_insert(0) += 1;
        }
        if tally != self.object_counts {
            return Err(reject("object_counts disagree with detections"));
        }

        if !(0.0..=1.0).contains(&self.model_info.confidence_threshold) {
            return Err(reject("model_info.confidence_threshold is outside [0, 1]"));
        }

        Ok(())
    }

    /// Serialized document size in bytes.
    pub fn document_size(&self) -> Result<usize, StoreError> {
        serde_json::to_vec(self)
            .map(|bytes| bytes.len())
            .map_err(|e| reject(format!("event is not serializable: {}", e)))
    }
}

/// A persisted event together with the identifier the store assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: EventId,
    #[serde(flatten)]
    pub event: DetectionEvent,
}

fn reject(reason: impl Into<String>) -> StoreError {
    StoreError::WriteRejected(reason.into())
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn create_detection(class_name: &str, confidence: f64) -> Detection {
        Detection::new(class_name, confidence, BoundingBox::new(10.0, 20.0, 110.0, 220.0))
    }

    pub(crate) fn create_test_event(source_id: &str, detections: &[Detection]) -> DetectionEvent {
        let mut counts = ClassCountSnapshot::new();
        for detection in detections {
            *counts.entry(detection.class_name.clone()).or_insert(0) += 1;
        }
        DetectionEvent::new(
            source_id,
            2,
            1,
            counts,
            detections,
            ModelInfo::new("yolov8m.pt", 0.5),
        )
    }

    #[test]
    fn test_valid_event_passes() {
        let event = create_test_event(
            "cam-1",
            &[create_detection("car", 0.9), create_detection("car", 0.8)],
        );
        assert!(event.validate().is_ok());
        assert_eq!(event.total_objects_detected, 2);
    }

    #[test]
    fn test_count_mismatch_is_rejected() {
        let mut event = create_test_event("cam-1", &[create_detection("car", 0.9)]);
        event.object_counts.insert("person".to_string(), 1);
        assert!(matches!(event.validate(), Err(StoreError::WriteRejected(_))));
    }

    #[test]
    fn test_confidence_out_of_range_is_rejected() {
        let event = create_test_event("cam-1", &[create_detection("car", 1.5)]);
        assert!(matches!(event.validate(), Err(StoreError::WriteRejected(_))));
    }

    #[test]
    fn test_inverted_bounding_box_is_rejected() {
        let detection = Detection::new("car", 0.7, BoundingBox::new(50.0, 0.0, 10.0, 5.0));
        let event = create_test_event("cam-1", &[detection]);
        assert!(matches!(event.validate(), Err(StoreError::WriteRejected(_))));
    }

    #[test]
    fn test_processed_beyond_raw_is_rejected() {
        let mut event = create_test_event("cam-1", &[create_detection("car", 0.7)]);
        event.processed_frame_number = event.frame_number + 1;
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_values_rounded_to_storage_precision() {
        let detection = Detection::new(
            "person",
            0.876_543_21,
            BoundingBox::new(1.234_5, 2.345_6, 3.456_7, 4.567_8),
        );
        let event = create_test_event("cam-1", &[detection]);
        let stored = &event.detections[0];
        assert_eq!(stored.confidence, 0.8765);
        assert_eq!(stored.bounding_box, BoundingBox::new(1.23, 2.35, 3.46, 4.57));
    }

    #[test]
    fn test_document_shape() {
        let event = create_test_event("video.mp4", &[create_detection("car", 0.9)]);
        let doc = serde_json::to_value(&event).unwrap();

        assert_eq!(doc["source_id"], "video.mp4");
        assert_eq!(doc["total_objects_detected"], 1);
        assert_eq!(doc["object_counts"]["car"], 1);
        assert_eq!(doc["detections"][0]["bounding_box"]["x2"], 110.0);
        assert_eq!(doc["model_info"]["model_name"], "yolov8m.pt");
    }

    #[test]
    fn test_stored_event_flattens_document() {
        let stored = StoredEvent {
            id: Uuid::new_v4(),
            event: create_test_event("cam-1", &[create_detection("bus", 0.6)]),
        };
        let doc = serde_json::to_value(&stored).unwrap();
        assert!(doc["id"].is_string());
        assert_eq!(doc["frame_number"], 2);
    }
}
