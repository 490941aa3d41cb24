//! Detection-feed replay: a [`VideoSource`] and [`Detector`] pair backed by a
//! newline-delimited JSON file with one frame per line.
//!
//! ```text
//! {"detections": [{"class_name": "car", "confidence": 0.91, "bbox": [12.0, 40.5, 220.0, 180.2]}]}
//! {"detections": []}
//!
//! ```
//!
//! A blank line is a frame without detections.

use crate::config::SourceConfig;
use crate::source::{Detector, DetectorError, SourceError, StreamInfo, VideoSource};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};
use vigil_storage::{BoundingBox, Detection};

/// One detection as recorded in the feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedDetection {
    pub class_name: String,
    pub confidence: f64,
    pub bbox: [f64; 4],
}

/// One frame of the feed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeedFrame {
    #[serde(default)]
    pub detections: Vec<FeedDetection>,
}

pub struct DetectionFeedSource {
    lines: Lines<BufReader<File>>,
    line_number: u64,
    fps: f64,
    pacing: Option<Interval>,
}

impl DetectionFeedSource {
    /// Open the feed file named by `source.url`, paced at `source.fps` when set.
    pub async fn open(source: &SourceConfig) -> Result<Self, SourceError> {
        let path = Path::new(&source.url);
        let file = File::open(path).await.map_err(|e| {
            SourceError::SourceUnavailable(format!("{}: {}", path.display(), e))
        })?;

        let pacing = source.frame_interval().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!(path = %path.display(), fps = source.fps, "Opened detection feed");

        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_number: 0,
            fps: source.fps,
            pacing,
        })
    }
}

#[async_trait]
impl VideoSource for DetectionFeedSource {
    type Frame = FeedFrame;

    fn info(&self) -> StreamInfo {
        StreamInfo {
            fps: self.fps,
            total_frames: None,
        }
    }

    async fn read_frame(&mut self) -> Result<Option<FeedFrame>, SourceError> {
        if let Some(pacing) = self.pacing.as_mut() {
            pacing.tick().await;
        }

        let line = self
            .lines
            .next_line()
            .await
            .map_err(|e| SourceError::SourceUnavailable(e.to_string()))?;
        let Some(line) = line else {
            debug!(frames = self.line_number, "End of detection feed");
            return Ok(None);
        };
        self.line_number += 1;

        if line.trim().is_empty() {
            return Ok(Some(FeedFrame::default()));
        }
        serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| SourceError::Decode {
                frame: self.line_number,
                reason: e.to_string(),
            })
    }
}

/// Replays recorded detections, applying the confidence threshold as a live
/// detector would.
pub struct FeedDetector {
    confidence_threshold: f64,
}

impl FeedDetector {
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold,
        }
    }
}

#[async_trait]
impl Detector for FeedDetector {
    type Frame = FeedFrame;

    async fn detect(&mut self, frame: &FeedFrame) -> Result<Vec<Detection>, DetectorError> {
        frame
            .detections
            .iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .map(|d| {
                if !(0.0..=1.0).contains(&d.confidence) {
                    return Err(DetectorError::InvalidInput(format!(
                        "confidence {} for {} is outside [0, 1]",
                        d.confidence, d.class_name
                    )));
                }
                let [x1, y1, x2, y2] = d.bbox;
                Ok(Detection::new(
                    d.class_name.clone(),
                    d.confidence,
                    BoundingBox::new(x1, y1, x2, y2),
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn feed_config(path: &Path, fps: f64) -> SourceConfig {
        SourceConfig {
            url: path.display().to_string(),
            id: None,
            fps,
        }
    }

    fn write_feed(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "vigil-feed-{}-{}.jsonl",
            name,
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_reads_frames_in_order() {
        let path = write_feed(
            "order",
            concat!(
                r#"{"detections": [{"class_name": "car", "confidence": 0.9, "bbox": [0, 0, 10, 10]}]}"#,
                "\n\n",
                r#"{"detections": []}"#,
                "\n"
            ),
        );
        let mut source = DetectionFeedSource::open(&feed_config(&path, 0.0))
            .await
            .unwrap();

        let first = source.read_frame().await.unwrap().unwrap();
        assert_eq!(first.detections[0].class_name, "car");
        assert!(source.read_frame().await.unwrap().unwrap().detections.is_empty());
        assert!(source.read_frame().await.unwrap().unwrap().detections.is_empty());
        assert!(source.read_frame().await.unwrap().is_none());

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let missing = feed_config(Path::new("/nonexistent/vigil/feed.jsonl"), 0.0);
        let result = DetectionFeedSource::open(&missing).await;
        assert!(matches!(result, Err(SourceError::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_malformed_line_is_decode_error() {
        let path = write_feed("malformed", "{\"detections\": [}\n");
        let mut source = DetectionFeedSource::open(&feed_config(&path, 0.0))
            .await
            .unwrap();
        assert!(matches!(
            source.read_frame().await,
            Err(SourceError::Decode { frame: 1, .. })
        ));
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_detector_applies_threshold() {
        let frame = FeedFrame {
            detections: vec![
                FeedDetection {
                    class_name: "person".to_string(),
                    confidence: 0.4,
                    bbox: [0.0, 0.0, 5.0, 5.0],
                },
                FeedDetection {
                    class_name: "car".to_string(),
                    confidence: 0.5,
                    bbox: [1.0, 2.0, 3.0, 4.0],
                },
            ],
        };
        let mut detector = FeedDetector::new(0.5);
        let detections = detector.detect(&frame).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_name, "car");
        assert_eq!(detections[0].bounding_box, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
    }
}
