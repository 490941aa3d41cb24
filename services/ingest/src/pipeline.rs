//! The per-source frame loop.
//!
//! ```text
//! VideoSource -> FrameCadenceController -> Detector -> DetectionAggregator
//!             -> PersistQueue -> EventStore
//! ```

use crate::aggregator::{PipelineState, RunningMaxCounters};
use crate::config::IngestConfig;
use crate::persist::{BackpressurePolicy, PersistHandle, PersistenceReport};
use crate::source::{Detector, SourceError, StreamInfo, VideoSource};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use vigil_storage::{ClassCountSnapshot, DetectionEvent, EventStore, ModelInfo};

const RULE: &str = "============================================================";

/// Static settings of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub source_id: String,
    pub model_info: ModelInfo,
    pub skip_interval: NonZeroU64,
    pub target_classes: Vec<String>,
    pub queue_size: usize,
    pub backpressure: BackpressurePolicy,
    pub shutdown_timeout: Duration,
    pub max_frames: Option<u64>,
}

impl PipelineSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            source_id: config.source.source_id().to_string(),
            model_info: ModelInfo::new(
                config.detector.model_name.clone(),
                config.detector.confidence_threshold,
            ),
            skip_interval: config.processing.skip_interval(),
            target_classes: config.processing.target_classes.clone(),
            queue_size: config.processing.queue_size,
            backpressure: config.processing.backpressure,
            shutdown_timeout: config.processing.shutdown_timeout(),
            max_frames: config.processing.frame_limit(),
        }
    }
}

/// How the pipeline reaches the event store.
#[derive(Clone)]
pub enum StoreMode {
    /// Persistence turned off by configuration
    Disabled,
    /// Persistence wanted but the store could not be reached
    Unavailable(String),
    Connected(Arc<dyn EventStore>),
}

/// Per-frame result shown on the terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame_number: u64,
    pub processed_frame_number: u64,
    pub counts: ClassCountSnapshot,
}

impl fmt::Display for FrameReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame {} (Processed: {})",
            self.frame_number, self.processed_frame_number
        )?;
        if self.counts.is_empty() {
            return write!(f, " | No objects detected");
        }
        for (class_name, count) in &self.counts {
            write!(f, " | {}: {}", class_name, count)?;
        }
        Ok(())
    }
}

/// What happened to detection events during the run.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceSummary {
    Disabled,
    /// Store unreachable; every event with detections was skipped
    Degraded { reason: String, skipped: u64 },
    Active(PersistenceReport),
}

impl fmt::Display for PersistenceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceSummary::Disabled => write!(f, "disabled"),
            PersistenceSummary::Degraded { reason, skipped } => write!(
                f,
                "degraded (store unavailable: {}), {} events skipped",
                reason, skipped
            ),
            PersistenceSummary::Active(report) => write!(f, "{}", report),
        }
    }
}

/// Final counters of a pipeline run. Produced on every exit path.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub source_id: String,
    pub total_frames: u64,
    pub processed_frames: u64,
    pub elapsed: Duration,
    pub running_max: RunningMaxCounters,
    pub persistence: PersistenceSummary,
}

impl PipelineSummary {
    /// Processed frames per second of wall time.
    pub fn average_fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed_frames as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for PipelineSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", RULE)?;
        writeln!(f, "DETECTION SUMMARY ({})", self.source_id)?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "Total frames read: {}", self.total_frames)?;
        writeln!(f, "Frames processed: {}", self.processed_frames)?;
        writeln!(f, "Processing time: {:.2}s", self.elapsed.as_secs_f64())?;
        writeln!(f, "Average FPS: {:.2}", self.average_fps())?;
        writeln!(f, "Maximum objects detected in a single frame:")?;
        if self.running_max.is_empty() {
            writeln!(f, "  none")?;
        }
        for (class_name, count) in &self.running_max {
            writeln!(f, "  {}: {}", class_name, count)?;
        }
        writeln!(f, "Persistence: {}", self.persistence)?;
        write!(f, "{}", RULE)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The source failed; the summary covers the frames handled before that.
    #[error("Frame source failed: {cause}")]
    SourceFailed {
        #[source]
        cause: SourceError,
        summary: Box<PipelineSummary>,
    },
}

impl PipelineError {
    pub fn summary(&self) -> &PipelineSummary {
        match self {
            PipelineError::SourceFailed { summary, .. } => summary,
        }
    }
}

type FrameObserver = Box<dyn FnMut(&FrameReport) + Send>;

/// One source, one detector, one sink.
pub struct Pipeline<S, D> {
    source: S,
    detector: D,
    settings: PipelineSettings,
    store: StoreMode,
    observer: Option<FrameObserver>,
}

impl<S, D> Pipeline<S, D>
where
    S: VideoSource,
    D: Detector<Frame = S::Frame>,
{
    pub fn new(source: S, detector: D, settings: PipelineSettings, store: StoreMode) -> Self {
        Self {
            source,
            detector,
            settings,
            store,
            observer: None,
        }
    }

    /// Called with every processed frame's report, after it is logged.
    pub fn with_frame_observer(
        mut self,
        observer: impl FnMut(&FrameReport) + Send + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn stream_info(&self) -> StreamInfo {
        self.source.info()
    }

    /// Run until end of stream, the frame limit, a source failure or `shutdown`.
    /// Pending events are drained before returning.
    pub async fn run(
        mut self,
        shutdown: CancellationToken,
    ) -> Result<PipelineSummary, PipelineError> {
        let settings = self.settings.clone();
        let source_id = settings.source_id.as_str();
        let mut state =
            PipelineState::new(settings.skip_interval, settings.target_classes.clone());
        let started = Instant::now();

        let writer = match &self.store {
            StoreMode::Connected(store) => Some(PersistHandle::spawn(
                Arc::clone(store),
                settings.queue_size,
                settings.backpressure,
            )),
            StoreMode::Unavailable(reason) => {
                warn!(
                    source_id = %source_id,
                    reason = %reason,
                    "Event store unavailable, running in degraded mode without persistence"
                );
                None
            }
            StoreMode::Disabled => None,
        };

        let mut skipped = 0u64;
        let mut failure = None;

        loop {
            if let Some(limit) = settings.max_frames {
                if state.cadence.raw_count() >= limit {
                    info!(source_id = %source_id, limit = limit, "Frame limit reached");
                    break;
                }
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(source_id = %source_id, "Stop requested");
                    break;
                }
                next = self.source.read_frame() => next,
            };

            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!(source_id = %source_id, "End of stream");
                    break;
                }
                Err(e) => {
                    error!(source_id = %source_id, error = %e, "Frame source failed");
                    failure = Some(e);
                    break;
                }
            };

            let tick = state.cadence.advance();
            let Some(processed_frame_number) = tick.processed_frame_number else {
                trace!(frame_number = tick.frame_number, "Frame skipped");
                continue;
            };

            let raw = match self.detector.detect(&frame).await {
                Ok(detections) => detections,
                Err(e) => {
                    warn!(
                        source_id = %source_id,
                        frame_number = tick.frame_number,
                        error = %e,
                        "Detector failed, treating frame as empty"
                    );
                    Vec::new()
                }
            };

            let (snapshot, detections) = state.aggregator.build_snapshot(raw);
            state.aggregator.fold(&snapshot);
            metrics::counter!("vigil.frames.processed").increment(1);

            let report = FrameReport {
                frame_number: tick.frame_number,
                processed_frame_number,
                counts: snapshot.clone(),
            };
            info!(
                source_id = %source_id,
                frame_number = tick.frame_number,
                processed_frame_number = processed_frame_number,
                "{}",
                report
            );
            if let Some(observer) = self.observer.as_mut() {
                observer(&report);
            }

            if detections.is_empty() {
                continue;
            }

            match (&writer, &self.store) {
                (Some(writer), _) => {
                    let event = DetectionEvent::new(
                        source_id,
                        tick.frame_number,
                        processed_frame_number,
                        snapshot,
                        &detections,
                        settings.model_info.clone(),
                    );
                    let submitted = tokio::select! {
                        biased;
                        accepted = writer.submit(event) => Some(accepted),
                        _ = shutdown.cancelled() => None,
                    };
                    if submitted.is_none() {
                        writer.record_discarded(1);
                        warn!(
                            source_id = %source_id,
                            frame_number = tick.frame_number,
                            "Stop requested while the persistence queue was full, event discarded"
                        );
                        break;
                    }
                }
                (None, StoreMode::Unavailable(_)) => {
                    skipped += 1;
                    warn!(
                        source_id = %source_id,
                        frame_number = tick.frame_number,
                        objects = detections.len(),
                        "Degraded mode, detection event not persisted"
                    );
                }
                (None, _) => {}
            }
        }

        let persistence = match (writer, &self.store) {
            (Some(writer), _) => {
                debug!(pending = writer.pending(), "Stopping persistence writer");
                PersistenceSummary::Active(writer.shutdown(settings.shutdown_timeout).await)
            }
            (None, StoreMode::Unavailable(reason)) => PersistenceSummary::Degraded {
                reason: reason.clone(),
                skipped,
            },
            (None, _) => PersistenceSummary::Disabled,
        };

        let summary = PipelineSummary {
            source_id: settings.source_id.clone(),
            total_frames: state.cadence.raw_count(),
            processed_frames: state.cadence.processed_count(),
            elapsed: started.elapsed(),
            running_max: state.aggregator.running_max(),
            persistence,
        };

        match failure {
            Some(cause) => Err(PipelineError::SourceFailed {
                cause,
                summary: Box::new(summary),
            }),
            None => Ok(summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, u64)]) -> ClassCountSnapshot {
        pairs
            .iter()
            .map(|(class, count)| (class.to_string(), *count))
            .collect()
    }

    #[test]
    fn test_frame_report_line() {
        let report = FrameReport {
            frame_number: 4,
            processed_frame_number: 2,
            counts: counts(&[("person", 1), ("car", 2)]),
        };
        assert_eq!(report.to_string(), "Frame 4 (Processed: 2) | car: 2 | person: 1");

        let empty = FrameReport {
            frame_number: 1,
            processed_frame_number: 1,
            counts: ClassCountSnapshot::new(),
        };
        assert_eq!(empty.to_string(), "Frame 1 (Processed: 1) | No objects detected");
    }

    #[test]
    fn test_summary_display() {
        let summary = PipelineSummary {
            source_id: "lot.mp4".to_string(),
            total_frames: 10,
            processed_frames: 5,
            elapsed: Duration::from_secs(2),
            running_max: counts(&[("car", 3)]),
            persistence: PersistenceSummary::Degraded {
                reason: "connection refused".to_string(),
                skipped: 4,
            },
        };
        assert_eq!(summary.average_fps(), 2.5);

        let text = summary.to_string();
        assert!(text.contains("Total frames read: 10"));
        assert!(text.contains("Frames processed: 5"));
        assert!(text.contains("  car: 3"));
        assert!(text.contains("4 events skipped"));
    }

    #[test]
    fn test_zero_elapsed_has_zero_fps() {
        let summary = PipelineSummary {
            source_id: "cam".to_string(),
            total_frames: 0,
            processed_frames: 0,
            elapsed: Duration::ZERO,
            running_max: RunningMaxCounters::new(),
            persistence: PersistenceSummary::Disabled,
        };
        assert_eq!(summary.average_fps(), 0.0);
        assert!(summary.to_string().contains("Persistence: disabled"));
    }
}
