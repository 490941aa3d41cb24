//! Vigil ingest: frame-cadence detection pipeline.
//!
//! Reads frames from a [`VideoSource`], runs every Nth one through a
//! [`Detector`], tallies detections per class and hands one detection event
//! per non-empty processed frame to a bounded persistence queue in front of
//! the [`vigil_storage::EventStore`].
//!
//! # Modules
//!
//! - [`cadence`] - raw and processed frame numbering
//! - [`aggregator`] - per-frame class snapshots and the running maximum
//! - [`persist`] - bounded queue, writer task, store connection retry
//! - [`pipeline`] - the frame loop and its summary
//! - [`replay`] - detection-feed file source and detector
//! - [`source`] - source and detector traits

pub mod aggregator;
pub mod cadence;
pub mod config;
pub mod persist;
pub mod pipeline;
pub mod replay;
pub mod source;

pub use aggregator::{DetectionAggregator, PipelineState, RunningMaxCounters};
pub use cadence::{FrameCadenceController, FrameTick};
pub use config::IngestConfig;
pub use persist::{connect_with_retry, BackpressurePolicy, PersistHandle, PersistenceReport};
pub use pipeline::{
    FrameReport, PersistenceSummary, Pipeline, PipelineError, PipelineSettings, PipelineSummary,
    StoreMode,
};
pub use replay::{DetectionFeedSource, FeedDetector};
pub use source::{Detector, DetectorError, SourceError, StreamInfo, VideoSource};
