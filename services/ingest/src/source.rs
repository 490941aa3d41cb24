//! Seams to the external frame source and object detector.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use vigil_storage::Detection;

/// Errors raised by a [`VideoSource`]. Any of them ends the pipeline.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Failed to decode frame {frame}: {reason}")]
    Decode { frame: u64, reason: String },
}

/// Errors raised by a [`Detector`]. Logged; the frame counts as empty.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Detector input rejected: {0}")]
    InvalidInput(String),
}

/// Static properties of an opened stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub fps: f64,
    pub total_frames: Option<u64>,
}

impl fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} fps", self.fps)?;
        if let Some(total) = self.total_frames {
            write!(f, ", {} frames", total)?;
        }
        Ok(())
    }
}

/// An ordered stream of frames from one source.
#[async_trait]
pub trait VideoSource: Send {
    type Frame: Send + Sync;

    fn info(&self) -> StreamInfo;

    /// Next frame, or `None` at end of stream.
    async fn read_frame(&mut self) -> Result<Option<Self::Frame>, SourceError>;
}

/// Black-box object detector.
#[async_trait]
pub trait Detector: Send {
    type Frame: Send + Sync;

    /// Detections for one frame in emission order. Implementations apply
    /// their own confidence threshold.
    async fn detect(&mut self, frame: &Self::Frame) -> Result<Vec<Detection>, DetectorError>;
}
