//! Frame cadence gating.

use std::num::NonZeroU64;

/// Outcome of advancing the cadence by one raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTick {
    /// Raw frame index, 1-based
    pub frame_number: u64,
    /// Processed count after this frame, if the frame is to be processed
    pub processed_frame_number: Option<u64>,
}

impl FrameTick {
    pub fn is_processed(&self) -> bool {
        self.processed_frame_number.is_some()
    }
}

/// Decides which raw frames are processed: every frame whose 1-based index is
/// a multiple of the skip interval.
#[derive(Debug, Clone)]
pub struct FrameCadenceController {
    skip_interval: NonZeroU64,
    raw_count: u64,
    processed_count: u64,
}

impl FrameCadenceController {
    pub fn new(skip_interval: NonZeroU64) -> Self {
        Self {
            skip_interval,
            raw_count: 0,
            processed_count: 0,
        }
    }

    pub fn skip_interval(&self) -> u64 {
        self.skip_interval.get()
    }

    pub fn should_process(&self, raw_frame_index: u64) -> bool {
        raw_frame_index % self.skip_interval.get() == 0
    }

    /// Account for the next raw frame. Counters in the returned tick are the
    /// values after advancing.
    pub fn advance(&mut self) -> FrameTick {
        self.raw_count += 1;
        let processed_frame_number = if self.should_process(self.raw_count) {
            self.processed_count += 1;
            Some(self.processed_count)
        } else {
            None
        };

        FrameTick {
            frame_number: self.raw_count,
            processed_frame_number,
        }
    }

    pub fn raw_count(&self) -> u64 {
        self.raw_count
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(skip: u64) -> FrameCadenceController {
        FrameCadenceController::new(NonZeroU64::new(skip).unwrap())
    }

    #[test]
    fn test_every_frame_processed_with_interval_one() {
        let mut cadence = controller(1);
        for expected in 1..=5 {
            let tick = cadence.advance();
            assert_eq!(tick.frame_number, expected);
            assert_eq!(tick.processed_frame_number, Some(expected));
        }
    }

    #[test]
    fn test_only_multiples_are_processed() {
        let mut cadence = controller(3);
        let processed: Vec<u64> = (0..10)
            .map(|_| cadence.advance())
            .filter(FrameTick::is_processed)
            .map(|tick| tick.frame_number)
            .collect();
        assert_eq!(processed, vec![3, 6, 9]);
        assert_eq!(cadence.raw_count(), 10);
        assert_eq!(cadence.processed_count(), 3);
    }

    #[test]
    fn test_should_process_is_pure() {
        let cadence = controller(2);
        assert!(!cadence.should_process(1));
        assert!(cadence.should_process(2));
        assert!(cadence.should_process(4));
        assert_eq!(cadence.raw_count(), 0);
    }

    #[test]
    fn test_processed_numbers_are_dense() {
        let mut cadence = controller(2);
        let ticks: Vec<FrameTick> = (0..4).map(|_| cadence.advance()).collect();
        assert_eq!(ticks[1].processed_frame_number, Some(1));
        assert_eq!(ticks[3].processed_frame_number, Some(2));
        assert_eq!(ticks[2].processed_frame_number, None);
    }
}
