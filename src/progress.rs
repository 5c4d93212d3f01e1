#![forbid(unsafe_code)]

//! Progress signal for running jobs.

/// Highest percent a source may report. 100 is reserved for verified
/// completion and only the tracker emits it.
pub const PROGRESS_CEILING: u8 = 95;

/// Yields the next percent to publish, or `None` when there is nothing new.
/// Values must be non-decreasing and never exceed [`PROGRESS_CEILING`].
pub trait ProgressSource: Send {
    fn tick(&mut self) -> Option<u8>;
}

/// Fixed-step approximation used while the extractor runs without reporting
/// byte-level progress.
#[derive(Debug, Clone)]
pub struct SyntheticProgress {
    current: u8,
    step: u8,
}

impl SyntheticProgress {
    pub fn new(step: u8) -> Self {
        Self {
            current: 0,
            step: step.max(1),
        }
    }
}

impl ProgressSource for SyntheticProgress {
    fn tick(&mut self) -> Option<u8> {
        let next = self.current.saturating_add(self.step);
        if next > PROGRESS_CEILING {
            return None;
        }
        self.current = next;
        Some(next)
    }
}
