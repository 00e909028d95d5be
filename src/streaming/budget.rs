//! Per-tick extraction budget
//!
//! Tracks recent frame times and adapts how many chunks may be extracted in
//! one tick. Any bounded positive policy keeps extraction correct; this one
//! backs off by one chunk on a slow frame and grows by one on a fast frame.

use std::time::Duration;

use super::config::BudgetConfig;

/// Adaptive chunk-count budget for isosurface extraction
#[derive(Clone, Debug)]
pub struct ExtractionBudget {
    current: usize,
    min: usize,
    max: usize,
    target: Duration,
    /// Frozen budgets ignore frame timing
    fixed: bool,
}

impl ExtractionBudget {
    /// Create an adaptive budget from configuration
    pub fn new(config: &BudgetConfig) -> Self {
        let min = config.min.max(1);
        let max = config.max.max(min);
        Self {
            current: config.initial.clamp(min, max),
            min,
            max,
            target: Duration::from_secs_f32(config.target_frame_ms.max(0.001) / 1000.0),
            fixed: false,
        }
    }

    /// A budget that never adapts
    pub fn fixed(chunks: usize) -> Self {
        let chunks = chunks.max(1);
        Self {
            current: chunks,
            min: chunks,
            max: chunks,
            target: Duration::from_millis(16),
            fixed: true,
        }
    }

    /// Chunks that may be extracted this tick
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min, self.max)
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Feed the duration of the last frame.
    ///
    /// Above the target the budget shrinks by one; below 75% of it the
    /// budget grows by one. The result stays within `[min, max]`.
    pub fn record_frame(&mut self, frame_time: Duration) {
        if self.fixed {
            return;
        }
        if frame_time > self.target {
            self.current = self.current.saturating_sub(1).max(self.min);
        } else if frame_time.as_secs_f64() < self.target.as_secs_f64() * 0.75 {
            self.current = (self.current + 1).min(self.max);
        }
    }
}
