//! Recent zoom direction, used to weight adjacent-level prefetch.

use std::collections::VecDeque;

/// Number of zoom samples remembered.
const HISTORY: usize = 8;

/// Sliding window of recent zoom factors in log2 space.
#[derive(Debug, Clone, Default)]
pub struct ZoomTrend {
    samples: VecDeque<f64>,
}

impl ZoomTrend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the zoom of the current view. Non-positive and non-finite
    /// zooms are ignored.
    pub fn record(&mut self, zoom: f64) {
        if !(zoom.is_finite() && zoom > 0.0) {
            return;
        }
        let sample = zoom.log2();
        if self.samples.back() == Some(&sample) {
            return;
        }
        if self.samples.len() == HISTORY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Direction in `[-1, 1]`: positive when zooming in, negative when
    /// zooming out, 0 when steady. One level of change saturates.
    pub fn direction(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => (last - first).clamp(-1.0, 1.0),
            _ => 0.0,
        }
    }

    /// Weights in `[0, 1]` for the finer and coarser adjacent levels.
    ///
    /// A steady view weights both at 0.5.
    pub fn adjacent_weights(&self) -> (f64, f64) {
        let direction = self.direction();
        (0.5 + 0.5 * direction, 0.5 - 0.5 * direction)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
