// ABOUTME: Size-bounded rolling window with median / percentile statistics
// ABOUTME: Used for playback age tracking and time offset estimation

use std::collections::VecDeque;

/// Size-limited sample window with basic statistics.
///
/// Pushing beyond the configured size evicts the oldest sample. Median and
/// percentile sort a scratch copy; callers keep windows small (20..500).
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    size: usize,
    samples: VecDeque<i64>,
}

impl RollingBuffer {
    /// Create a window holding at most `size` samples
    pub fn new(size: usize) -> Self {
        RollingBuffer {
            size,
            samples: VecDeque::with_capacity(size),
        }
    }

    /// Add a sample, evicting the oldest when full
    pub fn add(&mut self, sample: i64) {
        self.samples.push_back(sample);
        if self.samples.len() > self.size {
            self.samples.pop_front();
        }
    }

    /// Median of the current window, 0 when empty
    pub fn median(&self) -> i64 {
        self.percentile(50)
    }

    /// Arithmetic mean of the current window, 0 when empty
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.;
        }
        self.samples.iter().map(|&v| v as f64).sum::<f64>() / self.samples.len() as f64
    }

    /// The `p`-th percentile (0..=100) of the current window, 0 when empty
    pub fn percentile(&self, p: u8) -> i64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<i64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (sorted.len() - 1) * p as usize / 100;
        sorted[idx]
    }

    /// True once the window holds `size` samples
    pub fn full(&self) -> bool {
        self.samples.len() == self.size
    }

    /// Number of samples currently held
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no samples are held
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drop all samples
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_odd_window() {
        let mut buf = RollingBuffer::new(5);
        for v in [5, 1, 4, 2, 3] {
            buf.add(v);
        }
        assert!(buf.full());
        assert_eq!(buf.median(), 3);
    }

    #[test]
    fn eviction_keeps_window_bounded() {
        let mut buf = RollingBuffer::new(3);
        for v in 0..10 {
            buf.add(v);
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.median(), 8);
    }

    #[test]
    fn empty_window_is_zero() {
        let buf = RollingBuffer::new(4);
        assert_eq!(buf.median(), 0);
        assert_eq!(buf.percentile(95), 0);
        assert_eq!(buf.mean(), 0.);
    }

    #[test]
    fn percentile_extremes() {
        let mut buf = RollingBuffer::new(10);
        for v in 1..=10 {
            buf.add(v);
        }
        assert_eq!(buf.percentile(0), 1);
        assert_eq!(buf.percentile(100), 10);
    }
}
