// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use medians::Medianf64;
use rolling_stats;
use serde::Serialize;
use statistical;

#[derive(Clone, Debug, Default, Serialize)]
pub struct DescriptiveStats {
    pub min: f64,
    pub max: f64,

    pub mean: f64,
    pub stddev: f64,

    // Omitted for `session` in ValueStats.
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ValueStats {
    // Stats over the bounded window of recent values.
    pub recent: DescriptiveStats,

    // Stats since construction or the last reset_session() call.
    pub session: DescriptiveStats,
}

// Accumulates per-cycle scalar series (matching rates, cycle times) for the
// diagnostics surface. `recent` is computed over a bounded window; `session`
// is a running accumulation that never drops values.
pub struct ValueStatsAccumulator {
    pub value_stats: ValueStats,

    // State for `recent`.
    window: BoundedWindow,

    // State for `session`.
    rolling_stats: rolling_stats::Stats<f64>,
}

impl ValueStatsAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            value_stats: ValueStats::default(),
            window: BoundedWindow::new(capacity),
            rolling_stats: rolling_stats::Stats::<f64>::new(),
        }
    }

    pub fn add_value(&mut self, value: f64) {
        self.window.push(value);
        self.rolling_stats.update(value);

        let recent_values = self.window.contents();
        let recent_stats = &mut self.value_stats.recent;
        recent_stats.min =
            *recent_values.iter().min_by(|a, b| a.total_cmp(b)).unwrap();
        recent_stats.max =
            *recent_values.iter().max_by(|a, b| a.total_cmp(b)).unwrap();
        recent_stats.mean = statistical::mean(recent_values);
        if recent_values.len() > 1 {
            recent_stats.stddev = statistical::standard_deviation(
                recent_values, Some(recent_stats.mean));
        }
        recent_stats.median = Some(recent_values.medf_unchecked());
        recent_stats.median_absolute_deviation =
            Some(recent_values.madf(recent_stats.median.unwrap()));

        let session_stats = &mut self.value_stats.session;
        session_stats.min = self.rolling_stats.min;
        session_stats.max = self.rolling_stats.max;
        session_stats.mean = self.rolling_stats.mean;
        session_stats.stddev = self.rolling_stats.std_dev;
        // No median or median_absolute_deviation for session_stats.
    }

    pub fn count(&self) -> usize {
        self.window.len()
    }

    // Mean of the `n` most recently added values (fewer if the window holds
    // fewer). None when no values have been added. Used by the degradation
    // detector to compare the fresh tail against the whole window.
    pub fn tail_mean(&self, n: usize) -> Option<f64> {
        let tail = self.window.tail(n);
        if tail.is_empty() {
            return None;
        }
        Some(tail.iter().sum::<f64>() / tail.len() as f64)
    }

    pub fn window_mean(&self) -> Option<f64> {
        if self.window.len() == 0 {
            return None;
        }
        Some(self.value_stats.recent.mean)
    }

    pub fn reset_session(&mut self) {
        self.value_stats.session = DescriptiveStats::default();
        self.rolling_stats = rolling_stats::Stats::<f64>::new();
    }
}

// Ring over a plain Vec so the whole window is visible as one slice for the
// descriptive stats, while insertion order is still recoverable for tail().
struct BoundedWindow {
    // Index of the oldest element once the buffer has wrapped.
    start: usize,
    data: Vec<f64>,
    capacity: usize,
}

impl BoundedWindow {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self { start: 0, data: Vec::with_capacity(capacity), capacity }
    }

    fn push(&mut self, item: f64) {
        if self.data.len() < self.capacity {
            self.data.push(item);
        } else {
            self.data[self.start] = item;
            self.start += 1;
            self.start %= self.capacity;
        }
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    // All window contents, in no particular order.
    fn contents(&self) -> &[f64] {
        self.data.as_slice()
    }

    // The up-to-n most recently pushed values, newest first.
    fn tail(&self, n: usize) -> Vec<f64> {
        let len = self.data.len();
        let take = n.min(len);
        let newest = if len < self.capacity {
            len.wrapping_sub(1)
        } else {
            (self.start + self.capacity - 1) % self.capacity
        };
        let mut out = Vec::with_capacity(take);
        for back in 0..take {
            let index = (newest + len - back) % len;
            out.push(self.data[index]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_recent_and_session_stats() {
        let mut acc = ValueStatsAccumulator::new(4);
        for value in [1.0, 2.0, 3.0, 4.0] {
            acc.add_value(value);
        }
        assert_abs_diff_eq!(acc.value_stats.recent.mean, 2.5, epsilon = 1e-9);
        assert_abs_diff_eq!(acc.value_stats.recent.min, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(acc.value_stats.recent.max, 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(acc.value_stats.session.mean, 2.5, epsilon = 1e-9);

        // Window drops the oldest; session keeps everything.
        acc.add_value(5.0);
        assert_abs_diff_eq!(acc.value_stats.recent.mean, 3.5, epsilon = 1e-9);
        assert_abs_diff_eq!(acc.value_stats.recent.min, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(acc.value_stats.session.mean, 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(acc.value_stats.session.min, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_tail_mean_before_wrap() {
        let mut acc = ValueStatsAccumulator::new(10);
        assert!(acc.tail_mean(3).is_none());
        for value in [10.0, 20.0, 30.0] {
            acc.add_value(value);
        }
        assert_abs_diff_eq!(acc.tail_mean(2).unwrap(), 25.0, epsilon = 1e-9);
        // Asking for more than is present uses what exists.
        assert_abs_diff_eq!(acc.tail_mean(5).unwrap(), 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_tail_mean_after_wrap() {
        let mut acc = ValueStatsAccumulator::new(4);
        for value in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0] {
            acc.add_value(value);
        }
        // Window now holds 3,4,5,6.
        assert_abs_diff_eq!(acc.tail_mean(2).unwrap(), 5.5, epsilon = 1e-9);
        assert_abs_diff_eq!(acc.tail_mean(4).unwrap(), 4.5, epsilon = 1e-9);
        assert_abs_diff_eq!(acc.window_mean().unwrap(), 4.5, epsilon = 1e-9);
    }

    #[test]
    fn test_reset_session_keeps_window() {
        let mut acc = ValueStatsAccumulator::new(4);
        acc.add_value(1.0);
        acc.add_value(3.0);
        acc.reset_session();
        assert_abs_diff_eq!(acc.value_stats.session.mean, 0.0, epsilon = 1e-9);
        assert_eq!(acc.count(), 2);
        acc.add_value(5.0);
        assert_abs_diff_eq!(acc.value_stats.session.mean, 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(acc.value_stats.recent.mean, 3.0, epsilon = 1e-9);
    }
}  // mod tests.
