// This file is part of Quay.
//
// Quay is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// Quay is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with Quay.
// If not, see https://www.gnu.org/licenses/.

//! Scoped timers that record into a histogram on drop

use std::time::Instant;

use metrics::Histogram;

/// Records the milliseconds between creation and drop into a histogram.
///
/// ```ignore
/// let _timer = HistogramTimer::new(metrics.submit_duration.clone());
/// // ... timed work ...
/// ```
pub struct HistogramTimer {
    started: Instant,
    metric: Histogram,
}

impl HistogramTimer {
    /// Start timing
    pub fn new(metric: Histogram) -> Self {
        Self {
            started: Instant::now(),
            metric,
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.metric
            .record(self.started.elapsed().as_secs_f64() * 1000.0);
    }
}
