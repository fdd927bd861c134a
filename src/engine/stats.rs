use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

/// Cumulative moving average.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingMean {
    pub count: u64,
    pub mean: f64,
}

impl RollingMean {
    pub fn record(&mut self, value: f64) {
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }
}

/// Latency tracking in milliseconds: running mean plus a histogram for tails.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    mean: RollingMean,
    histogram: Option<Histogram<u64>>,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyTracker {
    pub fn new() -> Self {
        // three significant figures over [1ms, 1h]
        let histogram = Histogram::new_with_bounds(1, 3_600_000, 3).ok();
        Self { mean: RollingMean::default(), histogram }
    }

    pub fn record(&mut self, latency_ms: u64) {
        self.mean.record(latency_ms as f64);
        if let Some(h) = self.histogram.as_mut() {
            // saturating_record clamps values outside the configured bounds
            h.saturating_record(latency_ms.max(1));
        }
    }

    pub fn mean(&self) -> f64 {
        self.mean.mean
    }

    pub fn count(&self) -> u64 {
        self.mean.count
    }

    pub fn percentile(&self, q: f64) -> u64 {
        match &self.histogram {
            Some(h) if h.len() > 0 => h.value_at_quantile(q),
            _ => 0,
        }
    }
}
