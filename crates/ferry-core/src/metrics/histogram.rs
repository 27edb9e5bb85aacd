//! Fixed-bucket histogram for step durations.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free histogram over millisecond observations.
///
/// Each bucket counts the values that fall between the previous boundary and
/// its own. Values past the last boundary land in the last bucket.
pub struct Histogram {
    /// Upper bucket boundaries in milliseconds.
    bounds: Vec<u64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with explicit boundaries (ascending).
    pub fn with_bounds(bounds: Vec<u64>) -> Self {
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Buckets sized for migration steps.
    ///
    /// 10ms, 100ms, 500ms, 1s, 5s, 30s, 1m, 5m, 15m, 1h
    pub fn step_duration() -> Self {
        Self::with_bounds(vec![
            10,
            100,
            500,
            1_000,
            5_000,
            30_000,
            60_000,
            300_000,
            900_000,
            3_600_000,
        ])
    }

    /// Record a value in milliseconds.
    pub fn observe(&self, value_ms: u64) {
        self.sum.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max.fetch_max(value_ms, Ordering::Relaxed);

        let slot = self
            .bounds
            .iter()
            .position(|&bound| value_ms <= bound)
            .unwrap_or(self.bounds.len().saturating_sub(1));
        if let Some(counter) = self.counts.get(slot) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all observations.
    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Largest observation.
    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Mean observation, 0 when empty.
    pub fn avg(&self) -> u64 {
        match self.count() {
            0 => 0,
            n => self.sum() / n,
        }
    }

    /// Upper boundary of the bucket holding quantile `q` (0.0 - 1.0).
    pub fn percentile(&self, q: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }

        let target = ((total as f64) * q).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (bound, counter) in self.bounds.iter().zip(&self.counts) {
            seen += counter.load(Ordering::Relaxed);
            if seen >= target {
                return *bound;
            }
        }
        self.bounds.last().copied().unwrap_or(0)
    }

    /// Median.
    pub fn p50(&self) -> u64 {
        self.percentile(0.50)
    }

    /// 99th percentile.
    pub fn p99(&self) -> u64 {
        self.percentile(0.99)
    }

    /// Cumulative `(bound, count)` pairs, as Prometheus `le` buckets expect.
    pub fn cumulative(&self) -> Vec<(u64, u64)> {
        let mut running = 0;
        self.bounds
            .iter()
            .zip(&self.counts)
            .map(|(&bound, counter)| {
                running += counter.load(Ordering::Relaxed);
                (bound, running)
            })
            .collect()
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.sum.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
        for counter in &self.counts {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::step_duration()
    }
}
