use crate::common::*;

/// Records written by the logging worker per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub scalars: f64,
    pub images: f64,
}

/// Tallies written records and turns them into a [Throughput] once per
/// reporting period.
#[derive(Debug)]
pub struct ThroughputMeter {
    period: Duration,
    since: Instant,
    scalars: u64,
    images: u64,
}

impl ThroughputMeter {
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            since: now,
            scalars: 0,
            images: 0,
        }
    }

    pub fn count_scalars(&mut self, count: usize) {
        self.scalars += count as u64;
    }

    pub fn count_image(&mut self) {
        self.images += 1;
    }

    /// Takes the tallies once `period` has passed by `now`, and restarts
    /// counting from `now`.
    pub fn take(&mut self, now: Instant) -> Option<Throughput> {
        let elapsed = now.saturating_duration_since(self.since);
        if elapsed < self.period || elapsed.is_zero() {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let throughput = Throughput {
            scalars: self.scalars as f64 / secs,
            images: self.images as f64 / secs,
        };
        *self = Self::new(self.period, now);
        Some(throughput)
    }
}
