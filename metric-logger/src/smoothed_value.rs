use crate::common::*;

/// The statistics shown when a meter is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeterFormat {
    /// Window median followed by the global average in parentheses.
    MedianAndGlobalAvg(usize),
    /// The latest value.
    Value(usize),
    /// The window average.
    Avg(usize),
}

impl Default for MeterFormat {
    fn default() -> Self {
        Self::MedianAndGlobalAvg(4)
    }
}

/// Meter options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterConfig {
    /// The number of recent values kept for windowed statistics.
    pub window_size: usize,
    pub format: MeterFormat,
}

impl MeterConfig {
    /// A meter that only remembers and prints its latest value.
    pub fn latest(precision: usize) -> Self {
        Self {
            window_size: 1,
            format: MeterFormat::Value(precision),
        }
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            format: MeterFormat::default(),
        }
    }
}

/// Tracks a series of values, with statistics over a recent window and
/// over the whole series.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: u64,
    format: MeterFormat,
}

impl SmoothedValue {
    pub fn new(config: MeterConfig) -> Self {
        let MeterConfig {
            window_size,
            format,
        } = config;
        let window_size = window_size.max(1);

        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            total: 0.0,
            count: 0,
            format,
        }
    }

    pub fn update(&mut self, value: f64) {
        self.update_n(value, 1);
    }

    /// Records `value` as the outcome of `n` samples.
    pub fn update_n(&mut self, value: f64, n: u64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.count += n;
        self.total += value * n as f64;
    }

    /// The latest value, or NaN if nothing was recorded.
    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(f64::NAN)
    }

    /// The lower median of the window.
    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return f64::NAN;
        }
        let sorted = self
            .window
            .iter()
            .copied()
            .sorted_by(|lhs, rhs| lhs.total_cmp(rhs))
            .collect_vec();
        sorted[(sorted.len() - 1) / 2]
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return f64::NAN;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn max(&self) -> f64 {
        self.window.iter().copied().fold(f64::NAN, f64::max)
    }

    /// The average of every recorded value, or NaN if nothing was recorded.
    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        self.total / self.count as f64
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub(crate) fn set_totals(&mut self, count: u64, total: f64) {
        self.count = count;
        self.total = total;
    }
}

impl Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            MeterFormat::MedianAndGlobalAvg(precision) => write!(
                f,
                "{:.*} ({:.*})",
                precision,
                self.median(),
                precision,
                self.global_avg()
            ),
            MeterFormat::Value(precision) => write!(f, "{:.*}", precision, self.value()),
            MeterFormat::Avg(precision) => write!(f, "{:.*}", precision, self.avg()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn window_and_global_statistics() {
        let mut meter = SmoothedValue::new(MeterConfig {
            window_size: 3,
            ..Default::default()
        });
        [1.0, 2.0, 3.0, 4.0, 10.0]
            .into_iter()
            .for_each(|value| meter.update(value));

        assert_abs_diff_eq!(meter.value(), 10.0);
        assert_abs_diff_eq!(meter.median(), 4.0);
        assert_abs_diff_eq!(meter.avg(), 17.0 / 3.0);
        assert_abs_diff_eq!(meter.max(), 10.0);
        assert_abs_diff_eq!(meter.global_avg(), 4.0);
        assert_eq!(meter.count(), 5);
    }

    #[test]
    fn median_of_even_window_is_lower_middle() {
        let mut meter = SmoothedValue::new(MeterConfig::default());
        [4.0, 1.0, 3.0, 2.0]
            .into_iter()
            .for_each(|value| meter.update(value));
        assert_abs_diff_eq!(meter.median(), 2.0);
    }

    #[test]
    fn weighted_updates() {
        let mut meter = SmoothedValue::new(MeterConfig::default());
        meter.update_n(2.0, 3);
        meter.update_n(6.0, 1);
        assert_abs_diff_eq!(meter.global_avg(), 3.0);
    }

    #[test]
    fn empty_meter_reads_nan() {
        let meter = SmoothedValue::new(MeterConfig::default());
        assert!(meter.value().is_nan());
        assert!(meter.median().is_nan());
        assert!(meter.global_avg().is_nan());
    }

    #[test]
    fn display_formats() {
        let mut lr = SmoothedValue::new(MeterConfig::latest(6));
        lr.update(1e-4);
        lr.update(2e-4);
        assert_eq!(lr.to_string(), "0.000200");

        let mut class_error = SmoothedValue::new(MeterConfig::latest(2));
        class_error.update(37.5);
        assert_eq!(class_error.to_string(), "37.50");

        let mut loss = SmoothedValue::new(MeterConfig::default());
        loss.update(1.0);
        loss.update(2.0);
        loss.update(4.0);
        assert_eq!(loss.to_string(), "2.0000 (2.3333)");
    }
}
