use crate::{common::*, MeterConfig, MeterFormat, SmoothedValue};

/// A named collection of [SmoothedValue] meters.
///
/// The logger lives for one pass over a data stream. Averages read from it
/// are local to the worker; the final numbers are available only after
/// [MetricLogger::synchronize_between_processes] turns it into
/// [SyncedMetrics].
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: IndexMap<String, SmoothedValue>,
    delimiter: String,
}

impl MetricLogger {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            meters: IndexMap::new(),
            delimiter: delimiter.into(),
        }
    }

    /// Registers a meter with custom options, replacing any existing one.
    pub fn add_meter(&mut self, name: impl Into<String>, config: MeterConfig) {
        self.meters.insert(name.into(), SmoothedValue::new(config));
    }

    /// Records a value. Unknown names get a meter with default options.
    pub fn update(&mut self, name: &str, value: f64) {
        match self.meters.get_mut(name) {
            Some(meter) => meter.update(value),
            None => {
                let mut meter = SmoothedValue::new(MeterConfig::default());
                meter.update(value);
                self.meters.insert(name.to_string(), meter);
            }
        }
    }

    pub fn update_all<I, K>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        values
            .into_iter()
            .for_each(|(name, value)| self.update(name.as_ref(), value));
    }

    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    pub fn meters(&self) -> impl Iterator<Item = (&str, &SmoothedValue)> {
        self.meters.iter().map(|(name, meter)| (name.as_str(), meter))
    }

    /// Runs `body` on every element of `data` and reports progress.
    ///
    /// A progress line is emitted on every `print_freq`-th element and on
    /// the last one, showing the position, the estimated remaining time,
    /// the meters, and the per-iteration and data-wait times. The first
    /// error returned by `body` stops the iteration.
    pub fn log_every<I, F>(
        &mut self,
        data: I,
        print_freq: usize,
        header: &str,
        mut body: F,
    ) -> Result<()>
    where
        I: IntoIterator,
        I::IntoIter: ExactSizeIterator,
        F: FnMut(&mut Self, usize, I::Item) -> Result<()>,
    {
        let data = data.into_iter();
        let len = data.len();
        let width = len.to_string().len();
        let print_freq = print_freq.max(1);

        let mut iter_time = SmoothedValue::new(MeterConfig {
            format: MeterFormat::Avg(4),
            ..Default::default()
        });
        let mut data_time = SmoothedValue::new(MeterConfig {
            format: MeterFormat::Avg(4),
            ..Default::default()
        });

        let start = Instant::now();
        let mut end = Instant::now();

        for (index, item) in data.enumerate() {
            data_time.update(end.elapsed().as_secs_f64());
            body(self, index, item)?;
            iter_time.update(end.elapsed().as_secs_f64());

            if index % print_freq == 0 || index + 1 == len {
                let eta_secs = iter_time.global_avg() * (len - index) as f64;
                let line = [
                    header.to_string(),
                    format!("[{:>width$}/{}]", index, len, width = width),
                    format!("eta: {}", format_hms(eta_secs)),
                    self.to_string(),
                    format!("time: {}", iter_time),
                    format!("data: {}", data_time),
                ]
                .join(&self.delimiter);
                info!("{}", line);
            }

            end = Instant::now();
        }

        let total_secs = start.elapsed().as_secs_f64();
        info!(
            "{} Total time: {} ({:.4} s / it)",
            header,
            format_hms(total_secs),
            total_secs / len.max(1) as f64
        );

        Ok(())
    }

    /// Sums the meters of all workers and returns the final read-out.
    ///
    /// Every worker must track the same set of meter names.
    pub fn synchronize_between_processes(self, group: &dyn ProcessGroup) -> Result<SyncedMetrics> {
        let Self {
            mut meters,
            delimiter,
        } = self;

        if group.world_size() > 1 {
            let names = meters.keys().sorted().cloned().collect_vec();
            let peer_names = group.all_gather(&names)?;
            ensure!(
                peer_names.iter().all(|peer| *peer == names),
                "workers track different metrics: {:?}",
                peer_names
            );

            let mut sums = names
                .iter()
                .flat_map(|name| {
                    let meter = &meters[name];
                    [meter.count() as f64, meter.total()]
                })
                .collect_vec();
            group.all_reduce_sum(&mut sums)?;

            for (name, pair) in names.iter().zip(sums.chunks_exact(2)) {
                meters[name].set_totals(pair[0].round() as u64, pair[1]);
            }
        }

        Ok(SyncedMetrics { meters, delimiter })
    }
}

impl Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_meters(f, &self.meters, &self.delimiter)
    }
}

/// Meters whose totals are summed over every worker.
#[derive(Debug, Clone)]
pub struct SyncedMetrics {
    meters: IndexMap<String, SmoothedValue>,
    delimiter: String,
}

impl SyncedMetrics {
    pub fn global_avg(&self, name: &str) -> Option<f64> {
        self.meters.get(name).map(SmoothedValue::global_avg)
    }

    /// The global averages of every meter, in registration order.
    pub fn global_averages(&self) -> IndexMap<String, f64> {
        self.meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.global_avg()))
            .collect()
    }

    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }
}

impl Display for SyncedMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_meters(f, &self.meters, &self.delimiter)
    }
}

fn fmt_meters(
    f: &mut fmt::Formatter<'_>,
    meters: &IndexMap<String, SmoothedValue>,
    delimiter: &str,
) -> fmt::Result {
    let text = meters
        .iter()
        .map(|(name, meter)| format!("{}: {}", name, meter))
        .join(delimiter);
    f.write_str(&text)
}

fn format_hms(secs: f64) -> String {
    let secs = Duration::from_secs_f64(secs.max(0.0)).as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}
