//! The configuration of a training run.

use crate::common::*;

pub use evaluation::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub training: TrainingConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        /// The number of epochs to train.
        pub epochs: usize,
        /// The number of micro-batches whose gradients are summed before an
        /// optimizer step.
        #[serde(default = "default_accumulation_steps")]
        pub accumulation_steps: NonZeroUsize,
        /// If set and positive, gradients are clipped to this total norm.
        pub clip_max_norm: Option<R64>,
        /// Emit a progress line per this number of micro-batches.
        #[serde(default = "default_print_freq")]
        pub print_freq: usize,
        /// Learning rate scheduling strategy, indexed by epoch.
        pub lr_schedule: LearningRateSchedule,
        pub optimizer: OptimizerConfig,
        /// Save a checkpoint file per this number of epochs, and always
        /// after the last epoch.
        #[serde(default = "default_checkpoint_interval")]
        pub checkpoint_interval: NonZeroUsize,
        /// Where to resume training from.
        #[serde(default)]
        pub load_checkpoint: LoadCheckpoint,
        #[serde(with = "tch_serde::serde_device", default = "default_device")]
        pub device: Device,
    }

    /// The optimizer options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct OptimizerConfig {
        /// The first moment decay of Adam.
        #[serde(default = "default_momentum")]
        pub momentum: R64,
        #[serde(default = "default_weight_decay")]
        pub weight_decay: R64,
    }

    /// How the learning rate changes over epochs.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LearningRateSchedule {
        /// A fixed learning rate for every epoch.
        Constant { lr: R64 },
        /// Switch to the learning rate paired with each starting epoch.
        StepWise { steps: Vec<(usize, R64)> },
    }

    /// Where to resume training from.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Start from the initial parameters.
        Disabled,
        /// Resume from the newest checkpoint of any earlier run.
        FromRecent,
        /// Resume from the given file.
        FromFile { file: PathBuf },
    }

    impl Default for LoadCheckpoint {
        fn default() -> Self {
            Self::Disabled
        }
    }

    fn default_accumulation_steps() -> NonZeroUsize {
        NonZeroUsize::new(8).unwrap()
    }

    fn default_checkpoint_interval() -> NonZeroUsize {
        NonZeroUsize::new(1).unwrap()
    }

    fn default_momentum() -> R64 {
        r64(0.9)
    }

    fn default_weight_decay() -> R64 {
        r64(1e-4)
    }

    fn default_device() -> Device {
        Device::Cpu
    }
}

mod evaluation {
    use super::*;

    /// The evaluation options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EvaluationConfig {
        /// Predicted boxes scoring below this are not visualized.
        #[serde(default = "default_score_threshold")]
        pub score_threshold: R64,
        /// If set, box records are collected for every evaluated image.
        #[serde(default = "default_collect_visualization")]
        pub collect_visualization: bool,
        #[serde(default = "default_print_freq")]
        pub print_freq: usize,
    }

    impl Default for EvaluationConfig {
        fn default() -> Self {
            Self {
                score_threshold: default_score_threshold(),
                collect_visualization: default_collect_visualization(),
                print_freq: default_print_freq(),
            }
        }
    }

    fn default_score_threshold() -> R64 {
        r64(0.10)
    }

    fn default_collect_visualization() -> bool {
        true
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Each run writes `log.txt` and checkpoints to a timestamped
    /// directory under this one.
    pub dir: PathBuf,
    /// If set, annotated evaluation images are written to event files.
    #[serde(default)]
    pub enable_images: bool,
}

fn default_print_freq() -> usize {
    10
}
