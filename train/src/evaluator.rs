//! Incremental evaluators fed with the predictions of every batch.

use crate::{
    common::*,
    postprocess::{Detection, PanopticRecord},
};

/// A summary statistic reported by an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Scalar(f64),
    List(Vec<f64>),
    Table(IndexMap<String, f64>),
}

impl From<f64> for StatValue {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

pub type Stats = IndexMap<String, StatValue>;

/// The predictions of one evaluation batch.
#[derive(Debug)]
pub struct BatchPredictions {
    /// Detections keyed by image id.
    pub detections: IndexMap<i64, Detection>,
    /// Present when a panoptic post-processor is configured.
    pub panoptic: Option<Vec<PanopticRecord>>,
}

/// An evaluator that consumes predictions batch by batch.
///
/// Every worker feeds its own shard of the data. The results are merged by
/// [synchronize](IncrementalEvaluator::synchronize), which is a collective,
/// before [summarize](IncrementalEvaluator::summarize) is called.
pub trait IncrementalEvaluator {
    fn name(&self) -> &str;

    fn update(&mut self, predictions: &BatchPredictions) -> Result<()>;

    fn synchronize(&mut self, group: &dyn ProcessGroup) -> Result<()>;

    fn summarize(&mut self) -> Result<Stats>;
}

mod coco {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum IouType {
        Bbox,
        Segm,
    }

    impl IouType {
        /// The key of the statistics of this type in evaluation stats.
        pub fn stats_key(self) -> &'static str {
            match self {
                Self::Bbox => "coco_eval_bbox",
                Self::Segm => "coco_eval_masks",
            }
        }
    }

    /// COCO-style detection metrics.
    pub trait CocoBackend {
        fn update(&mut self, detections: &IndexMap<i64, Detection>) -> Result<()>;

        fn synchronize(&mut self, group: &dyn ProcessGroup) -> Result<()>;

        fn accumulate(&mut self) -> Result<()>;

        fn summarize(&mut self) -> Result<()>;

        /// The summary array of an IoU type, available after summarizing.
        fn stats(&self, iou_type: IouType) -> Option<Vec<f64>>;
    }

    /// Adapts a [CocoBackend] evaluating one or more IoU types.
    #[derive(Debug)]
    pub struct CocoEvaluator<B> {
        backend: B,
        iou_types: Vec<IouType>,
    }

    impl<B> CocoEvaluator<B>
    where
        B: CocoBackend,
    {
        pub fn new(backend: B, iou_types: impl IntoIterator<Item = IouType>) -> Result<Self> {
            let iou_types = iou_types.into_iter().unique().collect_vec();
            ensure!(!iou_types.is_empty(), "at least one IoU type is required");
            Ok(Self { backend, iou_types })
        }

        pub fn iou_types(&self) -> &[IouType] {
            &self.iou_types
        }

        pub fn backend(&self) -> &B {
            &self.backend
        }

        pub fn into_backend(self) -> B {
            self.backend
        }
    }

    impl<B> IncrementalEvaluator for CocoEvaluator<B>
    where
        B: CocoBackend,
    {
        fn name(&self) -> &str {
            "coco"
        }

        fn update(&mut self, predictions: &BatchPredictions) -> Result<()> {
            self.backend.update(&predictions.detections)
        }

        fn synchronize(&mut self, group: &dyn ProcessGroup) -> Result<()> {
            self.backend.synchronize(group)
        }

        fn summarize(&mut self) -> Result<Stats> {
            self.backend.accumulate()?;
            self.backend.summarize()?;

            self.iou_types
                .iter()
                .map(|&iou_type| {
                    let stats = self.backend.stats(iou_type).ok_or_else(|| {
                        format_err!("no statistics for IoU type {:?}", iou_type)
                    })?;
                    Ok((iou_type.stats_key().to_string(), StatValue::List(stats)))
                })
                .collect()
        }
    }
}
pub use coco::*;

mod panoptic {
    use super::*;

    /// Panoptic quality results per category group. Each table carries
    /// `pq`, `sq`, `rq` and `n`.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct PanopticSummary {
        pub all: IndexMap<String, f64>,
        pub things: IndexMap<String, f64>,
        pub stuff: IndexMap<String, f64>,
    }

    /// Panoptic quality metrics.
    pub trait PanopticBackend {
        fn update(&mut self, records: &[PanopticRecord]) -> Result<()>;

        fn synchronize(&mut self, group: &dyn ProcessGroup) -> Result<()>;

        fn summarize(&mut self) -> Result<PanopticSummary>;
    }

    /// Adapts a [PanopticBackend].
    #[derive(Debug)]
    pub struct PanopticEvaluator<B> {
        backend: B,
    }

    impl<B> PanopticEvaluator<B>
    where
        B: PanopticBackend,
    {
        pub fn new(backend: B) -> Self {
            Self { backend }
        }

        pub fn backend(&self) -> &B {
            &self.backend
        }

        pub fn into_backend(self) -> B {
            self.backend
        }
    }

    impl<B> IncrementalEvaluator for PanopticEvaluator<B>
    where
        B: PanopticBackend,
    {
        fn name(&self) -> &str {
            "panoptic"
        }

        fn update(&mut self, predictions: &BatchPredictions) -> Result<()> {
            let records = predictions.panoptic.as_deref().ok_or_else(|| {
                format_err!("panoptic evaluation requires a panoptic post-processor")
            })?;
            self.backend.update(records)
        }

        fn synchronize(&mut self, group: &dyn ProcessGroup) -> Result<()> {
            self.backend.synchronize(group)
        }

        fn summarize(&mut self) -> Result<Stats> {
            let PanopticSummary { all, things, stuff } = self.backend.summarize()?;
            let stats = [("PQ_all", all), ("PQ_th", things), ("PQ_st", stuff)]
                .into_iter()
                .map(|(key, table)| (key.to_string(), StatValue::Table(table)))
                .collect();
            Ok(stats)
        }
    }
}
pub use panoptic::*;
