//! Conversion of raw model outputs into per-image predictions.

use crate::common::*;

/// The detections of one image.
#[derive(Debug)]
pub struct Detection {
    /// Boxes in `[N, 4]` xyxy shape, in pixels of the original image.
    pub boxes: Tensor,
    /// Class indices in `[N]` shape.
    pub labels: Tensor,
    /// Confidence scores in `[N]` shape.
    pub scores: Tensor,
    /// Binary masks in `[N, 1, H, W]` shape, set by the mask post-processor.
    pub masks: Option<Tensor>,
}

impl Detection {
    pub fn num_boxes(&self) -> i64 {
        self.labels.size().first().copied().unwrap_or(0)
    }
}

/// The panoptic segmentation of one image, as produced by the
/// post-processor.
#[derive(Debug, Clone)]
pub struct PanopticPrediction {
    /// The PNG-encoded segment id map.
    pub png_string: Vec<u8>,
    pub segments_info: Vec<SegmentInfo>,
}

/// One segment in a panoptic segment id map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub id: i64,
    pub isthing: bool,
    pub category_id: i64,
    pub area: i64,
}

/// A panoptic prediction bound to its image.
#[derive(Debug, Clone)]
pub struct PanopticRecord {
    pub image_id: i64,
    pub file_name: String,
    pub png_string: Vec<u8>,
    pub segments_info: Vec<SegmentInfo>,
}

impl PanopticRecord {
    pub fn new(image_id: i64, prediction: PanopticPrediction) -> Self {
        let PanopticPrediction {
            png_string,
            segments_info,
        } = prediction;

        Self {
            image_id,
            file_name: panoptic_file_name(image_id),
            png_string,
            segments_info,
        }
    }
}

/// The PNG file name of the panoptic prediction of an image.
pub fn panoptic_file_name(image_id: i64) -> String {
    format!("{:012}.png", image_id)
}

/// Produces scored boxes scaled to the original image sizes.
pub trait BoxPostProcessor<O> {
    /// `orig_sizes` holds one `[height, width]` row per image.
    fn process(&self, outputs: &O, orig_sizes: &Tensor) -> Result<Vec<Detection>>;
}

/// Attaches instance masks to detections.
pub trait MaskPostProcessor<O> {
    fn process(
        &self,
        detections: Vec<Detection>,
        outputs: &O,
        orig_sizes: &Tensor,
        sizes: &Tensor,
    ) -> Result<Vec<Detection>>;
}

/// Produces panoptic segmentations.
pub trait PanopticPostProcessor<O> {
    fn process(
        &self,
        outputs: &O,
        sizes: &Tensor,
        orig_sizes: &Tensor,
    ) -> Result<Vec<PanopticPrediction>>;
}

/// The post-processors selected for an evaluation run.
///
/// Boxes are always produced. Masks and panoptic segmentations are produced
/// only when the respective post-processor is set.
pub struct PostProcessors<O> {
    pub bbox: Box<dyn BoxPostProcessor<O>>,
    pub segm: Option<Box<dyn MaskPostProcessor<O>>>,
    pub panoptic: Option<Box<dyn PanopticPostProcessor<O>>>,
}

impl<O> PostProcessors<O> {
    pub fn new<P>(bbox: P) -> Self
    where
        P: BoxPostProcessor<O> + 'static,
    {
        Self {
            bbox: Box::new(bbox),
            segm: None,
            panoptic: None,
        }
    }

    pub fn with_segm<P>(mut self, segm: P) -> Self
    where
        P: MaskPostProcessor<O> + 'static,
    {
        self.segm = Some(Box::new(segm));
        self
    }

    pub fn with_panoptic<P>(mut self, panoptic: P) -> Self
    where
        P: PanopticPostProcessor<O> + 'static,
    {
        self.panoptic = Some(Box::new(panoptic));
        self
    }
}
