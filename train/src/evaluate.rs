//! Evaluation passes over a validation stream.

use crate::{
    batch::{stack_sizes, Batch, Target},
    common::*,
    context::EngineContext,
    evaluator::{BatchPredictions, IncrementalEvaluator, StatValue, Stats},
    loss::{ReducedLosses, CLASS_ERROR},
    model::{Criterion, Model},
    postprocess::{Detection, PanopticRecord, PostProcessors},
    visualize::{
        box_records, filter_predictions, image_dimensions, scored_boxes, ImageCatalog,
        ImagePredictions, DEFAULT_SCORE_THRESHOLD,
    },
};

/// The [Evaluator] initializer.
#[derive(Debug, Clone)]
pub struct EvaluatorInit {
    /// Boxes scoring below this are left out of visualization records.
    pub score_threshold: f64,
    /// If set, box records are built for every image. This requires an
    /// [ImageCatalog].
    pub collect_visualization: bool,
    pub print_freq: usize,
}

impl Default for EvaluatorInit {
    fn default() -> Self {
        Self {
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            collect_visualization: true,
            print_freq: 10,
        }
    }
}

impl EvaluatorInit {
    pub fn build(self) -> Result<Evaluator> {
        let Self {
            score_threshold,
            collect_visualization,
            print_freq,
        } = self;
        ensure!(
            (0.0..=1.0).contains(&score_threshold),
            "score_threshold must be within [0, 1], but get {}",
            score_threshold
        );

        Ok(Evaluator {
            score_threshold,
            collect_visualization,
            print_freq,
        })
    }
}

/// Runs the model over a validation stream and feeds its predictions to
/// incremental evaluators.
#[derive(Debug, Clone)]
pub struct Evaluator {
    score_threshold: f64,
    collect_visualization: bool,
    print_freq: usize,
}

/// The results of an evaluation pass.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationOutput {
    /// Averaged losses merged with the summaries of every evaluator.
    pub stats: Stats,
    /// Box records keyed by image id. Empty unless visualization is
    /// collected.
    pub visualizations: IndexMap<i64, ImagePredictions>,
}

impl Evaluator {
    /// Evaluates the model on `data` without tracking gradients.
    ///
    /// The evaluators stay owned by the caller. They are synchronized and
    /// summarized after the stream ends, even when it is empty.
    pub fn evaluate<M, C, D>(
        &self,
        ctx: &mut EngineContext<'_, M, C>,
        postprocessors: &PostProcessors<M::Output>,
        data: D,
        evaluators: &mut [&mut dyn IncrementalEvaluator],
        catalog: Option<&dyn ImageCatalog>,
    ) -> Result<EvaluationOutput>
    where
        M: Model,
        C: Criterion<M::Output>,
        D: IntoIterator<Item = Result<Batch<M::Input>>>,
        D::IntoIter: ExactSizeIterator,
    {
        let Self {
            score_threshold,
            collect_visualization,
            print_freq,
        } = *self;
        let EngineContext {
            ref mut model,
            ref mut criterion,
            device,
            group,
            ..
        } = *ctx;

        let catalog = if collect_visualization {
            let catalog = catalog
                .ok_or_else(|| format_err!("collecting visualization requires an image catalog"))?;
            Some(catalog)
        } else {
            None
        };

        let mut logger = MetricLogger::new("  ");
        logger.add_meter(CLASS_ERROR, MeterConfig::latest(2));
        let mut visualizations = IndexMap::new();

        tch::no_grad(|| {
            logger.log_every(data, print_freq, "Test:", |logger, _step, batch| {
                let (samples, targets) = batch?.into_device(device);

                let outputs = model.forward_t(&samples, false)?;
                let losses = criterion.forward(&outputs, &targets)?;
                let reduced = ReducedLosses::reduce(&losses, criterion.weight_dict(), group)?;
                let class_error = reduced.class_error()?;
                logger.update_all(reduced.meter_values());
                logger.update(CLASS_ERROR, class_error);

                let predictions = predict(postprocessors, &outputs, &targets, device)?;
                for evaluator in evaluators.iter_mut() {
                    evaluator.update(&predictions)?;
                }

                if let Some(catalog) = catalog {
                    for (&image_id, detection) in &predictions.detections {
                        let records =
                            visualize_detection(image_id, detection, catalog, score_threshold)?;
                        visualizations.insert(image_id, records);
                    }
                }

                Ok(())
            })
        })?;

        let synced = logger.synchronize_between_processes(group)?;
        info!("Averaged stats: {}", synced);
        for evaluator in evaluators.iter_mut() {
            evaluator.synchronize(group)?;
        }

        let mut stats: Stats = synced
            .global_averages()
            .into_iter()
            .map(|(name, value)| (name, StatValue::Scalar(value)))
            .collect();
        for evaluator in evaluators.iter_mut() {
            let summary = evaluator.summarize()?;
            info!(
                "{} evaluator reports {:?}",
                evaluator.name(),
                summary.keys().collect_vec()
            );
            stats.extend(summary);
        }

        Ok(EvaluationOutput {
            stats,
            visualizations,
        })
    }
}

/// Post-processes the outputs of one batch and binds them to image ids.
fn predict<O>(
    postprocessors: &PostProcessors<O>,
    outputs: &O,
    targets: &[Target],
    device: Device,
) -> Result<BatchPredictions> {
    let PostProcessors {
        bbox,
        segm,
        panoptic,
    } = postprocessors;
    let orig_sizes = stack_sizes(targets, |target| target.orig_size, device);
    let sizes = stack_sizes(targets, |target| target.size, device);

    let mut detections = bbox.process(outputs, &orig_sizes)?;
    if let Some(segm) = segm {
        detections = segm.process(detections, outputs, &orig_sizes, &sizes)?;
    }
    ensure!(
        detections.len() == targets.len(),
        "expect {} detections, but get {}",
        targets.len(),
        detections.len()
    );
    let detections = targets
        .iter()
        .map(|target| target.image_id)
        .zip(detections)
        .collect();

    let panoptic = panoptic
        .as_ref()
        .map(|panoptic| -> Result<_> {
            let predictions = panoptic.process(outputs, &sizes, &orig_sizes)?;
            ensure!(
                predictions.len() == targets.len(),
                "expect {} panoptic predictions, but get {}",
                targets.len(),
                predictions.len()
            );
            let records = targets
                .iter()
                .zip(predictions)
                .map(|(target, prediction)| PanopticRecord::new(target.image_id, prediction))
                .collect();
            Ok(records)
        })
        .transpose()?;

    Ok(BatchPredictions {
        detections,
        panoptic,
    })
}

fn visualize_detection(
    image_id: i64,
    detection: &Detection,
    catalog: &dyn ImageCatalog,
    score_threshold: f64,
) -> Result<ImagePredictions> {
    let image_path = catalog.image_path(image_id)?;
    let image_size = image_dimensions(&image_path)?;
    let kept = filter_predictions(scored_boxes(detection)?, score_threshold);
    box_records(&kept, image_size, catalog)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        evaluator::{
            tests::{RecordingCoco, RecordingPanoptic},
            CocoEvaluator, IouType, PanopticEvaluator,
        },
        logging::NullSink,
        postprocess::{
            BoxPostProcessor, MaskPostProcessor, PanopticPostProcessor, PanopticPrediction,
            SegmentInfo,
        },
        train::tests::{batches, CountingModel, ScriptedCriterion},
        visualize::CocoCatalog,
    };
    use approx::assert_abs_diff_eq;
    use process_group::SingleProcess;

    /// One confident foreground box and one background box per image.
    pub struct FixedBoxes;

    impl BoxPostProcessor<usize> for FixedBoxes {
        fn process(&self, _outputs: &usize, orig_sizes: &Tensor) -> Result<Vec<Detection>> {
            let orig_sizes = Vec::<i64>::from(&orig_sizes.view([-1]));
            let detections = orig_sizes
                .chunks_exact(2)
                .map(|hw| {
                    let (h, w) = (hw[0] as f32, hw[1] as f32);
                    Detection {
                        boxes: Tensor::of_slice(&[0.1 * w, 0.1 * h, 0.5 * w, 0.5 * h, 0.0, 0.0, w, h])
                            .view([2, 4]),
                        labels: Tensor::of_slice(&[1i64, 0]),
                        scores: Tensor::of_slice(&[0.9f32, 0.95]),
                        masks: None,
                    }
                })
                .collect();
            Ok(detections)
        }
    }

    struct BlankMasks;

    impl MaskPostProcessor<usize> for BlankMasks {
        fn process(
            &self,
            detections: Vec<Detection>,
            _outputs: &usize,
            _orig_sizes: &Tensor,
            _sizes: &Tensor,
        ) -> Result<Vec<Detection>> {
            let detections = detections
                .into_iter()
                .map(|detection| Detection {
                    masks: Some(Tensor::zeros(
                        &[detection.num_boxes(), 1, 4, 4],
                        tch::kind::FLOAT_CPU,
                    )),
                    ..detection
                })
                .collect();
            Ok(detections)
        }
    }

    struct SingleSegment;

    impl PanopticPostProcessor<usize> for SingleSegment {
        fn process(
            &self,
            _outputs: &usize,
            sizes: &Tensor,
            _orig_sizes: &Tensor,
        ) -> Result<Vec<PanopticPrediction>> {
            let predictions = (0..sizes.size()[0])
                .map(|_| PanopticPrediction {
                    png_string: b"\x89PNG".to_vec(),
                    segments_info: vec![SegmentInfo {
                        id: 1,
                        isthing: true,
                        category_id: 1,
                        area: 16,
                    }],
                })
                .collect();
            Ok(predictions)
        }
    }

    /// Writes PNG files whose headers declare 640x480 for image ids 0..4,
    /// and returns a catalog of them.
    pub fn image_catalog(name: &str) -> Result<CocoCatalog> {
        let image_dir = std::env::temp_dir().join(format!(
            "detr-train-{}-{}",
            name,
            std::process::id()
        ));
        fs::create_dir_all(&image_dir)?;

        let mut images = vec![];
        for image_id in 0..4 {
            let file_name = format!("{:012}.png", image_id);
            let mut header = b"\x89PNG\r\n\x1a\n\0\0\0\x0dIHDR".to_vec();
            header.extend(640u32.to_be_bytes());
            header.extend(480u32.to_be_bytes());
            header.extend([8, 2, 0, 0, 0, 0, 0, 0, 0]);
            fs::write(image_dir.join(&file_name), header)?;
            images.push(serde_json::json!({ "id": image_id, "file_name": file_name }));
        }

        let annotations = serde_json::json!({
            "images": images,
            "categories": [{ "id": 1, "name": "person" }],
        });
        CocoCatalog::from_json(&annotations.to_string(), image_dir)
    }

    #[test]
    fn predictions_reach_every_evaluator() -> Result<()> {
        let catalog = image_catalog("evaluate")?;
        let evaluator = EvaluatorInit::default().build()?;
        let postprocessors = PostProcessors::new(FixedBoxes)
            .with_segm(BlankMasks)
            .with_panoptic(SingleSegment);
        let mut coco = CocoEvaluator::new(RecordingCoco::default(), [IouType::Bbox, IouType::Segm])?;
        let mut panoptic = PanopticEvaluator::new(RecordingPanoptic::default());

        let mut model = CountingModel::default();
        let mut criterion = ScriptedCriterion::constant(2, 1.0, 2.0);
        let mut ctx = EngineContext {
            model: &mut model,
            criterion: &mut criterion,
            device: Device::Cpu,
            group: &SingleProcess,
            sink: &NullSink,
        };
        let mut evaluators: [&mut dyn IncrementalEvaluator; 2] = [&mut coco, &mut panoptic];
        let output = evaluator.evaluate(
            &mut ctx,
            &postprocessors,
            batches(2),
            &mut evaluators,
            Some(&catalog as &dyn ImageCatalog),
        )?;

        // losses are averaged like in training, without any backward pass
        assert_eq!(model.train_flags, [false, false]);
        assert!(criterion.backward_values().is_empty());
        assert_eq!(output.stats["loss"], StatValue::Scalar(11.0));
        assert_eq!(output.stats["loss_bbox_unscaled"], StatValue::Scalar(2.0));
        assert_eq!(output.stats[CLASS_ERROR], StatValue::Scalar(50.0));

        assert_eq!(coco.backend().image_ids, [0, 1, 2, 3]);
        assert_eq!(coco.backend().with_masks, [true; 4]);
        assert_eq!(
            coco.backend().calls,
            ["update", "update", "synchronize", "accumulate", "summarize"]
        );
        assert_eq!(output.stats["coco_eval_masks"], StatValue::List(vec![0.37; 12]));

        assert!(panoptic.backend().synchronized);
        assert_eq!(
            panoptic.backend().file_names,
            [
                "000000000000.png",
                "000000000001.png",
                "000000000002.png",
                "000000000003.png"
            ]
        );
        assert!(output.stats.contains_key("PQ_st"));

        // background boxes are dropped
        assert_eq!(output.visualizations.keys().copied().collect_vec(), [0, 1, 2, 3]);
        for predictions in output.visualizations.values() {
            let boxes = predictions.boxes();
            assert_eq!(boxes.len(), 1);
            assert_eq!(boxes[0].class_id, 1);
            assert_eq!(boxes[0].box_caption, "score: 0.9, class: person");
            assert_abs_diff_eq!(boxes[0].position.min_x, 0.1, epsilon = 1e-6);
            assert_abs_diff_eq!(boxes[0].position.max_y, 0.5, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn empty_stream_still_summarizes() -> Result<()> {
        let catalog = image_catalog("empty")?;
        let evaluator = EvaluatorInit::default().build()?;
        let postprocessors = PostProcessors::new(FixedBoxes);
        let mut coco = CocoEvaluator::new(RecordingCoco::default(), [IouType::Bbox])?;

        let mut model = CountingModel::default();
        let mut criterion = ScriptedCriterion::constant(0, 1.0, 1.0);
        let mut ctx = EngineContext {
            model: &mut model,
            criterion: &mut criterion,
            device: Device::Cpu,
            group: &SingleProcess,
            sink: &NullSink,
        };
        let output = evaluator.evaluate(
            &mut ctx,
            &postprocessors,
            batches(0),
            &mut [&mut coco as &mut dyn IncrementalEvaluator],
            Some(&catalog as &dyn ImageCatalog),
        )?;

        assert!(output.visualizations.is_empty());
        assert!(output.stats.contains_key("coco_eval_bbox"));
        assert_eq!(coco.backend().calls, ["synchronize", "accumulate", "summarize"]);
        Ok(())
    }

    #[test]
    fn visualization_is_optional() -> Result<()> {
        let postprocessors = PostProcessors::new(FixedBoxes);
        let mut model = CountingModel::default();
        let mut criterion = ScriptedCriterion::constant(1, 1.0, 1.0);
        let mut ctx = EngineContext {
            model: &mut model,
            criterion: &mut criterion,
            device: Device::Cpu,
            group: &SingleProcess,
            sink: &NullSink,
        };

        let with_visualization = EvaluatorInit::default().build()?;
        assert!(with_visualization
            .evaluate(&mut ctx, &postprocessors, batches(1), &mut [], None)
            .is_err());

        let without_visualization = EvaluatorInit {
            collect_visualization: false,
            ..Default::default()
        }
        .build()?;
        let output =
            without_visualization.evaluate(&mut ctx, &postprocessors, batches(1), &mut [], None)?;
        assert!(output.visualizations.is_empty());
        assert!(output.stats.contains_key("loss"));
        Ok(())
    }

    #[test]
    fn panoptic_evaluation_requires_panoptic_post_processor() -> Result<()> {
        let evaluator = EvaluatorInit {
            collect_visualization: false,
            ..Default::default()
        }
        .build()?;
        let postprocessors = PostProcessors::new(FixedBoxes);
        let mut panoptic = PanopticEvaluator::new(RecordingPanoptic::default());

        let mut model = CountingModel::default();
        let mut criterion = ScriptedCriterion::constant(1, 1.0, 1.0);
        let mut ctx = EngineContext {
            model: &mut model,
            criterion: &mut criterion,
            device: Device::Cpu,
            group: &SingleProcess,
            sink: &NullSink,
        };
        let result = evaluator.evaluate(
            &mut ctx,
            &postprocessors,
            batches(1),
            &mut [&mut panoptic as &mut dyn IncrementalEvaluator],
            None,
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn score_threshold_is_validated() {
        let init = EvaluatorInit {
            score_threshold: 1.5,
            ..Default::default()
        };
        assert!(init.build().is_err());
    }
}
