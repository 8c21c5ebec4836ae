//! The multi-epoch training driver.

use crate::{
    batch::Batch,
    common::*,
    config::{Config, LoadCheckpoint},
    context::EngineContext,
    evaluate::{EvaluationOutput, Evaluator, EvaluatorInit},
    evaluator::{IncrementalEvaluator, StatValue, Stats},
    logging::ExperimentSink,
    model::{Criterion, Model},
    optim::{Checkpoint, Optimizer},
    postprocess::PostProcessors,
    train::{EpochTrainer, EpochTrainerInit},
    utils::{self, CheckpointFile, LrScheduler, FILE_STRFTIME},
    visualize::{ImageCatalog, ImagePredictions},
};

/// The tag of visualization records sent to the sink.
pub const PREDICTIONS_TAG: &str = "predictions";

/// A stream of batches with known length.
pub type BatchStream<'a, I> = Box<dyn ExactSizeIterator<Item = Result<Batch<I>>> + 'a>;

/// The evaluation run after every training epoch.
pub struct Validation<'a, I, O> {
    pub postprocessors: &'a PostProcessors<O>,
    pub catalog: Option<&'a dyn ImageCatalog>,
    /// Produces the validation stream of each pass.
    pub data: Box<dyn FnMut() -> Result<BatchStream<'a, I>> + 'a>,
    /// Creates fresh evaluators for each pass.
    pub new_evaluators: Box<dyn FnMut() -> Result<Vec<Box<dyn IncrementalEvaluator>>> + 'a>,
}

/// The summary of one epoch, written as a line of `log.txt`.
#[derive(Debug, Clone)]
pub struct EpochLog {
    pub epoch: usize,
    pub train: IndexMap<String, f64>,
    pub test: Option<Stats>,
}

impl EpochLog {
    /// Flattens the summary into `{train_*, test_*, epoch}`.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let Self {
            epoch,
            ref train,
            ref test,
        } = *self;

        let mut map = serde_json::Map::new();
        for (name, &value) in train {
            map.insert(format!("train_{}", name), serde_json::to_value(value)?);
        }
        for (name, value) in test.iter().flatten() {
            map.insert(format!("test_{}", name), serde_json::to_value(value)?);
        }
        map.insert("epoch".into(), epoch.into());
        Ok(serde_json::Value::Object(map))
    }

    /// The scalar read-out sent to the sink. Lists and tables are expanded
    /// to one scalar per entry.
    pub fn scalars(&self) -> Vec<(String, f64)> {
        let train = self
            .train
            .iter()
            .map(|(name, &value)| (format!("train_{}", name), value));
        let test = self.test.iter().flatten().flat_map(|(name, value)| {
            let name = format!("test_{}", name);
            match value {
                StatValue::Scalar(value) => vec![(name, *value)],
                StatValue::List(values) => values
                    .iter()
                    .enumerate()
                    .map(|(index, &value)| (format!("{}/{}", name, index), value))
                    .collect(),
                StatValue::Table(table) => table
                    .iter()
                    .map(|(key, &value)| (format!("{}/{}", name, key), value))
                    .collect(),
            }
        });
        train
            .chain(test)
            .chain(iter::once(("epoch".to_string(), self.epoch as f64)))
            .collect()
    }
}

/// Drives training over epochs with checkpointing, evaluation and logging.
#[derive(Debug)]
pub struct Trainer {
    epochs: usize,
    checkpoint_interval: usize,
    load_checkpoint: LoadCheckpoint,
    logging_dir: PathBuf,
    output_dir: PathBuf,
    epoch_trainer: EpochTrainer,
    evaluator: Evaluator,
    lr_scheduler: LrScheduler,
}

impl Trainer {
    /// Builds the trainer of a run. Its outputs go to a directory under
    /// the logging directory named by the current time.
    pub fn new(config: &Config) -> Result<Self> {
        let Config {
            ref training,
            ref evaluation,
            ref logging,
        } = *config;

        let epoch_trainer = EpochTrainerInit {
            accumulation_steps: training.accumulation_steps,
            clip_max_norm: training.clip_max_norm.map(|max_norm| max_norm.raw()),
            print_freq: training.print_freq,
        }
        .build()?;
        let evaluator = EvaluatorInit {
            score_threshold: evaluation.score_threshold.raw(),
            collect_visualization: evaluation.collect_visualization,
            print_freq: evaluation.print_freq,
        }
        .build()?;
        let lr_scheduler = LrScheduler::new(&training.lr_schedule)?;
        let output_dir = logging
            .dir
            .join(Local::now().format(FILE_STRFTIME).to_string());

        Ok(Self {
            epochs: training.epochs,
            checkpoint_interval: training.checkpoint_interval.get(),
            load_checkpoint: training.load_checkpoint.clone(),
            logging_dir: logging.dir.clone(),
            output_dir,
            epoch_trainer,
            evaluator,
            lr_scheduler,
        })
    }

    /// The directory of `log.txt` and checkpoints of this run.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn epoch_trainer(&self) -> &EpochTrainer {
        &self.epoch_trainer
    }

    /// Trains until the configured number of epochs, resuming after the
    /// epoch of a loaded checkpoint.
    ///
    /// `train_data` is called with the epoch number to produce the stream
    /// of that epoch.
    pub fn fit<M, C, O, F, D>(
        &mut self,
        ctx: &mut EngineContext<'_, M, C>,
        optimizer: &mut O,
        mut train_data: F,
        mut validation: Option<&mut Validation<'_, M::Input, M::Output>>,
    ) -> Result<Vec<EpochLog>>
    where
        M: Model,
        C: Criterion<M::Output>,
        O: Optimizer + Checkpoint,
        F: FnMut(usize) -> Result<D>,
        D: IntoIterator<Item = Result<Batch<M::Input>>>,
        D::IntoIter: ExactSizeIterator,
    {
        let is_main_process = ctx.group.is_main_process();
        let checkpoint_dir = self.output_dir.join("checkpoints");
        if is_main_process {
            fs::create_dir_all(&checkpoint_dir).with_context(|| {
                format!("failed to create '{}'", checkpoint_dir.display())
            })?;
        }

        let start_epoch =
            match utils::try_load_checkpoint(optimizer, &self.logging_dir, &self.load_checkpoint)?
            {
                Some(CheckpointFile {
                    epoch: Some(epoch),
                    ..
                }) => epoch + 1,
                _ => 0,
            };
        if start_epoch >= self.epochs {
            warn!(
                "training already finished at epoch {}, nothing to do",
                start_epoch
            );
        }

        let mut history = vec![];

        for epoch in start_epoch..self.epochs {
            optimizer.set_learning_rate(self.lr_scheduler.lr_at(epoch));

            let data = train_data(epoch)?.into_iter();
            if epoch == start_epoch && start_epoch > 0 && self.epoch_trainer.update_step() == 0 {
                // resume the sink step as if earlier epochs had the same length
                let steps_per_epoch =
                    (data.len() + self.epoch_trainer.accumulation_steps() - 1)
                        / self.epoch_trainer.accumulation_steps();
                self.epoch_trainer
                    .set_update_step(start_epoch * steps_per_epoch);
            }
            let train = self
                .epoch_trainer
                .train_one_epoch(ctx, optimizer, data, epoch)?;

            let is_last = epoch + 1 == self.epochs;
            if is_main_process && ((epoch + 1) % self.checkpoint_interval == 0 || is_last) {
                let loss = train.get("loss").copied().unwrap_or(f64::NAN);
                utils::save_checkpoint(&*optimizer, &checkpoint_dir, epoch, loss)?;
            }

            let (test, visualizations, catalog) = match validation.as_deref_mut() {
                Some(validation) => {
                    let EvaluationOutput {
                        stats,
                        visualizations,
                    } = self.validate(ctx, validation)?;
                    (Some(stats), visualizations, validation.catalog)
                }
                None => (None, IndexMap::new(), None),
            };

            let log = EpochLog { epoch, train, test };
            if is_main_process {
                self.append_log(&log)?;
                report(
                    ctx.sink,
                    self.epoch_trainer.update_step() as i64,
                    &log,
                    &visualizations,
                    catalog,
                );
            }
            history.push(log);
        }

        Ok(history)
    }

    fn validate<M, C>(
        &self,
        ctx: &mut EngineContext<'_, M, C>,
        validation: &mut Validation<'_, M::Input, M::Output>,
    ) -> Result<EvaluationOutput>
    where
        M: Model,
        C: Criterion<M::Output>,
    {
        let mut evaluators = (validation.new_evaluators)()?;
        let mut evaluators = evaluators
            .iter_mut()
            .map(|evaluator| &mut **evaluator as &mut dyn IncrementalEvaluator)
            .collect_vec();
        let data = (validation.data)()?;

        self.evaluator.evaluate(
            ctx,
            validation.postprocessors,
            data,
            &mut evaluators,
            validation.catalog,
        )
    }

    fn append_log(&self, log: &EpochLog) -> Result<()> {
        let path = self.output_dir.join("log.txt");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open '{}'", path.display()))?;
        writeln!(file, "{}", log.to_json()?)?;
        Ok(())
    }
}

fn report(
    sink: &dyn ExperimentSink,
    step: i64,
    log: &EpochLog,
    visualizations: &IndexMap<i64, ImagePredictions>,
    catalog: Option<&dyn ImageCatalog>,
) {
    sink.log_scalars(step, &log.scalars());

    let catalog = match catalog {
        Some(catalog) => catalog,
        None => return,
    };
    for (&image_id, predictions) in visualizations {
        match catalog.image_path(image_id) {
            Ok(image_path) => sink.log_boxes(step, PREDICTIONS_TAG, &image_path, predictions),
            Err(err) => warn!("skip visualization of image {}: {:?}", image_id, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{
            EvaluationConfig, LearningRateSchedule, LoggingConfig, OptimizerConfig,
            TrainingConfig,
        },
        evaluate::tests::{image_catalog, FixedBoxes},
        evaluator::{tests::RecordingCoco, CocoEvaluator, IouType},
        train::tests::{batches, CountingModel, CountingOptimizer, RecordingSink, ScriptedCriterion},
        utils::parse_checkpoint_filename,
    };
    use approx::assert_abs_diff_eq;
    use process_group::SingleProcess;

    impl Checkpoint for CountingOptimizer {
        fn save_checkpoint(&self, path: &Path) -> Result<()> {
            fs::write(path, self.steps.to_string())?;
            Ok(())
        }

        fn load_checkpoint(&mut self, path: &Path) -> Result<()> {
            self.steps = fs::read_to_string(path)?.parse()?;
            Ok(())
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "detr-train-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config(logging_dir: &Path, epochs: usize, load_checkpoint: LoadCheckpoint) -> Config {
        Config {
            training: TrainingConfig {
                epochs,
                accumulation_steps: NonZeroUsize::new(8).unwrap(),
                clip_max_norm: None,
                print_freq: 10,
                lr_schedule: LearningRateSchedule::StepWise {
                    steps: vec![(0, r64(1e-4)), (2, r64(1e-5))],
                },
                optimizer: OptimizerConfig {
                    momentum: r64(0.9),
                    weight_decay: r64(1e-4),
                },
                checkpoint_interval: NonZeroUsize::new(2).unwrap(),
                load_checkpoint,
                device: Device::Cpu,
            },
            evaluation: EvaluationConfig::default(),
            logging: LoggingConfig {
                dir: logging_dir.to_owned(),
                enable_images: false,
            },
        }
    }

    fn checkpoint_epochs(dir: &Path) -> Vec<usize> {
        let mut epochs = fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| {
                let name = entry.ok()?.file_name();
                parse_checkpoint_filename(name.to_str()?).map(|(_, epoch)| epoch)
            })
            .collect_vec();
        epochs.sort_unstable();
        epochs
    }

    #[test]
    fn epochs_are_trained_evaluated_and_logged() -> Result<()> {
        let logging_dir = scratch_dir("fit");
        let catalog = image_catalog("fit-images")?;
        let postprocessors = PostProcessors::new(FixedBoxes);
        let mut trainer = Trainer::new(&config(&logging_dir, 3, LoadCheckpoint::Disabled))?;

        let mut model = CountingModel::default();
        // 3 epochs of 10 training and 1 validation micro-batches
        let mut criterion = ScriptedCriterion::constant(33, 1.0, 2.0);
        let mut optimizer = CountingOptimizer::default();
        let sink = RecordingSink::default();
        let mut validation = Validation {
            postprocessors: &postprocessors,
            catalog: Some(&catalog),
            data: Box::new(|| Ok(Box::new(batches(1).into_iter()) as BatchStream<'_, Tensor>)),
            new_evaluators: Box::new(|| {
                let coco = CocoEvaluator::new(RecordingCoco::default(), [IouType::Bbox])?;
                Ok(vec![Box::new(coco) as Box<dyn IncrementalEvaluator>])
            }),
        };

        let mut ctx = EngineContext {
            model: &mut model,
            criterion: &mut criterion,
            device: Device::Cpu,
            group: &SingleProcess,
            sink: &sink,
        };
        let history = trainer.fit(
            &mut ctx,
            &mut optimizer,
            |_epoch| Ok(batches(10)),
            Some(&mut validation),
        )?;

        assert_eq!(history.iter().map(|log| log.epoch).collect_vec(), [0, 1, 2]);
        assert_eq!(optimizer.steps, 6);
        assert_abs_diff_eq!(optimizer.lr, 1e-5);
        assert_eq!(trainer.epoch_trainer().update_step(), 6);

        // every second epoch and the last one
        let checkpoint_dir = trainer.output_dir().join("checkpoints");
        assert_eq!(checkpoint_epochs(&checkpoint_dir), [1, 2]);

        let text = fs::read_to_string(trainer.output_dir().join("log.txt"))?;
        let lines = text
            .lines()
            .map(serde_json::from_str::<serde_json::Value>)
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(lines.len(), 3);
        for (epoch, line) in lines.iter().enumerate() {
            assert_eq!(line["epoch"], epoch);
            assert_eq!(line["train_loss"], 11.0);
            assert_eq!(line["test_loss"], 11.0);
            assert_eq!(line["test_coco_eval_bbox"].as_array().map(Vec::len), Some(12));
        }

        // 2 updates and 1 summary per epoch
        let steps = sink.scalar_steps();
        assert_eq!(steps, [1, 2, 2, 3, 4, 4, 5, 6, 6]);
        assert_eq!(sink.scalar(8, "epoch"), Some(2.0));
        assert_eq!(sink.scalar(8, "test_coco_eval_bbox/0"), Some(0.42));

        let boxes = sink.boxes.lock().unwrap();
        assert_eq!(boxes.len(), 6);
        assert!(boxes.iter().all(|(_, tag, _, _)| tag == PREDICTIONS_TAG));
        assert!(boxes[0].2.ends_with("000000000000.png"));
        Ok(())
    }

    #[test]
    fn training_resumes_after_recent_checkpoint() -> Result<()> {
        let logging_dir = scratch_dir("resume");
        let sink = RecordingSink::default();

        {
            let mut trainer = Trainer::new(&config(&logging_dir, 2, LoadCheckpoint::Disabled))?;
            let mut model = CountingModel::default();
            let mut criterion = ScriptedCriterion::constant(20, 1.0, 2.0);
            let mut optimizer = CountingOptimizer::default();
            let mut ctx = EngineContext {
                model: &mut model,
                criterion: &mut criterion,
                device: Device::Cpu,
                group: &SingleProcess,
                sink: &sink,
            };
            trainer.fit(&mut ctx, &mut optimizer, |_| Ok(batches(10)), None)?;
            assert_eq!(optimizer.steps, 4);
        }
        std::thread::sleep(Duration::from_millis(10));

        let mut trainer = Trainer::new(&config(&logging_dir, 3, LoadCheckpoint::FromRecent))?;
        let mut model = CountingModel::default();
        let mut criterion = ScriptedCriterion::constant(10, 1.0, 2.0);
        let mut optimizer = CountingOptimizer::default();
        let mut ctx = EngineContext {
            model: &mut model,
            criterion: &mut criterion,
            device: Device::Cpu,
            group: &SingleProcess,
            sink: &sink,
        };
        let mut requested = vec![];
        let history = trainer.fit(
            &mut ctx,
            &mut optimizer,
            |epoch| {
                requested.push(epoch);
                Ok(batches(10))
            },
            None,
        )?;

        assert_eq!(requested, [2]);
        assert_eq!(history.len(), 1);
        assert!(history[0].test.is_none());
        // the restored parameters continue from 4 updates
        assert_eq!(optimizer.steps, 6);
        assert_eq!(trainer.epoch_trainer().update_step(), 6);
        assert_abs_diff_eq!(optimizer.lr, 1e-5);
        Ok(())
    }

    #[test]
    fn unnamed_checkpoint_file_starts_from_first_epoch() -> Result<()> {
        let logging_dir = scratch_dir("unnamed-checkpoint");
        let file = logging_dir.join("pretrained.ckpt");
        fs::write(&file, "0")?;

        let mut trainer = Trainer::new(&config(
            &logging_dir,
            2,
            LoadCheckpoint::FromFile { file },
        ))?;
        let mut model = CountingModel::default();
        let mut criterion = ScriptedCriterion::constant(20, 1.0, 2.0);
        let mut optimizer = CountingOptimizer::default();
        let sink = RecordingSink::default();
        let mut ctx = EngineContext {
            model: &mut model,
            criterion: &mut criterion,
            device: Device::Cpu,
            group: &SingleProcess,
            sink: &sink,
        };
        let mut requested = vec![];
        let history = trainer.fit(
            &mut ctx,
            &mut optimizer,
            |epoch| {
                requested.push(epoch);
                Ok(batches(10))
            },
            None,
        )?;

        assert_eq!(requested, [0, 1]);
        assert_eq!(history.len(), 2);
        assert_eq!(optimizer.steps, 4);
        assert_eq!(trainer.epoch_trainer().update_step(), 4);
        Ok(())
    }

    #[test]
    fn epoch_log_flattens_stats() -> Result<()> {
        let log = EpochLog {
            epoch: 4,
            train: [("loss".to_string(), 1.5)].into_iter().collect(),
            test: Some(
                [
                    ("loss".to_string(), StatValue::Scalar(2.5)),
                    ("coco_eval_bbox".to_string(), StatValue::List(vec![0.1, 0.2])),
                ]
                .into_iter()
                .collect(),
            ),
        };

        let json = log.to_json()?;
        assert_eq!(
            json,
            serde_json::json!({
                "train_loss": 1.5,
                "test_loss": 2.5,
                "test_coco_eval_bbox": [0.1, 0.2],
                "epoch": 4,
            })
        );

        let names = log.scalars().into_iter().map(|(name, _)| name).collect_vec();
        assert_eq!(
            names,
            [
                "train_loss",
                "test_loss",
                "test_coco_eval_bbox/0",
                "test_coco_eval_bbox/1",
                "epoch"
            ]
        );
        Ok(())
    }
}
