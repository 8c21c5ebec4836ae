//! Gradient-accumulated training over one epoch.

use crate::{
    batch::Batch,
    common::*,
    context::EngineContext,
    error::NonFiniteLoss,
    loss::{weighted_total, ReducedLosses, ScalarLoss, CLASS_ERROR},
    model::{Criterion, Model},
    optim::Optimizer,
};

/// The [EpochTrainer] initializer.
#[derive(Debug, Clone)]
pub struct EpochTrainerInit {
    /// The number of micro-batches per optimizer step.
    pub accumulation_steps: NonZeroUsize,
    /// Clip gradients to this total norm if set and positive.
    pub clip_max_norm: Option<f64>,
    pub print_freq: usize,
}

impl Default for EpochTrainerInit {
    fn default() -> Self {
        Self {
            accumulation_steps: NonZeroUsize::new(8).unwrap(),
            clip_max_norm: None,
            print_freq: 10,
        }
    }
}

impl EpochTrainerInit {
    pub fn build(self) -> Result<EpochTrainer> {
        let Self {
            accumulation_steps,
            clip_max_norm,
            print_freq,
        } = self;

        if let Some(max_norm) = clip_max_norm {
            ensure!(
                max_norm.is_finite() && max_norm >= 0.0,
                "clip_max_norm must be a non-negative number, but get {}",
                max_norm
            );
        }

        Ok(EpochTrainer {
            accumulation_steps: accumulation_steps.get(),
            clip_max_norm: clip_max_norm.filter(|&max_norm| max_norm > 0.0),
            print_freq,
            update_step: 0,
        })
    }
}

/// Runs training epochs, summing gradients over micro-batches before each
/// optimizer step.
///
/// The trainer counts optimizer steps across epochs. The count is the step
/// of the records sent to the experiment sink.
#[derive(Debug)]
pub struct EpochTrainer {
    accumulation_steps: usize,
    clip_max_norm: Option<f64>,
    print_freq: usize,
    update_step: usize,
}

impl EpochTrainer {
    pub fn accumulation_steps(&self) -> usize {
        self.accumulation_steps
    }

    /// The number of optimizer steps taken so far.
    pub fn update_step(&self) -> usize {
        self.update_step
    }

    pub fn set_update_step(&mut self, update_step: usize) {
        self.update_step = update_step;
    }

    /// Trains on every micro-batch of `data` and returns the metrics averaged
    /// over the epoch and over all workers.
    ///
    /// The losses of each micro-batch are back-propagated with a factor of
    /// `1 / accumulation_steps`. The optimizer steps after every
    /// `accumulation_steps` micro-batches and after the last one. The run
    /// fails with [NonFiniteLoss] before any backward pass once the
    /// averaged loss diverges. Since that value is averaged over workers,
    /// every worker stops at the same micro-batch.
    pub fn train_one_epoch<M, C, O, D>(
        &mut self,
        ctx: &mut EngineContext<'_, M, C>,
        optimizer: &mut O,
        data: D,
        epoch: usize,
    ) -> Result<IndexMap<String, f64>>
    where
        M: Model,
        C: Criterion<M::Output>,
        O: Optimizer + ?Sized,
        D: IntoIterator<Item = Result<Batch<M::Input>>>,
        D::IntoIter: ExactSizeIterator,
    {
        let Self {
            accumulation_steps,
            clip_max_norm,
            print_freq,
            ref mut update_step,
        } = *self;
        let EngineContext {
            ref mut model,
            ref mut criterion,
            device,
            group,
            sink,
        } = *ctx;

        let data = data.into_iter();
        let num_batches = data.len();
        let is_main_process = group.is_main_process();
        let header = format!("Epoch: [{}]", epoch);

        let mut logger = MetricLogger::new("  ");
        logger.add_meter("lr", MeterConfig::latest(6));
        logger.add_meter(CLASS_ERROR, MeterConfig::latest(2));

        logger.log_every(data, print_freq, &header, |logger, step, batch| {
            let (samples, targets) = batch?.into_device(device);

            let outputs = model.forward_t(&samples, true)?;
            let losses = criterion.forward(&outputs, &targets)?;
            let weight_dict = criterion.weight_dict();
            let total = weighted_total(&losses, weight_dict).ok_or_else(|| {
                format_err!(
                    "none of the loss terms {:?} has a weight",
                    losses.keys().collect_vec()
                )
            })?;

            let reduced = ReducedLosses::reduce(&losses, weight_dict, group)?;
            if !reduced.total.is_finite() {
                error!("Loss is {}, stopping training", reduced.total);
                error!("{:?}", reduced.reduced);
                return Err(NonFiniteLoss {
                    epoch,
                    step,
                    loss: reduced.total,
                    losses: reduced.reduced,
                }
                .into());
            }
            let class_error = reduced.class_error()?;

            total.scale(1.0 / accumulation_steps as f64).backward()?;

            if is_update_boundary(step, num_batches, accumulation_steps) {
                let grad_norm = match clip_max_norm {
                    Some(max_norm) => optimizer.clip_grad_norm(max_norm)?,
                    None => optimizer.grad_norm()?,
                };
                optimizer.step()?;
                optimizer.zero_grad();
                *update_step += 1;

                if is_main_process {
                    let unscaled_terms = reduced
                        .reduced
                        .iter()
                        .filter(|(name, _)| *name != CLASS_ERROR)
                        .map(|(name, &value)| (name.clone(), value));
                    let scalars = [
                        ("lr", optimizer.learning_rate()),
                        (CLASS_ERROR, class_error),
                        ("grad_norm", grad_norm),
                        ("loss", reduced.total),
                    ]
                    .into_iter()
                    .map(|(name, value)| (name.to_string(), value))
                    .chain(unscaled_terms)
                    .collect_vec();
                    sink.log_scalars(*update_step as i64, &scalars);
                }
            }

            logger.update_all(reduced.meter_values());
            logger.update(CLASS_ERROR, class_error);
            logger.update("lr", optimizer.learning_rate());
            Ok(())
        })?;

        let synced = logger.synchronize_between_processes(group)?;
        info!("Averaged stats: {}", synced);
        Ok(synced.global_averages())
    }
}

/// Tells whether the optimizer steps after micro-batch `step`.
pub fn is_update_boundary(step: usize, num_batches: usize, accumulation_steps: usize) -> bool {
    (step + 1) % accumulation_steps == 0 || step + 1 == num_batches
}
