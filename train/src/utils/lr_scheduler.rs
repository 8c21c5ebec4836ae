use crate::{common::*, config::LearningRateSchedule};

/// Maps an epoch to its learning rate.
#[derive(Debug, Clone)]
pub enum LrScheduler {
    Constant { lr: R64 },
    StepWise { steps: Vec<(usize, R64)> },
}

impl LrScheduler {
    pub fn new(config: &LearningRateSchedule) -> Result<Self> {
        let scheduler = match *config {
            LearningRateSchedule::Constant { lr } => {
                ensure!(lr >= 0.0, "the lr must be non-negative");
                Self::Constant { lr }
            }
            LearningRateSchedule::StepWise { ref steps } => {
                ensure!(
                    !steps.is_empty() && steps[0].0 == 0,
                    "the steps must start from zero"
                );
                ensure!(
                    steps.iter().tuple_windows().all(|(prev, next)| next.0 > prev.0),
                    "the steps must be monotonic"
                );
                ensure!(
                    steps.iter().all(|(_, lr)| lr.raw() > 0.0),
                    "lr must be positive"
                );

                Self::StepWise {
                    steps: steps.clone(),
                }
            }
        };

        Ok(scheduler)
    }

    /// The learning rate in effect during `epoch`.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        match self {
            Self::Constant { lr } => lr.raw(),
            Self::StepWise { steps } => {
                let index = match steps.binary_search_by_key(&epoch, |(start, _lr)| *start) {
                    Ok(index) => index,
                    Err(index) => index.saturating_sub(1),
                };
                steps[index].1.raw()
            }
        }
    }
}
