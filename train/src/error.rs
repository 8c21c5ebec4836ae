//! Errors that end a training run.

use crate::common::*;

/// The averaged training loss became NaN or infinite.
///
/// Training cannot recover from this state. The process should exit with
/// [NonFiniteLoss::EXIT_CODE].
#[derive(Debug, Clone, thiserror::Error)]
#[error("loss is {loss}, stopping training at epoch {epoch}, step {step}")]
pub struct NonFiniteLoss {
    pub epoch: usize,
    /// The micro-batch index within the epoch.
    pub step: usize,
    /// The weighted total averaged over workers.
    pub loss: f64,
    /// Every reduced loss term before weighting.
    pub losses: IndexMap<String, f64>,
}

impl NonFiniteLoss {
    pub const EXIT_CODE: i32 = 1;
}

/// The process exit code demanded by `err`, if any.
///
/// Returns [NonFiniteLoss::EXIT_CODE] when the error or one of its contexts
/// is a [NonFiniteLoss].
pub fn exit_code(err: &Error) -> Option<i32> {
    err.downcast_ref::<NonFiniteLoss>().map(|_| NonFiniteLoss::EXIT_CODE)
}
