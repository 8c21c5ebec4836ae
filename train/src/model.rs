//! The collaborators driven by the training and evaluation loops.

use crate::{
    batch::Target,
    common::*,
    loss::{LossDict, ScalarLoss, WeightDict},
};

/// The detector.
pub trait Model {
    type Input: TensorLike;
    type Output;

    /// Runs the network, in training mode if `train` is set.
    fn forward_t(&mut self, input: &Self::Input, train: bool) -> Result<Self::Output>;
}

/// Matches model outputs to targets and computes named loss terms.
///
/// Besides the optimized terms, the loss dictionary must carry a
/// `class_error` entry, which is logged but never weighted.
pub trait Criterion<O> {
    type Loss: ScalarLoss;

    fn forward(&mut self, outputs: &O, targets: &[Target]) -> Result<LossDict<Self::Loss>>;

    /// The weight of each optimized term.
    fn weight_dict(&self) -> &WeightDict;
}
