//! Loss terms, their weighting, and their cross-worker read-out.

use crate::common::*;

/// The name of the classification error entry reported by criteria.
pub const CLASS_ERROR: &str = "class_error";

/// Suffix of the unweighted copies of loss terms in logged metrics.
pub const UNSCALED_SUFFIX: &str = "_unscaled";

/// Named loss terms computed on one micro-batch.
pub type LossDict<L> = IndexMap<String, L>;

/// The weight of each loss term that contributes to the optimized total.
pub type WeightDict = IndexMap<String, f64>;

/// A differentiable scalar.
pub trait ScalarLoss: Sized {
    /// Reads the scalar to the host.
    fn value(&self) -> f64;

    fn scale(&self, factor: f64) -> Self;

    fn plus(&self, other: &Self) -> Self;

    /// Accumulates the gradients of this scalar into the parameters that
    /// produced it.
    fn backward(&self) -> Result<()>;
}

impl ScalarLoss for Tensor {
    fn value(&self) -> f64 {
        f64::from(self)
    }

    fn scale(&self, factor: f64) -> Self {
        self * factor
    }

    fn plus(&self, other: &Self) -> Self {
        self + other
    }

    fn backward(&self) -> Result<()> {
        ensure!(
            self.numel() == 1,
            "expect a scalar loss, but get shape {:?}",
            self.size()
        );
        ensure!(self.requires_grad(), "the loss is detached from the graph");
        Tensor::backward(self);
        Ok(())
    }
}

/// Sums `loss × weight` over the terms that have a weight.
///
/// Terms without a weight, such as the classification error, do not
/// contribute. Returns `None` when no term is weighted.
pub fn weighted_total<L>(losses: &LossDict<L>, weights: &WeightDict) -> Option<L>
where
    L: ScalarLoss,
{
    losses
        .iter()
        .filter_map(|(name, loss)| Some(loss.scale(*weights.get(name)?)))
        .reduce(|lhs, rhs| lhs.plus(&rhs))
}

/// Loss terms averaged over every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedLosses {
    /// Every averaged term as reported by the criterion.
    pub reduced: IndexMap<String, f64>,
    /// Weighted terms, restricted to terms having a weight.
    pub scaled: IndexMap<String, f64>,
    /// Unweighted terms under `{name}_unscaled` names.
    pub unscaled: IndexMap<String, f64>,
    /// The sum of the weighted terms.
    pub total: f64,
}

impl ReducedLosses {
    /// Reads the local loss terms and averages them over the group.
    ///
    /// This is a collective. Every worker must call it with the same term
    /// names.
    pub fn reduce<L>(
        losses: &LossDict<L>,
        weights: &WeightDict,
        group: &dyn ProcessGroup,
    ) -> Result<Self>
    where
        L: ScalarLoss,
    {
        let local: IndexMap<_, _> = losses
            .iter()
            .map(|(name, loss)| (name.clone(), loss.value()))
            .collect();
        let reduced = group.reduce_mean_dict(&local)?;
        Ok(Self::new(reduced, weights))
    }

    pub fn new(reduced: IndexMap<String, f64>, weights: &WeightDict) -> Self {
        let scaled: IndexMap<_, _> = reduced
            .iter()
            .filter_map(|(name, &value)| Some((name.clone(), value * weights.get(name)?)))
            .collect();
        let unscaled = reduced
            .iter()
            .map(|(name, &value)| (format!("{}{}", name, UNSCALED_SUFFIX), value))
            .collect();
        let total = scaled.values().sum();

        Self {
            reduced,
            scaled,
            unscaled,
            total,
        }
    }

    pub fn class_error(&self) -> Result<f64> {
        self.reduced
            .get(CLASS_ERROR)
            .copied()
            .ok_or_else(|| format_err!("the criterion does not report '{}'", CLASS_ERROR))
    }

    /// The entries recorded in the metric logger, namely the total under
    /// `loss`, the weighted terms and the unweighted terms.
    pub fn meter_values(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        let scaled = self
            .scaled
            .iter()
            .map(|(name, &value)| (name.as_str(), value));
        let unscaled = self
            .unscaled
            .iter()
            .map(|(name, &value)| (name.as_str(), value));
        iter::once(("loss", self.total)).chain(scaled).chain(unscaled)
    }
}
