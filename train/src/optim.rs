//! The optimizer seam and its libtorch implementation.

use crate::{common::*, config::OptimizerConfig};

/// Updates model parameters from accumulated gradients.
pub trait Optimizer {
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// The 2-norm of all parameter gradients taken together.
    fn grad_norm(&self) -> Result<f64>;

    /// Rescales the gradients so that their total 2-norm does not exceed
    /// `max_norm`, returning the norm before clipping. A non-finite norm is
    /// returned rather than rejected.
    fn clip_grad_norm(&mut self, max_norm: f64) -> Result<f64>;

    fn step(&mut self) -> Result<()>;

    fn zero_grad(&mut self);
}

/// Persists and restores the optimized parameters.
pub trait Checkpoint {
    fn save_checkpoint(&self, path: &Path) -> Result<()>;

    fn load_checkpoint(&mut self, path: &Path) -> Result<()>;
}

/// Adam over the trainable variables of a [VarStore](nn::VarStore).
pub struct TchOptimizer {
    vs: nn::VarStore,
    optimizer: nn::Optimizer,
    lr: f64,
}

impl TchOptimizer {
    pub fn new(vs: nn::VarStore, config: &OptimizerConfig, lr: f64) -> Result<Self> {
        let OptimizerConfig {
            momentum,
            weight_decay,
        } = *config;
        ensure!(lr >= 0.0, "the lr must be non-negative");

        let optimizer = nn::Adam {
            beta1: momentum.raw(),
            beta2: 0.999,
            wd: weight_decay.raw(),
            ..Default::default()
        }
        .build(&vs, lr)?;

        Ok(Self { vs, optimizer, lr })
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    fn gradients(&self) -> impl Iterator<Item = Tensor> {
        self.vs
            .trainable_variables()
            .into_iter()
            .map(|var| var.grad())
            .filter(|grad| grad.defined())
    }
}

impl Debug for TchOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TchOptimizer")
            .field("device", &self.vs.device())
            .field("lr", &self.lr)
            .finish()
    }
}

impl Optimizer for TchOptimizer {
    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_lr(lr);
        self.lr = lr;
    }

    fn grad_norm(&self) -> Result<f64> {
        let sum_squares: f64 = tch::no_grad(|| {
            self.gradients()
                .map(|grad| f64::from(&grad.norm()).powi(2))
                .sum()
        });
        Ok(sum_squares.sqrt())
    }

    fn clip_grad_norm(&mut self, max_norm: f64) -> Result<f64> {
        ensure!(max_norm > 0.0, "max_norm must be positive");
        let total_norm = self.grad_norm()?;

        let coef = max_norm / (total_norm + 1e-6);
        if coef < 1.0 {
            tch::no_grad(|| {
                for mut grad in self.gradients() {
                    let scaled = &grad * coef;
                    grad.copy_(&scaled);
                }
            });
        }

        Ok(total_norm)
    }

    fn step(&mut self) -> Result<()> {
        self.optimizer.step();
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.optimizer.zero_grad();
    }
}

impl Checkpoint for TchOptimizer {
    fn save_checkpoint(&self, path: &Path) -> Result<()> {
        self.vs
            .save(path)
            .with_context(|| format!("failed to save '{}'", path.display()))?;
        Ok(())
    }

    fn load_checkpoint(&mut self, path: &Path) -> Result<()> {
        let missing = self
            .vs
            .load_partial(path)
            .with_context(|| format!("failed to load '{}'", path.display()))?;
        if !missing.is_empty() {
            warn!("variables missing in checkpoint: {:?}", missing);
        }
        Ok(())
    }
}
