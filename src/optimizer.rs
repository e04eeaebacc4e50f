//! `AdamW` over the trainable adapter variables.

use candle_core::backprop::GradStore;
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::config::TrainingArguments;
use crate::error::{Result, TuneError};

/// Optimizer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-4,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.001,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Settings for `args`. Every accepted `optim` name (`adamw_*`,
    /// `paged_adamw_*`) runs as plain 32-bit `AdamW`.
    #[must_use]
    pub fn from_training(args: &TrainingArguments) -> Self {
        if args.optim != "adamw_torch" && args.optim != "adamw_hf" {
            tracing::debug!("optim '{}' runs as AdamW", args.optim);
        }
        Self {
            learning_rate: args.learning_rate,
            weight_decay: args.weight_decay,
            ..Self::default()
        }
    }

    /// Create `AdamW` over every variable in `varmap`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build_adamw(&self, varmap: &VarMap) -> Result<AdamWOptimizer> {
        let params = ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        };
        let inner = candle_nn::AdamW::new(varmap.all_vars(), params)
            .map_err(|e| TuneError::Training(format!("Failed to create AdamW: {e}")))?;
        Ok(AdamWOptimizer { inner })
    }
}

/// `AdamW` optimizer wrapper.
pub struct AdamWOptimizer {
    inner: candle_nn::AdamW,
}

impl AdamWOptimizer {
    /// Apply accumulated gradients.
    ///
    /// # Errors
    ///
    /// Returns an error if the step fails.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.inner
            .step(grads)
            .map_err(|e| TuneError::Training(format!("Optimizer step failed: {e}")))
    }

    /// Current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }
}
