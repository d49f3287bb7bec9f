use std::num::NonZeroUsize;

use crate::error::{Result, TrainErr};

/// Strongly typed training configuration, constructed once at process start
/// and passed into each component. Every field is validated up front; there
/// is no ambient global lookup.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub betas: (f64, f64),
    pub epsilon: f64,
    pub weight_decay: f64,
    /// Debias the moment estimates by `1 - beta^t`.
    pub bias_correction: bool,
    /// Force the trust ratio to 1, turning the optimizer into plain Adam.
    /// Useful for comparison runs.
    pub plain_adam: bool,
    /// Micro-batches per optimizer step.
    pub accumulation_frequency: NonZeroUsize,
    pub ranks_per_node: NonZeroUsize,
    /// Use the two-level reducer instead of the flat all-reduce on sync.
    pub hierarchical: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            betas: (0.9, 0.999),
            epsilon: 1e-6,
            weight_decay: 0.0,
            bias_correction: true,
            plain_adam: false,
            accumulation_frequency: NonZeroUsize::new(1).expect("1 is non-zero"),
            ranks_per_node: NonZeroUsize::new(1).expect("1 is non-zero"),
            hierarchical: false,
        }
    }
}

impl TrainingConfig {
    /// Checks every hyperparameter range.
    ///
    /// # Returns
    /// `Ok(())`, or the first `InvalidHyperparameter` found. Callers must not
    /// proceed after an error.
    pub fn validate(&self) -> Result<()> {
        if !self.learning_rate.is_finite() || self.learning_rate < 0.0 {
            return Err(TrainErr::InvalidHyperparameter {
                name: "learning_rate",
                value: self.learning_rate,
            });
        }

        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(TrainErr::InvalidHyperparameter {
                name: "epsilon",
                value: self.epsilon,
            });
        }

        let (beta1, beta2) = self.betas;
        if !beta1.is_finite() || !(0.0..1.0).contains(&beta1) {
            return Err(TrainErr::InvalidHyperparameter {
                name: "beta1",
                value: beta1,
            });
        }
        if !beta2.is_finite() || !(0.0..1.0).contains(&beta2) {
            return Err(TrainErr::InvalidHyperparameter {
                name: "beta2",
                value: beta2,
            });
        }

        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(TrainErr::InvalidHyperparameter {
                name: "weight_decay",
                value: self.weight_decay,
            });
        }

        Ok(())
    }
}
