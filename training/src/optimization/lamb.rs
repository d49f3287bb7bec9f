//! Trust-ratio optimizer (LAMB).
//!
//! You et al., "Large Batch Optimization for Deep Learning: Training BERT in
//! 76 Minutes", 2020. Adam-style moment estimates, with each parameter's
//! update rescaled by the ratio of parameter norm to raw-update norm, which
//! bounds the step size relative to the parameter's magnitude and keeps very
//! large effective batches stable.

use std::collections::HashMap;

use log::debug;

use crate::{
    config::TrainingConfig,
    error::{Result, TrainErr},
    param::{Gradient, ParamState, Parameter},
};

use super::Optimizer;

/// LAMB optimizer with per-parameter trust ratios.
///
/// State is keyed by parameter name and created lazily on the first step
/// that sees a gradient for that parameter. Moments always live in f32; a
/// reduced-precision parameter is updated through its fp32 shadow copy and
/// re-cast after each step.
pub struct Lamb {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    weight_decay: f64,
    bias_correction: bool,
    plain_adam: bool,
    state: HashMap<String, ParamState>,
}

impl Lamb {
    /// Creates the optimizer from a validated configuration.
    ///
    /// # Arguments
    /// * `config` - The training configuration; hyperparameter ranges are
    ///   re-checked here so the optimizer cannot be built from a bad config.
    ///
    /// # Returns
    /// A new `Lamb`, or `InvalidHyperparameter`.
    pub fn new(config: &TrainingConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            learning_rate: config.learning_rate,
            beta1: config.betas.0,
            beta2: config.betas.1,
            epsilon: config.epsilon,
            weight_decay: config.weight_decay,
            bias_correction: config.bias_correction,
            plain_adam: config.plain_adam,
            state: HashMap::new(),
        })
    }

    /// Returns the optimizer state for `name`, if a step has touched it.
    pub fn state(&self, name: &str) -> Option<&ParamState> {
        self.state.get(name)
    }

    fn step_param(&mut self, param: &mut Parameter) -> Result<()> {
        let grad = match param.grad() {
            None => return Ok(()),
            Some(Gradient::Sparse { .. }) => {
                return Err(TrainErr::UnsupportedGradientLayout {
                    param: param.name().to_string(),
                });
            }
            Some(Gradient::Dense(g)) => g.clone(),
        };

        if grad.len() != param.len() {
            return Err(TrainErr::GradientSizeMismatch {
                param: param.name().to_string(),
                got: grad.len(),
                expected: param.len(),
            });
        }

        let state = self
            .state
            .entry(param.name().to_string())
            .or_insert_with(|| ParamState::init(param));

        // Work in full precision: the shadow copy for bf16 parameters, the
        // stored values otherwise.
        let mut data = match &state.shadow_fp32 {
            Some(shadow) => shadow.clone(),
            None => param.values_f32(),
        };

        state.step_count += 1;
        let t = state.step_count;

        for ((m, v), &g) in state
            .first_moment
            .iter_mut()
            .zip(state.second_moment.iter_mut())
            .zip(&grad)
        {
            *m = (self.beta1 * *m as f64 + (1.0 - self.beta1) * g as f64) as f32;
            *v = (self.beta2 * *v as f64 + (1.0 - self.beta2) * (g as f64) * (g as f64)) as f32;
        }

        let (bc1, bc2) = if self.bias_correction {
            (
                1.0 - self.beta1.powi(t as i32),
                1.0 - self.beta2.powi(t as i32),
            )
        } else {
            (1.0, 1.0)
        };

        let mut update = vec![0.0f32; data.len()];
        for ((u, (&m, &v)), &p) in update
            .iter_mut()
            .zip(state.first_moment.iter().zip(&state.second_moment))
            .zip(&data)
        {
            let m_hat = m as f64 / bc1;
            let v_hat = v as f64 / bc2;
            let mut step = m_hat / (v_hat.sqrt() + self.epsilon);
            if self.weight_decay > 0.0 {
                step += self.weight_decay * p as f64;
            }
            *u = step as f32;
        }

        let trust_ratio = if self.weight_decay > 0.0 {
            let weight_norm = l2_norm(&data);
            let update_norm = l2_norm(&update);

            let ratio = if weight_norm == 0.0 || update_norm == 0.0 || self.plain_adam {
                1.0
            } else {
                weight_norm / update_norm
            };

            state.last_weight_norm = Some(weight_norm);
            state.last_update_norm = Some(update_norm);
            state.last_trust_ratio = Some(ratio);
            ratio
        } else {
            1.0
        };

        let scale = self.learning_rate * trust_ratio;
        for (p, &u) in data.iter_mut().zip(&update) {
            *p = (*p as f64 - scale * u as f64) as f32;
        }

        param.set_from_f32(&data)?;
        if let Some(shadow) = &mut state.shadow_fp32 {
            *shadow = data;
        }

        debug!(
            param = param.name(),
            step = t,
            trust_ratio = trust_ratio;
            "applied optimizer step"
        );

        Ok(())
    }
}

fn l2_norm(values: &[f32]) -> f64 {
    values
        .iter()
        .map(|&v| v as f64 * v as f64)
        .sum::<f64>()
        .sqrt()
}

impl Optimizer for Lamb {
    fn step(&mut self, params: &mut [Parameter]) -> Result<()> {
        for param in params {
            self.step_param(param)?;
        }
        Ok(())
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(weight_decay: f64) -> TrainingConfig {
        TrainingConfig {
            learning_rate: 0.01,
            betas: (0.9, 0.999),
            epsilon: 1e-6,
            weight_decay,
            ..Default::default()
        }
    }

    fn with_grad(values: Vec<f32>, grad: Vec<f32>) -> Parameter {
        let mut p = Parameter::from_f32("w", values);
        p.accumulate_grad(&grad).unwrap();
        p
    }

    #[test]
    fn single_step_scenario() {
        let mut opt = Lamb::new(&config(0.01)).unwrap();
        let mut params = vec![with_grad(vec![1.0, 1.0], vec![0.1, 0.1])];

        opt.step(&mut params).unwrap();

        let state = opt.state("w").unwrap();
        assert_eq!(state.step_count(), 1);

        for v in params[0].values_f32() {
            assert!(v < 1.0, "parameter should shrink, got {v}");
        }

        let trust = state.last_trust_ratio().unwrap();
        assert!(trust > 0.0 && trust < 2.0, "trust ratio out of range: {trust}");
    }

    #[test]
    fn trust_ratio_is_one_without_weight_decay() {
        let mut opt = Lamb::new(&config(0.0)).unwrap();
        let mut params = vec![with_grad(vec![1.0, -2.0], vec![0.3, 0.1])];

        for _ in 0..5 {
            params[0].accumulate_grad(&[0.0, 0.0]).unwrap();
            opt.step(&mut params).unwrap();
        }

        // Norms are only measured when weight decay is active; the applied
        // ratio is 1 by definition.
        assert!(opt.state("w").unwrap().last_trust_ratio().is_none());
    }

    #[test]
    fn zero_parameter_guard() {
        let mut opt = Lamb::new(&config(0.01)).unwrap();
        let mut params = vec![with_grad(vec![0.0, 0.0], vec![0.5, 0.5])];

        opt.step(&mut params).unwrap();

        let state = opt.state("w").unwrap();
        assert_eq!(state.last_weight_norm().unwrap(), 0.0);
        assert_eq!(state.last_trust_ratio().unwrap(), 1.0);
        for v in params[0].values_f32() {
            assert!(v.is_finite());
        }
    }

    #[test]
    fn plain_adam_forces_unit_trust_ratio() {
        let cfg = TrainingConfig {
            plain_adam: true,
            ..config(0.01)
        };
        let mut opt = Lamb::new(&cfg).unwrap();
        let mut params = vec![with_grad(vec![3.0, 4.0], vec![0.1, 0.2])];

        opt.step(&mut params).unwrap();

        let state = opt.state("w").unwrap();
        assert!(state.last_weight_norm().unwrap() > 0.0);
        assert_eq!(state.last_trust_ratio().unwrap(), 1.0);
    }

    #[test]
    fn bias_correction_off_leaves_moments_raw() {
        let cfg = TrainingConfig {
            bias_correction: false,
            learning_rate: 0.0,
            ..config(0.0)
        };
        let mut opt = Lamb::new(&cfg).unwrap();
        let mut params = vec![with_grad(vec![1.0], vec![0.4])];

        opt.step(&mut params).unwrap();

        // m = (1 - beta1) * g exactly, no debiasing division.
        let state = opt.state("w").unwrap();
        let expected_m = (1.0 - 0.9) * 0.4;
        assert!((state.first_moment()[0] - expected_m as f32).abs() < 1e-7);
    }

    #[test]
    fn trajectory_is_deterministic() {
        let grads = [[0.1f32, -0.2], [0.05, 0.3], [-0.4, 0.1]];

        let run = || {
            let mut opt = Lamb::new(&config(0.01)).unwrap();
            let mut params = vec![Parameter::from_f32("w", vec![0.5, -0.5])];
            for g in &grads {
                params[0].accumulate_grad(g).unwrap();
                opt.step(&mut params).unwrap();
                params[0].clear_grad();
            }
            params[0].values_f32()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn skips_parameters_without_gradients() {
        let mut opt = Lamb::new(&config(0.01)).unwrap();
        let mut params = vec![Parameter::from_f32("w", vec![1.0, 2.0])];

        opt.step(&mut params).unwrap();

        assert_eq!(params[0].values_f32(), vec![1.0, 2.0]);
        // Accumulation-only rounds never create state.
        assert!(opt.state("w").is_none());
    }

    #[test]
    fn rejects_sparse_gradients() {
        let mut opt = Lamb::new(&config(0.01)).unwrap();
        let mut param = Parameter::from_f32("emb", vec![0.0; 4]);
        param.set_grad(Gradient::Sparse {
            indices: vec![1],
            values: vec![0.5],
        });
        let mut params = vec![param];

        assert!(matches!(
            opt.step(&mut params).unwrap_err(),
            TrainErr::UnsupportedGradientLayout { .. }
        ));
    }

    #[test]
    fn reduced_precision_parameter_tracks_shadow() {
        let mut opt = Lamb::new(&config(0.01)).unwrap();
        let mut param = Parameter::bf16_from_f32("w", &[1.0, -1.0]);
        param.accumulate_grad(&[0.2, 0.2]).unwrap();
        let mut params = vec![param];

        opt.step(&mut params).unwrap();

        let shadow = opt.state("w").unwrap().shadow_fp32().unwrap().to_vec();
        for (stored, master) in params[0].values_f32().iter().zip(&shadow) {
            let tolerance = master.abs() * (1.0 / 256.0);
            assert!(
                (stored - master).abs() <= tolerance,
                "stored {stored} drifted from shadow {master}"
            );
        }
    }

    #[test]
    fn step_count_advances_per_touching_step() {
        let mut opt = Lamb::new(&config(0.0)).unwrap();
        let mut params = vec![Parameter::from_f32("w", vec![1.0])];

        params[0].accumulate_grad(&[0.1]).unwrap();
        opt.step(&mut params).unwrap();
        params[0].clear_grad();

        // No gradient this round, the step must not touch the counter.
        opt.step(&mut params).unwrap();

        params[0].accumulate_grad(&[0.1]).unwrap();
        opt.step(&mut params).unwrap();

        assert_eq!(opt.state("w").unwrap().step_count(), 2);
    }
}
