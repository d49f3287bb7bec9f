use half::bf16;

use crate::error::{Result, TrainErr};

/// Gradient produced by a backward pass for one parameter.
#[derive(Debug, Clone)]
pub enum Gradient {
    Dense(Vec<f32>),
    Sparse {
        indices: Vec<usize>,
        values: Vec<f32>,
    },
}

/// Parameter storage. Reduced-precision parameters keep their values as
/// `bf16` and are updated through an fp32 shadow copy in the optimizer state.
#[derive(Debug, Clone)]
pub enum ParamValues {
    F32(Vec<f32>),
    Bf16(Vec<bf16>),
}

/// One trainable parameter plus its currently accumulated gradient.
#[derive(Debug)]
pub struct Parameter {
    name: String,
    values: ParamValues,
    grad: Option<Gradient>,
}

impl Parameter {
    /// Creates a full-precision parameter.
    pub fn from_f32(name: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            values: ParamValues::F32(values),
            grad: None,
        }
    }

    /// Creates a reduced-precision parameter, down-casting the given values.
    pub fn bf16_from_f32(name: impl Into<String>, values: &[f32]) -> Self {
        Self {
            name: name.into(),
            values: ParamValues::Bf16(values.iter().copied().map(bf16::from_f32).collect()),
            grad: None,
        }
    }

    /// Returns the parameter's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of scalars.
    pub fn len(&self) -> usize {
        match &self.values {
            ParamValues::F32(v) => v.len(),
            ParamValues::Bf16(v) => v.len(),
        }
    }

    /// Returns whether the parameter holds no scalars.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether the parameter is stored in reduced precision.
    pub fn is_reduced_precision(&self) -> bool {
        matches!(self.values, ParamValues::Bf16(_))
    }

    /// Returns the parameter's values promoted to f32.
    pub fn values_f32(&self) -> Vec<f32> {
        match &self.values {
            ParamValues::F32(v) => v.clone(),
            ParamValues::Bf16(v) => v.iter().map(|x| x.to_f32()).collect(),
        }
    }

    /// Overwrites the parameter from full-precision values, down-casting when
    /// the storage is reduced precision.
    ///
    /// # Returns
    /// An error when the lengths disagree.
    pub fn set_from_f32(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.len() {
            return Err(TrainErr::GradientSizeMismatch {
                param: self.name.clone(),
                got: values.len(),
                expected: self.len(),
            });
        }

        match &mut self.values {
            ParamValues::F32(v) => v.copy_from_slice(values),
            ParamValues::Bf16(v) => {
                for (dst, &src) in v.iter_mut().zip(values) {
                    *dst = bf16::from_f32(src);
                }
            }
        }
        Ok(())
    }

    /// Returns the accumulated gradient, if any.
    pub fn grad(&self) -> Option<&Gradient> {
        self.grad.as_ref()
    }

    /// Returns the accumulated gradient as a mutable dense slice, if present
    /// and dense.
    pub fn dense_grad_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.grad {
            Some(Gradient::Dense(g)) => Some(g),
            _ => None,
        }
    }

    /// Replaces the gradient wholesale. Used by sparse-producing collaborators
    /// and tests; dense accumulation goes through `accumulate_grad`.
    pub fn set_grad(&mut self, grad: Gradient) {
        self.grad = Some(grad);
    }

    /// Sums a dense gradient contribution into the accumulation buffer,
    /// creating it on first contribution of a window.
    ///
    /// # Arguments
    /// * `grad` - One micro-batch's gradient for this parameter.
    ///
    /// # Returns
    /// An error when the length disagrees with the parameter, or when a
    /// sparse gradient is already pending.
    pub fn accumulate_grad(&mut self, grad: &[f32]) -> Result<()> {
        if grad.len() != self.len() {
            return Err(TrainErr::GradientSizeMismatch {
                param: self.name.clone(),
                got: grad.len(),
                expected: self.len(),
            });
        }

        match &mut self.grad {
            None => self.grad = Some(Gradient::Dense(grad.to_vec())),
            Some(Gradient::Dense(acc)) => {
                for (a, g) in acc.iter_mut().zip(grad) {
                    *a += g;
                }
            }
            Some(Gradient::Sparse { .. }) => {
                return Err(TrainErr::UnsupportedGradientLayout {
                    param: self.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Drops the accumulated gradient. Called after every optimizer step so
    /// the next accumulation window starts from zero.
    pub fn clear_grad(&mut self) {
        self.grad = None;
    }
}

/// Per-parameter optimizer state, created lazily on the first step that
/// touches the parameter.
#[derive(Debug)]
pub struct ParamState {
    pub(crate) first_moment: Vec<f32>,
    pub(crate) second_moment: Vec<f32>,
    pub(crate) step_count: u64,
    /// Full-precision mirror, present iff the parameter is reduced precision.
    /// This is the value actually updated; the parameter itself becomes a
    /// down-cast view after each step.
    pub(crate) shadow_fp32: Option<Vec<f32>>,
    pub(crate) last_weight_norm: Option<f64>,
    pub(crate) last_update_norm: Option<f64>,
    pub(crate) last_trust_ratio: Option<f64>,
}

impl ParamState {
    /// Initializes zeroed state for `param`, populating the shadow copy when
    /// the parameter is reduced precision.
    pub fn init(param: &Parameter) -> Self {
        Self {
            first_moment: vec![0.0; param.len()],
            second_moment: vec![0.0; param.len()],
            step_count: 0,
            shadow_fp32: param.is_reduced_precision().then(|| param.values_f32()),
            last_weight_norm: None,
            last_update_norm: None,
            last_trust_ratio: None,
        }
    }

    /// Returns how many optimizer steps have touched this parameter.
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Returns the first moment estimate.
    pub fn first_moment(&self) -> &[f32] {
        &self.first_moment
    }

    /// Returns the second moment estimate.
    pub fn second_moment(&self) -> &[f32] {
        &self.second_moment
    }

    /// Returns the full-precision shadow copy, if the parameter is reduced
    /// precision.
    pub fn shadow_fp32(&self) -> Option<&[f32]> {
        self.shadow_fp32.as_deref()
    }

    /// Returns the trust ratio applied by the most recent step, recorded only
    /// when weight decay is active.
    pub fn last_trust_ratio(&self) -> Option<f64> {
        self.last_trust_ratio
    }

    /// Returns the parameter norm measured by the most recent step.
    pub fn last_weight_norm(&self) -> Option<f64> {
        self.last_weight_norm
    }

    /// Returns the raw update norm measured by the most recent step.
    pub fn last_update_norm(&self) -> Option<f64> {
        self.last_update_norm
    }
}
